//! # kiln-graph
//!
//! Graph front end and executor of the kiln compute engine.
//!
//! Provides:
//! - `Graph` / `Node`: an id-addressed DAG of typed operator nodes
//! - `builder`: `add_<kind>_node` construction functions
//! - Per-kind shape propagation and function instantiation
//! - `GraphContext` / `GraphConfig`: per-target memory managers, schedulers
//!   and session settings
//! - `GraphSession`: finalization into an ordered task list and execution
//! - Accessors for feeding and draining tensors, execution hooks, DOT export
//!
//! ```no_run
//! use kiln_core::{DataType, PadStrideInfo, PoolingInfo, PoolingType, Size2D, TensorDescriptor};
//! use kiln_graph::builder::*;
//! use kiln_graph::{Graph, GraphConfig, GraphSession, NodeParams, RandomAccessor};
//!
//! let mut g = Graph::new("lenet");
//! let x = add_input_node(
//!     &mut g,
//!     NodeParams::new("data"),
//!     TensorDescriptor::new([1, 28, 28, 1], DataType::F32),
//!     Some(Box::new(RandomAccessor::new(0, 0.0, 1.0))),
//! )?;
//! let conv = add_convolution_node(
//!     &mut g,
//!     NodeParams::new("conv1"),
//!     x.into(),
//!     Size2D::new(5, 5),
//!     20,
//!     PadStrideInfo::new(1, 1, 0, 0),
//!     Default::default(),
//!     Some(Box::new(RandomAccessor::new(1, -0.1, 0.1))),
//!     None,
//! )?;
//! let pool = add_pooling_node(
//!     &mut g,
//!     NodeParams::new("pool1"),
//!     conv.into(),
//!     PoolingInfo::new(PoolingType::Max, 2, PadStrideInfo::new(2, 2, 0, 0)),
//! )?;
//! add_output_node(&mut g, NodeParams::new("out"), pool.into(), None)?;
//!
//! let mut session = GraphSession::with_config(g, GraphConfig::default())?;
//! session.run()?;
//! # Ok::<(), kiln_core::KilnError>(())
//! ```

pub mod node;
pub mod accessor;
pub mod graph;
mod ops;
pub mod builder;
pub mod config;
pub mod context;
pub mod mutators;
pub mod hooks;
pub mod session;
pub mod dot;

pub use node::{Node, NodeId, NodeKind, NodeOutput, NodeParams, NodeType};
pub use accessor::{Accessor, CaptureAccessor, ConstantAccessor, RandomAccessor, VecAccessor};
pub use graph::Graph;
pub use config::{GraphConfig, MethodHintPolicy};
pub use context::{GraphContext, MemoryManagerContext};
pub use mutators::{ConcatSubTensorMutator, SubTensorConcat};
pub use hooks::{ExecutionHook, NodeTiming, ProfilingHook, TaskInfo};
pub use session::{ExecutionTask, GraphSession};
pub use dot::to_dot;

pub use kiln_core::{KilnError, Result};
