//! # kiln-memory
//!
//! Tensor storage for kiln sessions.
//!
//! Provides:
//! - `Blob`: zeroed backing blocks shared across worker threads
//! - Lifetime intervals and greedy interval coloring
//! - `MemoryManager`: per-target pool that lets temporaries with disjoint
//!   lifetimes share storage (blob or offset affinity, in-place resize)
//! - `MemoryGroup`: a Function's named scope for scratch requests
//! - `TensorArena` / `TensorHandle`: handle-addressed tensor slots
//! - `TensorView`: strided f32 access with sub-tensor support

pub mod blob;
pub mod lifetime;
pub mod manager;
pub mod group;
pub mod arena;
pub mod view;

pub use blob::{align_up, Blob, BLOB_ALIGN};
pub use lifetime::{color_intervals, max_overlap, Coloring, Interval};
pub use manager::{AllocationId, MemoryAffinity, MemoryManager, Region};
pub use group::MemoryGroup;
pub use arena::{Backing, TensorArena, TensorHandle};
pub use view::TensorView;

pub use kiln_core::{KilnError, Result};
