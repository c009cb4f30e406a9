//! # kiln-runtime
//!
//! Execution contracts and backends.
//!
//! Provides:
//! - `Kernel`: a configured unit of work over a `Window`
//! - `Function`: an operator composed of kernel stages and scratch memory
//! - `Scheduler`: per-target execution, with a rayon-backed `CpuScheduler`
//!   and a queue-backed `GpuScheduler` with optional local-size tuning

pub mod cpu_info;
pub mod kernel;
pub mod scheduler;
pub mod cpu;
pub mod gpu;
pub mod function;

pub use cpu_info::CpuInfo;
pub use kernel::{ExecutionContext, Kernel, TensorPack, TensorSlot, ThreadInfo};
pub use scheduler::{Hints, Scheduler, SchedulingStrategy};
pub use cpu::CpuScheduler;
pub use gpu::{CommandQueue, GpuScheduler, Tuner, WorkSize};
pub use function::{persistent_tensor, scratch_tensor, Function, FunctionCore, FunctionState, RunContext, Stage};

pub use kiln_core::{KilnError, Result};
