//! The scheduler contract.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use kiln_core::{Result, Target};

use crate::kernel::{Kernel, TensorPack};

/// How the CPU scheduler hands sub-windows to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// One sub-window per worker.
    #[default]
    Static,
    /// Up to three sub-windows per worker, pulled from a shared feeder.
    Dynamic,
}

/// Per-call scheduling overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hints {
    pub split_dimension: Option<usize>,
    pub strategy: Option<SchedulingStrategy>,
}

impl Hints {
    pub fn split(dimension: usize) -> Self {
        Self {
            split_dimension: Some(dimension),
            strategy: None,
        }
    }
}

/// Executes kernels on one target.
///
/// Schedulers are explicit objects shared by `Arc`; a session may hold any
/// number of them.
pub trait Scheduler: Send + Sync {
    fn target(&self) -> Target;

    /// Workers available for splitting one kernel.
    fn num_threads(&self) -> usize;

    /// Run (CPU) or enqueue (GPU) `kernel` over its whole window.
    fn schedule(&self, kernel: &Arc<dyn Kernel>, hints: &Hints, pack: &TensorPack) -> Result<()>;

    /// Block until all scheduled work has completed, reporting the first failure.
    fn sync(&self) -> Result<()>;
}
