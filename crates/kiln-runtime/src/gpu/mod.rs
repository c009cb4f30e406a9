//! GPU backend: an asynchronous in-order queue with optional tuning.

pub mod queue;
pub mod tuner;

use std::sync::Arc;

use tracing::trace;

use kiln_core::{Result, Target};

use crate::kernel::{Kernel, TensorPack};
use crate::scheduler::{Hints, Scheduler};

pub use queue::{global_work_size, work_groups, CommandQueue, WorkSize};
pub use tuner::{candidates, default_lws, signature, Tuner};

/// Enqueues kernels on a [`CommandQueue`], picking local work sizes from a
/// [`Tuner`] when one is attached.
#[derive(Debug)]
pub struct GpuScheduler {
    queue: CommandQueue,
    tuner: Option<Arc<Tuner>>,
}

impl GpuScheduler {
    pub fn new() -> Result<Self> {
        Ok(Self {
            queue: CommandQueue::new()?,
            tuner: None,
        })
    }

    pub fn with_tuner(mut self, tuner: Arc<Tuner>) -> Self {
        self.tuner = Some(tuner);
        self
    }

    pub fn tuner(&self) -> Option<&Arc<Tuner>> {
        self.tuner.as_ref()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }
}

impl Scheduler for GpuScheduler {
    fn target(&self) -> Target {
        Target::Gpu
    }

    fn num_threads(&self) -> usize {
        1
    }

    fn schedule(&self, kernel: &Arc<dyn Kernel>, _hints: &Hints, pack: &TensorPack) -> Result<()> {
        kernel.window().validate()?;
        let lws = match &self.tuner {
            Some(tuner) => tuner.tune(&self.queue, kernel, pack)?,
            None => default_lws(global_work_size(kernel.window())),
        };
        trace!(kernel = kernel.name(), ?lws, "gpu launch");
        self.queue.enqueue(Arc::clone(kernel), pack.clone(), lws)
    }

    fn sync(&self) -> Result<()> {
        self.queue.sync()
    }
}
