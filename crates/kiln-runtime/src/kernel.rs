//! The kernel contract.
//!
//! A kernel is configured once from tensor descriptors (computing its window),
//! then run any number of times over sub-windows chosen by a scheduler. It
//! never owns tensors: every run receives a [`TensorPack`] of resolved views.

use std::fmt::Write as _;

use smallvec::SmallVec;

use kiln_core::{BorderSize, KilnError, Result, Window};
use kiln_memory::TensorView;

use crate::cpu_info::CpuInfo;

/// Role of a tensor in a kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorSlot {
    Src(u8),
    Dst(u8),
    /// Auxiliary tensors: weights, biases, scratch.
    Aux(u8),
}

/// Views bound to the slots of one kernel invocation.
#[derive(Debug, Clone, Default)]
pub struct TensorPack {
    entries: SmallVec<[(TensorSlot, TensorView); 4]>,
}

impl TensorPack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `view` to `slot`, replacing any previous binding.
    pub fn insert(&mut self, slot: TensorSlot, view: TensorView) {
        match self.entries.iter_mut().find(|(s, _)| *s == slot) {
            Some(entry) => entry.1 = view,
            None => self.entries.push((slot, view)),
        }
    }

    pub fn with(mut self, slot: TensorSlot, view: TensorView) -> Self {
        self.insert(slot, view);
        self
    }

    pub fn get(&self, slot: TensorSlot) -> Result<&TensorView> {
        self.entries
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, v)| v)
            .ok_or_else(|| KilnError::usage(format!("no tensor bound to {slot:?}")))
    }

    pub fn src(&self, i: u8) -> Result<&TensorView> {
        self.get(TensorSlot::Src(i))
    }

    pub fn dst(&self, i: u8) -> Result<&TensorView> {
        self.get(TensorSlot::Dst(i))
    }

    pub fn aux(&self, i: u8) -> Result<&TensorView> {
        self.get(TensorSlot::Aux(i))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identity of the worker executing a sub-window.
#[derive(Debug, Clone, Copy)]
pub struct ThreadInfo {
    pub thread_id: usize,
    pub num_threads: usize,
    pub cpu_info: &'static CpuInfo,
}

impl ThreadInfo {
    /// The calling thread running a whole window alone.
    pub fn single() -> Self {
        Self {
            thread_id: 0,
            num_threads: 1,
            cpu_info: CpuInfo::detect(),
        }
    }
}

/// Everything a kernel sees while running one sub-window.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub pack: &'a TensorPack,
    pub thread: ThreadInfo,
}

/// The smallest schedulable unit of work.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &str;

    /// Full iteration domain computed at configure time.
    fn window(&self) -> &Window;

    /// Kernels that must see the whole window at once return `false`.
    fn is_parallelisable(&self) -> bool {
        true
    }

    /// Elements read outside the window; materialized by a border pass.
    fn border_size(&self) -> BorderSize {
        BorderSize::default()
    }

    /// Window dimension the CPU scheduler splits along.
    fn split_dimension(&self) -> usize {
        self.window().largest_dimension()
    }

    /// Kernel part of the tuning signature: name plus window extents.
    /// The tuner appends the source shape.
    fn config_id(&self) -> String {
        let mut id = self.name().to_string();
        for d in self.window().dims() {
            let _ = write!(id, "_{}", d.end - d.start);
        }
        id
    }

    /// Execute `window`, a sub-window of [`Kernel::window`].
    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()>;
}
