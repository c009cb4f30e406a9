//! The function contract: one logical operator built from kernels.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::error;

use kiln_core::{KilnError, Result, TensorDescriptor, Window};
use kiln_memory::{MemoryGroup, TensorArena, TensorHandle, TensorView};

use crate::kernel::{Kernel, TensorPack, TensorSlot};
use crate::scheduler::{Hints, Scheduler};

/// Lifecycle of a function instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionState {
    Unconfigured,
    Configured,
    /// `prepare` has run; weights-derived state is in place.
    Prepared,
}

/// Tensor access for one task execution.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub arena: &'a TensorArena,
    /// Index of the executing task.
    pub step: usize,
}

impl<'a> RunContext<'a> {
    pub fn new(arena: &'a TensorArena, step: usize) -> Self {
        Self { arena, step }
    }

    /// Resolve a tensor, refusing pooled tensors outside their lifetime.
    pub fn view(&self, h: TensorHandle) -> Result<TensorView> {
        self.arena.view_at(h, self.step)
    }
}

/// An executable operator: validated and configured from descriptors,
/// then run once per inference.
pub trait Function: Send {
    fn name(&self) -> &str;

    fn state(&self) -> FunctionState;

    /// Derive kernels, windows and scratch requests from the current
    /// descriptors of the bound tensors. Calling it again after a shape
    /// change is how dynamic tensors are supported.
    fn configure(&mut self, arena: &mut TensorArena, group: &MemoryGroup) -> Result<()>;

    /// One-time work before the first run.
    fn prepare(&mut self, ctx: &RunContext<'_>) -> Result<()>;

    fn run(&mut self, ctx: &RunContext<'_>) -> Result<()>;

    /// Windows of the configured kernels, in execution order.
    fn windows(&self) -> Vec<Window>;
}

/// A kernel plus the tensors bound to its slots.
pub struct Stage {
    pub kernel: Arc<dyn Kernel>,
    pub tensors: SmallVec<[(TensorSlot, TensorHandle); 4]>,
    pub hints: Hints,
}

impl Stage {
    pub fn new(kernel: impl Kernel + 'static) -> Self {
        Self {
            kernel: Arc::new(kernel),
            tensors: SmallVec::new(),
            hints: Hints::default(),
        }
    }

    pub fn bind(mut self, slot: TensorSlot, h: TensorHandle) -> Self {
        self.tensors.push((slot, h));
        self
    }

    /// Tensor bound to `slot`, if any.
    pub fn slot(&self, slot: TensorSlot) -> Option<TensorHandle> {
        self.tensors.iter().find(|(s, _)| *s == slot).map(|&(_, h)| h)
    }

    pub fn with_hints(mut self, hints: Hints) -> Self {
        self.hints = hints;
        self
    }

    pub fn pack(&self, ctx: &RunContext<'_>) -> Result<TensorPack> {
        let mut pack = TensorPack::new();
        for &(slot, h) in &self.tensors {
            pack.insert(slot, ctx.view(h)?);
        }
        Ok(pack)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("kernel", &self.kernel.name())
            .field("window", self.kernel.window())
            .field("tensors", &self.tensors)
            .finish()
    }
}

/// Shared state machine and stage runner embedded in every function.
pub struct FunctionCore {
    name: &'static str,
    scheduler: Arc<dyn Scheduler>,
    state: FunctionState,
    stages: Vec<Stage>,
    prepare_stages: Vec<Stage>,
}

impl FunctionCore {
    pub fn new(name: &'static str, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            name,
            scheduler,
            state: FunctionState::Unconfigured,
            stages: Vec::new(),
            prepare_stages: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> FunctionState {
        self.state
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Install freshly configured stages. Any prepared state is discarded.
    ///
    /// A kernel that declares a border must read `Src(0)` from a tensor an
    /// earlier stage writes, so the halo is filled before it runs.
    pub fn set_stages(&mut self, stages: Vec<Stage>) -> Result<()> {
        for (i, stage) in stages.iter().enumerate() {
            if stage.kernel.border_size().is_empty() {
                continue;
            }
            let filled = stage
                .slot(TensorSlot::Src(0))
                .is_some_and(|src| stages[..i].iter().any(|prev| prev.slot(TensorSlot::Dst(0)) == Some(src)));
            if !filled {
                error!(function = self.name, kernel = stage.kernel.name(), "bordered input is never filled");
                return Err(KilnError::usage(format!(
                    "{}: {} reads a border no earlier stage fills",
                    self.name,
                    stage.kernel.name()
                )));
            }
        }
        self.stages = stages;
        self.state = FunctionState::Configured;
        Ok(())
    }

    /// Stages run once by [`FunctionCore::prepare`], before the first run.
    pub fn set_prepare_stages(&mut self, stages: Vec<Stage>) {
        self.prepare_stages = stages;
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn windows(&self) -> Vec<Window> {
        self.stages.iter().map(|s| *s.kernel.window()).collect()
    }

    /// Usage error unless configured.
    pub fn ensure_configured(&self) -> Result<()> {
        if self.state == FunctionState::Unconfigured {
            error!(function = self.name, "run before configure");
            return Err(KilnError::usage(format!("{} run before configure", self.name)));
        }
        Ok(())
    }

    fn schedule_all(&self, stages: &[Stage], ctx: &RunContext<'_>) -> Result<()> {
        for stage in stages {
            let pack = stage.pack(ctx)?;
            self.scheduler.schedule(&stage.kernel, &stage.hints, &pack)?;
        }
        Ok(())
    }

    /// Run the prepare stages and move to `Prepared`.
    pub fn prepare(&mut self, ctx: &RunContext<'_>) -> Result<()> {
        self.ensure_configured()?;
        self.schedule_all(&self.prepare_stages, ctx)?;
        self.state = FunctionState::Prepared;
        Ok(())
    }

    /// Schedule every stage in order, preparing first if needed.
    pub fn run(&mut self, ctx: &RunContext<'_>) -> Result<()> {
        self.ensure_configured()?;
        if self.state == FunctionState::Configured {
            self.prepare(ctx)?;
        }
        self.schedule_all(&self.stages, ctx)
    }
}

impl fmt::Debug for FunctionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCore")
            .field("name", &self.name)
            .field("target", &self.scheduler.target())
            .field("state", &self.state)
            .field("stages", &self.stages)
            .field("prepare_stages", &self.prepare_stages)
            .finish()
    }
}

/// Create (or re-size) a pooled scratch tensor owned by `group`.
///
/// Passing the handle from a previous configure reuses its slot and its
/// allocation key, so re-configuring with unchanged shapes changes nothing.
pub fn scratch_tensor(
    arena: &mut TensorArena,
    group: &MemoryGroup,
    existing: Option<TensorHandle>,
    key: &str,
    desc: TensorDescriptor,
) -> Result<TensorHandle> {
    let desc = desc.with_target(group.target());
    let alloc = group.manage(key, desc.total_bytes())?;
    match existing {
        Some(h) => {
            arena.set_desc(h, desc)?;
            Ok(h)
        }
        None => {
            let h = arena.add(format!("{}/{}", group.name(), key), desc);
            arena.bind_managed(h, Arc::clone(group.manager()), alloc)?;
            Ok(h)
        }
    }
}

/// Create (or re-size) a tensor with dedicated storage, for state that must
/// persist across runs (transformed weights).
pub fn persistent_tensor(
    arena: &mut TensorArena,
    name: &str,
    existing: Option<TensorHandle>,
    desc: TensorDescriptor,
) -> Result<TensorHandle> {
    match existing {
        Some(h) => {
            arena.set_desc(h, desc)?;
            Ok(h)
        }
        None => {
            let h = arena.add(name, desc);
            arena.bind_owned(h)?;
            Ok(h)
        }
    }
}
