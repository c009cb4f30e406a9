//! Per-target memory managers, schedulers and configuration of a session.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info};

use kiln_core::{KilnError, Result, Target};
use kiln_memory::MemoryManager;
use kiln_runtime::{CpuScheduler, GpuScheduler, Scheduler, Tuner};

use crate::config::GraphConfig;

/// A target paired with the memory manager serving it.
#[derive(Debug, Clone)]
pub struct MemoryManagerContext {
    pub target: Target,
    pub manager: Arc<MemoryManager>,
}

impl MemoryManagerContext {
    pub fn new(target: Target, manager: Arc<MemoryManager>) -> Self {
        Self { target, manager }
    }
}

/// Owns at most one memory manager and one scheduler per target.
///
/// Everything is mutable until [`GraphContext::finalize`]; afterwards every
/// mutator is rejected with a usage error (or `false`).
pub struct GraphContext {
    config: GraphConfig,
    memory: BTreeMap<Target, MemoryManagerContext>,
    schedulers: BTreeMap<Target, Arc<dyn Scheduler>>,
    tuner: Option<Arc<Tuner>>,
    finalized: bool,
}

impl std::fmt::Debug for GraphContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphContext")
            .field("config", &self.config)
            .field("memory", &self.memory.keys().collect::<Vec<_>>())
            .field("schedulers", &self.schedulers.keys().collect::<Vec<_>>())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl GraphContext {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            memory: BTreeMap::new(),
            schedulers: BTreeMap::new(),
            tuner: None,
            finalized: false,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    fn ensure_mutable(&self, what: &str) -> Result<()> {
        if self.finalized {
            error!(operation = what, "graph context mutated after finalize");
            return Err(KilnError::usage(format!("{what} after the graph context was finalized")));
        }
        Ok(())
    }

    pub fn set_config(&mut self, config: GraphConfig) -> Result<()> {
        self.ensure_mutable("set_config")?;
        self.config = config;
        Ok(())
    }

    /// Register the memory manager of a target. Returns `false` if the target
    /// already has one or the context is finalized.
    pub fn insert_memory_management_ctx(&mut self, ctx: MemoryManagerContext) -> bool {
        if self.finalized || self.memory.contains_key(&ctx.target) {
            return false;
        }
        self.memory.insert(ctx.target, ctx);
        true
    }

    pub fn memory_management_ctx(&self, target: Target) -> Option<&MemoryManagerContext> {
        self.memory.get(&target)
    }

    /// Register an explicitly built scheduler. Same rules as memory contexts.
    pub fn insert_scheduler(&mut self, scheduler: Arc<dyn Scheduler>) -> bool {
        let target = scheduler.target();
        if self.finalized || self.schedulers.contains_key(&target) {
            return false;
        }
        self.schedulers.insert(target, scheduler);
        true
    }

    pub fn scheduler(&self, target: Target) -> Result<Arc<dyn Scheduler>> {
        self.schedulers
            .get(&target)
            .cloned()
            .ok_or_else(|| KilnError::usage(format!("no scheduler for target {target}")))
    }

    pub fn tuner(&self) -> Option<&Arc<Tuner>> {
        self.tuner.as_ref()
    }

    pub fn targets(&self) -> impl Iterator<Item = Target> + '_ {
        self.memory.keys().copied()
    }

    /// Create the default memory manager and scheduler of `target` if missing.
    pub fn ensure_backend(&mut self, target: Target) -> Result<()> {
        if self.memory.contains_key(&target) && self.schedulers.contains_key(&target) {
            return Ok(());
        }
        self.ensure_mutable("ensure_backend")?;
        if !self.memory.contains_key(&target) {
            let manager = Arc::new(MemoryManager::new(target, self.config.memory_affinity));
            self.memory.insert(target, MemoryManagerContext::new(target, manager));
        }
        if !self.schedulers.contains_key(&target) {
            let scheduler: Arc<dyn Scheduler> = match target {
                Target::Cpu => Arc::new(
                    CpuScheduler::new(self.config.num_threads)?.with_strategy(self.config.scheduling_strategy),
                ),
                Target::Gpu => {
                    let gpu = GpuScheduler::new()?;
                    match self.gpu_tuner()? {
                        Some(tuner) => Arc::new(gpu.with_tuner(tuner)),
                        None => Arc::new(gpu),
                    }
                }
            };
            self.schedulers.insert(target, scheduler);
        }
        Ok(())
    }

    fn gpu_tuner(&mut self) -> Result<Option<Arc<Tuner>>> {
        if !self.config.use_tuner {
            return Ok(None);
        }
        if self.tuner.is_none() {
            let tuner = match &self.config.tuner_file {
                Some(path) => Tuner::load_or_default(path)?,
                None => Tuner::new(),
            };
            self.tuner = Some(Arc::new(tuner));
        }
        Ok(self.tuner.clone())
    }

    /// Plan and allocate every memory manager. Exactly once.
    pub fn finalize(&mut self) -> Result<()> {
        self.ensure_mutable("finalize")?;
        for ctx in self.memory.values() {
            ctx.manager.finalize()?;
            info!(
                target_backend = %ctx.target,
                blocks = ctx.manager.num_blocks(),
                peak_bytes = ctx.manager.peak_bytes(),
                requested_bytes = ctx.manager.requested_bytes(),
                "memory manager finalized"
            );
        }
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Wait for every scheduler to drain.
    pub fn sync_all(&self) -> Result<()> {
        for scheduler in self.schedulers.values() {
            scheduler.sync()?;
        }
        Ok(())
    }

    /// Write the tuner cache to the configured file, if any.
    pub fn save_tuner(&self) -> Result<()> {
        if let (Some(tuner), Some(path)) = (&self.tuner, &self.config.tuner_file) {
            tuner.save(path)?;
        }
        Ok(())
    }
}
