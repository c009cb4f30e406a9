//! Graph configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kiln_core::{Result, Target};
use kiln_memory::MemoryAffinity;
use kiln_runtime::SchedulingStrategy;

/// What happens when an explicit convolution method hint cannot run the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodHintPolicy {
    /// Warn and use the heuristic choice.
    #[default]
    Fallback,
    /// Fail finalization at the node.
    Strict,
}

/// Session-wide settings, fixed once the context is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// CPU workers; 0 means one per hardware thread.
    #[serde(default)]
    pub num_threads: usize,
    /// Benchmark GPU local work sizes on first use of each kernel signature.
    #[serde(default)]
    pub use_tuner: bool,
    /// Tuning cache, loaded at finalize and saved when the session drops.
    #[serde(default)]
    pub tuner_file: Option<PathBuf>,
    /// Target of nodes without an explicit one.
    #[serde(default)]
    pub default_target: Target,
    #[serde(default)]
    pub method_hint_policy: MethodHintPolicy,
    #[serde(default)]
    pub memory_affinity: MemoryAffinity,
    #[serde(default)]
    pub scheduling_strategy: SchedulingStrategy,
    /// Replace eligible concatenations with sub-tensor views.
    #[serde(default)]
    pub use_subtensors: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            use_tuner: false,
            tuner_file: None,
            default_target: Target::Cpu,
            method_hint_policy: MethodHintPolicy::Fallback,
            memory_affinity: MemoryAffinity::Blob,
            scheduling_strategy: SchedulingStrategy::Static,
            use_subtensors: false,
        }
    }
}

impl GraphConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.default_target = target;
        self
    }

    pub fn with_tuner(mut self, tuner_file: Option<PathBuf>) -> Self {
        self.use_tuner = true;
        self.tuner_file = tuner_file;
        self
    }

    pub fn with_method_hint_policy(mut self, policy: MethodHintPolicy) -> Self {
        self.method_hint_policy = policy;
        self
    }

    pub fn with_memory_affinity(mut self, affinity: MemoryAffinity) -> Self {
        self.memory_affinity = affinity;
        self
    }

    pub fn with_scheduling_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.scheduling_strategy = strategy;
        self
    }

    pub fn with_subtensors(mut self, enabled: bool) -> Self {
        self.use_subtensors = enabled;
        self
    }
}
