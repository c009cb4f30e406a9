use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution backend a node, tensor or memory manager is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Target {
    /// CPU thread pool with SIMD kernels
    #[default]
    Cpu,
    /// GPU behind an in-order command queue
    Gpu,
}

impl Target {
    /// Whether this is the CPU backend.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Target::Cpu)
    }

    /// Whether this is the GPU backend.
    pub fn is_gpu(&self) -> bool {
        matches!(self, Target::Gpu)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Cpu => write!(f, "cpu"),
            Target::Gpu => write!(f, "gpu"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_properties() {
        assert!(Target::Cpu.is_cpu());
        assert!(!Target::Cpu.is_gpu());
        assert!(Target::Gpu.is_gpu());
        assert_eq!(Target::default(), Target::Cpu);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Target::Cpu), "cpu");
        assert_eq!(format!("{}", Target::Gpu), "gpu");
    }
}
