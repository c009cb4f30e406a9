//! Runtime CPU capability detection.

use std::sync::OnceLock;

/// Features of the host CPU that kernels may dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub avx2: bool,
    pub avx512f: bool,
    pub fma: bool,
    pub neon: bool,
    /// Hardware threads available to this process.
    pub num_cpus: usize,
}

static DETECTED: OnceLock<CpuInfo> = OnceLock::new();

impl CpuInfo {
    /// Detect the capabilities of the current CPU (cached after the first call).
    pub fn detect() -> &'static CpuInfo {
        DETECTED.get_or_init(|| {
            let num_cpus = std::thread::available_parallelism().map_or(1, |n| n.get());

            #[cfg(target_arch = "x86_64")]
            {
                CpuInfo {
                    avx2: is_x86_feature_detected!("avx2"),
                    avx512f: is_x86_feature_detected!("avx512f"),
                    fma: is_x86_feature_detected!("fma"),
                    neon: false,
                    num_cpus,
                }
            }

            #[cfg(target_arch = "aarch64")]
            {
                CpuInfo {
                    avx2: false,
                    avx512f: false,
                    fma: false,
                    neon: true,
                    num_cpus,
                }
            }

            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                CpuInfo {
                    avx2: false,
                    avx512f: false,
                    fma: false,
                    neon: false,
                    num_cpus,
                }
            }
        })
    }

    /// Best available SIMD tier as a human-readable string.
    pub fn best_tier(&self) -> &'static str {
        if self.avx512f {
            "AVX-512"
        } else if self.avx2 {
            "AVX2"
        } else if self.neon {
            "NEON"
        } else {
            "scalar"
        }
    }

    /// AVX2 with FMA, the tier the GEMM micro-kernel uses.
    pub fn has_avx2_fma(&self) -> bool {
        self.avx2 && self.fma
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        let info = CpuInfo::detect();
        assert!(info.num_cpus >= 1);
        assert!(!info.best_tier().is_empty());
        // Cached: same instance on every call.
        assert!(std::ptr::eq(info, CpuInfo::detect()));
    }
}
