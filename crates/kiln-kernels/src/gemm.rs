//! Tiled GEMM with an AVX2 inner loop.
//!
//! `dst[M, N] = a[M, K] @ b[K, N] (+ bias[N])`. The window covers the rows of
//! `dst`, so every sub-window owns a disjoint block of output rows.

use std::borrow::Cow;

use kiln_core::{Dimension, KilnError, Result, Window};
use kiln_memory::TensorView;
use kiln_runtime::{ExecutionContext, Kernel};

/// 64×64 tiles fit comfortably in L1 (~32KB of f32).
const TILE_M: usize = 64;
const TILE_N: usize = 64;
const TILE_K: usize = 64;

/// Matrix product kernel over row blocks.
#[derive(Debug, Clone)]
pub struct GemmKernel {
    m: usize,
    k: usize,
    n: usize,
    has_bias: bool,
    window: Window,
}

impl GemmKernel {
    pub fn validate(m: usize, k: usize, n: usize) -> Result<()> {
        if m == 0 || k == 0 || n == 0 {
            return Err(KilnError::shape(format!("degenerate gemm {m}x{k} @ {k}x{n}")));
        }
        Ok(())
    }

    /// Slots: `Src(0)` = a, `Src(1)` = b, `Aux(0)` = bias (if `has_bias`), `Dst(0)`.
    pub fn configure(m: usize, k: usize, n: usize, has_bias: bool) -> Result<Self> {
        Self::validate(m, k, n)?;
        let mut window = Window::new(1);
        window.set(0, Dimension::new(0, m, 1));
        Ok(Self {
            m,
            k,
            n,
            has_bias,
            window,
        })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.m, self.k, self.n)
    }
}

/// Borrow a contiguous view or gather a strided one.
///
/// # Safety
/// Nothing may write to `view` while the result is alive.
unsafe fn read_matrix(view: &TensorView, len: usize) -> Result<Cow<'_, [f32]>> {
    if view.numel() != len {
        return Err(KilnError::shape(format!(
            "gemm operand has {} elements, expected {len}",
            view.numel()
        )));
    }
    if view.is_contiguous() {
        Ok(Cow::Borrowed(view.as_slice()?))
    } else {
        Ok(Cow::Owned(view.to_vec_f32()))
    }
}

impl Kernel for GemmKernel {
    fn name(&self) -> &str {
        "gemm"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn config_id(&self) -> String {
        format!("gemm_{}_{}_{}", self.m, self.k, self.n)
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let rows = window.dim(0);
        let (m0, m1) = (rows.start, rows.end);
        if m1 <= m0 {
            return Ok(());
        }
        let (k, n) = (self.k, self.n);
        let dst = ctx.pack.dst(0)?;
        if dst.numel() != self.m * n {
            return Err(KilnError::shape(format!(
                "gemm output has {} elements, expected {}",
                dst.numel(),
                self.m * n
            )));
        }

        // SAFETY: a, b and bias are inputs of this invocation and are only
        // read; dst never aliases them (distinct live tensors), and each
        // sub-window writes a disjoint row block of dst.
        let a = unsafe { read_matrix(ctx.pack.src(0)?, self.m * k)? };
        let b = unsafe { read_matrix(ctx.pack.src(1)?, k * n)? };
        let a_rows = &a[m0 * k..m1 * k];

        let mut local;
        let c: &mut [f32] = if dst.is_contiguous() {
            unsafe { dst.range_mut(m0 * n, (m1 - m0) * n)? }
        } else {
            local = vec![0.0f32; (m1 - m0) * n];
            &mut local
        };
        c.fill(0.0);

        if ctx.thread.cpu_info.has_avx2_fma() {
            tiled_matmul_avx2(a_rows, &b, c, m1 - m0, n, k);
        } else {
            tiled_matmul_scalar(a_rows, &b, c, m1 - m0, n, k);
        }

        if self.has_bias {
            let bias = ctx.pack.aux(0)?;
            for row in c.chunks_mut(n) {
                for (j, v) in row.iter_mut().enumerate() {
                    *v += bias.load_flat(j);
                }
            }
        }

        if !dst.is_contiguous() {
            for (i, &v) in c.iter().enumerate() {
                dst.store_flat(m0 * n + i, v);
            }
        }
        Ok(())
    }
}

/// Scalar tiled matmul (fallback). Accumulates into `c`.
pub fn tiled_matmul_scalar(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i0 in (0..m).step_by(TILE_M) {
        let i_end = (i0 + TILE_M).min(m);
        for j0 in (0..n).step_by(TILE_N) {
            let j_end = (j0 + TILE_N).min(n);
            for p0 in (0..k).step_by(TILE_K) {
                let p_end = (p0 + TILE_K).min(k);

                for i in i0..i_end {
                    for p in p0..p_end {
                        let a_val = a[i * k + p];
                        for j in j0..j_end {
                            c[i * n + j] += a_val * b[p * n + j];
                        }
                    }
                }
            }
        }
    }
}

/// AVX2-accelerated tiled matmul, 8 floats per inner step.
#[cfg(target_arch = "x86_64")]
pub fn tiled_matmul_avx2(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    if !is_x86_feature_detected!("avx2") || !is_x86_feature_detected!("fma") {
        return tiled_matmul_scalar(a, b, c, m, n, k);
    }
    assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);

    // Safety: AVX2+FMA checked above, slice bounds asserted.
    unsafe { tiled_matmul_avx2_inner(a, b, c, m, n, k) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn tiled_matmul_avx2_inner(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    use std::arch::x86_64::*;

    for i0 in (0..m).step_by(TILE_M) {
        let i_end = (i0 + TILE_M).min(m);
        for j0 in (0..n).step_by(TILE_N) {
            let j_end = (j0 + TILE_N).min(n);
            for p0 in (0..k).step_by(TILE_K) {
                let p_end = (p0 + TILE_K).min(k);

                for i in i0..i_end {
                    for p in p0..p_end {
                        let a_val = _mm256_set1_ps(a[i * k + p]);

                        let mut j = j0;
                        while j + 8 <= j_end {
                            let c_ptr = c.as_mut_ptr().add(i * n + j);
                            let b_ptr = b.as_ptr().add(p * n + j);
                            let acc = _mm256_fmadd_ps(a_val, _mm256_loadu_ps(b_ptr), _mm256_loadu_ps(c_ptr));
                            _mm256_storeu_ps(c_ptr, acc);
                            j += 8;
                        }

                        while j < j_end {
                            c[i * n + j] += a[i * k + p] * b[p * n + j];
                            j += 1;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn tiled_matmul_avx2(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    tiled_matmul_scalar(a, b, c, m, n, k);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_util::{run_kernel, tensor};
    use kiln_runtime::{TensorPack, TensorSlot};

    fn naive(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
            }
        }
        c
    }

    #[test]
    fn test_matmul_basic() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let mut c = vec![0.0; 4];
        tiled_matmul_scalar(&a, &b, &mut c, 2, 2, 3);
        assert_eq!(c, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_avx2_matches_scalar() {
        let (m, k, n) = (70, 65, 37);
        let a: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32 * 0.1).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 11) as f32 * 0.1).collect();
        let mut fast = vec![0.0; m * n];
        tiled_matmul_avx2(&a, &b, &mut fast, m, n, k);
        for (i, (&f, &r)) in fast.iter().zip(naive(&a, &b, m, n, k).iter()).enumerate() {
            assert!((f - r).abs() < 1e-3, "mismatch at {i}: {f} vs {r}");
        }
    }

    #[test]
    fn test_kernel_with_bias_split() {
        let (m, k, n) = (9, 4, 3);
        let a: Vec<f32> = (0..m * k).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i as f32) - 5.0).collect();
        let pack = TensorPack::new()
            .with(TensorSlot::Src(0), tensor(&[m, k], &a))
            .with(TensorSlot::Src(1), tensor(&[k, n], &b))
            .with(TensorSlot::Aux(0), tensor(&[n], &[1.0, 2.0, 3.0]))
            .with(TensorSlot::Dst(0), tensor(&[m, n], &vec![9.0; m * n]));

        let kernel = Arc::new(GemmKernel::configure(m, k, n, true).unwrap());
        run_kernel(kernel, &pack, 4);

        let mut expected = naive(&a, &b, m, n, k);
        for (i, v) in expected.iter_mut().enumerate() {
            *v += [1.0, 2.0, 3.0][i % n];
        }
        assert_eq!(pack.dst(0).unwrap().to_vec_f32(), expected);
    }

    #[test]
    fn test_degenerate() {
        assert!(GemmKernel::configure(0, 3, 3, false).unwrap_err().is_shape());
    }
}
