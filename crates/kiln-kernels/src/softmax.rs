//! Softmax over the innermost dimension.

use kiln_core::{Dimension, KilnError, Result, TensorDescriptor, Window};
use kiln_runtime::{ExecutionContext, Kernel};

use crate::shapes::require_same_shape;

/// `Dst(0) = softmax(beta * Src(0))` along the last dimension. The window
/// iterates rows.
#[derive(Debug, Clone)]
pub struct SoftmaxKernel {
    beta: f32,
    row_len: usize,
    window: Window,
}

impl SoftmaxKernel {
    pub fn validate(src: &TensorDescriptor, dst: &TensorDescriptor) -> Result<()> {
        src.require_f32("softmax input")?;
        require_same_shape(src, dst, "softmax")?;
        if src.shape.dims().last().copied().unwrap_or(0) == 0 {
            return Err(KilnError::shape(format!("softmax over empty axis of {}", src.shape)));
        }
        Ok(())
    }

    pub fn configure(src: &TensorDescriptor, dst: &TensorDescriptor, beta: f32) -> Result<Self> {
        Self::validate(src, dst)?;
        let row_len = src.shape.dims().last().copied().unwrap_or(1);
        let mut window = Window::new(1);
        window.set(0, Dimension::new(0, src.shape.numel() / row_len, 1));
        Ok(Self { beta, row_len, window })
    }
}

impl Kernel for SoftmaxKernel {
    fn name(&self) -> &str {
        "softmax"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        let len = self.row_len;
        let mut row = vec![0.0f32; len];
        for r in window.dim(0).iter() {
            let base = r * len;
            let mut max = f32::NEG_INFINITY;
            for (j, v) in row.iter_mut().enumerate() {
                *v = self.beta * src.load_flat(base + j);
                max = max.max(*v);
            }
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for (j, v) in row.iter().enumerate() {
                dst.store_flat(base + j, v / sum);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_util::{assert_close, run_kernel, tensor, zeros};
    use kiln_runtime::{TensorPack, TensorSlot};

    #[test]
    fn test_rows_sum_to_one() {
        let src = tensor(&[3, 4], &[1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0, 100.0, 0.0, 0.0, 0.0]);
        let dst = zeros(&[3, 4]);
        let k = SoftmaxKernel::configure(src.desc(), dst.desc(), 1.0).unwrap();
        let pack = TensorPack::new()
            .with(TensorSlot::Src(0), src)
            .with(TensorSlot::Dst(0), dst.clone());
        run_kernel(Arc::new(k), &pack, 2);

        let out = dst.to_vec_f32();
        for row in out.chunks(4) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        assert_close(&out[4..8], &[0.25; 4], 1e-6);
        assert!(out[8] > 0.999);
        assert!(out[0] < out[1] && out[1] < out[2] && out[2] < out[3]);
    }

    #[test]
    fn test_beta_sharpens() {
        let src = tensor(&[1, 2], &[0.0, 1.0]);
        let dst = zeros(&[1, 2]);
        let k = SoftmaxKernel::configure(src.desc(), dst.desc(), 10.0).unwrap();
        let pack = TensorPack::new()
            .with(TensorSlot::Src(0), src)
            .with(TensorSlot::Dst(0), dst.clone());
        run_kernel(Arc::new(k), &pack, 1);
        assert!(dst.to_vec_f32()[1] > 0.9999);
    }
}
