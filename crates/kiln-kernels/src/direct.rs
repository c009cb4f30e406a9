//! Direct (sliding-window) convolutions on pre-padded inputs.

use kiln_core::{BorderSize, DataLayout, KilnError, Result, TensorDescriptor, Window};
use kiln_runtime::{ExecutionContext, Kernel};

/// Slots: `Src(0)` padded input, `Src(1)` weights, `Aux(0)` bias, `Dst(0)`.
#[derive(Debug, Clone)]
pub struct DirectConvolutionKernel {
    layout: DataLayout,
    weights_layout: DataLayout,
    in_channels: usize,
    kernel_hw: (usize, usize),
    stride: (usize, usize),
    has_bias: bool,
    border: BorderSize,
    window: Window,
}

/// Check that a padded input covers every window of the output.
fn check_coverage(
    padded: &TensorDescriptor,
    dst: &TensorDescriptor,
    kernel_hw: (usize, usize),
    stride: (usize, usize),
) -> Result<()> {
    let (_, _, ph, pw) = padded.nchw()?;
    let (_, _, oh, ow) = dst.nchw()?;
    let need_h = (oh.max(1) - 1) * stride.1 + kernel_hw.0;
    let need_w = (ow.max(1) - 1) * stride.0 + kernel_hw.1;
    if ph < need_h || pw < need_w {
        return Err(KilnError::shape(format!(
            "padded input {} too small for output {}",
            padded.shape, dst.shape
        )));
    }
    Ok(())
}

impl DirectConvolutionKernel {
    pub fn configure(
        padded: &TensorDescriptor,
        weights: &TensorDescriptor,
        dst: &TensorDescriptor,
        stride: (usize, usize),
        has_bias: bool,
    ) -> Result<Self> {
        let (_, c, _, _) = padded.nchw()?;
        let (ofm, ifm, kh, kw) = weights.nchw()?;
        if ifm != c || dst.nchw()?.1 != ofm {
            return Err(KilnError::shape(format!(
                "direct convolution weights {} incompatible with {} -> {}",
                weights.shape, padded.shape, dst.shape
            )));
        }
        check_coverage(padded, dst, (kh, kw), stride)?;
        Ok(Self {
            layout: padded.layout,
            weights_layout: weights.layout,
            in_channels: c,
            kernel_hw: (kh, kw),
            stride,
            has_bias,
            border: BorderSize::default(),
            window: Window::from_shape(&dst.shape)?,
        })
    }

    /// Halo the padded input carries around the unpadded tensor.
    pub fn with_border(mut self, border: BorderSize) -> Self {
        self.border = border;
        self
    }
}

impl Kernel for DirectConvolutionKernel {
    fn name(&self) -> &str {
        "direct_convolution"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn border_size(&self) -> BorderSize {
        self.border
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let weights = ctx.pack.src(1)?;
        let bias = if self.has_bias { Some(ctx.pack.aux(0)?) } else { None };
        let dst = ctx.pack.dst(0)?;
        let (kh, kw) = self.kernel_hw;

        window.for_each(|coords| {
            let (n, o, oy, ox) = self.layout.split(&coords);
            let mut acc = bias.map_or(0.0, |b| b.load(&[o]));
            for ky in 0..kh {
                for kx in 0..kw {
                    let y = oy * self.stride.1 + ky;
                    let x = ox * self.stride.0 + kx;
                    for c in 0..self.in_channels {
                        acc += src.load(&self.layout.coords(n, c, y, x))
                            * weights.load(&self.weights_layout.coords(o, c, ky, kx));
                    }
                }
            }
            dst.store(&coords, acc);
        });
        Ok(())
    }
}

/// Per-channel convolution; output channel `c * multiplier + m` reads input
/// channel `c`. Same slots as [`DirectConvolutionKernel`].
#[derive(Debug, Clone)]
pub struct DepthwiseConvolutionKernel {
    layout: DataLayout,
    weights_layout: DataLayout,
    multiplier: usize,
    kernel_hw: (usize, usize),
    stride: (usize, usize),
    has_bias: bool,
    border: BorderSize,
    window: Window,
}

impl DepthwiseConvolutionKernel {
    pub fn configure(
        padded: &TensorDescriptor,
        weights: &TensorDescriptor,
        dst: &TensorDescriptor,
        stride: (usize, usize),
        multiplier: usize,
        has_bias: bool,
    ) -> Result<Self> {
        let (_, c, _, _) = padded.nchw()?;
        let (_, wc, kh, kw) = weights.nchw()?;
        if multiplier == 0 || wc != c * multiplier || dst.nchw()?.1 != wc {
            return Err(KilnError::shape(format!(
                "depthwise weights {} incompatible with {} -> {}",
                weights.shape, padded.shape, dst.shape
            )));
        }
        check_coverage(padded, dst, (kh, kw), stride)?;
        Ok(Self {
            layout: padded.layout,
            weights_layout: weights.layout,
            multiplier,
            kernel_hw: (kh, kw),
            stride,
            has_bias,
            border: BorderSize::default(),
            window: Window::from_shape(&dst.shape)?,
        })
    }

    pub fn with_border(mut self, border: BorderSize) -> Self {
        self.border = border;
        self
    }
}

impl Kernel for DepthwiseConvolutionKernel {
    fn name(&self) -> &str {
        "depthwise_convolution"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn border_size(&self) -> BorderSize {
        self.border
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let weights = ctx.pack.src(1)?;
        let bias = if self.has_bias { Some(ctx.pack.aux(0)?) } else { None };
        let dst = ctx.pack.dst(0)?;
        let (kh, kw) = self.kernel_hw;

        window.for_each(|coords| {
            let (n, o, oy, ox) = self.layout.split(&coords);
            let c = o / self.multiplier;
            let mut acc = bias.map_or(0.0, |b| b.load(&[o]));
            for ky in 0..kh {
                for kx in 0..kw {
                    let y = oy * self.stride.1 + ky;
                    let x = ox * self.stride.0 + kx;
                    acc += src.load(&self.layout.coords(n, c, y, x))
                        * weights.load(&self.weights_layout.coords(0, o, ky, kx));
                }
            }
            dst.store(&coords, acc);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_util::{run_kernel, tensor, zeros};
    use kiln_runtime::{TensorPack, TensorSlot};

    #[test]
    fn test_direct_sum_kernel() {
        // 3x3 input, 2x2 all-ones kernel, two output channels (second doubled).
        let src = tensor(&[1, 3, 3, 1], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let w = tensor(&[2, 2, 2, 1], &[1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
        let b = tensor(&[2], &[0.5, 0.0]);
        let dst = zeros(&[1, 2, 2, 2]);
        let k = DirectConvolutionKernel::configure(src.desc(), w.desc(), dst.desc(), (1, 1), true).unwrap();
        let pack = TensorPack::new()
            .with(TensorSlot::Src(0), src)
            .with(TensorSlot::Src(1), w)
            .with(TensorSlot::Aux(0), b)
            .with(TensorSlot::Dst(0), dst.clone());
        run_kernel(Arc::new(k), &pack, 2);
        assert_eq!(
            dst.to_vec_f32(),
            vec![12.5, 24.0, 16.5, 32.0, 24.5, 48.0, 28.5, 56.0]
        );
    }

    #[test]
    fn test_depthwise_multiplier() {
        // Two channels, multiplier 2, 1x1 kernel: scales per output channel.
        let src = tensor(&[1, 1, 2, 2], &[1.0, 10.0, 2.0, 20.0]);
        let w = tensor(&[1, 1, 1, 4], &[1.0, 2.0, 3.0, 4.0]);
        let dst = zeros(&[1, 1, 2, 4]);
        let k = DepthwiseConvolutionKernel::configure(src.desc(), w.desc(), dst.desc(), (1, 1), 2, false).unwrap();
        let pack = TensorPack::new()
            .with(TensorSlot::Src(0), src)
            .with(TensorSlot::Src(1), w)
            .with(TensorSlot::Dst(0), dst.clone());
        run_kernel(Arc::new(k), &pack, 1);
        assert_eq!(dst.to_vec_f32(), vec![1.0, 2.0, 30.0, 40.0, 2.0, 4.0, 60.0, 80.0]);
    }

    #[test]
    fn test_coverage_check() {
        let src = TensorDescriptor::new([1, 3, 3, 1], kiln_core::DataType::F32);
        let w = TensorDescriptor::new([1, 3, 3, 1], kiln_core::DataType::F32);
        let dst = TensorDescriptor::new([1, 2, 2, 1], kiln_core::DataType::F32);
        assert!(DirectConvolutionKernel::configure(&src, &w, &dst, (1, 1), false).is_err());
    }
}
