//! Lowering of convolutions to GEMM: im2col, weight reshaping and col2im.
//!
//! Patch columns are ordered `(ky, kx, c)` with `c` fastest, matching the
//! rows of the reshaped weight matrix.

use kiln_core::{BorderSize, DataLayout, Dimension, KilnError, Result, Size2D, TensorDescriptor, Window};
use kiln_runtime::{ExecutionContext, Kernel};

/// Unfold a padded input into a `[N*OH*OW, KH*KW*C]` patch matrix.
#[derive(Debug, Clone)]
pub struct Im2ColKernel {
    layout: DataLayout,
    channels: usize,
    kernel: Size2D,
    stride: (usize, usize),
    out_hw: (usize, usize),
    border: BorderSize,
    window: Window,
}

impl Im2ColKernel {
    /// `src` must already be padded. Returns the patch-matrix shape.
    pub fn output_shape(
        src: &TensorDescriptor,
        kernel: Size2D,
        stride: (usize, usize),
    ) -> Result<([usize; 2], (usize, usize))> {
        let (n, c, h, w) = src.nchw()?;
        if kernel.width > w || kernel.height > h || stride.0 == 0 || stride.1 == 0 {
            return Err(KilnError::shape(format!(
                "im2col kernel {}x{} stride {:?} on {}",
                kernel.width, kernel.height, stride, src.shape
            )));
        }
        let ow = (w - kernel.width) / stride.0 + 1;
        let oh = (h - kernel.height) / stride.1 + 1;
        Ok(([n * oh * ow, kernel.width * kernel.height * c], (oh, ow)))
    }

    pub fn configure(
        src: &TensorDescriptor,
        dst: &TensorDescriptor,
        kernel: Size2D,
        stride: (usize, usize),
    ) -> Result<Self> {
        let (shape, out_hw) = Self::output_shape(src, kernel, stride)?;
        if dst.shape.dims() != shape {
            return Err(KilnError::shape(format!(
                "im2col output {} should be {:?}",
                dst.shape, shape
            )));
        }
        let mut window = Window::new(1);
        window.set(0, Dimension::new(0, shape[0], 1));
        Ok(Self {
            layout: src.layout,
            channels: src.nchw()?.1,
            kernel,
            stride,
            out_hw,
            border: BorderSize::default(),
            window,
        })
    }

    pub fn with_border(mut self, border: BorderSize) -> Self {
        self.border = border;
        self
    }
}

impl Kernel for Im2ColKernel {
    fn name(&self) -> &str {
        "im2col"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn border_size(&self) -> BorderSize {
        self.border
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        let (oh, ow) = self.out_hw;
        let c_in = self.channels;
        for row in window.dim(0).iter() {
            let n = row / (oh * ow);
            let oy = (row / ow) % oh;
            let ox = row % ow;
            let mut col = 0;
            for ky in 0..self.kernel.height {
                for kx in 0..self.kernel.width {
                    let y = oy * self.stride.1 + ky;
                    let x = ox * self.stride.0 + kx;
                    for c in 0..c_in {
                        dst.store(&[row, col], src.load(&self.layout.coords(n, c, y, x)));
                        col += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Reshape convolution weights `(OFM, IFM, KH, KW)` into a `[KH*KW*IFM, OFM]` matrix.
#[derive(Debug, Clone)]
pub struct WeightsReshapeKernel {
    layout: DataLayout,
    dims: (usize, usize, usize, usize),
    window: Window,
}

impl WeightsReshapeKernel {
    pub fn output_shape(weights: &TensorDescriptor) -> Result<[usize; 2]> {
        let (ofm, ifm, kh, kw) = weights.nchw()?;
        Ok([kh * kw * ifm, ofm])
    }

    pub fn configure(weights: &TensorDescriptor, dst: &TensorDescriptor) -> Result<Self> {
        let shape = Self::output_shape(weights)?;
        if dst.shape.dims() != shape {
            return Err(KilnError::shape(format!(
                "reshaped weights {} should be {:?}",
                dst.shape, shape
            )));
        }
        let mut window = Window::new(1);
        window.set(0, Dimension::new(0, shape[0], 1));
        Ok(Self {
            layout: weights.layout,
            dims: weights.nchw()?,
            window,
        })
    }
}

impl Kernel for WeightsReshapeKernel {
    fn name(&self) -> &str {
        "weights_reshape"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        let (ofm, ifm, _, kw) = self.dims;
        for row in window.dim(0).iter() {
            let c = row % ifm;
            let kx = (row / ifm) % kw;
            let ky = row / (ifm * kw);
            for o in 0..ofm {
                dst.store(&[row, o], src.load(&self.layout.coords(o, c, ky, kx)));
            }
        }
        Ok(())
    }
}

/// Scatter a `[N*OH*OW, OFM]` GEMM result into a rank-4 output tensor.
#[derive(Debug, Clone)]
pub struct Col2ImKernel {
    layout: DataLayout,
    out_hw: (usize, usize),
    window: Window,
}

impl Col2ImKernel {
    pub fn configure(src: &TensorDescriptor, dst: &TensorDescriptor) -> Result<Self> {
        let (n, c, h, w) = dst.nchw()?;
        if src.shape.dims() != [n * h * w, c] {
            return Err(KilnError::shape(format!(
                "col2im input {} does not match output {}",
                src.shape, dst.shape
            )));
        }
        Ok(Self {
            layout: dst.layout,
            out_hw: (h, w),
            window: Window::from_shape(&dst.shape)?,
        })
    }
}

impl Kernel for Col2ImKernel {
    fn name(&self) -> &str {
        "col2im"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        let (oh, ow) = self.out_hw;
        window.for_each(|coords| {
            let (n, c, y, x) = self.layout.split(&coords);
            dst.store(&coords, src.load(&[(n * oh + y) * ow + x, c]));
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
    fn test_im2col_2x2() {
        // 1x3x3x1 input, 2x2 kernel, stride 1 -> 4 patches of 4 values.
        let src = tensor(&[1, 3, 3, 1], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let dst = zeros(&[4, 4]);
        let k = Im2ColKernel::configure(src.desc(), dst.desc(), Size2D::new(2, 2), (1, 1)).unwrap();
        let pack = TensorPack::new().with(TensorSlot::Src(0), src).with(TensorSlot::Dst(0), dst.clone());
        run_kernel(Arc::new(k), &pack, 2);
        assert_eq!(
            dst.to_vec_f32(),
            vec![
                1.0, 2.0, 4.0, 5.0, //
                2.0, 3.0, 5.0, 6.0, //
                4.0, 5.0, 7.0, 8.0, //
                5.0, 6.0, 8.0, 9.0,
            ]
        );
    }

    #[test]
    fn test_weights_reshape_nhwc() {
        // OFM=2, KH=1, KW=2, IFM=2 in NHWC order [o][ky][kx][c].
        let w = tensor(&[2, 1, 2, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let dst = zeros(&[4, 2]);
        let k = WeightsReshapeKernel::configure(w.desc(), dst.desc()).unwrap();
        let pack = TensorPack::new().with(TensorSlot::Src(0), w).with(TensorSlot::Dst(0), dst.clone());
        run_kernel(Arc::new(k), &pack, 1);
        assert_eq!(dst.to_vec_f32(), vec![1.0, 5.0, 2.0, 6.0, 3.0, 7.0, 4.0, 8.0]);
    }

    #[test]
    fn test_col2im() {
        let src = tensor(&[4, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let dst = zeros(&[1, 2, 2, 2]);
        let k = Col2ImKernel::configure(src.desc(), dst.desc()).unwrap();
        let pack = TensorPack::new().with(TensorSlot::Src(0), src).with(TensorSlot::Dst(0), dst.clone());
        run_kernel(Arc::new(k), &pack, 3);
        // NHWC: the GEMM result already is the output layout.
        assert_eq!(dst.to_vec_f32(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_im2col_shape_mismatch() {
        let src = TensorDescriptor::new([1, 3, 3, 1], kiln_core::DataType::F32);
        let dst = TensorDescriptor::new([5, 4], kiln_core::DataType::F32);
        assert!(Im2ColKernel::configure(&src, &dst, Size2D::new(2, 2), (1, 1)).is_err());
    }
}
