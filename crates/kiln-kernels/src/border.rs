//! Border materialization.
//!
//! Kernels that read outside their window (convolutions with padding) run on
//! a copy of their input with the border filled in, produced by this kernel.

use kiln_core::{BorderSize, DataLayout, Result, TensorDescriptor, Window};
use kiln_runtime::{ExecutionContext, Kernel};

use crate::shapes::{padded_descriptor, require_same_shape};

/// Copies `Src(0)` into the interior of `Dst(0)` and fills the border with a
/// constant.
#[derive(Debug, Clone)]
pub struct FillBorderKernel {
    border: BorderSize,
    value: f32,
    src_hw: (usize, usize),
    layout: DataLayout,
    window: Window,
}

impl FillBorderKernel {
    pub fn validate(src: &TensorDescriptor, dst: &TensorDescriptor, border: BorderSize) -> Result<()> {
        let expected = padded_descriptor(src, border)?;
        require_same_shape(dst, &expected, "fill border")
    }

    pub fn configure(src: &TensorDescriptor, dst: &TensorDescriptor, border: BorderSize, value: f32) -> Result<Self> {
        Self::validate(src, dst, border)?;
        let (_, _, h, w) = src.nchw()?;
        Ok(Self {
            border,
            value,
            src_hw: (h, w),
            layout: src.layout,
            window: Window::from_shape(&dst.shape)?,
        })
    }

    pub fn border(&self) -> BorderSize {
        self.border
    }
}

impl Kernel for FillBorderKernel {
    fn name(&self) -> &str {
        "fill_border"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        let (h, w) = self.src_hw;
        let (top, left) = (self.border.top, self.border.left);
        window.for_each(|coords| {
            let (n, c, y, x) = self.layout.split(&coords);
            let inside = y >= top && y < top + h && x >= left && x < left + w;
            let v = if inside {
                src.load(&self.layout.coords(n, c, y - top, x - left))
            } else {
                self.value
            };
            dst.store(&coords, v);
        });
        Ok(())
    }
}
