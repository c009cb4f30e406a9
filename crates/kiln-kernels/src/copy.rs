//! Copies: flat element copies (reshape, flatten) and concatenation.

use kiln_core::{DataLayoutDimension, Dimension, KilnError, Result, TensorDescriptor, Window};
use kiln_runtime::{ExecutionContext, Kernel};

use crate::shapes::concat_axis;

/// Copies `Src(0)` into `Dst(0)` element by element in row-major order.
/// The shapes may differ as long as the element counts match.
#[derive(Debug, Clone)]
pub struct CopyKernel {
    window: Window,
}

impl CopyKernel {
    pub fn validate(src: &TensorDescriptor, dst: &TensorDescriptor) -> Result<()> {
        if src.shape.numel() != dst.shape.numel() {
            return Err(KilnError::shape(format!(
                "cannot copy {} into {}",
                src.shape, dst.shape
            )));
        }
        Ok(())
    }

    pub fn configure(src: &TensorDescriptor, dst: &TensorDescriptor) -> Result<Self> {
        Self::validate(src, dst)?;
        let mut window = Window::new(1);
        window.set(0, Dimension::new(0, dst.shape.numel(), 1));
        Ok(Self { window })
    }
}

impl Kernel for CopyKernel {
    fn name(&self) -> &str {
        "copy"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        for i in window.dim(0).iter() {
            dst.store_flat(i, src.load_flat(i));
        }
        Ok(())
    }
}

/// Writes `Src(0)` into `Dst(0)` starting at `offset` along the
/// concatenation axis. One kernel runs per concatenated input.
#[derive(Debug, Clone)]
pub struct ConcatenateKernel {
    axis: usize,
    offset: usize,
    window: Window,
}

impl ConcatenateKernel {
    pub fn configure(
        src: &TensorDescriptor,
        dst: &TensorDescriptor,
        axis: DataLayoutDimension,
        offset: usize,
    ) -> Result<Self> {
        let a = concat_axis(src, axis)?;
        let fits = src.shape.ndim() == dst.shape.ndim()
            && src
                .shape
                .dims()
                .iter()
                .zip(dst.shape.dims())
                .enumerate()
                .all(|(d, (&s, &t))| if d == a { offset + s <= t } else { s == t });
        if !fits {
            return Err(KilnError::shape(format!(
                "cannot place {} at offset {offset} along {axis:?} of {}",
                src.shape, dst.shape
            )));
        }
        Ok(Self {
            axis: a,
            offset,
            window: Window::from_shape(&src.shape)?,
        })
    }
}

impl Kernel for ConcatenateKernel {
    fn name(&self) -> &str {
        "concatenate"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        window.for_each(|coords| {
            let mut out = coords;
            out[self.axis] += self.offset;
            dst.store(&out, src.load(&coords));
        });
        Ok(())
    }
}
