//! Pointwise activation functions.

use kiln_core::{ActivationInfo, Dimension, Result, TensorDescriptor, Window};
use kiln_runtime::{ExecutionContext, Kernel};

use crate::shapes::require_same_shape;

/// Applies `info` to every element of `Src(0)`, writing `Dst(0)`.
///
/// `Src(0)` and `Dst(0)` may be the same tensor.
#[derive(Debug, Clone)]
pub struct ActivationKernel {
    info: ActivationInfo,
    window: Window,
}

impl ActivationKernel {
    pub fn validate(src: &TensorDescriptor, dst: &TensorDescriptor) -> Result<()> {
        src.require_f32("activation input")?;
        require_same_shape(src, dst, "activation")
    }

    pub fn configure(src: &TensorDescriptor, dst: &TensorDescriptor, info: ActivationInfo) -> Result<Self> {
        Self::validate(src, dst)?;
        let mut window = Window::new(1);
        window.set(0, Dimension::new(0, src.shape.numel(), 1));
        Ok(Self { info, window })
    }
}

impl Kernel for ActivationKernel {
    fn name(&self) -> &str {
        "activation"
    }

    fn window(&self) -> &Window {
        &self.window
    }

    fn run(&self, window: &Window, ctx: &ExecutionContext<'_>) -> Result<()> {
        let src = ctx.pack.src(0)?;
        let dst = ctx.pack.dst(0)?;
        for i in window.dim(0).iter() {
            dst.store_flat(i, self.info.apply(src.load_flat(i)));
        }
        Ok(())
    }
}
