//! Operator functions: kernels wired together with their scratch tensors.
//!
//! A function is built from tensor handles, configured from the descriptors
//! currently stored in the arena and run through its scheduler. Scratch
//! tensors are requested from the function's memory group; weight-derived
//! state lives in persistent tensors filled by `prepare`.

mod concat;
mod convolution;
mod fully_connected;
mod simple;

pub use concat::ConcatenateLayer;
pub use convolution::{
    create_convolution, select_convolution_method, validate_convolution, ConvolutionTensors,
    DepthwiseConvolutionLayer, DirectConvolutionLayer, GemmConvolutionLayer, WinogradConvolutionLayer,
};
pub use fully_connected::FullyConnectedLayer;
pub use simple::{
    ActivationLayer, BatchNormParams, BatchNormalizationLayer, ElementwiseLayer, NormalizationLayer, PoolingLayer,
    ReshapeLayer, SoftmaxLayer,
};

use kiln_core::{BorderSize, PadStrideInfo, Result, TensorDescriptor};
use kiln_memory::{MemoryGroup, TensorArena, TensorHandle};
use kiln_runtime::{scratch_tensor, Stage, TensorSlot};

use crate::border::FillBorderKernel;
use crate::shapes::padded_descriptor;

/// Implements [`kiln_runtime::Function`] for a type with a `core` field and
/// an inherent `configure_stages`.
macro_rules! impl_function {
    ($ty:ty) => {
        impl kiln_runtime::Function for $ty {
            fn name(&self) -> &str {
                self.core.name()
            }

            fn state(&self) -> kiln_runtime::FunctionState {
                self.core.state()
            }

            fn configure(
                &mut self,
                arena: &mut kiln_memory::TensorArena,
                group: &kiln_memory::MemoryGroup,
            ) -> kiln_core::Result<()> {
                self.configure_stages(arena, group)
            }

            fn prepare(&mut self, ctx: &kiln_runtime::RunContext<'_>) -> kiln_core::Result<()> {
                self.core.prepare(ctx)
            }

            fn run(&mut self, ctx: &kiln_runtime::RunContext<'_>) -> kiln_core::Result<()> {
                self.core.run(ctx)
            }

            fn windows(&self) -> Vec<kiln_core::Window> {
                self.core.windows()
            }
        }
    };
}
pub(crate) use impl_function;

pub(crate) fn desc_of(arena: &TensorArena, h: TensorHandle) -> Result<TensorDescriptor> {
    Ok(arena.desc(h)?.clone())
}

pub(crate) fn opt_desc_of(arena: &TensorArena, h: Option<TensorHandle>) -> Result<Option<TensorDescriptor>> {
    h.map(|h| desc_of(arena, h)).transpose()
}

/// Materialize `border` around `input` into the scratch tensor `padded`,
/// pushing the fill stage. Without a border the input is used directly.
pub(crate) fn pad_input(
    arena: &mut TensorArena,
    group: &MemoryGroup,
    padded: &mut Option<TensorHandle>,
    input: TensorHandle,
    border: BorderSize,
    stages: &mut Vec<Stage>,
) -> Result<(TensorHandle, TensorDescriptor)> {
    let input_desc = desc_of(arena, input)?;
    if border.is_empty() {
        return Ok((input, input_desc));
    }
    let padded_desc = padded_descriptor(&input_desc, border)?;
    let h = scratch_tensor(arena, group, *padded, "padded", padded_desc.clone())?;
    *padded = Some(h);
    let kernel = FillBorderKernel::configure(&input_desc, &padded_desc, border, 0.0)?;
    stages.push(
        Stage::new(kernel)
            .bind(TensorSlot::Src(0), input)
            .bind(TensorSlot::Dst(0), h),
    );
    Ok((h, padded_desc))
}

/// Border that pads `input` exactly enough for every output window, honouring
/// the requested padding. Ceil rounding may need extra bottom/right rows.
pub(crate) fn convolution_border(
    input: &TensorDescriptor,
    output: &TensorDescriptor,
    kernel_hw: (usize, usize),
    info: &PadStrideInfo,
) -> Result<BorderSize> {
    let (_, _, h, w) = input.nchw()?;
    let (_, _, oh, ow) = output.nchw()?;
    let need_h = (oh.max(1) - 1) * info.stride_y + kernel_hw.0;
    let need_w = (ow.max(1) - 1) * info.stride_x + kernel_hw.1;
    Ok(BorderSize::new(
        info.pad_top,
        info.pad_right.max(need_w.saturating_sub(w + info.pad_left)),
        info.pad_bottom.max(need_h.saturating_sub(h + info.pad_top)),
        info.pad_left,
    ))
}
