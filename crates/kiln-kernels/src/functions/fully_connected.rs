use std::sync::Arc;

use kiln_core::{Result, TensorDescriptor};
use kiln_memory::{MemoryGroup, TensorArena, TensorHandle};
use kiln_runtime::{FunctionCore, Scheduler, Stage, TensorSlot};

use super::{desc_of, opt_desc_of, impl_function};
use crate::gemm::GemmKernel;
use crate::shapes::{flat_rows, fully_connected_output, require_same_shape};

/// `output[batch, OFM] = flatten(input) @ weights[K, OFM] + bias`.
pub struct FullyConnectedLayer {
    core: FunctionCore,
    input: TensorHandle,
    weights: TensorHandle,
    bias: Option<TensorHandle>,
    output: TensorHandle,
}

impl FullyConnectedLayer {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        input: TensorHandle,
        weights: TensorHandle,
        bias: Option<TensorHandle>,
        output: TensorHandle,
    ) -> Self {
        Self {
            core: FunctionCore::new("fully_connected", scheduler),
            input,
            weights,
            bias,
            output,
        }
    }

    pub fn validate(
        input: &TensorDescriptor,
        weights: &TensorDescriptor,
        bias: Option<&TensorDescriptor>,
        output: &TensorDescriptor,
    ) -> Result<()> {
        let expected = fully_connected_output(input, weights, bias)?;
        require_same_shape(output, &expected, "fully connected")
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, _group: &MemoryGroup) -> Result<()> {
        let input = desc_of(arena, self.input)?;
        let weights = desc_of(arena, self.weights)?;
        let bias = opt_desc_of(arena, self.bias)?;
        let output = desc_of(arena, self.output)?;
        Self::validate(&input, &weights, bias.as_ref(), &output)?;

        let (batch, k) = flat_rows(&input)?;
        let ofm = weights.shape.dims()[1];
        let kernel = GemmKernel::configure(batch, k, ofm, self.bias.is_some())?;
        let mut stage = Stage::new(kernel)
            .bind(TensorSlot::Src(0), self.input)
            .bind(TensorSlot::Src(1), self.weights)
            .bind(TensorSlot::Dst(0), self.output);
        if let Some(b) = self.bias {
            stage = stage.bind(TensorSlot::Aux(0), b);
        }
        self.core.set_stages(vec![stage])
    }
}

impl_function!(FullyConnectedLayer);
