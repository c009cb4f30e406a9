use std::sync::Arc;

use kiln_core::{DataLayoutDimension, KilnError, Result, TensorDescriptor};
use kiln_memory::{MemoryGroup, TensorArena, TensorHandle};
use kiln_runtime::{FunctionCore, Scheduler, Stage, TensorSlot};

use super::{desc_of, impl_function};
use crate::copy::ConcatenateKernel;
use crate::shapes::{concat_axis, concat_output, require_same_shape};

/// Concatenation along a logical dimension, one copy kernel per input.
pub struct ConcatenateLayer {
    core: FunctionCore,
    inputs: Vec<TensorHandle>,
    output: TensorHandle,
    axis: DataLayoutDimension,
}

impl ConcatenateLayer {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        inputs: Vec<TensorHandle>,
        output: TensorHandle,
        axis: DataLayoutDimension,
    ) -> Self {
        Self {
            core: FunctionCore::new("concatenate", scheduler),
            inputs,
            output,
            axis,
        }
    }

    pub fn validate(inputs: &[&TensorDescriptor], output: &TensorDescriptor, axis: DataLayoutDimension) -> Result<()> {
        let expected = concat_output(inputs, axis)?;
        require_same_shape(output, &expected, "concatenate")
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, _group: &MemoryGroup) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(KilnError::shape("concatenation of zero inputs"));
        }
        let descs = self
            .inputs
            .iter()
            .map(|&h| desc_of(arena, h))
            .collect::<Result<Vec<_>>>()?;
        let output = desc_of(arena, self.output)?;
        let refs: Vec<&TensorDescriptor> = descs.iter().collect();
        Self::validate(&refs, &output, self.axis)?;

        let axis_index = concat_axis(&output, self.axis)?;
        let mut offset = 0;
        let mut stages = Vec::with_capacity(self.inputs.len());
        for (&h, desc) in self.inputs.iter().zip(&descs) {
            let kernel = ConcatenateKernel::configure(desc, &output, self.axis, offset)?;
            stages.push(
                Stage::new(kernel)
                    .bind(TensorSlot::Src(0), h)
                    .bind(TensorSlot::Dst(0), self.output),
            );
            offset += desc.shape.dims()[axis_index];
        }
        self.core.set_stages(stages)
    }
}

impl_function!(ConcatenateLayer);

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{DataType, Target};
    use kiln_memory::{Interval, MemoryAffinity, MemoryManager};
    use kiln_runtime::{CpuScheduler, Function, RunContext};

    #[test]
    fn test_concat_width() {
        let sched: Arc<dyn Scheduler> = Arc::new(CpuScheduler::new(3).unwrap());
        let mm = Arc::new(MemoryManager::new(Target::Cpu, MemoryAffinity::Blob));
        let group = MemoryGroup::new(mm, "cat", Interval::at(0));
        let mut arena = TensorArena::new();
        let mut add = |name: &str, shape: [usize; 4]| {
            let h = arena.add(name, TensorDescriptor::new(shape, DataType::F32));
            arena.bind_owned(h).unwrap();
            h
        };
        let a = add("a", [1, 2, 1, 1]);
        let b = add("b", [1, 2, 2, 1]);
        let out = add("out", [1, 2, 3, 1]);
        arena.view(a).unwrap().copy_from_f32(&[1.0, 2.0]).unwrap();
        arena.view(b).unwrap().copy_from_f32(&[10.0, 11.0, 20.0, 21.0]).unwrap();

        let mut f = ConcatenateLayer::new(sched, vec![a, b], out, DataLayoutDimension::Width);
        f.configure(&mut arena, &group).unwrap();
        assert_eq!(f.windows().len(), 2);
        f.run(&RunContext::new(&arena, 0)).unwrap();
        assert_eq!(
            arena.view(out).unwrap().to_vec_f32(),
            vec![1.0, 10.0, 11.0, 2.0, 20.0, 21.0]
        );
    }
}
