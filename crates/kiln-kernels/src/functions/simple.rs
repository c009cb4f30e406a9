//! Single-kernel operator functions.

use std::sync::Arc;

use kiln_core::{
    ActivationInfo, EltwiseOperation, NormalizationInfo, PoolingInfo, Result, TensorDescriptor,
};
use kiln_memory::{MemoryGroup, TensorArena, TensorHandle};
use kiln_runtime::{FunctionCore, Scheduler, Stage, TensorSlot};

use super::{desc_of, opt_desc_of, impl_function};
use crate::activation::ActivationKernel;
use crate::copy::CopyKernel;
use crate::elementwise::ElementwiseKernel;
use crate::normalization::{BatchNormalizationKernel, NormalizationKernel};
use crate::pooling::PoolingKernel;
use crate::softmax::SoftmaxKernel;

pub struct ActivationLayer {
    core: FunctionCore,
    input: TensorHandle,
    output: TensorHandle,
    info: ActivationInfo,
}

impl ActivationLayer {
    pub fn new(scheduler: Arc<dyn Scheduler>, input: TensorHandle, output: TensorHandle, info: ActivationInfo) -> Self {
        Self {
            core: FunctionCore::new("activation", scheduler),
            input,
            output,
            info,
        }
    }

    pub fn validate(input: &TensorDescriptor, output: &TensorDescriptor) -> Result<()> {
        ActivationKernel::validate(input, output)
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, _group: &MemoryGroup) -> Result<()> {
        let input = desc_of(arena, self.input)?;
        let output = desc_of(arena, self.output)?;
        let kernel = ActivationKernel::configure(&input, &output, self.info)?;
        self.core.set_stages(vec![Stage::new(kernel)
            .bind(TensorSlot::Src(0), self.input)
            .bind(TensorSlot::Dst(0), self.output)])
    }
}

impl_function!(ActivationLayer);

pub struct ElementwiseLayer {
    core: FunctionCore,
    inputs: [TensorHandle; 2],
    output: TensorHandle,
    op: EltwiseOperation,
}

impl ElementwiseLayer {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        inputs: [TensorHandle; 2],
        output: TensorHandle,
        op: EltwiseOperation,
    ) -> Self {
        Self {
            core: FunctionCore::new("elementwise", scheduler),
            inputs,
            output,
            op,
        }
    }

    pub fn validate(a: &TensorDescriptor, b: &TensorDescriptor, output: &TensorDescriptor) -> Result<()> {
        ElementwiseKernel::validate(a, b, output)
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, _group: &MemoryGroup) -> Result<()> {
        let a = desc_of(arena, self.inputs[0])?;
        let b = desc_of(arena, self.inputs[1])?;
        let output = desc_of(arena, self.output)?;
        let kernel = ElementwiseKernel::configure(&a, &b, &output, self.op)?;
        self.core.set_stages(vec![Stage::new(kernel)
            .bind(TensorSlot::Src(0), self.inputs[0])
            .bind(TensorSlot::Src(1), self.inputs[1])
            .bind(TensorSlot::Dst(0), self.output)])
    }
}

impl_function!(ElementwiseLayer);

pub struct PoolingLayer {
    core: FunctionCore,
    input: TensorHandle,
    output: TensorHandle,
    info: PoolingInfo,
}

impl PoolingLayer {
    pub fn new(scheduler: Arc<dyn Scheduler>, input: TensorHandle, output: TensorHandle, info: PoolingInfo) -> Self {
        Self {
            core: FunctionCore::new("pooling", scheduler),
            input,
            output,
            info,
        }
    }

    pub fn validate(input: &TensorDescriptor, output: &TensorDescriptor, info: &PoolingInfo) -> Result<()> {
        PoolingKernel::validate(input, output, info)
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, _group: &MemoryGroup) -> Result<()> {
        let input = desc_of(arena, self.input)?;
        let output = desc_of(arena, self.output)?;
        let kernel = PoolingKernel::configure(&input, &output, &self.info)?;
        self.core.set_stages(vec![Stage::new(kernel)
            .bind(TensorSlot::Src(0), self.input)
            .bind(TensorSlot::Dst(0), self.output)])
    }
}

impl_function!(PoolingLayer);

pub struct SoftmaxLayer {
    core: FunctionCore,
    input: TensorHandle,
    output: TensorHandle,
    beta: f32,
}

impl SoftmaxLayer {
    pub fn new(scheduler: Arc<dyn Scheduler>, input: TensorHandle, output: TensorHandle, beta: f32) -> Self {
        Self {
            core: FunctionCore::new("softmax", scheduler),
            input,
            output,
            beta,
        }
    }

    pub fn validate(input: &TensorDescriptor, output: &TensorDescriptor) -> Result<()> {
        SoftmaxKernel::validate(input, output)
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, _group: &MemoryGroup) -> Result<()> {
        let input = desc_of(arena, self.input)?;
        let output = desc_of(arena, self.output)?;
        let kernel = SoftmaxKernel::configure(&input, &output, self.beta)?;
        self.core.set_stages(vec![Stage::new(kernel)
            .bind(TensorSlot::Src(0), self.input)
            .bind(TensorSlot::Dst(0), self.output)])
    }
}

impl_function!(SoftmaxLayer);

/// Cross-map local response normalization.
pub struct NormalizationLayer {
    core: FunctionCore,
    input: TensorHandle,
    output: TensorHandle,
    info: NormalizationInfo,
}

impl NormalizationLayer {
    pub fn new(scheduler: Arc<dyn Scheduler>, input: TensorHandle, output: TensorHandle, info: NormalizationInfo) -> Self {
        Self {
            core: FunctionCore::new("normalization", scheduler),
            input,
            output,
            info,
        }
    }

    pub fn validate(input: &TensorDescriptor, output: &TensorDescriptor, info: &NormalizationInfo) -> Result<()> {
        NormalizationKernel::validate(input, output, info)
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, _group: &MemoryGroup) -> Result<()> {
        let input = desc_of(arena, self.input)?;
        let output = desc_of(arena, self.output)?;
        let kernel = NormalizationKernel::configure(&input, &output, self.info)?;
        self.core.set_stages(vec![Stage::new(kernel)
            .bind(TensorSlot::Src(0), self.input)
            .bind(TensorSlot::Dst(0), self.output)])
    }
}

impl_function!(NormalizationLayer);

/// Parameter tensors of a batch normalization: mean and variance are
/// required, beta and gamma default to 0 and 1.
#[derive(Debug, Clone, Copy)]
pub struct BatchNormParams {
    pub mean: TensorHandle,
    pub var: TensorHandle,
    pub beta: Option<TensorHandle>,
    pub gamma: Option<TensorHandle>,
}

pub struct BatchNormalizationLayer {
    core: FunctionCore,
    input: TensorHandle,
    output: TensorHandle,
    params: BatchNormParams,
    epsilon: f32,
    activation: Option<ActivationInfo>,
}

impl BatchNormalizationLayer {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        input: TensorHandle,
        output: TensorHandle,
        params: BatchNormParams,
        epsilon: f32,
        activation: Option<ActivationInfo>,
    ) -> Self {
        Self {
            core: FunctionCore::new("batch_normalization", scheduler),
            input,
            output,
            params,
            epsilon,
            activation,
        }
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, _group: &MemoryGroup) -> Result<()> {
        let input = desc_of(arena, self.input)?;
        let output = desc_of(arena, self.output)?;
        let p = self.params;
        let descs = [
            Some(desc_of(arena, p.mean)?),
            Some(desc_of(arena, p.var)?),
            opt_desc_of(arena, p.beta)?,
            opt_desc_of(arena, p.gamma)?,
        ];
        let refs = [descs[0].as_ref(), descs[1].as_ref(), descs[2].as_ref(), descs[3].as_ref()];
        let kernel = BatchNormalizationKernel::configure(&input, &output, &refs, self.epsilon, self.activation)?;

        let mut stage = Stage::new(kernel)
            .bind(TensorSlot::Src(0), self.input)
            .bind(TensorSlot::Aux(0), p.mean)
            .bind(TensorSlot::Aux(1), p.var)
            .bind(TensorSlot::Dst(0), self.output);
        if let Some(beta) = p.beta {
            stage = stage.bind(TensorSlot::Aux(2), beta);
        }
        if let Some(gamma) = p.gamma {
            stage = stage.bind(TensorSlot::Aux(3), gamma);
        }
        self.core.set_stages(vec![stage])
    }
}

impl_function!(BatchNormalizationLayer);

/// Reshape and flatten: a row-major copy into the output's shape.
pub struct ReshapeLayer {
    core: FunctionCore,
    input: TensorHandle,
    output: TensorHandle,
}

impl ReshapeLayer {
    pub fn new(scheduler: Arc<dyn Scheduler>, input: TensorHandle, output: TensorHandle) -> Self {
        Self {
            core: FunctionCore::new("reshape", scheduler),
            input,
            output,
        }
    }

    pub fn validate(input: &TensorDescriptor, output: &TensorDescriptor) -> Result<()> {
        CopyKernel::validate(input, output)
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, _group: &MemoryGroup) -> Result<()> {
        let input = desc_of(arena, self.input)?;
        let output = desc_of(arena, self.output)?;
        let kernel = CopyKernel::configure(&input, &output)?;
        self.core.set_stages(vec![Stage::new(kernel)
            .bind(TensorSlot::Src(0), self.input)
            .bind(TensorSlot::Dst(0), self.output)])
    }
}

impl_function!(ReshapeLayer);

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ActivationFunction, DataType, PadStrideInfo, PoolingType, Target};
    use kiln_memory::{Interval, MemoryAffinity, MemoryManager};
    use kiln_runtime::{CpuScheduler, Function, FunctionState, RunContext};

    fn setup() -> (Arc<dyn Scheduler>, TensorArena, MemoryGroup) {
        let sched: Arc<dyn Scheduler> = Arc::new(CpuScheduler::new(2).unwrap());
        let mm = Arc::new(MemoryManager::new(Target::Cpu, MemoryAffinity::Blob));
        let group = MemoryGroup::new(mm, "node", Interval::at(0));
        (sched, TensorArena::new(), group)
    }

    fn owned(arena: &mut TensorArena, name: &str, shape: &[usize]) -> TensorHandle {
        let h = arena.add(name, TensorDescriptor::new(shape, DataType::F32));
        arena.bind_owned(h).unwrap();
        h
    }

    #[test]
    fn test_activation_lifecycle() {
        let (sched, mut arena, group) = setup();
        let x = owned(&mut arena, "x", &[4]);
        let y = owned(&mut arena, "y", &[4]);
        arena.view(x).unwrap().copy_from_f32(&[-2.0, -1.0, 1.0, 2.0]).unwrap();

        let mut f = ActivationLayer::new(sched, x, y, ActivationInfo::new(ActivationFunction::Relu));
        assert_eq!(f.state(), FunctionState::Unconfigured);
        let ctx = RunContext::new(&arena, 0);
        assert!(f.run(&ctx).unwrap_err().is_usage());

        f.configure(&mut arena, &group).unwrap();
        assert_eq!(f.state(), FunctionState::Configured);
        let ctx = RunContext::new(&arena, 0);
        f.prepare(&ctx).unwrap();
        f.run(&ctx).unwrap();
        assert_eq!(arena.view(y).unwrap().to_vec_f32(), vec![0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_reconfigure_same_window() {
        let (sched, mut arena, group) = setup();
        let x = owned(&mut arena, "x", &[1, 4, 4, 2]);
        let y = owned(&mut arena, "y", &[1, 2, 2, 2]);
        let info = PoolingInfo::new(PoolingType::Max, 2, PadStrideInfo::new(2, 2, 0, 0));
        let mut f = PoolingLayer::new(sched, x, y, info);
        f.configure(&mut arena, &group).unwrap();
        let first = f.windows();
        f.configure(&mut arena, &group).unwrap();
        assert_eq!(f.windows(), first);
    }

    #[test]
    fn test_reshape_rejects_count_mismatch() {
        let (sched, mut arena, group) = setup();
        let x = owned(&mut arena, "x", &[2, 3]);
        let y = owned(&mut arena, "y", &[7]);
        let mut f = ReshapeLayer::new(sched, x, y);
        assert!(f.configure(&mut arena, &group).unwrap_err().is_shape());
    }
}
