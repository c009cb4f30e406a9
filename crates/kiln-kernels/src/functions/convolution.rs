//! Convolution functions, one per method, and method selection.

use std::sync::Arc;

use tracing::debug;

use kiln_core::{
    BorderSize, ConvolutionMethod, KilnError, PadStrideInfo, Result, Size2D, Target, TensorDescriptor,
};
use kiln_memory::{MemoryGroup, TensorArena, TensorHandle};
use kiln_runtime::{persistent_tensor, scratch_tensor, Function, FunctionCore, Scheduler, Stage, TensorSlot};

use super::{convolution_border, desc_of, impl_function, opt_desc_of, pad_input};
use crate::direct::{DepthwiseConvolutionKernel, DirectConvolutionKernel};
use crate::gemm::GemmKernel;
use crate::im2col::{Col2ImKernel, Im2ColKernel, WeightsReshapeKernel};
use crate::shapes::{convolution_output, depthwise_output, require_same_shape};
use crate::winograd::{self, WinogradConvolutionKernel, WinogradFilterTransformKernel};

/// Tensors of a convolution. Weights follow the input layout with
/// N = output channels and C = input channels.
#[derive(Debug, Clone, Copy)]
pub struct ConvolutionTensors {
    pub input: TensorHandle,
    pub weights: TensorHandle,
    pub bias: Option<TensorHandle>,
    pub output: TensorHandle,
}

struct Descs {
    input: TensorDescriptor,
    weights: TensorDescriptor,
    bias: Option<TensorDescriptor>,
    output: TensorDescriptor,
}

impl ConvolutionTensors {
    fn descs(&self, arena: &TensorArena) -> Result<Descs> {
        Ok(Descs {
            input: desc_of(arena, self.input)?,
            weights: desc_of(arena, self.weights)?,
            bias: opt_desc_of(arena, self.bias)?,
            output: desc_of(arena, self.output)?,
        })
    }

    fn bind_bias(&self, stage: Stage) -> Stage {
        match self.bias {
            Some(b) => stage.bind(TensorSlot::Aux(0), b),
            None => stage,
        }
    }
}

/// Pick a method from the problem shape and target.
///
/// 3x3 stride-1 f32 convolutions use Winograd and 1x1 stride-1 ones a plain
/// GEMM. On GPU, shallow inputs (fewer than 16 channels) run direct.
pub fn select_convolution_method(
    input: &TensorDescriptor,
    weights: &TensorDescriptor,
    info: &PadStrideInfo,
    target: Target,
) -> Result<ConvolutionMethod> {
    let (_, ifm, kh, kw) = weights.nchw()?;
    let stride = (info.stride_x, info.stride_y);
    let method = if input.require_f32("convolution").is_ok() && winograd::is_supported((kh, kw), stride) {
        ConvolutionMethod::Winograd
    } else if (kh, kw) == (1, 1) && stride == (1, 1) {
        ConvolutionMethod::Gemm
    } else if target == Target::Gpu && ifm < 16 {
        ConvolutionMethod::Direct
    } else {
        ConvolutionMethod::Gemm
    };
    Ok(method)
}

/// Check that `method` can run this convolution.
pub fn validate_convolution(
    method: ConvolutionMethod,
    input: &TensorDescriptor,
    weights: &TensorDescriptor,
    bias: Option<&TensorDescriptor>,
    output: &TensorDescriptor,
    info: &PadStrideInfo,
) -> Result<()> {
    let expected = convolution_output(input, weights, bias, info)?;
    require_same_shape(output, &expected, "convolution")?;
    match method {
        ConvolutionMethod::Winograd => {
            let (_, _, kh, kw) = weights.nchw()?;
            if !winograd::is_supported((kh, kw), (info.stride_x, info.stride_y)) {
                return Err(KilnError::shape(format!(
                    "winograd supports 3x3 stride 1 only, got {kh}x{kw} stride {}x{}",
                    info.stride_x, info.stride_y
                )));
            }
            Ok(())
        }
        ConvolutionMethod::Default | ConvolutionMethod::Direct | ConvolutionMethod::Gemm => Ok(()),
    }
}

/// Build the function for a concrete method. `Default` resolves to GEMM.
pub fn create_convolution(
    method: ConvolutionMethod,
    scheduler: Arc<dyn Scheduler>,
    tensors: ConvolutionTensors,
    info: PadStrideInfo,
) -> Box<dyn Function> {
    match method {
        ConvolutionMethod::Direct => Box::new(DirectConvolutionLayer::new(scheduler, tensors, info)),
        ConvolutionMethod::Winograd => Box::new(WinogradConvolutionLayer::new(scheduler, tensors, info)),
        ConvolutionMethod::Default | ConvolutionMethod::Gemm => {
            Box::new(GemmConvolutionLayer::new(scheduler, tensors, info))
        }
    }
}

/// im2col + GEMM + col2im, with the weights reshaped once in `prepare`.
pub struct GemmConvolutionLayer {
    core: FunctionCore,
    tensors: ConvolutionTensors,
    info: PadStrideInfo,
    padded: Option<TensorHandle>,
    im2col: Option<TensorHandle>,
    gemm_out: Option<TensorHandle>,
    reshaped_weights: Option<TensorHandle>,
}

impl GemmConvolutionLayer {
    pub fn new(scheduler: Arc<dyn Scheduler>, tensors: ConvolutionTensors, info: PadStrideInfo) -> Self {
        Self {
            core: FunctionCore::new("gemm_convolution", scheduler),
            tensors,
            info,
            padded: None,
            im2col: None,
            gemm_out: None,
            reshaped_weights: None,
        }
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, group: &MemoryGroup) -> Result<()> {
        let d = self.tensors.descs(arena)?;
        validate_convolution(ConvolutionMethod::Gemm, &d.input, &d.weights, d.bias.as_ref(), &d.output, &self.info)?;
        let (ofm, _, kh, kw) = d.weights.nchw()?;
        let border = convolution_border(&d.input, &d.output, (kh, kw), &self.info)?;

        let mut stages = Vec::with_capacity(4);
        let (src, src_desc) = pad_input(arena, group, &mut self.padded, self.tensors.input, border, &mut stages)?;

        let stride = (self.info.stride_x, self.info.stride_y);
        let kernel = Size2D::new(kw, kh);
        let ([rows, cols], _) = Im2ColKernel::output_shape(&src_desc, kernel, stride)?;
        let cols_desc = d.input.with_shape([rows, cols]);
        let im2col = scratch_tensor(arena, group, self.im2col, "im2col", cols_desc.clone())?;
        self.im2col = Some(im2col);
        let gemm_desc = d.output.with_shape([rows, ofm]);
        let gemm_out = scratch_tensor(arena, group, self.gemm_out, "gemm_out", gemm_desc.clone())?;
        self.gemm_out = Some(gemm_out);

        let reshaped_desc = d
            .weights
            .with_shape(WeightsReshapeKernel::output_shape(&d.weights)?)
            .with_target(group.target());
        let name = format!("{}/weights_reshaped", group.name());
        let reshaped = persistent_tensor(arena, &name, self.reshaped_weights, reshaped_desc.clone())?;
        self.reshaped_weights = Some(reshaped);

        stages.push(
            Stage::new(Im2ColKernel::configure(&src_desc, &cols_desc, kernel, stride)?.with_border(border))
                .bind(TensorSlot::Src(0), src)
                .bind(TensorSlot::Dst(0), im2col),
        );
        let gemm = GemmKernel::configure(rows, cols, ofm, self.tensors.bias.is_some())?;
        stages.push(
            self.tensors.bind_bias(
                Stage::new(gemm)
                    .bind(TensorSlot::Src(0), im2col)
                    .bind(TensorSlot::Src(1), reshaped)
                    .bind(TensorSlot::Dst(0), gemm_out),
            ),
        );
        stages.push(
            Stage::new(Col2ImKernel::configure(&gemm_desc, &d.output)?)
                .bind(TensorSlot::Src(0), gemm_out)
                .bind(TensorSlot::Dst(0), self.tensors.output),
        );

        let reshape = WeightsReshapeKernel::configure(&d.weights, &reshaped_desc)?;
        self.core.set_prepare_stages(vec![Stage::new(reshape)
            .bind(TensorSlot::Src(0), self.tensors.weights)
            .bind(TensorSlot::Dst(0), reshaped)]);
        self.core.set_stages(stages)?;
        debug!(rows, cols, ofm, padded = !border.is_empty(), "gemm convolution configured");
        Ok(())
    }
}

impl_function!(GemmConvolutionLayer);

/// Sliding-window convolution on a padded copy of the input.
pub struct DirectConvolutionLayer {
    core: FunctionCore,
    tensors: ConvolutionTensors,
    info: PadStrideInfo,
    padded: Option<TensorHandle>,
}

impl DirectConvolutionLayer {
    pub fn new(scheduler: Arc<dyn Scheduler>, tensors: ConvolutionTensors, info: PadStrideInfo) -> Self {
        Self {
            core: FunctionCore::new("direct_convolution", scheduler),
            tensors,
            info,
            padded: None,
        }
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, group: &MemoryGroup) -> Result<()> {
        let d = self.tensors.descs(arena)?;
        validate_convolution(ConvolutionMethod::Direct, &d.input, &d.weights, d.bias.as_ref(), &d.output, &self.info)?;
        let (_, _, kh, kw) = d.weights.nchw()?;
        let border = convolution_border(&d.input, &d.output, (kh, kw), &self.info)?;

        let mut stages = Vec::with_capacity(2);
        let (src, src_desc) = pad_input(arena, group, &mut self.padded, self.tensors.input, border, &mut stages)?;
        let stride = (self.info.stride_x, self.info.stride_y);
        let kernel = DirectConvolutionKernel::configure(&src_desc, &d.weights, &d.output, stride, d.bias.is_some())?
            .with_border(border);
        stages.push(
            self.tensors.bind_bias(
                Stage::new(kernel)
                    .bind(TensorSlot::Src(0), src)
                    .bind(TensorSlot::Src(1), self.tensors.weights)
                    .bind(TensorSlot::Dst(0), self.tensors.output),
            ),
        );
        self.core.set_stages(stages)
    }
}

impl_function!(DirectConvolutionLayer);

/// Winograd F(2x2, 3x3). Filters are transformed once in `prepare`.
pub struct WinogradConvolutionLayer {
    core: FunctionCore,
    tensors: ConvolutionTensors,
    info: PadStrideInfo,
    padded: Option<TensorHandle>,
    transformed_weights: Option<TensorHandle>,
}

impl WinogradConvolutionLayer {
    pub fn new(scheduler: Arc<dyn Scheduler>, tensors: ConvolutionTensors, info: PadStrideInfo) -> Self {
        Self {
            core: FunctionCore::new("winograd_convolution", scheduler),
            tensors,
            info,
            padded: None,
            transformed_weights: None,
        }
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, group: &MemoryGroup) -> Result<()> {
        let d = self.tensors.descs(arena)?;
        validate_convolution(
            ConvolutionMethod::Winograd,
            &d.input,
            &d.weights,
            d.bias.as_ref(),
            &d.output,
            &self.info,
        )?;
        let (_, _, h, w) = d.input.nchw()?;
        // Pad up to whole output tiles.
        let (ph, pw) = WinogradConvolutionKernel::required_padded_hw(&d.output)?;
        let border = BorderSize::new(
            self.info.pad_top,
            pw.saturating_sub(w + self.info.pad_left),
            ph.saturating_sub(h + self.info.pad_top),
            self.info.pad_left,
        );

        let mut stages = Vec::with_capacity(2);
        let (src, src_desc) = pad_input(arena, group, &mut self.padded, self.tensors.input, border, &mut stages)?;

        let transformed_desc = d
            .weights
            .with_shape(WinogradFilterTransformKernel::output_shape(&d.weights)?)
            .with_target(group.target());
        let name = format!("{}/winograd_weights", group.name());
        let transformed = persistent_tensor(arena, &name, self.transformed_weights, transformed_desc.clone())?;
        self.transformed_weights = Some(transformed);

        let kernel = WinogradConvolutionKernel::configure(&src_desc, &transformed_desc, &d.output, d.bias.is_some())?
            .with_border(border);
        stages.push(
            self.tensors.bind_bias(
                Stage::new(kernel)
                    .bind(TensorSlot::Src(0), src)
                    .bind(TensorSlot::Src(1), transformed)
                    .bind(TensorSlot::Dst(0), self.tensors.output),
            ),
        );

        let transform = WinogradFilterTransformKernel::configure(&d.weights, &transformed_desc)?;
        self.core.set_prepare_stages(vec![Stage::new(transform)
            .bind(TensorSlot::Src(0), self.tensors.weights)
            .bind(TensorSlot::Dst(0), transformed)]);
        self.core.set_stages(stages)
    }
}

impl_function!(WinogradConvolutionLayer);

/// Per-channel convolution with a channel multiplier.
pub struct DepthwiseConvolutionLayer {
    core: FunctionCore,
    tensors: ConvolutionTensors,
    info: PadStrideInfo,
    multiplier: usize,
    padded: Option<TensorHandle>,
}

impl DepthwiseConvolutionLayer {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        tensors: ConvolutionTensors,
        info: PadStrideInfo,
        multiplier: usize,
    ) -> Self {
        Self {
            core: FunctionCore::new("depthwise_convolution", scheduler),
            tensors,
            info,
            multiplier,
            padded: None,
        }
    }

    pub fn validate(
        input: &TensorDescriptor,
        weights: &TensorDescriptor,
        bias: Option<&TensorDescriptor>,
        output: &TensorDescriptor,
        info: &PadStrideInfo,
        multiplier: usize,
    ) -> Result<()> {
        let expected = depthwise_output(input, weights, bias, info, multiplier)?;
        require_same_shape(output, &expected, "depthwise convolution")
    }

    fn configure_stages(&mut self, arena: &mut TensorArena, group: &MemoryGroup) -> Result<()> {
        let d = self.tensors.descs(arena)?;
        Self::validate(&d.input, &d.weights, d.bias.as_ref(), &d.output, &self.info, self.multiplier)?;
        let (_, _, kh, kw) = d.weights.nchw()?;
        let border = convolution_border(&d.input, &d.output, (kh, kw), &self.info)?;

        let mut stages = Vec::with_capacity(2);
        let (src, src_desc) = pad_input(arena, group, &mut self.padded, self.tensors.input, border, &mut stages)?;
        let stride = (self.info.stride_x, self.info.stride_y);
        let kernel = DepthwiseConvolutionKernel::configure(
            &src_desc,
            &d.weights,
            &d.output,
            stride,
            self.multiplier,
            d.bias.is_some(),
        )?
        .with_border(border);
        stages.push(
            self.tensors.bind_bias(
                Stage::new(kernel)
                    .bind(TensorSlot::Src(0), src)
                    .bind(TensorSlot::Src(1), self.tensors.weights)
                    .bind(TensorSlot::Dst(0), self.tensors.output),
            ),
        );
        self.core.set_stages(stages)
    }
}

impl_function!(DepthwiseConvolutionLayer);

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::test_util::assert_close;
    use kiln_core::DataType;
    use kiln_memory::{Interval, MemoryAffinity, MemoryManager};
    use kiln_runtime::{CpuScheduler, FunctionState, RunContext};

    struct Fixture {
        arena: TensorArena,
        mm: Arc<MemoryManager>,
        group: MemoryGroup,
        tensors: ConvolutionTensors,
    }

    /// NHWC input `h x w x c`, `ofm` filters of `k x k`, random data.
    fn fixture(h: usize, w: usize, c: usize, ofm: usize, k: usize, info: &PadStrideInfo, seed: u64) -> Fixture {
        let mut rng = StdRng::seed_from_u64(seed);
        let mm = Arc::new(MemoryManager::new(Target::Cpu, MemoryAffinity::Blob));
        let group = MemoryGroup::new(Arc::clone(&mm), "conv", Interval::at(0));
        let mut arena = TensorArena::new();

        let input_desc = TensorDescriptor::new([1, h, w, c], DataType::F32);
        let weights_desc = TensorDescriptor::new([ofm, k, k, c], DataType::F32);
        let bias_desc = TensorDescriptor::new([ofm], DataType::F32);
        let output_desc = convolution_output(&input_desc, &weights_desc, Some(&bias_desc), info).unwrap();

        let mut add = |name: &str, desc: TensorDescriptor, random: bool| {
            let n = desc.shape.numel();
            let handle = arena.add(name, desc);
            arena.bind_owned(handle).unwrap();
            if random {
                let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
                arena.view(handle).unwrap().copy_from_f32(&data).unwrap();
            }
            handle
        };
        let tensors = ConvolutionTensors {
            input: add("input", input_desc, true),
            weights: add("weights", weights_desc, true),
            bias: Some(add("bias", bias_desc, true)),
            output: add("output", output_desc, false),
        };
        Fixture { arena, mm, group, tensors }
    }

    fn run_method(method: ConvolutionMethod, info: PadStrideInfo, seed: u64) -> Vec<f32> {
        let mut fx = fixture(6, 5, 3, 4, 3, &info, seed);
        let sched: Arc<dyn Scheduler> = Arc::new(CpuScheduler::new(3).unwrap());
        let mut f = create_convolution(method, sched, fx.tensors, info);
        f.configure(&mut fx.arena, &fx.group).unwrap();
        fx.mm.finalize().unwrap();
        let ctx = RunContext::new(&fx.arena, 0);
        f.run(&ctx).unwrap();
        assert_eq!(f.state(), FunctionState::Prepared);
        fx.arena.view(fx.tensors.output).unwrap().to_vec_f32()
    }

    #[test]
    fn test_methods_agree() {
        for info in [PadStrideInfo::new(1, 1, 0, 0), PadStrideInfo::new(1, 1, 1, 1)] {
            let gemm = run_method(ConvolutionMethod::Gemm, info, 11);
            let direct = run_method(ConvolutionMethod::Direct, info, 11);
            let winograd = run_method(ConvolutionMethod::Winograd, info, 11);
            assert_close(&direct, &gemm, 1e-4);
            assert_close(&winograd, &gemm, 1e-4);
        }
    }

    #[test]
    fn test_strided_gemm_matches_direct() {
        let info = PadStrideInfo::new(2, 2, 1, 1);
        let gemm = run_method(ConvolutionMethod::Gemm, info, 5);
        let direct = run_method(ConvolutionMethod::Direct, info, 5);
        assert_close(&direct, &gemm, 1e-4);
    }

    #[test]
    fn test_method_heuristic() {
        let input = TensorDescriptor::new([1, 28, 28, 1], DataType::F32);
        let w3 = TensorDescriptor::new([8, 3, 3, 1], DataType::F32);
        let w1 = TensorDescriptor::new([8, 1, 1, 1], DataType::F32);
        let w5 = TensorDescriptor::new([20, 5, 5, 1], DataType::F32);
        let s1 = PadStrideInfo::new(1, 1, 0, 0);
        let s2 = PadStrideInfo::new(2, 2, 0, 0);
        let pick = |w: &TensorDescriptor, info: &PadStrideInfo, target| {
            select_convolution_method(&input, w, info, target).unwrap()
        };
        assert_eq!(pick(&w3, &s1, Target::Cpu), ConvolutionMethod::Winograd);
        assert_eq!(pick(&w1, &s1, Target::Cpu), ConvolutionMethod::Gemm);
        assert_eq!(pick(&w5, &s1, Target::Cpu), ConvolutionMethod::Gemm);
        assert_eq!(pick(&w5, &s1, Target::Gpu), ConvolutionMethod::Direct);
        assert_eq!(pick(&w3, &s2, Target::Gpu), ConvolutionMethod::Direct);
    }

    #[test]
    fn test_winograd_rejects_stride() {
        let info = PadStrideInfo::new(2, 2, 1, 1);
        let fx = fixture(6, 6, 2, 2, 3, &info, 1);
        let d = fx.tensors.descs(&fx.arena).unwrap();
        let err = validate_convolution(
            ConvolutionMethod::Winograd,
            &d.input,
            &d.weights,
            d.bias.as_ref(),
            &d.output,
            &info,
        )
        .unwrap_err();
        assert!(err.is_shape());
    }

    #[test]
    fn test_reconfigure_is_idempotent() {
        let info = PadStrideInfo::new(1, 1, 2, 2);
        let mut fx = fixture(8, 8, 2, 3, 5, &info, 3);
        let sched: Arc<dyn Scheduler> = Arc::new(CpuScheduler::new(2).unwrap());
        let mut f = GemmConvolutionLayer::new(sched, fx.tensors, info);
        f.configure(&mut fx.arena, &fx.group).unwrap();
        fx.mm.finalize().unwrap();
        let windows = f.windows();
        let regions: Vec<_> = fx
            .group
            .allocations()
            .into_iter()
            .map(|(key, id)| (key, fx.mm.region(id).unwrap().offset))
            .collect();

        f.configure(&mut fx.arena, &fx.group).unwrap();
        assert_eq!(f.windows(), windows);
        assert!(!fx.mm.needs_refinalize());
        let again: Vec<_> = fx
            .group
            .allocations()
            .into_iter()
            .map(|(key, id)| (key, fx.mm.region(id).unwrap().offset))
            .collect();
        assert_eq!(again, regions);
        assert_eq!(f.state(), FunctionState::Configured);
    }

    #[test]
    fn test_depthwise() {
        let mm = Arc::new(MemoryManager::new(Target::Cpu, MemoryAffinity::Blob));
        let group = MemoryGroup::new(Arc::clone(&mm), "dw", Interval::at(0));
        let mut arena = TensorArena::new();
        let mut add = |name: &str, shape: &[usize], data: &[f32]| {
            let h = arena.add(name, TensorDescriptor::new(shape, DataType::F32));
            arena.bind_owned(h).unwrap();
            arena.view(h).unwrap().copy_from_f32(data).unwrap();
            h
        };
        // 2x2 input with channels (1, 10), 3x3 box filter with pad 1.
        let tensors = ConvolutionTensors {
            input: add("x", &[1, 2, 2, 2], &[1.0, 10.0, 1.0, 10.0, 1.0, 10.0, 1.0, 10.0]),
            weights: add("w", &[1, 3, 3, 2], &[1.0; 18]),
            bias: None,
            output: add("y", &[1, 2, 2, 2], &[0.0; 8]),
        };
        let sched: Arc<dyn Scheduler> = Arc::new(CpuScheduler::new(2).unwrap());
        let mut f = DepthwiseConvolutionLayer::new(sched, tensors, PadStrideInfo::new(1, 1, 1, 1), 1);
        f.configure(&mut arena, &group).unwrap();
        mm.finalize().unwrap();
        f.run(&RunContext::new(&arena, 0)).unwrap();
        assert_eq!(
            arena.view(tensors.output).unwrap().to_vec_f32(),
            vec![4.0, 40.0, 4.0, 40.0, 4.0, 40.0, 4.0, 40.0]
        );
    }

    /// Bordered stages in execution order, as (kernel name, border).
    fn bordered(core: &FunctionCore) -> Vec<(String, BorderSize)> {
        core.stages()
            .iter()
            .filter(|s| !s.kernel.border_size().is_empty())
            .map(|s| (s.kernel.name().to_string(), s.kernel.border_size()))
            .collect()
    }

    #[test]
    fn test_kernels_declare_border() {
        let info = PadStrideInfo::new(1, 1, 1, 1);
        let sched: Arc<dyn Scheduler> = Arc::new(CpuScheduler::new(1).unwrap());

        let mut fx = fixture(6, 5, 3, 4, 3, &info, 2);
        let mut gemm = GemmConvolutionLayer::new(Arc::clone(&sched), fx.tensors, info);
        gemm.configure(&mut fx.arena, &fx.group).unwrap();
        assert_eq!(gemm.core.stages()[0].kernel.name(), "fill_border");
        assert_eq!(bordered(&gemm.core), vec![("im2col".to_string(), BorderSize::uniform(1))]);

        let mut fx = fixture(6, 5, 3, 4, 3, &info, 2);
        let mut direct = DirectConvolutionLayer::new(Arc::clone(&sched), fx.tensors, info);
        direct.configure(&mut fx.arena, &fx.group).unwrap();
        assert_eq!(direct.core.stages()[0].kernel.name(), "fill_border");
        assert_eq!(
            bordered(&direct.core),
            vec![("direct_convolution".to_string(), BorderSize::uniform(1))]
        );

        // Whole 2x2 tiles over a 6x5 output need one extra column.
        let mut fx = fixture(6, 5, 3, 4, 3, &info, 2);
        let mut winograd = WinogradConvolutionLayer::new(Arc::clone(&sched), fx.tensors, info);
        winograd.configure(&mut fx.arena, &fx.group).unwrap();
        assert_eq!(winograd.core.stages()[0].kernel.name(), "fill_border");
        assert_eq!(
            bordered(&winograd.core),
            vec![("winograd_convolution".to_string(), BorderSize::new(1, 2, 1, 1))]
        );

        let unpadded = PadStrideInfo::new(1, 1, 0, 0);
        let mut fx = fixture(6, 5, 3, 4, 3, &unpadded, 2);
        let mut direct = DirectConvolutionLayer::new(sched, fx.tensors, unpadded);
        direct.configure(&mut fx.arena, &fx.group).unwrap();
        assert_eq!(direct.core.stages().len(), 1);
        assert!(bordered(&direct.core).is_empty());
    }
}
