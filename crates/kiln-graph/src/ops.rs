//! Per-kind operations: shape propagation and function instantiation.
//!
//! Every [`NodeType`] maps to one [`NodeOps`] entry. The match in
//! [`node_ops`] is exhaustive, so a new node kind does not compile until
//! it has both rules.

use std::sync::Arc;

use tracing::warn;

use kiln_core::{ConvolutionMethod, KilnError, Result, Target, TensorDescriptor};
use kiln_kernels::functions::{
    create_convolution, select_convolution_method, validate_convolution, ActivationLayer, BatchNormParams,
    BatchNormalizationLayer, ConcatenateLayer, ConvolutionTensors, DepthwiseConvolutionLayer, ElementwiseLayer,
    FullyConnectedLayer, NormalizationLayer, PoolingLayer, ReshapeLayer, SoftmaxLayer,
};
use kiln_kernels::normalization::BatchNormalizationKernel;
use kiln_kernels::shapes;
use kiln_memory::TensorHandle;
use kiln_runtime::{Function, Scheduler};

use crate::config::MethodHintPolicy;
use crate::node::{NodeKind, NodeType};

pub(crate) type PropagateFn = fn(&NodeKind, &[&TensorDescriptor]) -> Result<Vec<TensorDescriptor>>;
pub(crate) type InstantiateFn = fn(&NodeKind, &InstantiateArgs<'_>) -> Result<Instantiated>;

/// Rules of one node kind. Kinds without `instantiate` produce no task.
pub(crate) struct NodeOps {
    pub propagate: PropagateFn,
    pub instantiate: Option<InstantiateFn>,
}

/// Everything a node needs to build its function.
pub(crate) struct InstantiateArgs<'a> {
    pub scheduler: Arc<dyn Scheduler>,
    pub target: Target,
    pub inputs: &'a [TensorHandle],
    pub input_descs: &'a [TensorDescriptor],
    pub output: TensorHandle,
    pub output_desc: &'a TensorDescriptor,
    pub policy: MethodHintPolicy,
}

pub(crate) struct Instantiated {
    pub function: Box<dyn Function>,
    /// Convolution method actually used.
    pub method: Option<ConvolutionMethod>,
}

impl Instantiated {
    fn plain(function: impl Function + 'static) -> Self {
        Self {
            function: Box::new(function),
            method: None,
        }
    }
}

pub(crate) fn node_ops(ty: NodeType) -> &'static NodeOps {
    match ty {
        NodeType::Input | NodeType::Const => &SOURCE,
        NodeType::Output => &OUTPUT,
        NodeType::Convolution => &CONVOLUTION,
        NodeType::DepthwiseConvolution => &DEPTHWISE,
        NodeType::Activation => &ACTIVATION,
        NodeType::Pooling => &POOLING,
        NodeType::Concat => &CONCAT,
        NodeType::Elementwise => &ELEMENTWISE,
        NodeType::Reshape | NodeType::Flatten => &RESHAPE,
        NodeType::Softmax => &SOFTMAX,
        NodeType::Normalization => &NORMALIZATION,
        NodeType::BatchNormalization => &BATCH_NORMALIZATION,
        NodeType::FullyConnected => &FULLY_CONNECTED,
    }
}

/// Output descriptors of `kind` given its input descriptors.
pub(crate) fn propagate(kind: &NodeKind, inputs: &[&TensorDescriptor]) -> Result<Vec<TensorDescriptor>> {
    (node_ops(kind.node_type()).propagate)(kind, inputs)
}

fn mismatch(kind: &NodeKind) -> KilnError {
    KilnError::usage(format!("{} rules applied to another node kind", kind.node_type()))
}

fn input<'a>(inputs: &[&'a TensorDescriptor], i: usize) -> Result<&'a TensorDescriptor> {
    inputs
        .get(i)
        .copied()
        .ok_or_else(|| KilnError::shape(format!("missing input descriptor {i}")))
}

fn handle(args: &InstantiateArgs<'_>, i: usize) -> Result<TensorHandle> {
    args.inputs
        .get(i)
        .copied()
        .ok_or_else(|| KilnError::shape(format!("missing input tensor {i}")))
}

// ---------------------------------------------------------------------------
// Sources and sinks
// ---------------------------------------------------------------------------

static SOURCE: NodeOps = NodeOps {
    propagate: |kind, _| match kind {
        NodeKind::Input { desc } | NodeKind::Const { desc } => Ok(vec![desc.clone()]),
        other => Err(mismatch(other)),
    },
    instantiate: None,
};

static OUTPUT: NodeOps = NodeOps {
    propagate: |_, inputs| {
        input(inputs, 0)?;
        Ok(Vec::new())
    },
    instantiate: None,
};

// ---------------------------------------------------------------------------
// Convolutions
// ---------------------------------------------------------------------------

static CONVOLUTION: NodeOps = NodeOps {
    propagate: |kind, inputs| match kind {
        NodeKind::Convolution { info, .. } => Ok(vec![shapes::convolution_output(
            input(inputs, 0)?,
            input(inputs, 1)?,
            inputs.get(2).copied(),
            info,
        )?]),
        other => Err(mismatch(other)),
    },
    instantiate: Some(instantiate_convolution),
};

fn conv_tensors(args: &InstantiateArgs<'_>) -> Result<ConvolutionTensors> {
    Ok(ConvolutionTensors {
        input: handle(args, 0)?,
        weights: handle(args, 1)?,
        bias: args.inputs.get(2).copied(),
        output: args.output,
    })
}

/// Resolve the method of a convolution node.
///
/// A hint that cannot run the node falls back to the heuristic or fails,
/// depending on `policy`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn resolve_method(
    hint: ConvolutionMethod,
    input: &TensorDescriptor,
    weights: &TensorDescriptor,
    bias: Option<&TensorDescriptor>,
    output: &TensorDescriptor,
    info: &kiln_core::PadStrideInfo,
    target: Target,
    policy: MethodHintPolicy,
) -> Result<ConvolutionMethod> {
    let heuristic = select_convolution_method(input, weights, info, target)?;
    if hint == ConvolutionMethod::Default || hint == heuristic {
        validate_convolution(heuristic, input, weights, bias, output, info)?;
        return Ok(heuristic);
    }
    match validate_convolution(hint, input, weights, bias, output, info) {
        Ok(()) => Ok(hint),
        Err(e) if policy == MethodHintPolicy::Strict => Err(e),
        Err(e) => {
            warn!(%hint, fallback = %heuristic, error = %e, "method hint rejected, using heuristic");
            validate_convolution(heuristic, input, weights, bias, output, info)?;
            Ok(heuristic)
        }
    }
}

fn instantiate_convolution(kind: &NodeKind, args: &InstantiateArgs<'_>) -> Result<Instantiated> {
    let NodeKind::Convolution { info, method } = kind else {
        return Err(mismatch(kind));
    };
    let descs = args.input_descs;
    let (input, weights) = match descs {
        [input, weights, ..] => (input, weights),
        _ => return Err(KilnError::shape("convolution needs input and weights")),
    };
    let method = resolve_method(
        *method,
        input,
        weights,
        descs.get(2),
        args.output_desc,
        info,
        args.target,
        args.policy,
    )?;
    let function = create_convolution(method, Arc::clone(&args.scheduler), conv_tensors(args)?, *info);
    Ok(Instantiated {
        function,
        method: Some(method),
    })
}

static DEPTHWISE: NodeOps = NodeOps {
    propagate: |kind, inputs| match kind {
        NodeKind::DepthwiseConvolution { info, multiplier } => Ok(vec![shapes::depthwise_output(
            input(inputs, 0)?,
            input(inputs, 1)?,
            inputs.get(2).copied(),
            info,
            *multiplier,
        )?]),
        other => Err(mismatch(other)),
    },
    instantiate: Some(|kind, args| match kind {
        NodeKind::DepthwiseConvolution { info, multiplier } => Ok(Instantiated::plain(DepthwiseConvolutionLayer::new(
            Arc::clone(&args.scheduler),
            conv_tensors(args)?,
            *info,
            *multiplier,
        ))),
        other => Err(mismatch(other)),
    }),
};

static FULLY_CONNECTED: NodeOps = NodeOps {
    propagate: |_, inputs| {
        Ok(vec![shapes::fully_connected_output(
            input(inputs, 0)?,
            input(inputs, 1)?,
            inputs.get(2).copied(),
        )?])
    },
    instantiate: Some(|_, args| {
        Ok(Instantiated::plain(FullyConnectedLayer::new(
            Arc::clone(&args.scheduler),
            handle(args, 0)?,
            handle(args, 1)?,
            args.inputs.get(2).copied(),
            args.output,
        )))
    }),
};

// ---------------------------------------------------------------------------
// Elementwise and reductions
// ---------------------------------------------------------------------------

static ACTIVATION: NodeOps = NodeOps {
    propagate: |_, inputs| Ok(vec![input(inputs, 0)?.clone()]),
    instantiate: Some(|kind, args| match kind {
        NodeKind::Activation { info } => Ok(Instantiated::plain(ActivationLayer::new(
            Arc::clone(&args.scheduler),
            handle(args, 0)?,
            args.output,
            *info,
        ))),
        other => Err(mismatch(other)),
    }),
};

static POOLING: NodeOps = NodeOps {
    propagate: |kind, inputs| match kind {
        NodeKind::Pooling { info } => Ok(vec![shapes::pooling_output(input(inputs, 0)?, info)?]),
        other => Err(mismatch(other)),
    },
    instantiate: Some(|kind, args| match kind {
        NodeKind::Pooling { info } => Ok(Instantiated::plain(PoolingLayer::new(
            Arc::clone(&args.scheduler),
            handle(args, 0)?,
            args.output,
            *info,
        ))),
        other => Err(mismatch(other)),
    }),
};

static ELEMENTWISE: NodeOps = NodeOps {
    propagate: |_, inputs| Ok(vec![shapes::elementwise_output(input(inputs, 0)?, input(inputs, 1)?)?]),
    instantiate: Some(|kind, args| match kind {
        NodeKind::Elementwise { op } => Ok(Instantiated::plain(ElementwiseLayer::new(
            Arc::clone(&args.scheduler),
            [handle(args, 0)?, handle(args, 1)?],
            args.output,
            *op,
        ))),
        other => Err(mismatch(other)),
    }),
};

static SOFTMAX: NodeOps = NodeOps {
    propagate: |_, inputs| {
        let src = input(inputs, 0)?;
        SoftmaxLayer::validate(src, src)?;
        Ok(vec![src.clone()])
    },
    instantiate: Some(|kind, args| match kind {
        NodeKind::Softmax { beta } => Ok(Instantiated::plain(SoftmaxLayer::new(
            Arc::clone(&args.scheduler),
            handle(args, 0)?,
            args.output,
            *beta,
        ))),
        other => Err(mismatch(other)),
    }),
};

static NORMALIZATION: NodeOps = NodeOps {
    propagate: |kind, inputs| match kind {
        NodeKind::Normalization { info } => {
            let src = input(inputs, 0)?;
            NormalizationLayer::validate(src, src, info)?;
            Ok(vec![src.clone()])
        }
        other => Err(mismatch(other)),
    },
    instantiate: Some(|kind, args| match kind {
        NodeKind::Normalization { info } => Ok(Instantiated::plain(NormalizationLayer::new(
            Arc::clone(&args.scheduler),
            handle(args, 0)?,
            args.output,
            *info,
        ))),
        other => Err(mismatch(other)),
    }),
};

/// Positions of beta / gamma among the inputs `[input, mean, var, beta?, gamma?]`.
fn batch_norm_slots(has_beta: bool, has_gamma: bool) -> (Option<usize>, Option<usize>) {
    let beta = has_beta.then_some(3);
    let gamma = has_gamma.then_some(3 + has_beta as usize);
    (beta, gamma)
}

static BATCH_NORMALIZATION: NodeOps = NodeOps {
    propagate: |kind, inputs| match kind {
        NodeKind::BatchNormalization { has_beta, has_gamma, .. } => {
            let src = input(inputs, 0)?;
            let (beta, gamma) = batch_norm_slots(*has_beta, *has_gamma);
            let params = [
                Some(input(inputs, 1)?),
                Some(input(inputs, 2)?),
                beta.map(|i| input(inputs, i)).transpose()?,
                gamma.map(|i| input(inputs, i)).transpose()?,
            ];
            BatchNormalizationKernel::validate(src, src, &params)?;
            Ok(vec![src.clone()])
        }
        other => Err(mismatch(other)),
    },
    instantiate: Some(|kind, args| match kind {
        NodeKind::BatchNormalization {
            epsilon,
            activation,
            has_beta,
            has_gamma,
        } => {
            let (beta, gamma) = batch_norm_slots(*has_beta, *has_gamma);
            let params = BatchNormParams {
                mean: handle(args, 1)?,
                var: handle(args, 2)?,
                beta: beta.map(|i| handle(args, i)).transpose()?,
                gamma: gamma.map(|i| handle(args, i)).transpose()?,
            };
            Ok(Instantiated::plain(BatchNormalizationLayer::new(
                Arc::clone(&args.scheduler),
                handle(args, 0)?,
                args.output,
                params,
                *epsilon,
                *activation,
            )))
        }
        other => Err(mismatch(other)),
    }),
};

// ---------------------------------------------------------------------------
// Data movement
// ---------------------------------------------------------------------------

static CONCAT: NodeOps = NodeOps {
    propagate: |kind, inputs| match kind {
        NodeKind::Concat { axis } => Ok(vec![shapes::concat_output(inputs, *axis)?]),
        other => Err(mismatch(other)),
    },
    instantiate: Some(|kind, args| match kind {
        NodeKind::Concat { axis } => Ok(Instantiated::plain(ConcatenateLayer::new(
            Arc::clone(&args.scheduler),
            args.inputs.to_vec(),
            args.output,
            *axis,
        ))),
        other => Err(mismatch(other)),
    }),
};

static RESHAPE: NodeOps = NodeOps {
    propagate: |kind, inputs| {
        let src = input(inputs, 0)?;
        match kind {
            NodeKind::Reshape { shape } => Ok(vec![shapes::reshape_output(src, shape)?]),
            NodeKind::Flatten => Ok(vec![shapes::flatten_output(src)?]),
            other => Err(mismatch(other)),
        }
    },
    instantiate: Some(|_, args| {
        Ok(Instantiated::plain(ReshapeLayer::new(
            Arc::clone(&args.scheduler),
            handle(args, 0)?,
            args.output,
        )))
    }),
};

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{DataType, PadStrideInfo, PoolingInfo, PoolingType};

    fn f32_desc(shape: &[usize]) -> TensorDescriptor {
        TensorDescriptor::new(shape, DataType::F32)
    }

    #[test]
    fn test_convolution_then_pooling_shapes() {
        let input = f32_desc(&[1, 28, 28, 1]);
        let weights = f32_desc(&[20, 5, 5, 1]);
        let conv = NodeKind::Convolution {
            info: PadStrideInfo::new(1, 1, 0, 0),
            method: ConvolutionMethod::Default,
        };
        let out = propagate(&conv, &[&input, &weights]).unwrap();
        assert_eq!(out[0].shape.dims(), &[1, 24, 24, 20]);

        let pool = NodeKind::Pooling {
            info: PoolingInfo::new(PoolingType::Max, 2, PadStrideInfo::new(2, 2, 0, 0)),
        };
        let out = propagate(&pool, &[&out[0]]).unwrap();
        assert_eq!(out[0].shape.dims(), &[1, 12, 12, 20]);
    }

    #[test]
    fn test_batch_norm_slots() {
        assert_eq!(batch_norm_slots(true, true), (Some(3), Some(4)));
        assert_eq!(batch_norm_slots(false, true), (None, Some(3)));
        assert_eq!(batch_norm_slots(false, false), (None, None));
    }

    #[test]
    fn test_missing_input_is_shape_error() {
        let err = propagate(&NodeKind::Flatten, &[]).unwrap_err();
        assert!(err.is_shape());
    }

    #[test]
    fn test_every_type_has_rules() {
        let kinds = [NodeType::Input, NodeType::Output, NodeType::Const];
        for ty in kinds {
            assert!(node_ops(ty).instantiate.is_none());
        }
        assert!(node_ops(NodeType::Flatten).instantiate.is_some());
    }

    #[test]
    fn test_hint_policy() {
        let input = f32_desc(&[1, 8, 8, 2]);
        let weights = f32_desc(&[4, 3, 3, 2]);
        let info = PadStrideInfo::new(2, 2, 0, 0);
        let output = shapes::convolution_output(&input, &weights, None, &info).unwrap();
        let resolve = |policy| {
            resolve_method(
                ConvolutionMethod::Winograd,
                &input,
                &weights,
                None,
                &output,
                &info,
                Target::Cpu,
                policy,
            )
        };
        assert_eq!(resolve(MethodHintPolicy::Fallback).unwrap(), ConvolutionMethod::Gemm);
        assert!(resolve(MethodHintPolicy::Strict).unwrap_err().is_shape());
    }
}
