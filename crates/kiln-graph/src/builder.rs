//! Graph construction: one `add_<kind>_node` function per node kind.
//!
//! Every function validates connectivity only and returns the new node's id.
//! On error the graph may already hold nodes created by the call (weights
//! constants, for instance); callers discard the graph.

use kiln_core::{
    ActivationInfo, ConvolutionMethod, DataLayoutDimension, EltwiseOperation, KilnError, NormalizationInfo,
    PadStrideInfo, PoolingInfo, Result, Size2D, TensorDescriptor,
};
use kiln_kernels::shapes::{flat_rows, with_nchw};

use crate::accessor::Accessor;
use crate::graph::Graph;
use crate::node::{NodeId, NodeKind, NodeOutput, NodeParams};

pub type BoxedAccessor = Option<Box<dyn Accessor>>;

fn known_desc(graph: &Graph, input: NodeOutput, what: &str) -> Result<TensorDescriptor> {
    graph.output_desc(input).cloned().ok_or_else(|| {
        KilnError::structural(format!(
            "{what}: descriptor of input {}:{} is unknown",
            input.node, input.index
        ))
    })
}

fn add_const(
    graph: &mut Graph,
    params: &NodeParams,
    suffix: &str,
    desc: TensorDescriptor,
    accessor: BoxedAccessor,
) -> Result<NodeId> {
    let const_params = NodeParams {
        name: format!("{}/{suffix}", params.name),
        target: params.target,
    };
    graph.add_node(NodeKind::Const { desc }, const_params, &[], accessor)
}

pub fn add_input_node(
    graph: &mut Graph,
    params: NodeParams,
    desc: TensorDescriptor,
    accessor: BoxedAccessor,
) -> Result<NodeId> {
    graph.add_node(NodeKind::Input { desc }, params, &[], accessor)
}

pub fn add_const_node(
    graph: &mut Graph,
    params: NodeParams,
    desc: TensorDescriptor,
    accessor: BoxedAccessor,
) -> Result<NodeId> {
    graph.add_node(NodeKind::Const { desc }, params, &[], accessor)
}

pub fn add_output_node(
    graph: &mut Graph,
    params: NodeParams,
    input: NodeOutput,
    accessor: BoxedAccessor,
) -> Result<NodeId> {
    graph.add_node(NodeKind::Output, params, &[input], accessor)
}

/// Convolution with `num_filters` filters of size `kernel`.
///
/// Creates const nodes for the weights, and for the bias when
/// `bias_accessor` is given.
#[allow(clippy::too_many_arguments)]
pub fn add_convolution_node(
    graph: &mut Graph,
    params: NodeParams,
    input: NodeOutput,
    kernel: Size2D,
    num_filters: usize,
    info: PadStrideInfo,
    method: ConvolutionMethod,
    weights_accessor: BoxedAccessor,
    bias_accessor: BoxedAccessor,
) -> Result<NodeId> {
    let input_desc = known_desc(graph, input, "convolution")?;
    let ifm = input_desc
        .dimension(DataLayoutDimension::Channel)
        .map_err(|e| KilnError::structural(e.to_string()))?;
    let weights_desc = with_nchw(&input_desc, num_filters, ifm, kernel.height, kernel.width);
    let weights = add_const(graph, &params, "weights", weights_desc, weights_accessor)?;

    let mut inputs = vec![input, weights.into()];
    if bias_accessor.is_some() {
        let bias = add_const(graph, &params, "bias", input_desc.with_shape([num_filters]), bias_accessor)?;
        inputs.push(bias.into());
    }
    graph.add_node(NodeKind::Convolution { info, method }, params, &inputs, None)
}

#[allow(clippy::too_many_arguments)]
pub fn add_depthwise_convolution_node(
    graph: &mut Graph,
    params: NodeParams,
    input: NodeOutput,
    kernel: Size2D,
    multiplier: usize,
    info: PadStrideInfo,
    weights_accessor: BoxedAccessor,
    bias_accessor: BoxedAccessor,
) -> Result<NodeId> {
    let input_desc = known_desc(graph, input, "depthwise convolution")?;
    let channels = input_desc
        .dimension(DataLayoutDimension::Channel)
        .map_err(|e| KilnError::structural(e.to_string()))?
        * multiplier;
    let weights_desc = with_nchw(&input_desc, 1, channels, kernel.height, kernel.width);
    let weights = add_const(graph, &params, "weights", weights_desc, weights_accessor)?;

    let mut inputs = vec![input, weights.into()];
    if bias_accessor.is_some() {
        let bias = add_const(graph, &params, "bias", input_desc.with_shape([channels]), bias_accessor)?;
        inputs.push(bias.into());
    }
    graph.add_node(
        NodeKind::DepthwiseConvolution { info, multiplier },
        params,
        &inputs,
        None,
    )
}

/// Fully connected layer producing `num_outputs` features per batch item.
pub fn add_fully_connected_node(
    graph: &mut Graph,
    params: NodeParams,
    input: NodeOutput,
    num_outputs: usize,
    weights_accessor: BoxedAccessor,
    bias_accessor: BoxedAccessor,
) -> Result<NodeId> {
    let input_desc = known_desc(graph, input, "fully connected")?;
    let (_, k) = flat_rows(&input_desc).map_err(|e| KilnError::structural(e.to_string()))?;
    let weights = add_const(
        graph,
        &params,
        "weights",
        input_desc.with_shape([k, num_outputs]),
        weights_accessor,
    )?;
    let mut inputs = vec![input, weights.into()];
    if bias_accessor.is_some() {
        let bias = add_const(graph, &params, "bias", input_desc.with_shape([num_outputs]), bias_accessor)?;
        inputs.push(bias.into());
    }
    graph.add_node(NodeKind::FullyConnected, params, &inputs, None)
}

/// Per-channel accessors of a batch normalization; beta and gamma are optional.
pub struct BatchNormAccessors {
    pub mean: BoxedAccessor,
    pub var: BoxedAccessor,
    pub beta: BoxedAccessor,
    pub gamma: BoxedAccessor,
}

pub fn add_batch_normalization_node(
    graph: &mut Graph,
    params: NodeParams,
    input: NodeOutput,
    epsilon: f32,
    accessors: BatchNormAccessors,
    activation: Option<ActivationInfo>,
) -> Result<NodeId> {
    let input_desc = known_desc(graph, input, "batch normalization")?;
    let channels = input_desc
        .dimension(DataLayoutDimension::Channel)
        .map_err(|e| KilnError::structural(e.to_string()))?;
    let param_desc = input_desc.with_shape([channels]);

    let has_beta = accessors.beta.is_some();
    let has_gamma = accessors.gamma.is_some();
    let mut inputs = vec![input];
    let named = [
        ("mean", Some(accessors.mean)),
        ("var", Some(accessors.var)),
        ("beta", has_beta.then_some(accessors.beta)),
        ("gamma", has_gamma.then_some(accessors.gamma)),
    ];
    for (suffix, accessor) in named {
        if let Some(accessor) = accessor {
            inputs.push(add_const(graph, &params, suffix, param_desc.clone(), accessor)?.into());
        }
    }
    graph.add_node(
        NodeKind::BatchNormalization {
            epsilon,
            activation,
            has_beta,
            has_gamma,
        },
        params,
        &inputs,
        None,
    )
}

pub fn add_activation_node(
    graph: &mut Graph,
    params: NodeParams,
    input: NodeOutput,
    info: ActivationInfo,
) -> Result<NodeId> {
    graph.add_node(NodeKind::Activation { info }, params, &[input], None)
}

pub fn add_pooling_node(graph: &mut Graph, params: NodeParams, input: NodeOutput, info: PoolingInfo) -> Result<NodeId> {
    graph.add_node(NodeKind::Pooling { info }, params, &[input], None)
}

pub fn add_concat_node(
    graph: &mut Graph,
    params: NodeParams,
    inputs: &[NodeOutput],
    axis: DataLayoutDimension,
) -> Result<NodeId> {
    graph.add_node(NodeKind::Concat { axis }, params, inputs, None)
}

pub fn add_elementwise_node(
    graph: &mut Graph,
    params: NodeParams,
    a: NodeOutput,
    b: NodeOutput,
    op: EltwiseOperation,
) -> Result<NodeId> {
    graph.add_node(NodeKind::Elementwise { op }, params, &[a, b], None)
}

/// Reshape to `shape`; one entry may be `-1`.
pub fn add_reshape_node(graph: &mut Graph, params: NodeParams, input: NodeOutput, shape: &[isize]) -> Result<NodeId> {
    graph.add_node(
        NodeKind::Reshape {
            shape: shape.to_vec(),
        },
        params,
        &[input],
        None,
    )
}

pub fn add_flatten_node(graph: &mut Graph, params: NodeParams, input: NodeOutput) -> Result<NodeId> {
    graph.add_node(NodeKind::Flatten, params, &[input], None)
}

pub fn add_softmax_node(graph: &mut Graph, params: NodeParams, input: NodeOutput, beta: f32) -> Result<NodeId> {
    graph.add_node(NodeKind::Softmax { beta }, params, &[input], None)
}

pub fn add_normalization_node(
    graph: &mut Graph,
    params: NodeParams,
    input: NodeOutput,
    info: NormalizationInfo,
) -> Result<NodeId> {
    graph.add_node(NodeKind::Normalization { info }, params, &[input], None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::ConstantAccessor;
    use crate::node::NodeType;
    use kiln_core::{DataType, PoolingType};

    fn lenet_front(graph: &mut Graph) -> NodeId {
        let x = add_input_node(
            graph,
            NodeParams::new("data"),
            TensorDescriptor::new([1, 28, 28, 1], DataType::F32),
            None,
        )
        .unwrap();
        let conv = add_convolution_node(
            graph,
            NodeParams::new("conv1"),
            x.into(),
            Size2D::new(5, 5),
            20,
            PadStrideInfo::new(1, 1, 0, 0),
            ConvolutionMethod::Default,
            Some(Box::new(ConstantAccessor::new(0.1))),
            Some(Box::new(ConstantAccessor::new(0.0))),
        )
        .unwrap();
        add_pooling_node(
            graph,
            NodeParams::new("pool1"),
            conv.into(),
            PoolingInfo::new(PoolingType::Max, 2, PadStrideInfo::new(2, 2, 0, 0)),
        )
        .unwrap()
    }

    #[test]
    fn test_convolution_creates_consts() {
        let mut g = Graph::new("lenet");
        let pool = lenet_front(&mut g);
        // data, weights, bias, conv, pool
        assert_eq!(g.len(), 5);
        assert_eq!(g.node(NodeId(1)).unwrap().name(), "conv1/weights");
        assert_eq!(g.node(NodeId(1)).unwrap().node_type(), NodeType::Const);
        assert_eq!(
            g.output_desc(NodeId(1).into()).unwrap().shape.dims(),
            &[20, 5, 5, 1]
        );
        assert_eq!(g.output_desc(NodeId(2).into()).unwrap().shape.dims(), &[20]);
        assert_eq!(g.output_desc(pool.into()).unwrap().shape.dims(), &[1, 12, 12, 20]);
    }

    #[test]
    fn test_bias_is_optional() {
        let mut g = Graph::new("g");
        let x = add_input_node(&mut g, NodeParams::new("x"), TensorDescriptor::new([2, 3], DataType::F32), None)
            .unwrap();
        let fc = add_fully_connected_node(&mut g, NodeParams::new("fc"), x.into(), 4, None, None).unwrap();
        assert_eq!(g.node(fc).unwrap().inputs().len(), 2);
        assert_eq!(g.output_desc(fc.into()).unwrap().shape.dims(), &[2, 4]);
    }

    #[test]
    fn test_unknown_input_desc() {
        let mut g = Graph::new("g");
        let err = add_convolution_node(
            &mut g,
            NodeParams::new("conv"),
            NodeId::EMPTY.into(),
            Size2D::new(3, 3),
            4,
            PadStrideInfo::default(),
            ConvolutionMethod::Default,
            None,
            None,
        )
        .unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_batch_norm_inputs() {
        let mut g = Graph::new("g");
        let x = add_input_node(
            &mut g,
            NodeParams::new("x"),
            TensorDescriptor::new([1, 2, 2, 3], DataType::F32),
            None,
        )
        .unwrap();
        let accessors = BatchNormAccessors {
            mean: None,
            var: Some(Box::new(ConstantAccessor::new(1.0))),
            beta: None,
            gamma: Some(Box::new(ConstantAccessor::new(2.0))),
        };
        let bn = add_batch_normalization_node(&mut g, NodeParams::new("bn"), x.into(), 1e-3, accessors, None).unwrap();
        let node = g.node(bn).unwrap();
        assert_eq!(node.inputs().len(), 4);
        assert_eq!(g.node(node.inputs()[3].node).unwrap().name(), "bn/gamma");
    }
}
