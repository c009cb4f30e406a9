//! Graph nodes: identity, kind-specific parameters and edges.

use std::fmt;

use smallvec::SmallVec;

use kiln_core::{
    ActivationInfo, ConvolutionMethod, DataLayoutDimension, EltwiseOperation, NormalizationInfo, PadStrideInfo,
    PoolingInfo, Target, TensorDescriptor,
};

use crate::accessor::Accessor;

/// Opaque node identity: the node's index in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Marks an absent node.
    pub const EMPTY: NodeId = NodeId(u32::MAX);

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "#empty")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// One output of a producer node: the source end of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeOutput {
    pub node: NodeId,
    pub index: usize,
}

impl NodeOutput {
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }
}

impl From<NodeId> for NodeOutput {
    fn from(node: NodeId) -> Self {
        Self { node, index: 0 }
    }
}

/// Parameters every builder function accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeParams {
    pub name: String,
    /// Overrides the graph's default target.
    pub target: Option<Target>,
}

impl NodeParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }
}

/// Fieldless mirror of [`NodeKind`], used for dispatch and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Input,
    Const,
    Output,
    Convolution,
    DepthwiseConvolution,
    Activation,
    Pooling,
    Concat,
    Elementwise,
    Reshape,
    Flatten,
    Softmax,
    Normalization,
    BatchNormalization,
    FullyConnected,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Input => "Input",
            NodeType::Const => "Const",
            NodeType::Output => "Output",
            NodeType::Convolution => "Convolution",
            NodeType::DepthwiseConvolution => "DepthwiseConvolution",
            NodeType::Activation => "Activation",
            NodeType::Pooling => "Pooling",
            NodeType::Concat => "Concat",
            NodeType::Elementwise => "Elementwise",
            NodeType::Reshape => "Reshape",
            NodeType::Flatten => "Flatten",
            NodeType::Softmax => "Softmax",
            NodeType::Normalization => "Normalization",
            NodeType::BatchNormalization => "BatchNormalization",
            NodeType::FullyConnected => "FullyConnected",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node kind and its parameters.
///
/// Inputs by kind:
/// - Convolution / DepthwiseConvolution: `[input, weights, bias?]`
/// - FullyConnected: `[input, weights, bias?]`
/// - BatchNormalization: `[input, mean, var, beta?, gamma?]`
/// - Elementwise: `[a, b]`; Concat: one or more; everything else: one
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Input {
        desc: TensorDescriptor,
    },
    Const {
        desc: TensorDescriptor,
    },
    Output,
    Convolution {
        info: PadStrideInfo,
        method: ConvolutionMethod,
    },
    DepthwiseConvolution {
        info: PadStrideInfo,
        multiplier: usize,
    },
    Activation {
        info: ActivationInfo,
    },
    Pooling {
        info: PoolingInfo,
    },
    Concat {
        axis: DataLayoutDimension,
    },
    Elementwise {
        op: EltwiseOperation,
    },
    Reshape {
        shape: Vec<isize>,
    },
    Flatten,
    Softmax {
        beta: f32,
    },
    Normalization {
        info: NormalizationInfo,
    },
    BatchNormalization {
        epsilon: f32,
        activation: Option<ActivationInfo>,
        has_beta: bool,
        has_gamma: bool,
    },
    FullyConnected,
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Input { .. } => NodeType::Input,
            NodeKind::Const { .. } => NodeType::Const,
            NodeKind::Output => NodeType::Output,
            NodeKind::Convolution { .. } => NodeType::Convolution,
            NodeKind::DepthwiseConvolution { .. } => NodeType::DepthwiseConvolution,
            NodeKind::Activation { .. } => NodeType::Activation,
            NodeKind::Pooling { .. } => NodeType::Pooling,
            NodeKind::Concat { .. } => NodeType::Concat,
            NodeKind::Elementwise { .. } => NodeType::Elementwise,
            NodeKind::Reshape { .. } => NodeType::Reshape,
            NodeKind::Flatten => NodeType::Flatten,
            NodeKind::Softmax { .. } => NodeType::Softmax,
            NodeKind::Normalization { .. } => NodeType::Normalization,
            NodeKind::BatchNormalization { .. } => NodeType::BatchNormalization,
            NodeKind::FullyConnected => NodeType::FullyConnected,
        }
    }

    /// Allowed number of inputs, `(min, max)`.
    pub fn input_arity(&self) -> (usize, usize) {
        match self {
            NodeKind::Input { .. } | NodeKind::Const { .. } => (0, 0),
            NodeKind::Convolution { .. } | NodeKind::DepthwiseConvolution { .. } | NodeKind::FullyConnected => {
                (2, 3)
            }
            NodeKind::BatchNormalization { has_beta, has_gamma, .. } => {
                let n = 3 + *has_beta as usize + *has_gamma as usize;
                (n, n)
            }
            NodeKind::Elementwise { .. } => (2, 2),
            NodeKind::Concat { .. } => (1, usize::MAX),
            NodeKind::Output
            | NodeKind::Activation { .. }
            | NodeKind::Pooling { .. }
            | NodeKind::Reshape { .. }
            | NodeKind::Flatten
            | NodeKind::Softmax { .. }
            | NodeKind::Normalization { .. } => (1, 1),
        }
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            NodeKind::Output => 0,
            _ => 1,
        }
    }
}

/// One operator instance. Owned by its [`Graph`](crate::Graph); referenced
/// elsewhere by [`NodeId`] only.
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) params: NodeParams,
    pub(crate) kind: NodeKind,
    pub(crate) inputs: SmallVec<[NodeOutput; 3]>,
    pub(crate) outputs: SmallVec<[Option<TensorDescriptor>; 1]>,
    pub(crate) accessor: Option<Box<dyn Accessor>>,
    /// Disabled nodes stay in the graph but produce no task.
    pub(crate) enabled: bool,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn params(&self) -> &NodeParams {
        &self.params
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn inputs(&self) -> &[NodeOutput] {
        &self.inputs
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Descriptor of output `index`, once shape propagation has produced it.
    pub fn output_desc(&self, index: usize) -> Option<&TensorDescriptor> {
        self.outputs.get(index).and_then(Option::as_ref)
    }

    pub fn has_accessor(&self) -> bool {
        self.accessor.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.params.name)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("accessor", &self.accessor.is_some())
            .field("enabled", &self.enabled)
            .finish()
    }
}
