//! The graph: node ownership, edges and ordering.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use smallvec::SmallVec;
use tracing::debug;

use kiln_core::{KilnError, Result, TensorDescriptor};

use crate::accessor::Accessor;
use crate::node::{Node, NodeId, NodeKind, NodeOutput, NodeParams};
use crate::ops;

/// A directed acyclic graph of nodes. Nodes are only ever referenced by id.
#[derive(Debug, Default)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index())
    }

    pub(crate) fn get(&self, id: NodeId) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| KilnError::structural(format!("node {id} does not exist")))
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.index())
            .ok_or_else(|| KilnError::structural(format!("node {id} does not exist")))
    }

    /// Descriptor of a node output, once known.
    pub fn output_desc(&self, output: NodeOutput) -> Option<&TensorDescriptor> {
        self.node(output.node).and_then(|n| n.output_desc(output.index))
    }

    fn check_producer(&self, output: NodeOutput) -> Result<()> {
        let producer = self.get(output.node)?;
        if output.index >= producer.num_outputs() {
            return Err(KilnError::structural(format!(
                "node {} ({}) has no output {}",
                output.node,
                producer.name(),
                output.index
            )));
        }
        Ok(())
    }

    /// Append a node, wiring one edge per input.
    ///
    /// Only connectivity is checked here. Output descriptors are propagated
    /// eagerly when every input descriptor is known; shape errors surface at
    /// finalization.
    pub fn add_node(
        &mut self,
        kind: NodeKind,
        params: NodeParams,
        inputs: &[NodeOutput],
        accessor: Option<Box<dyn Accessor>>,
    ) -> Result<NodeId> {
        let (min, max) = kind.input_arity();
        if inputs.len() < min || inputs.len() > max {
            return Err(KilnError::structural(format!(
                "{} node '{}' takes {min}..={max} inputs, got {}",
                kind.node_type(),
                params.name,
                inputs.len()
            )));
        }
        for &input in inputs {
            self.check_producer(input)?;
        }

        let id = NodeId(self.nodes.len() as u32);
        let outputs = self.try_propagate(&kind, inputs);
        debug!(node = %id, name = %params.name, kind = %kind.node_type(), "node added");
        self.nodes.push(Node {
            id,
            params,
            kind,
            inputs: SmallVec::from_slice(inputs),
            outputs,
            accessor,
            enabled: true,
        });
        Ok(id)
    }

    fn try_propagate(&self, kind: &NodeKind, inputs: &[NodeOutput]) -> SmallVec<[Option<TensorDescriptor>; 1]> {
        let n = kind.num_outputs();
        let descs: Option<Vec<&TensorDescriptor>> = inputs.iter().map(|&i| self.output_desc(i)).collect();
        match descs.map(|d| ops::propagate(kind, &d)) {
            Some(Ok(out)) => out.into_iter().map(Some).collect(),
            _ => (0..n).map(|_| None).collect(),
        }
    }

    /// Replace input `slot` of `consumer` with `producer`.
    ///
    /// Fails with a structural error if the edge would close a cycle.
    pub fn connect(&mut self, producer: NodeOutput, consumer: NodeId, slot: usize) -> Result<()> {
        self.check_producer(producer)?;
        let node = self.get(consumer)?;
        if slot >= node.inputs.len() {
            return Err(KilnError::structural(format!(
                "node {consumer} ({}) has no input slot {slot}",
                node.name()
            )));
        }
        if self.depends_on(producer.node, consumer) {
            return Err(KilnError::structural(format!(
                "connecting {} to {consumer} would create a cycle",
                producer.node
            )));
        }
        let node = self.get_mut(consumer)?;
        node.inputs[slot] = producer;
        for out in node.outputs.iter_mut() {
            *out = None;
        }
        Ok(())
    }

    /// Whether `node` is `ancestor` or consumes its output, directly or transitively.
    fn depends_on(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if id == ancestor {
                return true;
            }
            let Some(n) = self.node(id) else { continue };
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            stack.extend(n.inputs.iter().map(|i| i.node));
        }
        false
    }

    /// Every `(consumer, input slot)` reading an output of `id`.
    pub fn consumers(&self, id: NodeId) -> Vec<(NodeId, usize)> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.inputs
                    .iter()
                    .enumerate()
                    .filter(move |(_, i)| i.node == id)
                    .map(move |(slot, _)| (n.id, slot))
            })
            .collect()
    }

    /// Consumers of one specific output.
    pub fn output_consumers(&self, output: NodeOutput) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.contains(&output))
            .map(|n| n.id)
            .collect()
    }

    /// Stable topological order: among ready nodes the lowest id goes first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut indegree: Vec<usize> = self.nodes.iter().map(|n| n.inputs.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for n in &self.nodes {
            for i in &n.inputs {
                dependents[i.node.index()].push(n.id.index());
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(self.nodes[i].id);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(KilnError::structural("graph contains a cycle"));
        }
        Ok(order)
    }

    /// Recompute every output descriptor in topological order.
    ///
    /// Stops at the first failing node, naming it in the error.
    pub fn propagate_shapes(&mut self) -> Result<()> {
        for id in self.topological_order()? {
            let node = self.get(id)?;
            let result = (|| {
                let mut descs = Vec::with_capacity(node.inputs.len());
                for (slot, &input) in node.inputs.iter().enumerate() {
                    let desc = self.output_desc(input).ok_or_else(|| {
                        KilnError::shape(format!("input {slot} from {} has no descriptor", input.node))
                    })?;
                    descs.push(desc);
                }
                ops::propagate(&node.kind, &descs)
            })();
            let outputs = result.map_err(|e| e.at_node(id.raw(), node.name()))?;
            self.get_mut(id)?.outputs = outputs.into_iter().map(Some).collect();
        }
        Ok(())
    }

    /// Change the descriptor of an Input node.
    pub fn set_input_desc(&mut self, id: NodeId, desc: TensorDescriptor) -> Result<()> {
        let node = self.get_mut(id)?;
        match &mut node.kind {
            NodeKind::Input { desc: d } => {
                *d = desc;
                Ok(())
            }
            _ => Err(KilnError::usage(format!("node {id} ({}) is not an input", node.params.name))),
        }
    }

    pub(crate) fn set_enabled(&mut self, id: NodeId, enabled: bool) -> Result<()> {
        self.get_mut(id)?.enabled = enabled;
        Ok(())
    }

    pub(crate) fn take_accessor(&mut self, id: NodeId) -> Result<Option<Box<dyn Accessor>>> {
        Ok(self.get_mut(id)?.accessor.take())
    }

    /// Attach (or replace) the accessor of a node.
    pub fn set_accessor(&mut self, id: NodeId, accessor: Box<dyn Accessor>) -> Result<()> {
        self.get_mut(id)?.accessor = Some(accessor);
        Ok(())
    }
}
