//! Graph mutators applied during finalization.

use std::collections::HashSet;

use smallvec::SmallVec;
use tracing::debug;

use kiln_core::{KilnError, Result};

use crate::graph::Graph;
use crate::node::{NodeId, NodeKind, NodeOutput, NodeType};

/// A concatenation served by sub-tensor views of its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTensorConcat {
    pub node: NodeId,
    /// Index of the concatenation axis in the output shape.
    pub axis: usize,
    pub inputs: Vec<NodeOutput>,
}

impl SubTensorConcat {
    /// Offset of every input inside the concatenated output, from the
    /// current descriptors.
    pub fn offsets(&self, graph: &Graph) -> Result<Vec<SmallVec<[usize; 4]>>> {
        let mut running = 0;
        let mut out = Vec::with_capacity(self.inputs.len());
        for &input in &self.inputs {
            let desc = graph
                .output_desc(input)
                .ok_or_else(|| KilnError::shape(format!("input {} of concat {} has no descriptor", input.node, self.node)))?;
            let mut offsets: SmallVec<[usize; 4]> = SmallVec::from_elem(0, desc.shape.ndim());
            offsets[self.axis] = running;
            running += desc.shape.dims()[self.axis];
            out.push(offsets);
        }
        Ok(out)
    }
}

/// Replaces concatenations along an outer axis by sub-tensors.
///
/// Each producer then writes straight into its slice of the output and the
/// concat node is disabled. Concatenations along the two innermost axes,
/// inputs produced by sources (Input / Const) and outputs already claimed by
/// another concatenation are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatSubTensorMutator;

impl ConcatSubTensorMutator {
    pub fn name(&self) -> &'static str {
        "concat_sub_tensor"
    }

    pub fn mutate(&self, graph: &mut Graph) -> Result<Vec<SubTensorConcat>> {
        let mut claimed: HashSet<NodeOutput> = HashSet::new();
        let mut replaced = Vec::new();
        for id in graph.topological_order()? {
            let node = graph.get(id)?;
            let NodeKind::Concat { axis } = node.kind() else { continue };
            if !node.is_enabled() {
                continue;
            }
            let Some(out_desc) = node.output_desc(0) else { continue };
            let Ok(axis_index) = kiln_kernels::shapes::concat_axis(out_desc, *axis) else { continue };
            if axis_index + 2 >= out_desc.shape.ndim() {
                continue;
            }
            let inputs = node.inputs().to_vec();
            let eligible = inputs.iter().all(|i| {
                !claimed.contains(i)
                    && graph.node(i.node).is_some_and(|p| {
                        p.is_enabled() && !matches!(p.node_type(), NodeType::Input | NodeType::Const | NodeType::Concat)
                    })
            });
            let unique = inputs.iter().collect::<HashSet<_>>().len() == inputs.len();
            if !eligible || !unique {
                continue;
            }
            claimed.extend(inputs.iter().copied());
            debug!(node = %id, name = node.name(), inputs = inputs.len(), "concat replaced by sub-tensors");
            replaced.push(SubTensorConcat {
                node: id,
                axis: axis_index,
                inputs,
            });
        }
        for r in &replaced {
            graph.set_enabled(r.node, false)?;
        }
        Ok(replaced)
    }
}
