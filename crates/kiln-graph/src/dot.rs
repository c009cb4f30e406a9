//! Graphviz export for debugging.

use std::fmt::Write;

use crate::graph::Graph;
use crate::node::{Node, NodeKind};

fn label(node: &Node) -> String {
    let mut label = format!("{}\\n{}", node.name(), node.node_type());
    match node.kind() {
        NodeKind::Convolution { info, method } => {
            let _ = write!(label, "\\nstride {}x{} {method}", info.stride_x, info.stride_y);
        }
        NodeKind::Pooling { info } => {
            let _ = write!(label, "\\n{:?} {}x{}", info.pool_type, info.pool_size.width, info.pool_size.height);
        }
        NodeKind::Activation { info } => {
            let _ = write!(label, "\\n{:?}", info.function);
        }
        NodeKind::Concat { axis } => {
            let _ = write!(label, "\\n{axis:?}");
        }
        NodeKind::Elementwise { op } => {
            let _ = write!(label, "\\n{op:?}");
        }
        _ => {}
    }
    if let Some(desc) = node.output_desc(0) {
        let _ = write!(label, "\\n{}", desc.shape);
    }
    label
}

/// Render `graph` in the DOT language. Disabled nodes are drawn dashed.
pub fn to_dot(graph: &Graph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", graph.name().replace('"', "'"));
    let _ = writeln!(out, "  node [shape=box];");
    for node in graph.nodes() {
        let style = if node.is_enabled() { "solid" } else { "dashed" };
        let _ = writeln!(
            out,
            "  n{} [label=\"{}\", style={style}];",
            node.id().raw(),
            label(node).replace('"', "'")
        );
    }
    for node in graph.nodes() {
        for (slot, input) in node.inputs().iter().enumerate() {
            let _ = writeln!(
                out,
                "  n{} -> n{} [label=\"{}:{slot}\"];",
                input.node.raw(),
                node.id().raw(),
                input.index
            );
        }
    }
    out.push_str("}\n");
    out
}
