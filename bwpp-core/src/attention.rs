//! Fused-attention pattern recognition (§4.5): matmul with a transposed
//! operand -> softmax -> matmul.

use crate::graph::{Graph, OpKind};

/// True if `graph` contains a matmul whose A or B operand is produced by
/// a `transpose` node, whose result feeds a `softmax`, whose result in
/// turn feeds another `matmul`.
pub fn detect_attention(graph: &Graph<'_>) -> bool {
    for (i, node) in graph.nodes.iter().enumerate() {
        if node.op != OpKind::Matmul {
            continue;
        }
        let transposed_operand = node
            .inputs
            .iter()
            .any(|&v| is_produced_by(graph, v, OpKind::Transpose));
        if !transposed_operand {
            continue;
        }
        // does this matmul's output feed a softmax?
        let Some(softmax_idx) = find_consumer(graph, node.output, OpKind::Softmax) else {
            continue;
        };
        let softmax_out = graph.nodes[softmax_idx].output;
        if find_consumer(graph, softmax_out, OpKind::Matmul).is_some() {
            return true;
        }
        let _ = i;
    }
    false
}

fn is_produced_by(graph: &Graph<'_>, value_id: u32, op: OpKind) -> bool {
    match graph.values[value_id as usize].producer {
        Some(node_id) => graph.nodes[node_id as usize].op == op,
        None => false,
    }
}

fn find_consumer(graph: &Graph<'_>, value_id: u32, op: OpKind) -> Option<usize> {
    graph
        .nodes
        .iter()
        .position(|n| n.op == op && n.inputs.contains(&value_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;

    #[test]
    fn recognizes_qkt_softmax_v() {
        let src = "fn attn(q: tensor<f16,[S,D]>, k: tensor<f16,[S,D]>, v: tensor<f16,[S,D]>) { \
                   let kt = transpose(k); \
                   let scores = matmul(q, kt); \
                   let w = softmax(scores); \
                   let out = matmul(w, v); \
                   return out; }";
        let g = build_graph(src, None).unwrap();
        assert!(detect_attention(&g));
    }

    #[test]
    fn plain_matmul_chain_is_not_attention() {
        let src = "fn f(a: tensor<f16,[M,K]>, b: tensor<f16,[K,N]>, c: tensor<f16,[N,P]>) { \
                   let y = matmul(a, b); \
                   let z = matmul(y, c); \
                   return z; }";
        let g = build_graph(src, None).unwrap();
        assert!(!detect_attention(&g));
    }

    #[test]
    fn softmax_without_trailing_matmul_is_not_attention() {
        let src = "fn f(q: tensor<f16,[S,D]>, k: tensor<f16,[S,D]>) { \
                   let kt = transpose(k); \
                   let scores = matmul(q, kt); \
                   let w = softmax(scores); \
                   return w; }";
        let g = build_graph(src, None).unwrap();
        assert!(!detect_attention(&g));
    }
}
