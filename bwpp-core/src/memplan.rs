//! Liveness-based memory planner (§4.7). Reuses buffers across values
//! whose descriptors (dtype, layout, symbolic shape) match exactly.

use std::fmt::Write as _;

use crate::graph::{Graph, Shape, VALUE_CONST, VALUE_INPUT};
use crate::types::{Dtype, Layout};

#[derive(Debug, Clone)]
pub struct BufferDesc<'a> {
    pub dtype: Dtype,
    pub layout: Layout,
    pub shape: Shape<'a>,
}

impl<'a> BufferDesc<'a> {
    fn matches(&self, dtype: Dtype, layout: Layout, shape: &Shape<'a>) -> bool {
        self.dtype == dtype && self.layout == layout && self.shape.dims == shape.dims
    }
}

#[derive(Debug)]
pub struct MemPlan<'a> {
    pub buffers: Vec<BufferDesc<'a>>,
    pub value_to_buffer: Vec<u32>,
}

const NO_BUFFER: u32 = u32::MAX;

/// Plans buffer assignment for every value in `graph` that is produced by
/// a node (input/const values never occupy a planned buffer).
pub fn plan<'a>(graph: &Graph<'a>) -> MemPlan<'a> {
    let value_count = graph.values.len();
    let node_count = graph.nodes.len();

    // last_use[v] = index of the last node (by position in graph.nodes)
    // that reads v as an operand; outputs never release (last_use = node_count).
    let mut last_use = vec![0usize; value_count];
    for (idx, node) in graph.nodes.iter().enumerate() {
        for &input in &node.inputs {
            last_use[input as usize] = idx;
        }
    }
    for v in &graph.values {
        if v.flags & crate::graph::VALUE_OUTPUT != 0 {
            last_use[v.id as usize] = node_count;
        }
    }

    let mut buffers: Vec<BufferDesc<'a>> = Vec::new();
    let mut free_list: Vec<u32> = Vec::new();
    let mut value_to_buffer = vec![NO_BUFFER; value_count];

    for (idx, node) in graph.nodes.iter().enumerate() {
        for &input in &node.inputs {
            if last_use[input as usize] == idx {
                let buf = value_to_buffer[input as usize];
                if buf != NO_BUFFER && !free_list.contains(&buf) {
                    free_list.push(buf);
                }
            }
        }

        let out = &graph.values[node.output as usize];
        if out.flags & (VALUE_INPUT | VALUE_CONST) != 0 {
            continue;
        }

        let reuse = free_list
            .iter()
            .position(|&b| buffers[b as usize].matches(out.dtype, out.layout, &out.shape));

        let buf_id = match reuse {
            Some(pos) => {
                let b = free_list.remove(pos);
                b
            }
            None => {
                let id = buffers.len() as u32;
                buffers.push(BufferDesc {
                    dtype: out.dtype,
                    layout: out.layout,
                    shape: out.shape.clone(),
                });
                id
            }
        };
        value_to_buffer[node.output as usize] = buf_id;
    }

    MemPlan {
        buffers,
        value_to_buffer,
    }
}

/// Renders the plan in the exact textual dump format:
/// `buffers=<n> values=<m>` followed by one `buffer<i> <dtype> [<dims>] <layout>`
/// line per buffer and one `v<j> -> buffer<k>` line per planned value.
pub fn dump(plan: &MemPlan<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "buffers={} values={}", plan.buffers.len(), plan.value_to_buffer.len());
    for (i, b) in plan.buffers.iter().enumerate() {
        let _ = write!(out, "buffer{} {} [", i, b.dtype.name());
        for (j, d) in b.shape.dims.iter().enumerate() {
            if j > 0 {
                let _ = write!(out, ",");
            }
            let _ = write!(out, "{}", d);
        }
        let _ = writeln!(out, "] {}", b.layout.name());
    }
    for (i, &buf) in plan.value_to_buffer.iter().enumerate() {
        if buf != NO_BUFFER {
            let _ = writeln!(out, "v{} -> buffer{}", i, buf);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;

    #[test]
    fn chain_reuses_freed_buffer() {
        let src = "fn f(a: tensor<f16,[M,K]>, b: tensor<f16,[K,N]>, c: tensor<f16,[N,P]>) { \
                   let y = matmul(a, b); \
                   let z = matmul(y, c); \
                   return z; }";
        let g = build_graph(src, None).unwrap();
        let p = plan(&g);
        // y's buffer is freed once z is computed (y's last use), but y and z
        // differ in shape ([M,N] vs [M,P]) so no exact-match reuse happens.
        assert_eq!(p.buffers.len(), 2);
    }

    #[test]
    fn output_value_never_released() {
        let src = "fn f(a: tensor<f16,[M,K]>, b: tensor<f16,[K,N]>) { let y = matmul(a,b); return y; }";
        let g = build_graph(src, None).unwrap();
        let p = plan(&g);
        assert_eq!(p.buffers.len(), 1);
        let dump = dump(&p);
        assert!(dump.starts_with("buffers=1 values="));
    }

    #[test]
    fn same_shape_chain_reuses_exactly() {
        let src = "fn f(a: tensor<f16,[N]>, b: tensor<f16,[N]>, c: tensor<f16,[N]>) { \
                   let x = add(a, b); \
                   let y = add(x, c); \
                   return y; }";
        let g = build_graph(src, None).unwrap();
        let p = plan(&g);
        assert_eq!(p.buffers.len(), 1);
    }
}
