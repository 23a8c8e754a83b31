//! Reverse-mode autodiff (§4.6). Consumes a forward `Graph` and produces a
//! fresh, independent gradient `Graph` — it never mutates or borrows nodes
//! from the forward graph, only reads shapes and op kinds out of it.

use crate::graph::{infer_matmul, infer_transpose, Attr, Graph, OpKind, Shape, NO_REGION, VALUE_INPUT};

fn import_activation<'a>(
    new_g: &mut Graph<'a>,
    old_g: &Graph<'a>,
    act_map: &mut [Option<u32>],
    value_id: u32,
) -> u32 {
    if let Some(v) = act_map[value_id as usize] {
        return v;
    }
    let old_v = &old_g.values[value_id as usize];
    let v = new_g.add_value(
        old_v.name,
        old_v.dtype,
        old_v.shape.clone(),
        old_v.layout,
        None,
        VALUE_INPUT,
    );
    act_map[value_id as usize] = Some(v);
    v
}

fn accumulate<'a>(g: &mut Graph<'a>, grad_map: &mut [Option<u32>], operand: u32, new_grad: u32, shape: Shape<'a>) {
    match grad_map[operand as usize] {
        None => grad_map[operand as usize] = Some(new_grad),
        Some(existing) => {
            let out = g.add_node(OpKind::Add, vec![existing, new_grad], shape, Attr::default(), NO_REGION, 0);
            grad_map[operand as usize] = Some(out);
        }
    }
}

/// Reduces `v` (currently shaped `C`) down to `target` by `reduce_sum`ming
/// any axis broadcast during the forward pass, then reshaping if the rank
/// still differs.
fn reduce_to_shape<'a>(g: &mut Graph<'a>, v: u32, target: &Shape<'a>) -> u32 {
    let mut cur_shape = g.values[v as usize].shape.clone();
    let mut result = v;
    if cur_shape.rank() == target.rank() {
        for i in 0..cur_shape.rank() {
            if target.dims[i] == "1" && cur_shape.dims[i] != "1" {
                let mut next_dims = cur_shape.dims.clone();
                next_dims[i] = "1";
                let next_shape = Shape { dims: next_dims };
                let attr = Attr {
                    axis: Some(i as i64),
                    ..Attr::default()
                };
                result = g.add_node(OpKind::ReduceSum, vec![result], next_shape.clone(), attr, NO_REGION, 0);
                cur_shape = next_shape;
            }
        }
        if cur_shape.dims != target.dims {
            let attr = Attr {
                shape: Some(target.clone()),
                ..Attr::default()
            };
            result = g.add_node(OpKind::Reshape, vec![result], target.clone(), attr, NO_REGION, 0);
        }
    } else {
        let attr = Attr {
            shape: Some(target.clone()),
            ..Attr::default()
        };
        result = g.add_node(OpKind::Reshape, vec![result], target.clone(), attr, NO_REGION, 0);
    }
    result
}

fn negate<'a>(g: &mut Graph<'a>, v: u32) -> u32 {
    let shape = g.values[v as usize].shape.clone();
    let neg_one = g.const_scalar("-1");
    g.add_node(OpKind::Mul, vec![v, neg_one], shape, Attr::default(), NO_REGION, 0)
}

fn invert_perm(perm: &[u32]) -> Vec<u32> {
    let mut inv = vec![0u32; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        if (p as usize) < inv.len() {
            inv[p as usize] = i as u32;
        }
    }
    inv
}

/// Builds the gradient graph of `graph`: inputs are every forward input
/// plus one gradient seed per forward output; outputs are `d(output)/d(input)`
/// for every forward input that participates in the computation.
pub fn autodiff<'a>(graph: &Graph<'a>) -> Graph<'a> {
    let mut g = Graph::new();
    let n = graph.values.len();
    let mut act_map: Vec<Option<u32>> = vec![None; n];
    let mut grad_map: Vec<Option<u32>> = vec![None; n];

    for &out_id in &graph.outputs {
        let v = &graph.values[out_id as usize];
        let seed = g.add_value(v.name, v.dtype, v.shape.clone(), v.layout, None, VALUE_INPUT);
        grad_map[out_id as usize] = Some(seed);
    }

    // Every forward input becomes an input of the gradient graph, even if no
    // gradient rule ends up reading its activation — the input/output
    // contract is n_in + n_out regardless of which activations are used.
    for v in &graph.values {
        if v.flags & VALUE_INPUT != 0 && v.producer.is_none() {
            import_activation(&mut g, graph, &mut act_map, v.id);
        }
    }

    for node in graph.nodes.iter().rev() {
        let dy = match grad_map[node.output as usize] {
            Some(v) => v,
            None => continue,
        };

        match node.op {
            OpKind::Matmul => {
                let a = node.inputs[0];
                let b = node.inputs[1];
                let act_a = import_activation(&mut g, graph, &mut act_map, a);
                let act_b = import_activation(&mut g, graph, &mut act_map, b);

                let tb_shape = infer_transpose(&g.values[act_b as usize].shape);
                let tb = g.add_node(OpKind::Transpose, vec![act_b], tb_shape.clone(), Attr::default(), NO_REGION, 0);
                let da_shape = infer_matmul(&g.values[dy as usize].shape, &tb_shape);
                let da = g.add_node(OpKind::Matmul, vec![dy, tb], da_shape, Attr::default(), NO_REGION, 0);
                accumulate(&mut g, &mut grad_map, a, da, graph.values[a as usize].shape.clone());

                let ta_shape = infer_transpose(&g.values[act_a as usize].shape);
                let ta = g.add_node(OpKind::Transpose, vec![act_a], ta_shape.clone(), Attr::default(), NO_REGION, 0);
                let db_shape = infer_matmul(&ta_shape, &g.values[dy as usize].shape);
                let db = g.add_node(OpKind::Matmul, vec![ta, dy], db_shape, Attr::default(), NO_REGION, 0);
                accumulate(&mut g, &mut grad_map, b, db, graph.values[b as usize].shape.clone());
            }
            OpKind::Add | OpKind::Sub => {
                let a = node.inputs[0];
                let b = node.inputs[1];
                let da = reduce_to_shape(&mut g, dy, &graph.values[a as usize].shape);
                accumulate(&mut g, &mut grad_map, a, da, graph.values[a as usize].shape.clone());

                let mut db = reduce_to_shape(&mut g, dy, &graph.values[b as usize].shape);
                if node.op == OpKind::Sub {
                    db = negate(&mut g, db);
                }
                accumulate(&mut g, &mut grad_map, b, db, graph.values[b as usize].shape.clone());
            }
            OpKind::Mul => {
                let a = node.inputs[0];
                let b = node.inputs[1];
                let act_a = import_activation(&mut g, graph, &mut act_map, a);
                let act_b = import_activation(&mut g, graph, &mut act_map, b);
                let dy_shape = g.values[dy as usize].shape.clone();

                let da_raw = g.add_node(OpKind::Mul, vec![dy, act_b], dy_shape.clone(), Attr::default(), NO_REGION, 0);
                let da = reduce_to_shape(&mut g, da_raw, &graph.values[a as usize].shape);
                accumulate(&mut g, &mut grad_map, a, da, graph.values[a as usize].shape.clone());

                let db_raw = g.add_node(OpKind::Mul, vec![dy, act_a], dy_shape, Attr::default(), NO_REGION, 0);
                let db = reduce_to_shape(&mut g, db_raw, &graph.values[b as usize].shape);
                accumulate(&mut g, &mut grad_map, b, db, graph.values[b as usize].shape.clone());
            }
            OpKind::Div => {
                let a = node.inputs[0];
                let b = node.inputs[1];
                let act_a = import_activation(&mut g, graph, &mut act_map, a);
                let act_b = import_activation(&mut g, graph, &mut act_map, b);
                let dy_shape = g.values[dy as usize].shape.clone();
                let b_shape = g.values[act_b as usize].shape.clone();

                let da_raw = g.add_node(OpKind::Div, vec![dy, act_b], dy_shape.clone(), Attr::default(), NO_REGION, 0);
                let da = reduce_to_shape(&mut g, da_raw, &graph.values[a as usize].shape);
                accumulate(&mut g, &mut grad_map, a, da, graph.values[a as usize].shape.clone());

                let b2 = g.add_node(OpKind::Mul, vec![act_b, act_b], b_shape, Attr::default(), NO_REGION, 0);
                let num = g.add_node(OpKind::Mul, vec![dy, act_a], dy_shape, Attr::default(), NO_REGION, 0);
                let num_shape = g.values[num as usize].shape.clone();
                let mut db_raw = g.add_node(OpKind::Div, vec![num, b2], num_shape, Attr::default(), NO_REGION, 0);
                db_raw = negate(&mut g, db_raw);
                let db = reduce_to_shape(&mut g, db_raw, &graph.values[b as usize].shape);
                accumulate(&mut g, &mut grad_map, b, db, graph.values[b as usize].shape.clone());
            }
            OpKind::Transpose => {
                let x = node.inputs[0];
                let shape = infer_transpose(&g.values[dy as usize].shape);
                let dx = g.add_node(OpKind::Transpose, vec![dy], shape, Attr::default(), NO_REGION, 0);
                accumulate(&mut g, &mut grad_map, x, dx, graph.values[x as usize].shape.clone());
            }
            OpKind::Permute => {
                let x = node.inputs[0];
                let perm = node.attr.perm.clone().unwrap_or_default();
                let inv = invert_perm(&perm);
                let shape = graph.values[x as usize].shape.clone();
                let attr = Attr {
                    perm: Some(inv),
                    ..Attr::default()
                };
                let dx = g.add_node(OpKind::Permute, vec![dy], shape.clone(), attr, NO_REGION, 0);
                accumulate(&mut g, &mut grad_map, x, dx, shape);
            }
            OpKind::Reshape => {
                let x = node.inputs[0];
                let shape = graph.values[x as usize].shape.clone();
                let attr = Attr {
                    shape: Some(shape.clone()),
                    ..Attr::default()
                };
                let dx = g.add_node(OpKind::Reshape, vec![dy], shape.clone(), attr, NO_REGION, 0);
                accumulate(&mut g, &mut grad_map, x, dx, shape);
            }
            OpKind::Silu => {
                let x = node.inputs[0];
                let act_x = import_activation(&mut g, graph, &mut act_map, x);
                let shape = graph.values[x as usize].shape.clone();
                let dx = g.add_node(OpKind::SiluGrad, vec![act_x, dy], shape.clone(), Attr::default(), NO_REGION, 0);
                accumulate(&mut g, &mut grad_map, x, dx, shape);
            }
            OpKind::Softmax => {
                let x = node.inputs[0];
                let act_y = import_activation(&mut g, graph, &mut act_map, node.output);
                let shape = graph.values[x as usize].shape.clone();
                let dx = g.add_node(OpKind::SoftmaxGrad, vec![act_y, dy], shape.clone(), Attr::default(), NO_REGION, 0);
                accumulate(&mut g, &mut grad_map, x, dx, shape);
            }
            OpKind::Rmsnorm => {
                let x = node.inputs[0];
                let gamma = node.inputs[1];
                let beta = node.inputs.get(2).copied();
                let act_x = import_activation(&mut g, graph, &mut act_map, x);
                let act_gamma = import_activation(&mut g, graph, &mut act_map, gamma);
                let act_y = import_activation(&mut g, graph, &mut act_map, node.output);

                let mut rg_inputs = vec![act_x, act_gamma, dy];
                if let Some(b) = beta {
                    rg_inputs.push(import_activation(&mut g, graph, &mut act_map, b));
                }
                let x_shape = graph.values[x as usize].shape.clone();
                let dx = g.add_node(OpKind::RmsnormGrad, rg_inputs, x_shape.clone(), Attr::default(), NO_REGION, 0);
                accumulate(&mut g, &mut grad_map, x, dx, x_shape.clone());

                let gamma_shape = g.values[act_gamma as usize].shape.clone();
                let xhat = if let Some(b) = beta {
                    let act_beta = import_activation(&mut g, graph, &mut act_map, b);
                    let numer = g.add_node(OpKind::Sub, vec![act_y, act_beta], x_shape.clone(), Attr::default(), NO_REGION, 0);
                    g.add_node(OpKind::Div, vec![numer, act_gamma], x_shape.clone(), Attr::default(), NO_REGION, 0)
                } else {
                    g.add_node(OpKind::Div, vec![act_y, act_gamma], x_shape.clone(), Attr::default(), NO_REGION, 0)
                };
                let dgamma_raw = g.add_node(OpKind::Mul, vec![dy, xhat], x_shape, Attr::default(), NO_REGION, 0);
                let dgamma = reduce_to_shape(&mut g, dgamma_raw, &gamma_shape);
                accumulate(&mut g, &mut grad_map, gamma, dgamma, gamma_shape);

                if let Some(b) = beta {
                    let beta_shape = graph.values[b as usize].shape.clone();
                    let dbeta = reduce_to_shape(&mut g, dy, &beta_shape);
                    accumulate(&mut g, &mut grad_map, b, dbeta, beta_shape);
                }
            }
            OpKind::ReduceSum => {
                let x = node.inputs[0];
                let shape = graph.values[x as usize].shape.clone();
                let attr = Attr {
                    shape: Some(shape.clone()),
                    ..Attr::default()
                };
                let dx = g.add_node(OpKind::Broadcast, vec![dy], shape.clone(), attr, NO_REGION, 0);
                accumulate(&mut g, &mut grad_map, x, dx, shape);
            }
            OpKind::ReduceMax => {
                let x = node.inputs[0];
                let act_x = import_activation(&mut g, graph, &mut act_map, x);
                let shape = graph.values[x as usize].shape.clone();
                let mask = g.add_node(OpKind::ReduceMaxMask, vec![act_x], shape.clone(), Attr::default(), NO_REGION, 0);
                let bcast_attr = Attr {
                    shape: Some(shape.clone()),
                    ..Attr::default()
                };
                let bcast = g.add_node(OpKind::Broadcast, vec![dy], shape.clone(), bcast_attr, NO_REGION, 0);
                let dx = g.add_node(OpKind::ReduceMaxGrad, vec![mask, bcast], shape.clone(), Attr::default(), NO_REGION, 0);
                accumulate(&mut g, &mut grad_map, x, dx, shape);
            }
            other => {
                eprintln!("autodiff: op {} not supported yet", other.name());
            }
        }
    }

    for v in &graph.values {
        if v.flags & VALUE_INPUT != 0 && v.producer.is_none() {
            if let Some(grad_id) = grad_map[v.id as usize] {
                g.mark_output(grad_id);
            }
        }
    }

    g
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;

    #[test]
    fn matmul_grad_has_two_outputs() {
        let src = "fn f(a: tensor<f16,[M,K]>, b: tensor<f16,[K,N]>) { let y = matmul(a,b); return y; }";
        let g = build_graph(src, None).unwrap();
        let grad = autodiff(&g);
        assert_eq!(grad.outputs.len(), 2);
        assert!(grad.nodes.iter().any(|n| n.op == OpKind::Matmul));
        assert!(grad.nodes.iter().any(|n| n.op == OpKind::Transpose));
    }

    #[test]
    fn silu_grad_emits_silu_grad_node() {
        let src = "fn f(x: tensor<f16,[N]>) { let y = silu(x); return y; }";
        let g = build_graph(src, None).unwrap();
        let grad = autodiff(&g);
        assert!(grad.nodes.iter().any(|n| n.op == OpKind::SiluGrad));
    }

    #[test]
    fn add_grad_fans_out_to_both_operands() {
        let src = "fn f(a: tensor<f16,[M,N]>, b: tensor<f16,[M,N]>) { let c = add(a,b); return c; }";
        let g = build_graph(src, None).unwrap();
        let grad = autodiff(&g);
        assert_eq!(grad.outputs.len(), 2);
    }

    #[test]
    fn unsupported_op_is_skipped_not_fatal() {
        // batch_matmul is not handled by a gradient rule; must not panic.
        let src = "fn f(a: tensor<f16,[B,M,K]>, b: tensor<f16,[B,K,N]>) { let y = batch_matmul(a,b); return y; }";
        let g = build_graph(src, None).unwrap();
        let grad = autodiff(&g);
        assert_eq!(grad.outputs.len(), 0);
    }
}
