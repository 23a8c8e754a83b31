//! IR lowering (§4.8): a thin stage that flattens either AST op stream or
//! graph into an ordered, flat op list ready for tile selection.

use crate::ast::{AstModule, AstOp, RegionKind, RegionPolicy, NO_REGION as AST_NO_REGION};
use crate::graph::{Graph, OpKind};

pub const NO_REGION: u32 = u32::MAX;
pub const MODF_HAS_ATTENTION: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrOp {
    Matmul,
    BatchMatmul,
    Transpose,
    Permute,
    Reshape,
    Add,
    Sub,
    Mul,
    Div,
    ReduceSum,
    ReduceMax,
    Softmax,
    Rmsnorm,
    Silu,
}

impl IrOp {
    pub fn name(&self) -> &'static str {
        match self {
            IrOp::Matmul => "matmul",
            IrOp::BatchMatmul => "batch_matmul",
            IrOp::Transpose => "transpose",
            IrOp::Permute => "permute",
            IrOp::Reshape => "reshape",
            IrOp::Add => "add",
            IrOp::Sub => "sub",
            IrOp::Mul => "mul",
            IrOp::Div => "div",
            IrOp::ReduceSum => "reduce_sum",
            IrOp::ReduceMax => "reduce_max",
            IrOp::Softmax => "softmax",
            IrOp::Rmsnorm => "rmsnorm",
            IrOp::Silu => "silu",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IrInstr {
    pub op: IrOp,
    pub region_id: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct IrRegion {
    pub id: u32,
    pub kind: RegionKind,
    pub policy: RegionPolicy,
}

#[derive(Debug, Default)]
pub struct IrModule {
    pub ops: Vec<IrInstr>,
    pub regions: Vec<IrRegion>,
    pub flags: u32,
}

impl IrModule {
    pub fn has_attention(&self) -> bool {
        self.flags & MODF_HAS_ATTENTION != 0
    }
}

fn ast_op_to_ir(op: AstOp) -> IrOp {
    match op {
        AstOp::Matmul => IrOp::Matmul,
        AstOp::BatchMatmul => IrOp::BatchMatmul,
        AstOp::Transpose => IrOp::Transpose,
        AstOp::Permute => IrOp::Permute,
        AstOp::Reshape => IrOp::Reshape,
        AstOp::Add => IrOp::Add,
        AstOp::Sub => IrOp::Sub,
        AstOp::Mul => IrOp::Mul,
        AstOp::Div => IrOp::Div,
        AstOp::ReduceSum => IrOp::ReduceSum,
        AstOp::ReduceMax => IrOp::ReduceMax,
        AstOp::Softmax => IrOp::Softmax,
        AstOp::Rmsnorm => IrOp::Rmsnorm,
        AstOp::Silu => IrOp::Silu,
    }
}

/// Maps a graph op to its IR equivalent. Gradient-only op kinds (the
/// `*_grad`/`*_mask`/`broadcast` family produced only by autodiff) have no
/// IR form and are silently skipped by the caller.
fn graph_op_to_ir(op: OpKind) -> Option<IrOp> {
    Some(match op {
        OpKind::Matmul => IrOp::Matmul,
        OpKind::BatchMatmul => IrOp::BatchMatmul,
        OpKind::Transpose => IrOp::Transpose,
        OpKind::Permute => IrOp::Permute,
        OpKind::Reshape => IrOp::Reshape,
        OpKind::Add => IrOp::Add,
        OpKind::Sub => IrOp::Sub,
        OpKind::Mul => IrOp::Mul,
        OpKind::Div => IrOp::Div,
        OpKind::ReduceSum => IrOp::ReduceSum,
        OpKind::ReduceMax => IrOp::ReduceMax,
        OpKind::Softmax => IrOp::Softmax,
        OpKind::Rmsnorm => IrOp::Rmsnorm,
        OpKind::Silu => IrOp::Silu,
        OpKind::Broadcast
        | OpKind::SiluGrad
        | OpKind::SoftmaxGrad
        | OpKind::RmsnormGrad
        | OpKind::ReduceMaxMask
        | OpKind::ReduceMaxGrad => return None,
    })
}

/// Lowers the legacy AST op stream (§4.2) into a flat IR module.
pub fn lower_ast(ast: &AstModule<'_>) -> IrModule {
    let mut m = IrModule::default();
    for r in &ast.regions {
        m.regions.push(IrRegion {
            id: r.id,
            kind: r.kind,
            policy: r.policy,
        });
    }
    for instr in &ast.ops {
        let region_id = if instr.region_id == AST_NO_REGION {
            NO_REGION
        } else {
            instr.region_id
        };
        m.ops.push(IrInstr {
            op: ast_op_to_ir(instr.op),
            region_id,
            flags: instr.flags,
        });
    }
    m
}

/// Lowers a typed dataflow graph into a flat IR module, dropping any node
/// whose op has no IR equivalent.
pub fn lower_graph(graph: &Graph<'_>, has_attention: bool) -> IrModule {
    let mut m = IrModule::default();
    for r in &graph.regions {
        m.regions.push(IrRegion {
            id: r.id,
            kind: r.kind,
            policy: r.policy,
        });
    }
    for node in &graph.nodes {
        if let Some(op) = graph_op_to_ir(node.op) {
            let region_id = if node.region_id == crate::graph::NO_REGION {
                NO_REGION
            } else {
                node.region_id
            };
            m.ops.push(IrInstr {
                op,
                region_id,
                flags: node.flags,
            });
        }
    }
    if has_attention {
        m.flags |= MODF_HAS_ATTENTION;
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;
    use crate::parser::parse_module;

    #[test]
    fn lowers_ast_op_stream() {
        let src = "fn f(a,b,bias) { let c = add(matmul(a,b), bias); return c; }";
        let ast = parse_module(src).unwrap();
        let ir = lower_ast(&ast);
        assert_eq!(ir.ops.len(), 2);
        assert_eq!(ir.ops[0].op, IrOp::Matmul);
        assert_eq!(ir.ops[1].op, IrOp::Add);
    }

    #[test]
    fn drops_gradient_only_ops_from_graph() {
        let src = "fn f(x: tensor<f16,[N]>) { let y = silu(x); return y; }";
        let g = build_graph(src, None).unwrap();
        let grad = crate::autodiff::autodiff(&g);
        assert_eq!(grad.nodes.len(), 1);
        let ir = lower_graph(&grad, false);
        assert!(ir.ops.is_empty());
    }

    #[test]
    fn attention_flag_propagates() {
        let src = "fn f(a: tensor<f16,[M,K]>, b: tensor<f16,[K,N]>) { let y = matmul(a,b); return y; }";
        let g = build_graph(src, None).unwrap();
        let ir = lower_graph(&g, true);
        assert!(ir.has_attention());
    }
}
