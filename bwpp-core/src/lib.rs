//! The BW++ compiler pipeline: lexer -> structural parser / typed graph
//! builder -> typecheck -> attention recognition -> autodiff -> memory
//! planning -> IR lowering -> tile kernel emission.

pub mod ast;
pub mod attention;
pub mod autodiff;
pub mod error;
pub mod graph;
pub mod ir;
pub mod lexer;
pub mod memplan;
pub mod parser;
pub mod tile;
pub mod typecheck;
pub mod types;

pub use error::{Error, Result};

/// Everything produced by compiling one source module through the full
/// graph path: the typed graph, whether it matched the attention pattern,
/// its gradient graph, and the IR lowered from the forward graph.
pub struct Compilation<'a> {
    pub graph: graph::Graph<'a>,
    pub has_attention: bool,
    pub gradient: graph::Graph<'a>,
    pub ir: ir::IrModule,
    pub mem_plan: memplan::MemPlan<'a>,
}

/// Runs the graph path end to end: typecheck, build, detect attention,
/// differentiate, lower to IR, and plan memory. Returns the first error
/// encountered by any stage.
pub fn compile<'a>(source: &'a str, entry: Option<&str>) -> Result<Compilation<'a>> {
    typecheck::typecheck_module(source)?;
    let graph = graph::build_graph(source, entry)?;
    let has_attention = attention::detect_attention(&graph);
    let gradient = autodiff::autodiff(&graph);
    let ir = ir::lower_graph(&graph, has_attention);
    let mem_plan = memplan::plan(&graph);
    Ok(Compilation {
        graph,
        has_attention,
        gradient,
        ir,
        mem_plan,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_end_to_end_matmul_bias() {
        let src = "fn f(a: tensor<f16,[M,K]>, b: tensor<f16,[K,N]>, bias: tensor<f16,[N]>) { \
                   let c = add(matmul(a,b), bias); return c; }";
        let out = compile(src, None).unwrap();
        assert!(!out.has_attention);
        assert_eq!(out.ir.ops.len(), 2);
        assert_eq!(out.mem_plan.buffers.len(), 2);
    }

    #[test]
    fn compile_rejects_k_mismatch() {
        let src = "fn f(a: tensor<f16,[M,K1]>, b: tensor<f16,[K2,N]>) { let c = matmul(a,b); return c; }";
        assert!(compile(src, None).is_err());
    }
}
