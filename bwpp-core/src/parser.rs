//! Structural (AST) parser: tokens -> coarse op stream + region pool.
//! Does not build expression trees; see `graph` for the full parse.

use crate::ast::{AstModule, AstOp, RegionKind, RegionPolicy, NO_REGION, OPF_HAS_BIAS};
use crate::error::{Error, Result};
use crate::lexer::{Lexer, Token, TokenKind};

fn op_keyword(name: &str) -> Option<AstOp> {
    Some(match name {
        "matmul" => AstOp::Matmul,
        "batch_matmul" => AstOp::BatchMatmul,
        "transpose" => AstOp::Transpose,
        "permute" => AstOp::Permute,
        "reshape" => AstOp::Reshape,
        "add" => AstOp::Add,
        "sub" => AstOp::Sub,
        "mul" => AstOp::Mul,
        "div" => AstOp::Div,
        "reduce_sum" => AstOp::ReduceSum,
        "reduce_max" => AstOp::ReduceMax,
        "softmax" => AstOp::Softmax,
        "rmsnorm" => AstOp::Rmsnorm,
        "silu" => AstOp::Silu,
        _ => return None,
    })
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Option<Token<'a>>,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Parser {
            lexer: Lexer::new(source),
            lookahead: None,
        }
    }

    fn next(&mut self) -> Token<'a> {
        if let Some(tok) = self.lookahead.take() {
            return tok;
        }
        self.lexer.next()
    }

    fn unread(&mut self, tok: Token<'a>) {
        self.lookahead = Some(tok);
    }
}

/// Scans a parenthesized argument list (the opening `(` already consumed),
/// reporting whether it mentions the identifier `bias` and whether it
/// contains a nested `matmul` call or the `@` operator. Leaves the parser
/// positioned just past the matching `)`.
fn scan_bias_args(p: &mut Parser<'_>) -> (bool, bool) {
    let mut depth = 1u32;
    let mut has_bias = false;
    let mut has_nested_matmul = false;
    loop {
        let tok = p.next();
        match tok.kind {
            TokenKind::Eof => break,
            TokenKind::Symbol if tok.text == "(" => depth += 1,
            TokenKind::Symbol if tok.text == ")" => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            TokenKind::Symbol if tok.text == "@" => has_nested_matmul = true,
            TokenKind::Ident if tok.text == "bias" => has_bias = true,
            TokenKind::Ident if tok.text == "matmul" => has_nested_matmul = true,
            _ => {}
        }
    }
    (has_bias, has_nested_matmul)
}

/// Parses `source` into an `AstModule`. Fails only if the token stream
/// never advances (a parse error); this grammar is otherwise permissive —
/// unknown keywords are ignored.
pub fn parse_module(source: &str) -> Result<AstModule<'_>> {
    let mut p = Parser::new(source);
    let mut module = AstModule::new(source);

    let mut brace_depth: i64 = 0;
    let mut reversible_brace_depth: Option<i64> = None;
    let mut current_region: u32 = NO_REGION;
    let mut pending_reversible = false;
    let mut saw_any_token = false;

    loop {
        let tok = p.next();
        if tok.kind == TokenKind::Eof {
            break;
        }
        saw_any_token = true;

        match tok.kind {
            TokenKind::Symbol if tok.text == "{" => {
                brace_depth += 1;
                if pending_reversible && current_region == NO_REGION {
                    let id = module.add_region(RegionKind::Reversible, RegionPolicy::Auto);
                    current_region = id;
                    reversible_brace_depth = Some(brace_depth);
                    pending_reversible = false;
                }
            }
            TokenKind::Symbol if tok.text == "}" => {
                if current_region != NO_REGION && reversible_brace_depth == Some(brace_depth) {
                    current_region = NO_REGION;
                    reversible_brace_depth = None;
                }
                brace_depth -= 1;
            }
            TokenKind::Symbol if tok.text == "@" => {
                let next = p.next();
                if next.kind == TokenKind::Ident && next.text == "reversible" {
                    pending_reversible = true;
                }
                // `@meta`, `@impure`, and any other annotation are ignored.
            }
            TokenKind::Ident => {
                if let Some(op) = op_keyword(tok.text) {
                    let mut flags = 0u32;
                    let mut emit_matmul_first = false;

                    if op == AstOp::Add {
                        let open = p.next();
                        if open.kind == TokenKind::Symbol && open.text == "(" {
                            let (has_bias, has_nested_matmul) = scan_bias_args(&mut p);
                            if has_bias {
                                flags |= OPF_HAS_BIAS;
                            }
                            if has_nested_matmul {
                                emit_matmul_first = true;
                            }
                        } else {
                            p.unread(open);
                        }
                    }

                    if emit_matmul_first {
                        module.add_op(AstOp::Matmul, current_region, 0);
                    }
                    module.add_op(op, current_region, flags);
                }
                // Unknown identifiers (including `fn`, type names, bindings)
                // are ignored by this coarse pass.
            }
            _ => {}
        }
    }

    if !saw_any_token && !source.trim().is_empty() {
        return Err(Error::Parse("parse failed".to_string()));
    }

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_matmul_add() {
        let src = "fn f(a,b,bias) { let c = add(matmul(a,b), bias); return c; }";
        let m = parse_module(src).unwrap();
        assert_eq!(m.ops.len(), 2);
        assert_eq!(m.ops[0].op, AstOp::Matmul);
        assert_eq!(m.ops[1].op, AstOp::Add);
        assert_ne!(m.ops[1].flags & OPF_HAS_BIAS, 0);
    }

    #[test]
    fn at_operator_before_add_emits_matmul() {
        let src = "fn f(a,b,bias) { let c = add(a @ b, bias); return c; }";
        let m = parse_module(src).unwrap();
        assert_eq!(m.ops.len(), 2);
        assert_eq!(m.ops[0].op, AstOp::Matmul);
        assert_eq!(m.ops[1].op, AstOp::Add);
    }

    #[test]
    fn reversible_region_scopes_to_its_braces() {
        let src = "@reversible fn g(a,b) { let y = matmul(a,b); return y; }";
        let m = parse_module(src).unwrap();
        assert_eq!(m.regions.len(), 1);
        assert_eq!(m.regions[0].kind, RegionKind::Reversible);
        assert_eq!(m.ops[0].region_id, 0);
    }

    #[test]
    fn non_reversible_ops_have_no_region() {
        let src = "fn f(a,b) { let y = matmul(a,b); return y; }";
        let m = parse_module(src).unwrap();
        assert_eq!(m.ops[0].region_id, NO_REGION);
    }
}
