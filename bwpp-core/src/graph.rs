//! The typed SSA dataflow graph and its builder (§4.4). Values and nodes
//! reference each other only by index into the owning `Graph`'s pools;
//! pools are append-only and insertion order is topological order.

use std::collections::HashMap;

use crate::ast::{RegionKind, RegionPolicy};
use crate::error::{Error, Result};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::types::{Dtype, Layout, MAX_DIMS};

pub const NO_VALUE: u32 = u32::MAX;
pub const NO_REGION: u32 = u32::MAX;

pub const VALUE_INPUT: u32 = 1 << 0;
pub const VALUE_OUTPUT: u32 = 1 << 1;
pub const VALUE_CONST: u32 = 1 << 2;

pub const OPF_HAS_BIAS: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Matmul,
    BatchMatmul,
    Transpose,
    Permute,
    Reshape,
    Broadcast,
    Add,
    Sub,
    Mul,
    Div,
    ReduceSum,
    ReduceMax,
    Softmax,
    Rmsnorm,
    Silu,
    SiluGrad,
    SoftmaxGrad,
    RmsnormGrad,
    ReduceMaxMask,
    ReduceMaxGrad,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Matmul => "matmul",
            OpKind::BatchMatmul => "batch_matmul",
            OpKind::Transpose => "transpose",
            OpKind::Permute => "permute",
            OpKind::Reshape => "reshape",
            OpKind::Broadcast => "broadcast",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::ReduceSum => "reduce_sum",
            OpKind::ReduceMax => "reduce_max",
            OpKind::Softmax => "softmax",
            OpKind::Rmsnorm => "rmsnorm",
            OpKind::Silu => "silu",
            OpKind::SiluGrad => "silu_grad",
            OpKind::SoftmaxGrad => "softmax_grad",
            OpKind::RmsnormGrad => "rmsnorm_grad",
            OpKind::ReduceMaxMask => "reduce_max_mask",
            OpKind::ReduceMaxGrad => "reduce_max_grad",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shape<'a> {
    pub dims: Vec<&'a str>,
}

impl<'a> Shape<'a> {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn scalar() -> Self {
        Shape { dims: Vec::new() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Attr<'a> {
    pub axis: Option<i64>,
    pub epsilon: Option<f32>,
    pub shape: Option<Shape<'a>>,
    pub perm: Option<Vec<u32>>,
}

#[derive(Debug, Clone)]
pub struct Value<'a> {
    pub id: u32,
    pub name: Option<&'a str>,
    pub dtype: Dtype,
    pub shape: Shape<'a>,
    pub layout: Layout,
    pub producer: Option<u32>,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct Node<'a> {
    pub id: u32,
    pub op: OpKind,
    pub inputs: Vec<u32>,
    pub output: u32,
    pub attr: Attr<'a>,
    pub region_id: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GraphRegion {
    pub id: u32,
    pub kind: RegionKind,
    pub policy: RegionPolicy,
}

/// The typed dataflow graph. Owns every value, node, and region it
/// contains; nothing outlives the graph, and the graph never borrows from
/// another graph (the gradient graph built by `autodiff` is a fresh,
/// independent pool — see §4.6).
#[derive(Debug, Default)]
pub struct Graph<'a> {
    pub values: Vec<Value<'a>>,
    pub nodes: Vec<Node<'a>>,
    pub regions: Vec<GraphRegion>,
    pub outputs: Vec<u32>,
}

impl<'a> Graph<'a> {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn add_value(
        &mut self,
        name: Option<&'a str>,
        dtype: Dtype,
        shape: Shape<'a>,
        layout: Layout,
        producer: Option<u32>,
        flags: u32,
    ) -> u32 {
        let id = self.values.len() as u32;
        self.values.push(Value {
            id,
            name,
            dtype,
            shape,
            layout,
            producer,
            flags,
        });
        id
    }

    pub fn add_region(&mut self, kind: RegionKind, policy: RegionPolicy) -> u32 {
        let id = self.regions.len() as u32;
        self.regions.push(GraphRegion { id, kind, policy });
        id
    }

    /// Appends a node computing `op` over `inputs`, producing a fresh
    /// value with `shape`, inheriting dtype/layout from the first input
    /// (or `Unknown` if there is none, e.g. a bare constant).
    pub fn add_node(
        &mut self,
        op: OpKind,
        inputs: Vec<u32>,
        shape: Shape<'a>,
        attr: Attr<'a>,
        region_id: u32,
        flags: u32,
    ) -> u32 {
        let node_id = self.nodes.len() as u32;
        let (dtype, layout) = match inputs.first() {
            Some(&v) => (self.values[v as usize].dtype, self.values[v as usize].layout),
            None => (Dtype::Unknown, Layout::Unknown),
        };
        let out = self.add_value(None, dtype, shape, layout, Some(node_id), 0);
        self.nodes.push(Node {
            id: node_id,
            op,
            inputs,
            output: out,
            attr,
            region_id,
            flags,
        });
        out
    }

    pub fn mark_output(&mut self, value_id: u32) {
        self.values[value_id as usize].flags |= VALUE_OUTPUT;
        if !self.outputs.contains(&value_id) {
            self.outputs.push(value_id);
        }
    }

    pub fn const_scalar(&mut self, text: &'a str) -> u32 {
        self.add_value(
            Some(text),
            Dtype::Unknown,
            Shape::scalar(),
            Layout::Unknown,
            None,
            VALUE_CONST,
        )
    }
}

// ---------------------------------------------------------------------
// Shape inference (§4.4)
// ---------------------------------------------------------------------

pub fn infer_matmul<'a>(a: &Shape<'a>, b: &Shape<'a>) -> Shape<'a> {
    if a.rank() == 2 && b.rank() == 2 {
        Shape {
            dims: vec![a.dims[0], b.dims[1]],
        }
    } else {
        a.clone()
    }
}

/// Right-aligned broadcast: dims are compared from the trailing axis
/// inward, a `"1"` on either side yields the other side's dim.
pub fn infer_elementwise<'a>(a: &Shape<'a>, b: &Shape<'a>) -> Shape<'a> {
    let rank = a.rank().max(b.rank());
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = a.rank().checked_sub(rank - i).and_then(|idx| a.dims.get(idx)).copied().unwrap_or("1");
        let db = b.rank().checked_sub(rank - i).and_then(|idx| b.dims.get(idx)).copied().unwrap_or("1");
        dims.push(if da != "1" { da } else { db });
    }
    Shape { dims }
}

pub fn infer_transpose<'a>(x: &Shape<'a>) -> Shape<'a> {
    if x.rank() == 2 {
        Shape {
            dims: vec![x.dims[1], x.dims[0]],
        }
    } else {
        x.clone()
    }
}

pub fn infer_permute<'a>(x: &Shape<'a>, axes: &[u32]) -> Shape<'a> {
    let mut dims = Vec::with_capacity(x.rank());
    for (i, &ax) in axes.iter().enumerate() {
        let idx = if (ax as usize) < x.rank() { ax as usize } else { i };
        dims.push(x.dims[idx.min(x.rank().saturating_sub(1))]);
    }
    if dims.is_empty() {
        x.clone()
    } else {
        Shape { dims }
    }
}

pub fn infer_reduce<'a>(x: &Shape<'a>, axis: i64) -> Shape<'a> {
    let rank = x.rank();
    if rank == 0 {
        return x.clone();
    }
    let idx = if axis < 0 {
        rank - 1
    } else {
        (axis as usize).min(rank - 1)
    };
    let mut dims = x.dims.clone();
    dims[idx] = "1";
    Shape { dims }
}

// ---------------------------------------------------------------------
// Graph builder: recursive-descent expression parser over one function.
// ---------------------------------------------------------------------

struct Cursor<'a> {
    lexer: Lexer<'a>,
    lookahead: Option<Token<'a>>,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Cursor {
            lexer: Lexer::new(source),
            lookahead: None,
        }
    }

    fn next(&mut self) -> Token<'a> {
        if let Some(t) = self.lookahead.take() {
            return t;
        }
        self.lexer.next()
    }

    fn peek(&mut self) -> Token<'a> {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.lexer.next());
        }
        self.lookahead.unwrap()
    }

    fn expect_symbol(&mut self, s: &str) -> Result<()> {
        let t = self.next();
        if t.kind == TokenKind::Symbol && t.text == s {
            Ok(())
        } else {
            Err(Error::Parse("parse failed".to_string()))
        }
    }

    fn at_symbol(&mut self, s: &str) -> bool {
        let t = self.peek();
        t.kind == TokenKind::Symbol && t.text == s
    }

    fn at_eof(&mut self) -> bool {
        self.peek().kind == TokenKind::Eof
    }
}

struct Builder<'a> {
    graph: Graph<'a>,
    bindings: HashMap<&'a str, u32>,
    current_region: u32,
}

const OP_KEYWORDS: &[&str] = &[
    "matmul",
    "batch_matmul",
    "transpose",
    "reshape",
    "permute",
    "softmax",
    "silu",
    "rmsnorm",
    "reduce_sum",
    "reduce_max",
    "add",
    "sub",
    "mul",
    "div",
];

impl<'a> Builder<'a> {
    fn new() -> Self {
        Builder {
            graph: Graph::new(),
            bindings: HashMap::new(),
            current_region: NO_REGION,
        }
    }

    fn binding_value(&mut self, name: &'a str) -> u32 {
        if let Some(&v) = self.bindings.get(name) {
            return v;
        }
        let v = self
            .graph
            .add_value(Some(name), Dtype::Unknown, Shape::scalar(), Layout::Unknown, None, VALUE_INPUT);
        self.bindings.insert(name, v);
        v
    }

    fn emit(&mut self, op: OpKind, inputs: Vec<u32>, shape: Shape<'a>, attr: Attr<'a>, flags: u32) -> u32 {
        self.graph
            .add_node(op, inputs, shape, attr, self.current_region, flags)
    }

    fn shape_of(&self, v: u32) -> Shape<'a> {
        self.graph.values[v as usize].shape.clone()
    }

    fn parse_dim_list(&mut self, cur: &mut Cursor<'a>) -> Result<Vec<&'a str>> {
        cur.expect_symbol("[")?;
        let mut dims = Vec::new();
        loop {
            let t = cur.peek();
            if t.kind == TokenKind::Symbol && t.text == "]" {
                cur.next();
                break;
            }
            if t.kind == TokenKind::Ident || t.kind == TokenKind::Number {
                cur.next();
                if dims.len() < MAX_DIMS {
                    dims.push(t.text);
                }
            } else if t.kind == TokenKind::Symbol && t.text == "," {
                cur.next();
            } else {
                return Err(Error::Parse("parse failed".to_string()));
            }
        }
        Ok(dims)
    }

    fn parse_axis_list(&mut self, cur: &mut Cursor<'a>) -> Result<Vec<u32>> {
        cur.expect_symbol("[")?;
        let mut axes = Vec::new();
        loop {
            let t = cur.peek();
            if t.kind == TokenKind::Symbol && t.text == "]" {
                cur.next();
                break;
            }
            if t.kind == TokenKind::Number {
                cur.next();
                axes.push(t.text.parse::<u32>().unwrap_or(0));
            } else if t.kind == TokenKind::Symbol && t.text == "," {
                cur.next();
            } else {
                return Err(Error::Parse("parse failed".to_string()));
            }
        }
        Ok(axes)
    }

    /// Parses a single expression (primary, then any `@` chain).
    fn parse_expr(&mut self, cur: &mut Cursor<'a>) -> Result<u32> {
        let mut left = self.parse_primary(cur)?;
        while cur.at_symbol("@") {
            cur.next();
            let right = self.parse_primary(cur)?;
            let shape = infer_matmul(&self.shape_of(left), &self.shape_of(right));
            left = self.emit(OpKind::Matmul, vec![left, right], shape, Attr::default(), 0);
        }
        Ok(left)
    }

    fn parse_primary(&mut self, cur: &mut Cursor<'a>) -> Result<u32> {
        let tok = cur.next();
        match tok.kind {
            TokenKind::Number => Ok(self.graph.const_scalar(tok.text)),
            TokenKind::Symbol if tok.text == "(" => {
                let inner = self.parse_expr(cur)?;
                cur.expect_symbol(")")?;
                Ok(inner)
            }
            TokenKind::Ident if OP_KEYWORDS.contains(&tok.text) && cur.at_symbol("(") => {
                self.parse_call(cur, tok.text)
            }
            TokenKind::Ident => Ok(self.binding_value(tok.text)),
            _ => Err(Error::Parse("parse failed".to_string())),
        }
    }

    fn parse_call(&mut self, cur: &mut Cursor<'a>, name: &'a str) -> Result<u32> {
        cur.expect_symbol("(")?;
        let value = match name {
            "matmul" | "batch_matmul" => {
                let a = self.parse_expr(cur)?;
                cur.expect_symbol(",")?;
                let b = self.parse_expr(cur)?;
                let shape = if name == "matmul" {
                    infer_matmul(&self.shape_of(a), &self.shape_of(b))
                } else {
                    self.shape_of(a)
                };
                let op = if name == "matmul" { OpKind::Matmul } else { OpKind::BatchMatmul };
                self.emit(op, vec![a, b], shape, Attr::default(), 0)
            }
            "transpose" => {
                let x = self.parse_expr(cur)?;
                let shape = infer_transpose(&self.shape_of(x));
                self.emit(OpKind::Transpose, vec![x], shape, Attr::default(), 0)
            }
            "silu" => {
                let x = self.parse_expr(cur)?;
                let shape = self.shape_of(x);
                self.emit(OpKind::Silu, vec![x], shape, Attr::default(), 0)
            }
            "reshape" => {
                let x = self.parse_expr(cur)?;
                cur.expect_symbol(",")?;
                let dims = self.parse_dim_list(cur)?;
                let shape = Shape { dims: dims.clone() };
                let attr = Attr {
                    shape: Some(Shape { dims }),
                    ..Attr::default()
                };
                self.emit(OpKind::Reshape, vec![x], shape, attr, 0)
            }
            "permute" => {
                let x = self.parse_expr(cur)?;
                cur.expect_symbol(",")?;
                let axes = self.parse_axis_list(cur)?;
                let shape = infer_permute(&self.shape_of(x), &axes);
                let attr = Attr {
                    perm: Some(axes),
                    ..Attr::default()
                };
                self.emit(OpKind::Permute, vec![x], shape, attr, 0)
            }
            "softmax" => {
                let x = self.parse_expr(cur)?;
                let mut axis = None;
                if cur.at_symbol(",") {
                    cur.next();
                    let t = cur.next();
                    axis = t.text.parse::<i64>().ok();
                }
                let shape = self.shape_of(x);
                let attr = Attr {
                    axis,
                    ..Attr::default()
                };
                self.emit(OpKind::Softmax, vec![x], shape, attr, 0)
            }
            "reduce_sum" | "reduce_max" => {
                let x = self.parse_expr(cur)?;
                let mut axis = -1i64;
                if cur.at_symbol(",") {
                    cur.next();
                    let t = cur.next();
                    axis = t.text.parse::<i64>().unwrap_or(-1);
                }
                let shape = infer_reduce(&self.shape_of(x), axis);
                let attr = Attr {
                    axis: Some(axis),
                    ..Attr::default()
                };
                let op = if name == "reduce_sum" {
                    OpKind::ReduceSum
                } else {
                    OpKind::ReduceMax
                };
                self.emit(op, vec![x], shape, attr, 0)
            }
            "rmsnorm" => {
                let x = self.parse_expr(cur)?;
                cur.expect_symbol(",")?;
                let gamma = self.parse_expr(cur)?;
                let mut inputs = vec![x, gamma];
                let mut epsilon = None;
                if cur.at_symbol(",") {
                    cur.next();
                    if cur.peek().kind == TokenKind::Number {
                        let t = cur.next();
                        epsilon = t.text.parse::<f32>().ok();
                    } else {
                        let beta = self.parse_expr(cur)?;
                        inputs.push(beta);
                        if cur.at_symbol(",") {
                            cur.next();
                            let t = cur.next();
                            epsilon = t.text.parse::<f32>().ok();
                        }
                    }
                }
                let shape = self.shape_of(x);
                let attr = Attr {
                    epsilon,
                    ..Attr::default()
                };
                self.emit(OpKind::Rmsnorm, inputs, shape, attr, 0)
            }
            "add" | "sub" | "mul" | "div" => {
                let mut is_bias_arg = |cur: &mut Cursor<'a>| -> bool {
                    let t = cur.peek();
                    t.kind == TokenKind::Ident && t.text == "bias"
                };
                let mut flags = 0u32;
                if name == "add" && is_bias_arg(cur) {
                    flags |= OPF_HAS_BIAS;
                }
                let first = self.parse_expr(cur)?;
                let mut inputs = vec![first];
                let mut shape = self.shape_of(first);
                while cur.at_symbol(",") {
                    cur.next();
                    if name == "add" && is_bias_arg(cur) {
                        flags |= OPF_HAS_BIAS;
                    }
                    let next = self.parse_expr(cur)?;
                    shape = infer_elementwise(&shape, &self.shape_of(next));
                    if inputs.len() < MAX_DIMS {
                        inputs.push(next);
                    }
                }
                let op = match name {
                    "add" => OpKind::Add,
                    "sub" => OpKind::Sub,
                    "mul" => OpKind::Mul,
                    _ => OpKind::Div,
                };
                self.emit(op, inputs, shape, Attr::default(), flags)
            }
            _ => return Err(Error::Parse("parse failed".to_string())),
        };
        cur.expect_symbol(")")?;
        Ok(value)
    }

    /// Parses `(name: tensor<dtype, [dims...], layout?>, ...)` immediately
    /// after the opening paren has been consumed, creating one input
    /// value per parameter.
    fn parse_params(&mut self, cur: &mut Cursor<'a>) -> Result<()> {
        loop {
            if cur.at_symbol(")") {
                cur.next();
                return Ok(());
            }
            let name_tok = cur.next();
            if name_tok.kind != TokenKind::Ident {
                return Err(Error::Parse("parse failed".to_string()));
            }
            cur.expect_symbol(":")?;
            let tensor_kw = cur.next();
            if !(tensor_kw.kind == TokenKind::Ident && tensor_kw.text == "tensor") {
                return Err(Error::Parse("parse failed".to_string()));
            }
            cur.expect_symbol("<")?;
            let dtype_tok = cur.next();
            let dtype = Dtype::parse(dtype_tok.text);
            cur.expect_symbol(",")?;
            let dims = self.parse_dim_list(cur)?;
            let mut layout = Layout::Unknown;
            if cur.at_symbol(",") {
                cur.next();
                let layout_tok = cur.next();
                if layout_tok.kind == TokenKind::Ident {
                    layout = Layout::parse(layout_tok.text);
                }
            }
            cur.expect_symbol(">")?;
            let v = self.graph.add_value(
                Some(name_tok.text),
                dtype,
                Shape { dims },
                layout,
                None,
                VALUE_INPUT,
            );
            self.bindings.insert(name_tok.text, v);
            if cur.at_symbol(",") {
                cur.next();
                continue;
            }
            cur.expect_symbol(")")?;
            return Ok(());
        }
    }

    fn parse_statement(&mut self, cur: &mut Cursor<'a>) -> Result<bool> {
        let tok = cur.next();
        if tok.kind == TokenKind::Symbol && tok.text == "}" {
            return Ok(false);
        }
        if tok.kind == TokenKind::Ident && tok.text == "let" {
            let name_tok = cur.next();
            if name_tok.kind != TokenKind::Ident {
                return Err(Error::Parse("parse failed".to_string()));
            }
            cur.expect_symbol("=")?;
            let v = self.parse_expr(cur)?;
            cur.expect_symbol(";")?;
            self.bindings.insert(name_tok.text, v);
            return Ok(true);
        }
        if tok.kind == TokenKind::Ident && tok.text == "return" {
            let v = self.parse_expr(cur)?;
            cur.expect_symbol(";")?;
            self.graph.mark_output(v);
            return Ok(true);
        }
        Err(Error::Parse("parse failed".to_string()))
    }
}

/// Skips a balanced `(...)`/`{...}` region, used while scanning past
/// functions that are not the compilation entry point. `opener` must be
/// the already-consumed opening delimiter.
fn skip_balanced(cur: &mut Cursor<'_>, opener: &str, closer: &str) -> Result<()> {
    let mut depth = 1u32;
    loop {
        let t = cur.next();
        if t.kind == TokenKind::Eof {
            return Err(Error::Parse("parse failed".to_string()));
        }
        if t.kind == TokenKind::Symbol && t.text == opener {
            depth += 1;
        } else if t.kind == TokenKind::Symbol && t.text == closer {
            depth -= 1;
            if depth == 0 {
                return Ok(());
            }
        }
    }
}

/// Builds a typed dataflow graph from `source`, compiling the function
/// named `entry` if given, else the first function declared.
pub fn build_graph<'a>(source: &'a str, entry: Option<&str>) -> Result<Graph<'a>> {
    let mut cur = Cursor::new(source);
    let mut builder = Builder::new();
    let mut pending_reversible = false;
    let mut found = false;

    loop {
        if cur.at_eof() {
            break;
        }
        let tok = cur.next();
        match tok.kind {
            TokenKind::Symbol if tok.text == "@" => {
                let next = cur.next();
                if next.kind == TokenKind::Ident && next.text == "reversible" {
                    pending_reversible = true;
                }
            }
            TokenKind::Ident if tok.text == "fn" => {
                let name_tok = cur.next();
                let name = name_tok.text;
                let is_target = !found && (entry.is_none() || entry == Some(name));

                cur.expect_symbol("(")?;
                if is_target {
                    builder.parse_params(&mut cur)?;
                } else {
                    skip_balanced(&mut cur, "(", ")")?;
                }

                // optional `-> tensor<...>` return-type annotation.
                if cur.at_symbol("-") {
                    cur.next();
                    cur.expect_symbol(">")?;
                    // tensor<...> — skip to the next `{`.
                    loop {
                        let t = cur.next();
                        if t.kind == TokenKind::Symbol && t.text == "{" {
                            if is_target {
                                if pending_reversible {
                                    builder.current_region =
                                        builder.graph.add_region(RegionKind::Reversible, RegionPolicy::Auto);
                                    pending_reversible = false;
                                }
                                loop {
                                    if !builder.parse_statement(&mut cur)? {
                                        break;
                                    }
                                }
                                found = true;
                            } else {
                                skip_balanced(&mut cur, "{", "}")?;
                            }
                            break;
                        }
                        if t.kind == TokenKind::Eof {
                            return Err(Error::Parse("parse failed".to_string()));
                        }
                    }
                } else {
                    cur.expect_symbol("{")?;
                    if is_target {
                        if pending_reversible {
                            builder.current_region =
                                builder.graph.add_region(RegionKind::Reversible, RegionPolicy::Auto);
                            pending_reversible = false;
                        }
                        loop {
                            if !builder.parse_statement(&mut cur)? {
                                break;
                            }
                        }
                        found = true;
                    } else {
                        skip_balanced(&mut cur, "{", "}")?;
                    }
                }
            }
            _ => {}
        }
    }

    if !found {
        return Err(Error::Build("entry function not found".to_string()));
    }

    Ok(builder.graph)
}

/// Renders `graph` as a Graphviz `digraph bwpp`: ellipse nodes for values
/// (blue fill for inputs, green for outputs), box nodes for ops, edges
/// running operand -> op -> result.
pub fn dot_dump(graph: &Graph<'_>) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    let _ = writeln!(out, "digraph bwpp {{");
    for v in &graph.values {
        let label = format!("{}\\n{} [{}]", v.name.unwrap_or(""), v.dtype.name(), v.shape.dims.join(","));
        let fill = if v.flags & VALUE_INPUT != 0 {
            Some("lightblue")
        } else if v.flags & VALUE_OUTPUT != 0 {
            Some("lightgreen")
        } else {
            None
        };
        match fill {
            Some(color) => {
                let _ = writeln!(out, "  v{} [shape=ellipse,label=\"{}\",style=filled,fillcolor={}];", v.id, label, color);
            }
            None => {
                let _ = writeln!(out, "  v{} [shape=ellipse,label=\"{}\"];", v.id, label);
            }
        }
    }
    for n in &graph.nodes {
        let _ = writeln!(out, "  n{} [shape=box,label=\"{}\"];", n.id, n.op.name());
        for &input in &n.inputs {
            let _ = writeln!(out, "  v{} -> n{};", input, n.id);
        }
        let _ = writeln!(out, "  n{} -> v{};", n.id, n.output);
    }
    let _ = writeln!(out, "}}");
    out
}
