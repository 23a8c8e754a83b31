//! Tile IR selection and Metal-family kernel emission (§4.9).

use std::fmt::Write as _;

use crate::ast::{RegionKind, RegionPolicy};
use crate::graph::OPF_HAS_BIAS;
use crate::ir::{IrModule, IrOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFamily {
    Matmul,
    Attention,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Epilogue {
    None,
    Add,
    Silu,
    AddSilu,
}

impl Epilogue {
    fn name(&self) -> &'static str {
        match self {
            Epilogue::None => "none",
            Epilogue::Add => "add",
            Epilogue::Silu => "silu",
            Epilogue::AddSilu => "add_silu",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Triple {
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

/// Clamps an (m, n, k) tile request down to its minimum axis whenever the
/// axes disagree, reporting whether clamping occurred.
fn clamp_tile(requested: Triple) -> (Triple, bool) {
    if requested.m == requested.n && requested.n == requested.k {
        (requested, false)
    } else {
        let min = requested.m.min(requested.n).min(requested.k);
        (Triple { m: min, n: min, k: min }, true)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TilePlanStep {
    pub op: &'static str,
    pub role: u32,
}

pub struct Selection {
    pub family: KernelFamily,
    pub epilogue: Epilogue,
    pub block: Triple,
    pub tile: Triple,
    pub tile_requested: Option<Triple>,
    pub has_softmax: bool,
    pub has_rmsnorm: bool,
    pub attention_plan: Vec<TilePlanStep>,
}

const BLOCK: Triple = Triple { m: 128, n: 128, k: 32 };
const TILE_REQUEST: Triple = Triple { m: 16, n: 16, k: 16 };

pub fn select(ir: &IrModule) -> Selection {
    let has_matmul = ir.ops.iter().any(|i| i.op == IrOp::Matmul);
    let has_attention = ir.has_attention();
    let has_bias = ir
        .ops
        .iter()
        .any(|i| i.op == IrOp::Add && i.flags & OPF_HAS_BIAS != 0);
    let has_silu = ir.ops.iter().any(|i| i.op == IrOp::Silu);
    let has_softmax = ir.ops.iter().any(|i| i.op == IrOp::Softmax);
    let has_rmsnorm = ir.ops.iter().any(|i| i.op == IrOp::Rmsnorm);

    let family = if has_attention {
        KernelFamily::Attention
    } else if has_matmul {
        KernelFamily::Matmul
    } else {
        KernelFamily::None
    };

    let epilogue = if family == KernelFamily::Matmul {
        match (has_bias, has_silu) {
            (true, true) => Epilogue::AddSilu,
            (true, false) => Epilogue::Add,
            (false, true) => Epilogue::Silu,
            (false, false) => Epilogue::None,
        }
    } else {
        Epilogue::None
    };

    let (tile, clamped) = clamp_tile(TILE_REQUEST);
    let tile_requested = if clamped { Some(TILE_REQUEST) } else { None };

    let attention_plan = if family == KernelFamily::Attention {
        vec![
            TilePlanStep { op: "load", role: 0 },
            TilePlanStep { op: "load", role: 1 },
            TilePlanStep { op: "matmul", role: 3 },
            TilePlanStep { op: "softmax", role: 3 },
            TilePlanStep { op: "load", role: 2 },
            TilePlanStep { op: "matmul", role: 3 },
            TilePlanStep { op: "store", role: 3 },
        ]
    } else {
        Vec::new()
    };

    Selection {
        family,
        epilogue,
        block: BLOCK,
        tile,
        tile_requested,
        has_softmax,
        has_rmsnorm,
        attention_plan,
    }
}

fn reversible_policy_summary(ir: &IrModule) -> &'static str {
    let mut has_store = false;
    let mut has_recompute = false;
    let mut has_auto = false;
    for r in &ir.regions {
        match r.policy {
            RegionPolicy::Store => has_store = true,
            RegionPolicy::Recompute => has_recompute = true,
            RegionPolicy::Auto => has_auto = true,
        }
    }
    if has_store && !has_recompute && !has_auto {
        "store"
    } else if has_recompute && !has_store && !has_auto {
        "recompute"
    } else if has_store || has_recompute {
        "mixed"
    } else {
        "auto"
    }
}

/// Emits the full kernel source file text: banner, `bwpp.meta:` lines,
/// `bwpp.plan:` lines (attention only), then the kernel template.
pub fn emit(ir: &IrModule) -> String {
    let sel = select(ir);
    let mut out = String::new();

    let _ = writeln!(out, "// BW++ Metal output stub");
    let _ = writeln!(
        out,
        "// bwpp.meta: ops={} reversible_regions={}",
        ir.ops.len(),
        ir.regions.len()
    );
    let _ = writeln!(out, "// bwpp.meta: reversible_policy={}", reversible_policy_summary(ir));
    for r in &ir.regions {
        let kind = if r.kind == RegionKind::Reversible { "reversible" } else { "normal" };
        let policy = match r.policy {
            RegionPolicy::Store => "store",
            RegionPolicy::Recompute => "recompute",
            RegionPolicy::Auto => "auto",
        };
        let _ = writeln!(out, "// bwpp.meta: region={} kind={} policy={}", r.id, kind, policy);
    }

    match sel.family {
        KernelFamily::Matmul => {
            let _ = writeln!(out, "// bwpp.meta: kernel=matmul_f16");
            let _ = writeln!(out, "// bwpp.meta: layout=row_major");
            let _ = writeln!(out, "// bwpp.meta: block={},{},{}", sel.block.m, sel.block.n, sel.block.k);
            if let Some(req) = sel.tile_requested {
                let _ = writeln!(out, "// bwpp.meta: tile_requested={},{},{}", req.m, req.n, req.k);
                let _ = writeln!(out, "// bwpp.meta: tile_clamped=1");
            }
            let _ = writeln!(out, "// bwpp.meta: tile={},{},{}", sel.tile.m, sel.tile.n, sel.tile.k);
            let _ = writeln!(out, "// bwpp.meta: epilogue={}", sel.epilogue.name());
            let _ = writeln!(out, "// bwpp.meta: params=M,N,K,lda,ldb,ldc\n");
        }
        KernelFamily::Attention => {
            let _ = writeln!(out, "// bwpp.meta: kernel=attention_f16");
            let _ = writeln!(out, "// bwpp.meta: attention_plan=tile_ir_stub");
            let _ = writeln!(out, "// bwpp.meta: fused_attention_candidate=1");
            let _ = writeln!(out, "// bwpp.meta: layout=row_major");
            let _ = writeln!(out, "// bwpp.meta: block={},{},{}", sel.block.m, sel.block.n, sel.block.k);
            let _ = writeln!(out, "// bwpp.meta: tile={},{},{}", sel.tile.m, sel.tile.n, sel.tile.k);
            let _ = writeln!(out, "// bwpp.meta: params=M,N,K,D,ldq,ldk,ldv,ldo\n");
            for (i, step) in sel.attention_plan.iter().enumerate() {
                let _ = writeln!(out, "// bwpp.plan: {}={} role={}", i, step.op, step.role);
            }
            let _ = writeln!(out);
        }
        KernelFamily::None => {
            let _ = writeln!(out, "// bwpp.meta: kernel=none\n");
        }
    }

    if sel.has_softmax {
        let _ = writeln!(out, "// bwpp.meta: aux_kernel=softmax_f16");
    }
    if sel.has_rmsnorm {
        let _ = writeln!(out, "// bwpp.meta: aux_kernel=rmsnorm_f16");
    }

    match sel.family {
        KernelFamily::Matmul => {
            let _ = writeln!(out, "#include <metal_stdlib>");
            let _ = writeln!(out, "using namespace metal;\n");
            let _ = writeln!(out, "#define TILE_M {}", sel.tile.m);
            let _ = writeln!(out, "#define TILE_N {}", sel.tile.n);
            let _ = writeln!(out, "#define TILE_K {}\n", sel.tile.k);
            let _ = writeln!(out, "#define BWPP_BLOCK_M {}", sel.block.m);
            let _ = writeln!(out, "#define BWPP_BLOCK_N {}", sel.block.n);
            let _ = writeln!(out, "#define BWPP_BLOCK_K {}\n", sel.block.k);
            let ep_add = matches!(sel.epilogue, Epilogue::Add | Epilogue::AddSilu) as u32;
            let ep_silu = matches!(sel.epilogue, Epilogue::Silu | Epilogue::AddSilu) as u32;
            let _ = writeln!(out, "#define BWPP_EPILOGUE_ADD {}", ep_add);
            let _ = writeln!(out, "#define BWPP_EPILOGUE_SILU {}\n", ep_silu);
            out.push_str(MATMUL_KERNEL);
        }
        KernelFamily::Attention => {
            let _ = writeln!(out, "#include <metal_stdlib>");
            let _ = writeln!(out, "using namespace metal;\n");
            let _ = writeln!(out, "#define TILE_M {}", sel.tile.m);
            let _ = writeln!(out, "#define TILE_N {}", sel.tile.n);
            let _ = writeln!(out, "#define TILE_K {}\n", sel.tile.k);
            out.push_str(ATTENTION_KERNEL);
        }
        KernelFamily::None => {}
    }

    if sel.has_softmax {
        let tile = if sel.family == KernelFamily::None { 128 } else { sel.block.n };
        let _ = writeln!(out, "\n#define BWPP_SOFTMAX_TILE {}", tile);
        out.push_str(SOFTMAX_KERNEL);
    }
    if sel.has_rmsnorm {
        let tile = if sel.family == KernelFamily::None { 128 } else { sel.block.n };
        let _ = writeln!(out, "\n#define BWPP_RMSNORM_TILE {}", tile);
        out.push_str(RMSNORM_KERNEL);
    }

    out
}

const MATMUL_KERNEL: &str = r#"struct BwppMatmulParams {
  uint M;
  uint N;
  uint K;
  uint lda;
  uint ldb;
  uint ldc;
};

inline float bwpp_silu(float x) {
  return x / (1.0f + exp(-x));
}

kernel void bwpp_matmul_f16(
    device const half *A [[buffer(0)]],
    device const half *B [[buffer(1)]],
    device half *C [[buffer(2)]],
    constant BwppMatmulParams &p [[buffer(3)]],
    device const half *Bias [[buffer(4)]],
    uint2 tid [[thread_position_in_threadgroup]],
    uint2 tgid [[threadgroup_position_in_grid]]) {
  threadgroup half As[TILE_M][TILE_K];
  threadgroup half Bs[TILE_K][TILE_N];
  uint row = tgid.y * TILE_M + tid.y;
  uint col = tgid.x * TILE_N + tid.x;
  float acc = 0.0f;
  for (uint k0 = 0; k0 < p.K; k0 += TILE_K) {
    uint a_col = k0 + tid.x;
    As[tid.y][tid.x] = (row < p.M && a_col < p.K) ? A[row * p.lda + a_col] : half(0.0f);
    uint b_row = k0 + tid.y;
    Bs[tid.y][tid.x] = (b_row < p.K && col < p.N) ? B[b_row * p.ldb + col] : half(0.0f);
    threadgroup_barrier(mem_flags::mem_threadgroup);
    for (uint k = 0; k < TILE_K; ++k) {
      acc += float(As[tid.y][k]) * float(Bs[k][tid.x]);
    }
    threadgroup_barrier(mem_flags::mem_threadgroup);
  }
  if (row < p.M && col < p.N) {
    float out = acc;
#if BWPP_EPILOGUE_ADD
    out += float(Bias[col]);
#endif
#if BWPP_EPILOGUE_SILU
    out = bwpp_silu(out);
#endif
    C[row * p.ldc + col] = half(out);
  }
}
"#;

const ATTENTION_KERNEL: &str = r#"struct BwppAttentionParams {
  uint M;
  uint N;
  uint K;
  uint D;
  uint ldq;
  uint ldk;
  uint ldv;
  uint ldo;
};

kernel void bwpp_attention_f16(
    device const half *Q [[buffer(0)]],
    device const half *K [[buffer(1)]],
    device const half *V [[buffer(2)]],
    device half *O [[buffer(3)]],
    constant BwppAttentionParams &p [[buffer(4)]],
    uint2 tid [[thread_position_in_threadgroup]],
    uint2 tgid [[threadgroup_position_in_grid]]) {
  uint m = tgid.y * TILE_M + tid.y;
  uint d = tgid.x * TILE_M + tid.x;
  if (m >= p.M || d >= p.D) { return; }
  float maxv = -INFINITY;
  float sum = 0.0f;
  float out = 0.0f;
  for (uint n0 = 0; n0 < p.N; n0 += TILE_N) {
    uint cmax = min(n0 + TILE_N, p.N);
    for (uint n = n0; n < cmax; ++n) {
      float score = 0.0f;
      for (uint k = 0; k < p.K; ++k) {
        score += float(Q[m * p.ldq + k]) * float(K[n * p.ldk + k]);
      }
      if (score > maxv) {
        float scale = exp(maxv - score);
        out = out * scale + float(V[n * p.ldv + d]);
        sum = sum * scale + 1.0f;
        maxv = score;
      } else {
        float w = exp(score - maxv);
        out += w * float(V[n * p.ldv + d]);
        sum += w;
      }
    }
  }
  float inv = sum > 0.0f ? (1.0f / sum) : 0.0f;
  O[m * p.ldo + d] = half(out * inv);
}
"#;

const SOFTMAX_KERNEL: &str = r#"struct BwppSoftmaxParams {
  uint rows;
  uint cols;
  uint ld;
};

kernel void bwpp_softmax_f16(
    device const half *X [[buffer(0)]],
    device half *Y [[buffer(1)]],
    constant BwppSoftmaxParams &p [[buffer(2)]],
    uint gid [[thread_position_in_grid]]) {
  uint row = gid;
  if (row >= p.rows) { return; }
  float maxv = -INFINITY;
  for (uint c = 0; c < p.cols; ++c) {
    maxv = max(maxv, float(X[row * p.ld + c]));
  }
  float sum = 0.0f;
  for (uint c = 0; c < p.cols; ++c) {
    float e = exp(float(X[row * p.ld + c]) - maxv);
    Y[row * p.ld + c] = half(e);
    sum += e;
  }
  float inv = sum > 0.0f ? (1.0f / sum) : 0.0f;
  for (uint c = 0; c < p.cols; ++c) {
    Y[row * p.ld + c] = half(float(Y[row * p.ld + c]) * inv);
  }
}
"#;

const RMSNORM_KERNEL: &str = r#"struct BwppRmsnormParams {
  uint rows;
  uint cols;
  uint ld;
  float eps;
};

kernel void bwpp_rmsnorm_f16(
    device const half *X [[buffer(0)]],
    device const half *Gamma [[buffer(1)]],
    device half *Y [[buffer(2)]],
    constant BwppRmsnormParams &p [[buffer(3)]],
    device const half *Beta [[buffer(4)]],
    uint gid [[thread_position_in_grid]]) {
  uint row = gid;
  if (row >= p.rows) { return; }
  float sumsq = 0.0f;
  for (uint c = 0; c < p.cols; ++c) {
    float v = float(X[row * p.ld + c]);
    sumsq += v * v;
  }
  float inv = rsqrt(sumsq / float(p.cols) + p.eps);
  for (uint c = 0; c < p.cols; ++c) {
    float v = float(X[row * p.ld + c]) * inv;
    float g = Gamma ? float(Gamma[c]) : 1.0f;
    float b = Beta ? float(Beta[c]) : 0.0f;
    Y[row * p.ld + c] = half(v * g + b);
  }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstOp, RegionKind as AstRegionKind, RegionPolicy as AstRegionPolicy};
    use crate::graph::build_graph;

    #[test]
    fn matmul_with_bias_and_silu_gets_add_silu_epilogue() {
        let src = "fn f(a: tensor<f16,[M,K]>, b: tensor<f16,[K,N]>, bias: tensor<f16,[N]>) { \
                   let y = silu(add(matmul(a,b), bias)); return y; }";
        let g = build_graph(src, None).unwrap();
        let ir = crate::ir::lower_graph(&g, false);
        let sel = select(&ir);
        assert_eq!(sel.family, KernelFamily::Matmul);
        assert_eq!(sel.epilogue, Epilogue::AddSilu);
        let text = emit(&ir);
        assert!(text.starts_with("// BW++ Metal output stub\n"));
        assert!(text.contains("epilogue=add_silu"));
        assert!(text.contains("kernel void bwpp_matmul_f16"));
    }

    #[test]
    fn no_matmul_selects_none_family() {
        let src = "fn f(x: tensor<f16,[N]>) { let y = silu(x); return y; }";
        let g = build_graph(src, None).unwrap();
        let ir = crate::ir::lower_graph(&g, false);
        let sel = select(&ir);
        assert_eq!(sel.family, KernelFamily::None);
        let text = emit(&ir);
        assert!(text.contains("kernel=none"));
    }

    #[test]
    fn attention_emits_plan_lines() {
        let src = "fn attn(q: tensor<f16,[S,D]>, k: tensor<f16,[S,D]>, v: tensor<f16,[S,D]>) { \
                   let kt = transpose(k); let scores = matmul(q, kt); let w = softmax(scores); \
                   let out = matmul(w, v); return out; }";
        let g = build_graph(src, None).unwrap();
        let ir = crate::ir::lower_graph(&g, true);
        let text = emit(&ir);
        assert!(text.contains("kernel=attention_f16"));
        assert!(text.contains("bwpp.plan: 0=load role=0"));
        assert!(text.contains("kernel void bwpp_attention_f16"));
    }

    #[test]
    fn reversible_policy_all_store_reports_store() {
        use crate::ir::{IrModule, IrRegion};
        let mut m = IrModule::default();
        m.regions.push(IrRegion {
            id: 0,
            kind: AstRegionKind::Reversible,
            policy: AstRegionPolicy::Store,
        });
        assert_eq!(reversible_policy_summary(&m), "store");
        let _ = AstOp::Matmul;
    }
}
