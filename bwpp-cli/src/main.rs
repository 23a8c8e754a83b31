use bwpp_core::{attention, autodiff, graph, ir, memplan, tile, typecheck};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "bwpp", version, about = "BW++ tensor-kernel compiler")]
struct Args {
    /// Source module to compile
    input: PathBuf,
    /// Path to write the emitted kernel to
    output: PathBuf,
    /// Write the forward graph's dot dump here
    #[arg(long)]
    dot: Option<PathBuf>,
    /// Write the gradient graph's dot dump here
    #[arg(long = "grad-dot")]
    grad_dot: Option<PathBuf>,
    /// Write the memory plan dump here
    #[arg(long = "mem-plan")]
    mem_plan: Option<PathBuf>,
    /// Name of the function to compile; defaults to the first one
    #[arg(long)]
    entry: Option<String>,
    /// Print `attention: <bool>` to stdout after graph construction
    #[arg(long = "attn-report")]
    attn_report: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bwpp: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> bwpp_core::Result<()> {
    let source = std::fs::read_to_string(&args.input)?;

    typecheck::typecheck_module(&source)?;
    let fgraph = graph::build_graph(&source, args.entry.as_deref())?;

    let has_attention = attention::detect_attention(&fgraph);
    if args.attn_report {
        println!("attention: {has_attention}");
    }

    let grad = autodiff::autodiff(&fgraph);

    if let Some(path) = &args.dot {
        std::fs::write(path, graph::dot_dump(&fgraph))?;
    }
    if let Some(path) = &args.grad_dot {
        std::fs::write(path, graph::dot_dump(&grad))?;
    }
    if let Some(path) = &args.mem_plan {
        let plan = memplan::plan(&fgraph);
        std::fs::write(path, memplan::dump(&plan))?;
    }

    let module = ir::lower_graph(&fgraph, has_attention);
    std::fs::write(&args.output, tile::emit(&module))?;

    Ok(())
}
