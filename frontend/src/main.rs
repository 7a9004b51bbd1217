#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use rayon::prelude::*;

use std::{fs, path};

use optiling::common::{Dtype, Format, TensorDesc};
use optiling::ops::matmul;
use optiling::registry::TilingTemplate;
use optiling::{default_registry, OperatorWorkload, TilingDispatcher};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    subcmd: Subcommand,
}

#[derive(Parser)]
enum Subcommand {
    /// Tile one or more workloads against a platform description
    Tile(TileCmd),

    /// Infer the output of a matrix multiplication
    Infer(InferCmd),

    /// List registered operators and their templates in priority order
    List,
}

#[derive(Parser)]
struct TileCmd {
    /// Platform JSON document
    #[arg(long, short)]
    platform: path::PathBuf,

    /// Number of parallel jobs
    #[arg(long, short)]
    jobs: Option<usize>,

    /// Workload JSON documents
    #[arg(required = true)]
    workloads: Vec<path::PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum MatMulOp {
    #[value(name = "MatMulV3")]
    MatMulV3,
    #[value(name = "BatchMatMulV3")]
    BatchMatMulV3,
}

impl MatMulOp {
    fn op_type(self) -> &'static str {
        match self {
            MatMulOp::MatMulV3 => "MatMulV3",
            MatMulOp::BatchMatMulV3 => "BatchMatMulV3",
        }
    }
}

#[derive(Parser)]
struct InferCmd {
    #[arg(value_enum)]
    op: MatMulOp,

    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    x1: Vec<i64>,

    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    x2: Vec<i64>,

    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    bias: Option<Vec<i64>>,

    #[arg(long, default_value_t = false)]
    trans_a: bool,

    #[arg(long, default_value_t = false)]
    trans_b: bool,

    /// Output element type
    #[arg(long, value_enum, default_value_t = Dtype::Float16)]
    dtype: Dtype,

    /// Output layout
    #[arg(long, value_enum, default_value_t = Format::ND)]
    format: Format,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match &args.subcmd {
        Subcommand::Tile(cmd) => tile(cmd),
        Subcommand::Infer(cmd) => infer(cmd),
        Subcommand::List => {
            for (op, candidates) in default_registry().ops() {
                println!("{op}");
                for c in candidates {
                    println!("  {:>10}  {}", c.priority, c.template.name());
                }
            }
            Ok(())
        }
    }
}

fn tile(cmd: &TileCmd) -> Result<()> {
    let raw_platform = fs::read_to_string(&cmd.platform)
        .with_context(|| format!("reading {}", cmd.platform.display()))?;
    let dispatcher = TilingDispatcher::from_platform_json(default_registry(), &raw_platform)?;
    info!("platform: {:?}", dispatcher.platform());

    let workloads = cmd
        .workloads
        .iter()
        .map(|p| -> Result<_> {
            let raw = fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            let workload: OperatorWorkload =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", p.display()))?;
            Ok((p, workload))
        })
        .collect::<Result<Vec<_>>>()?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cmd.jobs.unwrap_or(0))
        .build()?;
    let start_time = std::time::Instant::now();
    let plans = pool.install(|| {
        workloads
            .par_iter()
            .map(|(p, w)| (p, dispatcher.tile(w)))
            .collect::<Vec<_>>()
    });
    info!("tiling {} workloads took {:?}", plans.len(), start_time.elapsed());

    let mut failures = 0;
    for (p, plan) in plans {
        match plan {
            Ok(plan) => println!("{}: {}", p.display(), serde_json::to_string(&plan)?),
            Err(e) => {
                failures += 1;
                eprintln!("{}: {e}", p.display());
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {} workloads failed", cmd.workloads.len());
    }
    Ok(())
}

fn infer(cmd: &InferCmd) -> Result<()> {
    let shape = matmul::infer_shape(
        cmd.op.op_type(),
        &cmd.x1,
        &cmd.x2,
        cmd.bias.as_deref(),
        cmd.trans_a,
        cmd.trans_b,
    )?;
    let y = TensorDesc::new(shape, cmd.dtype, cmd.format);
    println!("{}", serde_json::to_string(&y)?);
    Ok(())
}
