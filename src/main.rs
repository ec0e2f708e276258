#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use log::info;
use std::num::NonZeroUsize;
use std::path;

use mmtune::common::{DimSize, MatmulDims};
use mmtune::pipeline::{self, RunConfig, DEFAULT_LOG_FILE};
use mmtune::scheduler::NativeScheduler;
use mmtune::target::TargetId;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Auto-tune, validate, and benchmark `out = A·B + C` for float32 matrices
/// A (M×K), B (K×N), and C (M×N).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    m: DimSize,
    n: DimSize,
    k: DimSize,

    /// Tuning log (JSON lines), appended to unless --overwrite-log is given
    #[arg(long, default_value = DEFAULT_LOG_FILE)]
    log_file: path::PathBuf,

    /// Truncate the tuning log before tuning
    #[arg(long, default_value_t = false)]
    overwrite_log: bool,

    /// Maximum number of schedules to measure
    #[arg(long, default_value_t = 1000)]
    trials: usize,

    #[arg(long, default_value_t = 64)]
    measures_per_round: usize,

    /// Stop after this many rounds without improvement
    #[arg(long)]
    early_stopping: Option<usize>,

    /// Number of timed runs of the final kernel
    #[arg(long, default_value_t = 5)]
    repeat: usize,

    #[arg(long)]
    seed: Option<u64>,

    /// Target architecture
    #[arg(long, value_enum, default_value_t = TargetId::default())]
    target: TargetId,

    /// Number of worker threads (defaults to all cores)
    #[arg(long, short)]
    threads: Option<NonZeroUsize>,

    /// Search output: 0 is silent, 1 prints a table per search, 2 prints every trial
    #[arg(long, short, default_value_t = 0)]
    verbose: u8,

    /// Print the computation before tuning
    #[arg(long, default_value_t = false)]
    print_dag: bool,

    /// Build from the existing tuning log without measuring
    #[arg(long, default_value_t = false)]
    skip_tune: bool,

    /// Also report ndarray's matmul throughput
    #[arg(long, default_value_t = false)]
    baseline: bool,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            dims: MatmulDims::new(self.m, self.n, self.k),
            log_file: self.log_file.clone(),
            overwrite_log: self.overwrite_log,
            trials: self.trials,
            measures_per_round: self.measures_per_round,
            early_stopping: self.early_stopping,
            repeat: self.repeat,
            seed: self.seed,
            target: self.target,
            threads: self.threads,
            verbose: self.verbose,
            print_dag: self.print_dag,
            skip_tune: self.skip_tune,
            baseline: self.baseline,
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = args.run_config();

    let start_time = std::time::Instant::now();
    let report = pipeline::run(&config, &NativeScheduler)?;
    info!("Pipeline took {:?}", start_time.elapsed());
    info!("Selected schedule: {}", report.schedule);
    println!("{}", report);
    Ok(())
}
