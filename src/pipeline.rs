//! Tune, build, validate, and time one `matmul_add` problem end to end.

use crate::common::{Dtype, MatmulDims};
use crate::kernel::{Buffers, Kernel};
use crate::measure::RunnerOptions;
use crate::record::{reset_log, MeasureCallback, RecordToFile};
use crate::schedule::Schedule;
use crate::scheduler::AutoScheduler;
use crate::search::TuningOptions;
use crate::target::{Target, TargetId};
use crate::task::SearchTask;
use crate::utils::{gflops, median};
use crate::verification::{assert_allclose, reference_matmul_add};
use crate::workload::{WorkloadRegistry, MATMUL_ADD};

use anyhow::{bail, Context, Result};
use log::info;
use ndarray::linalg::general_mat_mul;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const DEFAULT_LOG_FILE: &str = "matmul.json";

/// Relative tolerance of the final correctness check.
pub const RTOL: f32 = 1e-3;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dims: MatmulDims,
    pub log_file: PathBuf,
    /// Truncate `log_file` before tuning instead of appending to it.
    pub overwrite_log: bool,
    pub trials: usize,
    pub measures_per_round: usize,
    pub early_stopping: Option<usize>,
    /// Timed repetitions of the final kernel; the reported time is their median.
    pub repeat: usize,
    pub seed: Option<u64>,
    pub target: TargetId,
    /// Worker threads for tuning, the kernel and the baseline; all cores if unset.
    /// With one thread no parallel schedules are searched.
    pub threads: Option<NonZeroUsize>,
    pub verbose: u8,
    pub print_dag: bool,
    /// Build from the existing log without measuring anything.
    pub skip_tune: bool,
    pub baseline: bool,
}

impl RunConfig {
    pub fn new(dims: MatmulDims) -> Self {
        RunConfig {
            dims,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            overwrite_log: false,
            trials: 1000,
            measures_per_round: 64,
            early_stopping: None,
            repeat: 5,
            seed: None,
            target: TargetId::default(),
            threads: None,
            verbose: 0,
            print_dag: false,
            skip_tune: false,
            baseline: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub dims: MatmulDims,
    pub schedule: Schedule,
    /// Median over the timed repetitions.
    pub runtime: Duration,
    pub gflops: f64,
    pub baseline_gflops: Option<f64>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "M={} N={} K={}    Performance: {:.3} GFLOPs/s",
            self.dims.m, self.dims.n, self.dims.k, self.gflops
        )?;
        if let Some(baseline) = self.baseline_gflops {
            write!(f, "\nBaseline: {:.3} GFLOPs/s", baseline)?;
        }
        Ok(())
    }
}

pub fn run<S: AutoScheduler + Sync>(config: &RunConfig, scheduler: &S) -> Result<Report> {
    if config.repeat == 0 {
        bail!("repeat must be at least 1");
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads.map_or(0, NonZeroUsize::get))
        .build()
        .context("Failed to start the worker threads")?;
    info!("Using {} worker threads", pool.current_num_threads());
    pool.install(|| run_in_pool(config, scheduler))
}

/// Runs every step on the current rayon pool, whose size becomes the target's core count.
fn run_in_pool<S: AutoScheduler>(config: &RunConfig, scheduler: &S) -> Result<Report> {
    let dims = config.dims;
    let task = SearchTask::new(
        &WorkloadRegistry::default(),
        MATMUL_ADD,
        vec![
            dims.m.get().into(),
            dims.n.get().into(),
            dims.k.get().into(),
            Dtype::Float32.into(),
        ],
        Target::host(config.target),
    )
    .context("Failed to define the tuning task")?;
    if config.print_dag {
        println!("{}", task.compute_dag());
    }

    if config.skip_tune {
        info!("Skipping tuning; using {}", config.log_file.display());
    } else {
        if config.overwrite_log {
            reset_log(&config.log_file)?;
        }
        let callbacks: Vec<Box<dyn MeasureCallback>> =
            vec![Box::new(RecordToFile::new(&config.log_file)?)];
        let start = Instant::now();
        scheduler
            .search(
                &task,
                TuningOptions {
                    num_measure_trials: config.trials,
                    num_measures_per_round: config.measures_per_round,
                    early_stopping: config.early_stopping,
                    verbose: config.verbose,
                    measure_callbacks: callbacks,
                    runner: RunnerOptions::default(),
                    seed: config.seed,
                },
            )
            .context("Tuning failed")?;
        info!("Tuning took {:?}", start.elapsed());
    }

    let schedule = scheduler
        .apply_best(&task, &config.log_file)
        .context("Failed to select a schedule from the tuning log")?;
    let kernel = scheduler.build(&task, &schedule)?;

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut buffers = Buffers::random(&dims, &mut rng);
    kernel.run(&mut buffers).context("Kernel execution failed")?;
    let expected = reference_matmul_add(&buffers.a, &buffers.b, &buffers.c);
    assert_allclose(&expected, &buffers.out, RTOL)
        .with_context(|| format!("{} produced wrong results", kernel.entry_name()))?;
    info!("Output matches the reference");

    let timing = kernel
        .time_evaluator(&mut buffers, 1, config.repeat)
        .context("Timing failed")?;
    let runtime = timing.median();
    info!(
        "Timed {} runs: median {:?}, mean {:?}",
        timing.results.len(),
        runtime,
        timing.mean()
    );
    let baseline_gflops = if config.baseline {
        let baseline = time_reference(&mut buffers, config.repeat);
        Some(gflops(dims.matmul_flops(), baseline))
    } else {
        None
    };

    Ok(Report {
        dims,
        schedule,
        runtime,
        gflops: gflops(dims.matmul_flops(), runtime),
        baseline_gflops,
    })
}

/// Median runtime of ndarray's `general_mat_mul` computing the same result.
///
/// Only the `general_mat_mul` call is timed. Resetting the output to `C`
/// beforehand is not, unlike the tuned kernel, which copies `C` itself.
fn time_reference(buffers: &mut Buffers, repeat: usize) -> Duration {
    let mut samples = Vec::with_capacity(repeat);
    for _ in 0..repeat {
        buffers.out.assign(&buffers.c);
        let start = Instant::now();
        general_mat_mul(1.0, &buffers.a, &buffers.b, 1.0, &mut buffers.out);
        samples.push(start.elapsed());
    }
    median(&samples).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DimSize;
    use crate::record::{load_records, LogError};
    use crate::scheduler::NativeScheduler;
    use std::fs;

    fn config(m: u32, n: u32, k: u32, log_file: PathBuf) -> RunConfig {
        let mut config = RunConfig::new(MatmulDims::new(
            DimSize::new(m).unwrap(),
            DimSize::new(n).unwrap(),
            DimSize::new(k).unwrap(),
        ));
        config.log_file = log_file;
        config.trials = 8;
        config.measures_per_round = 4;
        config.seed = Some(0);
        config
    }

    #[test]
    fn test_run_scalar_problem() {
        let dir = tempfile::tempdir().unwrap();
        let report = run(&config(1, 1, 1, dir.path().join("m.json")), &NativeScheduler).unwrap();
        assert!(report.gflops > 0.0);
        assert!(report
            .to_string()
            .starts_with("M=1 N=1 K=1    Performance: "));
    }

    #[test]
    fn test_report_line_format() {
        let dims = MatmulDims::new(
            DimSize::new(64).unwrap(),
            DimSize::new(64).unwrap(),
            DimSize::new(64).unwrap(),
        );
        let report = Report {
            dims,
            schedule: Schedule::naive(&dims),
            runtime: Duration::from_millis(1),
            gflops: 0.524288,
            baseline_gflops: None,
        };
        assert_eq!(
            report.to_string(),
            "M=64 N=64 K=64    Performance: 0.524 GFLOPs/s"
        );
        let report = Report {
            baseline_gflops: Some(12.0),
            ..report
        };
        assert_eq!(
            report.to_string(),
            "M=64 N=64 K=64    Performance: 0.524 GFLOPs/s\nBaseline: 12.000 GFLOPs/s"
        );
    }

    #[test]
    fn test_run_appends_by_default_and_truncates_on_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("m.json");
        let mut cfg = config(16, 8, 4, log.clone());
        run(&cfg, &NativeScheduler).unwrap();
        assert_eq!(load_records(&log).unwrap().len(), 8);
        run(&cfg, &NativeScheduler).unwrap();
        assert_eq!(load_records(&log).unwrap().len(), 16);
        cfg.overwrite_log = true;
        run(&cfg, &NativeScheduler).unwrap();
        assert_eq!(load_records(&log).unwrap().len(), 8);
    }

    #[test]
    fn test_skip_tune_reuses_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("m.json");
        let mut cfg = config(8, 8, 8, log.clone());
        let first = run(&cfg, &NativeScheduler).unwrap();
        cfg.skip_tune = true;
        cfg.baseline = true;
        let second = run(&cfg, &NativeScheduler).unwrap();
        assert_eq!(first.schedule, second.schedule);
        assert_eq!(load_records(&log).unwrap().len(), 8);
        assert!(second.baseline_gflops.is_some());
    }

    #[test]
    fn test_skip_tune_with_corrupt_or_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("m.json");
        let mut cfg = config(2, 2, 2, log.clone());
        cfg.skip_tune = true;

        fs::write(&log, "").unwrap();
        let err = run(&cfg, &NativeScheduler).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LogError>(),
            Some(LogError::Empty(_))
        ));

        fs::write(&log, "{\"i\": not json\n").unwrap();
        let err = run(&cfg, &NativeScheduler).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LogError>(),
            Some(LogError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn test_run_with_single_trial_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(5, 3, 7, dir.path().join("m.json"));
        cfg.trials = 1;
        let report = run(&cfg, &NativeScheduler).unwrap();
        assert_eq!(report.dims.k.get(), 7);
    }

    #[test]
    fn test_run_64_cubed_reports_finite_throughput() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(64, 64, 64, dir.path().join("m.json"));
        cfg.trials = 4;
        let report = run(&cfg, &NativeScheduler).unwrap();
        let line = report.to_string();
        assert!(line.starts_with("M=64 N=64 K=64    Performance: "), "{line}");
        assert!(line.ends_with(" GFLOPs/s"), "{line}");
        assert!(report.gflops.is_finite() && report.gflops > 0.0);
    }

    #[test]
    fn test_single_thread_never_selects_parallel_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("m.json");
        let mut cfg = config(16, 16, 16, log.clone());
        cfg.threads = NonZeroUsize::new(1);
        cfg.trials = 64;
        cfg.measures_per_round = 16;
        let report = run(&cfg, &NativeScheduler).unwrap();
        assert!(!report.schedule.parallel);
        assert!(load_records(&log)
            .unwrap()
            .iter()
            .all(|r| !r.input.schedule.parallel));
    }

    #[test]
    fn test_run_rejects_zero_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(2, 2, 2, dir.path().join("m.json"));
        cfg.repeat = 0;
        assert!(run(&cfg, &NativeScheduler).is_err());
    }
}
