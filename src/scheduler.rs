use crate::kernel::{lower, Kernel, NativeKernel};
use crate::record::load_best;
use crate::schedule::Schedule;
use crate::search::{tune, TuneSummary, TuningOptions};
use crate::task::SearchTask;

use anyhow::{Context, Result};
use log::info;
use std::path::Path;

/// Searches for, selects, and builds schedules for a [SearchTask].
pub trait AutoScheduler {
    type Kernel: Kernel;

    /// Measures candidate schedules, reporting each to `options.measure_callbacks`.
    fn search(&self, task: &SearchTask, options: TuningOptions) -> Result<TuneSummary>;

    /// Picks the fastest schedule for `task` recorded in the log at `log_file`.
    fn apply_best(&self, task: &SearchTask, log_file: &Path) -> Result<Schedule>;

    fn build(&self, task: &SearchTask, schedule: &Schedule) -> Result<Self::Kernel>;
}

/// Random search over tiled, reordered, and optionally parallel loop nests,
/// executed natively on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeScheduler;

impl AutoScheduler for NativeScheduler {
    type Kernel = NativeKernel;

    fn search(&self, task: &SearchTask, options: TuningOptions) -> Result<TuneSummary> {
        tune(task, options)
    }

    fn apply_best(&self, task: &SearchTask, log_file: &Path) -> Result<Schedule> {
        let lowered = lower(task.compute_dag())?;
        let (record, cost) = load_best(log_file, task, |s| {
            s.is_valid_for(&lowered.dims) && (lowered.b_layout_free || !s.pack_b)
        })?;
        info!(
            "Best schedule from {}: {} ({:.3e}s)",
            log_file.display(),
            record.input.schedule,
            cost
        );
        Ok(record.input.schedule)
    }

    fn build(&self, task: &SearchTask, schedule: &Schedule) -> Result<NativeKernel> {
        NativeKernel::build(task, schedule)
            .with_context(|| format!("Failed to build {} for {}", schedule, task))
    }
}
