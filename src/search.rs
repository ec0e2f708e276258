//! Budgeted random search over a [ScheduleSpace].

use crate::kernel::{lower, BuildError};
use crate::measure::{ProgramMeasurer, RunnerOptions};
use crate::pprint::{pprint_rounds, RoundStats};
use crate::record::MeasureCallback;
use crate::schedule::{Schedule, ScheduleSpace};
use crate::task::SearchTask;
use crate::utils::gflops;

use anyhow::{Context, Result};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::time::{Duration, Instant};

pub struct TuningOptions {
    /// Upper bound on measured candidates.
    pub num_measure_trials: usize,
    pub num_measures_per_round: usize,
    /// Stop after this many consecutive rounds without a new best.
    pub early_stopping: Option<usize>,
    /// 0: silent; 1: print a per-round summary table; 2: also print every trial.
    pub verbose: u8,
    pub measure_callbacks: Vec<Box<dyn MeasureCallback>>,
    pub runner: RunnerOptions,
    pub seed: Option<u64>,
}

impl Default for TuningOptions {
    fn default() -> Self {
        TuningOptions {
            num_measure_trials: 1000,
            num_measures_per_round: 64,
            early_stopping: None,
            verbose: 1,
            measure_callbacks: Vec::new(),
            runner: RunnerOptions::default(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TuneSummary {
    pub trials: usize,
    pub failures: usize,
    /// Fastest schedule found in this search, with its mean seconds per run.
    pub best: Option<(Schedule, f64)>,
    pub elapsed: Duration,
    pub rounds: Vec<RoundStats>,
}

/// Proposes schedules uniformly at random, never proposing one twice.
pub struct RandomSearchPolicy {
    space: ScheduleSpace,
    order: Vec<usize>,
    next: usize,
}

impl RandomSearchPolicy {
    pub fn new(space: ScheduleSpace, rng: &mut StdRng) -> Self {
        let mut order = (0..space.len()).collect::<Vec<_>>();
        order.shuffle(rng);
        RandomSearchPolicy {
            space,
            order,
            next: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.order.len() - self.next
    }

    pub fn next_batch(&mut self, size: usize) -> Vec<Schedule> {
        let end = (self.next + size).min(self.order.len());
        let batch = self.order[self.next..end]
            .iter()
            .filter_map(|&i| self.space.get(i))
            .collect();
        self.next = end;
        batch
    }
}

/// The schedules worth measuring for `task`.
///
/// `B` is only repacked when the workload declares it layout-free, and
/// parallel schedules are only offered to targets with more than one core.
pub fn schedule_space(task: &SearchTask) -> Result<ScheduleSpace, BuildError> {
    let lowered = lower(task.compute_dag())?;
    Ok(ScheduleSpace::new(
        &lowered.dims,
        lowered.b_layout_free,
        task.target().cores > 1,
    ))
}

/// Measures up to `options.num_measure_trials` schedules for `task`, passing
/// every measurement to the options' callbacks.
pub fn tune(task: &SearchTask, mut options: TuningOptions) -> Result<TuneSummary> {
    let space = schedule_space(task)?;
    let flops = task.compute_dag().flop_count();
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    info!(
        "Tuning {} over {} schedules with a budget of {} trials",
        task,
        space.len(),
        options.num_measure_trials
    );
    let mut policy = RandomSearchPolicy::new(space, &mut rng);
    let mut measurer = ProgramMeasurer::new(task, options.runner, &mut rng)?;

    let start = Instant::now();
    let mut summary = TuneSummary {
        trials: 0,
        failures: 0,
        best: None,
        elapsed: Duration::ZERO,
        rounds: Vec::new(),
    };
    let mut rounds_without_improvement = 0;
    while summary.trials < options.num_measure_trials && policy.remaining() > 0 {
        let batch_size = options
            .num_measures_per_round
            .max(1)
            .min(options.num_measure_trials - summary.trials);
        let mut improved = false;
        for schedule in policy.next_batch(batch_size) {
            let (input, result) = measurer.measure(schedule);
            summary.trials += 1;
            for callback in options.measure_callbacks.iter_mut() {
                callback
                    .on_measure(&input, &result)
                    .context("measure callback failed")?;
            }
            let Some(cost) = result.mean_cost() else {
                summary.failures += 1;
                continue;
            };
            if options.verbose >= 2 {
                println!(
                    "trial {:>5}: {:>10.3} GFLOPs/s  {}",
                    summary.trials,
                    gflops(flops, Duration::from_secs_f64(cost)),
                    schedule
                );
            }
            if summary.best.map_or(true, |(_, best)| cost < best) {
                summary.best = Some((schedule, cost));
                improved = true;
            }
        }
        for callback in options.measure_callbacks.iter_mut() {
            callback.flush().context("measure callback failed")?;
        }

        let round = RoundStats {
            round: summary.rounds.len() + 1,
            trials: summary.trials,
            best_latency: summary.best.map(|(_, c)| Duration::from_secs_f64(c)),
            best_gflops: summary
                .best
                .map(|(_, c)| gflops(flops, Duration::from_secs_f64(c))),
            best_schedule: summary.best.map(|(s, _)| s),
        };
        debug!("{:?}", round);
        summary.rounds.push(round);

        if improved {
            rounds_without_improvement = 0;
        } else {
            rounds_without_improvement += 1;
        }
        if let Some(patience) = options.early_stopping {
            if rounds_without_improvement >= patience {
                info!("Stopping early after {patience} rounds without improvement");
                break;
            }
        }
    }
    summary.elapsed = start.elapsed();

    info!(
        "Measured {} schedules ({} failed) in {:?}",
        summary.trials, summary.failures, summary.elapsed
    );
    if options.verbose >= 1 {
        pprint_rounds(&summary.rounds);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DimSize, Dtype};
    use crate::record::{MeasureInput, MeasureResult};
    use crate::target::{Target, TargetId};
    use crate::workload::{
        ComputeDag, DagBuilder, WorkloadArg, WorkloadError, WorkloadRegistry, MATMUL_ADD,
    };
    use smallvec::smallvec;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::io;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Collect(Rc<RefCell<Vec<(MeasureInput, MeasureResult)>>>);

    impl MeasureCallback for Collect {
        fn on_measure(&mut self, input: &MeasureInput, result: &MeasureResult) -> io::Result<()> {
            self.0.borrow_mut().push((input.clone(), result.clone()));
            Ok(())
        }
    }

    fn task(m: u32, n: u32, k: u32, cores: usize) -> SearchTask {
        SearchTask::new(
            &WorkloadRegistry::default(),
            MATMUL_ADD,
            vec![m.into(), n.into(), k.into(), "float32".into()],
            Target {
                id: TargetId::Llvm,
                cores,
            },
        )
        .unwrap()
    }

    fn options(trials: usize, per_round: usize, collect: &Collect) -> TuningOptions {
        TuningOptions {
            num_measure_trials: trials,
            num_measures_per_round: per_round,
            verbose: 0,
            measure_callbacks: vec![Box::new(collect.clone())],
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn test_tune_respects_budget_and_reports_every_trial() {
        let collect = Collect::default();
        let t = task(16, 16, 16, 1);
        let summary = tune(&t, options(10, 4, &collect)).unwrap();
        assert_eq!(summary.trials, 10);
        assert_eq!(summary.rounds.len(), 3);
        assert_eq!(summary.failures, 0);
        let seen = collect.0.borrow();
        assert_eq!(seen.len(), 10);
        let distinct = seen.iter().map(|(i, _)| i.schedule).collect::<HashSet<_>>();
        assert_eq!(distinct.len(), 10);
        let (best, cost) = summary.best.unwrap();
        let min_cost = seen
            .iter()
            .filter_map(|(_, r)| r.mean_cost())
            .fold(f64::INFINITY, f64::min);
        assert_eq!(cost, min_cost);
        assert!(seen.iter().any(|(i, _)| i.schedule == best));
    }

    #[test]
    fn test_tune_stops_when_space_is_exhausted() {
        let collect = Collect::default();
        // A 1×1×1 problem has only tile size 1, so four serial schedules.
        let summary = tune(&task(1, 1, 1, 1), options(1000, 64, &collect)).unwrap();
        assert_eq!(summary.trials, 4);
        assert_eq!(collect.0.borrow().len(), 4);
    }

    #[test]
    fn test_tune_early_stopping() {
        let collect = Collect::default();
        let mut opts = options(1000, 1, &collect);
        opts.early_stopping = Some(1);
        let t = task(8, 8, 8, 1);
        let space_len = schedule_space(&t).unwrap().len();
        let summary = tune(&t, opts).unwrap();
        // The first round always improves, so at least two rounds run.
        assert!(summary.rounds.len() >= 2);
        assert!(summary.trials < space_len);
    }

    #[test]
    fn test_single_core_target_gets_no_parallel_schedules() {
        let serial = schedule_space(&task(6, 6, 6, 1)).unwrap();
        assert!(!serial.is_empty());
        assert!(serial.iter().all(|s| !s.parallel));
        let multi = schedule_space(&task(6, 6, 6, 8)).unwrap();
        assert!(multi.iter().any(|s| s.parallel));
        assert_eq!(multi.len(), 2 * serial.len());
    }

    #[test]
    fn test_fixed_layout_b_gets_no_packed_schedules() {
        fn fixed_layout_matmul_add(_: &[WorkloadArg]) -> Result<ComputeDag, WorkloadError> {
            let d = DimSize::new(6).unwrap();
            let mut builder = DagBuilder::default();
            let a = builder.placeholder("A", smallvec![d, d], Dtype::Float32);
            let b = builder.placeholder("B", smallvec![d, d], Dtype::Float32);
            let c = builder.placeholder("C", smallvec![d, d], Dtype::Float32);
            let mm = builder.matmul("matmul", a, b, vec![])?;
            let out = builder.add("out", mm, c)?;
            Ok(builder.finish(vec![a, b, c, out]))
        }
        let mut registry = WorkloadRegistry::empty();
        registry
            .register("matmul_add_fixed_b", fixed_layout_matmul_add)
            .unwrap();
        let target = Target {
            id: TargetId::Llvm,
            cores: 1,
        };
        let fixed = SearchTask::new(&registry, "matmul_add_fixed_b", vec![], target).unwrap();
        let space = schedule_space(&fixed).unwrap();
        assert!(!space.is_empty());
        assert!(space.iter().all(|s| !s.pack_b));
        assert_eq!(
            2 * space.len(),
            schedule_space(&task(6, 6, 6, 1)).unwrap().len()
        );

        // Every offered schedule builds, so a search over it never hits a build failure.
        let collect = Collect::default();
        let summary = tune(&fixed, options(6, 3, &collect)).unwrap();
        assert_eq!(summary.failures, 0);
        assert!(collect.0.borrow().iter().all(|(i, _)| !i.schedule.pack_b));
    }

    #[test]
    fn test_random_policy_never_repeats() {
        let space = schedule_space(&task(4, 8, 2, 4)).unwrap();
        let len = space.len();
        let mut policy = RandomSearchPolicy::new(space, &mut StdRng::seed_from_u64(3));
        let mut seen = HashSet::new();
        while policy.remaining() > 0 {
            for s in policy.next_batch(5) {
                assert!(seen.insert(s));
            }
        }
        assert_eq!(seen.len(), len);
        assert!(policy.next_batch(5).is_empty());
    }
}
