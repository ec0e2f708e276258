//! Builds and times candidate schedules during a search.

use crate::kernel::{lower, BuildError, Buffers, Kernel, NativeKernel};
use crate::record::{MeasureErrorNo, MeasureInput, MeasureResult};
use crate::schedule::Schedule;
use crate::task::SearchTask;
use crate::verification::{assert_allclose, reference_matmul_add};

use anyhow::Result;
use log::{debug, warn};
use ndarray::Array2;
use rand::Rng;
use std::time::Instant;

/// How each candidate is run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunnerOptions {
    /// Invocations averaged into one cost.
    pub number: u32,
    /// Costs recorded per candidate.
    pub repeat: usize,
    /// Compare every candidate's output with the reference before timing it.
    pub check_correctness: bool,
    pub rtol: f32,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions {
            number: 3,
            repeat: 1,
            check_correctness: true,
            rtol: 1e-3,
        }
    }
}

/// Measures schedules for one task against a fixed set of random inputs.
pub struct ProgramMeasurer<'t> {
    task: &'t SearchTask,
    options: RunnerOptions,
    buffers: Buffers,
    expected: Option<Array2<f32>>,
}

impl<'t> ProgramMeasurer<'t> {
    pub fn new<R: Rng>(task: &'t SearchTask, options: RunnerOptions, rng: &mut R) -> Result<Self> {
        let dims = lower(task.compute_dag())?.dims;
        let buffers = Buffers::random(&dims, rng);
        let expected = options
            .check_correctness
            .then(|| reference_matmul_add(&buffers.a, &buffers.b, &buffers.c));
        Ok(ProgramMeasurer {
            task,
            options,
            buffers,
            expected,
        })
    }

    /// Builds, optionally checks, and times one schedule. Failures are
    /// reported in the result rather than returned as errors.
    pub fn measure(&mut self, schedule: Schedule) -> (MeasureInput, MeasureResult) {
        let input = MeasureInput::new(self.task, schedule);
        let start = Instant::now();
        let result = match self.measure_inner(&schedule) {
            Ok(costs) => MeasureResult::success(costs, start.elapsed().as_secs_f64()),
            Err((error_no, msg)) => {
                warn!("Trial {} failed: {}", schedule, msg);
                MeasureResult::failure(error_no, msg, start.elapsed().as_secs_f64())
            }
        };
        debug!("Measured {}: {:?}", schedule, result.costs);
        (input, result)
    }

    fn measure_inner(&mut self, schedule: &Schedule) -> Result<Vec<f64>, (MeasureErrorNo, String)> {
        let kernel = NativeKernel::build(self.task, schedule).map_err(|e| {
            let error_no = match e {
                BuildError::InvalidSchedule { .. } | BuildError::FixedLayout { .. } => {
                    MeasureErrorNo::InstantiationError
                }
                BuildError::Unsupported(_) => MeasureErrorNo::CompileHostError,
            };
            (error_no, e.to_string())
        })?;
        if let Some(expected) = &self.expected {
            kernel
                .run(&mut self.buffers)
                .map_err(|e| (MeasureErrorNo::RuntimeDeviceError, e.to_string()))?;
            assert_allclose(expected, &self.buffers.out, self.options.rtol)
                .map_err(|e| (MeasureErrorNo::WrongAnswerError, e.to_string()))?;
        }
        let timing = kernel
            .time_evaluator(&mut self.buffers, self.options.number, self.options.repeat)
            .map_err(|e| (MeasureErrorNo::RuntimeDeviceError, e.to_string()))?;
        Ok(timing.results.iter().map(|d| d.as_secs_f64()).collect())
    }
}
