//! Lowering and execution of matmul-plus-bias schedules on the host CPU.

use crate::common::{Dtype, MatmulDims};
use crate::schedule::{tile_ranges, LoopOrder, Schedule};
use crate::task::SearchTask;
use crate::utils::median;
use crate::workload::{ComputeDag, TensorOp};

use log::debug;
use ndarray::Array2;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rayon::prelude::*;
use std::borrow::Cow;
use std::ops::Range;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("cannot lower workload: {0}")]
    Unsupported(&'static str),
    #[error("schedule '{schedule}' does not fit {dims}")]
    InvalidSchedule { schedule: Schedule, dims: MatmulDims },
    #[error("schedule '{schedule}' repacks B, but B's layout is fixed")]
    FixedLayout { schedule: Schedule },
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("argument '{name}' has shape {actual:?}, but the kernel expects {expected:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("output buffer must be contiguous and row-major")]
    NonContiguousOutput,
    #[error("timing requires at least one run and one repeat")]
    EmptyTiming,
}

/// Dense float32 buffers for a kernel's `A`, `B`, `C` and `out` arguments.
#[derive(Debug, Clone)]
pub struct Buffers {
    pub a: Array2<f32>,
    pub b: Array2<f32>,
    pub c: Array2<f32>,
    pub out: Array2<f32>,
}

impl Buffers {
    /// Inputs drawn uniformly from `[0, 1)` and a zeroed output.
    pub fn random<R: Rng>(dims: &MatmulDims, rng: &mut R) -> Self {
        let unit = Uniform::new(0.0f32, 1.0);
        let mut fill = |shape: (usize, usize)| {
            Array2::from_shape_simple_fn(shape, || unit.sample(&mut *rng))
        };
        let a = fill(dims.a_shape());
        let b = fill(dims.b_shape());
        let c = fill(dims.out_shape());
        Buffers {
            a,
            b,
            c,
            out: Array2::zeros(dims.out_shape()),
        }
    }
}

/// Per-repeat timings from [Kernel::time_evaluator].
#[derive(Debug, Clone)]
pub struct TimingResult {
    /// Mean runtime of one kernel invocation, per repeat.
    pub results: Vec<Duration>,
    pub number: u32,
}

impl TimingResult {
    pub fn median(&self) -> Duration {
        median(&self.results).expect("time_evaluator never returns empty results")
    }

    pub fn mean(&self) -> Duration {
        self.results.iter().sum::<Duration>() / self.results.len() as u32
    }
}

/// An executable kernel.
pub trait Kernel {
    fn entry_name(&self) -> &str;

    fn run(&self, buffers: &mut Buffers) -> Result<(), RunError>;

    /// Runs the kernel `number` times per repeat and records the mean runtime
    /// of each of `repeat` repeats.
    fn time_evaluator(
        &self,
        buffers: &mut Buffers,
        number: u32,
        repeat: usize,
    ) -> Result<TimingResult, RunError> {
        if number == 0 || repeat == 0 {
            return Err(RunError::EmptyTiming);
        }
        let mut results = Vec::with_capacity(repeat);
        for _ in 0..repeat {
            let start = Instant::now();
            for _ in 0..number {
                self.run(buffers)?;
            }
            let mean = start.elapsed() / number;
            debug!("Sample runtime result {}s", mean.as_secs_f32());
            results.push(mean);
        }
        Ok(TimingResult { results, number })
    }
}

/// A [ComputeDag] recognized as `out = A·B + C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lowered {
    pub dims: MatmulDims,
    /// `B` may be stored in whatever layout the schedule picks.
    pub b_layout_free: bool,
}

/// Recognizes `out = A·B + C` in a [ComputeDag].
pub fn lower(dag: &ComputeDag) -> Result<Lowered, BuildError> {
    let [a, b, c, out] = dag.arg_ids() else {
        return Err(BuildError::Unsupported("expected exactly four arguments"));
    };
    let is_placeholder = |id| matches!(dag.tensor(id).op, TensorOp::Placeholder);
    if !(is_placeholder(*a) && is_placeholder(*b) && is_placeholder(*c)) {
        return Err(BuildError::Unsupported("the first three arguments must be inputs"));
    }
    let TensorOp::ElementwiseAdd { lhs: mm, rhs: bias } = dag.tensor(*out).op else {
        return Err(BuildError::Unsupported("output must be an elementwise add"));
    };
    if bias != *c {
        return Err(BuildError::Unsupported("output must add the bias argument"));
    }
    let TensorOp::MatmulReduce { lhs, rhs, .. } = &dag.tensor(mm).op else {
        return Err(BuildError::Unsupported("output must add a matmul"));
    };
    if (*lhs, *rhs) != (*a, *b) {
        return Err(BuildError::Unsupported("matmul must multiply the first two arguments"));
    }
    if dag.args().any(|t| t.dtype != Dtype::Float32) {
        return Err(BuildError::Unsupported("only float32 is supported"));
    }
    let a_shape = &dag.tensor(*a).shape;
    let b_shape = &dag.tensor(*b).shape;
    Ok(Lowered {
        dims: MatmulDims::new(a_shape[0], b_shape[1], a_shape[1]),
        b_layout_free: dag.is_layout_free(*b),
    })
}

/// A schedule compiled for one problem size.
#[derive(Debug, Clone)]
pub struct NativeKernel {
    dims: MatmulDims,
    schedule: Schedule,
    entry_name: String,
}

impl NativeKernel {
    pub fn build(task: &SearchTask, schedule: &Schedule) -> Result<Self, BuildError> {
        let Lowered {
            dims,
            b_layout_free,
        } = lower(task.compute_dag())?;
        if !schedule.is_valid_for(&dims) {
            return Err(BuildError::InvalidSchedule {
                schedule: *schedule,
                dims,
            });
        }
        if schedule.pack_b && !b_layout_free {
            return Err(BuildError::FixedLayout {
                schedule: *schedule,
            });
        }
        let [steps_m, steps_n, steps_k] = schedule.steps(&dims);
        debug!(
            "Built {} for {}: {}x{}x{} tiles",
            schedule, dims, steps_m, steps_n, steps_k
        );
        Ok(NativeKernel {
            dims,
            schedule: *schedule,
            entry_name: format!("default_function_{}", task.workload_name()),
        })
    }

    fn check_shapes(&self, buffers: &Buffers) -> Result<(), RunError> {
        let expected = [
            ("A", self.dims.a_shape(), buffers.a.dim()),
            ("B", self.dims.b_shape(), buffers.b.dim()),
            ("C", self.dims.out_shape(), buffers.c.dim()),
            ("out", self.dims.out_shape(), buffers.out.dim()),
        ];
        for (name, expected, actual) in expected {
            if expected != actual {
                return Err(RunError::ShapeMismatch {
                    name,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }
}

impl Kernel for NativeKernel {
    fn entry_name(&self) -> &str {
        &self.entry_name
    }

    fn run(&self, buffers: &mut Buffers) -> Result<(), RunError> {
        self.check_shapes(buffers)?;
        let (m, n, k) = (
            self.dims.m.get() as usize,
            self.dims.n.get() as usize,
            self.dims.k.get() as usize,
        );
        let tile_n = self.schedule.tile_n.get() as usize;

        let a = standard_slice(&buffers.a);
        let b = standard_slice(&buffers.b);
        let c = standard_slice(&buffers.c);
        let packed;
        let b_view = if self.schedule.pack_b {
            packed = pack_panels(&b, k, n, tile_n);
            BView {
                data: &packed,
                n,
                k,
                panel_width: Some(tile_n),
            }
        } else {
            BView {
                data: &b,
                n,
                k,
                panel_width: None,
            }
        };

        let out = buffers
            .out
            .as_slice_mut()
            .ok_or(RunError::NonContiguousOutput)?;
        let tile = TileExec {
            a: &a,
            b: b_view,
            c: &c,
            n,
            k,
            schedule: &self.schedule,
        };
        let row_tile = self.schedule.tile_m.get() as usize;
        if self.schedule.parallel {
            out.par_chunks_mut(row_tile * n)
                .enumerate()
                .for_each(|(t, chunk)| {
                    let start = t * row_tile;
                    tile.rows(start..(start + row_tile).min(m), chunk)
                });
        } else {
            for (t, chunk) in out.chunks_mut(row_tile * n).enumerate() {
                let start = t * row_tile;
                tile.rows(start..(start + row_tile).min(m), chunk);
            }
        }
        Ok(())
    }
}

fn standard_slice(array: &Array2<f32>) -> Cow<'_, [f32]> {
    match array.as_slice() {
        Some(s) => Cow::Borrowed(s),
        None => Cow::Owned(array.iter().copied().collect()),
    }
}

/// Copies row-major `B` (`k×n`) into column panels of width `panel_width`.
///
/// Each panel is stored row-major, one after another; the last panel may be narrower.
fn pack_panels(b: &[f32], k: usize, n: usize, panel_width: usize) -> Vec<f32> {
    let mut packed = Vec::with_capacity(k * n);
    for cols in tile_ranges(n, panel_width) {
        for row in 0..k {
            packed.extend_from_slice(&b[row * n + cols.start..row * n + cols.end]);
        }
    }
    packed
}

/// Row access into `B`, either row-major or packed into panels.
#[derive(Clone, Copy)]
struct BView<'a> {
    data: &'a [f32],
    n: usize,
    k: usize,
    panel_width: Option<usize>,
}

impl<'a> BView<'a> {
    /// Returns `B[row, cols]`. With panels, `cols` must be exactly one panel.
    #[inline]
    fn row(&self, row: usize, cols: &Range<usize>) -> &'a [f32] {
        match self.panel_width {
            None => &self.data[row * self.n + cols.start..row * self.n + cols.end],
            Some(width) => {
                let base = cols.start * self.k + row * cols.len();
                debug_assert_eq!(cols.start % width, 0);
                &self.data[base..base + cols.len()]
            }
        }
    }
}

struct TileExec<'a> {
    a: &'a [f32],
    b: BView<'a>,
    c: &'a [f32],
    n: usize,
    k: usize,
    schedule: &'a Schedule,
}

impl TileExec<'_> {
    /// Computes rows `rows` of the output into `out`, which holds exactly those rows.
    fn rows(&self, rows: Range<usize>, out: &mut [f32]) {
        let (n, k) = (self.n, self.k);
        out.copy_from_slice(&self.c[rows.start * n..rows.end * n]);
        let tile_n = self.schedule.tile_n.get() as usize;
        let tile_k = self.schedule.tile_k.get() as usize;
        for cols in tile_ranges(n, tile_n) {
            for red in tile_ranges(k, tile_k) {
                for i in rows.clone() {
                    let a_row = &self.a[i * k..(i + 1) * k];
                    let out_row = &mut out[(i - rows.start) * n..(i - rows.start + 1) * n];
                    let out_tile = &mut out_row[cols.clone()];
                    match self.schedule.loop_order {
                        LoopOrder::Ikj => {
                            for r in red.clone() {
                                let a_ir = a_row[r];
                                let b_row = self.b.row(r, &cols);
                                for (o, &bv) in out_tile.iter_mut().zip(b_row) {
                                    *o += a_ir * bv;
                                }
                            }
                        }
                        LoopOrder::Ijk => {
                            for (j, o) in out_tile.iter_mut().enumerate() {
                                let mut acc = 0.0f32;
                                for r in red.clone() {
                                    acc += a_row[r] * self.b.row(r, &cols)[j];
                                }
                                *o += acc;
                            }
                        }
                    }
                }
            }
        }
    }
}
