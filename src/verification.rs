//! Host-side reference computation and tolerance checks for kernel outputs.

use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, ArrayBase, Data, Ix2, Zip};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum MismatchError {
    #[error("shapes differ: expected {expected:?}, actual {actual:?}")]
    Shape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("{0}")]
    Values(MismatchReport),
}

/// Summary of the elements which violate a tolerance, in the manner of numpy's `assert_allclose`.
#[derive(Debug, Clone, PartialEq)]
pub struct MismatchReport {
    pub rtol: f32,
    pub mismatched: usize,
    pub total: usize,
    pub max_abs_diff: f32,
    pub max_rel_diff: f32,
    pub first_index: (usize, usize),
    pub first_expected: f32,
    pub first_actual: f32,
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Not equal to tolerance rtol={:e}, atol=0", self.rtol)?;
        writeln!(
            f,
            "Mismatched elements: {} / {} ({:.3}%)",
            self.mismatched,
            self.total,
            100.0 * self.mismatched as f64 / self.total as f64
        )?;
        writeln!(f, "Max absolute difference: {}", self.max_abs_diff)?;
        writeln!(f, "Max relative difference: {}", self.max_rel_diff)?;
        write!(
            f,
            "First mismatch at {:?}: expected {}, actual {}",
            self.first_index, self.first_expected, self.first_actual
        )
    }
}

/// Computes `a.dot(b) + c`.
pub fn reference_matmul_add<S1, S2, S3>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
    c: &ArrayBase<S3, Ix2>,
) -> Array2<f32>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    S3: Data<Elem = f32>,
{
    let mut out = c.to_owned();
    general_mat_mul(1.0, a, b, 1.0, &mut out);
    out
}

/// Checks `|actual - expected| <= rtol * |expected|` elementwise.
///
/// NaN never compares close, so a kernel that writes NaN always fails.
pub fn assert_allclose<S1, S2>(
    expected: &ArrayBase<S1, Ix2>,
    actual: &ArrayBase<S2, Ix2>,
    rtol: f32,
) -> Result<(), MismatchError>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    if expected.dim() != actual.dim() {
        return Err(MismatchError::Shape {
            expected: expected.dim(),
            actual: actual.dim(),
        });
    }

    let mut report: Option<MismatchReport> = None;
    let mut max_abs_diff = 0.0f32;
    let mut max_rel_diff = 0.0f32;
    let mut mismatched = 0;
    Zip::indexed(expected).and(actual).for_each(|idx, &e, &a| {
        let abs_diff = (a - e).abs();
        let close = abs_diff <= rtol * e.abs();
        if close {
            return;
        }
        mismatched += 1;
        max_abs_diff = max_abs_diff.max(abs_diff);
        if e != 0.0 {
            max_rel_diff = max_rel_diff.max(abs_diff / e.abs());
        } else {
            max_rel_diff = f32::INFINITY;
        }
        if report.is_none() {
            report = Some(MismatchReport {
                rtol,
                mismatched: 0,
                total: expected.len(),
                max_abs_diff: 0.0,
                max_rel_diff: 0.0,
                first_index: idx,
                first_expected: e,
                first_actual: a,
            });
        }
    });

    match report {
        None => Ok(()),
        Some(mut report) => {
            report.mismatched = mismatched;
            report.max_abs_diff = max_abs_diff;
            report.max_rel_diff = max_rel_diff;
            log::debug!("Output failed correctness check");
            Err(MismatchError::Values(report))
        }
    }
}
