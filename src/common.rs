use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::NonZeroU32;
use std::str::FromStr;

pub type DimSize = NonZeroU32;
pub type Shape = smallvec::SmallVec<[DimSize; 2]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float32,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported dtype: '{0}'")]
pub struct ParseDtypeError(String);

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    /// The name used for this Dtype in workload keys.
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::Float32 => "float32",
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dtype {
    type Err = ParseDtypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float32" | "f32" => Ok(Dtype::Float32),
            _ => Err(ParseDtypeError(s.to_string())),
        }
    }
}

/// Concrete sizes of a matmul-plus-bias: `A: M×K`, `B: K×N`, `C, out: M×N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MatmulDims {
    pub m: DimSize,
    pub n: DimSize,
    pub k: DimSize,
}

impl MatmulDims {
    pub fn new(m: DimSize, n: DimSize, k: DimSize) -> Self {
        MatmulDims { m, n, k }
    }

    /// Floating-point operations in the matrix product alone (`2·M·N·K`).
    pub fn matmul_flops(&self) -> f64 {
        2.0 * f64::from(self.m.get()) * f64::from(self.n.get()) * f64::from(self.k.get())
    }

    pub fn a_shape(&self) -> (usize, usize) {
        (self.m.get() as usize, self.k.get() as usize)
    }

    pub fn b_shape(&self) -> (usize, usize) {
        (self.k.get() as usize, self.n.get() as usize)
    }

    pub fn out_shape(&self) -> (usize, usize) {
        (self.m.get() as usize, self.n.get() as usize)
    }
}

impl Display for MatmulDims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "M={} N={} K={}", self.m, self.n, self.k)
    }
}

/// Returns the number of elements in a tensor of the given shape.
pub fn volume(shape: &[DimSize]) -> usize {
    shape.iter().map(|d| d.get() as usize).product()
}
