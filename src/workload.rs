//! Symbolic workload descriptors.
//!
//! A workload is a named, parameterized function returning a [ComputeDag]: a small
//! graph of tensor declarations. Declaring a workload never executes anything;
//! executors pattern-match the DAG and lower it (see [crate::kernel]).

use crate::common::{volume, DimSize, Dtype, Shape};
use crate::utils::join_into_string;

use serde::{Deserialize, Serialize};
use smallvec::smallvec;
use std::collections::HashMap;
use std::fmt;

pub const MATMUL_ADD: &str = "matmul_add";

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("no workload registered under '{0}'")]
    Unknown(String),
    #[error("a workload is already registered under '{0}'")]
    AlreadyRegistered(String),
    #[error("workload '{name}' expects {expected} arguments, got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("argument {index} of workload '{name}' must be {expected}")]
    ArgumentType {
        name: String,
        index: usize,
        expected: &'static str,
    },
    #[error("dimension '{0}' must be a positive integer")]
    NonPositiveDim(&'static str),
    #[error(transparent)]
    Dtype(#[from] crate::common::ParseDtypeError),
    #[error("cannot combine {lhs} {lhs_shape:?} with {rhs} {rhs_shape:?} in '{op}'")]
    ShapeMismatch {
        op: String,
        lhs: String,
        lhs_shape: Vec<u32>,
        rhs: String,
        rhs_shape: Vec<u32>,
    },
}

/// A concrete argument to a workload function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WorkloadArg {
    Int(i64),
    Str(String),
}

impl From<u32> for WorkloadArg {
    fn from(value: u32) -> Self {
        WorkloadArg::Int(value.into())
    }
}

impl From<&str> for WorkloadArg {
    fn from(value: &str) -> Self {
        WorkloadArg::Str(value.to_string())
    }
}

impl From<Dtype> for WorkloadArg {
    fn from(value: Dtype) -> Self {
        WorkloadArg::Str(value.name().to_string())
    }
}

impl WorkloadArg {
    fn to_json(&self) -> serde_json::Value {
        match self {
            WorkloadArg::Int(i) => serde_json::Value::from(*i),
            WorkloadArg::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

/// Index of a tensor within its [ComputeDag].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDecl {
    pub name: String,
    pub shape: Shape,
    pub dtype: Dtype,
    pub op: TensorOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorOp {
    Placeholder,
    /// `out[i, j] = sum over k of lhs[i, k] * rhs[k, j]`.
    ///
    /// Tensors in `layout_free` have no caller-fixed physical layout; a
    /// schedule may rewrite them.
    MatmulReduce {
        lhs: TensorId,
        rhs: TensorId,
        reduce_axis: String,
        layout_free: Vec<TensorId>,
    },
    /// `out[i, j] = lhs[i, j] + rhs[i, j]`.
    ElementwiseAdd { lhs: TensorId, rhs: TensorId },
}

/// A tensor expression graph plus the ordered tensors which form its signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeDag {
    tensors: Vec<TensorDecl>,
    args: Vec<TensorId>,
}

/// Incrementally declares the tensors of a [ComputeDag].
#[derive(Default)]
pub struct DagBuilder {
    tensors: Vec<TensorDecl>,
}

impl DagBuilder {
    pub fn placeholder(&mut self, name: &str, shape: Shape, dtype: Dtype) -> TensorId {
        self.push(TensorDecl {
            name: name.to_string(),
            shape,
            dtype,
            op: TensorOp::Placeholder,
        })
    }

    pub fn matmul(
        &mut self,
        name: &str,
        lhs: TensorId,
        rhs: TensorId,
        layout_free: Vec<TensorId>,
    ) -> Result<TensorId, WorkloadError> {
        let (l, r) = (&self.tensors[lhs.0], &self.tensors[rhs.0]);
        if l.shape.len() != 2 || r.shape.len() != 2 || l.shape[1] != r.shape[0] {
            return Err(self.shape_mismatch(name, lhs, rhs));
        }
        let shape = smallvec![l.shape[0], r.shape[1]];
        let dtype = l.dtype;
        Ok(self.push(TensorDecl {
            name: name.to_string(),
            shape,
            dtype,
            op: TensorOp::MatmulReduce {
                lhs,
                rhs,
                reduce_axis: "k".to_string(),
                layout_free,
            },
        }))
    }

    pub fn add(
        &mut self,
        name: &str,
        lhs: TensorId,
        rhs: TensorId,
    ) -> Result<TensorId, WorkloadError> {
        let (l, r) = (&self.tensors[lhs.0], &self.tensors[rhs.0]);
        if l.shape != r.shape {
            return Err(self.shape_mismatch(name, lhs, rhs));
        }
        let shape = l.shape.clone();
        let dtype = l.dtype;
        Ok(self.push(TensorDecl {
            name: name.to_string(),
            shape,
            dtype,
            op: TensorOp::ElementwiseAdd { lhs, rhs },
        }))
    }

    pub fn finish(self, args: Vec<TensorId>) -> ComputeDag {
        ComputeDag {
            tensors: self.tensors,
            args,
        }
    }

    fn push(&mut self, decl: TensorDecl) -> TensorId {
        self.tensors.push(decl);
        TensorId(self.tensors.len() - 1)
    }

    fn shape_mismatch(&self, op: &str, lhs: TensorId, rhs: TensorId) -> WorkloadError {
        let (l, r) = (&self.tensors[lhs.0], &self.tensors[rhs.0]);
        WorkloadError::ShapeMismatch {
            op: op.to_string(),
            lhs: l.name.clone(),
            lhs_shape: l.shape.iter().map(|d| d.get()).collect(),
            rhs: r.name.clone(),
            rhs_shape: r.shape.iter().map(|d| d.get()).collect(),
        }
    }
}

impl ComputeDag {
    pub fn tensor(&self, id: TensorId) -> &TensorDecl {
        &self.tensors[id.0]
    }

    /// The tensors passed to (and written by) a compiled kernel, in order.
    pub fn args(&self) -> impl ExactSizeIterator<Item = &TensorDecl> + '_ {
        self.args.iter().map(|&id| self.tensor(id))
    }

    pub fn arg_ids(&self) -> &[TensorId] {
        &self.args
    }

    /// Whether some operation declared `id` layout-free.
    pub fn is_layout_free(&self, id: TensorId) -> bool {
        self.tensors.iter().any(|t| match &t.op {
            TensorOp::MatmulReduce { layout_free, .. } => layout_free.contains(&id),
            _ => false,
        })
    }

    /// Floating-point operations needed to evaluate every non-placeholder tensor once.
    pub fn flop_count(&self) -> f64 {
        self.tensors
            .iter()
            .map(|t| match &t.op {
                TensorOp::Placeholder => 0.0,
                TensorOp::MatmulReduce { lhs, .. } => {
                    let k = self.tensor(*lhs).shape[1].get() as f64;
                    2.0 * k * volume(&t.shape) as f64
                }
                TensorOp::ElementwiseAdd { .. } => volume(&t.shape) as f64,
            })
            .sum()
    }
}

impl fmt::Display for ComputeDag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in &self.tensors {
            match &t.op {
                TensorOp::Placeholder => writeln!(
                    f,
                    "{} = PLACEHOLDER [{}]",
                    t.name,
                    join_into_string(&t.shape, ", ")
                )?,
                TensorOp::MatmulReduce {
                    lhs,
                    rhs,
                    reduce_axis,
                    ..
                } => writeln!(
                    f,
                    "{}(i, j) += ({}[i, {r}]*{}[{r}, j])",
                    t.name,
                    self.tensor(*lhs).name,
                    self.tensor(*rhs).name,
                    r = reduce_axis
                )?,
                TensorOp::ElementwiseAdd { lhs, rhs } => writeln!(
                    f,
                    "{}(i, j) = ({}[i, j] + {}[i, j])",
                    t.name,
                    self.tensor(*lhs).name,
                    self.tensor(*rhs).name
                )?,
            }
        }
        Ok(())
    }
}

pub type WorkloadFn = fn(&[WorkloadArg]) -> Result<ComputeDag, WorkloadError>;

/// Maps workload names to their functions.
pub struct WorkloadRegistry {
    funcs: HashMap<String, WorkloadFn>,
}

impl Default for WorkloadRegistry {
    fn default() -> Self {
        let mut registry = WorkloadRegistry::empty();
        registry
            .register(MATMUL_ADD, matmul_add_workload)
            .expect("fresh registry should accept matmul_add");
        registry
    }
}

impl WorkloadRegistry {
    pub fn empty() -> Self {
        WorkloadRegistry {
            funcs: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, func: WorkloadFn) -> Result<(), WorkloadError> {
        if self.funcs.contains_key(name) {
            return Err(WorkloadError::AlreadyRegistered(name.to_string()));
        }
        self.funcs.insert(name.to_string(), func);
        Ok(())
    }

    pub fn instantiate(&self, name: &str, args: &[WorkloadArg]) -> Result<ComputeDag, WorkloadError> {
        let func = self
            .funcs
            .get(name)
            .ok_or_else(|| WorkloadError::Unknown(name.to_string()))?;
        func(args)
    }
}

/// Serializes a workload name and its arguments into the key used by tuning logs.
///
/// The key is a JSON array: `["matmul_add", 64, 64, 64, "float32"]`.
pub fn workload_key(name: &str, args: &[WorkloadArg]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(serde_json::Value::from(name));
    parts.extend(args.iter().map(WorkloadArg::to_json));
    serde_json::Value::Array(parts).to_string()
}

/// Declares `out = A·B + C` with `A: M×K`, `B: K×N` and `C, out: M×N`.
///
/// Returns the DAG whose arguments are `[A, B, C, out]`. `B` is marked
/// layout-free on the matmul so schedules may repack it.
pub fn matmul_add(m: DimSize, n: DimSize, k: DimSize, dtype: Dtype) -> ComputeDag {
    let mut builder = DagBuilder::default();
    let a = builder.placeholder("A", smallvec![m, k], dtype);
    let b = builder.placeholder("B", smallvec![k, n], dtype);
    let c = builder.placeholder("C", smallvec![m, n], dtype);
    let matmul = builder
        .matmul("matmul", a, b, vec![b])
        .expect("A and B share the K dimension");
    let out = builder
        .add("out", matmul, c)
        .expect("matmul and C are both M×N");
    builder.finish(vec![a, b, c, out])
}

fn matmul_add_workload(args: &[WorkloadArg]) -> Result<ComputeDag, WorkloadError> {
    const DIM_NAMES: [&str; 3] = ["M", "N", "K"];
    if args.len() != 4 {
        return Err(WorkloadError::Arity {
            name: MATMUL_ADD.to_string(),
            expected: 4,
            actual: args.len(),
        });
    }
    let mut dims = [DimSize::MIN; 3];
    for (index, (dim, name)) in dims.iter_mut().zip(DIM_NAMES).enumerate() {
        let WorkloadArg::Int(v) = args[index] else {
            return Err(WorkloadError::ArgumentType {
                name: MATMUL_ADD.to_string(),
                index,
                expected: "an integer",
            });
        };
        *dim = u32::try_from(v)
            .ok()
            .and_then(DimSize::new)
            .ok_or(WorkloadError::NonPositiveDim(name))?;
    }
    let WorkloadArg::Str(dtype) = &args[3] else {
        return Err(WorkloadError::ArgumentType {
            name: MATMUL_ADD.to_string(),
            index: 3,
            expected: "a dtype string",
        });
    };
    let [m, n, k] = dims;
    Ok(matmul_add(m, n, k, dtype.parse()?))
}
