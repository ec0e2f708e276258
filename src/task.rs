use crate::target::Target;
use crate::utils::join_into_string;
use crate::workload::{workload_key, ComputeDag, WorkloadArg, WorkloadError, WorkloadRegistry};

use std::fmt;

/// A workload bound to concrete arguments and a compilation target: the unit of tuning.
#[derive(Debug, Clone)]
pub struct SearchTask {
    workload_name: String,
    args: Vec<WorkloadArg>,
    workload_key: String,
    compute_dag: ComputeDag,
    target: Target,
}

impl SearchTask {
    pub fn new(
        registry: &WorkloadRegistry,
        workload_name: &str,
        args: Vec<WorkloadArg>,
        target: Target,
    ) -> Result<Self, WorkloadError> {
        let compute_dag = registry.instantiate(workload_name, &args)?;
        let workload_key = workload_key(workload_name, &args);
        Ok(SearchTask {
            workload_name: workload_name.to_string(),
            args,
            workload_key,
            compute_dag,
            target,
        })
    }

    pub fn workload_name(&self) -> &str {
        &self.workload_name
    }

    /// Identifies this task's workload and arguments in tuning logs.
    pub fn workload_key(&self) -> &str {
        &self.workload_key
    }

    pub fn compute_dag(&self) -> &ComputeDag {
        &self.compute_dag
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl fmt::Display for SearchTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = join_into_string(
            self.args.iter().map(|a| match a {
                WorkloadArg::Int(i) => i.to_string(),
                WorkloadArg::Str(s) => format!("{s:?}"),
            }),
            ", ",
        );
        write!(f, "{}({}) on {}", self.workload_name, args, self.target.id)
    }
}
