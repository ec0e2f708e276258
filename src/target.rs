use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A compilation target.
///
/// Only the host CPU is supported. It is spelled `llvm` in tuning logs and
/// on the command line.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum TargetId {
    #[default]
    Llvm,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown target: '{0}'")]
pub struct ParseTargetError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    /// Threads available to parallel schedules.
    pub cores: usize,
}

impl Target {
    /// The host CPU, with as many cores as the current rayon pool has threads.
    pub fn host(id: TargetId) -> Self {
        Target {
            id,
            cores: rayon::current_num_threads(),
        }
    }
}

impl TargetId {
    pub fn name(&self) -> &'static str {
        match self {
            TargetId::Llvm => "llvm",
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} cores)", self.id, self.cores)
    }
}

impl FromStr for TargetId {
    type Err = ParseTargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept target strings with options, e.g. "llvm -mcpu=skylake".
        match s.split_whitespace().next() {
            Some("llvm") | Some("cpu") => Ok(TargetId::Llvm),
            _ => Err(ParseTargetError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_target_with_options() {
        assert_eq!("llvm".parse::<TargetId>().unwrap(), TargetId::Llvm);
        assert_eq!("llvm -mcpu=native".parse::<TargetId>().unwrap(), TargetId::Llvm);
        assert!("cuda".parse::<TargetId>().is_err());
        assert!("".parse::<TargetId>().is_err());
    }

    #[test]
    fn test_host_target_has_cores() {
        assert!(Target::host(TargetId::Llvm).cores >= 1);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        assert_eq!(pool.install(|| Target::host(TargetId::Llvm)).cores, 3);
    }

    proptest! {
        #[test]
        fn test_target_id_display_round_trips(id in any::<TargetId>()) {
            prop_assert_eq!(id.to_string().parse::<TargetId>().unwrap(), id);
        }
    }
}
