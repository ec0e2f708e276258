//! The tuning log: one JSON object per measured schedule, one object per line.
//!
//! Logs are append-only. Reading a log is strict: a line which does not parse
//! is an error rather than being skipped, so a damaged log can never quietly
//! change which schedule is selected.

use crate::schedule::Schedule;
use crate::target::TargetId;
use crate::task::SearchTask;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const LOG_FORMAT_VERSION: &str = "0.1";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("tuning log '{0}' does not exist")]
    Missing(PathBuf),
    #[error("tuning log '{0}' contains no records")]
    Empty(PathBuf),
    #[error("tuning log '{path}' is corrupt at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("tuning log '{path}' has no valid record for {task}")]
    NoMatchingRecord { path: PathBuf, task: String },
    #[error("I/O error on tuning log '{path}': {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Outcome class of a measurement. Anything other than `NoError` has no usable cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(into = "u8", try_from = "u8")]
pub enum MeasureErrorNo {
    NoError = 0,
    /// The schedule does not apply to the task.
    InstantiationError = 1,
    CompileHostError = 2,
    RuntimeDeviceError = 3,
    WrongAnswerError = 4,
}

impl From<MeasureErrorNo> for u8 {
    fn from(value: MeasureErrorNo) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for MeasureErrorNo {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MeasureErrorNo::NoError),
            1 => Ok(MeasureErrorNo::InstantiationError),
            2 => Ok(MeasureErrorNo::CompileHostError),
            3 => Ok(MeasureErrorNo::RuntimeDeviceError),
            4 => Ok(MeasureErrorNo::WrongAnswerError),
            _ => Err(format!("unknown error_no {value}")),
        }
    }
}

/// What was measured: a schedule for a task.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MeasureInput {
    pub workload_key: String,
    pub target: TargetId,
    pub schedule: Schedule,
}

impl MeasureInput {
    pub fn new(task: &SearchTask, schedule: Schedule) -> Self {
        MeasureInput {
            workload_key: task.workload_key().to_string(),
            target: task.target().id,
            schedule,
        }
    }

    pub fn matches(&self, task: &SearchTask) -> bool {
        self.workload_key == task.workload_key() && self.target == task.target().id
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MeasureResult {
    /// Seconds per kernel invocation, one entry per repeat.
    pub costs: Vec<f64>,
    pub error_no: MeasureErrorNo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Wall-clock seconds spent building and measuring.
    pub all_cost: f64,
    /// Seconds since the Unix epoch when the measurement finished.
    pub timestamp: f64,
}

impl MeasureResult {
    pub fn success(costs: Vec<f64>, all_cost: f64) -> Self {
        MeasureResult {
            costs,
            error_no: MeasureErrorNo::NoError,
            error_msg: None,
            all_cost,
            timestamp: now_secs(),
        }
    }

    pub fn failure(error_no: MeasureErrorNo, error_msg: String, all_cost: f64) -> Self {
        debug_assert_ne!(error_no, MeasureErrorNo::NoError);
        MeasureResult {
            costs: Vec::new(),
            error_no,
            error_msg: Some(error_msg),
            all_cost,
            timestamp: now_secs(),
        }
    }

    /// Mean seconds per invocation; `None` for failed measurements.
    pub fn mean_cost(&self) -> Option<f64> {
        if self.error_no != MeasureErrorNo::NoError || self.costs.is_empty() {
            return None;
        }
        Some(self.costs.iter().sum::<f64>() / self.costs.len() as f64)
    }
}

/// One line of a tuning log.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TuningRecord {
    #[serde(rename = "i")]
    pub input: MeasureInput,
    #[serde(rename = "r")]
    pub result: MeasureResult,
    #[serde(rename = "v")]
    pub version: String,
}

impl TuningRecord {
    pub fn new(input: MeasureInput, result: MeasureResult) -> Self {
        TuningRecord {
            input,
            result,
            version: LOG_FORMAT_VERSION.to_string(),
        }
    }
}

/// Receives every measurement made during a search.
pub trait MeasureCallback {
    fn on_measure(&mut self, input: &MeasureInput, result: &MeasureResult) -> io::Result<()>;

    /// Called after each round of measurements.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Appends each measurement to a log file.
pub struct RecordToFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RecordToFile {
    /// Opens `path` for appending, creating it if needed.
    pub fn new(path: &Path) -> Result<Self, LogError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Appending tuning records to {}", path.display());
        Ok(RecordToFile {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

impl MeasureCallback for RecordToFile {
    fn on_measure(&mut self, input: &MeasureInput, result: &MeasureResult) -> io::Result<()> {
        let record = TuningRecord::new(input.clone(), result.clone());
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Drop for RecordToFile {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::warn!("Failed to flush {}: {}", self.path.display(), e);
        }
    }
}

/// Truncates (or creates) a log so a run starts from an empty history.
pub fn reset_log(path: &Path) -> Result<(), LogError> {
    info!("Truncating tuning log {}", path.display());
    File::create(path).map(|_| ()).map_err(|source| LogError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads every record in a log. Blank lines are ignored.
pub fn load_records(path: &Path) -> Result<Vec<TuningRecord>, LogError> {
    let file = File::open(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => LogError::Missing(path.to_path_buf()),
        _ => LogError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| LogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| LogError::Corrupt {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        records.push(record);
    }
    if records.is_empty() {
        return Err(LogError::Empty(path.to_path_buf()));
    }
    Ok(records)
}

/// Returns the fastest successful record for `task`, with its mean cost in seconds.
///
/// Records for other tasks or targets are ignored, as are records whose
/// schedule does not fit the task's problem.
pub fn load_best(
    path: &Path,
    task: &SearchTask,
    is_applicable: impl Fn(&Schedule) -> bool,
) -> Result<(TuningRecord, f64), LogError> {
    let records = load_records(path)?;
    let total = records.len();
    let best = records
        .into_iter()
        .filter(|r| r.input.matches(task) && is_applicable(&r.input.schedule))
        .filter_map(|r| r.result.mean_cost().map(|cost| (r, cost)))
        .min_by(|(_, a), (_, b)| a.total_cmp(b));
    match best {
        Some((record, cost)) => {
            debug!(
                "Selected {} ({:.3e}s) from {} records",
                record.input.schedule, cost, total
            );
            Ok((record, cost))
        }
        None => Err(LogError::NoMatchingRecord {
            path: path.to_path_buf(),
            task: task.to_string(),
        }),
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DimSize, MatmulDims};
    use crate::target::Target;
    use crate::workload::{WorkloadRegistry, MATMUL_ADD};
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn task(m: u32, n: u32, k: u32) -> SearchTask {
        SearchTask::new(
            &WorkloadRegistry::default(),
            MATMUL_ADD,
            vec![m.into(), n.into(), k.into(), "float32".into()],
            Target::host(TargetId::Llvm),
        )
        .unwrap()
    }

    fn schedule(tile: u32, size: u32) -> Schedule {
        let d = DimSize::new(size).unwrap();
        let mut s = Schedule::naive(&MatmulDims::new(d, d, d));
        s.tile_m = DimSize::new(tile).unwrap();
        s
    }

    fn write_log(path: &Path, records: &[(MeasureInput, MeasureResult)]) {
        let mut cb = RecordToFile::new(path).unwrap();
        for (i, r) in records {
            cb.on_measure(i, r).unwrap();
        }
        cb.flush().unwrap();
    }

    #[test]
    fn test_load_best_picks_fastest_matching_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matmul.json");
        let t = task(8, 8, 8);
        let other = task(16, 16, 16);
        write_log(
            &path,
            &[
                (MeasureInput::new(&t, schedule(1, 8)), MeasureResult::success(vec![3.0, 3.0], 1.0)),
                (MeasureInput::new(&t, schedule(2, 8)), MeasureResult::success(vec![1.0, 2.0], 1.0)),
                (
                    MeasureInput::new(&t, schedule(4, 8)),
                    MeasureResult::failure(MeasureErrorNo::RuntimeDeviceError, "boom".into(), 1.0),
                ),
                (MeasureInput::new(&other, schedule(16, 16)), MeasureResult::success(vec![0.1], 1.0)),
            ],
        );
        let (best, cost) = load_best(&path, &t, |_| true).unwrap();
        assert_eq!(best.input.schedule, schedule(2, 8));
        assert_eq!(cost, 1.5);
        assert_eq!(load_records(&path).unwrap().len(), 4);
    }

    #[test]
    fn test_records_accumulate_across_writers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let t = task(4, 4, 4);
        let rec = (MeasureInput::new(&t, schedule(1, 4)), MeasureResult::success(vec![2.0], 1.0));
        write_log(&path, &[rec.clone()]);
        write_log(&path, &[rec]);
        assert_eq!(load_records(&path).unwrap().len(), 2);
        reset_log(&path).unwrap();
        assert!(matches!(load_records(&path), Err(LogError::Empty(_))));
    }

    #[test]
    fn test_missing_empty_and_corrupt_logs_are_errors() {
        let dir = tempdir().unwrap();
        let t = task(2, 2, 2);

        let missing = dir.path().join("missing.json");
        assert!(matches!(load_best(&missing, &t, |_| true), Err(LogError::Missing(_))));

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "\n\n").unwrap();
        assert!(matches!(load_best(&empty, &t, |_| true), Err(LogError::Empty(_))));

        let corrupt = dir.path().join("corrupt.json");
        write_log(
            &corrupt,
            &[(MeasureInput::new(&t, schedule(1, 2)), MeasureResult::success(vec![1.0], 1.0))],
        );
        let mut f = OpenOptions::new().append(true).open(&corrupt).unwrap();
        f.write_all(b"{\"i\": {\"workload_key\": \n").unwrap();
        let err = load_best(&corrupt, &t, |_| true).unwrap_err();
        assert!(matches!(err, LogError::Corrupt { line: 2, .. }), "{err}");
    }

    #[test]
    fn test_no_matching_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let t = task(2, 2, 2);
        write_log(
            &path,
            &[(
                MeasureInput::new(&t, schedule(1, 2)),
                MeasureResult::failure(MeasureErrorNo::CompileHostError, "bad".into(), 0.5),
            )],
        );
        assert!(matches!(
            load_best(&path, &t, |_| true),
            Err(LogError::NoMatchingRecord { .. })
        ));
        write_log(
            &path,
            &[(MeasureInput::new(&t, schedule(1, 2)), MeasureResult::success(vec![1.0], 1.0))],
        );
        assert!(matches!(
            load_best(&path, &t, |_| false),
            Err(LogError::NoMatchingRecord { .. })
        ));
    }

    #[test]
    fn test_record_line_format() {
        let t = task(1, 1, 1);
        let mut result = MeasureResult::success(vec![0.5], 2.0);
        result.timestamp = 10.0;
        let record = TuningRecord::new(MeasureInput::new(&t, schedule(1, 1)), result);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["i"]["workload_key"], r#"["matmul_add",1,1,1,"float32"]"#);
        assert_eq!(json["i"]["target"], "llvm");
        assert_eq!(json["r"]["error_no"], 0);
        assert_eq!(json["r"]["costs"][0], 0.5);
        assert_eq!(json["v"], LOG_FORMAT_VERSION);
        assert!(json["r"].get("error_msg").is_none());
    }

    proptest! {
        #[test]
        fn test_error_no_serializes_as_integer(error_no in any::<MeasureErrorNo>()) {
            let json = serde_json::to_string(&error_no).unwrap();
            prop_assert_eq!(&json, &(error_no as u8).to_string());
            prop_assert_eq!(serde_json::from_str::<MeasureErrorNo>(&json).unwrap(), error_no);
        }
    }
}
