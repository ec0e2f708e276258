use crate::schedule::Schedule;

use prettytable::{self, format, row, Table};
use std::time::Duration;

/// The state of a search at the end of one measurement round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundStats {
    pub round: usize,
    /// Trials measured so far, across all rounds.
    pub trials: usize,
    pub best_latency: Option<Duration>,
    pub best_gflops: Option<f64>,
    pub best_schedule: Option<Schedule>,
}

pub fn rounds_table(rounds: &[RoundStats]) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["Round", "Trials", "Best (ms)", "GFLOPs/s", "Schedule"]);
    for r in rounds {
        let (latency, gflops, schedule) = match (r.best_latency, r.best_gflops, r.best_schedule) {
            (Some(l), Some(g), Some(s)) => (
                format!("{:.4}", l.as_secs_f64() * 1e3),
                format!("{:.3}", g),
                s.to_string(),
            ),
            _ => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        table.add_row(row![r.round, r.trials, latency, gflops, schedule]);
    }

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

pub fn pprint_rounds(rounds: &[RoundStats]) {
    if rounds.is_empty() {
        return;
    }
    rounds_table(rounds).printstd();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DimSize, MatmulDims};

    #[test]
    fn test_rounds_table_renders_missing_best_as_dash() {
        let dims = MatmulDims::new(
            DimSize::new(8).unwrap(),
            DimSize::new(8).unwrap(),
            DimSize::new(8).unwrap(),
        );
        let rounds = [
            RoundStats {
                round: 1,
                trials: 4,
                best_latency: None,
                best_gflops: None,
                best_schedule: None,
            },
            RoundStats {
                round: 2,
                trials: 8,
                best_latency: Some(Duration::from_micros(1500)),
                best_gflops: Some(0.683),
                best_schedule: Some(Schedule::naive(&dims)),
            },
        ];
        let table = rounds_table(&rounds);
        assert_eq!(table.len(), 2);
        let text = table.to_string();
        assert!(text.contains("GFLOPs/s"), "{text}");
        assert!(text.contains("1.5000"), "{text}");
        assert!(text.contains("0.683"), "{text}");
        assert!(text.contains('-'), "{text}");
    }
}
