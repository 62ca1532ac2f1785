use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub started_at_unix: i64,
    pub cycles_total: u64,
    pub cycles_failed: u64,
    pub last_success_unix: Option<i64>,
    pub last_cycle: Option<CycleSummary>,
}

/// What one collect-and-persist pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub started_at_unix: i64,
    pub finished_at_unix: i64,
    pub duration_ms: u64,
    pub hosts_reported: usize,
    pub hosts_parsed: usize,
    pub hosts_dropped: usize,
    /// Update statements that completed before the cycle ended.
    pub hosts_written: usize,
    pub rows_updated: u64,
    /// Parsed hosts with no matching device row.
    pub unknown_labels: Vec<String>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
}

impl CycleSummary {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn record_cycle(&mut self, summary: CycleSummary) {
        self.cycles_total += 1;
        if summary.succeeded() {
            self.last_success_unix = Some(summary.finished_at_unix);
        } else {
            self.cycles_failed += 1;
        }
        self.last_cycle = Some(summary);
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_cycle_keeps_last_success() {
        let mut state = State::new(0);
        state.record_cycle(CycleSummary {
            finished_at_unix: 10,
            hosts_parsed: 3,
            ..CycleSummary::default()
        });
        state.record_cycle(CycleSummary {
            finished_at_unix: 20,
            failed_stage: Some("collect".to_string()),
            error: Some("connection refused".to_string()),
            ..CycleSummary::default()
        });

        assert_eq!(state.cycles_total, 2);
        assert_eq!(state.cycles_failed, 1);
        assert_eq!(state.last_success_unix, Some(10));
        let last = state.last_cycle.expect("цикл записан");
        assert!(!last.succeeded());
        assert_eq!(last.finished_at_unix, 20);
    }
}
