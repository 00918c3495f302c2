// Run Outcomes - Shared status reporting for all reconcilers
//
// Every reconciliation call returns a report built around RunStatus. The job
// runner branches on the status; the counters and summary strings exist for
// operators and tests.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// RUN STATUS
// ============================================================================

/// Terminal outcome of one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// At least one record was created, updated, superseded, or replaced
    Succeeded,

    /// The batch matched existing state; nothing changed
    Completed,

    /// The batch was rejected before any state was touched
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    /// True unless the run was rejected outright
    pub fn is_ok(&self) -> bool {
        !matches!(self, RunStatus::Failed)
    }

    pub fn changed(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DATE RANGE SINK
// ============================================================================

/// Collaborator interested in the span of dates a run observed.
///
/// The job runner wires this to its telemetry/index record. The engine only
/// ever reports the min/max dates touched, never record contents. Failed
/// runs report nothing.
pub trait DateRangeSink {
    fn record_range(&mut self, identifier: &str, first: NaiveDate, last: NaiveDate);
}

/// Default sink that discards everything (tests, one-off runs).
#[derive(Debug, Default)]
pub struct NullRangeSink;

impl DateRangeSink for NullRangeSink {
    fn record_range(&mut self, _identifier: &str, _first: NaiveDate, _last: NaiveDate) {}
}

/// In-memory sink that keeps every reported range (used by the job runner to
/// print what a run covered, and by tests to assert on it).
#[derive(Debug, Default)]
pub struct RecordingRangeSink {
    pub ranges: Vec<(String, NaiveDate, NaiveDate)>,
}

impl DateRangeSink for RecordingRangeSink {
    fn record_range(&mut self, identifier: &str, first: NaiveDate, last: NaiveDate) {
        self.ranges.push((identifier.to_string(), first, last));
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(RunStatus::Succeeded.is_ok());
        assert!(RunStatus::Succeeded.changed());
        assert!(RunStatus::Completed.is_ok());
        assert!(!RunStatus::Completed.changed());
        assert!(!RunStatus::Failed.is_ok());
        assert_eq!(RunStatus::Failed.as_str(), "FAILED");
    }

    #[test]
    fn test_recording_sink_keeps_ranges() {
        let mut sink = RecordingRangeSink::default();
        let first = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        let last = NaiveDate::from_ymd_opt(2025, 4, 2).unwrap();

        sink.record_range("svc-100", first, last);

        assert_eq!(sink.ranges.len(), 1);
        assert_eq!(sink.ranges[0], ("svc-100".to_string(), first, last));
    }
}
