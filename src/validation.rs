// ✅ Validator - Whole-batch pre-flight checks
//
// Runs before any stored state is touched. A violation fails the entire
// batch atomically; there is no partial apply. The current date is an
// argument so the future-bill check stays pure and testable.

use crate::equivalence::ranges_overlap;
use crate::observations::BillingPeriodObservation;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// VIOLATIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchViolation {
    /// Two observations in the same batch cover intersecting date ranges
    InternalOverlap {
        first: (NaiveDate, NaiveDate),
        second: (NaiveDate, NaiveDate),
    },

    /// An observation's period ends after the current date
    FutureBill { end: NaiveDate, today: NaiveDate },
}

impl BatchViolation {
    pub fn message(&self) -> String {
        match self {
            BatchViolation::InternalOverlap { first, second } => format!(
                "batch contains overlapping periods {} - {} and {} - {}",
                first.0, first.1, second.0, second.1
            ),
            BatchViolation::FutureBill { end, today } => {
                format!("billing period ends {} which is after today ({})", end, today)
            }
        }
    }
}

impl std::fmt::Display for BatchViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

// ============================================================================
// BATCH VALIDATION
// ============================================================================

/// Check a batch of observations destined for one service/provider type.
/// Empty result = the batch may proceed to reconciliation.
pub fn validate_batch(
    observations: &[BillingPeriodObservation],
    today: NaiveDate,
) -> Vec<BatchViolation> {
    let mut violations = Vec::new();

    for (i, a) in observations.iter().enumerate() {
        for b in observations.iter().skip(i + 1) {
            if ranges_overlap(a.start, a.end, b.start, b.end) {
                violations.push(BatchViolation::InternalOverlap {
                    first: (a.start, a.end),
                    second: (b.start, b.end),
                });
            }
        }

        if a.end > today {
            violations.push(BatchViolation::FutureBill { end: a.end, today });
        }
    }

    violations
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn observation(start: NaiveDate, end: NaiveDate) -> BillingPeriodObservation {
        BillingPeriodObservation {
            start,
            end,
            cost: 100.0,
            used: 500.0,
            peak: None,
            statement_date: end,
            line_items: vec![],
            attachment_refs: vec![],
            tariff_code: None,
            third_party_expected: None,
        }
    }

    #[test]
    fn test_clean_batch_passes() {
        let batch = vec![
            observation(date(2025, 1, 6), date(2025, 2, 3)),
            observation(date(2025, 2, 4), date(2025, 3, 4)),
            observation(date(2025, 3, 5), date(2025, 4, 2)),
        ];

        let violations = validate_batch(&batch, date(2025, 4, 10));
        assert!(violations.is_empty());
    }

    #[test]
    fn test_internal_overlap_fails_batch() {
        let batch = vec![
            observation(date(2025, 1, 6), date(2025, 2, 3)),
            observation(date(2025, 2, 3), date(2025, 3, 4)), // shares Feb 3
        ];

        let violations = validate_batch(&batch, date(2025, 4, 10));
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            violations[0],
            BatchViolation::InternalOverlap { .. }
        ));
        assert!(violations[0].message().contains("overlapping"));
    }

    #[test]
    fn test_future_bill_fails_batch() {
        let batch = vec![observation(date(2025, 3, 5), date(2025, 4, 2))];

        let violations = validate_batch(&batch, date(2025, 3, 20));
        assert_eq!(violations.len(), 1);
        assert!(matches!(violations[0], BatchViolation::FutureBill { .. }));

        // Ending exactly today is allowed; only strictly-future ends fail
        let violations = validate_batch(&batch, date(2025, 4, 2));
        assert!(violations.is_empty());
    }

    #[test]
    fn test_empty_batch_passes() {
        assert!(validate_batch(&[], date(2025, 1, 1)).is_empty());
    }
}
