// 📈 Reading Merger - Position-wise merge of interval-reading days
//
// Per day: missing row → insert, frozen row → ignore, otherwise merge slot
// by slot. A present incoming value replaces the stored one only when it
// differs; an absent incoming value never erases a stored reading. The row's
// `modified` refreshes only when some slot actually changed.

use crate::db::{get_reading_day, insert_reading_day, update_reading_day, ReadingDay};
use crate::observations::expected_slots;
use crate::status::{DateRangeSink, RunStatus};
use anyhow::{ensure, Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// RUN REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingRunReport {
    pub status: RunStatus,
    pub inserted: usize,
    pub merged: usize,
    pub frozen_skipped: usize,
    pub unchanged: usize,
}

impl ReadingRunReport {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} inserted, {} merged, {} frozen skipped, {} unchanged",
            self.status, self.inserted, self.merged, self.frozen_skipped, self.unchanged
        )
    }
}

// ============================================================================
// READING MERGER
// ============================================================================

pub struct ReadingMerger;

impl ReadingMerger {
    pub fn new() -> Self {
        ReadingMerger
    }

    /// Merge one collector run of day → reading-vector into the meter's
    /// stored rows. All days commit in one transaction.
    ///
    /// Vector shape is a caller contract: every incoming vector must have
    /// 1440 / `interval_minutes` slots. A mismatch is a fatal error (upstream
    /// misconfiguration), not reconcilable data.
    pub fn merge(
        &self,
        conn: &mut Connection,
        meter: &str,
        interval_minutes: u32,
        days: &BTreeMap<NaiveDate, Vec<Option<f64>>>,
        sink: &mut dyn DateRangeSink,
    ) -> Result<ReadingRunReport> {
        let expected = expected_slots(interval_minutes)?;

        for (occurred, readings) in days {
            ensure!(
                readings.len() == expected,
                "reading vector for {}/{} has {} slots, expected {}",
                meter,
                occurred,
                readings.len(),
                expected
            );
        }

        let tx = conn.transaction()?;

        let mut inserted = 0usize;
        let mut merged = 0usize;
        let mut frozen_skipped = 0usize;
        let mut unchanged = 0usize;

        for (&occurred, incoming) in days {
            let existing = get_reading_day(&tx, meter, occurred)?;

            match existing {
                None => {
                    insert_reading_day(
                        &tx,
                        &ReadingDay {
                            meter: meter.to_string(),
                            occurred,
                            readings: incoming.clone(),
                            frozen: false,
                            modified: Utc::now(),
                        },
                    )?;
                    inserted += 1;
                }
                Some(row) if row.frozen => {
                    tracing::debug!("skipping frozen reading day {}/{}", meter, occurred);
                    frozen_skipped += 1;
                }
                Some(row) => {
                    ensure!(
                        row.readings.len() == expected,
                        "stored reading day {}/{} has {} slots, expected {}",
                        meter,
                        occurred,
                        row.readings.len(),
                        expected
                    );

                    let (next, changed) = merge_vectors(&row.readings, incoming);
                    if changed {
                        update_reading_day(&tx, meter, occurred, &next, Utc::now())?;
                        merged += 1;
                    } else {
                        unchanged += 1;
                    }
                }
            }
        }

        tx.commit().context("failed to commit reading run")?;

        let status = if inserted + merged > 0 {
            RunStatus::Succeeded
        } else {
            RunStatus::Completed
        };

        if let (Some(&first), Some(&last)) = (days.keys().next(), days.keys().next_back()) {
            sink.record_range(meter, first, last);
        }

        Ok(ReadingRunReport {
            status,
            inserted,
            merged,
            frozen_skipped,
            unchanged,
        })
    }
}

impl Default for ReadingMerger {
    fn default() -> Self {
        Self::new()
    }
}

/// Slot-wise merge. Present incoming values win when they differ; absent
/// incoming values leave the stored slot alone.
fn merge_vectors(stored: &[Option<f64>], incoming: &[Option<f64>]) -> (Vec<Option<f64>>, bool) {
    let mut next = stored.to_vec();
    let mut changed = false;

    for (slot, value) in incoming.iter().enumerate() {
        if let Some(v) = value {
            if next[slot] != Some(*v) {
                next[slot] = Some(*v);
                changed = true;
            }
        }
    }

    (next, changed)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::status::NullRangeSink;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    /// 60-minute intervals keep test vectors at 24 slots
    fn day_vector(values: &[(usize, f64)]) -> Vec<Option<f64>> {
        let mut v = vec![None; 24];
        for &(slot, value) in values {
            v[slot] = Some(value);
        }
        v
    }

    #[test]
    fn test_new_days_are_inserted() {
        let mut conn = setup();
        let merger = ReadingMerger::new();

        let mut days = BTreeMap::new();
        days.insert(date(2025, 3, 1), day_vector(&[(0, 1.2), (1, 1.4)]));
        days.insert(date(2025, 3, 2), day_vector(&[(0, 1.1)]));

        let report = merger
            .merge(&mut conn, "m-1", 60, &days, &mut NullRangeSink)
            .unwrap();

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.inserted, 2);

        let row = get_reading_day(&conn, "m-1", date(2025, 3, 1)).unwrap().unwrap();
        assert_eq!(row.readings[0], Some(1.2));
        assert_eq!(row.readings[2], None);
    }

    #[test]
    fn test_absent_never_erases_present() {
        let mut conn = setup();
        let merger = ReadingMerger::new();

        let mut days = BTreeMap::new();
        days.insert(date(2025, 3, 1), day_vector(&[(0, 1.2), (1, 1.4)]));
        merger.merge(&mut conn, "m-1", 60, &days, &mut NullRangeSink).unwrap();

        // Re-scrape observes slot 2 but no longer slots 0-1
        let mut days = BTreeMap::new();
        days.insert(date(2025, 3, 1), day_vector(&[(2, 1.6)]));
        let report = merger
            .merge(&mut conn, "m-1", 60, &days, &mut NullRangeSink)
            .unwrap();

        assert_eq!(report.merged, 1);
        let row = get_reading_day(&conn, "m-1", date(2025, 3, 1)).unwrap().unwrap();
        assert_eq!(row.readings[0], Some(1.2));
        assert_eq!(row.readings[1], Some(1.4));
        assert_eq!(row.readings[2], Some(1.6));
    }

    #[test]
    fn test_identical_resubmission_keeps_modified() {
        let mut conn = setup();
        let merger = ReadingMerger::new();

        let mut days = BTreeMap::new();
        days.insert(date(2025, 3, 1), day_vector(&[(0, 1.2)]));
        merger.merge(&mut conn, "m-1", 60, &days, &mut NullRangeSink).unwrap();
        let before = get_reading_day(&conn, "m-1", date(2025, 3, 1)).unwrap().unwrap();

        let report = merger
            .merge(&mut conn, "m-1", 60, &days, &mut NullRangeSink)
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.unchanged, 1);

        let after = get_reading_day(&conn, "m-1", date(2025, 3, 1)).unwrap().unwrap();
        assert_eq!(after.modified, before.modified);
    }

    #[test]
    fn test_frozen_rows_are_ignored() {
        let mut conn = setup();
        let merger = ReadingMerger::new();

        let mut days = BTreeMap::new();
        days.insert(date(2025, 3, 1), day_vector(&[(0, 1.2)]));
        merger.merge(&mut conn, "m-1", 60, &days, &mut NullRangeSink).unwrap();
        conn.execute("UPDATE reading_days SET frozen = 1", []).unwrap();

        let mut days = BTreeMap::new();
        days.insert(date(2025, 3, 1), day_vector(&[(0, 9.9), (1, 9.9)]));
        let report = merger
            .merge(&mut conn, "m-1", 60, &days, &mut NullRangeSink)
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.frozen_skipped, 1);

        let row = get_reading_day(&conn, "m-1", date(2025, 3, 1)).unwrap().unwrap();
        assert_eq!(row.readings[0], Some(1.2));
        assert_eq!(row.readings[1], None);
    }

    #[test]
    fn test_changed_value_is_replaced() {
        let mut conn = setup();
        let merger = ReadingMerger::new();

        let mut days = BTreeMap::new();
        days.insert(date(2025, 3, 1), day_vector(&[(0, 1.2)]));
        merger.merge(&mut conn, "m-1", 60, &days, &mut NullRangeSink).unwrap();

        let mut days = BTreeMap::new();
        days.insert(date(2025, 3, 1), day_vector(&[(0, 1.3)]));
        let report = merger
            .merge(&mut conn, "m-1", 60, &days, &mut NullRangeSink)
            .unwrap();

        assert_eq!(report.merged, 1);
        let row = get_reading_day(&conn, "m-1", date(2025, 3, 1)).unwrap().unwrap();
        assert_eq!(row.readings[0], Some(1.3));
    }

    #[test]
    fn test_wrong_vector_shape_is_fatal() {
        let mut conn = setup();
        let merger = ReadingMerger::new();

        let mut days = BTreeMap::new();
        days.insert(date(2025, 3, 1), vec![Some(1.0); 10]); // not 24

        let result = merger.merge(&mut conn, "m-1", 60, &days, &mut NullRangeSink);
        assert!(result.is_err());

        // Nothing was written
        assert!(get_reading_day(&conn, "m-1", date(2025, 3, 1)).unwrap().is_none());
    }
}
