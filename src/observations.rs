// 📥 Observation Types - Ephemeral inputs from the collection layer
//
// Everything in this module is produced once per collector run and discarded
// after reconciliation. Nothing here is persisted directly; the reconcilers
// decide what (if anything) lands in the store.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ============================================================================
// PROVIDER TYPE
// ============================================================================

/// Which slice of the charges a billing record covers.
///
/// Collector runs are tagged `Consolidated`, `DeliveryOnly`, or
/// `GenerationOnly`; persisted partial bills may additionally carry `Bundled`
/// when a utility reports both slices on one partial statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Consolidated,
    DeliveryOnly,
    GenerationOnly,
    Bundled,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Consolidated => "consolidated",
            ProviderType::DeliveryOnly => "delivery_only",
            ProviderType::GenerationOnly => "generation_only",
            ProviderType::Bundled => "bundled",
        }
    }

    pub fn parse(s: &str) -> Result<ProviderType> {
        match s {
            "consolidated" => Ok(ProviderType::Consolidated),
            "delivery_only" | "delivery" => Ok(ProviderType::DeliveryOnly),
            "generation_only" | "generation" => Ok(ProviderType::GenerationOnly),
            "bundled" => Ok(ProviderType::Bundled),
            other => bail!("unknown provider type: {}", other),
        }
    }

    /// True for the partial-bill reconciliation path
    pub fn is_partial(&self) -> bool {
        !matches!(self, ProviderType::Consolidated)
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// LINE ITEMS & ATTACHMENT REFS
// ============================================================================

/// One charge line as scraped from a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub rate: f64,
    pub total: f64,
    pub kind: String,
    pub unit: String,
}

/// Pointer to a statement document already uploaded to the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub key: String,
    pub kind: String,
    pub format: String,
}

// ============================================================================
// BILLING PERIOD OBSERVATION
// ============================================================================

/// One billing period as reported by a collector run.
///
/// Immutable once produced. Dates may arrive from the collector as
/// date-with-time strings; they are normalized to calendar dates at
/// deserialization so the reconcilers only ever see `NaiveDate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPeriodObservation {
    #[serde(deserialize_with = "de_calendar_date")]
    pub start: NaiveDate,

    #[serde(deserialize_with = "de_calendar_date")]
    pub end: NaiveDate,

    pub cost: f64,
    pub used: f64,

    #[serde(default)]
    pub peak: Option<f64>,

    #[serde(deserialize_with = "de_calendar_date")]
    pub statement_date: NaiveDate,

    #[serde(default)]
    pub line_items: Vec<LineItem>,

    #[serde(default)]
    pub attachment_refs: Vec<AttachmentRef>,

    #[serde(default)]
    pub tariff_code: Option<String>,

    /// Tri-state: Some(true)/Some(false) as scraped, None when the utility
    /// does not report third-party supply at all
    #[serde(default)]
    pub third_party_expected: Option<bool>,
}

// ============================================================================
// STATEMENT DOCUMENT
// ============================================================================

/// Descriptor of a statement file obtained independently of bill scraping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementDocument {
    pub account_id: String,

    #[serde(deserialize_with = "de_calendar_date")]
    pub period_start: NaiveDate,

    #[serde(deserialize_with = "de_calendar_date")]
    pub period_end: NaiveDate,

    #[serde(deserialize_with = "de_calendar_date")]
    pub statement_date: NaiveDate,

    pub key: String,
    pub format: String,
}

// ============================================================================
// DATE NORMALIZATION
// ============================================================================

/// Normalize a collector-supplied date string to a calendar date.
///
/// Collectors are inconsistent: some emit plain dates, some RFC 3339
/// datetimes, some a bare `YYYY-MM-DDTHH:MM:SS`. All collapse to the date.
pub fn parse_calendar_date(s: &str) -> Result<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.date());
    }
    bail!("unrecognized date format: {}", s)
}

fn de_calendar_date<'de, D>(deserializer: D) -> std::result::Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_calendar_date(&raw).map_err(serde::de::Error::custom)
}

// ============================================================================
// BATCH LOADERS
// ============================================================================

/// Load a JSON batch of billing-period observations (one collector run).
pub fn load_observation_batch(path: &Path) -> Result<Vec<BillingPeriodObservation>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read observation batch {}", path.display()))?;
    let batch: Vec<BillingPeriodObservation> =
        serde_json::from_str(&raw).context("failed to parse observation batch")?;
    Ok(batch)
}

/// Load a JSON batch of statement-document descriptors.
pub fn load_statement_documents(path: &Path) -> Result<Vec<StatementDocument>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read document batch {}", path.display()))?;
    let docs: Vec<StatementDocument> =
        serde_json::from_str(&raw).context("failed to parse document batch")?;
    Ok(docs)
}

/// Load a CSV of reading days: one row per day, first column the date,
/// then one column per interval slot. Empty column = no reading observed.
pub fn load_reading_days(
    path: &Path,
    interval_minutes: u32,
) -> Result<BTreeMap<NaiveDate, Vec<Option<f64>>>> {
    let expected = expected_slots(interval_minutes)?;

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .from_path(path)
        .with_context(|| format!("failed to open readings CSV {}", path.display()))?;

    let mut days = BTreeMap::new();

    for (line, result) in rdr.records().enumerate() {
        let record = result.context("failed to read CSV record")?;
        let mut fields = record.iter();

        let date_str = fields
            .next()
            .with_context(|| format!("row {}: missing date column", line + 1))?;
        let occurred = parse_calendar_date(date_str)
            .with_context(|| format!("row {}: bad date", line + 1))?;

        let mut readings = Vec::with_capacity(expected);
        for field in fields {
            if field.is_empty() {
                readings.push(None);
            } else {
                let value: f64 = field
                    .parse()
                    .with_context(|| format!("row {}: bad reading value {:?}", line + 1, field))?;
                readings.push(Some(value));
            }
        }

        if readings.len() != expected {
            bail!(
                "row {}: expected {} interval slots for {}-minute intervals, got {}",
                line + 1,
                expected,
                interval_minutes,
                readings.len()
            );
        }

        days.insert(occurred, readings);
    }

    Ok(days)
}

/// Slots per day for a given interval length (1440 / interval-minutes).
pub fn expected_slots(interval_minutes: u32) -> Result<usize> {
    if interval_minutes == 0 || 1440 % interval_minutes != 0 {
        bail!("interval minutes must evenly divide 1440, got {}", interval_minutes);
    }
    Ok((1440 / interval_minutes) as usize)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_calendar_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();

        assert_eq!(parse_calendar_date("2025-01-06").unwrap(), expected);
        assert_eq!(parse_calendar_date("2025-01-06T14:30:00").unwrap(), expected);
        assert_eq!(
            parse_calendar_date("2025-01-06T14:30:00+00:00").unwrap(),
            expected
        );
        assert!(parse_calendar_date("01/06/2025").is_err());
    }

    #[test]
    fn test_observation_normalizes_datetime_inputs() {
        let json = r#"{
            "start": "2025-01-06T00:00:00",
            "end": "2025-02-03",
            "cost": 987.76,
            "used": 3072.0,
            "statement_date": "2025-02-05T09:15:00+00:00"
        }"#;

        let obs: BillingPeriodObservation = serde_json::from_str(json).unwrap();

        assert_eq!(obs.start, NaiveDate::from_ymd_opt(2025, 1, 6).unwrap());
        assert_eq!(obs.end, NaiveDate::from_ymd_opt(2025, 2, 3).unwrap());
        assert_eq!(obs.statement_date, NaiveDate::from_ymd_opt(2025, 2, 5).unwrap());
        assert!(obs.peak.is_none());
        assert!(obs.line_items.is_empty());
    }

    #[test]
    fn test_provider_type_round_trip() {
        for pt in [
            ProviderType::Consolidated,
            ProviderType::DeliveryOnly,
            ProviderType::GenerationOnly,
            ProviderType::Bundled,
        ] {
            assert_eq!(ProviderType::parse(pt.as_str()).unwrap(), pt);
        }

        assert!(ProviderType::Consolidated.is_partial() == false);
        assert!(ProviderType::GenerationOnly.is_partial());
        assert!(ProviderType::parse("solar").is_err());
    }

    #[test]
    fn test_expected_slots() {
        assert_eq!(expected_slots(15).unwrap(), 96);
        assert_eq!(expected_slots(30).unwrap(), 48);
        assert_eq!(expected_slots(60).unwrap(), 24);
        assert!(expected_slots(0).is_err());
        assert!(expected_slots(37).is_err());
    }
}
