// ⚖️ Equivalence - Canonical-form comparison between observations and records
//
// Pure functions over already-loaded values; no storage access. Line items
// and attachments are compared after canonicalization (sorting), so a
// collector that merely reorders them never looks like a correction.

use crate::db::{Bill, PartialBill};
use crate::observations::{AttachmentRef, BillingPeriodObservation, LineItem};
use chrono::NaiveDate;

// ============================================================================
// EQUIVALENCE ENGINE
// ============================================================================

pub struct Equivalence {
    /// Tolerance for currency/quantity comparisons (default: 0.005,
    /// i.e. equal after rounding to cents)
    pub tolerance: f64,
}

impl Equivalence {
    pub fn new() -> Self {
        Equivalence { tolerance: 0.005 }
    }

    pub fn with_tolerance(tolerance: f64) -> Self {
        Equivalence { tolerance }
    }

    pub fn amounts_equal(&self, a: f64, b: f64) -> bool {
        (a - b).abs() <= self.tolerance
    }

    fn optional_amounts_equal(&self, a: Option<f64>, b: Option<f64>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => self.amounts_equal(a, b),
            _ => false,
        }
    }

    /// Field-by-field comparison of an observation against a partial bill
    /// whose date range already matches exactly.
    pub fn observation_matches_partial(
        &self,
        obs: &BillingPeriodObservation,
        partial: &PartialBill,
    ) -> bool {
        self.amounts_equal(obs.cost, partial.cost)
            && self.amounts_equal(obs.used, partial.used)
            && self.optional_amounts_equal(obs.peak, partial.peak)
            && obs.tariff_code == partial.tariff_code
            && self.items_equal(&obs.line_items, &partial.items)
            && attachments_equal(&obs.attachment_refs, &partial.attachments)
    }

    /// Field-by-field comparison of an observation against a consolidated
    /// bill whose date range already matches exactly.
    pub fn observation_matches_bill(&self, obs: &BillingPeriodObservation, bill: &Bill) -> bool {
        self.amounts_equal(obs.cost, bill.cost)
            && self.amounts_equal(obs.used, bill.used)
            && self.optional_amounts_equal(obs.peak, bill.peak)
            && self.items_equal(&obs.line_items, &bill.items)
            && attachments_equal(&obs.attachment_refs, &bill.attachments)
    }

    /// Order-independent line-item comparison.
    pub fn items_equal(&self, a: &[LineItem], b: &[LineItem]) -> bool {
        if a.len() != b.len() {
            return false;
        }

        let a = canonical_items(a);
        let b = canonical_items(b);

        a.iter().zip(b.iter()).all(|(x, y)| {
            x.description == y.description
                && x.kind == y.kind
                && x.unit == y.unit
                && self.amounts_equal(x.quantity, y.quantity)
                && self.amounts_equal(x.rate, y.rate)
                && self.amounts_equal(x.total, y.total)
        })
    }

    /// A zero-usage scrape against a record with real usage is a collector
    /// error, not a correction. Discard instead of applying.
    pub fn is_bad_override(&self, obs: &BillingPeriodObservation, existing_used: f64) -> bool {
        !self.amounts_equal(obs.cost, 0.0)
            && self.amounts_equal(obs.used, 0.0)
            && !self.amounts_equal(existing_used, 0.0)
    }
}

impl Default for Equivalence {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CANONICALIZATION
// ============================================================================

fn canonical_items(items: &[LineItem]) -> Vec<LineItem> {
    let mut sorted = items.to_vec();
    sorted.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.description.cmp(&b.description))
            .then_with(|| a.unit.cmp(&b.unit))
            .then_with(|| a.total.total_cmp(&b.total))
            .then_with(|| a.quantity.total_cmp(&b.quantity))
            .then_with(|| a.rate.total_cmp(&b.rate))
    });
    sorted
}

/// Order-independent attachment comparison on the (key, kind, format)
/// projection.
pub fn attachments_equal(a: &[AttachmentRef], b: &[AttachmentRef]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let key = |r: &AttachmentRef| (r.key.clone(), r.kind.clone(), r.format.clone());
    let mut a: Vec<_> = a.iter().map(key).collect();
    let mut b: Vec<_> = b.iter().map(key).collect();
    a.sort();
    b.sort();
    a == b
}

// ============================================================================
// DATE RANGES
// ============================================================================

/// Inclusive range intersection test.
pub fn ranges_overlap(
    a_start: NaiveDate,
    a_end: NaiveDate,
    b_start: NaiveDate,
    b_end: NaiveDate,
) -> bool {
    a_start <= b_end && b_start <= a_end
}

/// Exact range match.
pub fn ranges_equal(
    a_start: NaiveDate,
    a_end: NaiveDate,
    b_start: NaiveDate,
    b_end: NaiveDate,
) -> bool {
    a_start == b_start && a_end == b_end
}

// ============================================================================
// TESTS
// ============================================================================
