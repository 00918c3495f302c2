// 🔁 Partial-Bill Reconciler - Supersession-based merge of partial periods
//
// Partial bills are append-only: a correction or an overlapping re-scrape
// never mutates the stored row. Instead a replacement row is inserted and the
// displaced rows get their `superseded_by` pointer set, preserving the full
// audit history. The live view is always `superseded_by IS NULL AND visible`.
//
// The overlap scan runs across every partial kind of the service, so a
// generation-only period that overlaps stored delivery-only periods displaces
// them too; exact-duplicate detection stays within the observation's own
// provider type. All mutations for one run commit in a single transaction.

use crate::db::{
    insert_event, insert_partial_bill, live_partial_bills_any_type, mark_superseded, Event,
    PartialBill, Service,
};
use crate::equivalence::{ranges_equal, ranges_overlap, Equivalence};
use crate::observations::{BillingPeriodObservation, ProviderType};
use crate::status::{DateRangeSink, RunStatus};
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

// ============================================================================
// RUN REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialRunReport {
    pub status: RunStatus,

    /// New rows inserted (brand-new periods plus replacements)
    pub staged: usize,

    /// Existing rows pointed at a replacement
    pub superseded: usize,

    /// Observations that matched stored state exactly
    pub unchanged: usize,

    /// Observations dropped by classification (bad overrides,
    /// manual-protected ranges)
    pub discarded: usize,

    /// Populated when status is Failed
    pub failure: Option<String>,
}

impl PartialRunReport {
    fn failed(reason: String) -> Self {
        PartialRunReport {
            status: RunStatus::Failed,
            staged: 0,
            superseded: 0,
            unchanged: 0,
            discarded: 0,
            failure: Some(reason),
        }
    }

    pub fn summary(&self) -> String {
        match &self.failure {
            Some(reason) => format!("{}: {}", self.status, reason),
            None => format!(
                "{}: {} staged, {} superseded, {} unchanged, {} discarded",
                self.status, self.staged, self.superseded, self.unchanged, self.discarded
            ),
        }
    }
}

// ============================================================================
// PARTIAL-BILL RECONCILER
// ============================================================================

pub struct PartialBillReconciler {
    pub equivalence: Equivalence,
}

impl PartialBillReconciler {
    pub fn new() -> Self {
        PartialBillReconciler {
            equivalence: Equivalence::new(),
        }
    }

    pub fn with_tolerance(tolerance: f64) -> Self {
        PartialBillReconciler {
            equivalence: Equivalence::with_tolerance(tolerance),
        }
    }

    /// Merge one validated collector batch into the service's partial-bill
    /// history. Single-writer-per-service: the caller's scheduler must not
    /// run two reconciliations for the same service concurrently.
    pub fn reconcile(
        &self,
        conn: &mut Connection,
        service: &Service,
        provider_type: ProviderType,
        observations: &[BillingPeriodObservation],
        today: NaiveDate,
        sink: &mut dyn DateRangeSink,
    ) -> Result<PartialRunReport> {
        let violations = crate::validation::validate_batch(observations, today);
        if let Some(first) = violations.first() {
            tracing::warn!(
                "partial batch for service {} rejected: {}",
                service.id,
                first
            );
            return Ok(PartialRunReport::failed(first.message()));
        }

        let mut live = live_partial_bills_any_type(conn, &service.id)
            .context("failed to load live partial bills")?;

        // Start-date snap: a batch whose first period starts on the closing
        // date of a stored partial is a clean boundary, not an overlap.
        let mut batch = observations.to_vec();
        if let Some(first) = batch.first_mut() {
            if live.iter().any(|p| p.closing == first.start) {
                first.start += Duration::days(1);
                if first.start > first.end {
                    let reason = format!(
                        "degenerate period after boundary snap: start {} is past end {}",
                        first.start, first.end
                    );
                    tracing::warn!("partial batch for service {}: {}", service.id, reason);
                    return Ok(PartialRunReport::failed(reason));
                }
            }
        }

        let tx = conn.transaction()?;

        let mut staged = 0usize;
        let mut superseded = 0usize;
        let mut unchanged = 0usize;
        let mut discarded = 0usize;

        // One replacement row per distinct value tuple per run: two stored
        // rows displaced by the same observation share a replacement.
        let mut replacements: HashMap<String, String> = HashMap::new();

        for obs in &batch {
            // Exact-duplicate detection only against the same partial kind
            let exact = live.iter().position(|p| {
                p.provider_type == provider_type
                    && ranges_equal(obs.start, obs.end, p.initial, p.closing)
            });

            let displaced: Vec<usize> = match exact {
                Some(idx) => {
                    let existing = &live[idx];

                    if self.equivalence.observation_matches_partial(obs, existing) {
                        tracing::debug!(
                            "partial {} - {} unchanged for service {}",
                            obs.start,
                            obs.end,
                            service.id
                        );
                        unchanged += 1;
                        continue;
                    }
                    if self.equivalence.is_bad_override(obs, existing.used) {
                        tracing::info!(
                            "discarding zero-usage override for {} - {} (stored used {})",
                            obs.start,
                            obs.end,
                            existing.used
                        );
                        discarded += 1;
                        continue;
                    }
                    if existing.manual {
                        tracing::info!(
                            "skipping manual partial {} for {} - {}",
                            existing.id,
                            obs.start,
                            obs.end
                        );
                        discarded += 1;
                        continue;
                    }

                    vec![idx]
                }
                None => {
                    let overlapped: Vec<usize> = live
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| ranges_overlap(obs.start, obs.end, p.initial, p.closing))
                        .map(|(i, _)| i)
                        .collect();

                    if overlapped.is_empty() {
                        // Brand-new period
                        let partial = build_partial(obs, service, provider_type);
                        insert_partial_bill(&tx, &partial)?;
                        insert_event(
                            &tx,
                            &Event::new(
                                "partial_added",
                                "partial_bill",
                                &partial.id,
                                serde_json::json!({
                                    "initial": partial.initial,
                                    "closing": partial.closing,
                                    "cost": partial.cost,
                                    "provider_type": partial.provider_type.as_str(),
                                }),
                                "partial_reconciler",
                            ),
                        )?;
                        staged += 1;
                        live.push(partial);
                        live.sort_by_key(|p| p.initial);
                        continue;
                    }

                    // Superseding around an untouched manual row would put
                    // the replacement in overlap with it; drop the whole
                    // observation instead.
                    if overlapped.iter().any(|&i| live[i].manual) {
                        tracing::info!(
                            "discarding {} - {}: overlaps a manual partial",
                            obs.start,
                            obs.end
                        );
                        discarded += 1;
                        continue;
                    }

                    overlapped
                }
            };

            // Capture ids before the replacement insert reorders `live`
            let displaced_ids: Vec<String> =
                displaced.iter().map(|&i| live[i].id.clone()).collect();

            // Insert (or reuse) the replacement, then point every displaced
            // row at it.
            let key = replacement_key(obs);
            let replacement_id = match replacements.get(&key) {
                Some(id) => id.clone(),
                None => {
                    let partial = build_partial(obs, service, provider_type);
                    insert_partial_bill(&tx, &partial)?;
                    insert_event(
                        &tx,
                        &Event::new(
                            "partial_added",
                            "partial_bill",
                            &partial.id,
                            serde_json::json!({
                                "initial": partial.initial,
                                "closing": partial.closing,
                                "cost": partial.cost,
                                "provider_type": partial.provider_type.as_str(),
                            }),
                            "partial_reconciler",
                        ),
                    )?;
                    staged += 1;
                    let id = partial.id.clone();
                    live.push(partial);
                    live.sort_by_key(|p| p.initial);
                    replacements.insert(key, id.clone());
                    id
                }
            };

            for old_id in &displaced_ids {
                mark_superseded(&tx, old_id, &replacement_id, Utc::now())?;
                insert_event(
                    &tx,
                    &Event::new(
                        "partial_superseded",
                        "partial_bill",
                        old_id,
                        serde_json::json!({ "superseded_by": replacement_id }),
                        "partial_reconciler",
                    ),
                )?;
                tracing::info!("partial {} superseded by {}", old_id, replacement_id);
                superseded += 1;
            }
            live.retain(|p| !displaced_ids.contains(&p.id));
        }

        tx.commit().context("failed to commit partial-bill run")?;

        let status = if staged > 0 {
            RunStatus::Succeeded
        } else {
            RunStatus::Completed
        };

        if let (Some(first), Some(last)) = (
            batch.iter().map(|o| o.start).min(),
            batch.iter().map(|o| o.end).max(),
        ) {
            sink.record_range(&service.identifier, first, last);
        }

        Ok(PartialRunReport {
            status,
            staged,
            superseded,
            unchanged,
            discarded,
            failure: None,
        })
    }
}

impl Default for PartialBillReconciler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn build_partial(
    obs: &BillingPeriodObservation,
    service: &Service,
    provider_type: ProviderType,
) -> PartialBill {
    let now = Utc::now();
    PartialBill {
        id: uuid::Uuid::new_v4().to_string(),
        service_id: service.id.clone(),
        provider_type,
        initial: obs.start,
        closing: obs.end,
        cost: obs.cost,
        used: obs.used,
        peak: obs.peak,
        items: obs.line_items.clone(),
        attachments: obs.attachment_refs.clone(),
        manual: false,
        visible: true,
        tariff_code: obs.tariff_code.clone(),
        // Snapshot the service's current assignment
        utility: service.utility.clone(),
        utility_account_id: service.utility_account_id.clone(),
        service_identifier: service.identifier.clone(),
        superseded_by: None,
        created: now,
        modified: now,
    }
}

/// Dedup key for replacement rows within one run.
fn replacement_key(obs: &BillingPeriodObservation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{:.4}|{:.4}|{:?}|{}|{}",
        obs.cost, obs.used, obs.peak, obs.start, obs.end
    ));
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================
