// 📎 Attachment Matcher - Associate statement documents with stored bills
//
// Documents arrive independently of bill scraping. A document matches a bill
// when the bill's owning service has the same utility account and the bill
// closes within a 14-day window ending at the document's statement date.
// Multiple documents on one bill stack most-recent-first; re-submitting a
// document already attached is a no-op. Documents matching nothing are
// reported unused so the upstream blob store can reclaim them; documents
// whose only candidates are manual are reported skipped instead, so the
// store does not discard a statement that did match.

use crate::db::{insert_event, update_bill_attachments, Bill, Event};
use crate::observations::{AttachmentRef, StatementDocument};
use crate::status::RunStatus;
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

pub const ATTACHMENT_KIND_STATEMENT: &str = "statement";

// ============================================================================
// RUN REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRunReport {
    pub status: RunStatus,

    /// Documents newly attached to at least one bill
    pub attached: usize,

    /// Documents already present on every candidate (idempotent no-op)
    pub already_attached: usize,

    /// Documents whose only candidates were manual bills
    pub skipped_manual: usize,

    /// Storage keys of documents matching no candidate, eligible for
    /// upstream removal
    pub unused: Vec<String>,
}

impl AttachmentRunReport {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} attached, {} already attached, {} skipped (manual), {} unused",
            self.status,
            self.attached,
            self.already_attached,
            self.skipped_manual,
            self.unused.len()
        )
    }
}

// ============================================================================
// ATTACHMENT MATCHER
// ============================================================================

pub struct AttachmentMatcher {
    /// Lookback window from the statement date (default: 14 days)
    pub window_days: i64,
}

impl AttachmentMatcher {
    pub fn new() -> Self {
        AttachmentMatcher { window_days: 14 }
    }

    pub fn with_window(window_days: i64) -> Self {
        AttachmentMatcher { window_days }
    }

    /// Match a batch of documents against stored bills. All attachment
    /// mutations commit in one transaction.
    pub fn attach(
        &self,
        conn: &mut Connection,
        documents: &[StatementDocument],
    ) -> Result<AttachmentRunReport> {
        let tx = conn.transaction()?;

        let mut attached = 0usize;
        let mut already_attached = 0usize;
        let mut skipped_manual = 0usize;
        let mut unused = Vec::new();

        for doc in documents {
            let candidates = self.find_candidates(&tx, doc)?;

            if candidates.is_empty() {
                tracing::debug!("document {} matched no bill", doc.key);
                unused.push(doc.key.clone());
                continue;
            }

            let workable: Vec<&Bill> = candidates.iter().filter(|b| !b.manual).collect();
            if workable.is_empty() {
                tracing::info!("document {} only matched manual bills, skipping", doc.key);
                skipped_manual += 1;
                continue;
            }

            let mut any_new = false;
            for bill in workable {
                if self.attach_to_bill(&tx, doc, bill)? {
                    any_new = true;
                }
            }

            if any_new {
                attached += 1;
            } else {
                already_attached += 1;
            }
        }

        tx.commit().context("failed to commit attachment run")?;

        let status = if attached > 0 {
            RunStatus::Succeeded
        } else {
            RunStatus::Completed
        };

        Ok(AttachmentRunReport {
            status,
            attached,
            already_attached,
            skipped_manual,
            unused,
        })
    }

    /// Bills whose service shares the document's utility account and whose
    /// closing date falls inside the lookback window.
    fn find_candidates(&self, conn: &Connection, doc: &StatementDocument) -> Result<Vec<Bill>> {
        let window_start = doc.statement_date - Duration::days(self.window_days);

        let mut stmt = conn.prepare(
            "SELECT b.id, b.service_id, b.initial, b.closing, b.cost, b.used, b.peak,
                    b.items, b.attachments, b.manual, b.visible, b.notes, b.created, b.modified
             FROM bills b
             JOIN services s ON s.id = b.service_id
             WHERE s.utility_account_id = ?1
               AND b.closing >= ?2 AND b.closing <= ?3
             ORDER BY b.closing DESC",
        )?;

        let bills = stmt
            .query_map(
                params![
                    doc.account_id,
                    window_start.to_string(),
                    doc.statement_date.to_string()
                ],
                |row| {
                    let initial: String = row.get(2)?;
                    let closing: String = row.get(3)?;
                    let items_json: String = row.get(7)?;
                    let attachments_json: String = row.get(8)?;
                    let created: String = row.get(12)?;
                    let modified: String = row.get(13)?;

                    Ok(Bill {
                        id: row.get(0)?,
                        service_id: row.get(1)?,
                        initial: chrono::NaiveDate::parse_from_str(&initial, "%Y-%m-%d")
                            .map_err(|_| rusqlite::Error::InvalidQuery)?,
                        closing: chrono::NaiveDate::parse_from_str(&closing, "%Y-%m-%d")
                            .map_err(|_| rusqlite::Error::InvalidQuery)?,
                        cost: row.get(4)?,
                        used: row.get(5)?,
                        peak: row.get(6)?,
                        items: serde_json::from_str(&items_json)
                            .map_err(|_| rusqlite::Error::InvalidQuery)?,
                        attachments: serde_json::from_str(&attachments_json)
                            .map_err(|_| rusqlite::Error::InvalidQuery)?,
                        manual: row.get::<_, i64>(9)? != 0,
                        visible: row.get::<_, i64>(10)? != 0,
                        notes: row.get(11)?,
                        created: chrono::DateTime::parse_from_rfc3339(&created)
                            .map_err(|_| rusqlite::Error::InvalidQuery)?
                            .with_timezone(&Utc),
                        modified: chrono::DateTime::parse_from_rfc3339(&modified)
                            .map_err(|_| rusqlite::Error::InvalidQuery)?
                            .with_timezone(&Utc),
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(bills)
    }

    /// Returns true when the document was newly prepended to the bill.
    fn attach_to_bill(&self, conn: &Connection, doc: &StatementDocument, bill: &Bill) -> Result<bool> {
        let same_format: Option<&AttachmentRef> =
            bill.attachments.iter().find(|a| a.format == doc.format);

        if let Some(existing) = same_format {
            if existing.key == doc.key {
                // Idempotent: this exact document is already on the bill
                return Ok(false);
            }
        }

        // Prepend most-recent-first; prior statements stay attached
        let mut attachments = bill.attachments.clone();
        attachments.insert(
            0,
            AttachmentRef {
                key: doc.key.clone(),
                kind: ATTACHMENT_KIND_STATEMENT.to_string(),
                format: doc.format.clone(),
            },
        );

        update_bill_attachments(conn, &bill.id, &attachments, Utc::now())?;
        insert_event(
            conn,
            &Event::new(
                "attachment_added",
                "bill",
                &bill.id,
                serde_json::json!({
                    "key": doc.key,
                    "format": doc.format,
                    "statement_date": doc.statement_date,
                }),
                "attachment_matcher",
            ),
        )?;
        tracing::info!("attached document {} to bill {}", doc.key, bill.id);

        Ok(true)
    }
}

impl Default for AttachmentMatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
