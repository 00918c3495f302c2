// 📋 Audit Workflow - Narrow interface to the bill-audit product
//
// The engine only ever creates a pending record when a new bill lands for an
// enrolled service, and removes records whose bill was deleted in an
// overlap replace. Advancing audit state is the external workflow's job.

use crate::db::{insert_event, Bill, Event, Service};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

pub const AUDIT_STATE_PENDING: &str = "pending";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub bill_id: String,
    pub service_id: String,
    pub state: String,
    pub created: DateTime<Utc>,
}

/// Initialize a pending audit record for a freshly created bill and append
/// the initialization event. The caller is responsible for having created
/// the bill with `visible = false`.
pub fn initialize_audit(conn: &Connection, bill: &Bill, service: &Service) -> Result<AuditRecord> {
    let record = AuditRecord {
        id: uuid::Uuid::new_v4().to_string(),
        bill_id: bill.id.clone(),
        service_id: service.id.clone(),
        state: AUDIT_STATE_PENDING.to_string(),
        created: Utc::now(),
    };

    conn.execute(
        "INSERT INTO audit_records (id, bill_id, service_id, state, created)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.id,
            record.bill_id,
            record.service_id,
            record.state,
            record.created.to_rfc3339(),
        ],
    )?;

    insert_event(
        conn,
        &Event::new(
            "audit_initialized",
            "bill",
            &bill.id,
            serde_json::json!({
                "audit_id": record.id,
                "service_id": service.id,
                "state": AUDIT_STATE_PENDING,
            }),
            "bill_reconciler",
        ),
    )?;

    Ok(record)
}

/// Remove any audit record tied to a bill being deleted. Returns the number
/// of records removed (0 when the bill was never enrolled).
pub fn remove_audit_for_bill(conn: &Connection, bill_id: &str) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM audit_records WHERE bill_id = ?1",
        params![bill_id],
    )?;

    if removed > 0 {
        insert_event(
            conn,
            &Event::new(
                "audit_removed",
                "bill",
                bill_id,
                serde_json::json!({ "removed": removed }),
                "bill_reconciler",
            ),
        )?;
    }

    Ok(removed)
}

pub fn get_audit_for_bill(conn: &Connection, bill_id: &str) -> Result<Option<AuditRecord>> {
    conn.query_row(
        "SELECT id, bill_id, service_id, state, created
         FROM audit_records WHERE bill_id = ?1",
        params![bill_id],
        |row| {
            let created: String = row.get(4)?;
            Ok(AuditRecord {
                id: row.get(0)?,
                bill_id: row.get(1)?,
                service_id: row.get(2)?,
                state: row.get(3)?,
                created: DateTime::parse_from_rfc3339(&created)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
            })
        },
    )
    .optional()
    .context("failed to load audit record")
}

// ============================================================================
// TESTS
// ============================================================================
