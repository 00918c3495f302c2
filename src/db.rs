// 🗄️ Store - SQLite schema, persisted row types, CRUD, audit-event trail
//
// One local SQLite database in WAL mode holds the whole history. JSON columns
// carry nested data (line items, attachments, reading vectors, event
// payloads) so the schema never needs a migration when those shapes grow.
//
// Concurrency contract: callers guarantee single-writer-per-service. Two
// reconciliation runs for different services may run concurrently; two runs
// for the same service must not. The engine does not take its own locks.

use crate::observations::{AttachmentRef, LineItem, ProviderType};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

// ============================================================================
// PERSISTED ROW TYPES
// ============================================================================

/// A metered utility service. One external identifier may map to more than
/// one service row (ownership changes keep old rows around).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub identifier: String,
    pub utility: String,
    pub utility_account_id: String,
    pub audit_enrolled: bool,
    pub created: DateTime<Utc>,
}

impl Service {
    pub fn new(
        identifier: &str,
        utility: &str,
        utility_account_id: &str,
        audit_enrolled: bool,
    ) -> Self {
        Service {
            id: uuid::Uuid::new_v4().to_string(),
            identifier: identifier.to_string(),
            utility: utility.to_string(),
            utility_account_id: utility_account_id.to_string(),
            audit_enrolled,
            created: Utc::now(),
        }
    }
}

/// A consolidated bill. No supersession chain: rows are created, narrowly
/// updated, or deleted-and-recreated in the overlap case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bill {
    pub id: String,
    pub service_id: String,
    pub initial: NaiveDate,
    pub closing: NaiveDate,
    pub cost: f64,
    pub used: f64,
    pub peak: Option<f64>,
    pub items: Vec<LineItem>,
    pub attachments: Vec<AttachmentRef>,

    /// True once a human has edited the row; disables all automatic mutation
    pub manual: bool,

    /// False while an audit is pending; gates downstream consumption
    pub visible: bool,

    pub notes: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// A partial bill (delivery-only / generation-only / bundled slice).
///
/// Append-only: rows are never deleted, and after creation only
/// `superseded_by` and `modified` ever change. The live record for a range is
/// the one with `superseded_by IS NULL AND visible = 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialBill {
    pub id: String,
    pub service_id: String,
    pub provider_type: ProviderType,
    pub initial: NaiveDate,
    pub closing: NaiveDate,
    pub cost: f64,
    pub used: f64,
    pub peak: Option<f64>,
    pub items: Vec<LineItem>,
    pub attachments: Vec<AttachmentRef>,
    pub manual: bool,
    pub visible: bool,
    pub tariff_code: Option<String>,

    // Snapshotted from the owning service at creation time, so the record's
    // history survives a later utility reassignment on the service.
    pub utility: String,
    pub utility_account_id: String,
    pub service_identifier: String,

    pub superseded_by: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// One day of interval readings for a meter. `readings` has one slot per
/// interval (1440 / interval-minutes); `None` = never observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingDay {
    pub meter: String,
    pub occurred: NaiveDate,
    pub readings: Vec<Option<f64>>,

    /// Frozen rows are never mutated by the merger
    pub frozen: bool,

    pub modified: DateTime<Utc>,
}

// ============================================================================
// AUDIT-TRAIL EVENT
// ============================================================================

/// Every mutating decision the engine takes appends one of these.
/// Append-only; the engine writes events but never consumes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS services (
            id TEXT PRIMARY KEY,
            identifier TEXT NOT NULL,
            utility TEXT NOT NULL,
            utility_account_id TEXT NOT NULL,
            audit_enrolled INTEGER NOT NULL DEFAULT 0,
            created TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bills (
            id TEXT PRIMARY KEY,
            service_id TEXT NOT NULL,
            initial TEXT NOT NULL,
            closing TEXT NOT NULL,
            cost REAL NOT NULL,
            used REAL NOT NULL,
            peak REAL,
            items TEXT NOT NULL,
            attachments TEXT NOT NULL,
            manual INTEGER NOT NULL DEFAULT 0,
            visible INTEGER NOT NULL DEFAULT 1,
            notes TEXT NOT NULL DEFAULT '',
            created TEXT NOT NULL,
            modified TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS partial_bills (
            id TEXT PRIMARY KEY,
            service_id TEXT NOT NULL,
            provider_type TEXT NOT NULL,
            initial TEXT NOT NULL,
            closing TEXT NOT NULL,
            cost REAL NOT NULL,
            used REAL NOT NULL,
            peak REAL,
            items TEXT NOT NULL,
            attachments TEXT NOT NULL,
            manual INTEGER NOT NULL DEFAULT 0,
            visible INTEGER NOT NULL DEFAULT 1,
            tariff_code TEXT,
            utility TEXT NOT NULL,
            utility_account_id TEXT NOT NULL,
            service_identifier TEXT NOT NULL,
            superseded_by TEXT,
            created TEXT NOT NULL,
            modified TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reading_days (
            meter TEXT NOT NULL,
            occurred TEXT NOT NULL,
            readings TEXT NOT NULL,
            frozen INTEGER NOT NULL DEFAULT 0,
            modified TEXT NOT NULL,
            PRIMARY KEY (meter, occurred)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_records (
            id TEXT PRIMARY KEY,
            bill_id TEXT NOT NULL,
            service_id TEXT NOT NULL,
            state TEXT NOT NULL,
            created TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_services_identifier ON services(identifier)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bills_service ON bills(service_id, initial)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bills_closing ON bills(closing)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_partials_live
         ON partial_bills(service_id, provider_type, superseded_by, visible)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_bill ON audit_records(bill_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SERVICES
// ============================================================================

pub fn insert_service(conn: &Connection, service: &Service) -> Result<()> {
    conn.execute(
        "INSERT INTO services (id, identifier, utility, utility_account_id, audit_enrolled, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            service.id,
            service.identifier,
            service.utility,
            service.utility_account_id,
            service.audit_enrolled as i64,
            service.created.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_service(conn: &Connection, service_id: &str) -> Result<Option<Service>> {
    conn.query_row(
        "SELECT id, identifier, utility, utility_account_id, audit_enrolled, created
         FROM services WHERE id = ?1",
        params![service_id],
        map_service_row,
    )
    .optional()
    .context("failed to load service")
}

/// All service rows sharing an external identifier, oldest first.
pub fn find_services_by_identifier(conn: &Connection, identifier: &str) -> Result<Vec<Service>> {
    let mut stmt = conn.prepare(
        "SELECT id, identifier, utility, utility_account_id, audit_enrolled, created
         FROM services WHERE identifier = ?1 ORDER BY created",
    )?;

    let services = stmt
        .query_map(params![identifier], map_service_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(services)
}

fn map_service_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Service> {
    let created: String = row.get(5)?;
    Ok(Service {
        id: row.get(0)?,
        identifier: row.get(1)?,
        utility: row.get(2)?,
        utility_account_id: row.get(3)?,
        audit_enrolled: row.get::<_, i64>(4)? != 0,
        created: parse_timestamp(&created)?,
    })
}

// ============================================================================
// BILLS
// ============================================================================

pub fn insert_bill(conn: &Connection, bill: &Bill) -> Result<()> {
    conn.execute(
        "INSERT INTO bills (id, service_id, initial, closing, cost, used, peak,
                            items, attachments, manual, visible, notes, created, modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            bill.id,
            bill.service_id,
            bill.initial.to_string(),
            bill.closing.to_string(),
            bill.cost,
            bill.used,
            bill.peak,
            serde_json::to_string(&bill.items)?,
            serde_json::to_string(&bill.attachments)?,
            bill.manual as i64,
            bill.visible as i64,
            bill.notes,
            bill.created.to_rfc3339(),
            bill.modified.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Bills for one service, ordered by period start.
pub fn get_bills_for_service(conn: &Connection, service_id: &str) -> Result<Vec<Bill>> {
    let mut stmt = conn.prepare(
        "SELECT id, service_id, initial, closing, cost, used, peak,
                items, attachments, manual, visible, notes, created, modified
         FROM bills WHERE service_id = ?1 ORDER BY initial",
    )?;

    let bills = stmt
        .query_map(params![service_id], map_bill_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(bills)
}

/// Exactly the fields the in-place update case is allowed to touch.
/// Everything else on a Bill (identity, dates, flags, notes) is off limits
/// to the reconciler once the row exists.
#[derive(Debug, Clone, PartialEq)]
pub struct BillPatch {
    pub cost: f64,
    pub used: f64,
    pub peak: Option<f64>,
    pub items: Vec<LineItem>,
    pub attachments: Vec<AttachmentRef>,
}

pub fn update_bill(
    conn: &Connection,
    bill_id: &str,
    patch: &BillPatch,
    modified: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE bills
         SET cost = ?1, used = ?2, peak = ?3, items = ?4, attachments = ?5, modified = ?6
         WHERE id = ?7",
        params![
            patch.cost,
            patch.used,
            patch.peak,
            serde_json::to_string(&patch.items)?,
            serde_json::to_string(&patch.attachments)?,
            modified.to_rfc3339(),
            bill_id,
        ],
    )?;

    anyhow::ensure!(updated == 1, "bill {} not found for update", bill_id);
    Ok(())
}

pub fn update_bill_attachments(
    conn: &Connection,
    bill_id: &str,
    attachments: &[AttachmentRef],
    modified: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE bills SET attachments = ?1, modified = ?2 WHERE id = ?3",
        params![
            serde_json::to_string(attachments)?,
            modified.to_rfc3339(),
            bill_id
        ],
    )?;

    anyhow::ensure!(
        updated == 1,
        "bill {} not found for attachment update",
        bill_id
    );
    Ok(())
}

pub fn delete_bill(conn: &Connection, bill_id: &str) -> Result<()> {
    let deleted = conn.execute("DELETE FROM bills WHERE id = ?1", params![bill_id])?;
    anyhow::ensure!(deleted == 1, "bill {} not found for delete", bill_id);
    Ok(())
}

fn map_bill_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bill> {
    let initial: String = row.get(2)?;
    let closing: String = row.get(3)?;
    let items_json: String = row.get(7)?;
    let attachments_json: String = row.get(8)?;
    let created: String = row.get(12)?;
    let modified: String = row.get(13)?;

    Ok(Bill {
        id: row.get(0)?,
        service_id: row.get(1)?,
        initial: parse_date(&initial)?,
        closing: parse_date(&closing)?,
        cost: row.get(4)?,
        used: row.get(5)?,
        peak: row.get(6)?,
        items: parse_json(&items_json)?,
        attachments: parse_json(&attachments_json)?,
        manual: row.get::<_, i64>(9)? != 0,
        visible: row.get::<_, i64>(10)? != 0,
        notes: row.get(11)?,
        created: parse_timestamp(&created)?,
        modified: parse_timestamp(&modified)?,
    })
}

// ============================================================================
// PARTIAL BILLS
// ============================================================================

pub fn insert_partial_bill(conn: &Connection, partial: &PartialBill) -> Result<()> {
    conn.execute(
        "INSERT INTO partial_bills (id, service_id, provider_type, initial, closing,
                                    cost, used, peak, items, attachments, manual, visible,
                                    tariff_code, utility, utility_account_id, service_identifier,
                                    superseded_by, created, modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            partial.id,
            partial.service_id,
            partial.provider_type.as_str(),
            partial.initial.to_string(),
            partial.closing.to_string(),
            partial.cost,
            partial.used,
            partial.peak,
            serde_json::to_string(&partial.items)?,
            serde_json::to_string(&partial.attachments)?,
            partial.manual as i64,
            partial.visible as i64,
            partial.tariff_code,
            partial.utility,
            partial.utility_account_id,
            partial.service_identifier,
            partial.superseded_by,
            partial.created.to_rfc3339(),
            partial.modified.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Live partial bills for one (service, provider type): not superseded,
/// visible, ordered oldest first.
pub fn live_partial_bills(
    conn: &Connection,
    service_id: &str,
    provider_type: ProviderType,
) -> Result<Vec<PartialBill>> {
    let mut stmt = conn.prepare(
        "SELECT id, service_id, provider_type, initial, closing, cost, used, peak,
                items, attachments, manual, visible, tariff_code,
                utility, utility_account_id, service_identifier,
                superseded_by, created, modified
         FROM partial_bills
         WHERE service_id = ?1 AND provider_type = ?2
           AND superseded_by IS NULL AND visible = 1
         ORDER BY initial",
    )?;

    let partials = stmt
        .query_map(params![service_id, provider_type.as_str()], map_partial_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(partials)
}

/// Live partial bills for a service across all provider types (the stitched
/// test for consolidated bills does not care which slice a partial covers).
pub fn live_partial_bills_any_type(
    conn: &Connection,
    service_id: &str,
) -> Result<Vec<PartialBill>> {
    let mut stmt = conn.prepare(
        "SELECT id, service_id, provider_type, initial, closing, cost, used, peak,
                items, attachments, manual, visible, tariff_code,
                utility, utility_account_id, service_identifier,
                superseded_by, created, modified
         FROM partial_bills
         WHERE service_id = ?1 AND superseded_by IS NULL AND visible = 1
         ORDER BY initial",
    )?;

    let partials = stmt
        .query_map(params![service_id], map_partial_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(partials)
}

/// All partial-bill rows for a service/provider type, superseded included.
pub fn all_partial_bills(
    conn: &Connection,
    service_id: &str,
    provider_type: ProviderType,
) -> Result<Vec<PartialBill>> {
    let mut stmt = conn.prepare(
        "SELECT id, service_id, provider_type, initial, closing, cost, used, peak,
                items, attachments, manual, visible, tariff_code,
                utility, utility_account_id, service_identifier,
                superseded_by, created, modified
         FROM partial_bills
         WHERE service_id = ?1 AND provider_type = ?2
         ORDER BY created",
    )?;

    let partials = stmt
        .query_map(params![service_id, provider_type.as_str()], map_partial_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(partials)
}

/// Point an existing partial bill at its replacement. The only mutation a
/// partial-bill row ever sees after creation.
pub fn mark_superseded(
    conn: &Connection,
    partial_id: &str,
    superseded_by: &str,
    modified: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE partial_bills SET superseded_by = ?1, modified = ?2
         WHERE id = ?3 AND superseded_by IS NULL",
        params![superseded_by, modified.to_rfc3339(), partial_id],
    )?;

    anyhow::ensure!(
        updated == 1,
        "partial bill {} not found or already superseded",
        partial_id
    );
    Ok(())
}

fn map_partial_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PartialBill> {
    let provider_type: String = row.get(2)?;
    let initial: String = row.get(3)?;
    let closing: String = row.get(4)?;
    let items_json: String = row.get(8)?;
    let attachments_json: String = row.get(9)?;
    let created: String = row.get(17)?;
    let modified: String = row.get(18)?;

    Ok(PartialBill {
        id: row.get(0)?,
        service_id: row.get(1)?,
        provider_type: ProviderType::parse(&provider_type)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        initial: parse_date(&initial)?,
        closing: parse_date(&closing)?,
        cost: row.get(5)?,
        used: row.get(6)?,
        peak: row.get(7)?,
        items: parse_json(&items_json)?,
        attachments: parse_json(&attachments_json)?,
        manual: row.get::<_, i64>(10)? != 0,
        visible: row.get::<_, i64>(11)? != 0,
        tariff_code: row.get(12)?,
        utility: row.get(13)?,
        utility_account_id: row.get(14)?,
        service_identifier: row.get(15)?,
        superseded_by: row.get(16)?,
        created: parse_timestamp(&created)?,
        modified: parse_timestamp(&modified)?,
    })
}

// ============================================================================
// READING DAYS
// ============================================================================

pub fn get_reading_day(
    conn: &Connection,
    meter: &str,
    occurred: NaiveDate,
) -> Result<Option<ReadingDay>> {
    conn.query_row(
        "SELECT meter, occurred, readings, frozen, modified
         FROM reading_days WHERE meter = ?1 AND occurred = ?2",
        params![meter, occurred.to_string()],
        map_reading_row,
    )
    .optional()
    .context("failed to load reading day")
}

pub fn insert_reading_day(conn: &Connection, day: &ReadingDay) -> Result<()> {
    conn.execute(
        "INSERT INTO reading_days (meter, occurred, readings, frozen, modified)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            day.meter,
            day.occurred.to_string(),
            serde_json::to_string(&day.readings)?,
            day.frozen as i64,
            day.modified.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn update_reading_day(
    conn: &Connection,
    meter: &str,
    occurred: NaiveDate,
    readings: &[Option<f64>],
    modified: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE reading_days SET readings = ?1, modified = ?2
         WHERE meter = ?3 AND occurred = ?4 AND frozen = 0",
        params![
            serde_json::to_string(readings)?,
            modified.to_rfc3339(),
            meter,
            occurred.to_string(),
        ],
    )?;

    anyhow::ensure!(
        updated == 1,
        "reading day {}/{} not found or frozen",
        meter,
        occurred
    );
    Ok(())
}

fn map_reading_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReadingDay> {
    let occurred: String = row.get(1)?;
    let readings_json: String = row.get(2)?;
    let modified: String = row.get(4)?;

    Ok(ReadingDay {
        meter: row.get(0)?,
        occurred: parse_date(&occurred)?,
        readings: parse_json(&readings_json)?,
        frozen: row.get::<_, i64>(3)? != 0,
        modified: parse_timestamp(&modified)?,
    })
}

// ============================================================================
// EVENTS
// ============================================================================

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        "INSERT INTO events (event_id, timestamp, event_type, entity_type, entity_id, data, actor)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            serde_json::to_string(&event.data)?,
            event.actor,
        ],
    )?;
    Ok(())
}

pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(&timestamp)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: parse_json(&data_json)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// COLUMN PARSING HELPERS
// ============================================================================

fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| rusqlite::Error::InvalidQuery)
}

fn parse_timestamp(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|_| rusqlite::Error::InvalidQuery)
}

// ============================================================================
// TESTS
// ============================================================================
