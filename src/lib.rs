// Bill Ledger - Core Library
// Reconciles collector-produced billing periods, statement documents, and
// interval readings into a durable, auditable SQLite history.

pub mod attachments;
pub mod audit;
pub mod bills;
pub mod db;
pub mod equivalence;
pub mod observations;
pub mod partial_bills;
pub mod readings;
pub mod status;
pub mod validation;

// Re-export commonly used types
pub use attachments::{AttachmentMatcher, AttachmentRunReport};
pub use audit::{get_audit_for_bill, initialize_audit, remove_audit_for_bill, AuditRecord};
pub use bills::{BillReconciler, BillRunReport};
pub use db::{
    find_services_by_identifier, get_bills_for_service, get_events_for_entity, get_service,
    insert_event, insert_service, live_partial_bills, setup_database, Bill, BillPatch, Event,
    PartialBill, ReadingDay, Service,
};
pub use equivalence::{attachments_equal, ranges_equal, ranges_overlap, Equivalence};
pub use observations::{
    load_observation_batch, load_reading_days, load_statement_documents, parse_calendar_date,
    AttachmentRef, BillingPeriodObservation, LineItem, ProviderType, StatementDocument,
};
pub use partial_bills::{PartialBillReconciler, PartialRunReport};
pub use readings::{ReadingMerger, ReadingRunReport};
pub use status::{DateRangeSink, NullRangeSink, RecordingRangeSink, RunStatus};
pub use validation::{validate_batch, BatchViolation};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
