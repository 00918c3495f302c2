// Job runner CLI - drives the reconciliation library from batch files.
//
// The collection layer drops JSON/CSV batches on disk; the scheduler invokes
// one subcommand per collector job. Single-writer-per-service is the
// scheduler's responsibility, not enforced here.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use std::env;
use std::path::Path;

use bill_ledger::{
    load_observation_batch, load_reading_days, load_statement_documents, setup_database,
    AttachmentMatcher, BillReconciler, PartialBillReconciler, ProviderType, ReadingMerger,
    RecordingRangeSink, Service,
};

fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    match command {
        "init" => run_init(&args[2..]),
        "service" => run_service(&args[2..]),
        "bills" => run_bills(&args[2..]),
        "partials" => run_partials(&args[2..]),
        "readings" => run_readings(&args[2..]),
        "attach" => run_attach(&args[2..]),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bill_ledger=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_usage() {
    println!("bill-ledger {}", bill_ledger::VERSION);
    println!();
    println!("Usage:");
    println!("  bill-ledger init <db>");
    println!("  bill-ledger service <db> <identifier> <utility> <account-id> [--audit]");
    println!("  bill-ledger bills <db> <identifier> <batch.json>");
    println!("  bill-ledger partials <db> <service-id> <provider-type> <batch.json>");
    println!("  bill-ledger readings <db> <meter> <interval-minutes> <readings.csv>");
    println!("  bill-ledger attach <db> <documents.json>");
}

fn open(db: &str) -> Result<Connection> {
    let conn = Connection::open(Path::new(db))
        .with_context(|| format!("failed to open database {}", db))?;
    setup_database(&conn)?;
    Ok(conn)
}

fn run_init(args: &[String]) -> Result<()> {
    let [db] = args else {
        bail!("usage: bill-ledger init <db>");
    };

    open(db)?;
    println!("✓ Database initialized at {}", db);
    Ok(())
}

fn run_service(args: &[String]) -> Result<()> {
    if args.len() < 4 {
        bail!("usage: bill-ledger service <db> <identifier> <utility> <account-id> [--audit]");
    }

    let conn = open(&args[0])?;
    let audit_enrolled = args.get(4).map(String::as_str) == Some("--audit");

    let service = Service::new(&args[1], &args[2], &args[3], audit_enrolled);
    bill_ledger::insert_service(&conn, &service)?;

    println!("✓ Registered service {} ({})", service.identifier, service.id);
    if audit_enrolled {
        println!("✓ Enrolled in the audit workflow");
    }
    Ok(())
}

fn run_bills(args: &[String]) -> Result<()> {
    let [db, identifier, batch_path] = args else {
        bail!("usage: bill-ledger bills <db> <identifier> <batch.json>");
    };

    let mut conn = open(db)?;
    let observations = load_observation_batch(Path::new(batch_path))?;
    println!("Loaded {} observations from {}", observations.len(), batch_path);

    let mut sink = RecordingRangeSink::default();
    let reconciler = BillReconciler::new();
    let report = reconciler.reconcile(
        &mut conn,
        identifier,
        &observations,
        Utc::now().date_naive(),
        &mut sink,
    )?;

    println!("{}", report.summary());
    for (identifier, first, last) in &sink.ranges {
        println!("✓ Observed range for {}: {} - {}", identifier, first, last);
    }
    Ok(())
}

fn run_partials(args: &[String]) -> Result<()> {
    let [db, service_id, provider, batch_path] = args else {
        bail!("usage: bill-ledger partials <db> <service-id> <provider-type> <batch.json>");
    };

    let mut conn = open(db)?;
    let provider_type = ProviderType::parse(provider)?;
    if !provider_type.is_partial() {
        bail!("provider type {} is not a partial kind; use the bills subcommand", provider);
    }

    let Some(service) = bill_ledger::get_service(&conn, service_id)? else {
        bail!("no service with id {}", service_id);
    };

    let observations = load_observation_batch(Path::new(batch_path))?;
    println!("Loaded {} observations from {}", observations.len(), batch_path);

    let mut sink = RecordingRangeSink::default();
    let reconciler = PartialBillReconciler::new();
    let report = reconciler.reconcile(
        &mut conn,
        &service,
        provider_type,
        &observations,
        Utc::now().date_naive(),
        &mut sink,
    )?;

    println!("{}", report.summary());
    for (identifier, first, last) in &sink.ranges {
        println!("✓ Observed range for {}: {} - {}", identifier, first, last);
    }
    Ok(())
}

fn run_readings(args: &[String]) -> Result<()> {
    let [db, meter, interval, csv_path] = args else {
        bail!("usage: bill-ledger readings <db> <meter> <interval-minutes> <readings.csv>");
    };

    let mut conn = open(db)?;
    let interval_minutes: u32 = interval
        .parse()
        .with_context(|| format!("bad interval minutes: {}", interval))?;

    let days = load_reading_days(Path::new(csv_path), interval_minutes)?;
    println!("Loaded {} reading days from {}", days.len(), csv_path);

    let mut sink = RecordingRangeSink::default();
    let merger = ReadingMerger::new();
    let report = merger.merge(&mut conn, meter, interval_minutes, &days, &mut sink)?;

    println!("{}", report.summary());
    Ok(())
}

fn run_attach(args: &[String]) -> Result<()> {
    let [db, docs_path] = args else {
        bail!("usage: bill-ledger attach <db> <documents.json>");
    };

    let mut conn = open(db)?;
    let documents = load_statement_documents(Path::new(docs_path))?;
    println!("Loaded {} documents from {}", documents.len(), docs_path);

    let matcher = AttachmentMatcher::new();
    let report = matcher.attach(&mut conn, &documents)?;

    println!("{}", report.summary());
    for key in &report.unused {
        println!("  unused: {}", key);
    }
    Ok(())
}
