//! billsync demo
//!
//! Runs a scripted session against the in-memory gateway and logs what a
//! screen would observe: optimistic inserts, reconciliation, a rollback, a
//! superseded refresh, and a cached status lookup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use billsync::{
    BillStatus, EngineConfig, Frequency, GatewayError, GatewayOp, InMemoryGateway, PatternDraft,
    PatternEngine, PatternId, PatternPatch, RawPattern, SyncResult,
};

/// Demo configuration
struct Config {
    /// Optional JSON engine configuration
    config_path: Option<PathBuf>,
    /// Default log filter when RUST_LOG is unset
    log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: None,
            log_level: "info".to_string(),
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    eprintln!("error: --config requires a value");
                    std::process::exit(1);
                }
            }
            "--log-level" | "-l" => {
                if i + 1 < args.len() {
                    config.log_level.clone_from(&args[i + 1]);
                    i += 2;
                } else {
                    eprintln!("error: --log-level requires a value");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                println!("billsync-demo - scripted optimistic sync session");
                println!();
                println!("USAGE:");
                println!("    billsync-demo [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <FILE>       JSON engine configuration");
                println!("    -l, --log-level <LEVEL>   Log filter when RUST_LOG is unset [default: info]");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

fn load_engine_config(path: Option<&PathBuf>) -> EngineConfig {
    let Some(path) = path else {
        return EngineConfig::default();
    };
    let json = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("error: cannot read {}: {e}", path.display());
        std::process::exit(1);
    });
    EngineConfig::from_json(&json).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    })
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

fn seed() -> InMemoryGateway {
    let gateway = InMemoryGateway::with_records(vec![
        RawPattern::from_draft(
            "65f000000000000000000a01",
            PatternDraft::new("Rent", 1250.0, Frequency::Monthly, date(2025, 1, 31)),
        ),
        RawPattern::from_draft(
            "manual_42",
            PatternDraft::new("Water", 38.5, Frequency::Quarterly, date(2025, 3, 15)),
        ),
    ]);
    gateway.set_status("65f000000000000000000a01", BillStatus::Paid);
    gateway.set_delay(GatewayOp::Create, Duration::from_millis(150));
    gateway
}

fn log_collection(engine: &PatternEngine, label: &str) -> SyncResult<()> {
    let patterns = engine.get_all()?;
    info!(label, count = patterns.len(), "collection");
    for p in patterns {
        info!(id = %p.id, class = %p.id.class(), vendor = %p.vendor, amount = p.amount, "  pattern");
    }
    Ok(())
}

async fn run(engine: Arc<PatternEngine>, gateway: Arc<InMemoryGateway>) -> SyncResult<()> {
    let mut changes = engine.subscribe();
    let watcher = tokio::spawn(async move {
        while let Some(event) = changes.recv().await {
            info!(revision = event.revision, change = ?event.change, "store changed");
        }
    });

    engine.refresh().await?;
    log_collection(&engine, "after first refresh")?;

    let create = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .create(PatternDraft::new("Netflix", 15.99, Frequency::Monthly, date(2025, 3, 14)))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    log_collection(&engine, "create in flight")?;
    let netflix = create.await.map_err(|e| billsync::SyncError::internal(e.to_string()))??;
    info!(id = %netflix.id, "netflix confirmed");

    let recreated = engine
        .update(&PatternId::parse("manual_42"), PatternPatch::default().amount(40.0))
        .await?;
    info!(id = %recreated.id, "legacy pattern recreated under a canonical id");

    gateway.fail_next(GatewayOp::Update, GatewayError::rejected("amount must be below 10000"));
    match engine
        .update(&netflix.id, PatternPatch::default().amount(9999.0))
        .await
    {
        Ok(_) => warn!("update unexpectedly succeeded"),
        Err(err) => warn!(error = %err, "update rolled back"),
    }
    log_collection(&engine, "after rollback")?;

    gateway.ignore_cancellation(true);
    gateway.script_list(Duration::from_millis(500), Ok(Vec::new()));
    let stale = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.refresh().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fresh = engine.refresh().await?;
    let stale = stale.await.map_err(|e| billsync::SyncError::internal(e.to_string()))??;
    info!(?stale, ?fresh, "refresh race settled");

    let visible = engine.get_all()?;
    let statuses = engine.get_status(&visible).await?;
    let again = engine.get_status(&visible).await?;
    info!(
        entries = statuses.len(),
        cached = statuses == again,
        lookups = gateway.call_count(GatewayOp::BatchStatus),
        "status lookup"
    );
    for (id, due) in engine.get_due_dates(&visible).await? {
        info!(%id, %due, "display due date");
    }

    drop(engine);
    watcher.abort();
    Ok(())
}

#[tokio::main]
async fn main() {
    let config = parse_args();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();

    let engine_config = load_engine_config(config.config_path.as_ref());
    let gateway = Arc::new(seed());
    let engine = Arc::new(PatternEngine::with_config(gateway.clone(), engine_config));

    if let Err(err) = run(engine, gateway).await {
        error!(error = %err, "demo failed");
        std::process::exit(1);
    }
}
