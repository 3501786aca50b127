//! tally: folds duplicate generation results into their earliest record.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tally::consolidate::{ConsolidateOptions, ConsolidateRequest, Consolidator, DEFAULT_MIN_GROUP_SIZE};
use tally::error::TallyError;
use tally::schedule::{self, Schedule};
use tally::store::{BatchRange, RestStore, SharedStore, SqliteStore, DEFAULT_BATCH_LIMIT};
use tally::{api, AppState};

#[derive(Parser)]
#[command(name = "tally", version, about = "Consolidates duplicate generation results")]
struct Args {
    /// Port for the admin API
    #[arg(short, long, default_value = "3918", env = "TALLY_PORT")]
    port: u16,

    /// SQLite database path (used when no REST store is configured)
    #[arg(short, long, default_value = "tally.db", env = "TALLY_DB")]
    db: String,

    /// PostgREST root URL; selects the REST store when set
    #[arg(long, env = "TALLY_REST_URL")]
    rest_url: Option<String>,

    #[arg(long, env = "TALLY_REST_KEY", hide_env_values = true)]
    rest_key: Option<String>,

    #[arg(long, default_value = "results", env = "TALLY_REST_TABLE")]
    table: String,

    /// Provider whose results get consolidated
    #[arg(long, default_value = "chatgpt", env = "TALLY_PROVIDER")]
    provider: String,

    #[arg(long, default_value_t = 0, env = "TALLY_OFFSET")]
    offset: usize,

    /// Candidate rows scanned per run
    #[arg(long, default_value_t = DEFAULT_BATCH_LIMIT, env = "TALLY_LIMIT")]
    limit: usize,

    /// Minutes between scheduled runs, 0 disables the interval
    #[arg(long, default_value_t = 30, env = "TALLY_CONSOLIDATE_MINS")]
    every_mins: u64,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "TALLY_RUN_ON_START")]
    run_on_start: bool,

    #[arg(long, default_value_t = 5, env = "TALLY_STARTUP_DELAY_SECS")]
    startup_delay_secs: u64,

    #[arg(long, default_value_t = 15, env = "TALLY_OP_TIMEOUT_SECS")]
    op_timeout_secs: u64,

    #[arg(long, default_value_t = 600, env = "TALLY_RUN_DEADLINE_SECS")]
    run_deadline_secs: u64,

    /// Duplicate groups merged concurrently
    #[arg(long, default_value_t = 1, env = "TALLY_CONCURRENCY")]
    concurrency: usize,

    /// Smallest duplicate group that gets merged
    #[arg(long, default_value_t = DEFAULT_MIN_GROUP_SIZE, env = "TALLY_MIN_GROUP_SIZE")]
    min_group_size: usize,

    /// Bearer token required by /consolidate and /runs/last
    #[arg(long, env = "TALLY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Run a single consolidation, print the outcome as JSON, and exit
    #[arg(long)]
    once: bool,

    /// Plan merges without writing anything
    #[arg(long)]
    dry_run: bool,
}

fn open_store(args: &Args) -> Result<SharedStore, TallyError> {
    match (&args.rest_url, &args.rest_key) {
        (Some(url), Some(key)) => {
            let store = RestStore::new(url.as_str(), key)?.with_table(args.table.as_str());
            info!(url = %url, table = %args.table, "using REST store");
            Ok(Arc::new(store))
        }
        (Some(_), None) => Err(TallyError::Validation("TALLY_REST_KEY is required with TALLY_REST_URL".into())),
        _ => {
            let store = SqliteStore::open(&args.db)?;
            info!(db = %args.db, "using SQLite store");
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let store = match open_store(&args) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open store");
            std::process::exit(1);
        }
    };

    let opts = ConsolidateOptions {
        min_group_size: args.min_group_size,
        op_timeout: Duration::from_secs(args.op_timeout_secs),
        run_deadline: Duration::from_secs(args.run_deadline_secs),
        concurrency: args.concurrency,
        dry_run: args.dry_run,
    };
    let consolidator = Arc::new(
        Consolidator::new(store, args.provider.as_str())
            .with_range(BatchRange::new(args.offset, args.limit))
            .with_options(opts),
    );

    if args.once {
        match consolidator.run(ConsolidateRequest::default()).await {
            Ok(outcome) => match serde_json::to_string_pretty(&outcome) {
                Ok(json) => {
                    println!("{json}");
                    let code = if outcome.errors.total() > 0 { 2 } else { 0 };
                    std::process::exit(code);
                }
                Err(e) => {
                    error!(error = %e, "failed to serialize run outcome");
                    std::process::exit(1);
                }
            },
            Err(e) => {
                error!(error = %e, "consolidation failed");
                std::process::exit(1);
            }
        }
    }

    let sched = Schedule {
        run_on_start: args.run_on_start,
        startup_delay: Duration::from_secs(args.startup_delay_secs),
        every: (args.every_mins > 0).then(|| Duration::from_secs(args.every_mins.saturating_mul(60))),
    };
    let scheduler = schedule::spawn(consolidator.clone(), sched.clone());
    if scheduler.is_some() {
        info!(
            run_on_start = sched.run_on_start,
            every_mins = args.every_mins,
            "background consolidation enabled"
        );
    }

    let auth_status = if args.api_key.is_some() { "enabled" } else { "disabled" };
    let state = AppState {
        consolidator: consolidator.clone(),
        api_key: args.api_key.clone(),
        started_at: std::time::Instant::now(),
    };
    let app = api::router(state);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        provider = %args.provider,
        auth = auth_status,
        "tally starting"
    );

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(consolidator.clone()))
        .await
        .expect("server error");

    // The in-flight run stops at its next group boundary; let it get there
    // before the runtime drops the scheduler task.
    consolidator.wait_idle().await;
    if let Some(handle) = scheduler {
        handle.abort();
    }
    info!("stopped");
}

async fn shutdown_signal(consolidator: Arc<Consolidator>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutting down");
    consolidator.shutdown();
}
