use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use spool_core::domain::{JobError, NewJob};
use spool_core::ports::SystemClock;
use spool_core::{
    Engine, EngineConfig, Handler, HandlerRegistry, InMemoryJobStore, JobClass, JobStore, Mode,
    PgJobStore, observability,
};

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    name: String,
}

impl JobClass for Hello {
    const CLASS: &'static str = "demo.hello";
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncAccount {
    account_id: u64,
}

impl JobClass for SyncAccount {
    const CLASS: &'static str = "demo.sync_account";
    const QUEUE: &'static str = "accounts";
}

struct HelloHandler;

#[async_trait]
impl Handler<Hello> for HelloHandler {
    async fn perform(&self, job: Hello) -> Result<(), JobError> {
        info!(name = %job.name, "hello");
        Ok(())
    }
}

/// Fails the first `n` runs so the failed-execution path shows up in the demo.
struct FlakySync {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl Handler<SyncAccount> for FlakySync {
    async fn perform(&self, job: SyncAccount) -> Result<(), JobError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(JobError::new(
                "UpstreamTimeout",
                format!("account {} sync timed out (left={left})", job.account_id),
            ));
        }
        info!(account_id = job.account_id, "account synced");
        Ok(())
    }
}

/// `RUST_LOG` filters (default `info`); `SPOOL_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SPOOL_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load_config() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match std::env::var("SPOOL_CONFIG") {
        Ok(path) => Ok(EngineConfig::from_json(&std::fs::read_to_string(path)?)?),
        Err(_) => Ok(EngineConfig::default()),
    }
}

fn parse_mode(raw: Option<String>) -> Result<Mode, Box<dyn std::error::Error>> {
    match raw.as_deref() {
        None | Some("all") => Ok(Mode::All),
        Some("work") => Ok(Mode::Work),
        Some("dispatch") => Ok(Mode::Dispatch),
        Some(other) => Err(format!("unknown mode '{other}' (expected work|dispatch|all)").into()),
    }
}

async fn open_store(config: &EngineConfig) -> Result<Arc<dyn JobStore>, Box<dyn std::error::Error>> {
    let policy = Arc::new(config.concurrency.policy());

    let Ok(url) = std::env::var("DATABASE_URL") else {
        info!("DATABASE_URL not set; using the in-memory store");
        return Ok(Arc::new(InMemoryJobStore::default().with_policy(policy)));
    };

    let pool = PgPoolOptions::new()
        .max_connections(u32::try_from(config.max_number_of_threads())?)
        .connect(&url)
        .await?;
    let store = PgJobStore::with_clock(pool, Arc::new(SystemClock)).with_policy(policy);
    store.install_schema().await?;
    info!("using the PostgreSQL store");
    Ok(Arc::new(store))
}

async fn submit_demo_jobs(store: &dyn JobStore) -> Result<(), Box<dyn std::error::Error>> {
    for name in ["ada", "grace", "linus"] {
        store
            .submit(Hello { name: name.into() }.to_new_job()?)
            .await?;
    }

    // 同じ key の 3 件は 1 件ずつ順に走る
    for _ in 0..3 {
        let job = SyncAccount { account_id: 7 }
            .to_new_job()?
            .with_concurrency_key("account/7");
        store.submit(job).await?;
    }

    let later = chrono::Utc::now() + chrono::Duration::seconds(2);
    let id = store
        .submit(
            NewJob::new(Hello::CLASS, serde_json::json!({ "name": "scheduled" }))
                .scheduled_at(later)
                .with_priority(-1),
        )
        .await?;
    info!(job_id = %id, "submitted demo jobs");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = load_config()?;
    let mode = parse_mode(std::env::args().nth(1))?;
    let store = open_store(&config).await?;

    let mut registry = HandlerRegistry::new();
    registry.register::<Hello, _>(HelloHandler)?;
    registry.register::<SyncAccount, _>(FlakySync {
        remaining_failures: AtomicU32::new(1),
    })?;
    registry.expect_classes(&[Hello::CLASS, SyncAccount::CLASS])?;

    submit_demo_jobs(store.as_ref()).await?;

    let engine = Engine::new(config.clone(), mode, Arc::clone(&store), Arc::new(registry));
    let running = engine.start().await?;

    let run_for = std::env::var("SPOOL_DEMO_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(5));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
        _ = tokio::time::sleep(run_for) => {}
    }

    let snapshot = observability::snapshot(
        store.as_ref(),
        &SystemClock,
        config.registry.alive_threshold,
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    running.stop().await;
    Ok(())
}
