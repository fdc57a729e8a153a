//! Branch Transfer service
//!
//! ```text
//! ┌──────────┐    ┌─────────────┐    ┌──────────────┐    ┌───────────┐
//! │ Gateway  │───▶│ Coordinator │───▶│ TransferStore│    │ Delivery  │
//! │ (axum)   │    │ (FSM + tx)  │    │ (PG / memory)│    │ worker    │
//! └──────────┘    └──────┬──────┘    └──────────────┘    └─────▲─────┘
//!                        └───────── events (after commit) ─────┘
//! ```
//!
//! Usage: `branch_transfer [--env dev] [--port 8080]`

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use branch_transfer::branch_transfer::store::postgres::init_schema;
use branch_transfer::branch_transfer::{
    AuditSink, ConflictDetector, DeliveryWorker, Directory, EventDispatcher, EventOutbox, Fixtures,
    LocalDocumentStore, LogNotifier, MemoryAuditLog, MemoryTransferStore, Notifier, PgAuditSink,
    PgDirectory, PgTransferStore, StaticDirectory, SystemClock, TransferCoordinator,
    TransferStore, WebhookNotifier,
};
use branch_transfer::config::AppConfig;
use branch_transfer::db::Database;
use branch_transfer::gateway::{self, auth::JwtVerifier, state::AppState};
use branch_transfer::logging::init_logging;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

/// Storage-side collaborators, PostgreSQL or in-memory
struct Backends {
    store: Arc<dyn TransferStore>,
    outbox: Arc<dyn EventOutbox>,
    directory: Arc<dyn Directory>,
    audit: Arc<dyn AuditSink>,
    db: Option<Arc<Database>>,
}

async fn postgres_backends(url: &str) -> Result<Backends> {
    let db = Arc::new(
        Database::connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?,
    );
    init_schema(db.pool())
        .await
        .context("Failed to bootstrap schema")?;

    let store = Arc::new(PgTransferStore::new(db.pool().clone()));
    Ok(Backends {
        store: store.clone(),
        outbox: store,
        directory: Arc::new(PgDirectory::new(db.pool().clone())),
        audit: Arc::new(PgAuditSink::new(db.pool().clone())),
        db: Some(db),
    })
}

async fn memory_backends(fixtures: Option<&str>) -> Result<Backends> {
    let fixtures = match fixtures {
        Some(path) => Fixtures::load(path)?,
        None => {
            warn!("No fixtures configured; directory is empty");
            Fixtures::default()
        }
    };

    let store = MemoryTransferStore::new();
    for row in &fixtures.subscriptions {
        store.seed_subscription(row.clone()).await;
    }
    for row in &fixtures.slots {
        store.seed_slot(row.clone()).await;
    }
    for row in &fixtures.orders {
        store.seed_order(row.clone()).await;
    }
    info!(
        branches = fixtures.branches.len(),
        students = fixtures.students.len(),
        "In-memory mode (data is lost on restart)"
    );

    let store = Arc::new(store);
    Ok(Backends {
        store: store.clone(),
        outbox: store,
        directory: Arc::new(StaticDirectory::from_fixtures(&fixtures)),
        audit: Arc::new(MemoryAuditLog::new()),
        db: None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&config);

    info!(env = %env, git_hash = env!("GIT_HASH"), "Starting branch transfer service");

    let backends = match config.postgres_url {
        Some(ref url) => postgres_backends(url).await?,
        None => memory_backends(config.fixtures.as_deref()).await?,
    };

    let documents = Arc::new(
        LocalDocumentStore::open(&config.documents.dir, &config.documents.public_base_url)
            .await?,
    );

    let notifier: Arc<dyn Notifier> = match config.notifications.webhook_url {
        Some(ref url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    };

    let (events, rx) = EventDispatcher::channel();
    let worker = DeliveryWorker::new(
        rx,
        backends.outbox.clone(),
        backends.audit.clone(),
        notifier,
        config.notifications.delivery(),
    );
    tokio::spawn(worker.run());

    let detector = ConflictDetector::new(Arc::new(SystemClock), config.branch_time_zone()?);
    let coordinator = Arc::new(TransferCoordinator::new(
        backends.store,
        backends.directory,
        documents,
        detector,
        events,
    ));

    let mut state = AppState::new(coordinator, Arc::new(JwtVerifier::new(&config.jwt_secret)));
    if let Some(db) = backends.db {
        state = state.with_database(db);
    }

    let port = get_port_override().unwrap_or(config.gateway.port);
    gateway::run_server(&config.gateway.host, port, Arc::new(state)).await
}
