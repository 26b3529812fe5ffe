// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use poll_engine::config::Config;
use poll_engine::db;
use poll_engine::handlers::AppState;
use poll_engine::memory::MemoryPollStore;
use poll_engine::notify::{LogNotifier, PollNotifier, WebhookNotifier};
use poll_engine::queue::{JobQueue, MemoryJobQueue, PgJobQueue};
use poll_engine::routes;
use poll_engine::scheduler::{spawn_closure_worker, ClosureScheduler, ClosureWorker};
use poll_engine::store::PollStore;
use poll_engine::{PollLifecycle, VoteEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok(); // Load environment variables from .env file

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "poll_engine=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let (store, queue): (Arc<dyn PollStore>, Arc<dyn JobQueue>) = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url, config.max_connections)
                .await
                .context("failed to connect to the database")?;
            db::migrate(&pool).await.context("failed to migrate the database")?;
            (
                Arc::new(db::PgPollStore::new(pool.clone())),
                Arc::new(PgJobQueue::new(pool)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, polls and closure jobs live in memory only");
            (
                Arc::new(MemoryPollStore::new()),
                Arc::new(MemoryJobQueue::new()),
            )
        }
    };

    let notifier: Arc<dyn PollNotifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    let engine = Arc::new(VoteEngine::new(store.clone()));
    let scheduler = Arc::new(ClosureScheduler::new(queue.clone()));
    let lifecycle = Arc::new(PollLifecycle::new(
        store,
        engine.clone(),
        scheduler,
        notifier,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ClosureWorker::new(queue, lifecycle.clone(), config.worker);
    let worker_handle = spawn_closure_worker(worker, shutdown_rx);

    let app = routes::create_routes(AppState { engine, lifecycle });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let handle = axum_server::Handle::new();
    let server_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            shutdown_tx.send(true).ok();
            server_handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
        }
    });

    tracing::info!(%addr, "poll engine listening");
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("server error")?;

    worker_handle.await.ok();
    Ok(())
}
