use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pdf2md::auth::{Authenticator, Authorizer};
use pdf2md::config::{Config, RateLimitBackend};
use pdf2md::jobs::worker::{self, WorkerControl};
use pdf2md::jobs::JobRegistry;
use pdf2md::ratelimit::memory::MemoryRateLimiter;
use pdf2md::ratelimit::redis::RedisRateLimiter;
use pdf2md::ratelimit::{RateLimitGate, RateLimiter};
use pdf2md::sandbox::{SandboxDispatcher, SandboxLimits};
use pdf2md::store::blob::BlobStore;
use pdf2md::store::postgres::PgStore;
use pdf2md::{api, cli, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pdf2md=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = pdf2md::config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Admin { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            db.migrate().await?;
            cli::handle_admin_command(&db, &cfg.token_pepper, command).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        tracing::error!("fatal: {e:#}");
    }
    result
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let db = PgStore::connect(&cfg.database_url)
        .await
        .context("connecting to postgres")?;
    db.migrate().await.context("running migrations")?;

    let (limiter, redis_conn): (Arc<dyn RateLimiter>, Option<redis::aio::ConnectionManager>) =
        match cfg.rate_limit_backend {
            RateLimitBackend::Redis => {
                let client =
                    redis::Client::open(cfg.redis_url.as_str()).context("parsing redis url")?;
                let conn = redis::aio::ConnectionManager::new(client)
                    .await
                    .context("connecting to redis")?;
                (Arc::new(RedisRateLimiter::new(conn.clone())), Some(conn))
            }
            RateLimitBackend::Memory => {
                tracing::warn!("in-memory rate limiter active; single-instance deployments only");
                (Arc::new(MemoryRateLimiter::new()), None)
            }
        };
    let gate = RateLimitGate::new(limiter, cfg.rate_limit_fail_mode);

    let blob = BlobStore::from_url(&cfg.blob_store_url).context("configuring blob store")?;
    let registry = JobRegistry::new(db.clone());
    let worker_ctl = WorkerControl::new();

    let dispatcher = SandboxDispatcher::new(
        &cfg.extractor_cmd,
        SandboxLimits {
            timeout_secs: cfg.sandbox_timeout_secs,
            memory_limit_mb: cfg.sandbox_memory_limit_mb,
            cpu_limit_secs: None,
        },
    )?;
    worker::spawn(
        registry.clone(),
        blob.clone(),
        dispatcher,
        worker_ctl.clone(),
    );

    let state = Arc::new(AppState {
        authenticator: Authenticator::new(db.clone(), cfg.token_pepper.clone()),
        authz: Authorizer::new(db.clone()),
        registry,
        gate,
        blob,
        worker_ctl,
        redis: redis_conn,
        db,
        config: cfg,
    });

    let app = api::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("pdf2md listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
