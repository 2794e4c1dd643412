//! Coursekeep API server binary.
//!
//! Loads `.env`, connects to PostgreSQL, runs migrations and serves the auth
//! API until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use coursekeep_api::AppState;
use coursekeep_api::config::ApiConfig;
use coursekeep_core::auth::memory::MemoryStore;
use coursekeep_core::auth::queries::PgStore;
use coursekeep_core::auth::store::{RefreshTokenStore, UserStore};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

/// How often expired refresh-token records are deleted.
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// CLI arguments for the API server.
#[derive(Parser, Debug)]
#[command(name = "coursekeep_server", about = "Coursekeep API server")]
struct Args {
    /// Address to listen on. Overrides `BIND_ADDR`.
    #[arg(long)]
    bind: Option<String>,

    /// PostgreSQL connection URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/coursekeep"
    )]
    database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    /// Keep users and refresh tokens in process memory instead of PostgreSQL.
    /// Everything is lost on exit.
    #[arg(long, default_value_t = false)]
    in_memory: bool,
}

fn spawn_purge_task(tokens: Arc<dyn RefreshTokenStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match tokens.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired refresh tokens"),
                Err(e) => warn!(error = %e, "refresh token purge failed"),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,coursekeep_api=debug,coursekeep_core=debug")
            }),
        )
        .init();

    let args = Args::parse();

    let mut config = ApiConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    config.pg_connection_url = args.database_url;

    let (users, tokens): (Arc<dyn UserStore>, Arc<dyn RefreshTokenStore>) = if args.in_memory {
        warn!("using in-memory stores; accounts and sessions will not survive a restart");
        let store = Arc::new(MemoryStore::new());
        let users: Arc<dyn UserStore> = store.clone();
        let tokens: Arc<dyn RefreshTokenStore> = store;
        (users, tokens)
    } else {
        info!(
            max_connections = args.max_connections,
            "configuring connection pool"
        );
        let pool = PgPoolOptions::new()
            .max_connections(args.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.pg_connection_url)
            .await?;

        info!("running database migrations");
        coursekeep_api::migrate(&pool).await?;

        let store = Arc::new(PgStore::new(pool));
        let users: Arc<dyn UserStore> = store.clone();
        let tokens: Arc<dyn RefreshTokenStore> = store;
        (users, tokens)
    };

    let state = AppState::new(config.clone(), users, tokens.clone());

    let sweep = state.limiter.spawn_sweep_task();
    let cleanup = state.oauth.states().spawn_cleanup_task();
    let purge = spawn_purge_task(tokens);

    let app = coursekeep_api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "REST API listening");

    // Peer addresses feed the rate limiter when no X-Forwarded-For is present.
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    sweep.abort();
    cleanup.abort();
    purge.abort();

    result?;
    Ok(())
}
