use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use bodyfat::auth::verification::{spawn_sweeper, SWEEP_INTERVAL};
use bodyfat::auth::{Argon2Hasher, CodeStore, LogCodeSender, OsRng, PhoneVerifier, TokenService};
use bodyfat::pipeline::load_analyzer;
use bodyfat::{router, AppConfig, AppState, SqliteUserStore};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;

    let analyzer = Arc::new(load_analyzer(&config)?);
    let users = Arc::new(SqliteUserStore::new(&config.database_url).await?);

    let codes = Arc::new(CodeStore::new());
    let _sweeper = spawn_sweeper(Arc::clone(&codes), SWEEP_INTERVAL);
    let phone = PhoneVerifier::new(
        codes,
        Arc::new(LogCodeSender),
        Arc::new(OsRng),
        config.verification_ttl,
    );

    let state = AppState {
        analyzer,
        users,
        hasher: Arc::new(Argon2Hasher::with_os_rng()),
        tokens: Arc::new(TokenService::new(&config.jwt_secret, config.token_ttl)),
        phone: Arc::new(phone),
        max_upload_bytes: config.max_upload_bytes,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed to start");
            ExitCode::FAILURE
        }
    }
}
