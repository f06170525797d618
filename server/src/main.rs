// Corelay gateway - Main Entry Point
//
// Bootstrap only: environment loading, logging, CLI dispatch, and the
// serve loop. Handlers, routing, and domain logic live in the library
// modules.

pub use corelay_server::*;

use std::net::SocketAddr;
use std::sync::OnceLock;

use clap::{Parser, Subcommand};
use corelay_core::config::AppConfig;
use dotenvy::{Error as DotenvError, dotenv};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_appender::non_blocking;
use tracing_subscriber::EnvFilter;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

static TRACING_GUARD: OnceLock<non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(author, version, about = "Corelay collaboration gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway
    Serve,
    /// Print the resolved configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    report_env_status(load_env_file());

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    init_tracing(&config);
    install_panic_hook(&config);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config).await,
        Command::CheckConfig => run_check_config(config),
    }
}

async fn run_serve(config: AppConfig) -> anyhow::Result<()> {
    info!(
        port = config.port,
        environment = config.environment.as_str(),
        redis_url = %config.redis_url(),
        cors_origin = %config.cors_origin,
        "starting gateway"
    );

    let bind_address = config.bind_address();
    let state = build_state(config).await;
    let store = state.store.clone();
    let app = router::build_router(state);

    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(|err| anyhow::anyhow!("failed to bind {bind_address}: {err}"))?;
    let actual_addr = listener.local_addr()?;
    info!("listening on {actual_addr}");

    if let Err(error) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        error!(?error, "server terminated with error");
    }

    store.shutdown().await;
    info!("gateway stopped");

    Ok(())
}

fn run_check_config(config: AppConfig) -> anyhow::Result<()> {
    println!(
        "port={} environment={} redis={} cors_origin={} metrics_key_set={}",
        config.port,
        config.environment.as_str(),
        config.redis_url(),
        config.cors_origin,
        !config.metrics_api_key.is_empty()
    );
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    // LOG_DIR switches to a daily-rolling file; stdout JSON otherwise.
    if let Ok(log_dir) = std::env::var("LOG_DIR") {
        let trimmed = log_dir.trim();
        if !trimmed.is_empty() {
            if let Err(err) = std::fs::create_dir_all(trimmed) {
                eprintln!("failed to create log dir '{trimmed}': {err}");
                std::process::exit(1);
            }
            let file_appender = tracing_appender::rolling::daily(trimmed, "gateway.log");
            let (writer, guard) = non_blocking(file_appender);
            if tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .json()
                .with_writer(writer)
                .try_init()
                .is_ok()
            {
                let _ = TRACING_GUARD.set(guard);
            }
            return;
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .json()
        .with_writer(std::io::stdout)
        .try_init();
}

/// In production an uncaught fault must surface to the supervisor as a
/// non-zero exit rather than leave a wedged process behind.
fn install_panic_hook(config: &AppConfig) {
    if !config.environment.is_production() {
        return;
    }

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "fatal: uncaught panic");
        default_hook(info);
        std::process::exit(1);
    }));
}

enum EnvLoadStatus {
    Loaded,
    NotFound,
    Failed(DotenvError),
}

fn load_env_file() -> EnvLoadStatus {
    match dotenv() {
        Ok(_) => EnvLoadStatus::Loaded,
        Err(DotenvError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            EnvLoadStatus::NotFound
        }
        Err(err) => EnvLoadStatus::Failed(err),
    }
}

fn report_env_status(status: EnvLoadStatus) {
    match status {
        EnvLoadStatus::Loaded => {}
        EnvLoadStatus::NotFound => {}
        EnvLoadStatus::Failed(err) => {
            eprintln!("failed to load .env file: {err:?}");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
