use clap::{Parser, ValueHint};
use log::LevelFilter;
use procbridge::protocol::HostEnvironment;
use std::num::{NonZeroU16, NonZeroUsize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;

mod process;
mod routes;
mod translate;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .filter(Some("tower_http"), LevelFilter::Debug)
        .filter(Some("procbridge_server"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    let CliArgs {
        programs,
        host,
        port,
        timeout,
        max_concurrent,
    } = CliArgs::parse();

    log::info!(
        version = env!("CARGO_PKG_VERSION"),
        timeout,
        max_concurrent:debug;
        "initializing server"
    );

    // Every program must be runnable before anything is served.
    let entries = routes::resolve_all(&programs, Duration::from_secs(timeout), max_concurrent)
        .map_err(|e| {
            log::error!("{e}");
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;

    let host_env = HostEnvironment::capture();
    log::debug!(variables = host_env.len(); "captured host environment");

    let router = routes::routes(entries, host_env).layer(TraceLayer::new_for_http());

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!(
        addr:display = host,
        port = port.get();
        "listening to TCP"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
}

/// Exposes programs as HTTP endpoints.
///
/// Every program is served under its file name without extension,
/// e.g. `./scripts/weather.sh` under `/weather`.
#[derive(Parser)]
#[command(version)]
struct CliArgs {
    /// The programs to serve.
    #[arg(
        required = true,
        value_name = "PROGRAM",
        value_hint = ValueHint::ExecutablePath,
    )]
    programs: Vec<PathBuf>,
    /// The host address to listen on.
    #[arg(
        long,
        value_name = "URI",
        value_hint = ValueHint::Hostname,
        default_value = "0.0.0.0",
        env = "PROCBRIDGE_HOST",
    )]
    host: String,
    /// The port to listen on.
    #[arg(
        short,
        long,
        value_name = "PORT",
        value_hint = ValueHint::Other,
        default_value = "8000",
        env = "PORT",
    )]
    port: NonZeroU16,
    /// Seconds after which a program is killed.
    #[arg(
        short,
        long,
        value_name = "SECONDS",
        default_value = "5",
        env = "TIMEOUT",
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    timeout: u64,
    /// Maximum number of concurrent invocations per program, unlimited if not set.
    #[arg(long, value_name = "COUNT", env = "PROCBRIDGE_MAX_CONCURRENT")]
    max_concurrent: Option<NonZeroUsize>,
}

/// Resolves once SIGINT or SIGTERM arrives.
///
/// A signal that cannot be listened to is logged and never resolves.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            log::warn!("cannot listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                log::warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        () = interrupt => "SIGINT",
        () = terminate => "SIGTERM",
    };
    log::info!(signal = received; "shutting down, waiting for running programs");
}
