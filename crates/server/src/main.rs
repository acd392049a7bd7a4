//! Companion Server
//!
//! Local orchestration daemon for AI coding-CLI sessions: spawns backend
//! CLIs (optionally confined to per-session containers and git worktrees)
//! and exposes them to browser clients as live, reconnectable sessions.

mod auth;
mod bridge;
mod container;
mod gateway;
mod git;
mod images;
mod linear;
mod logging;
mod paths;
mod persist;
mod pipeline;
mod plugins;
mod processes;
mod routes;
mod settings;
mod state;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::AuthGate;
use crate::container::ContainerRuntime;
use crate::git::GitRuntime;
use crate::images::ImagePullCoordinator;
use crate::linear::LinearProjects;
use crate::logging::init_logging;
use crate::plugins::state::PluginState;
use crate::plugins::{builtin, PluginBus};
use crate::settings::Settings;
use crate::state::Daemon;
use crate::store::SessionStore;

/// Server version, baked in at compile time.
pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(
    name = "companion-server",
    about = "Companion — local daemon multiplexing AI coding-CLI sessions",
    version = VERSION,
)]
struct Cli {
    /// Data directory (default: ~/.companion)
    #[arg(long, global = true, env = "COMPANION_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon (default when no subcommand given)
    Start {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:4050", env = "COMPANION_BIND_ADDR")]
        bind: SocketAddr,

        /// Externally reachable URL encoded in the pairing QR
        #[arg(long, env = "COMPANION_EXTERNAL_URL")]
        external_url: Option<String>,
    },

    /// Print the bearer token (generating one if needed)
    Token,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());

    let (bind_addr, external_url) = match cli.command {
        Some(Command::Token) => {
            paths::ensure_dirs()?;
            let gate = AuthGate::load_or_create()?;
            println!("{}", gate.token());
            return Ok(());
        }
        Some(Command::Start { bind, external_url }) => (bind, external_url),
        None => ("127.0.0.1:4050".parse()?, None),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main(bind_addr, external_url, &data_dir))
}

async fn async_main(
    bind_addr: SocketAddr,
    external_url: Option<String>,
    data_dir: &std::path::Path,
) -> anyhow::Result<()> {
    paths::ensure_dirs()?;

    let logging = init_logging()?;
    let run_id = logging.run_id.clone();
    let _log_guard = logging.guard;
    let root_span =
        tracing::info_span!("companion_server", service = "companion-server", run_id = %run_id);
    let _root_span_guard = root_span.enter();

    info!(
        component = "server",
        event = "server.starting",
        run_id = %run_id,
        version = VERSION,
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        "Starting Companion Server..."
    );

    // Build the daemon: every runtime handle constructed once, up front.
    let auth = AuthGate::load_or_create()?;
    let store = SessionStore::load();
    let settings = Settings::load();
    let linear = LinearProjects::load();
    let containers = ContainerRuntime::new();
    let git = GitRuntime::new();
    let images = ImagePullCoordinator::new();
    let plugins = PluginBus::new(builtin::all(), PluginState::load());

    let external_url = external_url.unwrap_or_else(|| format!("http://{bind_addr}"));
    let daemon = Arc::new(Daemon::new(
        auth,
        store,
        settings,
        linear,
        containers,
        git,
        images,
        plugins,
        external_url,
    ));

    // Container availability is informational; sessions without containers
    // work regardless.
    match daemon.containers.version().await {
        Some(version) => {
            info!(
                component = "server",
                event = "server.container_runtime.available",
                version = %version,
                "Container runtime available"
            );
            daemon.containers.restore().await;
        }
        None => {
            warn!(
                component = "server",
                event = "server.container_runtime.missing",
                "Container runtime unreachable — containerized sessions unavailable"
            );
        }
    }

    let app = routes::router(daemon.clone())
        .layer(axum::middleware::from_fn_with_state(
            daemon.auth.clone(),
            auth::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // A failed bind is a fatal startup error: non-zero exit.
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind_address = %bind_addr,
        "Listening for connections"
    );
    write_pid_file();

    let shutdown_daemon = daemon.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_daemon))
    .await?;

    Ok(())
}

fn write_pid_file() {
    let pid_path = paths::pid_file_path();
    if let Err(e) = std::fs::write(&pid_path, std::process::id().to_string()) {
        warn!(
            component = "server",
            event = "server.pid_file.write_error",
            path = %pid_path.display(),
            error = %e,
            "Failed to write PID file"
        );
    }
}

fn remove_pid_file() {
    let _ = std::fs::remove_file(paths::pid_file_path());
}

/// Wait for ctrl-c, then cancel every session and clean up containers.
async fn shutdown_signal(daemon: Arc<Daemon>) {
    let _ = tokio::signal::ctrl_c().await;
    info!(
        component = "server",
        event = "server.shutdown",
        "Shutdown signal received"
    );
    daemon.shutdown().await;
    remove_pid_file();
}

#[cfg(test)]
pub(crate) struct TestDirGuard {
    _dir: tempfile::TempDir,
    _lock: std::sync::MutexGuard<'static, ()>,
}

/// Point the global data dir at a fresh temp directory for one test.
/// Tests touching persisted state serialize on the returned guard.
#[cfg(test)]
pub(crate) fn test_data_dir() -> TestDirGuard {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    let lock = LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().expect("tempdir");
    paths::init_data_dir(Some(dir.path()));
    TestDirGuard {
        _dir: dir,
        _lock: lock,
    }
}
