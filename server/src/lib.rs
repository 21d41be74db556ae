//! CCR broker: axum HTTP + WebSocket listener, connection state
//! machine, heartbeat, and idle reaper.

pub mod broker;
pub mod connection;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ccr_core::config::Config;
use ccr_core::rate_limiter::{RateLimiter, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_MS};
use ccr_core::session_manager::SessionManager;
use tokio::sync::broadcast;

pub use broker::AppState;

/// Period between idle-session reaper sweeps.
const IDLE_REAPER_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Runs the broker: binds `config.host:config.port`, serves `/api/health`,
/// `/ws`, and (if present) static assets from `static_dir`, and spawns
/// the idle-reaper sweep. Runs until a shutdown signal arrives, at which
/// point every session is killed before the listener is dropped.
pub async fn run_server(
    config: Arc<Config>,
    sandbox_base: PathBuf,
    static_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let session_manager = SessionManager::new(sandbox_base);
    let rate_limiter = Arc::new(RateLimiter::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_MS));
    let (session_list_tx, _) = broadcast::channel(16);

    let state = AppState {
        session_manager: Arc::clone(&session_manager),
        rate_limiter,
        config: Arc::clone(&config),
        session_list_tx,
    };

    spawn_idle_reaper(Arc::clone(&session_manager));

    let app = broker::build_router(state, static_dir);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "ccr-server listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&session_manager)))
        .await?;
    Ok(())
}

/// Waits for Ctrl+C (or SIGTERM on unix), then kills every session before
/// the listener is dropped, signalling each session's child and freeing
/// its resources.
async fn shutdown_signal(session_manager: Arc<SessionManager>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, destroying all sessions");
    session_manager.destroy_all();
}

fn spawn_idle_reaper(session_manager: Arc<SessionManager>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_REAPER_INTERVAL);
        loop {
            ticker.tick().await;
            let cleaned = session_manager.cleanup_idle_sessions();
            if cleaned > 0 {
                tracing::info!(cleaned, "idle reaper swept sessions");
            }
        }
    });
}
