//! Standalone `ccr-server` binary. Loads `<home>/.ccr/config.json`
//! (generating it with a fresh secret on first run), then runs the
//! broker until killed.

use std::path::PathBuf;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(ccr_core::config::ensure_loaded().clone());
    let sandbox_base = ccr_core::config::ccr_home();
    let static_dir = parse_static_dir();

    // Persisting the token to `<home>/.ccr/token` reuses `config::write_atomic`
    // rather than growing a separate storage layer for one file.
    let token = ccr_core::auth::create_access_token(&config)?;
    let token_path = ccr_core::config::token_path();
    if let Some(parent) = token_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    ccr_core::config::write_atomic(&token_path, &token)?;
    tracing::info!(path = %token_path.display(), "wrote fresh bearer token");
    eprintln!("ccr-server: bearer token written to {}", token_path.display());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(ccr_server::run_server(config, sandbox_base, static_dir))
}

/// `--static-dir <path>` points at a built browser SPA to serve as a
/// fallback from the router (the SPA itself is out of scope here; the
/// serving surface is kept).
fn parse_static_dir() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == "--static-dir")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}
