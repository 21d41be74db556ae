//! `ccr-relay`: a thin stdin/stdout bridge to a running `ccr-server`,
//! with the Ctrl+B prefix-key session-switching layer.

use ccr_client::connection::{connect, ClientEvent, ConnectOptions};
use ccr_client::relay::{self, RelayExit};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    // Exit code 1 on reconnect-exhaustion, 0 otherwise.
    if rt.block_on(run())? == RelayExit::ReconnectExhausted {
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<RelayExit> {
    let url = std::env::var("CCR_URL").unwrap_or_else(|_| "ws://127.0.0.1:3100/ws".to_string());
    let token = std::env::var("CCR_TOKEN")
        .map_err(|_| anyhow::anyhow!("CCR_TOKEN must be set (see `ccr-server` token output)"))?;
    let session_id = std::env::var("CCR_SESSION_ID").ok();

    let (handle, mut events) = connect(ConnectOptions {
        url,
        token,
        auto_reconnect: true,
    });

    // Wait for authentication before issuing the initial attach/create so
    // we don't race the broker's AUTH_OK + SESSION_LIST handshake.
    loop {
        match events.recv().await {
            Some(ClientEvent::Authenticated) => break,
            Some(ClientEvent::ServerError { code, message }) => {
                anyhow::bail!("authentication failed: {code}: {message}");
            }
            None => anyhow::bail!("connection closed before authentication"),
            _ => {}
        }
    }

    match session_id {
        Some(id) => {
            handle.attach(id.clone());
            handle.remember_session(id);
        }
        None => handle.create_session(None, None, 80, 24),
    }

    relay::run(handle, events).await
}

