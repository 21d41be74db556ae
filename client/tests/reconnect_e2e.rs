//! Drives `ccr_client::connect` against a real broker (`ccr-server`'s
//! router, bound to an OS-assigned port) rather than mocking the wire —
//! the client-side mirror of `server/tests/broker_e2e.rs`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ccr_client::connection::{connect, ClientEvent, ConnectOptions};
use ccr_core::config::Config;
use ccr_core::rate_limiter::RateLimiter;
use ccr_core::session_manager::SessionManager;
use ccr_server::broker::{build_router, AppState};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

async fn spawn_test_server() -> (SocketAddr, String, tempfile::TempDir) {
    let sandbox = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(Config {
        port: 0,
        host: "127.0.0.1".to_string(),
        jwt_secret: "client-e2e-secret-0123456789abcdef".to_string(),
        tls_cert_path: None,
        tls_key_path: None,
    });
    let token = ccr_core::auth::create_access_token(&config).expect("mint token");

    let session_manager = SessionManager::new(sandbox.path().to_path_buf());
    let rate_limiter = Arc::new(RateLimiter::default());
    let (session_list_tx, _) = broadcast::channel(16);
    let state = AppState {
        session_manager,
        rate_limiter,
        config,
        session_list_tx,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let app = build_router(state, Option::<PathBuf>::None);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await;
    });

    (addr, token, sandbox)
}

async fn next_event(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}

#[tokio::test]
async fn connect_create_session_and_receive_echoed_output() {
    let (addr, token, _sandbox) = spawn_test_server().await;
    std::env::set_var("CCR_CHILD_COMMAND", "cat");

    let (handle, mut events) = connect(ConnectOptions {
        url: format!("ws://{addr}/ws"),
        token,
        auto_reconnect: false,
    });

    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected));
    assert!(matches!(next_event(&mut events).await, ClientEvent::Authenticated));
    match next_event(&mut events).await {
        ClientEvent::Sessions(entries) => assert!(entries.is_empty()),
        other => panic!("expected initial empty Sessions, got {other:?}"),
    }

    handle.create_session(None, None, 80, 24);
    let session_id = match next_event(&mut events).await {
        ClientEvent::Sessions(entries) => {
            assert_eq!(entries.len(), 1);
            entries[0].id.clone()
        }
        other => panic!("expected Sessions after create, got {other:?}"),
    };
    handle.remember_session(session_id);

    handle.send_input(b"hello\n".to_vec());
    let mut saw_echo = false;
    for _ in 0..20 {
        if let ClientEvent::Data(bytes) = next_event(&mut events).await {
            if bytes.windows(5).any(|w| w == b"hello") {
                saw_echo = true;
                break;
            }
        }
    }
    assert!(saw_echo, "expected echoed child output to reach the client as Data");

    handle.disconnect();
    assert!(matches!(next_event(&mut events).await, ClientEvent::Disconnected));
}

#[tokio::test]
async fn bad_token_surfaces_as_server_error_and_stops() {
    let (addr, _token, _sandbox) = spawn_test_server().await;

    let (_handle, mut events) = connect(ConnectOptions {
        url: format!("ws://{addr}/ws"),
        token: "not-a-real-token".to_string(),
        auto_reconnect: false,
    });

    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected));
    match next_event(&mut events).await {
        ClientEvent::ServerError { code, .. } => assert_eq!(code, "AUTH_FAILED"),
        other => panic!("expected ServerError(AUTH_FAILED), got {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, ClientEvent::Disconnected));
}
