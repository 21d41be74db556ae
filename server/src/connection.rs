//! Per-socket connection state machine: a task-per-socket,
//! `tokio::select!`-driven loop that dispatches on `ccr_core::protocol`
//! frame kinds, handling the auth handshake, heartbeat, and
//! session-control sub-protocol.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use ccr_core::auth;
use ccr_core::file_handler;
use ccr_core::protocol::{
    self, AuthPayload, ErrorPayload, FileContentPayload, FileListPayload,
    FileReadPayload, FileWritePayload, Frame, SessionControlPayload, SessionListEntry,
};
use ccr_core::session_manager::{CreateOptions, SessionId};

use crate::broker::AppState;

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Mutable per-socket fields the broker must track, kept as a dedicated
/// record rather than bolted onto the socket type.
struct ConnectionRecord {
    authenticated: bool,
    current_session_id: Option<SessionId>,
    is_alive: bool,
}

impl ConnectionRecord {
    fn new() -> Self {
        Self {
            authenticated: false,
            current_session_id: None,
            is_alive: true,
        }
    }
}

/// Runs one accepted WebSocket connection end to end: auth handshake,
/// then the main message loop, until the socket closes.
pub async fn handle_socket(
    socket: WebSocket,
    peer: SocketAddr,
    state: AppState,
    token_from_request: Option<String>,
) {
    let peer_key = peer.to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut record = ConnectionRecord::new();

    if let Some(token) = token_from_request {
        if auth::verify_access_token(&token, &state.config).is_ok() {
            record.authenticated = true;
        } else {
            send_frame(&mut ws_tx, &error_frame("AUTH_FAILED", "invalid or expired token")).await;
            let _ = ws_tx.close().await;
            return;
        }
    } else {
        match timeout(AUTH_TIMEOUT, ws_rx.next()).await {
            Ok(Some(Ok(Message::Binary(bytes)))) => match protocol::decode(&bytes) {
                Ok(Frame::Auth(AuthPayload { token })) => {
                    if auth::verify_access_token(&token, &state.config).is_ok() {
                        record.authenticated = true;
                    } else {
                        send_frame(&mut ws_tx, &error_frame("AUTH_FAILED", "invalid or expired token"))
                            .await;
                        let _ = ws_tx.close().await;
                        return;
                    }
                }
                _ => {
                    send_frame(&mut ws_tx, &error_frame("AUTH_REQUIRED", "first frame must be AUTH"))
                        .await;
                    let _ = ws_tx.close().await;
                    return;
                }
            },
            _ => {
                send_frame(&mut ws_tx, &error_frame("AUTH_TIMEOUT", "no AUTH frame within 5s")).await;
                let _ = ws_tx.close().await;
                return;
            }
        }
    }

    tracing::info!(peer = %peer_key, "connection authenticated");
    send_frame(&mut ws_tx, &Frame::AuthOk).await;
    send_frame(&mut ws_tx, &session_list_frame(&state)).await;

    let mut session_list_rx = state.session_list_tx.subscribe();
    let mut attached_rx: Option<mpsc::UnboundedReceiver<Bytes>> = None;
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        if !state.rate_limiter.check(&peer_key) {
                            send_frame(&mut ws_tx, &error_frame("RATE_LIMITED", "request budget exhausted")).await;
                            continue;
                        }
                        match protocol::decode(&bytes) {
                            Ok(frame) => handle_frame(frame, &mut record, &state, &mut ws_tx, &mut attached_rx).await,
                            Err(e) => send_frame(&mut ws_tx, &error_frame("PARSE_ERROR", &e.to_string())).await,
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        record.is_alive = true;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            Some(bytes) = recv_optional(&mut attached_rx) => {
                if let Some(id) = &record.current_session_id {
                    let frame_bytes = protocol::encode_session_output(id.as_str(), &bytes);
                    if ws_tx.send(Message::Binary(frame_bytes.into())).await.is_err() {
                        break;
                    }
                }
            }
            _ = session_list_rx.recv() => {
                send_frame(&mut ws_tx, &session_list_frame(&state)).await;
            }
            _ = heartbeat.tick() => {
                if !record.is_alive {
                    tracing::info!(peer = %peer_key, "heartbeat timeout, closing");
                    break;
                }
                record.is_alive = false;
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(id) = record.current_session_id.take() {
        state.session_manager.detach_client(&id);
    }
    state.rate_limiter.remove(&peer_key);
    tracing::info!(peer = %peer_key, "connection closed");
}

async fn recv_optional(rx: &mut Option<mpsc::UnboundedReceiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_frame(
    frame: Frame,
    record: &mut ConnectionRecord,
    state: &AppState,
    ws_tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    attached_rx: &mut Option<mpsc::UnboundedReceiver<Bytes>>,
) {
    match frame {
        Frame::TerminalData(bytes) => match &record.current_session_id {
            Some(id) => {
                if let Some(session) = state.session_manager.get_session(id) {
                    session.write(&bytes);
                }
            }
            None => send_frame(ws_tx, &error_frame("NO_SESSION", "no session attached")).await,
        },
        Frame::Resize(p) => {
            if let Some(id) = &record.current_session_id {
                if let Some(session) = state.session_manager.get_session(id) {
                    session.resize(p.cols, p.rows);
                }
            }
        }
        Frame::Ping => send_frame(ws_tx, &Frame::Pong).await,
        Frame::SessionControl(p) => {
            handle_session_control(p, record, state, ws_tx, attached_rx).await;
        }
        Frame::FileList(FileListPayload { path, .. }) => {
            handle_file_list(path, record, state, ws_tx).await;
        }
        Frame::FileRead(FileReadPayload { path }) => {
            handle_file_read(path, record, state, ws_tx).await;
        }
        Frame::FileWrite(FileWritePayload { path, content }) => {
            handle_file_write(path, content, record, state, ws_tx).await;
        }
        // Server never receives these kinds from a well-behaved client;
        // decode succeeded but there's nothing to dispatch.
        Frame::Pong
        | Frame::Auth(_)
        | Frame::Error(_)
        | Frame::SessionList(_)
        | Frame::AuthOk
        | Frame::SessionOutput { .. }
        | Frame::FileContent(_) => {}
    }
}

async fn handle_session_control(
    p: SessionControlPayload,
    record: &mut ConnectionRecord,
    state: &AppState,
    ws_tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    attached_rx: &mut Option<mpsc::UnboundedReceiver<Bytes>>,
) {
    match p.action.as_str() {
        "create" => {
            let opts = CreateOptions {
                name: p.name,
                cwd: p.cwd.map(std::path::PathBuf::from),
                cols: p.cols.unwrap_or(0),
                rows: p.rows.unwrap_or(0),
            };
            match state.session_manager.create_session(opts) {
                Ok(snapshot) => {
                    attach(&snapshot.id, record, state, ws_tx, attached_rx).await;
                    let _ = state.session_list_tx.send(());
                }
                Err(e) => send_frame(ws_tx, &error_frame("FILE_ERROR", &e.to_string())).await,
            }
        }
        "attach" => {
            let Some(raw) = p.session_id else {
                send_frame(ws_tx, &error_frame("MISSING_SESSION_ID", "missing sessionId")).await;
                return;
            };
            let Some(id) = SessionId::parse(&raw) else {
                send_frame(ws_tx, &error_frame("SESSION_NOT_FOUND", &raw)).await;
                return;
            };
            if state.session_manager.get_session(&id).is_none() {
                send_frame(ws_tx, &error_frame("SESSION_NOT_FOUND", &raw)).await;
                return;
            }
            attach(&id, record, state, ws_tx, attached_rx).await;
        }
        "detach" => {
            if let Some(id) = record.current_session_id.take() {
                state.session_manager.detach_client(&id);
            }
            *attached_rx = None;
        }
        "destroy" => {
            let Some(raw) = p.session_id else {
                send_frame(ws_tx, &error_frame("MISSING_SESSION_ID", "missing sessionId")).await;
                return;
            };
            let Some(id) = SessionId::parse(&raw) else {
                send_frame(ws_tx, &error_frame("SESSION_NOT_FOUND", &raw)).await;
                return;
            };
            if !state.session_manager.destroy_session(&id) {
                send_frame(ws_tx, &error_frame("SESSION_NOT_FOUND", &raw)).await;
                return;
            }
            if record.current_session_id.as_ref() == Some(&id) {
                record.current_session_id = None;
                *attached_rx = None;
            }
            let _ = state.session_list_tx.send(());
        }
        "list" => send_frame(ws_tx, &session_list_frame(state)).await,
        other => {
            send_frame(ws_tx, &error_frame("PARSE_ERROR", &format!("unknown action: {other}"))).await
        }
    }
}

/// Attach procedure: detach current, register the new subscription,
/// replay scrollback as a single `TERMINAL_DATA` frame before any
/// further live output is forwarded.
async fn attach(
    id: &SessionId,
    record: &mut ConnectionRecord,
    state: &AppState,
    ws_tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    attached_rx: &mut Option<mpsc::UnboundedReceiver<Bytes>>,
) {
    if let Some(old) = record.current_session_id.take() {
        state.session_manager.detach_client(&old);
    }
    let (tx, rx) = mpsc::unbounded_channel();
    // Scrollback snapshot and live subscription are taken atomically by
    // `attach_client` (under the session's scrollback lock), so nothing
    // emitted around this call can reach both the replay below and the
    // live stream that follows.
    let Some(scrollback) = state.session_manager.attach_client(id, tx) else {
        send_frame(ws_tx, &error_frame("SESSION_NOT_FOUND", id.as_str())).await;
        return;
    };
    *attached_rx = Some(rx);
    record.current_session_id = Some(id.clone());

    if !scrollback.is_empty() {
        send_frame(ws_tx, &Frame::TerminalData(scrollback)).await;
    }
}

async fn handle_file_list(
    path: String,
    record: &ConnectionRecord,
    state: &AppState,
    ws_tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
) {
    let Some(id) = &record.current_session_id else {
        send_frame(ws_tx, &error_frame("NO_SESSION", "no session attached")).await;
        return;
    };
    let sandbox = state.session_manager.sandbox_dir(id);
    match file_handler::list_files(&sandbox, &path).await {
        Ok(files) => {
            send_frame(ws_tx, &Frame::FileList(FileListPayload { path, files })).await;
        }
        Err(e) => send_frame(ws_tx, &error_frame("FILE_ERROR", &e.to_string())).await,
    }
}

async fn handle_file_read(
    path: String,
    record: &ConnectionRecord,
    state: &AppState,
    ws_tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
) {
    let Some(id) = &record.current_session_id else {
        send_frame(ws_tx, &error_frame("NO_SESSION", "no session attached")).await;
        return;
    };
    let sandbox = state.session_manager.sandbox_dir(id);
    match file_handler::read_file(&sandbox, &path).await {
        Ok((content, language)) => {
            send_frame(ws_tx, &Frame::FileContent(FileContentPayload { path, content, language })).await;
        }
        Err(e) => send_frame(ws_tx, &error_frame("FILE_ERROR", &e.to_string())).await,
    }
}

async fn handle_file_write(
    path: String,
    content: String,
    record: &ConnectionRecord,
    state: &AppState,
    ws_tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
) {
    let Some(id) = &record.current_session_id else {
        send_frame(ws_tx, &error_frame("NO_SESSION", "no session attached")).await;
        return;
    };
    let sandbox = state.session_manager.sandbox_dir(id);
    match file_handler::write_file(&sandbox, &path, &content).await {
        Ok(()) => {}
        Err(e) => send_frame(ws_tx, &error_frame("FILE_ERROR", &e.to_string())).await,
    }
}

fn error_frame(code: &str, message: &str) -> Frame {
    Frame::Error(ErrorPayload {
        code: code.to_string(),
        message: message.to_string(),
    })
}

fn session_list_frame(state: &AppState) -> Frame {
    let entries: Vec<SessionListEntry> = state
        .session_manager
        .list_sessions()
        .into_iter()
        .map(|s| SessionListEntry {
            id: s.id.to_string(),
            name: s.name,
            cwd: s.cwd,
            created_at: s.created_at,
            last_activity: s.last_activity,
            connected: s.connected,
            pid: s.pid,
        })
        .collect();
    Frame::SessionList(entries)
}

async fn send_frame(ws_tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin), frame: &Frame) {
    let bytes = protocol::encode(frame);
    let _ = ws_tx.send(Message::Binary(bytes.into())).await;
}
