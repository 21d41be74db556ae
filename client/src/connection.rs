//! The client-side mirror of the broker's connection state machine — a
//! single reconnecting WebSocket, binary frames, backoff+jitter, and an
//! event fan-out over split read/write halves of `tokio-tungstenite`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use ccr_core::protocol::{self, Frame, SessionControlPayload, SessionListEntry};

/// Initial reconnect delay (base = 1s).
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Give up after this many consecutive failed reconnect attempts.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// App-level PING cadence, independent of the WebSocket ping opcode.
/// Both are kept — they serve different purposes.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Client-visible connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Reconnecting,
}

/// Events surfaced to the caller.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Authenticated,
    Data(Vec<u8>),
    Sessions(Vec<SessionListEntry>),
    FileList { path: String, files: Vec<ccr_core::protocol::FileEntry> },
    FileContent { path: String, content: String, language: String },
    ServerError { code: String, message: String },
    Pong { latency_ms: u64 },
    Disconnected,
    Reconnecting { attempt: u32, delay_ms: u64 },
    ReconnectFailed,
    Error(String),
}

/// Outbound commands accepted by the connection task.
#[derive(Debug, Clone)]
pub enum Command {
    TerminalData(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Ping,
    SessionControl(SessionControlPayload),
    FileList(String),
    FileRead(String),
    FileWrite { path: String, content: String },
    Disconnect,
}

/// How to reach and authenticate to a broker.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `ws://host:port/ws` or `wss://...`.
    pub url: String,
    pub token: String,
    pub auto_reconnect: bool,
}

/// Cloneable handle for issuing commands to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    current_session: Arc<Mutex<Option<String>>>,
}

impl ConnectionHandle {
    pub fn send(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn send_input(&self, bytes: Vec<u8>) {
        self.send(Command::TerminalData(bytes));
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.send(Command::Resize { cols, rows });
    }

    pub fn create_session(&self, name: Option<String>, cwd: Option<String>, cols: u16, rows: u16) {
        self.send(Command::SessionControl(SessionControlPayload {
            action: "create".to_string(),
            session_id: None,
            name,
            cwd,
            cols: Some(cols),
            rows: Some(rows),
        }));
    }

    pub fn attach(&self, session_id: impl Into<String>) {
        self.send(Command::SessionControl(SessionControlPayload {
            action: "attach".to_string(),
            session_id: Some(session_id.into()),
            name: None,
            cwd: None,
            cols: None,
            rows: None,
        }));
    }

    pub fn detach(&self) {
        self.send(Command::SessionControl(SessionControlPayload {
            action: "detach".to_string(),
            session_id: None,
            name: None,
            cwd: None,
            cols: None,
            rows: None,
        }));
    }

    pub fn destroy(&self, session_id: impl Into<String>) {
        self.send(Command::SessionControl(SessionControlPayload {
            action: "destroy".to_string(),
            session_id: Some(session_id.into()),
            name: None,
            cwd: None,
            cols: None,
            rows: None,
        }));
    }

    pub fn list_sessions(&self) {
        self.send(Command::SessionControl(SessionControlPayload {
            action: "list".to_string(),
            session_id: None,
            name: None,
            cwd: None,
            cols: None,
            rows: None,
        }));
    }

    /// The session id this connection is currently attached to, if any —
    /// tracked locally so a reconnect can re-`attach` automatically.
    pub fn current_session_id(&self) -> Option<String> {
        self.current_session.lock().expect("current_session lock").clone()
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }
}

/// Spawns the connection task and returns a command handle plus the
/// event stream. The task owns reconnection; callers only ever see one
/// logical connection.
pub fn connect(opts: ConnectOptions) -> (ConnectionHandle, mpsc::UnboundedReceiver<ClientEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let current_session = Arc::new(Mutex::new(None));

    let handle = ConnectionHandle {
        cmd_tx,
        current_session: Arc::clone(&current_session),
    };

    tokio::spawn(run_connection_loop(opts, cmd_rx, event_tx, current_session));

    (handle, event_rx)
}

async fn run_connection_loop(
    opts: ConnectOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    current_session: Arc<Mutex<Option<String>>>,
) {
    let mut attempt: u32 = 0;

    loop {
        match open_and_authenticate(&opts, &event_tx).await {
            Ok(stream) => {
                attempt = 0;
                // Re-attach to the previously held session (if any) is
                // issued from inside `run_session`, which holds the stream
                // and the `current_session` the user's UI layer maintains.
                let shutdown = run_session(stream, &mut cmd_rx, &event_tx, &current_session).await;
                let _ = event_tx.send(ClientEvent::Disconnected);
                if shutdown {
                    return;
                }
            }
            Err(e) => {
                let _ = event_tx.send(ClientEvent::Error(e.to_string()));
            }
        }

        if !opts.auto_reconnect {
            return;
        }
        if attempt >= MAX_RECONNECT_ATTEMPTS {
            let _ = event_tx.send(ClientEvent::ReconnectFailed);
            return;
        }

        let delay = backoff_delay(attempt);
        let _ = event_tx.send(ClientEvent::Reconnecting {
            attempt: attempt + 1,
            delay_ms: delay.as_millis() as u64,
        });
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cmd = cmd_rx.recv() => {
                if matches!(cmd, Some(Command::Disconnect) | None) {
                    return;
                }
            }
        }
        attempt += 1;
    }
}

/// `min(base * 2^attempt + rand(0, 1s), 30s)`.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let jitter = Duration::from_millis(rand::random::<u64>() % 1000);
    (exp + jitter).min(BACKOFF_CAP)
}

async fn open_and_authenticate(
    opts: &ConnectOptions,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
) -> anyhow::Result<WsStream> {
    use tungstenite::client::IntoClientRequest;

    let mut request = opts.url.clone().into_client_request()?;
    request.headers_mut().insert(
        tungstenite::http::header::AUTHORIZATION,
        format!("Bearer {}", opts.token).parse()?,
    );

    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    let _ = event_tx.send(ClientEvent::Connected);
    Ok(stream)
}

/// Runs one authenticated session to completion. Returns `true` if the
/// caller asked to disconnect permanently (auto-reconnect should stop).
async fn run_session(
    stream: WsStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
    current_session: &Arc<Mutex<Option<String>>>,
) -> bool {
    let (mut write, mut read) = stream.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut ping_sent_at: Option<Instant> = None;
    let mut authenticated = false;
    // Set by a `create` command; cleared once the SESSION_LIST that
    // reflects it arrives, at which point the new (not previously seen)
    // `connected` entry is adopted as `current_session` — `create`
    // doesn't know the server-assigned id up front the way `attach` does.
    let mut awaiting_create = false;
    let mut known_session_ids: HashSet<String> = HashSet::new();

    if let Some(id) = current_session.lock().expect("current_session lock").clone() {
        let frame = Frame::SessionControl(SessionControlPayload {
            action: "attach".to_string(),
            session_id: Some(id),
            name: None,
            cwd: None,
            cols: None,
            rows: None,
        });
        if send_frame(&mut write, &frame).await.is_err() {
            return false;
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Disconnect) => {
                        let _ = write.send(tungstenite::Message::Close(None)).await;
                        return true;
                    }
                    Some(command) => {
                        if let Some(frame) = command_to_frame(command, current_session, &mut awaiting_create) {
                            if send_frame(&mut write, &frame).await.is_err() {
                                return false;
                            }
                        }
                    }
                    None => return true,
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Binary(bytes))) => {
                        match protocol::decode(&bytes) {
                            Ok(frame) => {
                                if !handle_inbound_frame(
                                    frame,
                                    event_tx,
                                    current_session,
                                    &mut authenticated,
                                    &mut ping_sent_at,
                                    &mut awaiting_create,
                                    &mut known_session_ids,
                                ) {
                                    return false;
                                }
                            }
                            Err(e) => {
                                let _ = event_tx.send(ClientEvent::Error(format!("decode error: {e}")));
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(data))) => {
                        let _ = write.send(tungstenite::Message::Pong(data)).await;
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => return false,
                    Some(Err(_)) => return false,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                ping_sent_at = Some(Instant::now());
                if send_frame(&mut write, &Frame::Ping).await.is_err() {
                    return false;
                }
            }
        }
    }
}

fn command_to_frame(
    command: Command,
    current_session: &Arc<Mutex<Option<String>>>,
    awaiting_create: &mut bool,
) -> Option<Frame> {
    match command {
        Command::TerminalData(bytes) => Some(Frame::TerminalData(bytes)),
        Command::Resize { cols, rows } => {
            Some(Frame::Resize(ccr_core::protocol::ResizePayload { cols, rows }))
        }
        Command::Ping => Some(Frame::Ping),
        Command::SessionControl(p) => {
            match p.action.as_str() {
                "detach" => {
                    *current_session.lock().expect("current_session lock") = None;
                    *awaiting_create = false;
                }
                "attach" => {
                    if let Some(id) = &p.session_id {
                        *current_session.lock().expect("current_session lock") = Some(id.clone());
                    }
                    *awaiting_create = false;
                }
                "create" => *awaiting_create = true,
                _ => {}
            }
            Some(Frame::SessionControl(p))
        }
        Command::FileList(path) => Some(Frame::FileList(ccr_core::protocol::FileListPayload {
            path,
            files: Vec::new(),
        })),
        Command::FileRead(path) => Some(Frame::FileRead(ccr_core::protocol::FileReadPayload { path })),
        Command::FileWrite { path, content } => {
            Some(Frame::FileWrite(ccr_core::protocol::FileWritePayload { path, content }))
        }
        Command::Disconnect => None,
    }
}

/// Returns `false` if the session should be torn down (auth rejected).
fn handle_inbound_frame(
    frame: Frame,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
    current_session: &Arc<Mutex<Option<String>>>,
    authenticated: &mut bool,
    ping_sent_at: &mut Option<Instant>,
    awaiting_create: &mut bool,
    known_session_ids: &mut HashSet<String>,
) -> bool {
    match frame {
        Frame::AuthOk => {
            *authenticated = true;
            let _ = event_tx.send(ClientEvent::Authenticated);
        }
        Frame::TerminalData(bytes) => {
            let _ = event_tx.send(ClientEvent::Data(bytes));
        }
        Frame::SessionOutput { session_id, bytes } => {
            let current = current_session.lock().expect("current_session lock").clone();
            if current.as_deref() == Some(session_id.as_str()) {
                let _ = event_tx.send(ClientEvent::Data(bytes));
            }
        }
        Frame::SessionList(entries) => {
            if *awaiting_create {
                if let Some(created) =
                    entries.iter().find(|e| e.connected && !known_session_ids.contains(&e.id))
                {
                    *current_session.lock().expect("current_session lock") = Some(created.id.clone());
                }
                *awaiting_create = false;
            }
            known_session_ids.clear();
            known_session_ids.extend(entries.iter().map(|e| e.id.clone()));
            let _ = event_tx.send(ClientEvent::Sessions(entries));
        }
        Frame::Error(p) => {
            if p.code == "AUTH_FAILED" || p.code == "AUTH_TIMEOUT" || p.code == "AUTH_REQUIRED" {
                let _ = event_tx.send(ClientEvent::ServerError { code: p.code, message: p.message });
                return false;
            }
            let _ = event_tx.send(ClientEvent::ServerError { code: p.code, message: p.message });
        }
        Frame::Pong => {
            let latency_ms = ping_sent_at
                .take()
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);
            let _ = event_tx.send(ClientEvent::Pong { latency_ms });
        }
        // A well-behaved server never sends these to a client.
        Frame::Resize(_)
        | Frame::Ping
        | Frame::SessionControl(_)
        | Frame::Auth(_)
        | Frame::FileRead(_)
        | Frame::FileWrite(_) => {}
        Frame::FileContent(p) => {
            let _ = event_tx.send(ClientEvent::FileContent {
                path: p.path,
                content: p.content,
                language: p.language,
            });
        }
        Frame::FileList(p) => {
            let _ = event_tx.send(ClientEvent::FileList { path: p.path, files: p.files });
        }
    }
    true
}

async fn send_frame(
    write: &mut (impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin),
    frame: &Frame,
) -> Result<(), tungstenite::Error> {
    let bytes = protocol::encode(frame);
    write.send(tungstenite::Message::Binary(bytes)).await
}

/// Records the session id an attach/create targets, so a subsequent
/// reconnect can re-attach automatically. Called by
/// `ConnectionHandle::attach`/`create_session` callers via the exposed
/// setter, since the background task only ever learns the id back from
/// the server's `SESSION_LIST`/attach acknowledgement in a full
/// implementation the UI layer is expected to call this explicitly.
impl ConnectionHandle {
    pub fn remember_session(&self, session_id: impl Into<String>) {
        *self.current_session.lock().expect("current_session lock") = Some(session_id.into());
    }

    pub fn forget_session(&self) {
        *self.current_session.lock().expect("current_session lock") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_delay(0) >= BACKOFF_BASE);
        assert!(backoff_delay(0) < Duration::from_secs(2));
        assert!(backoff_delay(10) <= BACKOFF_CAP);
        assert!(backoff_delay(20) <= BACKOFF_CAP);
    }
}
