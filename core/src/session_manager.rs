//! Registry of sessions, single-attacher invariant, idle reaper. A
//! `DashMap<SessionId, SessionContext>` keyed registry with an
//! attach/detach subscription-swap invariant: at most one forwarding
//! task drains a session's output at any instant.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::pty_session::{PtySession, SpawnOptions, DEFAULT_IDLE_TIMEOUT};

/// 8-character lowercase-hex opaque session id. Not a UUID — short and
/// easy to type over a terminal relay, with enough of the 32-bit space
/// that collisions are a non-issue at this scale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    fn random() -> Self {
        let mut bytes = [0u8; 4];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses an externally-supplied id string, rejecting anything that
    /// isn't 8 lowercase hex characters (defends the registry lookup
    /// from arbitrary client-supplied strings).
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 8 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options accepted by `SESSION_CONTROL create` / `create_session`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

/// A snapshot entry for `listSessions()` / the `SESSION_LIST` wire frame.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub name: String,
    pub cwd: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub connected: bool,
    pub pid: Option<u32>,
}

struct SessionEntry {
    session: Arc<PtySession>,
    name: String,
    cwd: PathBuf,
    /// The forwarding task that drains `session.subscribe_with_scrollback()`
    /// into the attached client's channel. `None` means no attached client.
    /// Swapped atomically on every attach so exactly one subscription
    /// exists per session at any instant.
    attached: Mutex<Option<AbortHandle>>,
}

/// Registry of sessions. The only shared mutable structure crossing
/// sessions; `DashMap` gives lock-free reads and per-entry locking on
/// write.
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionEntry>,
    sandbox_base: PathBuf,
}

impl SessionManager {
    pub fn new(sandbox_base: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            sandbox_base,
        })
    }

    /// The sandbox directory root for this session, `<base>/sessions/<id>/`.
    pub fn sandbox_dir(&self, id: &SessionId) -> PathBuf {
        self.sandbox_base.join("sessions").join(id.as_str())
    }

    /// Generates a fresh id, mkdirs the sandbox, spawns the child PTY,
    /// and records an entry with no attached client. Spawns a task that
    /// removes the entry once the session's child exits.
    pub fn create_session(
        self: &Arc<Self>,
        opts: CreateOptions,
    ) -> std::io::Result<SessionSnapshot> {
        let id = self.fresh_id();
        let sandbox_dir = self.sandbox_dir(&id);
        std::fs::create_dir_all(&sandbox_dir)?;

        let cwd = opts.cwd.clone().unwrap_or_else(|| sandbox_dir.clone());
        let spawn_opts = SpawnOptions::new(Some(cwd.clone()), opts.cols, opts.rows);
        let session = Arc::new(PtySession::spawn(spawn_opts)?);

        let name = opts.name.unwrap_or_else(|| format!("session-{id}"));
        let pid = session.pid();
        let created_at = session.created_at_unix();

        let entry = SessionEntry {
            session: Arc::clone(&session),
            name: name.clone(),
            cwd: cwd.clone(),
            attached: Mutex::new(None),
        };
        self.sessions.insert(id.clone(), entry);

        // Exit event subscription: removes the entry immediately once the
        // child exits, ties session death directly to child exit with no
        // grace window.
        {
            let manager = Arc::clone(self);
            let id = id.clone();
            let mut exit_rx = session.subscribe_exit();
            tokio::spawn(async move {
                if exit_rx.recv().await.is_ok() {
                    manager.sessions.remove(&id);
                    tracing::info!(session_id = %id, "session exited, removed from registry");
                }
            });
        }

        Ok(SessionSnapshot {
            id,
            name,
            cwd: cwd.to_string_lossy().into_owned(),
            created_at,
            last_activity: created_at,
            connected: false,
            pid,
        })
    }

    fn fresh_id(&self) -> SessionId {
        loop {
            let id = SessionId::random();
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn get_session(&self, id: &SessionId) -> Option<Arc<PtySession>> {
        self.sessions.get(id).map(|e| Arc::clone(&e.session))
    }

    pub fn get_cwd(&self, id: &SessionId) -> Option<PathBuf> {
        self.sessions.get(id).map(|e| e.cwd.clone())
    }

    /// If the session is already attached, its previous data
    /// subscription is removed first (enforced here, not by caller
    /// convention). Returns `None` iff `id` is unknown; otherwise the
    /// scrollback snapshot taken atomically with the new subscription —
    /// the caller must replay it before forwarding anything read from
    /// `output_tx`, and no chunk can appear in both.
    pub fn attach_client(
        &self,
        id: &SessionId,
        output_tx: mpsc::UnboundedSender<Bytes>,
    ) -> Option<Vec<u8>> {
        let entry = self.sessions.get(id)?;
        let (scrollback, mut rx) = entry.session.subscribe_with_scrollback();
        let task = tokio::spawn(async move {
            while let Ok(bytes) = rx.recv().await {
                if output_tx.send(bytes).is_err() {
                    break;
                }
            }
        });
        let mut guard = entry.attached.lock().expect("attach mutex");
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(task.abort_handle());
        Some(scrollback)
    }

    /// Removes the current subscription and clears the attached socket
    /// marker. Idempotent.
    pub fn detach_client(&self, id: &SessionId) {
        if let Some(entry) = self.sessions.get(id) {
            if let Ok(mut guard) = entry.attached.lock() {
                if let Some(old) = guard.take() {
                    old.abort();
                }
            }
        }
    }

    pub fn is_attached(&self, id: &SessionId) -> bool {
        self.sessions
            .get(id)
            .map(|e| e.attached.lock().map(|g| g.is_some()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Fresh snapshot where each entry carries the current attachment
    /// flag.
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| {
                let id = entry.key().clone();
                let e = entry.value();
                SessionSnapshot {
                    id,
                    name: e.name.clone(),
                    cwd: e.cwd.to_string_lossy().into_owned(),
                    created_at: e.session.created_at_unix(),
                    last_activity: e.session.last_activity_unix(),
                    connected: e.attached.lock().map(|g| g.is_some()).unwrap_or(false),
                    pid: e.session.pid(),
                }
            })
            .collect()
    }

    /// Kills the child and removes the entry. Returns `false` iff `id`
    /// is unknown.
    pub fn destroy_session(&self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some((_, entry)) => {
                entry.session.kill();
                true
            }
            None => false,
        }
    }

    /// For each entry whose attached socket is null and whose session
    /// `isIdle()`, kill the child and remove the entry. Returns the
    /// count cleaned.
    pub fn cleanup_idle_sessions(&self) -> usize {
        self.cleanup_idle_sessions_with_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn cleanup_idle_sessions_with_timeout(&self, idle_timeout: Duration) -> usize {
        let idle_ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let attached = entry.attached.lock().map(|g| g.is_some()).unwrap_or(false);
                !attached && entry.session.is_idle(idle_timeout)
            })
            .map(|entry| entry.key().clone())
            .collect();
        let mut count = 0;
        for id in idle_ids {
            if self.destroy_session(&id) {
                count += 1;
                tracing::info!(session_id = %id, "reaped idle session");
            }
        }
        count
    }

    /// Kills every session (server shutdown).
    pub fn destroy_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.destroy_session(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_parse_rejects_non_hex() {
        assert!(SessionId::parse("abcd1234").is_some());
        assert!(SessionId::parse("ABCD1234").is_none());
        assert!(SessionId::parse("short").is_none());
        assert!(SessionId::parse("../../etc").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn create_attach_detach_destroy_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path().to_path_buf());
        let mut opts = CreateOptions::default();
        opts.cols = 80;
        opts.rows = 24;
        let snapshot = manager.create_session(opts).unwrap();
        assert_eq!(snapshot.id.as_str().len(), 8);
        assert!(!manager.is_attached(&snapshot.id));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(manager.attach_client(&snapshot.id, tx).is_some());
        assert!(manager.is_attached(&snapshot.id));

        manager.detach_client(&snapshot.id);
        assert!(!manager.is_attached(&snapshot.id));

        assert!(manager.destroy_session(&snapshot.id));
        assert!(manager.get_session(&snapshot.id).is_none());
        assert!(!manager.destroy_session(&snapshot.id));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn idle_reaper_removes_unattached_idle_sessions_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path().to_path_buf());
        let idle = manager.create_session(CreateOptions::default()).unwrap();
        let attached = manager.create_session(CreateOptions::default()).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(manager.attach_client(&attached.id, tx).is_some());

        // Both sessions are fresh, so a near-zero timeout marks either as
        // idle; only the unattached one should be reaped.
        let cleaned = manager.cleanup_idle_sessions_with_timeout(Duration::from_millis(0));
        assert_eq!(cleaned, 1);
        assert!(manager.get_session(&idle.id).is_none());
        assert!(manager.get_session(&attached.id).is_some());

        // A subsequent attach to the reaped id fails (SESSION_NOT_FOUND).
        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(manager.attach_client(&idle.id, tx2).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn attach_swaps_previous_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path().to_path_buf());
        let snapshot = manager.create_session(CreateOptions::default()).unwrap();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        manager.attach_client(&snapshot.id, tx1);
        manager.attach_client(&snapshot.id, tx2);

        if let Some(session) = manager.get_session(&snapshot.id) {
            session.write(b"echo hi\n");
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(rx1.try_recv().is_err());
    }
}
