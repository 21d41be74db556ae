//! Supervises one child process, owns its ring buffer and activity
//! clock. Built on `portable_pty`: a blocking reader thread pushes bytes
//! into the scrollback and fans them out to subscribers; a dedicated
//! thread serializes resize `ioctl` calls; a poller thread detects
//! process exit.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{self, Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use tokio::sync::broadcast;

use crate::ring_buffer::{RingBuffer, DEFAULT_MAX_BYTES};

/// `lastActivity` idle threshold before `is_idle()` reports true
/// (default 30 min).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Live output broadcast capacity (messages buffered per subscriber
/// before a slow reader starts missing live frames; the scrollback
/// ring buffer remains the lossless-within-cap source of truth).
pub const LIVE_BROADCAST_CAP: usize = 256;

/// Options for spawning a session's child process.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    /// Overrides the resolved child binary (e.g. from `SESSION_CONTROL
    /// create`'s future extensions); `None` uses `resolve_child_command`.
    pub command_override: Option<String>,
}

impl SpawnOptions {
    pub fn new(cwd: Option<PathBuf>, cols: u16, rows: u16) -> Self {
        Self {
            cwd,
            cols: if cols == 0 { DEFAULT_COLS } else { cols },
            rows: if rows == 0 { DEFAULT_ROWS } else { rows },
            command_override: None,
        }
    }
}

/// Exit notification payload, emitted once per session.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub code: Option<u32>,
}

/// Candidate install locations checked before falling back to a `PATH`
/// lookup of the configured/default child binary name. One configurable
/// child binary, resolved once at spawn time.
#[cfg(unix)]
const CANDIDATE_DIRS: &[&str] = &["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin"];

/// Name of the child binary to launch. Overridable via `CCR_CHILD_COMMAND`;
/// falls back to the user's login shell.
fn default_child_name() -> String {
    std::env::var("CCR_CHILD_COMMAND").unwrap_or_else(|_| {
        std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())
    })
}

/// Resolve the child binary: check a short platform candidate list,
/// then fall back to a bare name resolved via `PATH` by the shell spawn
/// itself. Returns the resolved path/name to exec.
#[cfg(unix)]
fn resolve_child_binary(name: &str) -> String {
    if name.contains('/') {
        return name.to_string();
    }
    for dir in CANDIDATE_DIRS {
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            return candidate.to_string_lossy().into_owned();
        }
    }
    name.to_string()
}

#[cfg(windows)]
fn resolve_child_binary(name: &str) -> String {
    name.to_string()
}

/// Builds the command to spawn in the PTY. If `cwd` is given, wraps in
/// a login shell that `cd`s there then execs the resolved binary.
/// `TERM`/`COLORTERM` are kept verbatim from the parent environment.
fn build_command(name: &str, cwd: Option<&Path>) -> CommandBuilder {
    let resolved = resolve_child_binary(name);
    #[cfg(unix)]
    {
        if let Some(dir) = cwd {
            let path = dir.to_string_lossy();
            let escaped = path.replace('\'', "'\"'\"'");
            let line = format!("cd '{escaped}' && exec {resolved}");
            let mut wrap = CommandBuilder::new("bash");
            wrap.arg("-c");
            wrap.arg(line);
            wrap.env("TERM", "xterm-256color");
            wrap.env("COLORTERM", "truecolor");
            return wrap;
        }
        let mut c = CommandBuilder::new(resolved);
        c.env("TERM", "xterm-256color");
        c.env("COLORTERM", "truecolor");
        c
    }
    #[cfg(windows)]
    {
        let _ = cwd;
        let mut c = CommandBuilder::new(resolved);
        c.env("TERM", "xterm-256color");
        c.env("COLORTERM", "truecolor");
        c
    }
}

/// One supervised child process plus its scrollback and activity clock.
/// The session is the unit of serialization: all mutation of its
/// scrollback and activity clock happens via the single reader thread
/// that consumes the child's PTY output.
pub struct PtySession {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    resize_tx: sync::mpsc::Sender<(u16, u16)>,
    scrollback: Arc<Mutex<RingBuffer>>,
    live_tx: broadcast::Sender<Bytes>,
    exit_tx: broadcast::Sender<ExitInfo>,
    last_activity: Arc<Mutex<Instant>>,
    last_activity_unix: Arc<Mutex<u64>>,
    created_at_unix: u64,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl PtySession {
    /// Spawn the child in a PTY and start its reader/resize/poll
    /// threads. `pid` reflects the OS process id when the platform
    /// exposes it.
    pub fn spawn(opts: SpawnOptions) -> std::io::Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(to_io_error)?;

        let name = opts.command_override.unwrap_or_else(default_child_name);
        let cmd = build_command(&name, opts.cwd.as_deref());
        let child = pair.slave.spawn_command(cmd).map_err(to_io_error)?;
        let pid = child.process_id();

        let mut reader = pair.master.try_clone_reader().map_err(to_io_error)?;
        let writer = pair.master.take_writer().map_err(to_io_error)?;
        let master = pair.master;

        let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
        let (live_tx, _) = broadcast::channel::<Bytes>(LIVE_BROADCAST_CAP);
        let (exit_tx, _) = broadcast::channel::<ExitInfo>(1);

        let scrollback = Arc::new(Mutex::new(RingBuffer::new(DEFAULT_MAX_BYTES)));
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let last_activity_unix = Arc::new(Mutex::new(unix_now_secs()));
        let created_at_unix = unix_now_secs();
        let exited = Arc::new(AtomicBool::new(false));
        let child = Arc::new(Mutex::new(child));

        // Blocking thread: read PTY stdout, push into scrollback, fan out live.
        {
            let scrollback = Arc::clone(&scrollback);
            let last_activity = Arc::clone(&last_activity);
            let last_activity_unix = Arc::clone(&last_activity_unix);
            let live_tx = live_tx.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = &buf[..n];
                            // Push and broadcast under the same lock so a
                            // `subscribe_with_scrollback` snapshot can never
                            // land between the two and see a chunk twice
                            // (once in the snapshot, once live) or miss it.
                            if let Ok(mut sb) = scrollback.lock() {
                                sb.push(chunk);
                                let _ = live_tx.send(Bytes::copy_from_slice(chunk));
                            }
                            if let Ok(mut t) = last_activity.lock() {
                                *t = Instant::now();
                            }
                            if let Ok(mut t) = last_activity_unix.lock() {
                                *t = unix_now_secs();
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        // Dedicated thread: serialize ioctl resize calls onto one thread.
        std::thread::spawn(move || {
            while let Ok((cols, rows)) = resize_rx.recv() {
                let size = PtySize {
                    cols,
                    rows,
                    pixel_width: 0,
                    pixel_height: 0,
                };
                let _ = master.resize(size);
            }
        });

        // Poll child.try_wait(); publish exit once via exit_tx.
        {
            let child_poll = Arc::clone(&child);
            let exited = Arc::clone(&exited);
            let exit_tx = exit_tx.clone();
            std::thread::spawn(move || loop {
                let status = {
                    let mut guard = match child_poll.lock() {
                        Ok(g) => g,
                        Err(_) => break,
                    };
                    match guard.try_wait() {
                        Ok(None) => None,
                        Ok(Some(s)) => Some(s.exit_code()),
                        Err(_) => break,
                    }
                };
                if let Some(code) = status {
                    exited.store(true, Ordering::SeqCst);
                    let _ = exit_tx.send(ExitInfo { code: Some(code) });
                    break;
                }
                std::thread::sleep(Duration::from_millis(500));
            });
        }

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            child,
            resize_tx,
            scrollback,
            live_tx,
            exit_tx,
            last_activity,
            last_activity_unix,
            created_at_unix,
            exited,
            pid,
        })
    }

    /// Forwards bytes to the PTY master if the child hasn't exited;
    /// updates `lastActivity`.
    pub fn write(&self, bytes: &[u8]) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut w) = self.writer.lock() {
            let _ = w.write_all(bytes);
            let _ = w.flush();
        }
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Instant::now();
        }
        if let Ok(mut t) = self.last_activity_unix.lock() {
            *t = unix_now_secs();
        }
    }

    pub fn created_at_unix(&self) -> u64 {
        self.created_at_unix
    }

    pub fn last_activity_unix(&self) -> u64 {
        self.last_activity_unix.lock().map(|t| *t).unwrap_or(0)
    }

    /// Forwards a resize (WINCH) request; a no-op once exited.
    pub fn resize(&self, cols: u16, rows: u16) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.resize_tx.send((cols, rows));
    }

    /// Concatenated scrollback ring buffer contents.
    pub fn get_scrollback(&self) -> Vec<u8> {
        self.scrollback
            .lock()
            .map(|sb| sb.get_all())
            .unwrap_or_default()
    }

    /// `now - lastActivity > idle_timeout`.
    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.last_activity
            .lock()
            .map(|t| t.elapsed() > idle_timeout)
            .unwrap_or(false)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Snapshots scrollback and subscribes to live output atomically, so
    /// the caller can replay the snapshot then forward the live stream
    /// with neither a gap nor an overlap: the reader thread pushes into
    /// scrollback and broadcasts under the same lock this holds.
    pub fn subscribe_with_scrollback(&self) -> (Vec<u8>, broadcast::Receiver<Bytes>) {
        let sb = self.scrollback.lock().expect("scrollback mutex");
        (sb.get_all(), self.live_tx.subscribe())
    }

    /// Subscribe to this session's (single) exit notification.
    pub fn subscribe_exit(&self) -> broadcast::Receiver<ExitInfo> {
        self.exit_tx.subscribe()
    }

    /// Terminates the child if running, clears the scrollback, and lets
    /// any live subscribers' channels close naturally once this session
    /// is dropped from the registry.
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            let _ = guard.kill();
        }
        self.exited.store(true, Ordering::SeqCst);
        if let Ok(mut sb) = self.scrollback.lock() {
            sb.clear();
        }
    }
}

fn to_io_error(e: impl std::error::Error + Send + Sync + 'static) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_options_apply_defaults() {
        let opts = SpawnOptions::new(None, 0, 0);
        assert_eq!(opts.cols, DEFAULT_COLS);
        assert_eq!(opts.rows, DEFAULT_ROWS);
    }

    #[cfg(unix)]
    #[test]
    fn can_spawn_and_write_and_kill() {
        let mut opts = SpawnOptions::new(None, 80, 24);
        opts.command_override = Some("cat".to_string());
        let session = PtySession::spawn(opts).expect("spawn cat");
        session.write(b"hi\n");
        std::thread::sleep(Duration::from_millis(200));
        assert!(!session.get_scrollback().is_empty());
        assert!(!session.is_idle(Duration::from_secs(60)));
        session.kill();
        assert!(session.has_exited());
    }
}
