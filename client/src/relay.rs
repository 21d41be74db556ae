//! Puts the local terminal into raw mode, pipes stdin -> `sendInput` and
//! `data` events -> stdout, forwards terminal resizes via `sendResize`,
//! and overlays a tmux-style prefix-key command layer on top of this
//! crate's own `Connection` event surface. Raw-mode handling uses
//! `crossterm`.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::connection::{ClientEvent, ConnectionHandle};

/// Literal Ctrl+B byte that opens the prefix-command window.
const PREFIX_BYTE: u8 = 0x02;
/// How long the window stays open waiting for a command byte.
const PREFIX_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
enum Mode {
    Normal,
    AwaitingCommand(Instant),
}

/// A decoded prefix-key command.
#[derive(Debug, Clone)]
enum RelayCommand {
    Create,
    Next,
    Prev,
    List,
    Detach,
    Help,
    SwitchIndex(u8),
}

fn interpret_command(byte: u8) -> Option<RelayCommand> {
    match byte {
        b'c' => Some(RelayCommand::Create),
        b'n' => Some(RelayCommand::Next),
        b'p' => Some(RelayCommand::Prev),
        b'l' => Some(RelayCommand::List),
        b'd' => Some(RelayCommand::Detach),
        b'?' => Some(RelayCommand::Help),
        b'0'..=b'9' => Some(RelayCommand::SwitchIndex(byte - b'0')),
        _ => None,
    }
}

/// Scans one chunk of raw stdin bytes against the prefix-key state
/// machine. Bytes preceding a literal `Ctrl+B` are forwarded as data;
/// the byte immediately following it is consumed as a command (or, if
/// it is itself `Ctrl+B`, forwarded literally); everything after that
/// resumes normal forwarding — handled positionally within a single
/// chunk.
fn process_input(data: &[u8], mode: &mut Mode) -> (Vec<u8>, Vec<RelayCommand>) {
    let mut forward = Vec::with_capacity(data.len());
    let mut commands = Vec::new();
    let mut i = 0;

    while i < data.len() {
        match *mode {
            Mode::Normal => match data[i..].iter().position(|&b| b == PREFIX_BYTE) {
                Some(pos) => {
                    forward.extend_from_slice(&data[i..i + pos]);
                    i += pos + 1;
                    *mode = Mode::AwaitingCommand(Instant::now() + PREFIX_WINDOW);
                }
                None => {
                    forward.extend_from_slice(&data[i..]);
                    i = data.len();
                }
            },
            Mode::AwaitingCommand(deadline) => {
                if Instant::now() > deadline {
                    *mode = Mode::Normal;
                    continue;
                }
                let byte = data[i];
                i += 1;
                *mode = Mode::Normal;
                match interpret_command(byte) {
                    Some(cmd) => commands.push(cmd),
                    None if byte == PREFIX_BYTE => forward.push(PREFIX_BYTE),
                    None => {}
                }
            }
        }
    }
    (forward, commands)
}

const HELP_TEXT: &str = "\r\nccr prefix commands (Ctrl+B then):\r\n  c  create session\r\n  n/p  next/previous session\r\n  l  list sessions\r\n  d  detach\r\n  0-9  switch to session by index\r\n  ?  this help\r\n";

/// Why the relay stopped — lets `main` pick the process exit code
/// (0 normal, 1 reconnect-exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    Normal,
    ReconnectExhausted,
}

/// Runs the stdin/stdout bridge until the connection closes or stdin
/// reaches EOF. Expects the caller to have already awaited
/// `ClientEvent::Authenticated` and issued an initial attach/create.
pub async fn run(
    handle: ConnectionHandle,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
) -> anyhow::Result<RelayExit> {
    crossterm::terminal::enable_raw_mode()?;
    let result = run_inner(&handle, &mut events).await;
    let _ = crossterm::terminal::disable_raw_mode();
    result
}

async fn run_inner(
    handle: &ConnectionHandle,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
) -> anyhow::Result<RelayExit> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 4096];
    let mut mode = Mode::Normal;
    let mut known_sessions: Vec<String> = Vec::new();
    let mut current_index: usize = 0;

    #[cfg(unix)]
    let mut resize_signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

    loop {
        tokio::select! {
            n = stdin.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    return Ok(RelayExit::Normal);
                }
                let (forward, commands) = process_input(&buf[..n], &mut mode);
                if !forward.is_empty() {
                    handle.send_input(forward);
                }
                for cmd in commands {
                    apply_command(cmd, handle, &known_sessions, &mut current_index, &mut stdout).await?;
                }
            }
            #[cfg(unix)]
            _ = resize_signal.recv() => {
                if let Ok((cols, rows)) = crossterm::terminal::size() {
                    handle.resize(cols, rows);
                }
            }
            event = events.recv() => {
                match event {
                    Some(ClientEvent::Data(bytes)) => {
                        stdout.write_all(&bytes).await?;
                        stdout.flush().await?;
                    }
                    Some(ClientEvent::Sessions(entries)) => {
                        known_sessions = entries.iter().map(|e| e.id.clone()).collect();
                    }
                    Some(ClientEvent::ServerError { code, message }) => {
                        let line = format!("\r\n[ccr error {code}] {message}\r\n");
                        stdout.write_all(line.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    Some(ClientEvent::ReconnectFailed) => return Ok(RelayExit::ReconnectExhausted),
                    None => return Ok(RelayExit::Normal),
                    Some(_) => {}
                }
            }
            _ = tokio::time::sleep(prefix_poll_interval(mode)) => {
                if let Mode::AwaitingCommand(deadline) = mode {
                    if Instant::now() > deadline {
                        mode = Mode::Normal;
                    }
                }
            }
        }
    }
}

/// A short poll interval while a prefix window is open, otherwise a long
/// sleep so the branch doesn't spin when idle.
fn prefix_poll_interval(mode: Mode) -> Duration {
    match mode {
        Mode::AwaitingCommand(_) => Duration::from_millis(100),
        Mode::Normal => Duration::from_secs(3600),
    }
}

async fn apply_command(
    cmd: RelayCommand,
    handle: &ConnectionHandle,
    known_sessions: &[String],
    current_index: &mut usize,
    stdout: &mut tokio::io::Stdout,
) -> anyhow::Result<()> {
    match cmd {
        RelayCommand::Create => handle.create_session(None, None, 80, 24),
        RelayCommand::Next => {
            if !known_sessions.is_empty() {
                *current_index = (*current_index + 1) % known_sessions.len();
                handle.attach(known_sessions[*current_index].clone());
            }
        }
        RelayCommand::Prev => {
            if !known_sessions.is_empty() {
                *current_index = (*current_index + known_sessions.len() - 1) % known_sessions.len();
                handle.attach(known_sessions[*current_index].clone());
            }
        }
        RelayCommand::SwitchIndex(idx) => {
            if let Some(id) = known_sessions.get(idx as usize) {
                *current_index = idx as usize;
                handle.attach(id.clone());
            }
        }
        RelayCommand::List => handle.list_sessions(),
        RelayCommand::Detach => handle.detach(),
        RelayCommand::Help => {
            stdout.write_all(HELP_TEXT.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_plain_bytes_unchanged() {
        let mut mode = Mode::Normal;
        let (forward, commands) = process_input(b"hello", &mut mode);
        assert_eq!(forward, b"hello");
        assert!(commands.is_empty());
    }

    #[test]
    fn prefix_then_command_splits_correctly() {
        let mut mode = Mode::Normal;
        let mut data = b"ab".to_vec();
        data.push(PREFIX_BYTE);
        data.push(b'n');
        data.extend_from_slice(b"cd");
        let (forward, commands) = process_input(&data, &mut mode);
        assert_eq!(forward, b"abcd");
        assert!(matches!(commands.as_slice(), [RelayCommand::Next]));
    }

    #[test]
    fn doubled_prefix_forwards_literal_byte() {
        let mut mode = Mode::Normal;
        let data = vec![PREFIX_BYTE, PREFIX_BYTE];
        let (forward, commands) = process_input(&data, &mut mode);
        assert_eq!(forward, vec![PREFIX_BYTE]);
        assert!(commands.is_empty());
    }

    #[test]
    fn prefix_split_across_chunks_still_consumes_command() {
        let mut mode = Mode::Normal;
        let (forward1, commands1) = process_input(&[b'x', PREFIX_BYTE], &mut mode);
        assert_eq!(forward1, b"x");
        assert!(commands1.is_empty());
        assert!(matches!(mode, Mode::AwaitingCommand(_)));

        let (forward2, commands2) = process_input(b"l", &mut mode);
        assert!(forward2.is_empty());
        assert!(matches!(commands2.as_slice(), [RelayCommand::List]));
    }
}
