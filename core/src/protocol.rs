//! Binary message framing: `byte 0` is the frame kind, `byte 1+` is the
//! payload. No outer length prefix — the WebSocket message boundary
//! already delimits the frame. Decode never panics on short or garbage
//! input: it returns a `PARSE_ERROR`.

use serde::{Deserialize, Serialize};

use crate::error::{CcrError, Result};

macro_rules! kind_consts {
    ($($name:ident = $val:expr),* $(,)?) => {
        $(pub const $name: u8 = $val;)*
    };
}

kind_consts! {
    KIND_TERMINAL_DATA = 0x00,
    KIND_RESIZE = 0x01,
    KIND_PING = 0x02,
    KIND_PONG = 0x03,
    KIND_SESSION_CONTROL = 0x04,
    KIND_AUTH = 0x05,
    KIND_ERROR = 0x06,
    KIND_SESSION_LIST = 0x07,
    KIND_AUTH_OK = 0x08,
    KIND_SESSION_OUTPUT = 0x09,
    KIND_FILE_LIST = 0x0a,
    KIND_FILE_READ = 0x0b,
    KIND_FILE_CONTENT = 0x0c,
    KIND_FILE_WRITE = 0x0d,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizePayload {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionControlPayload {
    pub action: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOkPayload {
    pub status: String,
}

impl Default for AuthOkPayload {
    fn default() -> Self {
        Self { status: "ok".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListEntry {
    pub id: String,
    pub name: String,
    pub cwd: String,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "lastActivity")]
    pub last_activity: u64,
    pub connected: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEntryType {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileEntryType,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListPayload {
    pub path: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReadPayload {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContentPayload {
    pub path: String,
    pub content: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWritePayload {
    pub path: String,
    pub content: String,
}

/// One decoded wire frame.
#[derive(Debug, Clone)]
pub enum Frame {
    TerminalData(Vec<u8>),
    Resize(ResizePayload),
    Ping,
    Pong,
    SessionControl(SessionControlPayload),
    Auth(AuthPayload),
    Error(ErrorPayload),
    SessionList(Vec<SessionListEntry>),
    AuthOk,
    SessionOutput { session_id: String, bytes: Vec<u8> },
    FileList(FileListPayload),
    FileRead(FileReadPayload),
    FileContent(FileContentPayload),
    FileWrite(FileWritePayload),
}

impl Frame {
    pub fn kind(&self) -> u8 {
        match self {
            Frame::TerminalData(_) => KIND_TERMINAL_DATA,
            Frame::Resize(_) => KIND_RESIZE,
            Frame::Ping => KIND_PING,
            Frame::Pong => KIND_PONG,
            Frame::SessionControl(_) => KIND_SESSION_CONTROL,
            Frame::Auth(_) => KIND_AUTH,
            Frame::Error(_) => KIND_ERROR,
            Frame::SessionList(_) => KIND_SESSION_LIST,
            Frame::AuthOk => KIND_AUTH_OK,
            Frame::SessionOutput { .. } => KIND_SESSION_OUTPUT,
            Frame::FileList(_) => KIND_FILE_LIST,
            Frame::FileRead(_) => KIND_FILE_READ,
            Frame::FileContent(_) => KIND_FILE_CONTENT,
            Frame::FileWrite(_) => KIND_FILE_WRITE,
        }
    }
}

/// Encode a frame to its wire representation: kind byte + payload.
pub fn encode(frame: &Frame) -> Vec<u8> {
    let kind = frame.kind();
    let mut out = Vec::with_capacity(1);
    out.push(kind);
    match frame {
        Frame::TerminalData(bytes) => out.extend_from_slice(bytes),
        Frame::Resize(p) => out.extend_from_slice(&serde_json::to_vec(p).unwrap_or_default()),
        Frame::Ping | Frame::Pong => {}
        Frame::SessionControl(p) => out.extend_from_slice(&serde_json::to_vec(p).unwrap_or_default()),
        Frame::Auth(p) => out.extend_from_slice(&serde_json::to_vec(p).unwrap_or_default()),
        Frame::Error(p) => out.extend_from_slice(&serde_json::to_vec(p).unwrap_or_default()),
        Frame::SessionList(p) => out.extend_from_slice(&serde_json::to_vec(p).unwrap_or_default()),
        Frame::AuthOk => {
            out.extend_from_slice(&serde_json::to_vec(&AuthOkPayload::default()).unwrap_or_default())
        }
        Frame::SessionOutput { session_id, bytes } => {
            let id_bytes = session_id.as_bytes();
            out.extend_from_slice(&(id_bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(id_bytes);
            out.extend_from_slice(bytes);
        }
        Frame::FileList(p) => out.extend_from_slice(&serde_json::to_vec(p).unwrap_or_default()),
        Frame::FileRead(p) => out.extend_from_slice(&serde_json::to_vec(p).unwrap_or_default()),
        Frame::FileContent(p) => out.extend_from_slice(&serde_json::to_vec(p).unwrap_or_default()),
        Frame::FileWrite(p) => out.extend_from_slice(&serde_json::to_vec(p).unwrap_or_default()),
    }
    out
}

/// Decode a frame from wire bytes. Never panics: malformed or truncated
/// input yields a `PARSE_ERROR` (`CcrError::ParseError`).
pub fn decode(data: &[u8]) -> Result<Frame> {
    let (&kind, payload) = data
        .split_first()
        .ok_or_else(|| CcrError::ParseError("empty frame".to_string()))?;
    match kind {
        KIND_TERMINAL_DATA => Ok(Frame::TerminalData(payload.to_vec())),
        KIND_RESIZE => Ok(Frame::Resize(parse_json(payload)?)),
        KIND_PING => Ok(Frame::Ping),
        KIND_PONG => Ok(Frame::Pong),
        KIND_SESSION_CONTROL => Ok(Frame::SessionControl(parse_json(payload)?)),
        KIND_AUTH => Ok(Frame::Auth(parse_json(payload)?)),
        KIND_ERROR => Ok(Frame::Error(parse_json(payload)?)),
        KIND_SESSION_LIST => Ok(Frame::SessionList(parse_json(payload)?)),
        KIND_AUTH_OK => Ok(Frame::AuthOk),
        KIND_SESSION_OUTPUT => {
            let (session_id, bytes) = decode_session_output_payload(payload)?;
            Ok(Frame::SessionOutput { session_id, bytes })
        }
        KIND_FILE_LIST => Ok(Frame::FileList(parse_json(payload)?)),
        KIND_FILE_READ => Ok(Frame::FileRead(parse_json(payload)?)),
        KIND_FILE_CONTENT => Ok(Frame::FileContent(parse_json(payload)?)),
        KIND_FILE_WRITE => Ok(Frame::FileWrite(parse_json(payload)?)),
        other => Err(CcrError::ParseError(format!("unknown frame kind 0x{other:02x}"))),
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| CcrError::ParseError(e.to_string()))
}

/// Encode just the `SESSION_OUTPUT` payload (id length prefix + id + raw
/// bytes), without the leading kind byte. Exposed so callers building a
/// `SESSION_OUTPUT` frame directly from a session's output stream don't
/// need to round-trip through `Frame`.
pub fn encode_session_output(session_id: &str, bytes: &[u8]) -> Vec<u8> {
    encode(&Frame::SessionOutput {
        session_id: session_id.to_string(),
        bytes: bytes.to_vec(),
    })
}

fn decode_session_output_payload(payload: &[u8]) -> Result<(String, Vec<u8>)> {
    if payload.len() < 4 {
        return Err(CcrError::ParseError("SESSION_OUTPUT too short for id length".to_string()));
    }
    let id_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let rest = &payload[4..];
    if rest.len() < id_len {
        return Err(CcrError::ParseError("SESSION_OUTPUT id length exceeds payload".to_string()));
    }
    let (id_bytes, data) = rest.split_at(id_len);
    let session_id = String::from_utf8(id_bytes.to_vec())
        .map_err(|e| CcrError::ParseError(e.to_string()))?;
    Ok((session_id, data.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_data_round_trips() {
        let frame = Frame::TerminalData(b"hello\xff\x00world".to_vec());
        let encoded = encode(&frame);
        match decode(&encoded).unwrap() {
            Frame::TerminalData(b) => assert_eq!(b, b"hello\xff\x00world"),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn ping_pong_round_trip_empty_payload() {
        assert_eq!(encode(&Frame::Ping), vec![KIND_PING]);
        assert!(matches!(decode(&[KIND_PONG]).unwrap(), Frame::Pong));
    }

    #[test]
    fn session_output_demultiplexes() {
        let id = "abcd1234";
        let bytes = b"child output\n".to_vec();
        let encoded = encode_session_output(id, &bytes);
        match decode(&encoded).unwrap() {
            Frame::SessionOutput { session_id, bytes: out } => {
                assert_eq!(session_id, id);
                assert_eq!(out, bytes);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn session_control_round_trips() {
        let frame = Frame::SessionControl(SessionControlPayload {
            action: "attach".to_string(),
            session_id: Some("abcd1234".to_string()),
            name: None,
            cwd: None,
            cols: None,
            rows: None,
        });
        let encoded = encode(&frame);
        match decode(&encoded).unwrap() {
            Frame::SessionControl(p) => {
                assert_eq!(p.action, "attach");
                assert_eq!(p.session_id.as_deref(), Some("abcd1234"));
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn decode_never_panics_on_garbage() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0xff]).is_err());
        assert!(decode(&[KIND_RESIZE, b'{', b'x']).is_err());
        assert!(decode(&[KIND_SESSION_OUTPUT, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn auth_ok_round_trips() {
        let encoded = encode(&Frame::AuthOk);
        assert!(matches!(decode(&encoded).unwrap(), Frame::AuthOk));
    }
}
