//! Shared broker logic: PTY sessions, registry, wire protocol, auth, and
//! sandboxed file I/O. No networking lives here — `ccr-server` and
//! `ccr-client` both depend on this crate for the pieces that must agree
//! byte-for-byte across the wire.

pub mod auth;
pub mod config;
pub mod error;
pub mod file_handler;
pub mod protocol;
pub mod pty_session;
pub mod rate_limiter;
pub mod ring_buffer;
pub mod session_manager;

pub use error::{CcrError, Result};
