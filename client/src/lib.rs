//! Reconnecting WebSocket client for the CCR broker. Binary-framed,
//! single-socket, with automatic backoff-and-retry reconnection and an
//! event stream surfaced to callers — a textual UI, a raw stdin/stdout
//! relay (see `relay`), or a browser bridge.

pub mod connection;
pub mod relay;

pub use connection::{connect, ClientEvent, Command, ConnectOptions, ConnectionHandle, ConnectionState};
