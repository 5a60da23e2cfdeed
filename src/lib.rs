//! # Burrow
//!
//! A SOCKS5 tunnel that multiplexes many logical TCP/UDP connections over
//! ordinary HTTP(S) POST transactions, for networks that only let plain
//! HTTP through to a chosen host.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                SOCKS5 Front-end (client)             │
//! ├─────────────────────────────────────────────────────┤
//! │            Retrievers / Sessions (state)             │
//! │     per-logical-connection read & write epochs       │
//! ├─────────────────────────────────────────────────────┤
//! │             Wire Protocol + Dispatcher               │
//! │        (Dial, Retrieve, Resume, Send, Close)         │
//! ├─────────────────────────────────────────────────────┤
//! │               AEAD Framing (AES-128-GCM)             │
//! │       time-bucketed key schedule, replay cache       │
//! ├─────────────────────────────────────────────────────┤
//! │            HTTP Transport (POST + chunked)           │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod buf;
pub mod client;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;

/// Crate version, reported at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One HTTP turn body never exceeds this (64 KiB - 1, so every length
/// fits a u16 on the wire).
pub const MAX_REQUEST_BODY_SIZE: usize = 64 * 1024 - 1;

/// Largest plaintext that fits one encrypted turn.
pub const MAX_REQUEST_PAYLOAD_SIZE: usize = MAX_REQUEST_BODY_SIZE - crypto::OVERHEAD_SIZE;

/// Largest per-sub-response payload the server will produce, leaving room
/// for the cipher overhead and the largest possible message header.
pub const MAX_RESPOND_DATA_SIZE: usize =
    MAX_REQUEST_BODY_SIZE - (crypto::OVERHEAD_SIZE + protocol::GREATEST_HEADER_SIZE);
