//! Cryptographic layer for the tunnel.
//!
//! This module provides:
//! - AES-128-GCM two-stage segment framing (sealed length, then body)
//! - Time-bucketed session key schedule (HMAC-SHA256 over a PSK)
//! - Nonce replay cache, valid for one key epoch
//! - Secure random generation for nonces and logical ids

mod aead;
mod keys;
mod nonce;

pub use aead::{random_nonce, seal, segment_size, session_cipher, SegmentDecoder};
pub use keys::{EpochTime, KeySchedule, KEY_EPOCH, SESSION_KEY_LEN};
pub use nonce::NonceCache;

use thiserror::Error;

/// Nonce length of AES-GCM.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag length of AES-128-GCM.
pub const TAG_SIZE: usize = 16;

/// Sealed segment header: nonce, then the sealed 2-byte plaintext length.
pub const HEADER_SIZE: usize = NONCE_SIZE + TAG_SIZE + 2;

/// Total cipher overhead of one segment (header plus the body tag).
pub const OVERHEAD_SIZE: usize = HEADER_SIZE + TAG_SIZE;

/// Cryptographic errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    /// A decoded length does not match the remaining body.
    #[error("invalid segment size")]
    InvalidSize,

    /// Nonce replayed within the current key epoch, or rejected by the
    /// verifier.
    #[error("invalid nonce")]
    InvalidNonce,

    /// Tag mismatch or key derivation failure.
    #[error("cipher failure")]
    CipherFailure,
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CipherError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| CipherError::CipherFailure)
}
