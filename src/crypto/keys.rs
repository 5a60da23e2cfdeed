//! Time-bucketed session key schedule.
//!
//! Both peers derive the same 16-byte AES key from a long-lived shared
//! secret and the wall clock truncated to the key epoch, without any
//! negotiation. No clock skew window is provided: peers more than one
//! epoch apart will not interoperate.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ring::hmac;

/// How long one derived session key stays valid.
pub const KEY_EPOCH: Duration = Duration::from_secs(120);

/// Derived session key length (AES-128).
pub const SESSION_KEY_LEN: usize = 16;

/// Longest varint encoding of a 64-bit integer.
const EPOCH_BYTES: usize = 10;

/// The epoch second in its on-the-MAC encoding: a zigzag varint in a
/// fixed-size buffer. The trailing zero bytes are part of the MAC input,
/// and the whole value doubles as the replay-cache epoch tag.
pub type EpochTime = [u8; EPOCH_BYTES];

fn epoch_time(secs: i64) -> EpochTime {
    let mut out = [0u8; EPOCH_BYTES];
    let mut v = ((secs << 1) ^ (secs >> 63)) as u64;
    let mut i = 0;
    while v >= 0x80 {
        out[i] = (v as u8) | 0x80;
        v >>= 7;
        i += 1;
    }
    out[i] = v as u8;
    out
}

fn truncated_now() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64;
    now - now % KEY_EPOCH.as_secs() as i64
}

/// Derives session keys from the long-lived shared secret.
#[derive(Clone)]
pub struct KeySchedule {
    secret: Vec<u8>,
}

impl KeySchedule {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// The session key and epoch tag for the current wall-clock epoch.
    pub fn current(&self) -> ([u8; SESSION_KEY_LEN], EpochTime) {
        self.at(truncated_now())
    }

    fn at(&self, truncated_secs: i64) -> ([u8; SESSION_KEY_LEN], EpochTime) {
        let t = epoch_time(truncated_secs);
        let mac = hmac::Key::new(hmac::HMAC_SHA256, &self.secret);
        let tag = hmac::sign(&mac, &t);
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&tag.as_ref()[..SESSION_KEY_LEN]);
        (key, t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = KeySchedule::new(b"TestKey".to_vec());
        let b = KeySchedule::new(b"TestKey".to_vec());
        assert_eq!(a.at(1_600_000_080), b.at(1_600_000_080));
    }

    #[test]
    fn epochs_produce_distinct_keys() {
        let k = KeySchedule::new(b"TestKey".to_vec());
        let (k1, t1) = k.at(1_600_000_080);
        let (k2, t2) = k.at(1_600_000_080 + KEY_EPOCH.as_secs() as i64);
        assert_ne!(k1, k2);
        assert_ne!(t1, t2);
    }

    #[test]
    fn secrets_produce_distinct_keys() {
        let (k1, _) = KeySchedule::new(b"one".to_vec()).at(1_600_000_080);
        let (k2, _) = KeySchedule::new(b"two".to_vec()).at(1_600_000_080);
        assert_ne!(k1, k2);
    }

    #[test]
    fn epoch_encoding_is_zigzag_varint() {
        // 1 zigzags to 2, which fits one byte.
        assert_eq!(epoch_time(1)[..2], [2, 0]);
        // -1 zigzags to 1.
        assert_eq!(epoch_time(-1)[..2], [1, 0]);
        // 300 zigzags to 600 = 0x258 -> [0xd8, 0x04].
        assert_eq!(epoch_time(300)[..3], [0xd8, 0x04, 0]);
    }
}
