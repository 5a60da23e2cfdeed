//! AES-128-GCM two-stage segment framing.
//!
//! Wire layout of one segment:
//!
//! ```text
//! [nonce(12)][sealed len(2+16)][sealed body(L+16)]
//! ```
//!
//! The first nonce of a segment is random; the body is sealed under the
//! same nonce with its first byte incremented. A single HTTP body is a
//! concatenation of such segments, each with its own fresh nonce.

use bytes::{Bytes, BytesMut};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};

use super::{CipherError, EpochTime, HEADER_SIZE, NONCE_SIZE, OVERHEAD_SIZE, TAG_SIZE};

/// Builds the AEAD cipher for one derived session key.
pub fn session_cipher(key: &[u8; super::SESSION_KEY_LEN]) -> Result<LessSafeKey, CipherError> {
    let unbound = UnboundKey::new(&AES_128_GCM, key).map_err(|_| CipherError::CipherFailure)?;
    Ok(LessSafeKey::new(unbound))
}

/// A fresh random starting nonce for one segment.
pub fn random_nonce() -> Result<[u8; NONCE_SIZE], CipherError> {
    let mut nonce = [0u8; NONCE_SIZE];
    super::random_bytes(&mut nonce)?;
    Ok(nonce)
}

/// On-the-wire size of a segment carrying `plaintext_len` bytes.
pub fn segment_size(plaintext_len: usize) -> usize {
    OVERHEAD_SIZE + plaintext_len
}

/// Seal `buf` in place as one segment.
///
/// On entry the plaintext must occupy `buf[HEADER_SIZE..len - TAG_SIZE]`;
/// the rest of the buffer is overwritten with the framing. Panics when
/// the buffer violates the framing contract (too small for the overhead
/// or longer than a u16 length can describe) -- that is a programmer
/// error, not a runtime protocol error.
pub fn seal(
    key: &LessSafeKey,
    mut nonce: [u8; NONCE_SIZE],
    buf: &mut [u8],
) -> Result<(), CipherError> {
    assert!(
        buf.len() >= OVERHEAD_SIZE,
        "segment buffer smaller than the cipher overhead"
    );
    assert!(buf.len() <= u16::MAX as usize, "segment exceeds a u16 length");
    let body_len = buf.len() - OVERHEAD_SIZE;

    buf[..NONCE_SIZE].copy_from_slice(&nonce);
    buf[NONCE_SIZE] = (body_len >> 8) as u8;
    buf[NONCE_SIZE + 1] = body_len as u8;

    // Stage one: seal the 2-byte length.
    let (head, rest) = buf.split_at_mut(NONCE_SIZE + 2);
    let tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::empty(),
            &mut head[NONCE_SIZE..],
        )
        .map_err(|_| CipherError::CipherFailure)?;
    rest[..TAG_SIZE].copy_from_slice(tag.as_ref());

    // Stage two: seal the body under the incremented nonce.
    nonce[0] = nonce[0].wrapping_add(1);
    let body = &mut rest[TAG_SIZE..];
    let (plaintext, tag_slot) = body.split_at_mut(body_len);
    let tag = key
        .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), plaintext)
        .map_err(|_| CipherError::CipherFailure)?;
    tag_slot.copy_from_slice(tag.as_ref());
    Ok(())
}

struct PendingBody {
    nonce: [u8; NONCE_SIZE],
    len: usize,
}

/// Incremental decoder for a stream of sealed segments.
///
/// Chunks are pushed in as they arrive; [`SegmentDecoder::next`] yields a
/// decrypted segment once it is complete, or `None` when more input is
/// needed. Each nonce is checked against the verifier exactly once.
pub struct SegmentDecoder<V> {
    key: LessSafeKey,
    epoch: EpochTime,
    verify: V,
    buf: BytesMut,
    pending: Option<PendingBody>,
}

impl<V> SegmentDecoder<V>
where
    V: FnMut(&[u8; NONCE_SIZE], EpochTime) -> bool,
{
    pub fn new(
        key: &[u8; super::SESSION_KEY_LEN],
        epoch: EpochTime,
        verify: V,
    ) -> Result<Self, CipherError> {
        Ok(Self {
            key: session_cipher(key)?,
            epoch,
            verify,
            buf: BytesMut::new(),
            pending: None,
        })
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// The next complete decrypted segment, or `None` until one is.
    pub fn next(&mut self) -> Result<Option<Bytes>, CipherError> {
        if self.pending.is_none() {
            if self.buf.len() < HEADER_SIZE {
                return Ok(None);
            }
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&self.buf[..NONCE_SIZE]);
            if !(self.verify)(&nonce, self.epoch) {
                return Err(CipherError::InvalidNonce);
            }
            let mut sealed = [0u8; 2 + TAG_SIZE];
            sealed.copy_from_slice(&self.buf[NONCE_SIZE..HEADER_SIZE]);
            let plain = self
                .key
                .open_in_place(
                    Nonce::assume_unique_for_key(nonce),
                    Aad::empty(),
                    &mut sealed,
                )
                .map_err(|_| CipherError::CipherFailure)?;
            if plain.len() != 2 {
                return Err(CipherError::InvalidSize);
            }
            let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
            let _ = self.buf.split_to(HEADER_SIZE);
            nonce[0] = nonce[0].wrapping_add(1);
            self.pending = Some(PendingBody { nonce, len });
        }

        let (nonce, len) = match &self.pending {
            Some(p) => (p.nonce, p.len),
            None => return Ok(None),
        };
        if self.buf.len() < len + TAG_SIZE {
            return Ok(None);
        }
        let mut seg = self.buf.split_to(len + TAG_SIZE);
        self.pending = None;
        let plain_len = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut seg)
            .map_err(|_| CipherError::CipherFailure)?
            .len();
        if plain_len != len {
            return Err(CipherError::InvalidSize);
        }
        seg.truncate(plain_len);
        Ok(Some(seg.freeze()))
    }

    /// Verify the stream ended on a segment boundary.
    pub fn finish(&self) -> Result<(), CipherError> {
        if self.buf.is_empty() && self.pending.is_none() {
            Ok(())
        } else {
            Err(CipherError::InvalidSize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeySchedule, NonceCache};

    fn round_trip_one(buf: &mut [u8]) -> Bytes {
        let (key, epoch) = KeySchedule::new(b"TestKey".to_vec()).current();
        let cipher = session_cipher(&key).unwrap();
        seal(&cipher, random_nonce().unwrap(), buf).unwrap();

        let mut dec = SegmentDecoder::new(&key, epoch, |_, _| true).unwrap();
        dec.push(buf);
        let seg = dec.next().unwrap().expect("complete segment");
        dec.finish().unwrap();
        seg
    }

    #[test]
    fn seal_then_open_recovers_plaintext() {
        // The padding around "ABC" is exactly the cipher overhead; the
        // wire message plaintext is 3 bytes.
        let mut buf = *b"                              ABC                ";
        assert_eq!(buf.len(), OVERHEAD_SIZE + 3);
        assert_eq!(&round_trip_one(&mut buf)[..], b"ABC");
    }

    #[test]
    fn empty_plaintext_segment() {
        let mut buf = [0u8; OVERHEAD_SIZE];
        assert!(round_trip_one(&mut buf).is_empty());
    }

    #[test]
    fn segments_arrive_split_across_chunks() {
        let (key, epoch) = KeySchedule::new(b"TestKey".to_vec()).current();
        let cipher = session_cipher(&key).unwrap();

        let mut a = vec![0u8; segment_size(4)];
        a[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(b"wolf");
        seal(&cipher, random_nonce().unwrap(), &mut a).unwrap();

        let mut b = vec![0u8; segment_size(3)];
        b[HEADER_SIZE..HEADER_SIZE + 3].copy_from_slice(b"den");
        seal(&cipher, random_nonce().unwrap(), &mut b).unwrap();

        let mut wire = a;
        wire.extend_from_slice(&b);

        let mut dec = SegmentDecoder::new(&key, epoch, |_, _| true).unwrap();
        let mut got = Vec::new();
        for chunk in wire.chunks(7) {
            dec.push(chunk);
            while let Some(seg) = dec.next().unwrap() {
                got.push(seg);
            }
        }
        dec.finish().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(&got[0][..], b"wolf");
        assert_eq!(&got[1][..], b"den");
    }

    #[test]
    fn replayed_nonce_rejects_the_turn() {
        let (key, epoch) = KeySchedule::new(b"TestKey".to_vec()).current();
        let cipher = session_cipher(&key).unwrap();
        let nonce = random_nonce().unwrap();

        let mut seg = vec![0u8; segment_size(2)];
        seg[HEADER_SIZE..HEADER_SIZE + 2].copy_from_slice(b"ok");
        seal(&cipher, nonce, &mut seg).unwrap();

        let cache = NonceCache::new(16);
        let mut dec = SegmentDecoder::new(&key, epoch, |n, t| cache.verify(n, t)).unwrap();
        dec.push(&seg);
        dec.push(&seg);
        assert!(dec.next().unwrap().is_some());
        assert_eq!(dec.next(), Err(CipherError::InvalidNonce));
    }

    #[test]
    fn tampered_body_fails() {
        let (key, epoch) = KeySchedule::new(b"TestKey".to_vec()).current();
        let cipher = session_cipher(&key).unwrap();
        let mut seg = vec![0u8; segment_size(5)];
        seg[HEADER_SIZE..HEADER_SIZE + 5].copy_from_slice(b"hello");
        seal(&cipher, random_nonce().unwrap(), &mut seg).unwrap();
        let last = seg.len() - 1;
        seg[last] ^= 0xff;

        let mut dec = SegmentDecoder::new(&key, epoch, |_, _| true).unwrap();
        dec.push(&seg);
        assert_eq!(dec.next(), Err(CipherError::CipherFailure));
    }

    #[test]
    fn truncated_stream_is_detected() {
        let (key, epoch) = KeySchedule::new(b"TestKey".to_vec()).current();
        let cipher = session_cipher(&key).unwrap();
        let mut seg = vec![0u8; segment_size(5)];
        seal(&cipher, random_nonce().unwrap(), &mut seg).unwrap();

        let mut dec = SegmentDecoder::new(&key, epoch, |_, _| true).unwrap();
        dec.push(&seg[..seg.len() - 1]);
        assert_eq!(dec.next(), Ok(None));
        assert_eq!(dec.finish(), Err(CipherError::InvalidSize));
    }
}
