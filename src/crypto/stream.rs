//! Stream-cipher session state.
//!
//! All stream methods share one contract: XOR the data with a keystream
//! generated from `(key, IV, position)`, where the position advances exactly
//! once per consumed byte and never moves backwards. Decrypt equals encrypt.
//!
//! The counter-based constructions (ChaCha20, Salsa20) can regenerate their
//! keystream at any block index, so large inputs may fan out across worker
//! threads. RC4 carries unseekable running state and always serializes.

use cipher::consts::U16;
use cipher::{KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};

use chacha20::{ChaCha20, ChaCha20Legacy};
use rc4::Rc4;
use salsa20::Salsa20;

use crate::error::{Error, Result};

use super::SessionKey;

/// Stream-cipher algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    /// RC4 with a 16-byte key (also backs rc4-md5 after key mixing)
    Rc4,
    /// Original djb ChaCha20, 8-byte nonce
    ChaCha20Legacy,
    /// RFC 8439 ChaCha20, 12-byte nonce
    ChaCha20Ietf,
    /// Salsa20/20, 8-byte nonce
    Salsa20,
}

impl StreamKind {
    /// Whether the keystream can be regenerated at an arbitrary block index.
    pub(crate) fn is_seekable(&self) -> bool {
        !matches!(self, StreamKind::Rc4)
    }
}

enum Keystream {
    Rc4(Rc4<U16>),
    ChaCha20Legacy(ChaCha20Legacy),
    ChaCha20Ietf(ChaCha20),
    Salsa20(Salsa20),
}

impl Keystream {
    fn build(kind: StreamKind, key: &[u8], nonce: &[u8]) -> Result<Self> {
        match kind {
            StreamKind::Rc4 => Rc4::new_from_slice(key)
                .map(Keystream::Rc4)
                .map_err(|_| Error::invalid_parameter("rc4 key must be 16 bytes")),
            StreamKind::ChaCha20Legacy => ChaCha20Legacy::new_from_slices(key, nonce)
                .map(Keystream::ChaCha20Legacy)
                .map_err(|_| Error::invalid_parameter("chacha20 needs 32-byte key, 8-byte iv")),
            StreamKind::ChaCha20Ietf => ChaCha20::new_from_slices(key, nonce)
                .map(Keystream::ChaCha20Ietf)
                .map_err(|_| {
                    Error::invalid_parameter("chacha20-ietf needs 32-byte key, 12-byte iv")
                }),
            StreamKind::Salsa20 => Salsa20::new_from_slices(key, nonce)
                .map(Keystream::Salsa20)
                .map_err(|_| Error::invalid_parameter("salsa20 needs 32-byte key, 8-byte iv")),
        }
    }

    fn apply(&mut self, data: &mut [u8]) -> Result<()> {
        let applied = match self {
            Keystream::Rc4(c) => c.try_apply_keystream(data),
            Keystream::ChaCha20Legacy(c) => c.try_apply_keystream(data),
            Keystream::ChaCha20Ietf(c) => c.try_apply_keystream(data),
            Keystream::Salsa20(c) => c.try_apply_keystream(data),
        };
        applied.map_err(|_| Error::operation_failed("keystream exhausted"))
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        let sought = match self {
            Keystream::Rc4(_) => {
                return Err(Error::operation_failed("rc4 keystream is not seekable"))
            }
            Keystream::ChaCha20Legacy(c) => c.try_seek(pos),
            Keystream::ChaCha20Ietf(c) => c.try_seek(pos),
            Keystream::Salsa20(c) => c.try_seek(pos),
        };
        sought.map_err(|_| Error::operation_failed("keystream position out of range"))
    }
}

/// One direction of a stream-cipher session.
pub(crate) struct StreamState {
    kind: StreamKind,
    key: SessionKey,
    nonce: Vec<u8>,
    cipher: Keystream,
    position: u64,
}

impl StreamState {
    pub(crate) fn new(kind: StreamKind, key: SessionKey, nonce: Vec<u8>) -> Result<Self> {
        let cipher = Keystream::build(kind, key.as_bytes(), &nonce)?;
        Ok(Self {
            kind,
            key,
            nonce,
            cipher,
            position: 0,
        })
    }

    /// Running keystream position in bytes.
    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    /// XOR `data` with the keystream, sequentially.
    pub(crate) fn apply(&mut self, data: &mut [u8]) -> Result<()> {
        self.cipher.apply(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// XOR `data` with the keystream, fanning chunks out across scoped
    /// worker threads.
    ///
    /// Each worker rebuilds the cipher from `(key, nonce)` and seeks to its
    /// chunk's absolute keystream offset. The fan-in is complete before this
    /// returns; on any worker failure the caller discards the buffer, so
    /// partially transformed bytes are never observed.
    ///
    /// Falls back to the sequential path for unseekable kinds and small
    /// inputs.
    pub(crate) fn apply_chunked(
        &mut self,
        data: &mut [u8],
        min_chunk: usize,
        max_workers: usize,
    ) -> Result<()> {
        if !self.kind.is_seekable() {
            return self.apply(data);
        }

        let workers = max_workers
            .min(data.len().div_ceil(min_chunk.max(1)))
            .max(1);
        if workers == 1 {
            return self.apply(data);
        }

        let span = data.len().div_ceil(workers);
        let base = self.position;
        let kind = self.kind;
        let key = self.key.as_bytes();
        let nonce = self.nonce.as_slice();

        let total = data.len() as u64;
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for (index, chunk) in data.chunks_mut(span).enumerate() {
                handles.push(scope.spawn(move || -> Result<()> {
                    let mut cipher = Keystream::build(kind, key, nonce)?;
                    cipher.seek(base + (index * span) as u64)?;
                    cipher.apply(chunk)
                }));
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| Error::operation_failed("cipher worker panicked"))??;
            }
            Ok::<(), Error>(())
        })?;

        // Advance the live cipher past the region the workers covered.
        self.cipher.seek(base + total)?;
        self.position = base + total;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(kind: StreamKind) -> StreamState {
        let key_len = match kind {
            StreamKind::Rc4 => 16,
            _ => 32,
        };
        let nonce_len = match kind {
            StreamKind::Rc4 => 0,
            StreamKind::ChaCha20Ietf => 12,
            _ => 8,
        };
        StreamState::new(
            kind,
            SessionKey::new(vec![0x42; key_len]),
            vec![0x24; nonce_len],
        )
        .unwrap()
    }

    const ALL_KINDS: [StreamKind; 4] = [
        StreamKind::Rc4,
        StreamKind::ChaCha20Legacy,
        StreamKind::ChaCha20Ietf,
        StreamKind::Salsa20,
    ];

    #[test]
    fn test_xor_is_self_inverse() {
        for kind in ALL_KINDS {
            let mut enc = state(kind);
            let mut dec = state(kind);

            let mut data = b"the quick brown fox".to_vec();
            enc.apply(&mut data).unwrap();
            assert_ne!(data, b"the quick brown fox");

            dec.apply(&mut data).unwrap();
            assert_eq!(data, b"the quick brown fox", "kind {kind:?}");
        }
    }

    #[test]
    fn test_position_advances_per_byte() {
        let mut s = state(StreamKind::Salsa20);
        assert_eq!(s.position(), 0);

        let mut buf = vec![0u8; 100];
        s.apply(&mut buf).unwrap();
        assert_eq!(s.position(), 100);

        s.apply(&mut buf[..37]).unwrap();
        assert_eq!(s.position(), 137);
    }

    #[test]
    fn test_split_equals_whole() {
        for kind in ALL_KINDS {
            let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

            let mut whole = state(kind);
            let mut one = payload.clone();
            whole.apply(&mut one).unwrap();

            let mut split = state(kind);
            let mut two = payload.clone();
            let (head, tail) = two.split_at_mut(1234);
            split.apply(head).unwrap();
            split.apply(tail).unwrap();

            assert_eq!(one, two, "kind {kind:?}");
        }
    }

    #[test]
    fn test_chunked_matches_sequential() {
        for kind in ALL_KINDS.into_iter().filter(StreamKind::is_seekable) {
            let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 239) as u8).collect();

            let mut sequential = state(kind);
            let mut expected = payload.clone();
            sequential.apply(&mut expected).unwrap();

            let mut chunked = state(kind);
            let mut actual = payload.clone();
            chunked.apply_chunked(&mut actual, 4096, 4).unwrap();

            assert_eq!(expected, actual, "kind {kind:?}");
            assert_eq!(sequential.position(), chunked.position());
        }
    }

    #[test]
    fn test_chunked_continues_mid_stream() {
        let kind = StreamKind::ChaCha20Ietf;
        let payload = vec![0x5a; 50_000];

        let mut sequential = state(kind);
        let mut expected = payload.clone();
        sequential.apply(&mut expected).unwrap();

        // Consume a prefix sequentially, the rest chunked
        let mut mixed = state(kind);
        let mut actual = payload.clone();
        let (head, tail) = actual.split_at_mut(7777);
        mixed.apply(head).unwrap();
        mixed.apply_chunked(tail, 2048, 4).unwrap();

        assert_eq!(expected, actual);
    }

    #[test]
    fn test_rc4_chunked_falls_back_to_sequential() {
        let payload = vec![0x11; 20_000];

        let mut a = state(StreamKind::Rc4);
        let mut left = payload.clone();
        a.apply(&mut left).unwrap();

        let mut b = state(StreamKind::Rc4);
        let mut right = payload.clone();
        b.apply_chunked(&mut right, 1024, 4).unwrap();

        assert_eq!(left, right);
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let result = StreamState::new(
            StreamKind::ChaCha20Ietf,
            SessionKey::new(vec![0u8; 16]),
            vec![0u8; 12],
        );
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }
}
