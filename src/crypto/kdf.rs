//! Key derivation for cipher sessions.
//!
//! SSR derives session keys from the shared password with the OpenSSL
//! `EVP_BytesToKey` construction: iterated MD5 over `prev_digest ‖ password`
//! until enough material exists, truncated to the method's key length.
//! Interoperability with existing servers pins the hash to MD5.

use md5::{Digest, Md5};
use zeroize::Zeroizing;

/// MD5 digest size, the granularity key material is produced in.
pub const DIGEST_SIZE: usize = 16;

/// Derive `key_len` bytes of key material from a password.
///
/// Matches OpenSSL `EVP_BytesToKey(md5, no salt, count=1)`. The result is
/// zeroized when dropped.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(Vec::with_capacity(key_len + DIGEST_SIZE));
    let mut previous: Option<[u8; DIGEST_SIZE]> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(prev) = previous {
            hasher.update(prev);
        }
        hasher.update(password);
        let digest: [u8; DIGEST_SIZE] = hasher.finalize().into();
        key.extend_from_slice(&digest);
        previous = Some(digest);
    }

    key.truncate(key_len);
    key
}

/// Mix the derived key with the session IV for RC4-MD5.
///
/// The effective RC4 key is `md5(key ‖ iv)`, so every session keystream
/// differs even though the derived key is stable per password.
pub fn rc4_md5_session_key(key: &[u8], iv: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut hasher = Md5::new();
    hasher.update(key);
    hasher.update(iv);
    Zeroizing::new(hasher.finalize().to_vec())
}

/// Content hash used as the cache key for derived material.
pub fn content_hash(parts: &[&[u8]]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}
