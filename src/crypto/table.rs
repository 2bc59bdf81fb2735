//! Password-derived byte-permutation cipher.
//!
//! The oldest SSR method: a fixed substitution table over byte values,
//! seeded from the password's MD5 digest and shuffled by 1024 rounds of a
//! stable sort. Stateless per byte, so it is freely chunkable.

use md5::{Digest, Md5};

/// A byte substitution table and its inverse.
pub struct TranslationTable {
    encode: [u8; 256],
    decode: [u8; 256],
}

impl TranslationTable {
    /// Derive the permutation from a password.
    ///
    /// The comparator key `a % (x + i)` over 1024 rounds matches the
    /// reference table construction; stable sorting is load-bearing for
    /// interoperability.
    pub fn derive(password: &str) -> Self {
        let digest: [u8; 16] = Md5::digest(password.as_bytes()).into();
        let a = u64::from_le_bytes(digest[..8].try_into().expect("md5 digest is 16 bytes"));

        let mut table: Vec<u8> = (0u16..256).map(|v| v as u8).collect();
        for i in 1..1024u64 {
            table.sort_by_key(|&x| a % (x as u64 + i));
        }

        let mut encode = [0u8; 256];
        let mut decode = [0u8; 256];
        for (plain, &cipher) in table.iter().enumerate() {
            encode[plain] = cipher;
            decode[cipher as usize] = plain as u8;
        }

        Self { encode, decode }
    }

    /// Substitute plaintext bytes in place.
    pub fn encode(&self, data: &mut [u8]) {
        for byte in data {
            *byte = self.encode[*byte as usize];
        }
    }

    /// Reverse the substitution in place.
    pub fn decode(&self, data: &mut [u8]) {
        for byte in data {
            *byte = self.decode[*byte as usize];
        }
    }

    /// Memory footprint of one table, for cache accounting.
    pub const fn size_bytes() -> u64 {
        512
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_a_permutation() {
        let table = TranslationTable::derive("hunter2");

        let mut seen = [false; 256];
        for v in 0u16..256 {
            let mapped = table.encode[v as usize];
            assert!(!seen[mapped as usize], "duplicate mapping for {v}");
            seen[mapped as usize] = true;
        }
    }

    #[test]
    fn test_decode_inverts_encode() {
        let table = TranslationTable::derive("hunter2");

        let mut data: Vec<u8> = (0u16..256).map(|v| v as u8).collect();
        let original = data.clone();

        table.encode(&mut data);
        assert_ne!(data, original);
        table.decode(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_different_passwords_differ() {
        let a = TranslationTable::derive("alpha");
        let b = TranslationTable::derive("beta");
        assert_ne!(a.encode, b.encode);
    }

    #[test]
    fn test_same_password_is_deterministic() {
        let a = TranslationTable::derive("alpha");
        let b = TranslationTable::derive("alpha");
        assert_eq!(a.encode, b.encode);
    }
}
