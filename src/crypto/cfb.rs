//! Block ciphers in CFB mode.
//!
//! CFB turns each block primitive into a self-synchronizing stream: the
//! previous ciphertext block is encrypted and XORed into the next input, so
//! state chains from the session IV through every processed byte. Chunks
//! passed across successive calls continue the same chain, and the output
//! length always equals the input length.
//!
//! Chaining also means CFB is never block-index-seekable; both directions
//! serialize regardless of the parallelism setting.

use aes::{Aes128, Aes192, Aes256};
use blowfish::Blowfish;
use camellia::{Camellia128, Camellia192, Camellia256};
use cast5::Cast5;
use cfb_mode::{BufDecryptor, BufEncryptor};
use cipher::{BlockCipher, BlockEncryptMut, InnerIvInit, KeyInit};
use des::Des;
use idea::Idea;
use rc2::Rc2;

use crate::error::{Error, Result};

use super::Method;

fn encryptor<C>(key: &[u8], iv: &[u8]) -> Result<BufEncryptor<C>>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    let primitive =
        C::new_from_slice(key).map_err(|_| Error::invalid_parameter("derived key length"))?;
    BufEncryptor::inner_iv_slice_init(primitive, iv)
        .map_err(|_| Error::invalid_parameter("iv length"))
}

fn decryptor<C>(key: &[u8], iv: &[u8]) -> Result<BufDecryptor<C>>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    let primitive =
        C::new_from_slice(key).map_err(|_| Error::invalid_parameter("derived key length"))?;
    BufDecryptor::inner_iv_slice_init(primitive, iv)
        .map_err(|_| Error::invalid_parameter("iv length"))
}

/// Encrypt direction of a CFB session.
pub(crate) enum CfbEncryptor {
    Aes128(BufEncryptor<Aes128>),
    Aes192(BufEncryptor<Aes192>),
    Aes256(BufEncryptor<Aes256>),
    Blowfish(BufEncryptor<Blowfish>),
    Camellia128(BufEncryptor<Camellia128>),
    Camellia192(BufEncryptor<Camellia192>),
    Camellia256(BufEncryptor<Camellia256>),
    Cast5(BufEncryptor<Cast5>),
    Des(BufEncryptor<Des>),
    Idea(BufEncryptor<Idea>),
    Rc2(BufEncryptor<Rc2>),
}

impl CfbEncryptor {
    pub(crate) fn new(method: Method, key: &[u8], iv: &[u8]) -> Result<Self> {
        Ok(match method {
            Method::Aes128Cfb => CfbEncryptor::Aes128(encryptor(key, iv)?),
            Method::Aes192Cfb => CfbEncryptor::Aes192(encryptor(key, iv)?),
            Method::Aes256Cfb => CfbEncryptor::Aes256(encryptor(key, iv)?),
            Method::BfCfb => CfbEncryptor::Blowfish(encryptor(key, iv)?),
            Method::Camellia128Cfb => CfbEncryptor::Camellia128(encryptor(key, iv)?),
            Method::Camellia192Cfb => CfbEncryptor::Camellia192(encryptor(key, iv)?),
            Method::Camellia256Cfb => CfbEncryptor::Camellia256(encryptor(key, iv)?),
            Method::Cast5Cfb => CfbEncryptor::Cast5(encryptor(key, iv)?),
            Method::DesCfb => CfbEncryptor::Des(encryptor(key, iv)?),
            Method::IdeaCfb => CfbEncryptor::Idea(encryptor(key, iv)?),
            Method::Rc2Cfb => CfbEncryptor::Rc2(encryptor(key, iv)?),
            other => {
                return Err(Error::operation_failed(format!(
                    "{} is not a CFB method",
                    other.as_str()
                )))
            }
        })
    }

    /// Encrypt in place, continuing the chain from previous calls.
    pub(crate) fn encrypt(&mut self, data: &mut [u8]) {
        match self {
            CfbEncryptor::Aes128(c) => c.encrypt(data),
            CfbEncryptor::Aes192(c) => c.encrypt(data),
            CfbEncryptor::Aes256(c) => c.encrypt(data),
            CfbEncryptor::Blowfish(c) => c.encrypt(data),
            CfbEncryptor::Camellia128(c) => c.encrypt(data),
            CfbEncryptor::Camellia192(c) => c.encrypt(data),
            CfbEncryptor::Camellia256(c) => c.encrypt(data),
            CfbEncryptor::Cast5(c) => c.encrypt(data),
            CfbEncryptor::Des(c) => c.encrypt(data),
            CfbEncryptor::Idea(c) => c.encrypt(data),
            CfbEncryptor::Rc2(c) => c.encrypt(data),
        }
    }
}

/// Decrypt direction of a CFB session.
pub(crate) enum CfbDecryptor {
    Aes128(BufDecryptor<Aes128>),
    Aes192(BufDecryptor<Aes192>),
    Aes256(BufDecryptor<Aes256>),
    Blowfish(BufDecryptor<Blowfish>),
    Camellia128(BufDecryptor<Camellia128>),
    Camellia192(BufDecryptor<Camellia192>),
    Camellia256(BufDecryptor<Camellia256>),
    Cast5(BufDecryptor<Cast5>),
    Des(BufDecryptor<Des>),
    Idea(BufDecryptor<Idea>),
    Rc2(BufDecryptor<Rc2>),
}

impl CfbDecryptor {
    pub(crate) fn new(method: Method, key: &[u8], iv: &[u8]) -> Result<Self> {
        Ok(match method {
            Method::Aes128Cfb => CfbDecryptor::Aes128(decryptor(key, iv)?),
            Method::Aes192Cfb => CfbDecryptor::Aes192(decryptor(key, iv)?),
            Method::Aes256Cfb => CfbDecryptor::Aes256(decryptor(key, iv)?),
            Method::BfCfb => CfbDecryptor::Blowfish(decryptor(key, iv)?),
            Method::Camellia128Cfb => CfbDecryptor::Camellia128(decryptor(key, iv)?),
            Method::Camellia192Cfb => CfbDecryptor::Camellia192(decryptor(key, iv)?),
            Method::Camellia256Cfb => CfbDecryptor::Camellia256(decryptor(key, iv)?),
            Method::Cast5Cfb => CfbDecryptor::Cast5(decryptor(key, iv)?),
            Method::DesCfb => CfbDecryptor::Des(decryptor(key, iv)?),
            Method::IdeaCfb => CfbDecryptor::Idea(decryptor(key, iv)?),
            Method::Rc2Cfb => CfbDecryptor::Rc2(decryptor(key, iv)?),
            other => {
                return Err(Error::operation_failed(format!(
                    "{} is not a CFB method",
                    other.as_str()
                )))
            }
        })
    }

    /// Decrypt in place, continuing the chain from previous calls.
    pub(crate) fn decrypt(&mut self, data: &mut [u8]) {
        match self {
            CfbDecryptor::Aes128(c) => c.decrypt(data),
            CfbDecryptor::Aes192(c) => c.decrypt(data),
            CfbDecryptor::Aes256(c) => c.decrypt(data),
            CfbDecryptor::Blowfish(c) => c.decrypt(data),
            CfbDecryptor::Camellia128(c) => c.decrypt(data),
            CfbDecryptor::Camellia192(c) => c.decrypt(data),
            CfbDecryptor::Camellia256(c) => c.decrypt(data),
            CfbDecryptor::Cast5(c) => c.decrypt(data),
            CfbDecryptor::Des(c) => c.decrypt(data),
            CfbDecryptor::Idea(c) => c.decrypt(data),
            CfbDecryptor::Rc2(c) => c.decrypt(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::evp_bytes_to_key;

    const CFB_METHODS: [Method; 11] = [
        Method::Aes128Cfb,
        Method::Aes192Cfb,
        Method::Aes256Cfb,
        Method::BfCfb,
        Method::Camellia128Cfb,
        Method::Camellia192Cfb,
        Method::Camellia256Cfb,
        Method::Cast5Cfb,
        Method::DesCfb,
        Method::IdeaCfb,
        Method::Rc2Cfb,
    ];

    fn key_iv(method: Method) -> (Vec<u8>, Vec<u8>) {
        let key = evp_bytes_to_key(b"hunter2", method.key_len()).to_vec();
        let iv = vec![0x3c; method.iv_len()];
        (key, iv)
    }

    #[test]
    fn test_roundtrip_all_methods() {
        for method in CFB_METHODS {
            let (key, iv) = key_iv(method);
            let mut enc = CfbEncryptor::new(method, &key, &iv).unwrap();
            let mut dec = CfbDecryptor::new(method, &key, &iv).unwrap();

            // Length deliberately not block-aligned; CFB adds no padding
            let mut data = b"0123456789 odd-length payload!!".to_vec();
            let original = data.clone();

            enc.encrypt(&mut data);
            assert_ne!(data, original, "{}", method.as_str());
            assert_eq!(data.len(), original.len());

            dec.decrypt(&mut data);
            assert_eq!(data, original, "{}", method.as_str());
        }
    }

    #[test]
    fn test_chain_continues_across_calls() {
        for method in CFB_METHODS {
            let (key, iv) = key_iv(method);
            let payload: Vec<u8> = (0..1000u32).map(|i| (i % 253) as u8).collect();

            let mut whole_enc = CfbEncryptor::new(method, &key, &iv).unwrap();
            let mut whole = payload.clone();
            whole_enc.encrypt(&mut whole);

            let mut split_enc = CfbEncryptor::new(method, &key, &iv).unwrap();
            let mut split = payload.clone();
            let (head, tail) = split.split_at_mut(333);
            split_enc.encrypt(head);
            split_enc.encrypt(tail);

            assert_eq!(whole, split, "{}", method.as_str());
        }
    }

    #[test]
    fn test_wrong_iv_garbles_plaintext() {
        let (key, iv) = key_iv(Method::Aes256Cfb);
        let mut enc = CfbEncryptor::new(Method::Aes256Cfb, &key, &iv).unwrap();
        let mut dec = CfbDecryptor::new(Method::Aes256Cfb, &key, &[0u8; 16]).unwrap();

        let mut data = b"sensitive payload".to_vec();
        enc.encrypt(&mut data);
        dec.decrypt(&mut data);
        assert_ne!(data, b"sensitive payload");
    }

    #[test]
    fn test_non_cfb_method_rejected() {
        let (key, iv) = key_iv(Method::Aes128Cfb);
        assert!(CfbEncryptor::new(Method::Rc4, &key, &iv).is_err());
        assert!(CfbDecryptor::new(Method::Salsa20, &key, &iv).is_err());
    }

    #[test]
    fn test_bad_iv_length_rejected() {
        let (key, _) = key_iv(Method::Aes128Cfb);
        let result = CfbEncryptor::new(Method::Aes128Cfb, &key, &[0u8; 3]);
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }
}
