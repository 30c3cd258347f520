use std::marker::PhantomData;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::Rng;
use zeroize::Zeroizing;

use crate::core::crypto::{HashingAlgorithm, SymmetricCipher};

const NONCE_LEN: usize = 12;

/// AES-256-GCM with the key derived by hashing the caller supplied secret.
///
/// The output layout is `nonce(12) || ciphertext || tag(16)`.
pub struct AesGcmCipher<H> {
    _h: PhantomData<H>,
}

#[derive(thiserror::Error, Debug)]
pub enum CipherError {
    #[error("The ciphertext is too short to contain a nonce.")]
    Truncated,
    #[error("The cipher could not be initialized with the derived key.")]
    BadKey,
    #[error("Encryption failed.")]
    Encrypt,
    #[error("Decryption failed, the key is wrong or the data was tampered with.")]
    Decrypt,
}

impl<H> AesGcmCipher<H>
where
    H: HashingAlgorithm<32>,
{
    fn cipher(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
        let derived = Zeroizing::new(H::hash(key));
        Aes256Gcm::new_from_slice(&*derived).map_err(|_| CipherError::BadKey)
    }
}

impl<H> SymmetricCipher for AesGcmCipher<H>
where
    H: HashingAlgorithm<32>,
{
    type Error = CipherError;

    fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Self::Error> {
        let cipher = Self::cipher(key)?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let mut buffer = Vec::with_capacity(NONCE_LEN + sealed.len());
        buffer.extend_from_slice(&nonce_bytes);
        buffer.extend_from_slice(&sealed);
        Ok(buffer)
    }

    fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Self::Error> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        Self::cipher(key)?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Decrypt)
    }
}
