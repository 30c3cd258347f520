use std::fmt::Display;

pub mod mem;
pub mod specials;
mod simple;
mod time;

pub use mem::*;
pub use simple::*;
pub use time::*;


/// The [SymmetricCipher] trait specifies how a cipher compatible with the
/// ticket store should be implemented. The key is the raw, caller-supplied
/// secret (a ticket owner for instance); implementations are expected to
/// derive their actual key material from it.
pub trait SymmetricCipher {
    type Error: Display;

    /// Encrypts the plaintext under the key.
    fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Self::Error>;
    /// Decrypts the ciphertext. A wrong key must produce an error, never garbage.
    fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Self::Error>;
}


pub trait HashingAlgorithm<const N: usize> {
    fn hash(buffer: &[u8]) -> [u8; N] {
        Self::hash_sequence(&[buffer])
    }
    fn hash_sequence(buffer: &[&[u8]]) -> [u8; N];
}


/// Material handed to an actor so it can serve its comms channel over TLS.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    /// The PEM encoded private key, encrypted under `password`.
    pub key: Secret,
    /// The PEM encoded self-signed certificate.
    pub certificate: String,
    /// Random password that unlocks `key`.
    pub password: Secret,
}

/// Issues self-signed certificates for the per-session comms channel.
///
/// Issuance is stateless, every call generates a fresh keypair.
pub trait CertificateIssuer {
    type Error: Display;

    fn issue(ip: &str) -> Result<CertificateBundle, Self::Error>;
}
