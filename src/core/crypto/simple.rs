use sha2::Sha256;

use crate::algos::aes::AesGcmCipher;

#[cfg(feature = "cert")]
use crate::algos::cert::RcgenIssuer;

/// Cipher used for secure tickets: AES-256-GCM keyed by SHA-256 of the owner.
pub type StandardCipher = AesGcmCipher<Sha256>;

#[cfg(feature = "cert")]
pub type StandardIssuer = RcgenIssuer;
