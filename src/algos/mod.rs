pub mod aes;

pub mod sha2;

#[cfg(feature="cert")]
pub mod cert;
