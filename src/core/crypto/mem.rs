use std::{fmt::Debug, ops::Deref};

use rand::{Rng, distr::Alphanumeric};
use zeroize::Zeroizing;


/// A string secret that is wiped from memory once dropped
/// and never printed by [Debug].
#[derive(PartialEq, Eq, Clone)]
#[repr(transparent)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl Deref for Secret {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        self.expose()
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Generates a random alphanumeric string (mixed case) of the requested length.
pub fn random_string(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Generates `bytes` random bytes and returns them hex encoded.
pub fn random_hex(bytes: usize) -> String {
    let mut buffer = Zeroizing::new(vec![0u8; bytes]);
    rand::rng().fill(&mut buffer[..]);
    hex::encode(&*buffer)
}


#[cfg(test)]
mod tests {
    use super::{Secret, random_hex, random_string};

    #[test]
    pub fn test_random_string_shape() {
        let value = random_string(40);
        assert_eq!(value.len(), 40);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(value, random_string(40));
    }

    #[test]
    pub fn test_random_hex_shape() {
        let value = random_hex(32);
        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    pub fn test_secret_is_not_printed() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(****)");
        assert_eq!(&*secret, "hunter2");
    }
}
