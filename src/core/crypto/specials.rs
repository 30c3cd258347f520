//! Stand-ins for the crypto primitives and the external collaborators.
//! They are cheap and deterministic, which makes them handy in tests.

use std::{collections::BTreeSet, sync::Arc};

use parking_lot::Mutex;
use serde_json::json;

use crate::core::{
    collab::{Deployment, IdInfo, OsManager, TaskState, UnmanagedService},
    userservice::{CacheLevel, UserService},
};

use super::{CertificateBundle, CertificateIssuer, Secret, SymmetricCipher};


fn key_tag(key: &[u8]) -> [u8; 8] {
    let mut tag = 0xcbf2_9ce4_8422_2325u64;
    for byte in key {
        tag ^= u64::from(*byte);
        tag = tag.wrapping_mul(0x0100_0000_01b3);
    }
    tag.to_le_bytes()
}

/// Xor "encryption" prefixed with a tag of the key, so a wrong key is detected.
pub struct FauxCipher;

impl SymmetricCipher for FauxCipher {
    type Error = &'static str;

    fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Self::Error> {
        if key.is_empty() {
            return Err("empty key");
        }
        let mut out = key_tag(key).to_vec();
        out.extend(plaintext.iter().zip(key.iter().cycle()).map(|(p, k)| p ^ k ^ 0x5a));
        Ok(out)
    }

    fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Self::Error> {
        if key.is_empty() || ciphertext.len() < 8 || ciphertext[..8] != key_tag(key) {
            return Err("wrong key");
        }
        Ok(ciphertext[8..]
            .iter()
            .zip(key.iter().cycle())
            .map(|(c, k)| c ^ k ^ 0x5a)
            .collect())
    }
}

/// Issues recognizable, fake certificate material.
pub struct FauxIssuer;

impl CertificateIssuer for FauxIssuer {
    type Error = &'static str;

    fn issue(ip: &str) -> Result<CertificateBundle, Self::Error> {
        if ip.is_empty() {
            return Err("no address to issue for");
        }
        Ok(CertificateBundle {
            key: Secret::new(format!("faux-key-{ip}")),
            certificate: format!("faux-cert-{ip}"),
            password: Secret::new(super::random_hex(8)),
        })
    }
}

/// A provider whose tasks all end in a fixed state.
#[derive(Debug, Clone)]
pub struct FauxDeployment {
    task: TaskState,
    can_cancel: bool,
    pub ip: Option<String>,
    pub destroyed: bool,
}

impl FauxDeployment {
    pub fn with_task(task: TaskState) -> Self {
        Self {
            task,
            can_cancel: true,
            ip: None,
            destroyed: false,
        }
    }
    pub fn finishing() -> Self {
        Self::with_task(TaskState::Finished)
    }
    pub fn without_cancel(mut self) -> Self {
        self.can_cancel = false;
        self
    }
}

impl Deployment for FauxDeployment {
    fn supports_cancel(&self) -> bool {
        self.can_cancel
    }
    fn set_ip(&mut self, ip: &str) {
        self.ip = Some(ip.to_string());
    }
    fn cancel(&mut self) -> TaskState {
        self.task.clone()
    }
    fn destroy(&mut self) -> TaskState {
        self.destroyed = true;
        self.task.clone()
    }
    fn move_to_cache(&mut self, _level: CacheLevel) -> TaskState {
        self.task.clone()
    }
}

#[derive(Debug, Clone)]
pub struct FauxOsManager {
    pub removable_on_logout: bool,
    pub ignore_deadline: bool,
    pub max_idle: Option<u64>,
    pub rename_to: Option<String>,
}

impl Default for FauxOsManager {
    fn default() -> Self {
        Self {
            removable_on_logout: true,
            ignore_deadline: false,
            max_idle: Some(900),
            rename_to: None,
        }
    }
}

impl OsManager for FauxOsManager {
    fn actor_data(&self, service: &mut UserService) -> serde_json::Value {
        match &self.rename_to {
            Some(name) => {
                service.friendly_name = name.clone();
                json!({ "action": "rename", "name": name })
            }
            None => json!({}),
        }
    }
    fn max_idle(&self) -> Option<u64> {
        self.max_idle
    }
    fn ignore_deadline(&self) -> bool {
        self.ignore_deadline
    }
    fn is_removable_on_logout(&self, _service: &UserService) -> bool {
        self.removable_on_logout
    }
    fn to_ready(&self, _service: &mut UserService) {}
}

/// An unmanaged service that recognizes a fixed set of ids and records
/// everything it is told.
#[derive(Debug, Clone, Default)]
pub struct FauxService {
    known: BTreeSet<String>,
    events: Arc<Mutex<Vec<String>>>,
}

impl FauxService {
    pub fn recognizing(ids: &[&str]) -> Self {
        Self {
            known: ids.iter().map(|s| s.to_string()).collect(),
            events: Arc::default(),
        }
    }
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl UnmanagedService for FauxService {
    fn get_valid_id(&self, ids: &[String]) -> Option<String> {
        ids.iter().find(|id| self.known.contains(*id)).cloned()
    }
    fn process_login(&self, id: &str, remote: bool) {
        self.push(format!("login {id} {remote}"));
    }
    fn process_logout(&self, id: &str, remote: bool) {
        self.push(format!("logout {id} {remote}"));
    }
    fn notify_data(&self, id: Option<&str>, data: &serde_json::Value) {
        self.push(format!("data {} {data}", id.unwrap_or("-")));
    }
    fn notify_initialization(&self, id: &str) {
        self.push(format!("init {id}"));
    }
    fn store_id_info(&self, id: &str, info: IdInfo) {
        self.push(format!("store {id} {}", info.port));
    }
}


#[cfg(test)]
mod tests {
    use crate::core::crypto::SymmetricCipher;

    use super::FauxCipher;

    #[test]
    pub fn test_faux_cipher_detects_wrong_key() {
        let sealed = FauxCipher::encrypt(b"abc", b"hello").unwrap();
        assert_eq!(FauxCipher::decrypt(b"abc", &sealed).unwrap(), b"hello");
        assert!(FauxCipher::decrypt(b"abd", &sealed).is_err());
        assert!(FauxCipher::encrypt(b"", b"x").is_err());
    }
}
