use serde::{Deserialize, Serialize};

use crate::core::{
    action::NotifyAction,
    error::ProtocolError,
    userservice::{CacheLevel, UserService},
};

/// Progress reported by a provider for a long running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Finished,
    Error(String),
}

/// The provider side of a single user service.
pub trait Deployment: Send + Sync {
    fn supports_cancel(&self) -> bool;
    fn set_ip(&mut self, ip: &str);
    fn cancel(&mut self) -> TaskState;
    fn destroy(&mut self) -> TaskState;
    fn move_to_cache(&mut self, level: CacheLevel) -> TaskState;
}

/// Guest operating system manager attached to a pool.
pub trait OsManager: Send + Sync {
    /// Instructions handed to the actor on initialization. May rename the service.
    fn actor_data(&self, service: &mut UserService) -> serde_json::Value;
    /// Idle timeout in seconds.
    fn max_idle(&self) -> Option<u64>;
    fn ignore_deadline(&self) -> bool;
    fn is_removable_on_logout(&self, service: &UserService) -> bool;
    fn to_ready(&self, service: &mut UserService);
    fn logged_in(&self, _service: &mut UserService, _username: &str) {}
    fn logged_out(&self, _service: &mut UserService, _username: &str) {}
}

/// Material stored by a service for one of its unmanaged endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdInfo {
    pub cert: String,
    pub secret: String,
    pub port: u16,
}

/// A service that can own endpoints the broker does not manage.
pub trait UnmanagedService: Send + Sync {
    /// Picks the first id the service recognizes.
    fn get_valid_id(&self, ids: &[String]) -> Option<String>;
    fn process_login(&self, id: &str, remote: bool);
    fn process_logout(&self, id: &str, remote: bool);
    fn notify_data(&self, id: Option<&str>, data: &serde_json::Value);
    fn notify_initialization(&self, id: &str);
    fn store_id_info(&self, id: &str, info: IdInfo);
}

/// Routes an unmanaged notification to the owning service.
///
/// Login and logout need an id the service recognizes, data does not.
pub fn notify_unmanaged(
    service: &dyn UnmanagedService,
    action: NotifyAction,
    ids: &[String],
    remote: bool,
    data: Option<&serde_json::Value>,
) -> Result<(), ProtocolError> {
    let valid_id = service.get_valid_id(ids);
    match action {
        NotifyAction::Login | NotifyAction::Logout => {
            let id = valid_id.ok_or(ProtocolError::Notify("no valid id".into()))?;
            if action == NotifyAction::Login {
                service.process_login(&id, remote);
            } else {
                service.process_logout(&id, remote);
            }
        }
        NotifyAction::Data => {
            let data = data.ok_or(ProtocolError::MissingField("data"))?;
            service.notify_data(valid_id.as_deref(), data);
        }
    }
    Ok(())
}

/// Remote desktop session types are reported with these prefixes.
pub fn is_remote_session(session_type: &str) -> bool {
    let prefix: String = session_type.chars().take(4).collect();
    prefix == "xrdp" || prefix == "RDP-"
}


#[cfg(test)]
mod tests {
    use crate::core::{action::NotifyAction, crypto::specials::FauxService, error::ProtocolError};

    use super::{is_remote_session, notify_unmanaged};

    #[test]
    pub fn test_login_needs_valid_id() {
        let service = FauxService::recognizing(&["10.0.0.9"]);
        let unknown = vec!["10.0.0.1".to_string()];
        assert!(matches!(
            notify_unmanaged(&service, NotifyAction::Login, &unknown, false, None),
            Err(ProtocolError::Notify(_))
        ));

        let known = vec!["10.0.0.9".to_string()];
        notify_unmanaged(&service, NotifyAction::Login, &known, true, None).unwrap();
        notify_unmanaged(&service, NotifyAction::Logout, &known, false, None).unwrap();
        assert_eq!(service.events(), vec!["login 10.0.0.9 true", "logout 10.0.0.9 false"]);
    }

    #[test]
    pub fn test_data_needs_payload() {
        let service = FauxService::recognizing(&[]);
        assert!(matches!(
            notify_unmanaged(&service, NotifyAction::Data, &[], false, None),
            Err(ProtocolError::MissingField("data"))
        ));
        notify_unmanaged(&service, NotifyAction::Data, &[], false, Some(&serde_json::json!({"a": 1}))).unwrap();
        assert_eq!(service.events(), vec!["data - {\"a\":1}"]);
    }

    #[test]
    pub fn test_remote_detection() {
        assert!(is_remote_session("xrdp-sesman"));
        assert!(is_remote_session("RDP-Tcp#0"));
        assert!(!is_remote_session("console"));
        assert!(!is_remote_session(""));
    }
}
