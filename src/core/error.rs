use crate::core::userservice::State;


/// Failure reported by a repository or backend. The message is for logs only.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Storage failure: {0}")]
pub struct StoreError(pub String);

#[derive(thiserror::Error, Debug)]
pub enum TicketError {
    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),
    #[error("Tried to use a secure ticket without owner.")]
    MissingOwner,
    #[error("Failed to encode the ticket payload: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Failed to encrypt the ticket payload: {0}")]
    Cipher(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TicketError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidTicket(reason.into())
    }
}

/// Errors raised inside the actor protocol drivers.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("The caller is not allowed to perform this action.")]
    AccessDenied,
    #[error("The request should count as a failed attempt: {0}")]
    BlockAccess(&'static str),
    #[error("The request is missing the field {0}.")]
    MissingField(&'static str),
    #[error("The driver received a reply it was not waiting for in state {0}.")]
    UnexpectedReply(&'static str),
    #[error("Failed to issue a certificate: {0}")]
    Certificate(String),
    #[error("Failed to notify the service: {0}")]
    Notify(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The error surface of the actor protocol as seen by the dispatcher.
#[derive(thiserror::Error, Debug)]
pub enum ActorError {
    #[error("Access denied")]
    AccessDenied,
    /// Internal signal, always surfaces as [ActorError::AccessDenied].
    #[error("Access denied")]
    BlockAccess,
    /// The source is currently blocked, the caller should delay before rejecting.
    #[error("Access denied")]
    Blocked,
    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),
    #[error("Invalid parameters: {0}")]
    RequestError(String),
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for ActorError {
    fn from(value: ProtocolError) -> Self {
        match value {
            ProtocolError::AccessDenied => Self::AccessDenied,
            ProtocolError::BlockAccess(_) => Self::BlockAccess,
            ProtocolError::MissingField(field) => Self::MissingField(field.to_string()),
            ProtocolError::Store(e) => Self::Store(e),
            other => Self::Protocol(other),
        }
    }
}

impl From<serde_json::Error> for ActorError {
    fn from(value: serde_json::Error) -> Self {
        let message = value.to_string();
        match message.strip_prefix("missing field `") {
            Some(rest) => Self::MissingField(rest.split('`').next().unwrap_or_default().to_string()),
            None => Self::RequestError(message),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum UserServiceError {
    #[error("Cannot move from {from} to {to}.")]
    IllegalTransition { from: State, to: State },
    #[error("The user service is in the final state {0}.")]
    Terminal(State),
    #[error("Only services on cache level 0 can be assigned to a user.")]
    NotAssignable,
    #[error("The provider failed: {0}")]
    Provider(String),
}


#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::{ActorError, ProtocolError};

    #[derive(Deserialize, Debug)]
    #[allow(dead_code)]
    struct Needs {
        mac: String,
    }

    #[test]
    pub fn test_missing_field_is_detected() {
        let err = serde_json::from_str::<Needs>("{}").unwrap_err();
        assert!(matches!(ActorError::from(err), ActorError::MissingField(f) if f == "mac"));

        let err = serde_json::from_str::<Needs>("{\"mac\": 3}").unwrap_err();
        assert!(matches!(ActorError::from(err), ActorError::RequestError(_)));
    }

    #[test]
    pub fn test_protocol_mapping() {
        assert!(matches!(ActorError::from(ProtocolError::BlockAccess("x")), ActorError::BlockAccess));
        assert!(matches!(
            ActorError::from(ProtocolError::Certificate("bad".into())),
            ActorError::Protocol(_)
        ));
        assert_eq!(ActorError::Blocked.to_string(), "Access denied");
    }
}
