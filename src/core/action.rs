use std::fmt::Display;

/// Every operation the actor endpoint understands.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ActorAction {
    Test,
    Register,
    Initialize,
    Ready,
    IpChange,
    Login,
    Logout,
    Log,
    Ticket,
    Version,
    Unmanaged,
    Notify,
}

impl ActorAction {
    pub const ALL: [ActorAction; 12] = [
        Self::Test,
        Self::Register,
        Self::Initialize,
        Self::Ready,
        Self::IpChange,
        Self::Login,
        Self::Logout,
        Self::Log,
        Self::Ticket,
        Self::Version,
        Self::Unmanaged,
        Self::Notify,
    ];

    pub fn to_static_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Register => "register",
            Self::Initialize => "initialize",
            Self::Ready => "ready",
            Self::IpChange => "ipchange",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Log => "log",
            Self::Ticket => "ticket",
            Self::Version => "version",
            Self::Unmanaged => "unmanaged",
            Self::Notify => "notify",
        }
    }
    /// Whether a blocked source may still attempt this action.
    pub fn bypasses_guard(&self) -> bool {
        matches!(self, Self::Register)
    }
}

impl Display for ActorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_static_str().fmt(f)
    }
}

impl TryFrom<&str> for ActorAction {
    type Error = ActionParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let lowered = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|a| a.to_static_str() == lowered)
            .ok_or_else(|| ActionParseError::UnrecognizedLiteral(s.to_string()))
    }
}

/// The kinds of event accepted by the notify endpoint.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NotifyAction {
    Login,
    Logout,
    Data,
}

impl NotifyAction {
    pub fn to_static_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Data => "data",
        }
    }
}

impl TryFrom<&str> for NotifyAction {
    type Error = ActionParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "login" => Ok(Self::Login),
            "logout" => Ok(Self::Logout),
            "data" => Ok(Self::Data),
            x => Err(ActionParseError::UnrecognizedLiteral(x.to_string())),
        }
    }
}

impl Display for NotifyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_static_str().fmt(f)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ActionParseError {
    #[error("Failed to parse the action from {0:?}.")]
    UnrecognizedLiteral(String),
}
