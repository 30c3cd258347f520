pub mod action;
pub mod collab;
pub mod config;
pub mod crypto;
pub mod error;
pub mod guard;
pub mod model;
pub mod query;
pub mod restraint;
pub mod ticket;
pub mod userservice;

pub use action::*;
pub use error::*;
pub use query::*;
pub use crypto::MsSinceEpoch;
