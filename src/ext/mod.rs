pub mod chrono;
pub mod serde;
