pub mod core;
pub mod algos;
mod driver;

pub use driver::*;
pub use core::*;

pub mod executor;
pub mod memory;
pub mod ext;

#[cfg(feature = "web")]
pub mod web;

#[cfg(test)]
pub mod testutil;
