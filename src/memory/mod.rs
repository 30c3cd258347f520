//! In-memory implementations of every persistence seam, usable as a
//! reference backend and in tests.

mod broker;
mod cache;
mod tickets;

pub use broker::*;
pub use cache::*;
pub use tickets::*;
