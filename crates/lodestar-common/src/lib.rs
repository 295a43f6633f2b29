//! Lodestar Common: wire error codes, JSON error responses, and small shared helpers
//! used by every Lodestar crate.

pub mod error;
pub mod http;
pub mod persist;
pub mod test;
