//! Physical connection handling.

pub mod session;

pub use session::{ConnectionSession, SessionState};
