//! The session state machine.
//!
//! `SessionManager` owns the credential store, the renewal machinery and
//! the profile cache, and is the only place session transitions happen.
//! Observers follow along through `SessionEvent` broadcasts.

pub mod manager;
pub mod state;

pub use manager::SessionManager;
pub use state::{EndReason, SessionEvent, SessionState};
