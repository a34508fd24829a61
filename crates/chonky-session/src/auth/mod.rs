//! Credential lifecycle building blocks.
//!
//! This module provides:
//! - `CredentialPair` / `PersistenceMode`: the token pair and where it lives
//! - `TokenRefresher`: single-flight refresh-token exchange
//! - `RefreshScheduler`: the cancellable proactive renewal timer

pub mod credentials;
pub mod refresher;
pub mod scheduler;

pub use credentials::{CredentialPair, PersistenceMode};
pub use refresher::{RefreshError, RenewalTicket, TokenRefresher};
pub use scheduler::RefreshScheduler;
