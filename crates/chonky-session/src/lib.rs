//! Client-side session core for the Chonkyweb storefront.
//!
//! `SessionManager` signs a principal in with username and password, keeps
//! the JWT pair in an ephemeral or persistent credential store, renews the
//! access token ahead of expiry and on rejection, and runs authenticated
//! calls through `with_auth`, which retries once after a renewal. Everything
//! else that needs to know who is signed in subscribes to `SessionEvent`s.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use chonky_session::{PersistenceMode, SessionConfig, SessionManager};
//!
//! let config = SessionConfig::load()?;
//! let session = SessionManager::from_config(&config)?;
//! if session.restore().await?.is_none() {
//!     session.login("mia", "hunter2", PersistenceMode::Persistent).await?;
//! }
//!
//! let api = session.api();
//! let orders = session
//!     .with_auth(|token| async move { api.get_json::<serde_json::Value>("orders/", &token).await })
//!     .await?;
//! # let _ = orders;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod session;
pub mod store;

#[cfg(test)]
mod testutil;

pub use api::{ApiClient, ApiError, AuthApi};
pub use auth::{CredentialPair, PersistenceMode};
pub use cache::PrincipalCache;
pub use config::SessionConfig;
pub use error::SessionError;
pub use models::{PictureUpload, Principal, PrincipalId, ProfileUpdate};
pub use session::{EndReason, SessionEvent, SessionManager, SessionState};
pub use store::CredentialStore;
