//! REST client module for the storefront identity endpoints.
//!
//! This module provides the `AuthApi` seam used by the session core and
//! `ApiClient`, its reqwest implementation. Authentication uses JWT bearer
//! tokens obtained from `/token/` and renewed through `/token/refresh/`.

pub mod auth;
pub mod client;
pub mod error;

pub use auth::{AuthApi, TokenGrant};
pub use client::ApiClient;
pub use error::ApiError;
