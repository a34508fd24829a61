use std::future::Future;

use serde::Deserialize;

use crate::models::{Principal, ProfileUpdate};

use super::ApiError;

/// Token pair as issued by `POST /token/` and `POST /token/refresh/`.
/// The refresh endpoint only includes `refresh` when it rotates it.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// The identity endpoints the session core talks to.
///
/// `ApiClient` is the HTTP implementation; tests substitute a scripted fake.
pub trait AuthApi: Send + Sync + 'static {
    /// Exchange username and password for a fresh token pair.
    fn obtain_token(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<TokenGrant, ApiError>> + Send;

    /// Exchange a refresh token for a new access token.
    fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenGrant, ApiError>> + Send;

    /// Fetch the canonical profile. Also serves as the liveness check
    /// for a restored credential.
    fn fetch_profile(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<Principal, ApiError>> + Send;

    fn update_profile(
        &self,
        access_token: &str,
        update: &ProfileUpdate,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}
