//! HTTP client for the storefront identity endpoints.
//!
//! `ApiClient` implements `AuthApi` for the session core and also offers
//! `get_json` / `send_json` so application code can express a call to be
//! wrapped by `SessionManager::with_auth` in one line.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::SessionConfig;
use crate::models::{PictureUpload, Principal, ProfileUpdate};

use super::{ApiError, AuthApi, TokenGrant};

// ============================================================================
// Constants
// ============================================================================

/// Token acquisition endpoint, relative to the API base URL
const TOKEN_PATH: &str = "token/";

/// Token renewal endpoint, relative to the API base URL
const TOKEN_REFRESH_PATH: &str = "token/refresh/";

/// Profile endpoint, relative to the API base URL
const PROFILE_PATH: &str = "profile/";

/// API client for the storefront backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client from configuration
    pub fn new(config: &SessionConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve a path against the API base URL. Absolute URLs pass through.
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T, ApiError> {
        let response = Self::check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse {}: {}", what, e)))
    }

    /// GET a JSON resource with the given bearer token
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T, ApiError> {
        let url = self.endpoint(path);
        debug!(url = %url, "GET");
        let response = self.client.get(&url).bearer_auth(token).send().await?;
        Self::parse(response, &url).await
    }

    /// Send a JSON body with the given method and bearer token, parsing a JSON reply
    pub async fn send_json<B, T>(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path);
        debug!(url = %url, method = %method, "Sending JSON");
        let response = self
            .client
            .request(method, &url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        Self::parse(response, &url).await
    }
}

/// Multipart body for a profile update carrying a picture.
fn profile_form(update: &ProfileUpdate, picture: &PictureUpload) -> Result<Form, ApiError> {
    let part = Part::bytes(picture.bytes.clone())
        .file_name(picture.file_name.clone())
        .mime_str(&picture.mime)
        .map_err(|e| ApiError::BadRequest(format!("Invalid picture type {:?}: {}", picture.mime, e)))?;
    let form = update
        .form_fields()
        .into_iter()
        .fold(Form::new(), |form, (name, value)| form.text(name, value));
    Ok(form.part("profile_picture", part))
}

impl AuthApi for ApiClient {
    async fn obtain_token(&self, username: &str, password: &str) -> Result<TokenGrant, ApiError> {
        let url = self.endpoint(TOKEN_PATH);
        debug!(username = username, "Requesting token pair");

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await?;

        let grant: TokenGrant = Self::parse(response, "token response").await?;
        if grant.refresh.is_none() {
            return Err(ApiError::InvalidResponse(
                "Token response did not include a refresh token".to_string(),
            ));
        }
        Ok(grant)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        let url = self.endpoint(TOKEN_REFRESH_PATH);

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&json!({ "refresh": refresh_token }))
            .send()
            .await?;

        Self::parse(response, "refresh response").await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<Principal, ApiError> {
        self.get_json(PROFILE_PATH, access_token).await
    }

    async fn update_profile(&self, access_token: &str, update: &ProfileUpdate) -> Result<(), ApiError> {
        // The reply echoes the submitted fields; the caller re-fetches the
        // canonical profile instead of trusting it.
        let url = self.endpoint(PROFILE_PATH);
        let request = self.client.put(&url).bearer_auth(access_token);
        let request = match update.profile_picture {
            Some(ref picture) => {
                debug!(url = %url, file = %picture.file_name, "Updating profile with picture");
                request.multipart(profile_form(update, picture)?)
            }
            None => {
                debug!(url = %url, "Updating profile");
                request.json(update)
            }
        };
        let response = request.send().await?;
        Self::check_response(response).await?;
        Ok(())
    }
}
