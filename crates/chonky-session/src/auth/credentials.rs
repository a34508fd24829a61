use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::TokenGrant;

/// Where the active credential pair lives. Chosen once per login ("remember me").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum PersistenceMode {
    /// Cleared when the process ends.
    Ephemeral,
    /// Survives restarts.
    Persistent,
}

impl PersistenceMode {
    pub fn from_remember_me(remember: bool) -> Self {
        if remember {
            PersistenceMode::Persistent
        } else {
            PersistenceMode::Ephemeral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceMode::Ephemeral => "ephemeral",
            PersistenceMode::Persistent => "persistent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ephemeral" => Some(PersistenceMode::Ephemeral),
            "persistent" => Some(PersistenceMode::Persistent),
            _ => None,
        }
    }

    pub fn other(&self) -> Self {
        match self {
            PersistenceMode::Ephemeral => PersistenceMode::Persistent,
            PersistenceMode::Persistent => PersistenceMode::Ephemeral,
        }
    }
}

/// An access/refresh token pair. Replaced wholesale on renewal, never mutated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
}

impl CredentialPair {
    pub fn new(access_token: String, refresh_token: String) -> Self {
        Self {
            access_token,
            refresh_token,
            issued_at: Utc::now(),
        }
    }

    /// Build the pair returned by a renewal. Servers that do not rotate
    /// refresh tokens omit it, so the previous one is carried forward.
    pub fn from_renewal(grant: TokenGrant, previous_refresh: &str) -> Self {
        let refresh = grant
            .refresh
            .unwrap_or_else(|| previous_refresh.to_string());
        Self::new(grant.access, refresh)
    }

    /// Time since issue. An `issued_at` in the future (clock skew, edited
    /// file) counts as just issued.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.issued_at).max(Duration::zero())
    }

    /// Time left until `interval` has elapsed since issue, within `0..=interval`.
    pub fn remaining(&self, interval: std::time::Duration) -> std::time::Duration {
        let interval = Duration::from_std(interval).unwrap_or_else(|_| Duration::weeks(52 * 100));
        (interval - self.age()).to_std().unwrap_or_default()
    }
}

// Tokens are secrets; keep them out of logs.
impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}
