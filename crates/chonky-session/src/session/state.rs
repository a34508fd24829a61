use serde::Serialize;

use crate::models::PrincipalId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionState {
    #[default]
    LoggedOut,
    Authenticating,
    Authenticated,
    Refreshing,
}

impl SessionState {
    /// A credential pair is held and may be attached to calls.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Refreshing)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum EndReason {
    /// Explicit `logout()`
    Logout,
    /// Refresh token exchange failed
    RenewalFailed,
    /// A call was rejected again with a freshly renewed credential
    Rejected,
    /// A new login replaced the session
    Replaced,
}

/// Broadcast whenever the signed-in principal changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionEvent {
    SignedIn {
        principal: PrincipalId,
    },
    SignedOut {
        principal: PrincipalId,
        reason: EndReason,
    },
}

impl SessionEvent {
    pub fn principal(&self) -> &PrincipalId {
        match self {
            SessionEvent::SignedIn { principal } | SessionEvent::SignedOut { principal, .. } => principal,
        }
    }
}
