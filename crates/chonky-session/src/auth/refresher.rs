//! Single-flight refresh-token exchange.
//!
//! At most one exchange is on the wire at a time. The exchange runs as its
//! own task and is shared through a `RenewalTicket`; every caller that asks
//! for a renewal while it is outstanding gets a clone of the same ticket.
//! The ticket is dropped from the slot as soon as the exchange settles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthApi};

use super::CredentialPair;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Refresh token rejected: {0}")]
    Rejected(String),

    #[error("Renewal request failed: {0}")]
    Network(String),

    #[error("Renewal task aborted")]
    Aborted,
}

impl From<ApiError> for RefreshError {
    fn from(err: ApiError) -> Self {
        if err.is_transport() {
            RefreshError::Network(err.to_string())
        } else {
            RefreshError::Rejected(err.to_string())
        }
    }
}

/// Shared handle on the outstanding exchange.
pub type RenewalTicket = Shared<BoxFuture<'static, Result<CredentialPair, RefreshError>>>;

struct InFlight {
    id: u64,
    ticket: RenewalTicket,
}

type Slot = Arc<Mutex<Option<InFlight>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<InFlight>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct TokenRefresher<A> {
    api: Arc<A>,
    in_flight: Slot,
    next_id: AtomicU64,
    exchanges: AtomicU64,
}

impl<A: AuthApi> TokenRefresher<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Start an exchange for `refresh_token`, or join the one already running.
    ///
    /// No retry is attempted: a failed exchange is final for that ticket.
    /// Must be called from within a tokio runtime.
    pub fn exchange(&self, refresh_token: &str) -> RenewalTicket {
        self.exchange_then(refresh_token, |_| {})
    }

    /// Like `exchange`, but a newly started exchange runs `on_settle` with
    /// its result before the ticket resolves or leaves the slot. A caller
    /// that joins an outstanding exchange has its `on_settle` dropped.
    pub fn exchange_then<F>(&self, refresh_token: &str, on_settle: F) -> RenewalTicket
    where
        F: FnOnce(&Result<CredentialPair, RefreshError>) + Send + 'static,
    {
        let mut slot = lock(&self.in_flight);
        if let Some(ref outstanding) = *slot {
            debug!(ticket = outstanding.id, "Joining in-flight token renewal");
            return outstanding.ticket.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        info!(ticket = id, "Starting token renewal");

        let api = Arc::clone(&self.api);
        let in_flight = Arc::clone(&self.in_flight);
        let previous_refresh = refresh_token.to_string();

        // Holding `slot` until the ticket is stored keeps the task from
        // clearing a slot that does not contain its ticket yet.
        let task = tokio::spawn(async move {
            let result = api
                .refresh_token(&previous_refresh)
                .await
                .map(|grant| CredentialPair::from_renewal(grant, &previous_refresh))
                .map_err(RefreshError::from);

            match result {
                Ok(_) => debug!(ticket = id, "Token renewal succeeded"),
                Err(ref e) => warn!(ticket = id, error = %e, "Token renewal failed"),
            }
            on_settle(&result);

            let mut slot = lock(&in_flight);
            if slot.as_ref().is_some_and(|f| f.id == id) {
                *slot = None;
            }
            result
        });

        let ticket = async move {
            match task.await {
                Ok(result) => result,
                Err(_) => Err(RefreshError::Aborted),
            }
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            id,
            ticket: ticket.clone(),
        });
        ticket
    }

    /// The outstanding ticket, if an exchange is on the wire.
    pub fn in_flight(&self) -> Option<RenewalTicket> {
        lock(&self.in_flight).as_ref().map(|f| f.ticket.clone())
    }

    /// Detach the outstanding ticket so the next renewal starts fresh.
    /// The exchange itself keeps running; holders of the old ticket still
    /// see its result.
    pub fn discard(&self) {
        if let Some(f) = lock(&self.in_flight).take() {
            debug!(ticket = f.id, "Discarding in-flight token renewal");
        }
    }

    /// Number of exchanges issued so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }
}
