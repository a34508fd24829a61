//! Session lifecycle: login, logout, restore and authenticated calls.
//!
//! All transitions go through one lock guarding the state, the credential
//! store and the session epoch. The epoch is bumped whenever a session
//! starts or ends, and every piece of deferred work (renewal results, timer
//! callbacks, in-flight logins) carries the epoch it was started under, so
//! work belonging to an ended session is dropped instead of resurrecting it.
//!
//! A renewal result is committed inside the exchange task before the
//! shared ticket resolves. Callers that observe `Unauthorized` while the
//! commit is pending join the still-outstanding ticket; callers arriving
//! after it see the new access token in the store and skip the exchange.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, ApiError, AuthApi};
use crate::auth::{
    CredentialPair, PersistenceMode, RefreshError, RefreshScheduler, RenewalTicket, TokenRefresher,
};
use crate::cache::ProfileCache;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::models::{Principal, PrincipalId, ProfileUpdate};
use crate::store::CredentialStore;

use super::{EndReason, SessionEvent, SessionState};

/// Buffered session events per subscriber
const EVENT_CAPACITY: usize = 16;

struct Core {
    state: SessionState,
    epoch: u64,
    /// Set from sign-in until the session ends
    principal: Option<PrincipalId>,
    store: CredentialStore,
}

struct Inner<A> {
    api: Arc<A>,
    core: Mutex<Core>,
    refresher: TokenRefresher<A>,
    scheduler: RefreshScheduler,
    profile: ProfileCache,
    events: broadcast::Sender<SessionEvent>,
    refresh_interval: Duration,
}

/// Cheap to clone; clones share one session.
pub struct SessionManager<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for SessionManager<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SessionManager<ApiClient> {
    /// HTTP client and credential stores as configured.
    pub fn from_config(config: &SessionConfig) -> anyhow::Result<Self> {
        let api = ApiClient::new(config)?;
        let store = CredentialStore::from_config(config)?;
        Ok(Self::new(api, store, config.refresh_interval()))
    }
}

impl<A: AuthApi> SessionManager<A> {
    /// Starts logged out even when `store` holds a pair; call `restore()`
    /// to pick a stored session back up.
    pub fn new(api: A, store: CredentialStore, refresh_interval: Duration) -> Self {
        let api = Arc::new(api);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                refresher: TokenRefresher::new(Arc::clone(&api)),
                api,
                core: Mutex::new(Core {
                    state: SessionState::LoggedOut,
                    epoch: 0,
                    principal: None,
                    store,
                }),
                scheduler: RefreshScheduler::new(),
                profile: ProfileCache::new(),
                events,
                refresh_interval,
            }),
        }
    }

    fn upgrade(weak: &Weak<Inner<A>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn api(&self) -> &A {
        &self.inner.api
    }

    pub fn state(&self) -> SessionState {
        self.core().state
    }

    pub fn current_principal(&self) -> Option<Principal> {
        self.inner.profile.get()
    }

    /// Where the active pair lives; `None` unless signed in.
    pub fn persistence_mode(&self) -> Option<PersistenceMode> {
        let core = self.core();
        if core.state.is_active() {
            core.store.active_mode()
        } else {
            None
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Refresh-token exchanges issued by this session manager.
    pub fn renewal_count(&self) -> u64 {
        self.inner.refresher.exchange_count()
    }

    fn emit(&self, event: Option<SessionEvent>) {
        let Some(event) = event else { return };
        debug!(principal = %event.principal(), event = ?event, "Broadcasting session event");
        if self.inner.events.send(event).is_err() {
            debug!("No session event subscribers");
        }
    }

    /// Sign in with username and password.
    ///
    /// An active session is ended first. The pair is written in `mode`
    /// only after the profile has been fetched with it.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        mode: PersistenceMode,
    ) -> Result<Principal, SessionError> {
        let (epoch, replaced) = {
            let mut core = self.core();
            if core.state == SessionState::Authenticating {
                return Err(SessionError::LoginInProgress);
            }
            let replaced = self.teardown(&mut core, EndReason::Replaced);
            core.epoch += 1;
            core.state = SessionState::Authenticating;
            (core.epoch, replaced)
        };
        self.emit(replaced);

        info!(username = %username, mode = mode.as_str(), "Signing in");
        match self.acquire(username, password).await {
            Ok((pair, principal)) => self.enter_session(epoch, principal, Some((&pair, mode))),
            Err(e) => {
                let mut core = self.core();
                if core.epoch == epoch {
                    core.state = SessionState::LoggedOut;
                }
                warn!(error = %e, "Sign-in failed");
                Err(e)
            }
        }
    }

    async fn acquire(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(CredentialPair, Principal), SessionError> {
        let grant = self
            .inner
            .api
            .obtain_token(username, password)
            .await
            .map_err(SessionError::from_login)?;
        let refresh = grant.refresh.ok_or_else(|| {
            SessionError::Api(ApiError::InvalidResponse(
                "Token response did not include a refresh token".to_string(),
            ))
        })?;
        let pair = CredentialPair::new(grant.access, refresh);

        let principal = self
            .inner
            .api
            .fetch_profile(&pair.access_token)
            .await
            .map_err(SessionError::from_call)?;
        Ok((pair, principal))
    }

    /// Pick up a pair left in the store by an earlier process.
    ///
    /// The pair is validated by fetching the profile, renewing once if the
    /// access token was rejected. Returns `Ok(None)` when nothing is stored.
    /// When the server cannot be reached the pair is kept for a later
    /// attempt and the session stays logged out.
    pub async fn restore(&self) -> Result<Option<Principal>, SessionError> {
        let (epoch, pair) = {
            let mut core = self.core();
            match core.state {
                SessionState::LoggedOut => {}
                SessionState::Authenticating => return Err(SessionError::LoginInProgress),
                SessionState::Authenticated | SessionState::Refreshing => {
                    return Ok(self.inner.profile.get())
                }
            }
            let stored = core.store.read()?;
            let Some(pair) = stored else {
                debug!("No stored credentials to restore");
                return Ok(None);
            };
            core.epoch += 1;
            core.state = SessionState::Authenticating;
            (core.epoch, pair)
        };

        info!(age_secs = pair.age().num_seconds(), "Restoring stored session");
        let api = &self.inner.api;
        let fetched = self
            .call_with_renewal(epoch, pair.access_token, |token| async move {
                api.fetch_profile(&token).await
            })
            .await;

        match fetched {
            Ok(principal) => self.enter_session(epoch, principal, None).map(Some),
            // Stored pair rejected; the renewal path already cleared it
            Err(e) if e.requires_login() => Err(e),
            Err(e) => {
                let mut core = self.core();
                if core.epoch == epoch {
                    core.epoch += 1;
                    core.state = SessionState::LoggedOut;
                    self.inner.scheduler.cancel();
                }
                warn!(error = %e, "Could not validate stored session, keeping credentials");
                Err(e)
            }
        }
    }

    /// Commit a validated sign-in. `fresh` carries a pair that still has
    /// to be written; otherwise the stored pair is used.
    fn enter_session(
        &self,
        epoch: u64,
        principal: Principal,
        fresh: Option<(&CredentialPair, PersistenceMode)>,
    ) -> Result<Principal, SessionError> {
        let id = principal.principal_id();
        let committed = {
            let mut core = self.core();
            if core.epoch != epoch {
                info!("Sign-in abandoned, session ended meanwhile");
                return Err(SessionError::LoginCancelled);
            }
            let pair = match fresh {
                Some((pair, mode)) => core.store.write(pair, mode).map(|()| pair.clone()),
                None => core
                    .store
                    .read()
                    .and_then(|stored| stored.ok_or_else(|| anyhow!("Stored credentials vanished"))),
            };
            match pair {
                Ok(pair) => {
                    core.state = SessionState::Authenticated;
                    core.principal = Some(id.clone());
                    self.inner.profile.set(principal.clone());
                    Ok(pair)
                }
                Err(e) => {
                    core.state = SessionState::LoggedOut;
                    Err(e)
                }
            }
        };

        let pair = match committed {
            Ok(pair) => pair,
            Err(e) => {
                self.inner.scheduler.cancel();
                error!(error = %e, "Failed to store credentials");
                return Err(SessionError::Storage(e));
            }
        };

        let delay = pair.remaining(self.inner.refresh_interval);
        self.schedule_renewal(epoch, pair.refresh_token, delay);
        info!(principal = %id, "Signed in");
        self.emit(Some(SessionEvent::SignedIn { principal: id }));
        Ok(principal)
    }

    /// End the session. Always succeeds; idempotent.
    pub fn logout(&self) {
        info!("Signing out");
        self.end_session(None, EndReason::Logout);
    }

    /// End the session if it is still the one started under `expected`.
    fn end_session(&self, expected: Option<u64>, reason: EndReason) {
        let event = {
            let mut core = self.core();
            if expected.is_some_and(|epoch| epoch != core.epoch) {
                debug!(reason = ?reason, "Session already ended");
                return;
            }
            self.teardown(&mut core, reason)
        };
        self.emit(event);
    }

    /// Clear everything the session holds. Returns the signal to emit once
    /// the lock is released, if a principal was signed in.
    fn teardown(&self, core: &mut Core, reason: EndReason) -> Option<SessionEvent> {
        let previous = core.state;
        core.epoch += 1;
        core.state = SessionState::LoggedOut;
        if let Err(e) = core.store.clear() {
            error!(error = %e, "Failed to clear credential store");
        }
        self.inner.scheduler.cancel();
        self.inner.refresher.discard();
        self.inner.profile.clear();

        let principal = core.principal.take()?;
        info!(principal = %principal, from = ?previous, reason = ?reason, "Session ended");
        Some(SessionEvent::SignedOut { principal, reason })
    }

    /// Run `call` with the current access token. On `Unauthorized` the
    /// credential is renewed (or an outstanding renewal joined) and the call
    /// retried once. A failed renewal or a second rejection ends the
    /// session and yields `SessionExpired`. Other failures pass through.
    pub async fn with_auth<T, F, Fut>(&self, call: F) -> Result<T, SessionError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.with_auth_at(call).await.map(|(_, value)| value)
    }

    /// `with_auth`, also returning the epoch of the session the call ran
    /// under so its result can be checked against the current session.
    async fn with_auth_at<T, F, Fut>(&self, call: F) -> Result<(u64, T), SessionError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let (epoch, access) = self.access_for_call().await?;
        let value = self.call_with_renewal(epoch, access, call).await?;
        Ok((epoch, value))
    }

    async fn access_for_call(&self) -> Result<(u64, String), SessionError> {
        if let Some(ticket) = self.inner.refresher.in_flight() {
            debug!("Waiting for in-flight renewal before dispatching");
            let _ = ticket.await;
        }

        let core = self.core();
        if !core.state.is_active() {
            return Err(SessionError::NotAuthenticated);
        }
        match core.store.read()? {
            Some(pair) => Ok((core.epoch, pair.access_token)),
            None => Err(SessionError::NotAuthenticated),
        }
    }

    async fn call_with_renewal<T, F, Fut>(
        &self,
        epoch: u64,
        access: String,
        call: F,
    ) -> Result<T, SessionError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let stale = match call(access.clone()).await {
            Err(e) if e.is_unauthorized() => access,
            other => return other.map_err(SessionError::from_call),
        };

        debug!("Call rejected, renewing credentials");
        let pair = match self.renew(epoch, &stale).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "Renewal did not produce a credential");
                return Err(SessionError::SessionExpired);
            }
        };

        match call(pair.access_token).await {
            Err(e) if e.is_unauthorized() => {
                warn!("Renewed credential rejected, ending session");
                self.end_session(Some(epoch), EndReason::Rejected);
                Err(SessionError::SessionExpired)
            }
            other => other.map_err(SessionError::from_call),
        }
    }

    /// Reactive renewal. `stale_access` is the token that was rejected; if
    /// the store already holds a different one, that one is returned
    /// without another exchange.
    async fn renew(&self, epoch: u64, stale_access: &str) -> Result<CredentialPair, SessionError> {
        let ticket = {
            let mut core = self.core();
            if core.epoch != epoch {
                return Err(SessionError::SessionExpired);
            }
            let stored = core.store.read();
            match stored {
                Ok(Some(current)) if current.access_token != stale_access => {
                    debug!("Credential already renewed, reusing it");
                    return Ok(current);
                }
                Ok(Some(current)) => {
                    if core.state == SessionState::Authenticated {
                        core.state = SessionState::Refreshing;
                    }
                    self.start_exchange(epoch, &current.refresh_token)
                }
                stored => {
                    if let Err(ref e) = stored {
                        error!(error = %e, "Failed to read stored credentials");
                    }
                    let event = self.teardown(&mut core, EndReason::RenewalFailed);
                    drop(core);
                    self.emit(event);
                    return Err(SessionError::SessionExpired);
                }
            }
        };

        match ticket.await {
            Ok(pair) if self.core().epoch == epoch => Ok(pair),
            Ok(_) => Err(SessionError::SessionExpired),
            Err(e) => Err(SessionError::RefreshFailed(e)),
        }
    }

    /// Must be called with the core lock held, so the commit of the
    /// exchange cannot interleave with the caller's stale-token check.
    fn start_exchange(&self, epoch: u64, refresh_token: &str) -> RenewalTicket {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .refresher
            .exchange_then(refresh_token, move |result| {
                if let Some(manager) = Self::upgrade(&weak) {
                    manager.settle_renewal(epoch, result);
                }
            })
    }

    fn settle_renewal(&self, epoch: u64, result: &Result<CredentialPair, RefreshError>) {
        let mut core = self.core();
        if core.epoch != epoch {
            debug!("Ignoring renewal result for an ended session");
            return;
        }

        let written = match result {
            Ok(pair) => match core.store.active_mode() {
                Some(mode) => core.store.write(pair, mode).map(|()| pair),
                None => Err(anyhow!("No active credential store")),
            },
            Err(e) => {
                warn!(error = %e, "Token renewal failed, ending session");
                let event = self.teardown(&mut core, EndReason::RenewalFailed);
                drop(core);
                self.emit(event);
                return;
            }
        };

        match written {
            Ok(pair) => {
                if core.state == SessionState::Refreshing {
                    core.state = SessionState::Authenticated;
                }
                drop(core);
                self.schedule_renewal(epoch, pair.refresh_token.clone(), self.inner.refresh_interval);
                info!("Credentials renewed");
            }
            Err(e) => {
                error!(error = %e, "Failed to store renewed credentials, ending session");
                let event = self.teardown(&mut core, EndReason::RenewalFailed);
                drop(core);
                self.emit(event);
            }
        }
    }

    fn schedule_renewal(&self, epoch: u64, refresh_token: String, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .scheduler
            .arm(refresh_token, delay, move |token| async move {
                if let Some(manager) = Self::upgrade(&weak) {
                    manager.proactive_renew(epoch, &token).await;
                }
            });
    }

    async fn proactive_renew(&self, epoch: u64, refresh_token: &str) {
        let ticket = {
            let mut core = self.core();
            if core.epoch != epoch || core.state != SessionState::Authenticated {
                debug!(state = ?core.state, "Skipping proactive renewal");
                return;
            }
            let stored = core.store.read();
            match stored {
                Ok(Some(current)) => {
                    if current.refresh_token != refresh_token {
                        debug!("Refresh token changed since the timer was armed");
                    }
                    core.state = SessionState::Refreshing;
                    self.start_exchange(epoch, &current.refresh_token)
                }
                stored => {
                    if let Err(ref e) = stored {
                        error!(error = %e, "Failed to read stored credentials");
                    }
                    let event = self.teardown(&mut core, EndReason::RenewalFailed);
                    drop(core);
                    self.emit(event);
                    return;
                }
            }
        };

        debug!("Proactive renewal started");
        // Committed or torn down by settle_renewal
        let _ = ticket.await;
    }

    /// Submit a profile edit, then cache the server's canonical copy.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<Principal, SessionError> {
        let api = &self.inner.api;
        self.with_auth(|token| async move { api.update_profile(&token, update).await })
            .await?;
        info!("Profile updated");
        self.refresh_profile().await
    }

    /// Re-fetch the principal. The principal id used for scoped caches is
    /// fixed at sign-in and does not follow profile edits.
    ///
    /// A fetch that lands after its session ended is discarded, even if a
    /// new session has started meanwhile.
    pub async fn refresh_profile(&self) -> Result<Principal, SessionError> {
        let api = &self.inner.api;
        let (epoch, principal) = self
            .with_auth_at(|token| async move { api.fetch_profile(&token).await })
            .await?;

        let core = self.core();
        if core.epoch != epoch || !core.state.is_active() {
            debug!("Discarding profile fetched by an ended session");
            return Err(SessionError::SessionExpired);
        }
        self.inner.profile.set(principal.clone());
        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PrincipalCache;
    use crate::models::PictureUpload;
    use crate::store::{KeyValueStore, MemoryStore, KEY_ACCESS, KEY_MODE};
    use crate::testutil::{init_tracing, FakeAuthApi, PASSWORD, USERNAME};
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::time::sleep;

    const INTERVAL: Duration = Duration::from_secs(25 * 60);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    struct Harness {
        manager: SessionManager<FakeAuthApi>,
        ephemeral: MemoryStore,
        persistent: MemoryStore,
    }

    impl Harness {
        fn new(api: FakeAuthApi) -> Self {
            Self::with_persistent(api, MemoryStore::new())
        }

        fn with_persistent(api: FakeAuthApi, persistent: MemoryStore) -> Self {
            init_tracing();
            let ephemeral = MemoryStore::new();
            let store = CredentialStore::open(Box::new(ephemeral.clone()), Box::new(persistent.clone()))
                .unwrap();
            Self {
                manager: SessionManager::new(api, store, INTERVAL),
                ephemeral,
                persistent,
            }
        }

        /// Same backend and persistent namespace, fresh process memory.
        fn restart(&self) -> Self {
            Self::with_persistent(self.api().clone(), self.persistent.clone())
        }

        fn api(&self) -> &FakeAuthApi {
            self.manager.api()
        }

        async fn login(&self, mode: PersistenceMode) -> Principal {
            self.manager.login(USERNAME, PASSWORD, mode).await.unwrap()
        }
    }

    async fn fetch_profile(manager: &SessionManager<FakeAuthApi>) -> Result<Principal, SessionError> {
        let api = manager.api();
        manager
            .with_auth(|token| async move { api.fetch_profile(&token).await })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_ephemeral() {
        let h = Harness::new(FakeAuthApi::new());
        let mut events = h.manager.subscribe();

        let principal = h.login(PersistenceMode::Ephemeral).await;
        assert_eq!(principal.username, USERNAME);
        assert_eq!(h.manager.state(), SessionState::Authenticated);
        assert_eq!(h.manager.persistence_mode(), Some(PersistenceMode::Ephemeral));
        assert_eq!(h.manager.current_principal(), Some(principal.clone()));
        assert!(h.persistent.is_empty());
        assert_eq!(h.ephemeral.get(KEY_MODE).unwrap().as_deref(), Some("ephemeral"));
        assert!(h.manager.inner.scheduler.is_armed());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SignedIn {
                principal: principal.principal_id()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_persistent_leaves_ephemeral_empty() {
        let h = Harness::new(FakeAuthApi::new());
        h.login(PersistenceMode::Persistent).await;
        assert!(h.ephemeral.is_empty());
        assert_eq!(h.persistent.get(KEY_MODE).unwrap().as_deref(), Some("persistent"));
        assert_eq!(h.manager.persistence_mode(), Some(PersistenceMode::Persistent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_invalid_credentials_retains_nothing() {
        let h = Harness::new(FakeAuthApi::new());
        let mut events = h.manager.subscribe();

        let result = h.manager.login(USERNAME, "wrong", PersistenceMode::Persistent).await;
        assert!(matches!(result, Err(SessionError::InvalidCredentials)));
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(h.ephemeral.is_empty() && h.persistent.is_empty());
        assert!(h.manager.current_principal().is_none());
        assert!(!h.manager.inner.scheduler.is_armed());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_during_outage_is_network_failure() {
        let h = Harness::new(FakeAuthApi::new());
        h.api().set_outage(true);
        let result = h.manager.login(USERNAME, PASSWORD, PersistenceMode::Ephemeral).await;
        assert!(matches!(result, Err(SessionError::NetworkFailure(_))));
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_login_while_authenticating_is_rejected() {
        let h = Harness::new(FakeAuthApi::new().with_call_delay(ms(100)));
        let manager = h.manager.clone();
        let first = tokio::spawn(async move {
            manager.login(USERNAME, PASSWORD, PersistenceMode::Ephemeral).await
        });
        sleep(ms(10)).await;
        assert_eq!(h.manager.state(), SessionState::Authenticating);

        let second = h.manager.login(USERNAME, PASSWORD, PersistenceMode::Ephemeral).await;
        assert!(matches!(second, Err(SessionError::LoginInProgress)));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(h.api().obtain_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_login_cancels_it() {
        let h = Harness::new(FakeAuthApi::new().with_call_delay(ms(100)));
        let manager = h.manager.clone();
        let login = tokio::spawn(async move {
            manager.login(USERNAME, PASSWORD, PersistenceMode::Persistent).await
        });
        sleep(ms(10)).await;
        h.manager.logout();

        assert!(matches!(login.await.unwrap(), Err(SessionError::LoginCancelled)));
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(h.persistent.is_empty());
        assert!(h.manager.current_principal().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relogin_replaces_session() {
        let h = Harness::new(FakeAuthApi::new());
        let mut events = h.manager.subscribe();
        let principal = h.login(PersistenceMode::Persistent).await;
        h.login(PersistenceMode::Ephemeral).await;

        let id = principal.principal_id();
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedIn { principal: id.clone() });
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SignedOut {
                principal: id.clone(),
                reason: EndReason::Replaced
            }
        );
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedIn { principal: id });
        assert!(h.persistent.is_empty());
        assert!(!h.ephemeral.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_access_renews_once_and_retries() {
        let h = Harness::new(FakeAuthApi::new());
        let principal = h.login(PersistenceMode::Ephemeral).await;
        let before = h.ephemeral.get(KEY_ACCESS).unwrap();
        h.api().expire_access_tokens();

        let fetched = fetch_profile(&h.manager).await.unwrap();
        assert_eq!(fetched, principal);
        assert_eq!(h.api().refresh_calls(), 1);
        // login fetch, rejected call, retried call
        assert_eq!(h.api().profile_calls(), 3);
        assert_ne!(h.ephemeral.get(KEY_ACCESS).unwrap(), before);
        assert!(h.persistent.is_empty());
        assert_eq!(h.manager.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_rejections_share_one_renewal() {
        let h = Harness::new(
            FakeAuthApi::new()
                .with_call_delay(ms(10))
                .with_refresh_delay(ms(100)),
        );
        h.login(PersistenceMode::Ephemeral).await;
        h.api().expire_access_tokens();

        let results = join_all((0..6).map(|_| fetch_profile(&h.manager))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(h.api().refresh_calls(), 1);
        assert_eq!(h.manager.renewal_count(), 1);

        let accepted = h.api().accepted_tokens();
        let retried = &accepted[1..];
        assert_eq!(retried.len(), 6);
        assert!(retried.iter().all(|t| t == &retried[0]));
        assert_ne!(retried[0], accepted[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_waits_for_in_flight_renewal() {
        let h = Harness::new(FakeAuthApi::new().with_refresh_delay(ms(100)));
        h.login(PersistenceMode::Ephemeral).await;
        h.api().expire_access_tokens();

        let manager = h.manager.clone();
        let rejected = tokio::spawn(async move { fetch_profile(&manager).await });
        sleep(ms(10)).await;
        assert_eq!(h.manager.state(), SessionState::Refreshing);

        // Dispatched mid-renewal: must not be sent with the expired token
        let waiting = fetch_profile(&h.manager).await;
        assert!(waiting.is_ok());
        assert!(rejected.await.unwrap().is_ok());
        assert_eq!(h.api().refresh_calls(), 1);
        // login, first rejected call, two calls with the renewed token
        assert_eq!(h.api().profile_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_ends_session_and_purges_cart() {
        let dir = tempdir().unwrap();
        let carts = Arc::new(PrincipalCache::new(dir.path().to_path_buf()).unwrap());
        let h = Harness::new(FakeAuthApi::new());
        let listener = Arc::clone(&carts).spawn_purge_listener(h.manager.subscribe());
        let mut events = h.manager.subscribe();

        let id = h.login(PersistenceMode::Persistent).await.principal_id();
        carts.save("cart", Some(&id), &vec!["tuna", "laser pointer"]).unwrap();
        carts.save("cart", None, &vec!["catnip"]).unwrap();
        h.api().expire_access_tokens();
        h.api().revoke_refresh_tokens();

        let result = fetch_profile(&h.manager).await;
        assert!(matches!(result, Err(SessionError::SessionExpired)));
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(h.ephemeral.is_empty() && h.persistent.is_empty());
        assert!(h.manager.current_principal().is_none());
        assert!(!h.manager.inner.scheduler.is_armed());

        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedIn { principal: id.clone() });
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SignedOut {
                principal: id.clone(),
                reason: EndReason::RenewalFailed
            }
        );
        assert!(events.try_recv().is_err());

        // Dropping the only manager closes the channel and stops the listener
        drop(h);
        listener.await.unwrap();
        assert!(carts.load::<Vec<String>>("cart", Some(&id)).unwrap().is_none());
        assert!(carts.load::<Vec<String>>("cart", None).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_rejection_ends_session() {
        let h = Harness::new(FakeAuthApi::new());
        let mut events = h.manager.subscribe();
        let id = h.login(PersistenceMode::Ephemeral).await.principal_id();
        let attempts = AtomicUsize::new(0);

        let result: Result<(), _> = h
            .manager
            .with_auth(|_token| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::Unauthorized) }
            })
            .await;

        assert!(matches!(result, Err(SessionError::SessionExpired)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.api().refresh_calls(), 1);
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(h.ephemeral.is_empty());

        let _signed_in = events.try_recv().unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SignedOut {
                principal: id,
                reason: EndReason::Rejected
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_pass_through() {
        let h = Harness::new(FakeAuthApi::new());
        h.login(PersistenceMode::Ephemeral).await;

        let result: Result<(), _> = h
            .manager
            .with_auth(|_token| async { Err(ApiError::NotFound("cart 9".to_string())) })
            .await;
        assert!(matches!(result, Err(SessionError::Api(ApiError::NotFound(_)))));
        assert_eq!(h.manager.state(), SessionState::Authenticated);
        assert_eq!(h.api().refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_auth_requires_session() {
        let h = Harness::new(FakeAuthApi::new());
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = h
            .manager
            .with_auth(|_token| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(SessionError::NotAuthenticated)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_cancels_pending_timer() {
        let h = Harness::new(FakeAuthApi::new());
        let mut events = h.manager.subscribe();
        h.login(PersistenceMode::Persistent).await;
        assert!(h.manager.inner.scheduler.is_armed());

        h.manager.logout();
        h.manager.logout();
        assert!(!h.manager.inner.scheduler.is_armed());

        sleep(INTERVAL * 3).await;
        assert_eq!(h.api().refresh_calls(), 0);
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(h.persistent.is_empty());

        let _signed_in = events.try_recv().unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::SignedOut {
                reason: EndReason::Logout,
                ..
            }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_wins_over_in_flight_renewal() {
        let h = Harness::new(FakeAuthApi::new().with_refresh_delay(ms(200)));
        h.login(PersistenceMode::Ephemeral).await;
        h.api().expire_access_tokens();

        let manager = h.manager.clone();
        let call = tokio::spawn(async move { fetch_profile(&manager).await });
        sleep(ms(50)).await;
        assert_eq!(h.manager.state(), SessionState::Refreshing);

        h.manager.logout();
        assert!(matches!(call.await.unwrap(), Err(SessionError::SessionExpired)));

        sleep(INTERVAL * 2).await;
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(h.ephemeral.is_empty());
        assert_eq!(h.api().refresh_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_renewal_rearms() {
        let h = Harness::new(FakeAuthApi::new());
        h.login(PersistenceMode::Ephemeral).await;
        let first = h.ephemeral.get(KEY_ACCESS).unwrap();

        sleep(INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(h.api().refresh_calls(), 1);
        assert_eq!(h.manager.state(), SessionState::Authenticated);
        assert_ne!(h.ephemeral.get(KEY_ACCESS).unwrap(), first);
        assert!(h.manager.inner.scheduler.is_armed());

        sleep(INTERVAL).await;
        assert_eq!(h.api().refresh_calls(), 2);
        assert!(fetch_profile(&h.manager).await.is_ok());
        assert_eq!(h.api().refresh_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_renewal_failure_ends_session() {
        let h = Harness::new(FakeAuthApi::new());
        let mut events = h.manager.subscribe();
        h.login(PersistenceMode::Persistent).await;
        h.api().revoke_refresh_tokens();

        sleep(INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(h.persistent.is_empty());

        let _signed_in = events.try_recv().unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::SignedOut {
                reason: EndReason::RenewalFailed,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_profile_caches_server_copy() {
        let h = Harness::new(FakeAuthApi::new());
        let principal = h.login(PersistenceMode::Ephemeral).await;
        h.api().expire_access_tokens();

        let mut update = ProfileUpdate::from_principal(&principal);
        update.email = "Mia@Chonky.Example".to_string();
        let updated = h.manager.update_profile(&update).await.unwrap();

        assert_eq!(updated.email, "mia@chonky.example");
        assert_eq!(h.manager.current_principal(), Some(updated));
        assert_eq!(h.api().refresh_calls(), 1);
        // rejected once, then retried
        assert_eq!(h.api().update_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_profile_with_picture() {
        let h = Harness::new(FakeAuthApi::new());
        let principal = h.login(PersistenceMode::Ephemeral).await;
        assert_eq!(principal.profile_picture, None);

        let update = ProfileUpdate::from_principal(&principal)
            .with_picture(PictureUpload::new("whiskers.png", vec![0x89, b'P', b'N', b'G']));
        let updated = h.manager.update_profile(&update).await.unwrap();

        assert_eq!(
            updated.profile_picture.as_deref(),
            Some("http://testserver/media/profile_pics/whiskers.png")
        );
        assert_eq!(h.manager.current_principal(), Some(updated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_profile_update_keeps_session() {
        let h = Harness::new(FakeAuthApi::new());
        let principal = h.login(PersistenceMode::Ephemeral).await;

        let mut update = ProfileUpdate::from_principal(&principal);
        update.email = "not-an-email".to_string();
        let result = h.manager.update_profile(&update).await;

        assert!(matches!(result, Err(SessionError::Api(ApiError::BadRequest(_)))));
        assert_eq!(h.manager.current_principal(), Some(principal));
        assert_eq!(h.manager.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_fetched_by_ended_session_is_discarded() {
        let h = Harness::new(FakeAuthApi::new());
        h.login(PersistenceMode::Ephemeral).await;
        h.api().stall_next_profile_fetch(Duration::from_secs(5));

        let manager = h.manager.clone();
        let stale = tokio::spawn(async move { manager.refresh_profile().await });
        sleep(ms(10)).await;

        h.manager.logout();
        h.api().set_username("mia.renamed");
        let current = h.login(PersistenceMode::Ephemeral).await;
        assert_eq!(current.username, "mia.renamed");

        assert!(matches!(stale.await.unwrap(), Err(SessionError::SessionExpired)));
        assert_eq!(h.manager.current_principal(), Some(current));
        assert_eq!(h.manager.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_persistent_session_after_restart() {
        let h = Harness::new(FakeAuthApi::new());
        let principal = h.login(PersistenceMode::Persistent).await;

        let restarted = h.restart();
        let mut events = restarted.manager.subscribe();
        assert_eq!(restarted.manager.state(), SessionState::LoggedOut);

        let restored = restarted.manager.restore().await.unwrap();
        assert_eq!(restored, Some(principal.clone()));
        assert_eq!(restarted.manager.state(), SessionState::Authenticated);
        assert_eq!(restarted.manager.persistence_mode(), Some(PersistenceMode::Persistent));
        assert!(restarted.manager.inner.scheduler.is_armed());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SignedIn {
                principal: principal.principal_id()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ephemeral_session_not_restored() {
        let h = Harness::new(FakeAuthApi::new());
        h.login(PersistenceMode::Ephemeral).await;

        let restarted = h.restart();
        assert_eq!(restarted.manager.restore().await.unwrap(), None);
        assert_eq!(restarted.manager.state(), SessionState::LoggedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_renews_expired_access() {
        let h = Harness::new(FakeAuthApi::new());
        h.login(PersistenceMode::Persistent).await;
        let before = h.persistent.get(KEY_ACCESS).unwrap();
        h.api().expire_access_tokens();

        let restarted = h.restart();
        assert!(restarted.manager.restore().await.unwrap().is_some());
        assert_eq!(h.api().refresh_calls(), 1);
        assert_ne!(restarted.persistent.get(KEY_ACCESS).unwrap(), before);
        assert_eq!(restarted.manager.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_during_outage_keeps_credentials() {
        let h = Harness::new(FakeAuthApi::new());
        h.login(PersistenceMode::Persistent).await;
        h.api().set_outage(true);

        let restarted = h.restart();
        let result = restarted.manager.restore().await;
        assert!(matches!(result, Err(SessionError::NetworkFailure(_))));
        assert_eq!(restarted.manager.state(), SessionState::LoggedOut);
        assert!(!restarted.persistent.is_empty());
        assert!(!restarted.manager.inner.scheduler.is_armed());

        h.api().set_outage(false);
        assert!(restarted.manager.restore().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_with_revoked_credentials_clears_store() {
        let h = Harness::new(FakeAuthApi::new());
        h.login(PersistenceMode::Persistent).await;
        h.api().expire_access_tokens();
        h.api().revoke_refresh_tokens();

        let restarted = h.restart();
        let result = restarted.manager.restore().await;
        assert!(matches!(result, Err(SessionError::SessionExpired)));
        assert_eq!(restarted.manager.state(), SessionState::LoggedOut);
        assert!(restarted.persistent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_timer_counts_from_issue_time() {
        let api = FakeAuthApi::new();
        let mut pair = api.seed_session();
        pair.issued_at = chrono::Utc::now() - chrono::Duration::minutes(20);

        let persistent = MemoryStore::new();
        CredentialStore::open(Box::new(MemoryStore::new()), Box::new(persistent.clone()))
            .unwrap()
            .write(&pair, PersistenceMode::Persistent)
            .unwrap();

        let h = Harness::with_persistent(api, persistent);
        assert!(h.manager.restore().await.unwrap().is_some());

        // 25 minute interval, 20 already spent
        sleep(Duration::from_secs(4 * 60)).await;
        assert_eq!(h.api().refresh_calls(), 0);
        sleep(Duration::from_secs(2 * 60)).await;
        assert_eq!(h.api().refresh_calls(), 1);
    }
}
