//! In-process stand-in for the identity endpoints.
//!
//! Tokens are opaque counters the fake remembers as valid until they are
//! expired, revoked or rotated. Clones share one backend, the way two
//! processes talk to the same server.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::api::{ApiError, AuthApi, TokenGrant};
use crate::auth::CredentialPair;
use crate::models::{Principal, ProfileUpdate, Role};

/// Route `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const USERNAME: &str = "mia";
pub const PASSWORD: &str = "chonky-cats-4-life";

struct Backend {
    principal: Principal,
    access: HashSet<String>,
    refresh: HashSet<String>,
    issued: u64,
    outage: bool,
    /// One-shot delay for the next profile fetch, answered from the state
    /// at request time
    stall_profile: Option<Duration>,
    /// Access tokens of successful profile fetches, in order
    accepted: Vec<String>,
}

impl Backend {
    fn issue_access(&mut self) -> String {
        self.issued += 1;
        let token = format!("access-{}", self.issued);
        self.access.insert(token.clone());
        token
    }

    fn issue_refresh(&mut self) -> String {
        let token = format!("refresh-{}", self.issued);
        self.refresh.insert(token.clone());
        token
    }
}

#[derive(Default)]
struct Counters {
    obtain: AtomicUsize,
    refresh: AtomicUsize,
    profile: AtomicUsize,
    update: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeAuthApi {
    backend: Arc<Mutex<Backend>>,
    counters: Arc<Counters>,
    refresh_delay: Duration,
    call_delay: Duration,
    rotate: bool,
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

fn outage() -> ApiError {
    ApiError::ServerError("503 Service Unavailable".to_string())
}

impl FakeAuthApi {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(Mutex::new(Backend {
                principal: Principal {
                    id: Some(42),
                    username: USERNAME.to_string(),
                    email: "mia@chonky.example".to_string(),
                    role: Role::User,
                    profile_picture: None,
                },
                access: HashSet::new(),
                refresh: HashSet::new(),
                issued: 0,
                outage: false,
                stall_profile: None,
                accepted: Vec::new(),
            })),
            counters: Arc::new(Counters::default()),
            refresh_delay: Duration::ZERO,
            call_delay: Duration::ZERO,
            rotate: true,
        }
    }

    /// Time each refresh exchange spends on the wire.
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    /// Time every other request spends on the wire.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// Renewals keep the refresh token instead of rotating it.
    pub fn without_rotation(mut self) -> Self {
        self.rotate = false;
        self
    }

    fn backend(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap()
    }

    /// Issue a valid pair without going through the token endpoint.
    pub fn seed_session(&self) -> CredentialPair {
        let mut backend = self.backend();
        let access = backend.issue_access();
        let refresh = backend.issue_refresh();
        CredentialPair::new(access, refresh)
    }

    pub fn expire_access_tokens(&self) {
        self.backend().access.clear();
    }

    pub fn revoke_refresh_tokens(&self) {
        self.backend().refresh.clear();
    }

    pub fn set_outage(&self, on: bool) {
        self.backend().outage = on;
    }

    /// Hold the next profile answer for `delay`. The answer reflects the
    /// backend as it was when the request arrived.
    pub fn stall_next_profile_fetch(&self, delay: Duration) {
        self.backend().stall_profile = Some(delay);
    }

    pub fn set_username(&self, username: &str) {
        self.backend().principal.username = username.to_string();
    }

    pub fn accepted_tokens(&self) -> Vec<String> {
        self.backend().accepted.clone()
    }

    fn answer_profile(&self, access_token: &str) -> Result<Principal, ApiError> {
        let mut backend = self.backend();
        if backend.outage {
            return Err(outage());
        }
        if !backend.access.contains(access_token) {
            return Err(ApiError::Unauthorized);
        }
        backend.accepted.push(access_token.to_string());
        Ok(backend.principal.clone())
    }

    pub fn obtain_calls(&self) -> usize {
        self.counters.obtain.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.counters.refresh.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.counters.profile.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.counters.update.load(Ordering::SeqCst)
    }
}

impl AuthApi for FakeAuthApi {
    async fn obtain_token(&self, username: &str, password: &str) -> Result<TokenGrant, ApiError> {
        self.counters.obtain.fetch_add(1, Ordering::SeqCst);
        pause(self.call_delay).await;

        let mut backend = self.backend();
        if backend.outage {
            return Err(outage());
        }
        if username != USERNAME || password != PASSWORD {
            return Err(ApiError::Unauthorized);
        }
        let access = backend.issue_access();
        let refresh = backend.issue_refresh();
        Ok(TokenGrant {
            access,
            refresh: Some(refresh),
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        self.counters.refresh.fetch_add(1, Ordering::SeqCst);
        pause(self.refresh_delay).await;

        let mut backend = self.backend();
        if backend.outage {
            return Err(outage());
        }
        if !backend.refresh.contains(refresh_token) {
            return Err(ApiError::Unauthorized);
        }
        let access = backend.issue_access();
        let refresh = if self.rotate {
            backend.refresh.remove(refresh_token);
            Some(backend.issue_refresh())
        } else {
            None
        };
        Ok(TokenGrant { access, refresh })
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<Principal, ApiError> {
        self.counters.profile.fetch_add(1, Ordering::SeqCst);
        let stall = self.backend().stall_profile.take();
        if let Some(delay) = stall {
            let answer = self.answer_profile(access_token);
            tokio::time::sleep(delay).await;
            return answer;
        }
        pause(self.call_delay).await;
        self.answer_profile(access_token)
    }

    async fn update_profile(&self, access_token: &str, update: &ProfileUpdate) -> Result<(), ApiError> {
        self.counters.update.fetch_add(1, Ordering::SeqCst);
        pause(self.call_delay).await;

        let mut backend = self.backend();
        if backend.outage {
            return Err(outage());
        }
        if !backend.access.contains(access_token) {
            return Err(ApiError::Unauthorized);
        }
        if !update.email.contains('@') {
            return Err(ApiError::BadRequest(r#"{"email": ["Enter a valid email address."]}"#.to_string()));
        }
        // The server stores a normalized copy
        backend.principal.username = update.username.trim().to_string();
        backend.principal.email = update.email.trim().to_lowercase();
        if let Some(ref picture) = update.profile_picture {
            backend.principal.profile_picture =
                Some(format!("http://testserver/media/profile_pics/{}", picture.file_name));
        }
        Ok(())
    }
}
