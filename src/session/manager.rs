//! Session manager: owns the state machine and the single-flight refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{LanewireError, Result};
use crate::store::{keys, CredentialStore};

use super::credential::Credential;
use super::identity::Identity;
use super::state::{SessionChange, SessionState};

type SharedRefresh = Shared<BoxFuture<'static, Result<String>>>;
type ChangeHandler = Arc<dyn Fn(&SessionChange) + Send + Sync>;

/// Body of the refresh endpoint's success response. The refresh token may
/// rotate; identity metadata may be re-issued alongside.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    user: Option<Identity>,
}

struct SessionInner {
    state: SessionState,
    credential: Option<Credential>,
    identity: Option<Identity>,
    refresh: Option<SharedRefresh>,
    refresh_cancel: Option<CancellationToken>,
    // Bumped by logout; a refresh completing under a stale epoch must not
    // touch state or store.
    epoch: u64,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Anonymous,
            credential: None,
            identity: None,
            refresh: None,
            refresh_cancel: None,
            epoch: 0,
        }
    }
}

/// Owns the session state machine.
///
/// Exactly one instance owns the credential cache and the in-flight refresh
/// future; other components (request pipeline, realtime channel) only call
/// its methods, never mutate its state directly. Construct one per process
/// (or per test) and share it behind [`Arc`] — there is no global instance.
pub struct SessionManager {
    http: reqwest::Client,
    refresh_url: String,
    refresh_timeout: Duration,
    expiry_skew: Duration,
    store: Arc<dyn CredentialStore>,
    inner: Mutex<SessionInner>,
    observers: Mutex<Vec<(u64, ChangeHandler)>>,
    next_observer_id: AtomicU64,
    // Handed to the refresh future and to subscriptions, which must not
    // keep the manager alive on their own.
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CredentialStore>, config: &ClientConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            http: reqwest::Client::new(),
            refresh_url: config.refresh_url(),
            refresh_timeout: config.refresh_timeout,
            expiry_skew: config.token_expiry_skew,
            store,
            inner: Mutex::new(SessionInner::new()),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            weak_self: weak_self.clone(),
        })
    }

    /// Current state, as a synchronous snapshot.
    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    /// Identity of the logged-in user, if any.
    pub fn identity(&self) -> Option<Identity> {
        self.lock_inner().identity.clone()
    }

    /// Cached access token without validity checks; prefer
    /// [`get_valid_access_token`](Self::get_valid_access_token) for requests.
    pub fn access_token(&self) -> Option<String> {
        self.lock_inner()
            .credential
            .as_ref()
            .map(|credential| credential.access_token.clone())
    }

    /// Install a freshly issued credential pair and identity.
    ///
    /// The store writes are acknowledged before any in-memory state changes,
    /// so a crash right after `login` returns cannot lose the session.
    pub fn login(
        &self,
        identity: Identity,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<()> {
        let serialized = serde_json::to_string(&identity)
            .map_err(|err| LanewireError::Storage(err.to_string()))?;
        self.store.set(keys::ACCESS_TOKEN, access_token)?;
        self.store.set(keys::REFRESH_TOKEN, refresh_token)?;
        self.store.set(keys::USER, &serialized)?;

        let change = {
            let mut inner = self.lock_inner();
            let from = inner.state;
            inner.credential = Some(Credential {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
                expires_at: None,
            });
            inner.identity = Some(identity.clone());
            inner.state = SessionState::Authenticated;
            SessionChange {
                from,
                to: SessionState::Authenticated,
                identity: Some(identity),
                reason: None,
            }
        };
        self.emit(change);
        Ok(())
    }

    /// Rehydrate a persisted session from the credential store.
    ///
    /// Returns `true` when stored credentials were found and the session is
    /// now authenticated. Intended to run once at startup.
    pub fn restore(&self) -> Result<bool> {
        let access_token = self.store.get(keys::ACCESS_TOKEN)?;
        let refresh_token = self.store.get(keys::REFRESH_TOKEN)?;
        let user = self.store.get(keys::USER)?;
        let (Some(access_token), Some(refresh_token), Some(user)) =
            (access_token, refresh_token, user)
        else {
            return Ok(false);
        };
        let identity: Identity = serde_json::from_str(&user).map_err(|err| {
            LanewireError::Storage(format!("persisted identity unreadable: {err}"))
        })?;

        let change = {
            let mut inner = self.lock_inner();
            let from = inner.state;
            inner.credential = Some(Credential {
                access_token,
                refresh_token,
                expires_at: None,
            });
            inner.identity = Some(identity.clone());
            inner.state = SessionState::Authenticated;
            SessionChange {
                from,
                to: SessionState::Authenticated,
                identity: Some(identity),
                reason: None,
            }
        };
        self.emit(change);
        Ok(true)
    }

    /// Tear down the session.
    ///
    /// Idempotent and safe to call while a refresh is in flight: the refresh
    /// is cancelled and every waiter observes `Unauthenticated`. Observers
    /// (and through them the realtime channel) are notified before the store
    /// is cleared, so nothing can act on a logged-out session that still
    /// holds tokens in memory.
    pub fn logout(&self) -> Result<()> {
        let change = {
            let mut inner = self.lock_inner();
            inner.epoch += 1;
            if let Some(cancel) = inner.refresh_cancel.take() {
                cancel.cancel();
            }
            inner.refresh = None;
            let from = inner.state;
            inner.state = SessionState::Anonymous;
            inner.credential = None;
            inner.identity = None;
            (from != SessionState::Anonymous).then_some(SessionChange {
                from,
                to: SessionState::Anonymous,
                identity: None,
                reason: None,
            })
        };
        if let Some(change) = change {
            self.emit(change);
        }
        self.clear_session_keys()
    }

    /// Resolve an access token suitable for an authenticated request.
    ///
    /// Returns the cached token while it is fresh, joins the in-flight
    /// refresh when one exists, and otherwise starts one. Rejects with
    /// `Unauthenticated` for anonymous and expired sessions.
    pub async fn get_valid_access_token(&self) -> Result<String> {
        let (refresh, change) = {
            let mut inner = self.lock_inner();
            match inner.state {
                SessionState::Anonymous | SessionState::Expired => {
                    return Err(LanewireError::Unauthenticated)
                }
                SessionState::Refreshing => (self.in_flight_refresh(&inner)?, None),
                SessionState::Authenticated => {
                    let credential = inner
                        .credential
                        .as_ref()
                        .ok_or(LanewireError::Unauthenticated)?;
                    if !credential.needs_refresh(self.expiry_skew) {
                        return Ok(credential.access_token.clone());
                    }
                    let (refresh, change) = self.begin_refresh_locked(&mut inner);
                    (refresh, Some(change))
                }
            }
        };
        if let Some(change) = change {
            self.emit(change);
        }
        refresh.await
    }

    /// Force a refresh after the backend rejected the current access token.
    ///
    /// Joins the in-flight refresh when one exists. The transition into
    /// `Refreshing` happens synchronously under the state lock, so any
    /// number of concurrent 401s share a single refresh call.
    pub async fn refresh_after_unauthorized(&self) -> Result<String> {
        let (refresh, change) = {
            let mut inner = self.lock_inner();
            match inner.state {
                SessionState::Anonymous | SessionState::Expired => {
                    return Err(LanewireError::Unauthenticated)
                }
                SessionState::Refreshing => (self.in_flight_refresh(&inner)?, None),
                SessionState::Authenticated => {
                    let (refresh, change) = self.begin_refresh_locked(&mut inner);
                    (refresh, Some(change))
                }
            }
        };
        if let Some(change) = change {
            self.emit(change);
        }
        refresh.await
    }

    /// Register a synchronous observer for session transitions.
    ///
    /// Observers run in registration order on the task performing the
    /// transition. The returned guard unregisters on drop.
    pub fn on_session_change<F>(&self, handler: F) -> SessionSubscription
    where
        F: Fn(&SessionChange) + Send + Sync + 'static,
    {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.lock_observers().push((id, Arc::new(handler)));
        SessionSubscription {
            manager: self.weak_self.clone(),
            id,
        }
    }

    /// Remember the login email for pre-filling the next sign-in. Survives
    /// logout.
    pub fn remember_email(&self, email: &str) -> Result<()> {
        self.store.set(keys::SAVED_EMAIL, email)
    }

    pub fn saved_email(&self) -> Result<Option<String>> {
        self.store.get(keys::SAVED_EMAIL)
    }

    /// Stash the secret released by a successful biometric prompt. Survives
    /// logout, like the saved email it pairs with.
    pub fn set_biometric_secret(&self, secret: &str) -> Result<()> {
        self.store.set(keys::BIOMETRIC_SECRET, secret)
    }

    pub fn biometric_secret(&self) -> Result<Option<String>> {
        self.store.get(keys::BIOMETRIC_SECRET)
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_observers(&self) -> MutexGuard<'_, Vec<(u64, ChangeHandler)>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, change: SessionChange) {
        let handlers: Vec<ChangeHandler> = self
            .lock_observers()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(&change);
        }
    }

    fn in_flight_refresh(&self, inner: &SessionInner) -> Result<SharedRefresh> {
        inner.refresh.clone().ok_or_else(|| {
            LanewireError::InvalidState("refreshing with no refresh in flight".to_string())
        })
    }

    /// Start the single-flight refresh. Caller holds the state lock; the
    /// `Refreshing` transition and the future installation are atomic.
    fn begin_refresh_locked(&self, inner: &mut SessionInner) -> (SharedRefresh, SessionChange) {
        let refresh_token = inner
            .credential
            .as_ref()
            .map(|credential| credential.refresh_token.clone());
        let epoch = inner.epoch;
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let manager = self.weak_self.clone();
        let refresh = async move {
            let Some(manager) = manager.upgrade() else {
                return Err(LanewireError::Unauthenticated);
            };
            let outcome = tokio::select! {
                _ = guard.cancelled() => return Err(LanewireError::Unauthenticated),
                outcome = manager.execute_refresh(refresh_token) => outcome,
            };
            manager.finish_refresh(epoch, outcome)
        }
        .boxed()
        .shared();
        inner.refresh = Some(refresh.clone());
        inner.refresh_cancel = Some(cancel);
        let from = inner.state;
        inner.state = SessionState::Refreshing;
        (
            refresh,
            SessionChange {
                from,
                to: SessionState::Refreshing,
                identity: None,
                reason: None,
            },
        )
    }

    /// One network round-trip to the refresh endpoint. Every failure mode
    /// (missing token, non-2xx, timeout, connectivity) maps to
    /// `RefreshFailed`.
    async fn execute_refresh(&self, refresh_token: Option<String>) -> Result<RefreshResponse> {
        let refresh_token = refresh_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| LanewireError::RefreshFailed("no refresh token".to_string()))?;
        let response = self
            .http
            .post(&self.refresh_url)
            .timeout(self.refresh_timeout)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LanewireError::RefreshFailed("refresh request timed out".to_string())
                } else {
                    LanewireError::RefreshFailed(err.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(LanewireError::RefreshFailed(format!(
                "refresh endpoint returned status {}",
                response.status()
            )));
        }
        response.json::<RefreshResponse>().await.map_err(|err| {
            LanewireError::RefreshFailed(format!("malformed refresh response: {err}"))
        })
    }

    fn finish_refresh(&self, epoch: u64, outcome: Result<RefreshResponse>) -> Result<String> {
        match outcome {
            Ok(refreshed) => self.apply_refresh_success(epoch, refreshed),
            Err(error) => self.apply_refresh_failure(epoch, error),
        }
    }

    fn apply_refresh_success(&self, epoch: u64, refreshed: RefreshResponse) -> Result<String> {
        let mut inner = self.lock_inner();
        if inner.epoch != epoch {
            return Err(LanewireError::Unauthenticated);
        }
        inner.refresh = None;
        inner.refresh_cancel = None;
        let previous = inner.credential.clone().ok_or_else(|| {
            LanewireError::InvalidState("refresh completed without a credential".to_string())
        })?;
        let rotated = refreshed
            .refresh_token
            .clone()
            .unwrap_or(previous.refresh_token);

        // Store writes happen under the state lock so a concurrent logout
        // cannot land between the write and the in-memory update.
        if let Err(error) = self.persist_refreshed(&refreshed, &rotated) {
            // Keep the previous credential; the caller sees the storage
            // error and the session stays authenticated.
            inner.state = SessionState::Authenticated;
            let identity = inner.identity.clone();
            drop(inner);
            self.emit(SessionChange {
                from: SessionState::Refreshing,
                to: SessionState::Authenticated,
                identity,
                reason: None,
            });
            return Err(error);
        }

        let expires_at = refreshed
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        inner.credential = Some(Credential {
            access_token: refreshed.access_token.clone(),
            refresh_token: rotated,
            expires_at,
        });
        if let Some(identity) = refreshed.user {
            inner.identity = Some(identity);
        }
        inner.state = SessionState::Authenticated;
        let change = SessionChange {
            from: SessionState::Refreshing,
            to: SessionState::Authenticated,
            identity: inner.identity.clone(),
            reason: None,
        };
        drop(inner);
        self.emit(change);
        Ok(refreshed.access_token)
    }

    fn apply_refresh_failure(&self, epoch: u64, error: LanewireError) -> Result<String> {
        let change = {
            let mut inner = self.lock_inner();
            if inner.epoch != epoch {
                return Err(LanewireError::Unauthenticated);
            }
            inner.refresh = None;
            inner.refresh_cancel = None;
            inner.credential = None;
            inner.identity = None;
            let from = inner.state;
            inner.state = SessionState::Expired;
            SessionChange {
                from,
                to: SessionState::Expired,
                identity: None,
                reason: Some(error.to_string()),
            }
        };
        if let Err(store_error) = self.clear_session_keys() {
            tracing::warn!(error = %store_error, "failed to clear credential store after refresh failure");
        }
        self.emit(change);
        Err(error)
    }

    fn persist_refreshed(&self, refreshed: &RefreshResponse, rotated_refresh: &str) -> Result<()> {
        self.store.set(keys::ACCESS_TOKEN, &refreshed.access_token)?;
        self.store.set(keys::REFRESH_TOKEN, rotated_refresh)?;
        if let Some(identity) = &refreshed.user {
            let serialized = serde_json::to_string(identity)
                .map_err(|err| LanewireError::Storage(err.to_string()))?;
            self.store.set(keys::USER, &serialized)?;
        }
        Ok(())
    }

    fn clear_session_keys(&self) -> Result<()> {
        self.store.delete(keys::ACCESS_TOKEN)?;
        self.store.delete(keys::REFRESH_TOKEN)?;
        self.store.delete(keys::USER)?;
        Ok(())
    }
}

/// Guard returned by [`SessionManager::on_session_change`]; dropping it
/// unregisters the observer.
pub struct SessionSubscription {
    manager: Weak<SessionManager>,
    id: u64,
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.lock_observers().retain(|(id, _)| *id != self.id);
        }
    }
}
