use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::fingerprint::fingerprint;
use super::issuer::{IssuedToken, IssuerError, RefreshRequest, TokenIssuer};
use crate::config::RefreshConfig;
use crate::notifications::{Notification, NotificationPublisher};
use crate::storage::models::{AuthorizationContext, Session, TokenRefreshInfo};
use crate::storage::{SessionStore, StoreError};

/// Upper bound on a token lifetime we are willing to record
const MAX_EXPIRES_IN_SECS: u64 = u32::MAX as u64;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Session {0} has no authorization")]
    NoAuthorization(String),
    #[error("Session {session_id} reached {attempts} failed refresh attempts")]
    RefreshAttemptsExceeded { attempts: u32, session_id: String },
    #[error("Session {0} has no refresh token")]
    RefreshCredentialMissing(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Upstream refresh failed for session {session_id}: {source}")]
    UpstreamRefreshFailed {
        session_id: String,
        source: IssuerError,
    },
}

/// Why a session is or is not refreshed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    AttemptsExceeded,
    CredentialMissing,
    Eligible,
    NoAuthorization,
    NotExpiring,
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub buffer: Duration,
    pub max_attempts: u32,
}

impl From<&RefreshConfig> for RefreshPolicy {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            buffer: config.buffer,
            max_attempts: config.max_attempts,
        }
    }
}

impl RefreshPolicy {
    fn buffer(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.buffer).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    /// Decide from the session's current state; nothing is cached.
    pub fn check(&self, session: &Session, now: DateTime<Utc>) -> Eligibility {
        let Some(authorization) = &session.authorization else {
            return Eligibility::NoAuthorization;
        };
        let Some(refresh) = &session.token_refresh else {
            return Eligibility::CredentialMissing;
        };
        if refresh.refresh_token.is_empty() {
            return Eligibility::CredentialMissing;
        }
        if refresh.refresh_attempts >= self.max_attempts {
            return Eligibility::AttemptsExceeded;
        }
        if authorization.expires_at > now + self.buffer() {
            return Eligibility::NotExpiring;
        }
        Eligibility::Eligible
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    NotDue,
    Refreshed,
    /// Another refresh of the same session got there first; nothing applied
    Superseded,
}

/// Tally of one refresh cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates: usize,
    pub failed: usize,
    pub refreshed: usize,
    pub skipped: usize,
}

/// Exchanges refresh tokens for sessions whose access token is about to
/// expire, swaps the result into the store and notifies the session.
pub struct RefreshExecutor {
    /// Sessions with a refresh currently talking to the authority
    in_flight: Mutex<HashSet<String>>,
    issuer: Arc<dyn TokenIssuer>,
    policy: RefreshPolicy,
    publisher: Arc<dyn NotificationPublisher>,
    store: Arc<dyn SessionStore>,
}

impl RefreshExecutor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        issuer: Arc<dyn TokenIssuer>,
        publisher: Arc<dyn NotificationPublisher>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
            issuer,
            policy,
            publisher,
            store,
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// Refresh every session whose token expires within the buffer. A
    /// failing session is counted and logged without stopping the others.
    pub async fn run_cycle(&self) -> Result<CycleReport, RefreshError> {
        let deadline = Utc::now() + self.policy.buffer();
        let candidates = self.store.refresh_candidates(deadline).await?;

        let mut report = CycleReport {
            candidates: candidates.len(),
            ..CycleReport::default()
        };

        for session in candidates {
            match self.refresh_if_expiring(&session.id).await {
                Ok(RefreshOutcome::Refreshed) => report.refreshed += 1,
                Ok(RefreshOutcome::NotDue | RefreshOutcome::Superseded) => report.skipped += 1,
                Err(e @ RefreshError::RefreshAttemptsExceeded { .. }) => {
                    warn!(session_id = %session.id, error = %e, "Skipping session");
                    report.skipped += 1;
                }
                Err(
                    e @ (RefreshError::RefreshCredentialMissing(_)
                    | RefreshError::NoAuthorization(_)
                    | RefreshError::SessionNotFound(_)),
                ) => {
                    debug!(session_id = %session.id, error = %e, "Skipping session");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Token refresh failed");
                    report.failed += 1;
                }
            }
        }

        if report.refreshed > 0 || report.failed > 0 {
            info!(
                candidates = report.candidates,
                refreshed = report.refreshed,
                skipped = report.skipped,
                failed = report.failed,
                "Refresh cycle complete"
            );
        } else {
            debug!(candidates = report.candidates, "Refresh cycle complete");
        }

        Ok(report)
    }

    /// Refresh one session if its token is inside the expiry buffer.
    pub async fn refresh_if_expiring(
        &self,
        session_id: &str,
    ) -> Result<RefreshOutcome, RefreshError> {
        self.refresh(session_id, true).await
    }

    /// Refresh one session now, whatever its expiry. Every failure is
    /// returned to the caller.
    pub async fn refresh_session(&self, session_id: &str) -> Result<RefreshOutcome, RefreshError> {
        self.refresh(session_id, false).await
    }

    async fn refresh(
        &self,
        session_id: &str,
        only_when_expiring: bool,
    ) -> Result<RefreshOutcome, RefreshError> {
        let Some(_claim) = InFlight::claim(&self.in_flight, session_id) else {
            debug!(session_id = %session_id, "Refresh already in progress");
            return Ok(RefreshOutcome::Superseded);
        };

        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| RefreshError::SessionNotFound(session_id.to_string()))?;

        match self.policy.check(&session, Utc::now()) {
            Eligibility::Eligible => {}
            Eligibility::NotExpiring if only_when_expiring => return Ok(RefreshOutcome::NotDue),
            Eligibility::NotExpiring => {}
            Eligibility::NoAuthorization => {
                return Err(RefreshError::NoAuthorization(session_id.to_string()))
            }
            Eligibility::CredentialMissing => {
                return Err(RefreshError::RefreshCredentialMissing(
                    session_id.to_string(),
                ))
            }
            Eligibility::AttemptsExceeded => {
                return Err(RefreshError::RefreshAttemptsExceeded {
                    attempts: session
                        .token_refresh
                        .as_ref()
                        .map_or(0, |r| r.refresh_attempts),
                    session_id: session_id.to_string(),
                })
            }
        }

        let (Some(authorization), Some(refresh_info)) =
            (session.authorization, session.token_refresh)
        else {
            return Err(RefreshError::NoAuthorization(session_id.to_string()));
        };

        let request = RefreshRequest {
            authorization_server: refresh_info.authorization_server.clone(),
            client_id: refresh_info.client_id.clone(),
            refresh_token: refresh_info.refresh_token.clone(),
            scopes: refresh_info.scopes.clone(),
        };

        let token = match self.issuer.refresh(&request).await {
            Ok(token) => token,
            Err(source) => {
                match self.store.increment_refresh_attempts(session_id).await {
                    Ok(attempts) => {
                        debug!(session_id = %session_id, attempts, "Recorded failed refresh attempt")
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Failed to record refresh attempt")
                    }
                }
                return Err(RefreshError::UpstreamRefreshFailed {
                    session_id: session_id.to_string(),
                    source,
                });
            }
        };

        let now = Utc::now();
        let expires_in = token.expires_in_or_default().min(MAX_EXPIRES_IN_SECS);
        let granted_scopes = token
            .scopes()
            .unwrap_or_else(|| refresh_info.scopes.clone());

        let new_authorization = AuthorizationContext::new(
            authorization.subject_id.clone(),
            refresh_info.client_id.clone(),
            granted_scopes,
            authorization.audience.clone(),
            fingerprint(&token.access_token),
            now + chrono::Duration::seconds(expires_in as i64),
        );
        let new_refresh = TokenRefreshInfo {
            authorization_server: refresh_info.authorization_server,
            client_id: refresh_info.client_id,
            last_refresh_at: Some(now),
            refresh_attempts: 0,
            refresh_token: token
                .refresh_token
                .clone()
                .unwrap_or(refresh_info.refresh_token),
            scopes: refresh_info.scopes,
        };

        let swapped = self
            .store
            .swap_authorization(
                session_id,
                &authorization.token_hash,
                new_authorization,
                Some(new_refresh),
            )
            .await?;
        if !swapped {
            info!(session_id = %session_id, "Credentials changed during refresh, discarding result");
            return Ok(RefreshOutcome::Superseded);
        }
        info!(session_id = %session_id, expires_in, "Refreshed access token");

        self.notify(session_id, &token, expires_in).await;
        Ok(RefreshOutcome::Refreshed)
    }

    /// The swap is already applied, so delivery problems are only logged.
    async fn notify(&self, session_id: &str, token: &IssuedToken, expires_in: u64) {
        let message = match serde_json::to_value(Notification::token_refreshed(token, expires_in)) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to encode refresh notification");
                return;
            }
        };

        match self.publisher.publish(session_id, message).await {
            Ok(delivered) => {
                debug!(session_id = %session_id, delivered, "Published refresh notification")
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to publish refresh notification")
            }
        }
    }
}

/// Marks a session as being refreshed until dropped.
struct InFlight<'a> {
    session_id: String,
    sessions: &'a Mutex<HashSet<String>>,
}

impl<'a> InFlight<'a> {
    fn claim(sessions: &'a Mutex<HashSet<String>>, session_id: &str) -> Option<Self> {
        let mut guard = sessions.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(session_id.to_string()) {
            return None;
        }
        Some(Self {
            session_id: session_id.to_string(),
            sessions,
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySessionStore;
    use crate::testutil::{
        make_refreshable_session, make_session, setup_store, FakeIssuer, RecordingPublisher,
    };

    fn policy() -> RefreshPolicy {
        RefreshPolicy {
            buffer: Duration::from_secs(5 * 60),
            max_attempts: 5,
        }
    }

    fn executor(
        store: Arc<MemorySessionStore>,
        issuer: Arc<FakeIssuer>,
        publisher: Arc<RecordingPublisher>,
    ) -> RefreshExecutor {
        RefreshExecutor::new(store, issuer, publisher, policy())
    }

    #[test]
    fn test_expiring_within_buffer_is_eligible() {
        let session = make_refreshable_session("s1", "at", "rt", 3);
        assert_eq!(policy().check(&session, Utc::now()), Eligibility::Eligible);
    }

    #[test]
    fn test_far_expiry_is_not_eligible() {
        let session = make_refreshable_session("s1", "at", "rt", 30);
        assert_eq!(policy().check(&session, Utc::now()), Eligibility::NotExpiring);
    }

    #[test]
    fn test_attempt_ceiling_blocks_refresh() {
        let mut session = make_refreshable_session("s1", "at", "rt", 3);
        session.token_refresh.as_mut().unwrap().refresh_attempts = 5;
        assert_eq!(policy().check(&session, Utc::now()), Eligibility::AttemptsExceeded);

        session.token_refresh.as_mut().unwrap().refresh_attempts = 4;
        assert_eq!(policy().check(&session, Utc::now()), Eligibility::Eligible);
    }

    #[test]
    fn test_missing_refresh_capability() {
        let mut session = make_refreshable_session("s1", "at", "rt", 3);
        session.token_refresh = None;
        assert_eq!(policy().check(&session, Utc::now()), Eligibility::CredentialMissing);

        assert_eq!(
            policy().check(&make_session("s2"), Utc::now()),
            Eligibility::NoAuthorization
        );
    }

    #[tokio::test]
    async fn test_refresh_swaps_fingerprint_and_notifies() {
        let store = Arc::new(setup_store());
        let issuer = Arc::new(FakeIssuer::new());
        let publisher = Arc::new(RecordingPublisher::default());
        store
            .create(make_refreshable_session("s1", "at-old", "rt-old", 3))
            .await
            .unwrap();

        let exec = executor(store.clone(), issuer.clone(), publisher.clone());
        assert_eq!(
            exec.refresh_if_expiring("s1").await.unwrap(),
            RefreshOutcome::Refreshed
        );
        assert_eq!(issuer.calls(), 1);

        let old_hash = fingerprint("at-old");
        assert!(store.get_session_by_token_hash(&old_hash).await.unwrap().is_none());
        let new_hash = fingerprint("at-1");
        let session = store.get_session_by_token_hash(&new_hash).await.unwrap().unwrap();
        assert_eq!(session.id, "s1");

        let refresh = session.token_refresh.unwrap();
        assert_eq!(refresh.refresh_token, "rt-1");
        assert_eq!(refresh.refresh_attempts, 0);
        assert!(refresh.last_refresh_at.is_some());
        assert!(session.authorization.unwrap().expires_at > Utc::now() + chrono::Duration::minutes(30));

        let sent = publisher.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "s1");
        assert_eq!(sent[0].1["method"], "notifications/token_refreshed");
        assert_eq!(sent[0].1["params"]["access_token"], "at-1");
    }

    #[tokio::test]
    async fn test_upstream_failure_increments_attempts() {
        let store = Arc::new(setup_store());
        let issuer = Arc::new(FakeIssuer::failing_for(&["rt-bad"]));
        let publisher = Arc::new(RecordingPublisher::default());
        store
            .create(make_refreshable_session("s1", "at", "rt-bad", 3))
            .await
            .unwrap();

        let exec = executor(store.clone(), issuer, publisher.clone());
        let err = exec.refresh_session("s1").await.unwrap_err();
        assert!(matches!(err, RefreshError::UpstreamRefreshFailed { .. }));

        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.token_refresh.as_ref().unwrap().refresh_attempts, 1);
        assert_eq!(session.token_hash(), Some(fingerprint("at").as_str()));
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_cycle_is_idempotent() {
        let store = Arc::new(setup_store());
        let issuer = Arc::new(FakeIssuer::new());
        let publisher = Arc::new(RecordingPublisher::default());
        store
            .create(make_refreshable_session("s1", "at", "rt", 3))
            .await
            .unwrap();

        let exec = executor(store.clone(), issuer.clone(), publisher.clone());
        let first = exec.run_cycle().await.unwrap();
        assert_eq!(first.refreshed, 1);
        let after_first = store.get("s1").await.unwrap().unwrap();

        let second = exec.run_cycle().await.unwrap();
        assert_eq!(second.candidates, 0);
        assert_eq!(second.refreshed, 0);
        assert_eq!(issuer.calls(), 1);
        assert_eq!(store.get("s1").await.unwrap().unwrap(), after_first);

        assert_eq!(
            exec.refresh_if_expiring("s1").await.unwrap(),
            RefreshOutcome::NotDue
        );
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn test_cycle_isolates_failing_sessions() {
        let store = Arc::new(setup_store());
        let issuer = Arc::new(FakeIssuer::failing_for(&["rt-bad"]));
        let publisher = Arc::new(RecordingPublisher::default());
        store
            .create(make_refreshable_session("bad", "at-b", "rt-bad", 2))
            .await
            .unwrap();
        store
            .create(make_refreshable_session("good", "at-g", "rt-good", 2))
            .await
            .unwrap();
        let mut exhausted = make_refreshable_session("exhausted", "at-e", "rt-e", 2);
        exhausted.token_refresh.as_mut().unwrap().refresh_attempts = 5;
        store.create(exhausted).await.unwrap();

        let exec = executor(store.clone(), issuer.clone(), publisher);
        let report = exec.run_cycle().await.unwrap();
        assert_eq!(report.candidates, 3);
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(issuer.calls(), 2);

        let good = store.get("good").await.unwrap().unwrap();
        assert_eq!(good.token_refresh.unwrap().refresh_token, "rt-1");
    }

    #[tokio::test]
    async fn test_manual_refresh_errors_propagate() {
        let store = Arc::new(setup_store());
        let exec = executor(
            store.clone(),
            Arc::new(FakeIssuer::new()),
            Arc::new(RecordingPublisher::default()),
        );

        assert!(matches!(
            exec.refresh_session("missing").await,
            Err(RefreshError::SessionNotFound(_))
        ));

        let mut session = make_refreshable_session("s1", "at", "rt", 30);
        session.token_refresh = None;
        store.create(session).await.unwrap();
        assert!(matches!(
            exec.refresh_session("s1").await,
            Err(RefreshError::RefreshCredentialMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_refresh_ignores_buffer() {
        let store = Arc::new(setup_store());
        let issuer = Arc::new(FakeIssuer::new());
        store
            .create(make_refreshable_session("s1", "at", "rt", 30))
            .await
            .unwrap();

        let exec = executor(store, issuer.clone(), Arc::new(RecordingPublisher::default()));
        assert_eq!(
            exec.refresh_session("s1").await.unwrap(),
            RefreshOutcome::Refreshed
        );
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_of_one_session_call_upstream_once() {
        let store = Arc::new(setup_store());
        let issuer = Arc::new(FakeIssuer::slow(Duration::from_secs(1)));
        let publisher = Arc::new(RecordingPublisher::default());
        store
            .create(make_refreshable_session("s1", "at-0", "rt-0", 3))
            .await
            .unwrap();

        let exec = executor(store.clone(), issuer.clone(), publisher.clone());
        let (scheduled, manual) =
            tokio::join!(exec.refresh_if_expiring("s1"), exec.refresh_session("s1"));

        let mut outcomes = vec![scheduled.unwrap(), manual.unwrap()];
        outcomes.sort_by_key(|o| *o as u8);
        assert_eq!(outcomes, vec![RefreshOutcome::Refreshed, RefreshOutcome::Superseded]);
        assert_eq!(issuer.calls(), 1);

        let sent = publisher.messages();
        assert_eq!(sent.len(), 1);
        let notified = sent[0].1["params"]["access_token"].as_str().unwrap().to_string();
        let owner = store
            .get_session_by_token_hash(&fingerprint(&notified))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(owner.id, "s1");

        // The claim is released once the first refresh finishes
        assert_eq!(
            exec.refresh_session("s1").await.unwrap(),
            RefreshOutcome::Refreshed
        );
        assert_eq!(issuer.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_swap_from_another_instance_is_discarded() {
        let store = Arc::new(setup_store());
        let issuer = Arc::new(FakeIssuer::slow(Duration::from_secs(1)));
        let publisher = Arc::new(RecordingPublisher::default());
        store
            .create(make_refreshable_session("s1", "at-0", "rt-0", 3))
            .await
            .unwrap();

        // Two instances sharing one store, each with its own executor
        let a = executor(store.clone(), issuer.clone(), publisher.clone());
        let b = executor(store.clone(), issuer.clone(), publisher.clone());
        let (ra, rb) = tokio::join!(a.refresh_if_expiring("s1"), b.refresh_if_expiring("s1"));

        let mut outcomes = vec![ra.unwrap(), rb.unwrap()];
        outcomes.sort_by_key(|o| *o as u8);
        assert_eq!(outcomes, vec![RefreshOutcome::Refreshed, RefreshOutcome::Superseded]);
        assert_eq!(issuer.calls(), 2);

        // Only the applied token is announced, and it is the indexed one
        let sent = publisher.messages();
        assert_eq!(sent.len(), 1);
        let notified = sent[0].1["params"]["access_token"].as_str().unwrap().to_string();
        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.token_hash(), Some(fingerprint(&notified).as_str()));
        assert_eq!(
            store
                .get_session_by_token_hash(&fingerprint(&notified))
                .await
                .unwrap()
                .unwrap()
                .id,
            "s1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_failure_reported_when_session_vanishes() {
        let store = Arc::new(setup_store());
        let issuer = Arc::new(FakeIssuer::failing_for(&["rt-bad"]).delayed(Duration::from_secs(1)));
        store
            .create(make_refreshable_session("s1", "at", "rt-bad", 3))
            .await
            .unwrap();

        let exec = executor(store.clone(), issuer, Arc::new(RecordingPublisher::default()));
        let (result, deleted) = tokio::join!(exec.refresh_session("s1"), store.delete("s1"));

        assert!(deleted.unwrap());
        assert!(matches!(
            result,
            Err(RefreshError::UpstreamRefreshFailed { ref session_id, .. }) if session_id == "s1"
        ));
    }
}
