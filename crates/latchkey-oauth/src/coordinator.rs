//! End-to-end authorization flow and its state machine.
//!
//! ```text
//! Idle ─begin─▶ Listening ─capture─▶ Received ─state ok─▶ Validated
//!                  │                    └─mismatch/error─▶ Failed
//!                  ├─deadline─▶ TimedOut
//!                  └─cancel──▶ Cancelled
//! ```
//!
//! A new attempt always goes through `begin` again with fresh PKCE material
//! and a fresh `state`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CaptureError, FlowError};
use crate::loopback::{LoopbackConfig, LoopbackListener};
use crate::oauth::{AuthorizeConfig, build_authorization_url, generate_state};
use crate::pkce::PkceMaterial;
use crate::redirect::{CapturedRedirect, RedirectOutcome};
use crate::scheme::{PrimaryInstance, SchemeBackend};
use crate::wait::{MAX_WAIT, deadline_after};

/// Where the coordinator is in a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Listening,
    Received,
    Validated,
    Failed,
    TimedOut,
    Cancelled,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowState::Validated | FlowState::Failed | FlowState::TimedOut | FlowState::Cancelled
        )
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowState::Idle => "idle",
            FlowState::Listening => "listening",
            FlowState::Received => "received",
            FlowState::Validated => "validated",
            FlowState::Failed => "failed",
            FlowState::TimedOut => "timed_out",
            FlowState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Which capture backend a flow uses.
pub enum BackendChoice {
    Loopback(LoopbackConfig),
    /// Requires the primary instance, obtained from
    /// [`SchemeBackend::acquire_singleton`].
    Scheme {
        backend: Arc<SchemeBackend>,
        primary: PrimaryInstance,
    },
}

/// What the caller needs for the token exchange.
#[derive(Clone, Serialize)]
pub struct AuthorizationGrant {
    pub code: String,
    pub verifier: String,
    /// Must be sent unchanged with the token request.
    pub redirect_uri: String,
}

impl fmt::Debug for AuthorizationGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationGrant")
            .field("code", &"<redacted>")
            .field("verifier", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Why a flow ended in `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum FailureReason {
    /// The echoed `state` was missing or did not match.
    #[error("state mismatch: redirect was forged or stale")]
    StateMismatch,

    /// The Authorization Server returned an error redirect.
    #[error("authorization denied: {error}")]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    /// The backend could not produce a usable redirect.
    #[error(transparent)]
    Capture(CaptureError),
}

/// Terminal result of a flow.
#[derive(Debug)]
pub enum AuthorizationOutcome {
    Validated(AuthorizationGrant),
    Failed(FailureReason),
    TimedOut,
    Cancelled,
}

enum ActiveCapture {
    Loopback(LoopbackListener),
    Scheme(PrimaryInstance),
}

struct ActiveFlow {
    pkce: PkceMaterial,
    state: String,
    redirect_uri: String,
    capture: ActiveCapture,
    deadline: Instant,
    cancel: CancellationToken,
}

/// Drives one authorization attempt at a time.
pub struct AuthorizationCoordinator {
    config: AuthorizeConfig,
    state: FlowState,
    flow: Option<ActiveFlow>,
}

impl AuthorizationCoordinator {
    pub fn new(config: AuthorizeConfig) -> Self {
        Self {
            config,
            state: FlowState::Idle,
            flow: None,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Redirect URI of the flow in progress.
    pub fn redirect_uri(&self) -> Option<&str> {
        self.flow.as_ref().map(|f| f.redirect_uri.as_str())
    }

    /// Token that cancels the flow in progress.
    pub fn cancel_handle(&self) -> Option<CancellationToken> {
        self.flow.as_ref().map(|f| f.cancel.clone())
    }

    /// Cancel the flow in progress, if any.
    pub fn cancel(&self) {
        if let Some(flow) = &self.flow {
            flow.cancel.cancel();
        }
    }

    fn transition(&mut self, next: FlowState) {
        tracing::debug!(from = %self.state, to = %next, "Authorization flow transition");
        self.state = next;
    }

    /// Start a flow and return the authorize URL for the browser.
    ///
    /// The deadline covers the whole wait, starting now, and may not exceed
    /// [`MAX_WAIT`].
    pub async fn begin(
        &mut self,
        choice: BackendChoice,
        deadline: Duration,
    ) -> Result<String, FlowError> {
        if self.state == FlowState::Listening {
            return Err(FlowError::AlreadyListening);
        }
        if deadline > MAX_WAIT {
            return Err(FlowError::DeadlineTooLong {
                requested: deadline,
                max: MAX_WAIT,
            });
        }

        match self.start(choice, deadline).await {
            Ok((url, flow)) => {
                self.flow = Some(flow);
                self.transition(FlowState::Listening);
                tracing::info!(
                    redirect_uri = %self.redirect_uri().unwrap_or_default(),
                    timeout_secs = deadline.as_secs_f64(),
                    "Authorization flow listening"
                );
                Ok(url)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to start authorization flow");
                self.flow = None;
                self.transition(FlowState::Failed);
                Err(FlowError::Capture(e))
            }
        }
    }

    async fn start(
        &self,
        choice: BackendChoice,
        deadline: Duration,
    ) -> Result<(String, ActiveFlow), CaptureError> {
        let pkce = PkceMaterial::generate()?;
        let state = generate_state()?;

        let (capture, redirect_uri) = match choice {
            BackendChoice::Loopback(config) => {
                let listener = LoopbackListener::start(&config).await?;
                let redirect_uri = listener.redirect_uri();
                (ActiveCapture::Loopback(listener), redirect_uri)
            }
            BackendChoice::Scheme { backend, primary } => {
                // The OS must know the scheme before the server is told to use it.
                backend.ensure_registered()?;
                (ActiveCapture::Scheme(primary), backend.redirect_uri())
            }
        };

        let url = build_authorization_url(&self.config, &pkce, &state, &redirect_uri);
        let flow = ActiveFlow {
            pkce,
            state,
            redirect_uri,
            capture,
            deadline: deadline_after(deadline),
            cancel: CancellationToken::new(),
        };
        Ok((url, flow))
    }

    /// Wait for the flow started by `begin` to finish.
    pub async fn result(&mut self) -> Result<AuthorizationOutcome, FlowError> {
        if self.state != FlowState::Listening {
            return Err(FlowError::NotListening);
        }
        let Some(flow) = self.flow.take() else {
            return Err(FlowError::NotListening);
        };

        let ActiveFlow {
            pkce,
            state,
            redirect_uri,
            capture,
            deadline,
            cancel,
        } = flow;

        let captured = {
            let mut guard = AbandonGuard {
                state: &mut self.state,
                armed: true,
            };
            let captured = match capture {
                ActiveCapture::Loopback(listener) => listener.await_until(deadline, &cancel).await,
                ActiveCapture::Scheme(primary) => primary.await_until(deadline, &cancel).await,
            };
            guard.armed = false;
            captured
        };

        let outcome = match captured {
            Ok(redirect) => {
                self.transition(FlowState::Received);
                validate(redirect, &state, pkce, redirect_uri)
            }
            Err(CaptureError::Timeout) => AuthorizationOutcome::TimedOut,
            Err(CaptureError::Cancelled) => AuthorizationOutcome::Cancelled,
            Err(e) => AuthorizationOutcome::Failed(FailureReason::Capture(e)),
        };

        let terminal = match &outcome {
            AuthorizationOutcome::Validated(_) => FlowState::Validated,
            AuthorizationOutcome::Failed(reason) => {
                tracing::warn!(reason = %reason, "Authorization flow failed");
                FlowState::Failed
            }
            AuthorizationOutcome::TimedOut => FlowState::TimedOut,
            AuthorizationOutcome::Cancelled => FlowState::Cancelled,
        };
        self.transition(terminal);
        tracing::info!(state = %terminal, "Authorization flow finished");

        Ok(outcome)
    }
}

/// Ends the flow as `Cancelled` when `result()` is dropped mid-wait.
///
/// The flow has already been taken out of the coordinator by then, so
/// leaving it in `Listening` would block every later `begin`.
struct AbandonGuard<'a> {
    state: &'a mut FlowState,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(from = %self.state, "Authorization wait abandoned");
            *self.state = FlowState::Cancelled;
        }
    }
}

/// Check the echoed state, then look at what the server sent.
fn validate(
    redirect: CapturedRedirect,
    expected_state: &str,
    pkce: PkceMaterial,
    redirect_uri: String,
) -> AuthorizationOutcome {
    let state_ok = redirect
        .state
        .as_deref()
        .is_some_and(|actual| constant_time_eq(actual, expected_state));
    if !state_ok {
        return AuthorizationOutcome::Failed(FailureReason::StateMismatch);
    }

    match redirect.outcome {
        RedirectOutcome::Code(code) => AuthorizationOutcome::Validated(AuthorizationGrant {
            code,
            verifier: pkce.into_verifier(),
            redirect_uri,
        }),
        RedirectOutcome::Error { error, description } => {
            AuthorizationOutcome::Failed(FailureReason::AuthorizationDenied { error, description })
        }
    }
}

/// Compare two strings in constant time.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() == b_bytes.len() {
        a_bytes.ct_eq(b_bytes).into()
    } else {
        // Keep timing consistent when lengths differ.
        let _ = a_bytes.ct_eq(a_bytes);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parse_query;
    use crate::loopback::PortPolicy;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn coordinator() -> AuthorizationCoordinator {
        AuthorizationCoordinator::new(
            AuthorizeConfig::new("client", "https://auth.example.com/authorize").with_scope("read"),
        )
    }

    fn query_of(url: &str) -> std::collections::HashMap<String, String> {
        parse_query(url.split_once('?').unwrap().1).unwrap()
    }

    async fn redirect_to(redirect_uri: &str, query: &str) {
        let addr = redirect_uri
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap()
            .to_string();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /callback?{} HTTP/1.1\r\nHost: localhost\r\n\r\n",
            query
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[test]
    fn test_validate_state_mismatch_with_code() {
        let redirect = CapturedRedirect::from_query("code=good&state=WRONG").unwrap();
        let pkce = PkceMaterial::generate().unwrap();
        let outcome = validate(redirect, "XYZ", pkce, "http://127.0.0.1/callback".into());
        assert!(matches!(
            outcome,
            AuthorizationOutcome::Failed(FailureReason::StateMismatch)
        ));
    }

    #[test]
    fn test_validate_missing_state() {
        let redirect = CapturedRedirect::from_query("code=good").unwrap();
        let pkce = PkceMaterial::generate().unwrap();
        let outcome = validate(redirect, "XYZ", pkce, String::new());
        assert!(matches!(
            outcome,
            AuthorizationOutcome::Failed(FailureReason::StateMismatch)
        ));
    }

    #[test]
    fn test_validate_error_redirect() {
        let redirect =
            CapturedRedirect::from_query("error=access_denied&state=XYZ").unwrap();
        let pkce = PkceMaterial::generate().unwrap();
        let outcome = validate(redirect, "XYZ", pkce, String::new());
        match outcome {
            AuthorizationOutcome::Failed(FailureReason::AuthorizationDenied { error, .. }) => {
                assert_eq!(error, "access_denied")
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_validate_success_hands_out_verifier() {
        let redirect = CapturedRedirect::from_query("code=abc&state=XYZ").unwrap();
        let pkce = PkceMaterial::generate().unwrap();
        let verifier = pkce.verifier().to_string();
        match validate(redirect, "XYZ", pkce, "uri".into()) {
            AuthorizationOutcome::Validated(grant) => {
                assert_eq!(grant.code, "abc");
                assert_eq!(grant.verifier, verifier);
                assert_eq!(grant.redirect_uri, "uri");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_result_before_begin() {
        let mut coordinator = coordinator();
        assert_eq!(coordinator.state(), FlowState::Idle);
        assert!(matches!(
            coordinator.result().await,
            Err(FlowError::NotListening)
        ));
    }

    #[tokio::test]
    async fn test_begin_is_exclusive_while_listening() {
        let mut coordinator = coordinator();
        coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(coordinator.state(), FlowState::Listening);

        let err = coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::AlreadyListening));
    }

    #[tokio::test]
    async fn test_authorize_url_contents() {
        let mut coordinator = coordinator();
        let url = coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let params = query_of(&url);
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["redirect_uri"], coordinator.redirect_uri().unwrap());
        assert_eq!(params["state"].len(), 43);
        assert_eq!(params["code_challenge"].len(), 43);
    }

    #[tokio::test]
    async fn test_full_loopback_flow() {
        let mut coordinator = coordinator();
        let url = coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let params = query_of(&url);
        let redirect_uri = coordinator.redirect_uri().unwrap().to_string();

        let query = format!("code=abc123&state={}", params["state"]);
        let client = tokio::spawn(async move { redirect_to(&redirect_uri, &query).await });

        let outcome = coordinator.result().await.unwrap();
        client.await.unwrap();

        match outcome {
            AuthorizationOutcome::Validated(grant) => {
                assert_eq!(grant.code, "abc123");
                assert_eq!(
                    crate::pkce::derive_challenge(&grant.verifier),
                    params["code_challenge"]
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(coordinator.state(), FlowState::Validated);

        // Code is handed out once.
        assert!(matches!(
            coordinator.result().await,
            Err(FlowError::NotListening)
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_result() {
        let mut coordinator = coordinator();
        coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        coordinator.cancel();

        let outcome = coordinator.result().await.unwrap();
        assert!(matches!(outcome, AuthorizationOutcome::Cancelled));
        assert_eq!(coordinator.state(), FlowState::Cancelled);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let held = LoopbackListener::start(&LoopbackConfig::default())
            .await
            .unwrap();
        let mut coordinator = coordinator();
        let err = coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::new(PortPolicy::Fixed(held.port()))),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Capture(CaptureError::Bind(_))));
        assert_eq!(coordinator.state(), FlowState::Failed);
    }

    #[tokio::test]
    async fn test_fresh_begin_after_terminal_state() {
        let mut coordinator = coordinator();
        let first = coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert!(matches!(
            coordinator.result().await.unwrap(),
            AuthorizationOutcome::TimedOut
        ));

        let second = coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert_ne!(query_of(&first)["state"], query_of(&second)["state"]);
        assert_ne!(
            query_of(&first)["code_challenge"],
            query_of(&second)["code_challenge"]
        );
    }

    #[tokio::test]
    async fn test_oversized_timeout_is_rejected() {
        let mut coordinator = coordinator();
        let err = coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                Duration::from_secs(u64::MAX),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::DeadlineTooLong { .. }));
        assert_eq!(coordinator.state(), FlowState::Idle);

        coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                MAX_WAIT,
            )
            .await
            .unwrap();
        assert_eq!(coordinator.state(), FlowState::Listening);
    }

    #[tokio::test]
    async fn test_dropped_result_frees_the_coordinator() {
        let mut coordinator = coordinator();
        coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let waited =
            tokio::time::timeout(Duration::from_millis(50), coordinator.result()).await;
        assert!(waited.is_err());
        assert_eq!(coordinator.state(), FlowState::Cancelled);

        coordinator
            .begin(
                BackendChoice::Loopback(LoopbackConfig::default()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        coordinator.cancel();
        assert!(matches!(
            coordinator.result().await.unwrap(),
            AuthorizationOutcome::Cancelled
        ));
    }

    #[test]
    fn test_grant_debug_is_redacted() {
        let grant = AuthorizationGrant {
            code: "secret-code".into(),
            verifier: "secret-verifier".into(),
            redirect_uri: "http://127.0.0.1:1/callback".into(),
        };
        let debug = format!("{:?}", grant);
        assert!(!debug.contains("secret-code"));
        assert!(!debug.contains("secret-verifier"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!FlowState::Idle.is_terminal());
        assert!(!FlowState::Listening.is_terminal());
        assert!(!FlowState::Received.is_terminal());
        assert!(FlowState::Validated.is_terminal());
        assert!(FlowState::Failed.is_terminal());
        assert!(FlowState::TimedOut.is_terminal());
        assert!(FlowState::Cancelled.is_terminal());
    }
}
