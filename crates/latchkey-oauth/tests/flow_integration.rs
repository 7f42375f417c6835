//! End-to-end authorization flow tests.
//!
//! Each test drives the coordinator the way a native app would and plays the
//! browser (loopback) or the OS launcher (custom scheme) itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use latchkey_oauth::scheme::DesktopEntryRegistrar;
use latchkey_oauth::{
    AuthorizationCoordinator, AuthorizationOutcome, AuthorizeConfig, BackendChoice,
    FailureReason, FlowState, LoopbackConfig, LoopbackListener, PortPolicy, SchemeBackend,
    SchemeRegistration, SingletonOutcome,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn coordinator() -> AuthorizationCoordinator {
    AuthorizationCoordinator::new(
        AuthorizeConfig::new("native-client", "https://auth.example.com/oauth/authorize")
            .with_scope("openid"),
    )
}

fn params_of(url: &str) -> HashMap<String, String> {
    let (_, query) = url.split_once('?').expect("authorize url has a query");
    latchkey_oauth::http::parse_query(query).unwrap()
}

/// Port from `http://127.0.0.1:<port>/callback`.
fn port_of(redirect_uri: &str) -> u16 {
    redirect_uri
        .trim_start_matches("http://127.0.0.1:")
        .split('/')
        .next()
        .unwrap()
        .parse()
        .unwrap()
}

/// Play the browser: send one raw request and read the full response.
async fn browser_hit(port: u16, request: String) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

fn scheme_backend(dir: &std::path::Path) -> Arc<SchemeBackend> {
    let registration = SchemeRegistration::new("latchkey-it", "myapp", "/usr/local/bin/myapp");
    Arc::new(
        SchemeBackend::new(registration)
            .with_registrar(Box::new(DesktopEntryRegistrar::with_applications_dir(
                dir.join("applications"),
            )))
            .with_runtime_dir(dir.join("run")),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Loopback
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_loopback_validated() {
    let mut coordinator = coordinator();
    let url = coordinator
        .begin(
            BackendChoice::Loopback(LoopbackConfig::default()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let params = params_of(&url);
    let port = port_of(coordinator.redirect_uri().unwrap());

    let request = format!(
        "GET /callback?code=abc123&state={} HTTP/1.1\r\nHost: localhost\r\n\r\n",
        params["state"]
    );
    let browser = tokio::spawn(browser_hit(port, request));

    let outcome = coordinator.result().await.unwrap();
    let page = browser.await.unwrap();
    assert!(page.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(page.contains("Content-Type: text/html"));

    let AuthorizationOutcome::Validated(grant) = outcome else {
        panic!("expected validated outcome, got {:?}", outcome);
    };
    assert_eq!(grant.code, "abc123");
    assert_eq!(
        latchkey_oauth::pkce::derive_challenge(&grant.verifier),
        params["code_challenge"]
    );
    assert_eq!(coordinator.state(), FlowState::Validated);
}

#[tokio::test]
async fn test_loopback_state_mismatch() {
    let mut coordinator = coordinator();
    coordinator
        .begin(
            BackendChoice::Loopback(LoopbackConfig::default()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let port = port_of(coordinator.redirect_uri().unwrap());

    let browser = tokio::spawn(browser_hit(
        port,
        "GET /callback?code=abc123&state=WRONG HTTP/1.1\r\nHost: localhost\r\n\r\n".to_string(),
    ));

    let outcome = coordinator.result().await.unwrap();
    browser.await.unwrap();

    assert!(matches!(
        outcome,
        AuthorizationOutcome::Failed(FailureReason::StateMismatch)
    ));
    assert_eq!(coordinator.state(), FlowState::Failed);
}

#[tokio::test]
async fn test_loopback_timeout_frees_port() {
    let mut coordinator = coordinator();
    coordinator
        .begin(
            BackendChoice::Loopback(LoopbackConfig::default()),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    let port = port_of(coordinator.redirect_uri().unwrap());

    let started = Instant::now();
    let outcome = coordinator.result().await.unwrap();
    let elapsed = started.elapsed();

    assert!(matches!(outcome, AuthorizationOutcome::TimedOut));
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    assert_eq!(coordinator.state(), FlowState::TimedOut);

    let rebound = LoopbackListener::start(&LoopbackConfig::new(PortPolicy::Fixed(port))).await;
    assert!(rebound.is_ok());
}

#[tokio::test]
async fn test_loopback_serves_only_one_connection() {
    let mut coordinator = coordinator();
    let url = coordinator
        .begin(
            BackendChoice::Loopback(LoopbackConfig::default()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let state = params_of(&url)["state"].clone();
    let port = port_of(coordinator.redirect_uri().unwrap());

    let first = format!("GET /callback?code=first&state={} HTTP/1.1\r\n\r\n", state);
    let browser = tokio::spawn(browser_hit(port, first));
    let outcome = coordinator.result().await.unwrap();
    browser.await.unwrap();

    assert!(matches!(outcome, AuthorizationOutcome::Validated(ref g) if g.code == "first"));
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_loopback_authorization_denied() {
    let mut coordinator = coordinator();
    let url = coordinator
        .begin(
            BackendChoice::Loopback(LoopbackConfig::default()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let state = params_of(&url)["state"].clone();
    let port = port_of(coordinator.redirect_uri().unwrap());

    let request = format!(
        "GET /callback?error=access_denied&error_description=User%20said%20no&state={} HTTP/1.1\r\n\r\n",
        state
    );
    let browser = tokio::spawn(browser_hit(port, request));
    let outcome = coordinator.result().await.unwrap();
    let page = browser.await.unwrap();

    assert!(page.starts_with("HTTP/1.1 200 OK"));
    assert!(!page.contains("User said no"));
    match outcome {
        AuthorizationOutcome::Failed(FailureReason::AuthorizationDenied { error, description }) => {
            assert_eq!(error, "access_denied");
            assert_eq!(description.as_deref(), Some("User said no"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_loopback_malformed_request_fails_flow() {
    let mut coordinator = coordinator();
    coordinator
        .begin(
            BackendChoice::Loopback(LoopbackConfig::default()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let port = port_of(coordinator.redirect_uri().unwrap());

    let browser = tokio::spawn(browser_hit(port, "HELLO\r\n\r\n".to_string()));
    let outcome = coordinator.result().await.unwrap();
    let page = browser.await.unwrap();

    assert!(page.starts_with("HTTP/1.1 400 Bad Request"));
    assert!(matches!(
        outcome,
        AuthorizationOutcome::Failed(FailureReason::Capture(
            latchkey_oauth::CaptureError::Malformed(latchkey_oauth::ParseError::Malformed)
        ))
    ));
}

#[tokio::test]
async fn test_loopback_cancel_during_wait() {
    let mut coordinator = coordinator();
    coordinator
        .begin(
            BackendChoice::Loopback(LoopbackConfig::default()),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    let port = port_of(coordinator.redirect_uri().unwrap());
    let cancel = coordinator.cancel_handle().unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let outcome = coordinator.result().await.unwrap();
    assert!(matches!(outcome, AuthorizationOutcome::Cancelled));
    assert!(
        LoopbackListener::start(&LoopbackConfig::new(PortPolicy::Fixed(port)))
            .await
            .is_ok()
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Custom scheme
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn test_scheme_relay_validated() {
    let dir = tempfile::tempdir().unwrap();
    let backend = scheme_backend(dir.path());

    let SingletonOutcome::Primary(primary) = backend.acquire_singleton(["myapp"]).unwrap() else {
        panic!("first launch should be primary");
    };

    let mut coordinator = coordinator();
    let url = coordinator
        .begin(
            BackendChoice::Scheme {
                backend: backend.clone(),
                primary,
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let params = params_of(&url);
    assert_eq!(params["redirect_uri"], "myapp:callback");
    assert!(backend.is_registered().unwrap());

    // The OS launches a second copy with the redirect on its command line.
    let launch_uri = format!("myapp:callback?code=def&state={}", params["state"]);
    let args = vec!["myapp".to_string(), "--oauth-callback".to_string(), launch_uri];
    let secondary = {
        let backend = backend.clone();
        tokio::spawn(async move {
            match backend.acquire_singleton(&args).unwrap() {
                SingletonOutcome::Secondary(Some(uri)) => backend.relay(&uri).await.unwrap(),
                other => panic!("second launch should be secondary, got {:?}", other),
            }
        })
    };

    let outcome = coordinator.result().await.unwrap();
    secondary.await.unwrap();

    let AuthorizationOutcome::Validated(grant) = outcome else {
        panic!("expected validated outcome, got {:?}", outcome);
    };
    assert_eq!(grant.code, "def");
    assert_eq!(grant.redirect_uri, "myapp:callback");

    // Lock and endpoint are gone: the next launch becomes primary again.
    assert!(matches!(
        backend.acquire_singleton(["myapp"]).unwrap(),
        SingletonOutcome::Primary(_)
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_scheme_timeout_releases_lock() {
    let dir = tempfile::tempdir().unwrap();
    let backend = scheme_backend(dir.path());

    let SingletonOutcome::Primary(primary) = backend.acquire_singleton(["myapp"]).unwrap() else {
        panic!("first launch should be primary");
    };

    let mut coordinator = coordinator();
    coordinator
        .begin(
            BackendChoice::Scheme {
                backend: backend.clone(),
                primary,
            },
            Duration::from_millis(100),
        )
        .await
        .unwrap();

    let outcome = coordinator.result().await.unwrap();
    assert!(matches!(outcome, AuthorizationOutcome::TimedOut));
    assert!(matches!(
        backend.acquire_singleton(["myapp"]).unwrap(),
        SingletonOutcome::Primary(_)
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_scheme_state_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let backend = scheme_backend(dir.path());

    let SingletonOutcome::Primary(primary) = backend.acquire_singleton(["myapp"]).unwrap() else {
        panic!("first launch should be primary");
    };

    let mut coordinator = coordinator();
    coordinator
        .begin(
            BackendChoice::Scheme {
                backend: backend.clone(),
                primary,
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    let relay = {
        let backend = backend.clone();
        tokio::spawn(async move {
            backend
                .relay("myapp:callback?code=def&state=forged")
                .await
                .unwrap()
        })
    };

    let outcome = coordinator.result().await.unwrap();
    relay.await.unwrap();
    assert!(matches!(
        outcome,
        AuthorizationOutcome::Failed(FailureReason::StateMismatch)
    ));
}
