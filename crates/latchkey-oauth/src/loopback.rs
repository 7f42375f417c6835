//! Single-use loopback listener for the OAuth redirect.
//!
//! Binds `127.0.0.1`, serves exactly one connection, and drops the socket
//! before returning, whatever the outcome.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CaptureError, ParseError, Result};
use crate::http::{parse_request, write_response};
use crate::redirect::CapturedRedirect;
use crate::wait::deadline_after;

/// Upper bound on the request head we are willing to buffer.
const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// How long to keep draining after the response before closing.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><title>Signed in</title></head>\
<body><h1>Authorization received</h1><p>You may close this window.</p></body></html>";

const DENIED_PAGE: &str = "<!DOCTYPE html><html><head><title>Not signed in</title></head>\
<body><h1>Authorization was not granted</h1><p>You may close this window.</p></body></html>";

const BAD_REQUEST_PAGE: &str = "<!DOCTYPE html><html><head><title>Bad request</title></head>\
<body><h1>Bad request</h1></body></html>";

/// Which local port to bind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PortPolicy {
    /// Let the OS pick a free port.
    #[default]
    Ephemeral,
    /// Bind exactly this port.
    Fixed(u16),
    /// Try each port in order, first free one wins.
    Candidates(Vec<u16>),
}

impl PortPolicy {
    fn ports(&self) -> Vec<u16> {
        match self {
            PortPolicy::Ephemeral => vec![0],
            PortPolicy::Fixed(port) => vec![*port],
            PortPolicy::Candidates(ports) => ports.clone(),
        }
    }
}

/// Loopback backend settings.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub port: PortPolicy,
    /// Path the Authorization Server redirects to, e.g. `/callback`.
    pub callback_path: String,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            port: PortPolicy::Ephemeral,
            callback_path: "/callback".to_string(),
        }
    }
}

impl LoopbackConfig {
    pub fn new(port: PortPolicy) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_callback_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.callback_path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }
}

/// A bound loopback listener waiting for its one redirect.
#[derive(Debug)]
pub struct LoopbackListener {
    listener: TcpListener,
    addr: SocketAddr,
    callback_path: String,
}

impl LoopbackListener {
    /// Bind `127.0.0.1` according to the port policy.
    pub async fn start(config: &LoopbackConfig) -> Result<Self> {
        let mut last_error = None;

        for port in config.port.ports() {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => {
                    let addr = listener.local_addr()?;
                    tracing::info!(addr = %addr, "Loopback redirect listener bound");
                    return Ok(Self {
                        listener,
                        addr,
                        callback_path: config.callback_path.clone(),
                    });
                }
                Err(e) => {
                    tracing::debug!(port, error = %e, "Loopback port unavailable");
                    last_error = Some(format!("127.0.0.1:{}: {}", port, e));
                }
            }
        }

        let message = last_error.unwrap_or_else(|| "no candidate ports configured".to_string());
        tracing::warn!(error = %message, "Failed to bind loopback listener");
        Err(CaptureError::Bind(message))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Redirect URI to register with the authorize request.
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), self.callback_path)
    }

    /// Wait for one redirect, at most `deadline` from now (capped at
    /// [`MAX_WAIT`](crate::wait::MAX_WAIT)).
    pub async fn await_one(
        self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<CapturedRedirect> {
        self.await_until(deadline_after(deadline), cancel).await
    }

    /// Wait for one redirect until the absolute `deadline`.
    ///
    /// Consumes the listener; the port is released before this returns.
    pub async fn await_until(
        self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<CapturedRedirect> {
        let Self {
            listener,
            addr,
            callback_path,
        } = self;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CaptureError::Cancelled),
            served = tokio::time::timeout_at(deadline, serve_one(&listener, &callback_path)) => {
                served.unwrap_or(Err(CaptureError::Timeout))
            }
        };

        drop(listener);

        match &outcome {
            Ok(redirect) => {
                tracing::info!(addr = %addr, error = redirect.is_error(), "Redirect captured on loopback")
            }
            Err(CaptureError::Timeout) => {
                tracing::warn!(addr = %addr, "Loopback capture timed out")
            }
            Err(CaptureError::Cancelled) => {
                tracing::info!(addr = %addr, "Loopback capture cancelled")
            }
            Err(e) => tracing::warn!(addr = %addr, error = %e, "Loopback capture failed"),
        }

        outcome
    }
}

/// Accept one connection, answer it, and return what it carried.
async fn serve_one(listener: &TcpListener, callback_path: &str) -> Result<CapturedRedirect> {
    let (mut stream, peer) = listener.accept().await?;
    tracing::debug!(peer = %peer, "Accepted redirect connection");

    let head = read_request_head(&mut stream).await?;
    let (response, outcome) = handle_request(&head, callback_path);

    if let Err(e) = stream.write_all(&response).await {
        tracing::debug!(error = %e, "Failed to write redirect response");
    }
    let _ = stream.shutdown().await;
    drain(&mut stream).await;

    outcome
}

/// Read until the blank line ending the head, EOF, or the size cap.
async fn read_request_head(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    while buf.len() < MAX_REQUEST_BYTES {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if head_complete(&buf) {
            break;
        }
    }

    Ok(buf)
}

fn head_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.windows(2).any(|w| w == b"\n\n")
}

/// Read and discard whatever the client still sends so it sees a clean close.
async fn drain(stream: &mut TcpStream) {
    let mut scratch = [0u8; 1024];
    let _ = tokio::time::timeout(DRAIN_GRACE, async {
        while let Ok(n) = stream.read(&mut scratch).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

/// Turn the request head into a wire response and a capture outcome.
fn handle_request(head: &[u8], callback_path: &str) -> (Vec<u8>, Result<CapturedRedirect>) {
    let request = match parse_request(head) {
        Ok(request) => request,
        Err(e) => return (bad_request(), Err(e.into())),
    };

    if request.method != "GET" {
        let response = write_response(
            405,
            "Method Not Allowed",
            "text/html; charset=utf-8",
            BAD_REQUEST_PAGE.as_bytes(),
        );
        return (
            response,
            Err(ParseError::UnsupportedMethod(request.method).into()),
        );
    }

    if request.path != callback_path {
        let response = write_response(
            404,
            "Not Found",
            "text/html; charset=utf-8",
            BAD_REQUEST_PAGE.as_bytes(),
        );
        return (response, Err(ParseError::UnexpectedPath(request.path).into()));
    }

    match request
        .query_params()
        .and_then(CapturedRedirect::from_params)
    {
        Ok(redirect) => {
            let page = if redirect.is_error() {
                DENIED_PAGE
            } else {
                SUCCESS_PAGE
            };
            let response = write_response(200, "OK", "text/html; charset=utf-8", page.as_bytes());
            (response, Ok(redirect))
        }
        Err(e) => (bad_request(), Err(e.into())),
    }
}

fn bad_request() -> Vec<u8> {
    write_response(
        400,
        "Bad Request",
        "text/html; charset=utf-8",
        BAD_REQUEST_PAGE.as_bytes(),
    )
}
