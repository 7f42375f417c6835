//! OAuth 2.0 authorization-code + PKCE redirect capture for native apps.
//!
//! Lets a desktop or CLI app receive the one-time authorization code without
//! a public endpoint, then hand `(code, verifier)` to the token exchange.
//!
//! # Components
//!
//! - [`pkce`]: verifier generation and S256 challenge
//! - [`http`]: request-line parser and response writer for the capture endpoint
//! - [`redirect`]: the captured redirect parameters
//! - [`loopback`]: single-use `127.0.0.1` listener
//! - [`scheme`]: custom URI scheme, single-instance lock, secondary → primary relay
//! - [`oauth`]: authorize URL construction
//! - [`coordinator`]: the end-to-end flow and its state machine
//! - [`wait`]: capped deadlines shared by the backends

pub mod coordinator;
pub mod error;
pub mod http;
pub mod loopback;
pub mod oauth;
pub mod pkce;
pub mod redirect;
pub mod scheme;
pub mod wait;

pub use coordinator::{
    AuthorizationCoordinator, AuthorizationGrant, AuthorizationOutcome, BackendChoice,
    FailureReason, FlowState,
};
pub use error::{CaptureError, FlowError, ParseError, RegistrationError, Result};
pub use loopback::{LoopbackConfig, LoopbackListener, PortPolicy};
pub use oauth::AuthorizeConfig;
pub use pkce::PkceMaterial;
pub use redirect::{CapturedRedirect, RedirectOutcome};
pub use scheme::{PrimaryInstance, SchemeBackend, SchemeRegistration, SingletonOutcome};
pub use tokio_util::sync::CancellationToken;
pub use wait::MAX_WAIT;
