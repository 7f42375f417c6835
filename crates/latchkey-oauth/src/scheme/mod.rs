//! Redirect capture through an OS-registered custom URI scheme.
//!
//! The OS launches a fresh copy of the app with the redirect URI after the
//! launch flag. That copy finds the instance lock taken, relays the URI to
//! the primary over [`ipc`], and exits.
//!
//! - [`registrar`]: per-platform scheme association
//! - [`instance`]: single-instance lock
//! - [`ipc`]: secondary → primary relay

pub mod instance;
pub mod ipc;
pub mod registrar;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CaptureError, ParseError, RegistrationError, Result};
use crate::redirect::CapturedRedirect;
use crate::wait::deadline_after;

pub use instance::SingleInstanceLock;
pub use ipc::{IpcAddress, IpcEndpoint};
pub use registrar::{
    DEFAULT_LAUNCH_FLAG, DesktopEntryRegistrar, LaunchServicesRegistrar, RegistryRegistrar,
    SchemeRegistrar, SchemeRegistration, platform_registrar,
};

/// Default directory for the instance lock and relay socket.
///
/// Always per-user: `$XDG_RUNTIME_DIR/latchkey`, else the user cache dir,
/// else `latchkey-<user>` under the system temp dir.
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .map(|dir| dir.join("latchkey"))
        .unwrap_or_else(|| std::env::temp_dir().join(format!("latchkey-{}", user_name())))
}

/// Login name of the current user, for per-user paths.
pub(crate) fn user_name() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
        .map(|name| {
            name.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                .collect()
        })
        .unwrap_or_else(|| "user".to_string())
}

/// Result of trying to become the primary instance.
#[derive(Debug)]
pub enum SingletonOutcome {
    /// This process holds the lock and owns the relay endpoint.
    Primary(PrimaryInstance),
    /// Another process holds the lock. Carries the URI passed after the
    /// launch flag, if this process was started with one.
    Secondary(Option<String>),
}

/// Custom-scheme capture backend.
#[derive(Debug)]
pub struct SchemeBackend {
    registration: SchemeRegistration,
    registrar: Box<dyn SchemeRegistrar>,
    runtime_dir: PathBuf,
    callback_path: String,
}

impl SchemeBackend {
    pub fn new(registration: SchemeRegistration) -> Self {
        Self {
            registration,
            registrar: platform_registrar(),
            runtime_dir: default_runtime_dir(),
            callback_path: "callback".to_string(),
        }
    }

    pub fn with_registrar(mut self, registrar: Box<dyn SchemeRegistrar>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_callback_path(mut self, path: impl Into<String>) -> Self {
        self.callback_path = path.into().trim_start_matches('/').to_string();
        self
    }

    pub fn registration(&self) -> &SchemeRegistration {
        &self.registration
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// `<scheme>:<callback_path>`, the redirect URI handed to the server.
    pub fn redirect_uri(&self) -> String {
        format!("{}:{}", self.registration.scheme_name, self.callback_path)
    }

    fn lock_path(&self) -> PathBuf {
        self.runtime_dir
            .join(format!("{}.lock", self.registration.app_id))
    }

    fn ipc_address(&self) -> IpcAddress {
        IpcAddress::for_app(&self.runtime_dir, &self.registration.app_id)
    }

    /// Verify the OS association, installing it if missing or stale.
    ///
    /// Returns `true` when an install was performed.
    pub fn ensure_registered(&self) -> std::result::Result<bool, RegistrationError> {
        registrar::ensure_registered(self.registrar.as_ref(), &self.registration)
    }

    /// Install the OS association unconditionally.
    pub fn register(&self) -> std::result::Result<(), RegistrationError> {
        self.registrar.install(&self.registration)?;
        tracing::info!(scheme = %self.registration.scheme_name, "Installed scheme association");
        Ok(())
    }

    pub fn is_registered(&self) -> std::result::Result<bool, RegistrationError> {
        self.registrar.is_registered(&self.registration)
    }

    /// Remove the OS association. Only for explicit uninstall.
    pub fn unregister(&self) -> std::result::Result<(), RegistrationError> {
        self.registrar.uninstall(&self.registration)?;
        tracing::info!(scheme = %self.registration.scheme_name, "Removed scheme association");
        Ok(())
    }

    /// Find the URI passed after the launch flag, as `--flag <uri>` or `--flag=<uri>`.
    pub fn launch_uri<I, S>(&self, args: I) -> Option<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let flag = self.registration.launch_flag.as_str();
        let prefixed = format!("{}=", flag);
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let arg = arg.as_ref();
            if arg == flag {
                return args.next().map(|uri| uri.as_ref().to_string());
            }
            if let Some(uri) = arg.strip_prefix(&prefixed) {
                return Some(uri.to_string());
            }
        }
        None
    }

    /// Try to become the primary instance.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn acquire_singleton<I, S>(&self, args: I) -> Result<SingletonOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(lock) = SingleInstanceLock::try_acquire(&self.lock_path())? else {
            let uri = self.launch_uri(args);
            tracing::info!(has_uri = uri.is_some(), "Another instance is primary");
            return Ok(SingletonOutcome::Secondary(uri));
        };

        let endpoint = IpcEndpoint::bind(self.ipc_address())?;
        Ok(SingletonOutcome::Primary(PrimaryInstance {
            endpoint,
            scheme: self.registration.scheme_name.clone(),
            _lock: lock,
        }))
    }

    /// Forward a launch URI to the primary instance.
    pub async fn relay(&self, uri: &str) -> Result<()> {
        ipc::send(&self.ipc_address(), uri).await?;
        tracing::info!("Relayed launch URI to primary instance");
        Ok(())
    }
}

/// Lock and relay endpoint held by the primary instance.
#[derive(Debug)]
pub struct PrimaryInstance {
    endpoint: IpcEndpoint,
    scheme: String,
    // Declared last so the endpoint is torn down before the lock is released.
    _lock: SingleInstanceLock,
}

impl PrimaryInstance {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Wait for one relayed URI, at most `deadline` from now (capped at
    /// [`MAX_WAIT`](crate::wait::MAX_WAIT)).
    pub async fn await_relayed(
        self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<CapturedRedirect> {
        self.await_until(deadline_after(deadline), cancel).await
    }

    /// Wait for one relayed URI until the absolute `deadline`.
    ///
    /// Consumes the instance: endpoint and lock are released before return.
    pub async fn await_until(
        self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<CapturedRedirect> {
        let Self {
            mut endpoint,
            scheme,
            _lock: lock,
        } = self;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CaptureError::Cancelled),
            received = tokio::time::timeout_at(deadline, endpoint.recv_one()) => {
                match received {
                    Ok(Ok(uri)) => parse_scheme_uri(&uri, &scheme).map_err(CaptureError::from),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(CaptureError::Timeout),
                }
            }
        };

        drop(endpoint);
        drop(lock);

        match &outcome {
            Ok(redirect) => tracing::info!(error = redirect.is_error(), "Redirect relayed via scheme"),
            Err(CaptureError::Timeout) => tracing::warn!("Scheme capture timed out"),
            Err(CaptureError::Cancelled) => tracing::info!("Scheme capture cancelled"),
            Err(e) => tracing::warn!(error = %e, "Scheme capture failed"),
        }

        outcome
    }
}

/// Decode `<scheme>:<path>?<params>` into a redirect.
pub fn parse_scheme_uri(uri: &str, scheme: &str) -> std::result::Result<CapturedRedirect, ParseError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(ParseError::Empty);
    }

    let matches_scheme = uri
        .split_once(':')
        .is_some_and(|(s, _)| s.eq_ignore_ascii_case(scheme));
    if !matches_scheme {
        return Err(ParseError::InvalidScheme(scheme.to_string()));
    }

    let without_fragment = uri.split_once('#').map_or(uri, |(before, _)| before);
    match without_fragment.split_once('?') {
        Some((_, query)) => CapturedRedirect::from_query(query),
        None => Err(ParseError::MissingCode),
    }
}
