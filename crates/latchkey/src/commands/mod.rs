//! CLI command handlers.

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use latchkey_config::{ClientConfig, LatchkeyConfig, LoopbackSection, SchemeSection};
use latchkey_oauth::{
    AuthorizeConfig, LoopbackConfig, PortPolicy, SchemeBackend, SchemeRegistration,
};

pub mod callback;
pub mod login;
pub mod register;
pub mod status;
pub mod unregister;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration, environment overrides applied.
    pub config: LatchkeyConfig,
    /// Config files that were loaded, lowest precedence first.
    pub sources: Vec<PathBuf>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// Authorize-request settings from a validated `[client]` section.
pub fn authorize_config(client: &ClientConfig) -> AuthorizeConfig {
    let mut config = AuthorizeConfig::new(
        client.client_id.clone().unwrap_or_default(),
        client.authorize_endpoint.clone().unwrap_or_default(),
    );
    if let Some(scope) = &client.scope {
        config = config.with_scope(scope.clone());
    }
    for (key, value) in &client.extra_params {
        config = config.with_param(key.clone(), value.clone());
    }
    config
}

/// `port` first, then `fallback_ports`.
pub fn port_policy(section: &LoopbackSection) -> PortPolicy {
    if section.fallback_ports.is_empty() {
        return match section.port {
            0 => PortPolicy::Ephemeral,
            port => PortPolicy::Fixed(port),
        };
    }
    let candidates = std::iter::once(section.port)
        .filter(|p| *p != 0)
        .chain(section.fallback_ports.iter().copied())
        .collect();
    PortPolicy::Candidates(candidates)
}

pub fn loopback_config(section: &LoopbackSection) -> LoopbackConfig {
    LoopbackConfig::new(port_policy(section)).with_callback_path(section.callback_path.clone())
}

/// Scheme backend bound to the running executable.
pub fn scheme_backend(section: &SchemeSection) -> Result<SchemeBackend> {
    if !is_valid_scheme(&section.scheme) {
        bail!(
            "Invalid scheme '{}': must start with a letter and contain only letters, digits, '+', '-' or '.'",
            section.scheme
        );
    }
    let registration = SchemeRegistration::for_current_exe(&section.app_id, &section.scheme)
        .context("Could not determine the path of this executable")?;

    let mut backend =
        SchemeBackend::new(registration).with_callback_path(section.callback_path.clone());
    if let Some(dir) = &section.runtime_dir {
        backend = backend.with_runtime_dir(dir);
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    if let Some(dir) = &section.applications_dir {
        use latchkey_oauth::scheme::DesktopEntryRegistrar;
        backend = backend.with_registrar(Box::new(DesktopEntryRegistrar::with_applications_dir(
            dir,
        )));
    }
    Ok(backend)
}

/// RFC 3986 `scheme = ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )`.
fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_policy() {
        let mut section = LoopbackSection::default();
        assert_eq!(port_policy(&section), PortPolicy::Ephemeral);

        section.port = 8400;
        assert_eq!(port_policy(&section), PortPolicy::Fixed(8400));

        section.fallback_ports = vec![8401, 8402];
        assert_eq!(
            port_policy(&section),
            PortPolicy::Candidates(vec![8400, 8401, 8402])
        );

        section.port = 0;
        assert_eq!(
            port_policy(&section),
            PortPolicy::Candidates(vec![8401, 8402])
        );
    }

    #[test]
    fn test_scheme_validation() {
        assert!(is_valid_scheme("latchkey"));
        assert!(is_valid_scheme("com.example.app"));
        assert!(is_valid_scheme("my-app+x"));
        assert!(!is_valid_scheme(""));
        assert!(!is_valid_scheme("1app"));
        assert!(!is_valid_scheme("my app"));
        assert!(!is_valid_scheme("app:"));
    }

    #[test]
    fn test_scheme_backend_from_section() {
        let section = SchemeSection {
            scheme: "MyApp".to_string(),
            callback_path: "/done".to_string(),
            runtime_dir: Some(PathBuf::from("/tmp/latchkey-test")),
            ..SchemeSection::default()
        };
        let backend = scheme_backend(&section).unwrap();
        assert_eq!(backend.redirect_uri(), "myapp:done");
        assert_eq!(backend.runtime_dir(), std::path::Path::new("/tmp/latchkey-test"));

        let bad = SchemeSection {
            scheme: "not a scheme".to_string(),
            ..SchemeSection::default()
        };
        assert!(scheme_backend(&bad).is_err());
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    #[test]
    fn test_scheme_backend_applications_dir() {
        let dir = tempfile::tempdir().unwrap();
        let apps = dir.path().join("applications");
        let section = SchemeSection {
            scheme: "dirapp".to_string(),
            runtime_dir: Some(dir.path().join("run")),
            applications_dir: Some(apps.clone()),
            ..SchemeSection::default()
        };
        let backend = scheme_backend(&section).unwrap();
        assert!(!backend.is_registered().unwrap());

        backend.register().unwrap();
        assert!(apps.join("latchkey-dirapp.desktop").exists());
        assert!(backend.is_registered().unwrap());
    }
}
