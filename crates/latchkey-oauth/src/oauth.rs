//! Authorize request construction.

use crate::error::Result;
use crate::pkce::{PkceMaterial, random_token};

/// Client settings for the authorize request.
#[derive(Debug, Clone)]
pub struct AuthorizeConfig {
    pub client_id: String,
    pub authorize_endpoint: String,
    pub scope: String,
    /// Provider-specific extras, e.g. `access_type=offline`.
    pub extra_params: Vec<(String, String)>,
}

impl AuthorizeConfig {
    pub fn new(client_id: impl Into<String>, authorize_endpoint: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            authorize_endpoint: authorize_endpoint.into(),
            scope: String::new(),
            extra_params: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.push((key.into(), value.into()));
        self
    }
}

/// Generate a random state string for CSRF protection.
pub fn generate_state() -> Result<String> {
    random_token(32)
}

/// Build the authorization URL for the flow.
pub fn build_authorization_url(
    config: &AuthorizeConfig,
    pkce: &PkceMaterial,
    state: &str,
    redirect_uri: &str,
) -> String {
    let mut params: Vec<(&str, &str)> = vec![
        ("response_type", "code"),
        ("client_id", config.client_id.as_str()),
        ("redirect_uri", redirect_uri),
        ("code_challenge", pkce.challenge()),
        ("code_challenge_method", pkce.method()),
        ("state", state),
    ];
    if !config.scope.is_empty() {
        params.push(("scope", config.scope.as_str()));
    }
    for (key, value) in &config.extra_params {
        params.push((key.as_str(), value.as_str()));
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let separator = if config.authorize_endpoint.contains('?') {
        '&'
    } else {
        '?'
    };
    format!("{}{}{}", config.authorize_endpoint, separator, query)
}
