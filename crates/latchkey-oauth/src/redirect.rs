//! The redirect parameters handed back by the Authorization Server.

use std::collections::HashMap;

use crate::error::ParseError;

/// What the Authorization Server put in the redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// The user approved; carries the authorization code.
    Code(String),
    /// The server rejected the request (RFC 6749 §4.1.2.1).
    Error {
        error: String,
        description: Option<String>,
    },
}

/// One captured redirect: exactly one of code or error, plus the echoed state.
#[derive(Clone, PartialEq, Eq)]
pub struct CapturedRedirect {
    pub state: Option<String>,
    pub outcome: RedirectOutcome,
}

impl CapturedRedirect {
    /// Build from decoded query parameters.
    ///
    /// `error` takes precedence over `code` when a server sends both.
    pub fn from_params(mut params: HashMap<String, String>) -> Result<Self, ParseError> {
        let state = params.remove("state");

        let outcome = if let Some(error) = params.remove("error") {
            RedirectOutcome::Error {
                error,
                description: params.remove("error_description"),
            }
        } else if let Some(code) = params.remove("code").filter(|c| !c.is_empty()) {
            RedirectOutcome::Code(code)
        } else {
            return Err(ParseError::MissingCode);
        };

        Ok(Self { state, outcome })
    }

    /// Build from a raw query string.
    pub fn from_query(query: &str) -> Result<Self, ParseError> {
        Self::from_params(crate::http::parse_query(query)?)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, RedirectOutcome::Error { .. })
    }
}

// Codes are credentials; keep them out of logs.
impl std::fmt::Debug for CapturedRedirect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = match &self.outcome {
            RedirectOutcome::Code(_) => "Code(<redacted>)".to_string(),
            RedirectOutcome::Error { error, .. } => format!("Error({error})"),
        };
        f.debug_struct("CapturedRedirect")
            .field("state_present", &self.state.is_some())
            .field("outcome", &outcome)
            .finish()
    }
}
