//! PKCE (RFC 7636) verifier and challenge material.

use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{CaptureError, Result};

/// Code challenge method sent with the authorize request.
pub const CHALLENGE_METHOD: &str = "S256";

/// Random bytes behind each verifier. 32 bytes encode to 43 characters.
const VERIFIER_BYTES: usize = 32;

/// Fill `len` bytes from the OS random source and encode them base64url.
pub(crate) fn random_token(len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CaptureError::Entropy(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Compute `BASE64URL(SHA256(ASCII(verifier)))`.
pub fn derive_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// PKCE code verifier and its S256 challenge.
///
/// The verifier stays with the flow until the token exchange; only the
/// challenge goes out in the authorize URL.
#[derive(Clone)]
pub struct PkceMaterial {
    verifier: String,
    challenge: String,
}

impl PkceMaterial {
    /// Generate a new verifier from the OS secure random source.
    pub fn generate() -> Result<Self> {
        let verifier = random_token(VERIFIER_BYTES)?;
        let challenge = derive_challenge(&verifier);
        Ok(Self {
            verifier,
            challenge,
        })
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn method(&self) -> &'static str {
        CHALLENGE_METHOD
    }

    /// Re-derive the challenge and compare.
    pub fn verify(&self) -> bool {
        derive_challenge(&self.verifier) == self.challenge
    }

    /// Give up the verifier for the token exchange.
    pub fn into_verifier(self) -> String {
        self.verifier
    }
}

impl fmt::Debug for PkceMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceMaterial")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .field("method", &CHALLENGE_METHOD)
            .finish()
    }
}
