// Bearer credential storage and expiry decoding.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::cache::{StorageBackend, StorageError};

/// Durable-store key of the active credential.
pub const TOKEN_KEY: &str = "authToken";

/// How close to expiry a credential must be before it is refreshed.
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Decode the `exp` claim of a JWT without verifying its signature.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp? as i64, 0)
}

/// True when `token` expires within `buffer` of `now`, or its expiry can't be read.
pub fn is_expiring(token: &str, now: DateTime<Utc>, buffer: Duration) -> bool {
    let Some(expires_at) = decode_expiry(token) else {
        return true;
    };
    let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::MAX);
    expires_at.signed_duration_since(now) <= buffer
}

/// A bearer credential and its decoded expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn parse(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = decode_expiry(&token);
        Self { token, expires_at }
    }

    pub fn is_expiring(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        is_expiring(&self.token, now, buffer)
    }
}

/// The single active credential, kept in the durable store.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn StorageBackend>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn get(&self) -> Option<String> {
        match self.backend.get_item(TOKEN_KEY) {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read stored credential");
                None
            }
        }
    }

    pub fn credential(&self) -> Option<Credential> {
        self.get().map(Credential::parse)
    }

    pub fn set(&self, token: &str) -> Result<(), StorageError> {
        self.backend.set_item(TOKEN_KEY, token)
    }

    /// Remove the credential. Returns true if one was stored.
    pub fn clear(&self) -> bool {
        let present = self.get().is_some();
        if let Err(e) = self.backend.remove_item(TOKEN_KEY) {
            warn!(error = %e, "Failed to remove stored credential");
        }
        present
    }
}
