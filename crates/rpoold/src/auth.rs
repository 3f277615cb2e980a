//! Request authentication shared by both frontends.
//!
//! Passwords are verified against stored SHA-256 hex digests; API keys are
//! matched to a user via `X-API-Key` or `Authorization: Bearer`. With the
//! method set to `none` every request authenticates as `anonymous`.

use axum::http::HeaderMap;
use base64::Engine as _;
use rpool_core::config::{AuthMethod, PoolConfig};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct UserEntry {
    password_sha256: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug)]
pub struct AuthManager {
    method: AuthMethod,
    users: HashMap<String, UserEntry>,
}

pub fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl AuthManager {
    pub fn from_config(config: &PoolConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| {
                (
                    u.username.clone(),
                    UserEntry {
                        password_sha256: u.password_sha256.clone(),
                        api_key: u.api_key.clone(),
                    },
                )
            })
            .collect();
        AuthManager {
            method: config.webdav_auth_method,
            users,
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Returns the authenticated principal, or `None` for a 401.
    pub fn verify(&self, headers: &HeaderMap) -> Option<String> {
        match self.method {
            AuthMethod::None => Some("anonymous".to_string()),
            AuthMethod::Basic => self.verify_basic(headers),
            AuthMethod::ApiKey | AuthMethod::Bearer => self.verify_key(headers),
        }
    }

    fn verify_basic(&self, headers: &HeaderMap) -> Option<String> {
        let header = headers.get("authorization")?.to_str().ok()?;
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        let entry = self.users.get(username)?;
        let stored = entry.password_sha256.as_deref()?;
        if sha256_hex(password).eq_ignore_ascii_case(stored) {
            Some(username.to_string())
        } else {
            tracing::warn!(user = %username, "basic auth failed");
            None
        }
    }

    fn verify_key(&self, headers: &HeaderMap) -> Option<String> {
        let presented = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .or_else(|| {
                headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
            })?;
        self.users
            .iter()
            .find(|(_, entry)| entry.api_key.as_deref() == Some(presented))
            .map(|(username, _)| username.clone())
    }
}
