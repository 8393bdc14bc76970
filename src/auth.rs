// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry credentials and the auth-refresh seam.
//!
//! Auth material in configuration is opaque to everything but this module.
//! Two formats are accepted:
//!
//! - base64-encoded JSON, the same payload the Docker Engine takes in its
//!   `X-Registry-Auth` header: `{"username": .., "password": ..}`,
//!   `{"identitytoken": ..}` or `{"registrytoken": ..}`
//! - plain `user:password`
//!
//! Minting credentials (cloud token exchange and the like) is left to an
//! [`AuthRefresher`] supplied by the embedding application.

use crate::endpoint::Endpoint;
use crate::error::{BoxFuture, Result, SyncError};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;

/// Username docker credential helpers pair with an identity token.
const IDENTITY_TOKEN_USER: &str = "<token>";

/// Credentials for one registry endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
    /// OAuth refresh token (`identitytoken`).
    IdentityToken(String),
    /// Bearer token sent to the registry as-is (`registrytoken`).
    RegistryToken(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
            Self::IdentityToken(_) => write!(f, "IdentityToken(***)"),
            Self::RegistryToken(_) => write!(f, "RegistryToken(***)"),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identitytoken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registrytoken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    serveraddress: Option<String>,
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    /// Decode configured auth material.
    pub fn decode(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::Anonymous);
        }

        let decoded = STANDARD
            .decode(raw)
            .or_else(|_| URL_SAFE.decode(raw))
            .ok()
            .and_then(|bytes| serde_json::from_slice::<AuthPayload>(&bytes).ok());

        if let Some(payload) = decoded {
            if let Some(token) = payload.registrytoken.filter(|t| !t.is_empty()) {
                return Ok(Self::RegistryToken(token));
            }
            if let Some(token) = payload.identitytoken.filter(|t| !t.is_empty()) {
                return Ok(Self::IdentityToken(token));
            }
            return match (payload.username, payload.password) {
                (Some(username), Some(password)) => Ok(Self::Basic { username, password }),
                (None, None) => Ok(Self::Anonymous),
                _ => Err(SyncError::Config(
                    "auth JSON needs both username and password".to_string(),
                )),
            };
        }

        match raw.split_once(':') {
            Some((username, password)) if !username.is_empty() => {
                Ok(Self::basic(username, password))
            }
            _ => Err(SyncError::Config(
                "auth must be base64 encoded JSON or 'user:password'".to_string(),
            )),
        }
    }

    /// Username/password pair for basic auth, if any.
    pub fn basic_pair(&self) -> Option<(&str, &str)> {
        match self {
            Self::Basic { username, password } => Some((username, password)),
            Self::IdentityToken(token) => Some((IDENTITY_TOKEN_USER, token)),
            _ => None,
        }
    }

    /// Value for the Docker Engine `X-Registry-Auth` header.
    pub fn to_x_registry_auth(&self, server: &str) -> String {
        let payload = match self {
            Self::Anonymous => AuthPayload::default(),
            Self::Basic { username, password } => AuthPayload {
                username: Some(username.clone()),
                password: Some(password.clone()),
                ..Default::default()
            },
            Self::IdentityToken(token) => AuthPayload {
                identitytoken: Some(token.clone()),
                ..Default::default()
            },
            Self::RegistryToken(token) => AuthPayload {
                registrytoken: Some(token.clone()),
                ..Default::default()
            },
        };
        let payload = AuthPayload {
            serveraddress: Some(server.to_string()),
            ..payload
        };
        // AuthPayload only holds strings, serialization cannot fail
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        URL_SAFE.encode(json)
    }
}

/// Supplies fresh credentials for an endpoint.
///
/// Called proactively when an endpoint signals expiry and reactively, once,
/// after an authentication failure.
pub trait AuthRefresher: Send + Sync + 'static {
    fn refresh<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Credentials>;
}

/// Run `op`; on an [`SyncError::Auth`] refresh the affected endpoints once and
/// run `op` a second time.
///
/// Endpoints whose registry matches the failing registry are refreshed; if
/// none match, all of them are. Without a refresher the auth error is
/// returned unchanged. A second consecutive auth error is returned as-is.
pub async fn with_auth_retry<T, F, Fut>(
    endpoints: &[&Endpoint],
    refresher: Option<&dyn AuthRefresher>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut observed = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        observed.push(endpoint.generation().await);
    }

    let err = match op().await {
        Err(e) if e.is_auth() => e,
        other => return other,
    };
    let Some(refresher) = refresher else {
        return Err(err);
    };

    let failed_registry = match &err {
        SyncError::Auth { registry, .. } => registry.as_str(),
        _ => "",
    };
    let matches: Vec<usize> = endpoints
        .iter()
        .enumerate()
        .filter(|(_, ep)| ep.registry() == failed_registry || ep.host() == failed_registry)
        .map(|(i, _)| i)
        .collect();
    let affected: Vec<usize> = if matches.is_empty() {
        (0..endpoints.len()).collect()
    } else {
        matches
    };

    warn!(registry = failed_registry, error = %err, "Authentication rejected, refreshing credentials");
    for i in affected {
        endpoints[i].refresh(refresher, observed[i]).await?;
    }

    op().await
}
