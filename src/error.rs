// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for registry replication.
//!
//! Errors are categorized by where they occur (configuration, registry API,
//! relay backend, lifecycle) and carry enough context to tell which endpoint
//! or task was involved.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Task/mapping definition invalid, prevents start |
//! | `Auth` | Once | Credentials rejected, retried once after a refresh |
//! | `Registry` | Yes | Tag listing or registry protocol failure |
//! | `Relay` | No | Backend failed to copy an image |
//! | `ShutdownTimeout` | No | Operation cancelled after the grace period |
//! | `Interrupted` | No | Work stopped because shutdown was requested |
//! | `InvalidState` | No | Orchestrator lifecycle misuse |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`SyncError::is_retryable()`] covers transient transport failures only.
//! Authentication failures follow their own rule: exactly one refresh and
//! one retry, see [`crate::auth::with_auth_retry`].

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Boxed future returned by the object-safe traits at the collaborator seams
/// ([`Relay`](crate::Relay), [`TagLister`](crate::TagLister),
/// [`AuthRefresher`](crate::AuthRefresher)).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while mirroring images.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid or inconsistent configuration.
    ///
    /// Fatal at startup: the orchestrator refuses to start.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication or authorization failure at an endpoint.
    #[error("Authentication error ({registry}): {message}")]
    Auth { registry: String, message: String },

    /// Registry API failure (network, protocol, unexpected status).
    #[error("Registry error ({registry}, {operation}): {message}")]
    Registry {
        registry: String,
        operation: String,
        message: String,
        /// HTTP status, when the registry answered.
        status: Option<u16>,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Replication backend failure.
    #[error("Relay error ({relay}): {message}")]
    Relay { relay: String, message: String },

    /// An in-flight operation outlived the shutdown grace period and was
    /// forcibly cancelled.
    #[error("Shutdown timeout: {0} cancelled after grace period")]
    ShutdownTimeout(String),

    /// Work was not started or was abandoned because shutdown was requested.
    #[error("Interrupted by shutdown")]
    Interrupted,

    /// Orchestrator state machine violation.
    ///
    /// (e.g., calling `start()` twice, or `shutdown()` before `start()`).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create an authentication error.
    pub fn auth(registry: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            registry: registry.into(),
            message: message.into(),
        }
    }

    /// Create a registry error from a reqwest error.
    pub fn registry(
        registry: impl Into<String>,
        operation: impl Into<String>,
        source: reqwest::Error,
    ) -> Self {
        Self::Registry {
            registry: registry.into(),
            operation: operation.into(),
            message: source.to_string(),
            status: source.status().map(|s| s.as_u16()),
            source: Some(source),
        }
    }

    /// Create a registry error without source
    pub fn registry_msg(
        registry: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Registry {
            registry: registry.into(),
            operation: operation.into(),
            message: message.into(),
            status: None,
            source: None,
        }
    }

    /// Create a registry error for an unexpected HTTP status.
    pub fn registry_status(
        registry: impl Into<String>,
        operation: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self::Registry {
            registry: registry.into(),
            operation: operation.into(),
            message: message.into(),
            status: Some(status),
            source: None,
        }
    }

    /// Create a relay error.
    pub fn relay(relay: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Relay {
            relay: relay.into(),
            message: message.into(),
        }
    }

    /// Check if this is an authentication failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Check if this error was caused by shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Interrupted | Self::ShutdownTimeout(_))
    }

    /// Check if this error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Registry { status: Some(s), .. } => *s >= 500 || *s == 429,
            Self::Registry { source, .. } => match source {
                Some(e) => e.is_connect() || e.is_timeout() || e.is_request(),
                None => true,
            },
            Self::Auth { .. } => false, // handled by refresh, not backoff
            Self::Config(_) => false,
            Self::Relay { .. } => false,
            Self::ShutdownTimeout(_) => false,
            Self::Interrupted => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Auth { .. } => "auth",
            Self::Registry { .. } => "registry",
            Self::Relay { .. } => "relay",
            Self::ShutdownTimeout(_) => "shutdown_timeout",
            Self::Interrupted => "interrupted",
            Self::InvalidState { .. } => "invalid_state",
            Self::Internal(_) => "internal",
        }
    }
}
