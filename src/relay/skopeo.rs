// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Skopeo relay: `skopeo copy docker://<source> docker://<target>`.
//!
//! Also lists tags with `skopeo list-tags`, so a skopeo setup needs no
//! direct registry access from this process.

use super::{looks_like_auth_failure, replicate_each, Relay, ReplicationFuture, ReplicationRequest};
use crate::auth::Credentials;
use crate::config::SkopeoConfig;
use crate::endpoint::Endpoint;
use crate::error::{BoxFuture, Result, SyncError};
use crate::tags::TagLister;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const RELAY: &str = "skopeo";

#[derive(Debug, Deserialize)]
struct ListTagsOutput {
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
}

/// Which side of a copy an endpoint is on; selects the flag prefix.
#[derive(Debug, Clone, Copy)]
enum Side {
    Source,
    Dest,
    /// `list-tags` and other single-image commands take unprefixed flags.
    Single,
}

impl Side {
    fn flag(self, name: &str) -> String {
        match self {
            Side::Source => format!("--src-{name}"),
            Side::Dest => format!("--dest-{name}"),
            Side::Single => format!("--{name}"),
        }
    }
}

/// Relay shelling out to skopeo.
#[derive(Debug, Clone)]
pub struct SkopeoRelay {
    binary: String,
    certs_dir: Option<PathBuf>,
    all_platforms: bool,
}

impl SkopeoRelay {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            certs_dir: None,
            all_platforms: false,
        }
    }

    pub fn from_config(config: &SkopeoConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            certs_dir: config.certs_dir.as_ref().map(PathBuf::from),
            all_platforms: config.all_platforms,
        }
    }

    /// Certificate directory for `endpoint`, if one exists.
    fn cert_dir(&self, endpoint: &Endpoint) -> Option<PathBuf> {
        let dir = self.certs_dir.as_deref()?.join(endpoint.host());
        dir.is_dir().then_some(dir)
    }

    async fn endpoint_args(&self, endpoint: &Endpoint, side: Side) -> Vec<String> {
        let mut args = vec![format!("{}={}", side.flag("tls-verify"), endpoint.tls_verify())];
        if let Some(dir) = self.cert_dir(endpoint) {
            args.push(side.flag("cert-dir"));
            args.push(dir.display().to_string());
        }
        match endpoint.credentials().await {
            Credentials::Anonymous => {}
            Credentials::RegistryToken(token) => {
                args.push(side.flag("registry-token"));
                args.push(token);
            }
            other => {
                if let Some((user, password)) = other.basic_pair() {
                    args.push(side.flag("creds"));
                    args.push(format!("{user}:{password}"));
                }
            }
        }
        args
    }

    /// Arguments of `skopeo copy` for one tag.
    async fn copy_args(&self, request: &ReplicationRequest, tag: &str) -> Vec<String> {
        let mut args = vec!["copy".to_string()];
        if self.all_platforms {
            args.push("--all".to_string());
        }
        args.extend(self.endpoint_args(&request.source, Side::Source).await);
        args.extend(self.endpoint_args(&request.target, Side::Dest).await);
        args.push(format!("docker://{}", request.source_ref(tag)));
        args.push(format!("docker://{}", request.target_ref(tag)));
        args
    }

    /// Run skopeo, returning stdout. Dropping the future kills the child.
    async fn run(&self, args: &[String], endpoints: &[&Endpoint]) -> Result<String> {
        trace!(binary = %self.binary, args = ?redact(args), "spawn");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SyncError::relay(RELAY, format!("cannot run {}: {e}", self.binary)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let status = match output.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        if looks_like_auth_failure(&stderr) {
            let registry = endpoints
                .iter()
                .rev()
                .find(|ep| stderr.contains(ep.host()))
                .or_else(|| endpoints.first())
                .map(|ep| ep.host().to_string())
                .unwrap_or_default();
            return Err(SyncError::auth(registry, stderr));
        }
        Err(SyncError::relay(RELAY, format!("{status}: {stderr}")))
    }

    async fn list(&self, endpoint: &Endpoint, path: &str) -> Result<Vec<String>> {
        let mut args = vec!["list-tags".to_string()];
        args.extend(self.endpoint_args(endpoint, Side::Single).await);
        args.push(format!("docker://{}/{}", endpoint.host(), path.trim_matches('/')));

        let stdout = match self.run(&args, &[endpoint]).await {
            Ok(stdout) => stdout,
            Err(SyncError::Relay { message, .. }) if is_missing_repository(&message) => {
                debug!(registry = %endpoint.registry(), path, "Repository not found");
                return Ok(Vec::new());
            }
            Err(SyncError::Relay { message, .. }) => {
                return Err(SyncError::registry_msg(endpoint.host(), "list_tags", message))
            }
            Err(e) => return Err(e),
        };

        let parsed: ListTagsOutput = serde_json::from_str(&stdout).map_err(|e| {
            SyncError::registry_msg(endpoint.host(), "list_tags", format!("invalid skopeo output: {e}"))
        })?;
        Ok(parsed.tags.unwrap_or_default())
    }
}

fn is_missing_repository(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("name unknown")
        || message.contains("repository name not known")
        || message.contains("manifest unknown")
        || message.contains("status 404")
        || message.contains("status code 404")
        || message.contains("404 not found")
}

/// Hide credential values in logged argument lists.
fn redact(args: &[String]) -> Vec<&str> {
    let mut redact_next = false;
    args.iter()
        .map(|arg| {
            if std::mem::take(&mut redact_next) {
                return "***";
            }
            redact_next = arg.ends_with("creds") || arg.ends_with("registry-token");
            arg.as_str()
        })
        .collect()
}

impl Relay for SkopeoRelay {
    fn name(&self) -> &'static str {
        RELAY
    }

    fn replicate<'a>(
        &'a self,
        request: &'a ReplicationRequest,
        tags: &'a [String],
        target_tags: Option<&'a [String]>,
        cancel: &'a CancellationToken,
    ) -> ReplicationFuture<'a> {
        Box::pin(async move {
            replicate_each(RELAY, request, tags, target_tags, cancel, |tag| async move {
                let args = self.copy_args(request, &tag).await;
                self.run(&args, &[&*request.source, &*request.target]).await.map(|_| ())
            })
            .await
        })
    }
}

impl TagLister for SkopeoRelay {
    fn list_tags<'a>(&'a self, endpoint: &'a Endpoint, path: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(self.list(endpoint, path))
    }
}
