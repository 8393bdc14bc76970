// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for a Distribution registry.
//!
//! Provides helpers to spin up `registry:2` containers and push tiny images
//! into them through the Registry HTTP API.

use sha2::{Digest, Sha256};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const CONFIG_V1: &str = "application/vnd.docker.container.image.v1+json";
const LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Create a plain-HTTP `registry:2` container.
pub fn registry_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("registry", "2")
        .with_exposed_port(5000)
        .with_wait_for(WaitFor::message_on_stderr("listening on"));
    docker.run(image)
}

/// `host:port` of a registry container.
pub fn registry_host(container: &Container<'_, GenericImage>) -> String {
    format!("127.0.0.1:{}", container.get_host_port_ipv4(5000))
}

fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Helper struct for a registry with images pushed over the HTTP API.
pub struct TestRegistry<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    /// `host:port`, without scheme.
    pub host: String,
    client: reqwest::Client,
}

impl<'a> TestRegistry<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = registry_container(docker);
        let host = registry_host(&container);
        Self {
            container,
            host,
            client: reqwest::Client::new(),
        }
    }

    /// Registry address as configured in an endpoint (plain HTTP).
    pub fn address(&self) -> String {
        format!("http://{}", self.host)
    }

    async fn upload_blob(&self, repo: &str, bytes: &[u8]) -> String {
        let digest = digest(bytes);
        let started = self
            .client
            .post(format!("http://{}/v2/{repo}/blobs/uploads/", self.host))
            .send()
            .await
            .unwrap();
        assert_eq!(started.status().as_u16(), 202, "upload start for {repo}");

        let location = started.headers()["location"].to_str().unwrap().to_string();
        let location = if location.starts_with("http") {
            location
        } else {
            format!("http://{}{location}", self.host)
        };
        let separator = if location.contains('?') { '&' } else { '?' };

        let finished = self
            .client
            .put(format!("{location}{separator}digest={digest}"))
            .header("content-type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .unwrap();
        assert_eq!(finished.status().as_u16(), 201, "upload finish for {repo}");
        digest
    }

    /// Push a minimal single-layer image as `repo:tag`.
    ///
    /// The layer content includes the tag so every tag has its own digest.
    pub async fn push_image(&self, repo: &str, tag: &str) {
        let layer = format!("layer for {repo}:{tag}").into_bytes();
        let layer_digest = self.upload_blob(repo, &layer).await;

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": [layer_digest] },
        })
        .to_string()
        .into_bytes();
        let config_digest = self.upload_blob(repo, &config).await;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_V2,
            "config": { "mediaType": CONFIG_V1, "size": config.len(), "digest": config_digest },
            "layers": [{ "mediaType": LAYER, "size": layer.len(), "digest": layer_digest }],
        });
        let response = self
            .client
            .put(format!("http://{}/v2/{repo}/manifests/{tag}", self.host))
            .header("content-type", MANIFEST_V2)
            .body(manifest.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201, "manifest push for {repo}:{tag}");
    }

    /// Tags of `repo`, sorted; empty if the repository does not exist.
    pub async fn tags(&self, repo: &str) -> Vec<String> {
        let response = self
            .client
            .get(format!("http://{}/v2/{repo}/tags/list", self.host))
            .send()
            .await
            .unwrap();
        if response.status().as_u16() == 404 {
            return Vec::new();
        }
        let body: serde_json::Value = response.json().await.unwrap();
        let mut tags: Vec<String> = body["tags"]
            .as_array()
            .map(|tags| tags.iter().filter_map(|t| t.as_str().map(String::from)).collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }
}

/// Whether the skopeo binary is available on this machine.
pub fn skopeo_available() -> bool {
    std::process::Command::new("skopeo")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
