// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry HTTP API v2 tag lister.
//!
//! Lists tags with `GET /v2/<path>/tags/list`, following `Link` header
//! pagination. Authentication supports both schemes registries use in
//! practice:
//!
//! ```text
//! GET /v2/<path>/tags/list ──► 200 ─────────────────────────────► tags
//!          │
//!          └──► 401 WWW-Authenticate: Bearer realm=..,service=..,scope=..
//!                   │
//!                   └──► GET <realm>?service=..&scope=..  (basic auth)
//!                            └──► {"token": ..} ──► retry with Bearer
//! ```
//!
//! Registries using plain basic auth get the credentials on every request.
//! 401/403 after authentication map to [`SyncError::Auth`]; a missing
//! repository (404) is an empty tag list.

use crate::auth::Credentials;
use crate::config::ListerConfig;
use crate::endpoint::Endpoint;
use crate::error::{BoxFuture, Result, SyncError};
use crate::metrics;
use crate::resilience::{RateLimiter, RetryConfig};
use crate::tags::TagLister;
use regex::Regex;
use reqwest::header::{HeaderMap, LINK, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Upper bound on followed pages, guards against `Link` loops.
const MAX_PAGES: usize = 10_000;

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub(crate) fn parse(header: &str) -> Option<Self> {
        static PARAM: OnceLock<Regex> = OnceLock::new();
        let rest = header.trim().strip_prefix("Bearer ")?;
        let re = PARAM.get_or_init(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("static regex"));

        let mut params: HashMap<String, String> = re
            .captures_iter(rest)
            .map(|c| (c[1].to_ascii_lowercase(), c[2].to_string()))
            .collect();

        Some(Self {
            realm: params.remove("realm")?,
            service: params.remove("service"),
            scope: params.remove("scope"),
        })
    }
}

/// Extract the `rel="next"` target of a `Link` header.
pub(crate) fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        Some(target.to_string())
    })
}

/// Tag lister speaking the Registry HTTP API v2.
pub struct RegistryClient {
    verified: reqwest::Client,
    unverified: reqwest::Client,
    retry: RetryConfig,
    limiter: Option<Arc<RateLimiter>>,
    page_size: usize,
    /// Bearer tokens by (host, scope).
    tokens: Mutex<HashMap<(String, String), String>>,
}

impl RegistryClient {
    pub fn new(retry: RetryConfig) -> Result<Self> {
        let build = |accept_invalid: bool| {
            reqwest::Client::builder()
                .timeout(retry.request_timeout)
                .danger_accept_invalid_certs(accept_invalid)
                .user_agent(concat!("registry-mirror/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| SyncError::Internal(format!("cannot build HTTP client: {e}")))
        };
        Ok(Self {
            verified: build(false)?,
            unverified: build(true)?,
            retry,
            limiter: None,
            page_size: 100,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Build from lister configuration.
    pub fn from_config(config: &ListerConfig, retry: RetryConfig) -> Result<Self> {
        let mut client = Self::new(retry)?.with_page_size(config.page_size);
        if let Some(rate) = config.rate_limit_config() {
            client = client.with_rate_limiter(Arc::new(RateLimiter::new(rate)));
        }
        Ok(client)
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn client(&self, endpoint: &Endpoint) -> &reqwest::Client {
        if endpoint.skip_tls_verify() {
            &self.unverified
        } else {
            &self.verified
        }
    }

    #[instrument(skip(self, endpoint), fields(registry = %endpoint.registry()))]
    async fn list_all(&self, endpoint: &Endpoint, path: &str) -> Result<Vec<String>> {
        let path = path.trim_matches('/');
        let base = endpoint.api_base();
        let mut url = format!("{base}/v2/{path}/tags/list?n={}", self.page_size);
        let mut tags = Vec::new();

        for _ in 0..MAX_PAGES {
            let page = self
                .retry
                .run("list_tags", || self.fetch_page(endpoint, path, &url))
                .await?;

            let Some((page_tags, next)) = page else {
                // Repository does not exist (yet)
                return Ok(tags);
            };
            let empty = page_tags.is_empty();
            tags.extend(page_tags);

            match next {
                Some(next) if !empty => {
                    url = if next.starts_with('/') {
                        format!("{base}{next}")
                    } else {
                        next
                    };
                }
                _ => break,
            }
        }

        debug!(path, count = tags.len(), "Listed tags");
        Ok(tags)
    }

    /// One page. `None` when the repository is unknown.
    async fn fetch_page(
        &self,
        endpoint: &Endpoint,
        path: &str,
        url: &str,
    ) -> Result<Option<(Vec<String>, Option<String>)>> {
        let credentials = endpoint.credentials().await;
        let scope = format!("repository:{path}:pull");
        let cached = self.cached_token(endpoint, &scope).await;

        let mut response = self
            .send(endpoint, self.authorize(self.client(endpoint).get(url), &credentials, cached.as_deref()))
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(BearerChallenge::parse);

            if let Some(challenge) = challenge {
                let token = self.exchange_token(endpoint, &credentials, &challenge, &scope).await?;
                response = self
                    .send(endpoint, self.client(endpoint).get(url).bearer_auth(&token))
                    .await?;
            }
        }

        let status = response.status();
        match status {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.tokens
                    .lock()
                    .await
                    .remove(&(endpoint.host().to_string(), scope));
                return Err(SyncError::auth(
                    endpoint.host(),
                    format!("listing tags of {path}: {status}"),
                ));
            }
            s => {
                return Err(SyncError::registry_status(
                    endpoint.host(),
                    "list_tags",
                    s.as_u16(),
                    format!("{path}: unexpected status {s}"),
                ))
            }
        }

        let next = next_link(response.headers());
        let page: TagsPage = response
            .json()
            .await
            .map_err(|e| SyncError::registry(endpoint.host(), "list_tags", e))?;
        Ok(Some((page.tags.unwrap_or_default(), next)))
    }

    fn authorize(
        &self,
        request: RequestBuilder,
        credentials: &Credentials,
        bearer: Option<&str>,
    ) -> RequestBuilder {
        if let Some(token) = bearer {
            return request.bearer_auth(token);
        }
        match credentials {
            Credentials::RegistryToken(token) => request.bearer_auth(token),
            other => match other.basic_pair() {
                Some((user, password)) => request.basic_auth(user, Some(password)),
                None => request,
            },
        }
    }

    async fn send(&self, endpoint: &Endpoint, request: RequestBuilder) -> Result<reqwest::Response> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        let started = Instant::now();
        let result = request.send().await;
        metrics::record_registry_request(endpoint.host(), "list_tags", started.elapsed());
        result.map_err(|e| SyncError::registry(endpoint.host(), "list_tags", e))
    }

    async fn cached_token(&self, endpoint: &Endpoint, scope: &str) -> Option<String> {
        self.tokens
            .lock()
            .await
            .get(&(endpoint.host().to_string(), scope.to_string()))
            .cloned()
    }

    async fn exchange_token(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        challenge: &BearerChallenge,
        scope: &str,
    ) -> Result<String> {
        if let Credentials::RegistryToken(_) = credentials {
            // The configured token was just rejected; nothing to exchange.
            return Err(SyncError::auth(endpoint.host(), "registry token rejected"));
        }

        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service));
        }
        query.push(("scope", challenge.scope.as_deref().unwrap_or(scope)));

        let mut request = self.client(endpoint).get(&challenge.realm).query(&query);
        if let Some((user, password)) = credentials.basic_pair() {
            request = request.basic_auth(user, Some(password));
        }

        let response = self.send(endpoint, request).await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::auth(endpoint.host(), format!("token exchange: {status}")));
        }
        if !status.is_success() {
            return Err(SyncError::registry_status(
                endpoint.host(),
                "token_exchange",
                status.as_u16(),
                format!("unexpected status {status}"),
            ));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::registry(endpoint.host(), "token_exchange", e))?;
        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::auth(endpoint.host(), "token exchange returned no token"))?;

        self.tokens
            .lock()
            .await
            .insert((endpoint.host().to_string(), scope.to_string()), token.clone());
        Ok(token)
    }
}

impl TagLister for RegistryClient {
    fn list_tags<'a>(&'a self, endpoint: &'a Endpoint, path: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(self.list_all(endpoint, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use reqwest::header::HeaderValue;

    fn client() -> RegistryClient {
        RegistryClient::new(RetryConfig::testing()).unwrap().with_page_size(2)
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/busybox:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/busybox:pull")
        );

        assert!(BearerChallenge::parse(r#"Basic realm="Registry""#).is_none());
        assert!(BearerChallenge::parse(r#"Bearer service="x""#).is_none());
    }

    #[test]
    fn test_next_link() {
        let mut headers = HeaderMap::new();
        assert_eq!(next_link(&headers), None);

        headers.insert(
            LINK,
            HeaderValue::from_static(r#"</v2/lib/app/tags/list?last=1.1&n=2>; rel="next""#),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("/v2/lib/app/tags/list?last=1.1&n=2")
        );
    }

    #[tokio::test]
    async fn test_list_tags_follows_pagination() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/v2/lib/app/tags/list")
            .match_query(Matcher::Exact("n=2".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("link", r#"</v2/lib/app/tags/list?last=1.1&n=2>; rel="next""#)
            .with_body(r#"{"name":"lib/app","tags":["1.0","1.1"]}"#)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/v2/lib/app/tags/list")
            .match_query(Matcher::Exact("last=1.1&n=2".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"name":"lib/app","tags":["2.0"]}"#)
            .create_async()
            .await;

        let endpoint = Endpoint::anonymous(server.url());
        let tags = client().list_tags(&endpoint, "lib/app").await.unwrap();

        assert_eq!(tags, vec!["1.0", "1.1", "2.0"]);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_repository_is_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/mirror/app/tags/list")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"errors":[{"code":"NAME_UNKNOWN"}]}"#)
            .create_async()
            .await;

        let endpoint = Endpoint::anonymous(server.url());
        let tags = client().list_tags(&endpoint, "mirror/app").await.unwrap();
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn test_null_tags_is_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/lib/app/tags/list")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"name":"lib/app","tags":null}"#)
            .create_async()
            .await;

        let endpoint = Endpoint::anonymous(server.url());
        assert!(client().list_tags(&endpoint, "lib/app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_basic_auth_sent() {
        let mut server = mockito::Server::new_async().await;
        // "bob:secret"
        let mock = server
            .mock("GET", "/v2/lib/app/tags/list")
            .match_query(Matcher::Any)
            .match_header("authorization", "Basic Ym9iOnNlY3JldA==")
            .with_status(200)
            .with_body(r#"{"tags":["1.0"]}"#)
            .create_async()
            .await;

        let endpoint = Endpoint::new(server.url(), Credentials::basic("bob", "secret"), false);
        let tags = client().list_tags(&endpoint, "lib/app").await.unwrap();
        assert_eq!(tags, vec!["1.0"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bearer_challenge_flow() {
        let mut server = mockito::Server::new_async().await;
        let realm = format!("{}/token", server.url());

        let challenge = server
            .mock("GET", "/v2/lib/app/tags/list")
            .match_query(Matcher::Any)
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header(
                "www-authenticate",
                &format!(r#"Bearer realm="{realm}",service="test-registry",scope="repository:lib/app:pull""#),
            )
            .create_async()
            .await;
        let token = server
            .mock("GET", "/token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("service".into(), "test-registry".into()),
                Matcher::UrlEncoded("scope".into(), "repository:lib/app:pull".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"token":"abc123"}"#)
            .create_async()
            .await;
        let listing = server
            .mock("GET", "/v2/lib/app/tags/list")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer abc123")
            .with_status(200)
            .with_body(r#"{"tags":["1.0","2.0"]}"#)
            .create_async()
            .await;

        let endpoint = Endpoint::anonymous(server.url());
        let tags = client().list_tags(&endpoint, "lib/app").await.unwrap();

        assert_eq!(tags, vec!["1.0", "2.0"]);
        challenge.assert_async().await;
        token.assert_async().await;
        listing.assert_async().await;
    }

    #[tokio::test]
    async fn test_forbidden_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/lib/app/tags/list")
            .match_query(Matcher::Any)
            .with_status(403)
            .create_async()
            .await;

        let endpoint = Endpoint::anonymous(server.url());
        let err = client().list_tags(&endpoint, "lib/app").await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_server_error_is_retried_then_registry_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/lib/app/tags/list")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let endpoint = Endpoint::anonymous(server.url());
        let err = client().list_tags(&endpoint, "lib/app").await.unwrap_err();
        assert_eq!(err.kind(), "registry");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/lib/app/tags/list")
            .match_query(Matcher::Any)
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let endpoint = Endpoint::anonymous(server.url());
        let err = client().list_tags(&endpoint, "lib/app").await.unwrap_err();
        assert!(!err.is_retryable());
        mock.assert_async().await;
    }
}
