// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag enumeration and filtering.
//!
//! [`TagLister`] enumerates the tags of an image at an endpoint (Registry API
//! or the skopeo tool), [`TagFilter`] narrows that list to the working set of
//! a mapping. Filtering is a pure function: the result is always a
//! duplicate-free subsequence of the input, in input order.

use crate::config::TagsSpec;
use crate::endpoint::Endpoint;
use crate::error::{BoxFuture, Result, SyncError};
use crate::metrics;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const REGEX_PREFIX: &str = "regex:";
const NOT_REGEX_PREFIX: &str = "!regex:";

/// Compiled tag selection rule of a mapping.
#[derive(Debug, Clone)]
pub enum TagFilter {
    /// Every tag.
    All,
    /// Exactly these tags, where present at the source.
    Literal(HashSet<String>),
    /// Tags matching at least one include (or any, if there are none) and no
    /// exclude pattern.
    Pattern { include: Vec<Regex>, exclude: Vec<Regex> },
}

impl TagFilter {
    /// Compile the configured tag selection.
    pub fn from_spec(spec: Option<&TagsSpec>) -> Result<Self> {
        match spec {
            None => Ok(Self::All),
            Some(TagsSpec::Keyword(word)) if word.trim() == "all" => Ok(Self::All),
            Some(TagsSpec::Keyword(word)) => Self::from_list(std::slice::from_ref(word)),
            Some(TagsSpec::List(items)) => Self::from_list(items),
            Some(TagsSpec::Rules { include, exclude }) => Ok(Self::Pattern {
                include: compile_all(include)?,
                exclude: compile_all(exclude)?,
            }),
        }
    }

    fn from_list(items: &[String]) -> Result<Self> {
        if items.is_empty() {
            return Ok(Self::All);
        }

        let mut literals = Vec::new();
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for item in items {
            let item = item.trim();
            if let Some(pattern) = item.strip_prefix(NOT_REGEX_PREFIX) {
                exclude.push(compile(pattern.trim())?);
            } else if let Some(pattern) = item.strip_prefix(REGEX_PREFIX) {
                include.push(compile(pattern.trim())?);
            } else if !item.is_empty() {
                literals.push(item.to_string());
            }
        }

        if include.is_empty() && exclude.is_empty() {
            return Ok(Self::Literal(literals.into_iter().collect()));
        }
        // Literals mixed with patterns become anchored patterns.
        for literal in literals {
            include.push(compile(&format!("^{}$", regex::escape(&literal)))?);
        }
        Ok(Self::Pattern { include, exclude })
    }

    /// Literal filter from a list of tags.
    pub fn literal<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Literal(tags.into_iter().map(Into::into).collect())
    }

    /// Whether a single tag is selected.
    pub fn matches(&self, tag: &str) -> bool {
        match self {
            Self::All => true,
            Self::Literal(set) => set.contains(tag),
            Self::Pattern { include, exclude } => {
                (include.is_empty() || include.iter().any(|re| re.is_match(tag)))
                    && !exclude.iter().any(|re| re.is_match(tag))
            }
        }
    }

    /// Select tags, deduplicated, in the order of `tags`.
    pub fn apply(&self, tags: &[String]) -> Vec<String> {
        let mut seen = HashSet::with_capacity(tags.len());
        tags.iter()
            .filter(|tag| self.matches(tag))
            .filter(|tag| seen.insert(tag.as_str()))
            .cloned()
            .collect()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| SyncError::Config(format!("invalid tag pattern '{pattern}': {e}")))
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile(p.trim())).collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Listing
// ═══════════════════════════════════════════════════════════════════════════════

/// Enumerates the tags of an image at an endpoint.
///
/// Implementations report authentication failures as
/// [`SyncError::Auth`] and everything else as [`SyncError::Registry`].
/// A repository that does not exist yields an empty list.
pub trait TagLister: Send + Sync + 'static {
    /// Full tag list of `path`, in registry order.
    fn list_tags<'a>(&'a self, endpoint: &'a Endpoint, path: &'a str) -> BoxFuture<'a, Vec<String>>;

    /// Forget anything remembered about `path` (called after it was written to).
    fn invalidate<'a>(&'a self, _endpoint: &'a Endpoint, _path: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Wraps a lister with a TTL cache and a per-image item limit.
pub struct CachedLister {
    inner: Arc<dyn TagLister>,
    ttl: Duration,
    max_items: usize,
    cache: Mutex<HashMap<(String, String), (Instant, Vec<String>)>>,
}

impl CachedLister {
    /// `ttl` of zero disables caching, `max_items` of zero means unlimited.
    pub fn new(inner: Arc<dyn TagLister>, ttl: Duration, max_items: usize) -> Self {
        Self {
            inner,
            ttl,
            max_items,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(endpoint: &Endpoint, path: &str) -> (String, String) {
        (endpoint.host().to_string(), path.trim_matches('/').to_string())
    }
}

impl TagLister for CachedLister {
    fn list_tags<'a>(&'a self, endpoint: &'a Endpoint, path: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let key = Self::key(endpoint, path);
            if !self.ttl.is_zero() {
                let cache = self.cache.lock().await;
                if let Some((at, tags)) = cache.get(&key) {
                    if at.elapsed() < self.ttl {
                        metrics::record_tag_cache_hit(endpoint.registry());
                        debug!(registry = %endpoint.registry(), path, "Tag list served from cache");
                        return Ok(tags.clone());
                    }
                }
            }

            let mut tags = self.inner.list_tags(endpoint, path).await?;
            if self.max_items > 0 && tags.len() > self.max_items {
                tags.truncate(self.max_items);
            }

            if !self.ttl.is_zero() {
                self.cache
                    .lock()
                    .await
                    .insert(key, (Instant::now(), tags.clone()));
            }
            Ok(tags)
        })
    }

    fn invalidate<'a>(&'a self, endpoint: &'a Endpoint, path: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.cache.lock().await.remove(&Self::key(endpoint, path));
            self.inner.invalidate(endpoint, path).await
        })
    }
}
