//! Corpus sources.
//!
//! A source yields a [`MessagesBundle`]: every raw message it knows about plus
//! the upstream total. Two implementations ship:
//!
//! - [`FileSource`] reads a JSON file, either a bare array of messages or a
//!   page object `{"total": N, "items": [...]}`.
//! - [`HttpSource`] pages through a remote messages endpoint, using the
//!   cached bundle's `ETag` for a conditional first request.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::config::{Config, SourceConfig};
use crate::http::{build_client, send_with_retry, RetryPolicy};
use crate::models::{MessagesBundle, RawMessage};
use crate::repository::RawMessageCache;

/// Upper bound on pages followed in one fetch.
const MAX_PAGES: usize = 10_000;

#[async_trait]
pub trait CorpusSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the full message set. `force_refresh` bypasses conditional
    /// requests and local caches.
    async fn fetch(&self, force_refresh: bool) -> Result<MessagesBundle>;
}

/// One page of the upstream messages API.
#[derive(Debug, Deserialize)]
struct MessagesPage {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    items: Vec<RawMessage>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    page_size: Option<usize>,
    #[serde(default)]
    next_page: Option<usize>,
    #[serde(default)]
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FilePayload {
    Messages(Vec<RawMessage>),
    Page(MessagesPage),
}

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CorpusSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch(&self, _force_refresh: bool) -> Result<MessagesBundle> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read messages file: {}", self.path.display()))?;
        let payload: FilePayload = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse messages file: {}", self.path.display()))?;

        let (messages, total) = match payload {
            FilePayload::Messages(messages) => {
                let total = messages.len();
                (messages, total)
            }
            FilePayload::Page(page) => {
                let total = if page.total == 0 {
                    page.items.len()
                } else {
                    page.total
                };
                (page.items, total)
            }
        };

        tracing::info!(path = %self.path.display(), count = messages.len(), "messages.loaded");
        Ok(MessagesBundle {
            total,
            messages,
            etag: None,
            fetched_at: Utc::now(),
        })
    }
}

pub struct HttpSource {
    url: String,
    page_size: usize,
    timeout_secs: u64,
    policy: RetryPolicy,
    cache: RawMessageCache,
}

impl HttpSource {
    pub fn new(source: &SourceConfig, cache: RawMessageCache) -> Result<Self> {
        let url = source
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("source.url required for http source"))?;
        Ok(Self {
            url,
            page_size: source.page_size.max(1),
            timeout_secs: source.timeout_secs,
            policy: RetryPolicy::upstream(source.max_retries),
            cache,
        })
    }

    /// Page to request after `page`, which answered the request for page
    /// `requested`. Hints that do not move forward are dropped.
    fn next_page_hint(
        &self,
        page: &MessagesPage,
        requested: usize,
        items_len: usize,
    ) -> Option<usize> {
        let hint = match page.next_page {
            Some(next) => Some(next),
            None => {
                let current = page.page.unwrap_or(requested);
                let size = page.page_size.filter(|s| *s > 0).unwrap_or(self.page_size);
                (items_len >= size).then_some(current + 1)
            }
        };
        match hint {
            Some(next) if next <= requested => {
                tracing::warn!(requested, next, "messages.page_hint_ignored");
                None
            }
            other => other,
        }
    }
}

#[async_trait]
impl CorpusSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, force_refresh: bool) -> Result<MessagesBundle> {
        let cached = self.cache.load();
        let etag = match (&cached, force_refresh) {
            (Some(bundle), false) => {
                tracing::info!(count = bundle.messages.len(), etag = ?bundle.etag, "messages.cached");
                bundle.etag.clone()
            }
            _ => None,
        };

        let client = build_client(self.timeout_secs)?;
        let first_params = [("page", 1), ("page_size", self.page_size)];
        let response = send_with_retry("messages API", self.policy, || {
            let req = client.get(&self.url).query(&first_params);
            match &etag {
                Some(tag) => req.header(reqwest::header::IF_NONE_MATCH, tag),
                None => req,
            }
        })
        .await?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            if let Some(bundle) = cached {
                tracing::info!(etag = ?bundle.etag, "messages.not_modified");
                return Ok(bundle);
            }
            bail!("messages API returned 304 without a cached bundle");
        }

        let new_etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let first: MessagesPage = response
            .json()
            .await
            .context("Failed to decode messages page")?;

        let mut total = if first.total == 0 {
            first.items.len()
        } else {
            first.total
        };
        let mut requested = 1;
        let mut next_page = self.next_page_hint(&first, requested, first.items.len());
        let mut next_url = first.next_url.clone();
        let mut seen_urls = HashSet::new();
        let mut messages = first.items;

        for _ in 0..MAX_PAGES {
            let response = if let Some(url) = next_url.take() {
                if !seen_urls.insert(url.clone()) {
                    tracing::warn!(url = %url, "messages.next_url_repeated");
                    break;
                }
                requested += 1;
                send_with_retry("messages API", self.policy, || client.get(&url)).await?
            } else if let Some(page) = next_page.take() {
                requested = page;
                let params = [("page", page), ("page_size", self.page_size)];
                send_with_retry("messages API", self.policy, || {
                    client.get(&self.url).query(&params)
                })
                .await?
            } else {
                break;
            };

            let page: MessagesPage = response
                .json()
                .await
                .context("Failed to decode messages page")?;
            if page.items.is_empty() {
                break;
            }
            if page.total > 0 {
                total = page.total;
            }
            next_page = self.next_page_hint(&page, requested, page.items.len());
            next_url = page.next_url.clone();
            messages.extend(page.items);
        }

        tracing::info!(count = messages.len(), total, "messages.fetched");
        let bundle = MessagesBundle {
            total,
            messages,
            etag: new_etag,
            fetched_at: Utc::now(),
        };
        self.cache.save(&bundle)?;
        Ok(bundle)
    }
}

/// Create the configured [`CorpusSource`].
pub fn create_source(config: &Config) -> Result<Box<dyn CorpusSource>> {
    match config.source.kind.as_str() {
        "file" => {
            let path = config
                .source
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("source.path required for file source"))?;
            Ok(Box::new(FileSource::new(path)))
        }
        "http" => Ok(Box::new(HttpSource::new(
            &config.source,
            RawMessageCache::new(&config.storage),
        )?)),
        other => bail!("Unknown source kind: {}", other),
    }
}

/// Fetch messages from the configured source and print a summary.
pub async fn run_fetch(config: &Config, force: bool) -> Result<()> {
    let source = create_source(config)?;
    let bundle = source.fetch(force).await?;
    println!(
        "Fetched {} messages from {} source (upstream total {})",
        bundle.messages.len(),
        source.name(),
        bundle.total
    );
    if let Some(etag) = &bundle.etag {
        println!("  etag: {}", etag);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use axum::extract::Query;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn http_source(tmp: &TempDir, url: &str, page_size: usize, max_retries: u32) -> HttpSource {
        let source = SourceConfig {
            kind: "http".to_string(),
            url: Some(url.to_string()),
            page_size,
            max_retries,
            ..SourceConfig::default()
        };
        let storage = StorageConfig {
            data_dir: tmp.path().to_path_buf(),
            index_dir: tmp.path().join("vectorstore"),
            reports_dir: tmp.path().join("reports"),
        };
        HttpSource::new(&source, RawMessageCache::new(&storage)).unwrap()
    }

    /// Serve the router built from the server's base URL; returns that URL.
    async fn serve(build: impl FnOnce(String) -> Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = build(base.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    fn message(id: &str) -> Value {
        json!({
            "id": id,
            "user_id": "u",
            "user_name": "N",
            "timestamp": "2024-01-01T00:00:00Z",
            "message": format!("hello {}", id),
        })
    }

    fn ids(bundle: &MessagesBundle) -> Vec<&str> {
        bundle.messages.iter().map(|m| m.id.as_str()).collect()
    }

    fn page(json: &str) -> MessagesPage {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_file_source_array() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("messages.json");
        std::fs::write(
            &path,
            r#"[{"id":"a","user_id":"u","user_name":"N","timestamp":"2024-01-01T00:00:00Z","message":"hi"}]"#,
        )
        .unwrap();
        let bundle = FileSource::new(path).fetch(false).await.unwrap();
        assert_eq!(bundle.messages.len(), 1);
        assert_eq!(bundle.total, 1);
    }

    #[tokio::test]
    async fn test_file_source_page_object() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("messages.json");
        std::fs::write(
            &path,
            r#"{"total": 42, "items": [{"id":"a","user_id":"u","user_name":"N","timestamp":"2024-01-01T00:00:00","message":"hi"}]}"#,
        )
        .unwrap();
        let bundle = FileSource::new(path).fetch(false).await.unwrap();
        assert_eq!(bundle.messages.len(), 1);
        assert_eq!(bundle.total, 42);
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        let err = FileSource::new(PathBuf::from("/nonexistent/messages.json"))
            .fetch(false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read messages file"));
    }

    #[test]
    fn test_next_page_hint() {
        let tmp = TempDir::new().unwrap();
        let source = http_source(&tmp, "http://localhost:1/messages", 2, 0);

        let explicit = page(r#"{"total": 10, "items": [], "next_page": 7}"#);
        assert_eq!(source.next_page_hint(&explicit, 1, 0), Some(7));

        let full = page(r#"{"total": 10, "items": [], "page": 3, "page_size": 2}"#);
        assert_eq!(source.next_page_hint(&full, 3, 2), Some(4));

        let short = page(r#"{"total": 10, "items": [], "page": 3, "page_size": 2}"#);
        assert_eq!(source.next_page_hint(&short, 3, 1), None);

        // Without a `page` field the requested page number is used.
        let unpaged = page(r#"{"total": 10, "items": []}"#);
        assert_eq!(source.next_page_hint(&unpaged, 1, 2), Some(2));
        assert_eq!(source.next_page_hint(&unpaged, 2, 2), Some(3));
        assert_eq!(source.next_page_hint(&unpaged, 2, 1), None);

        let stale = page(r#"{"total": 10, "items": [], "next_page": 2}"#);
        assert_eq!(source.next_page_hint(&stale, 2, 2), None);
    }

    #[tokio::test]
    async fn test_unpaged_responses_advance_page_numbers() {
        let pages = Arc::new(Mutex::new(Vec::new()));
        let log = pages.clone();
        let base = serve(move |_| {
            Router::new().route(
                "/messages",
                get(move |Query(query): Query<HashMap<String, String>>| {
                    let log = log.clone();
                    async move {
                        let page: usize = query
                            .get("page")
                            .and_then(|p| p.parse().ok())
                            .unwrap_or(1);
                        log.lock().unwrap().push(page);
                        let items = match page {
                            1 => vec![message("a"), message("b")],
                            2 => vec![message("c"), message("d")],
                            _ => Vec::new(),
                        };
                        Json(json!({"total": 4, "items": items}))
                    }
                }),
            )
        })
        .await;

        let tmp = TempDir::new().unwrap();
        let source = http_source(&tmp, &format!("{}/messages", base), 2, 0);
        let bundle = source.fetch(true).await.unwrap();

        assert_eq!(ids(&bundle), vec!["a", "b", "c", "d"]);
        assert_eq!(bundle.total, 4);
        assert_eq!(*pages.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_etag_not_modified_reuses_cache() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let base = serve(move |_| {
            Router::new().route(
                "/messages",
                get(move |headers: HeaderMap| {
                    let log = log.clone();
                    async move {
                        let tag = headers
                            .get(header::IF_NONE_MATCH)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        log.lock().unwrap().push(tag.clone());
                        if tag.as_deref() == Some("\"v1\"") {
                            return StatusCode::NOT_MODIFIED.into_response();
                        }
                        (
                            [(header::ETAG, "\"v1\"")],
                            Json(json!({"total": 1, "items": [message("a")]})),
                        )
                            .into_response()
                    }
                }),
            )
        })
        .await;

        let tmp = TempDir::new().unwrap();
        let source = http_source(&tmp, &format!("{}/messages", base), 10, 0);

        let first = source.fetch(false).await.unwrap();
        assert_eq!(first.etag.as_deref(), Some("\"v1\""));

        let second = source.fetch(false).await.unwrap();
        assert_eq!(ids(&second), vec!["a"]);
        assert_eq!(second.etag.as_deref(), Some("\"v1\""));
        assert_eq!(second.fetched_at, first.fetched_at);

        // A forced refresh skips the conditional header.
        source.fetch(true).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, Some("\"v1\"".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_next_url_followed_before_next_page() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let first_log = requests.clone();
        let more_log = requests.clone();
        let base = serve(move |base| {
            Router::new()
                .route(
                    "/messages",
                    get(move |Query(query): Query<HashMap<String, String>>| {
                        let log = first_log.clone();
                        let base = base.clone();
                        async move {
                            let page = query.get("page").cloned().unwrap_or_default();
                            log.lock().unwrap().push(format!("page={}", page));
                            Json(json!({
                                "total": 2,
                                "items": [message("a")],
                                "next_page": 99,
                                "next_url": format!("{}/more", base),
                            }))
                        }
                    }),
                )
                .route(
                    "/more",
                    get(move || {
                        let log = more_log.clone();
                        async move {
                            log.lock().unwrap().push("more".to_string());
                            Json(json!({"total": 2, "items": [message("b")]}))
                        }
                    }),
                )
        })
        .await;

        let tmp = TempDir::new().unwrap();
        let source = http_source(&tmp, &format!("{}/messages", base), 10, 0);
        let bundle = source.fetch(true).await.unwrap();

        assert_eq!(ids(&bundle), vec!["a", "b"]);
        assert_eq!(*requests.lock().unwrap(), vec!["page=1", "more"]);
    }

    #[tokio::test]
    async fn test_client_errors_fail_fast() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let base = serve(move |_| {
            Router::new().route(
                "/messages",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        StatusCode::NOT_FOUND
                    }
                }),
            )
        })
        .await;

        let tmp = TempDir::new().unwrap();
        let source = http_source(&tmp, &format!("{}/messages", base), 10, 3);
        let err = source.fetch(true).await.unwrap_err();

        assert!(err.to_string().contains("404"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let base = serve(move |_| {
            Router::new().route(
                "/messages",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            return StatusCode::SERVICE_UNAVAILABLE.into_response();
                        }
                        Json(json!({"total": 1, "items": [message("a")]})).into_response()
                    }
                }),
            )
        })
        .await;

        let tmp = TempDir::new().unwrap();
        let source = http_source(&tmp, &format!("{}/messages", base), 10, 1);
        let bundle = source.fetch(true).await.unwrap();

        assert_eq!(ids(&bundle), vec!["a"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_create_source_requires_path() {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());
        assert!(create_source(&config).is_err());
    }
}
