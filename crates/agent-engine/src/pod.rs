//! The pod: the remote tag-indexed blob store that is both configuration
//! source and coordination substrate.
//!
//! [`PodClient`] is the HTTP binding (reads via the tag query API, writes via
//! the probe ingest route). [`PodFetcher`] layers the single-digest cache and
//! the lookback filter on top of any [`DigestStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use kash_agent_core::endpoint::EndpointConfig;

/// Maximum pages walked per tag query.
const MAX_PAGES: usize = 10;

/// Errors callers branch on when talking to the pod.
#[derive(Debug, thiserror::Error)]
pub enum PodError {
    /// The digest id was not present in the search-tag result set.
    #[error("digest {digest_id} not found in tags: {search_tags}")]
    DigestNotFound {
        /// Digest id that was looked up.
        digest_id: String,
        /// Tag set that was searched.
        search_tags: String,
    },
}

/// A tag attached to a digest. The pod serves both bare strings and
/// `{ "name": ... }` records; `name()` normalizes the two.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Tag {
    /// Bare tag name.
    Name(String),
    /// Record form.
    Record {
        /// The tag name.
        name: String,
    },
}

impl Tag {
    /// The normalized tag name.
    pub fn name(&self) -> &str {
        match self {
            Tag::Name(name) => name,
            Tag::Record { name } => name,
        }
    }
}

impl From<&str> for Tag {
    fn from(name: &str) -> Self {
        Tag::Name(name.to_string())
    }
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

/// One addressable blob in the pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Digest {
    /// Stable identifier; the pod serves it as a number or a string.
    #[serde(deserialize_with = "de_id")]
    pub id: String,

    /// UTF-8 content body.
    #[serde(default)]
    pub content: String,

    /// Ordered tag set, the only query key.
    #[serde(default)]
    pub tags: Vec<Tag>,

    /// Creation timestamp as served (ISO-8601), when present.
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Digest {
    /// Normalized tag names, in order.
    pub fn tag_names(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.name().to_string()).collect()
    }

    /// Whether the digest was created within the last `secs` seconds.
    ///
    /// Missing or unparseable timestamps pass the filter: the queue treats
    /// such digests as recent rather than dropping work on the floor.
    pub fn created_within(&self, secs: u64) -> bool {
        let Some(raw) = self.created_at.as_deref() else {
            return true;
        };
        match parse_timestamp(raw) {
            Some(created) => {
                let cutoff = Utc::now() - chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64);
                created >= cutoff
            }
            None => true,
        }
    }

    /// Seconds since creation, or infinity when the timestamp is missing or
    /// unparseable (treat as stale).
    pub fn age_secs(&self) -> f64 {
        let Some(raw) = self.created_at.as_deref() else {
            return f64::INFINITY;
        };
        match parse_timestamp(raw) {
            Some(created) => (Utc::now() - created).num_milliseconds().max(0) as f64 / 1_000.0,
            None => f64::INFINITY,
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive timestamps are served by some pod nodes; read them as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// A blob to publish to the pod ingest route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPost {
    /// UTF-8 payload; base64-wrapped on the wire.
    pub content: String,
    /// Comma-separated tag list.
    pub tags: String,
    /// Filename for the ingest envelope; defaults to
    /// `agent_output_{timestamp}.txt`.
    pub filename: Option<String>,
    /// Free-text context forwarded alongside the payload.
    pub context_prompt: Option<String>,
}

/// Read/write access to a tag-indexed digest store.
///
/// The engine is written against this seam so tests can run the whole
/// claim/execute/publish protocol against an in-memory fake.
#[async_trait]
pub trait DigestStore: Send + Sync {
    /// All digests matching the comma-separated tag set, walking up to
    /// `max_pages` pages. Fails soft: page errors return what was collected.
    async fn fetch_by_tags(&self, tags: &str, max_pages: usize) -> anyhow::Result<Vec<Digest>>;

    /// Publishes one digest.
    async fn post_digest(&self, post: DigestPost) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    feedentries: Vec<Digest>,
    #[serde(default)]
    pages: usize,
}

/// HTTP binding to a configured pod endpoint.
pub struct PodClient {
    http: reqwest::Client,
    pod_url: String,
    pod_key: String,
    node_name: String,
    probe_id: String,
    probe_key: String,
    device: String,
}

impl PodClient {
    /// Builds a client from the endpoint's pod fields.
    pub fn new(endpoint: &EndpointConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            pod_url: endpoint.pod_url.trim_end_matches('/').to_string(),
            pod_key: endpoint.pod_key.clone(),
            node_name: endpoint.node_name.clone(),
            probe_id: endpoint.probe_id.clone(),
            probe_key: endpoint.probe_key.clone(),
            device: endpoint.device.clone(),
        })
    }

    async fn fetch_page(&self, tags: &str, page: usize) -> anyhow::Result<FeedPage> {
        let res = self
            .http
            .get(format!("{}/api/pods/digests", self.pod_url))
            .query(&[
                ("tags", tags.to_string()),
                ("page", page.to_string()),
                ("per_page", "100".to_string()),
            ])
            .header("X-POD-KEY", &self.pod_key)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {status}: {body}");
        }
        Ok(res.json().await?)
    }
}

#[async_trait]
impl DigestStore for PodClient {
    async fn fetch_by_tags(&self, tags: &str, max_pages: usize) -> anyhow::Result<Vec<Digest>> {
        let mut all = Vec::new();
        let mut page = 1usize;

        while page <= max_pages {
            let data = match self.fetch_page(tags, page).await {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(tags, page, "pod page fetch failed: {err:#}");
                    break;
                }
            };
            let fetched = data.feedentries.len();
            all.extend(data.feedentries);
            if page >= data.pages.max(1) || fetched == 0 {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn post_digest(&self, post: DigestPost) -> anyhow::Result<()> {
        let url = format!(
            "https://probes-{}.xyzpulseinfra.com/api/probes/{}/run",
            self.node_name, self.probe_id
        );
        let filename = post.filename.unwrap_or_else(|| {
            format!("agent_output_{}.txt", Utc::now().format("%Y%m%dT%H%M%S"))
        });
        let body = serde_json::json!({
            "file": {
                "content": B64.encode(post.content.as_bytes()),
                "filename": filename,
                "content_type": "text/plain",
            },
            "tags": post.tags,
            "device": self.device,
            "context_prompt": post.context_prompt.unwrap_or_default(),
        });

        let res = self
            .http
            .post(url)
            .header("X-PROBE-KEY", &self.probe_key)
            .json(&body)
            .timeout(Duration::from_secs(15))
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {status}: {body}");
        }
        Ok(())
    }
}

struct CacheSlot {
    content: String,
    fetched_at: Instant,
}

/// Cached read path over a [`DigestStore`], plus the publish passthrough.
pub(crate) struct PodFetcher {
    store: Arc<dyn DigestStore>,
    cache: Mutex<HashMap<String, CacheSlot>>,
}

impl PodFetcher {
    pub(crate) fn new(store: Arc<dyn DigestStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn fetch_by_tags(&self, tags: &str) -> anyhow::Result<Vec<Digest>> {
        self.store.fetch_by_tags(tags, MAX_PAGES).await
    }

    /// Looks up one digest's content by id inside a search-tag result set.
    ///
    /// `cache_minutes` follows the endpoint TTL convention: `0` never caches,
    /// `-1` caches until [`clear_cache`](Self::clear_cache), any positive
    /// value is minutes.
    pub(crate) async fn fetch_by_id(
        &self,
        digest_id: &str,
        search_tags: &str,
        use_cache: bool,
        cache_minutes: i64,
    ) -> anyhow::Result<String> {
        if use_cache && cache_minutes != 0 {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = cache.get(digest_id) {
                let age_minutes = slot.fetched_at.elapsed().as_secs_f64() / 60.0;
                if cache_minutes == -1 || age_minutes < cache_minutes as f64 {
                    tracing::debug!(digest_id, age_minutes, "using cached digest content");
                    return Ok(slot.content.clone());
                }
            }
        }

        let digests = self.fetch_by_tags(search_tags).await?;
        for entry in digests {
            if entry.id == digest_id {
                if cache_minutes != 0 {
                    let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                    cache.insert(
                        digest_id.to_string(),
                        CacheSlot {
                            content: entry.content.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                }
                return Ok(entry.content);
            }
        }

        Err(PodError::DigestNotFound {
            digest_id: digest_id.to_string(),
            search_tags: search_tags.to_string(),
        }
        .into())
    }

    /// `fetch_by_tags` restricted to digests created in the last
    /// `lookback_secs` seconds (fail-open on missing timestamps).
    pub(crate) async fn fetch_with_lookback(
        &self,
        tags: &str,
        lookback_secs: u64,
    ) -> anyhow::Result<Vec<Digest>> {
        let mut digests = self.fetch_by_tags(tags).await?;
        digests.retain(|d| d.created_within(lookback_secs));
        Ok(digests)
    }

    pub(crate) async fn post(&self, post: DigestPost) -> anyhow::Result<()> {
        self.store.post_digest(post).await
    }

    pub(crate) fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStore;

    #[test]
    fn tags_normalize_both_wire_shapes() {
        let digest: Digest = serde_json::from_str(
            r#"{"id": 42, "content": "x", "tags": ["plain", {"name": "record"}]}"#,
        )
        .unwrap();
        assert_eq!(digest.id, "42");
        assert_eq!(digest.tag_names(), vec!["plain", "record"]);
    }

    #[test]
    fn digest_id_accepts_strings() {
        let digest: Digest = serde_json::from_str(r#"{"id": "abc-7"}"#).unwrap();
        assert_eq!(digest.id, "abc-7");
        assert!(digest.content.is_empty());
    }

    #[test]
    fn missing_timestamp_passes_lookback_and_reads_as_stale() {
        let digest: Digest = serde_json::from_str(r#"{"id": 1}"#).unwrap();
        assert!(digest.created_within(1));
        assert!(digest.age_secs().is_infinite());
    }

    #[test]
    fn unparseable_timestamp_passes_lookback() {
        let digest: Digest =
            serde_json::from_str(r#"{"id": 1, "created_at": "soonish"}"#).unwrap();
        assert!(digest.created_within(1));
        assert!(digest.age_secs().is_infinite());
    }

    #[test]
    fn lookback_window_is_applied_to_parseable_timestamps() {
        let recent = Digest {
            id: "1".into(),
            content: String::new(),
            tags: Vec::new(),
            created_at: Some((Utc::now() - chrono::Duration::seconds(30)).to_rfc3339()),
        };
        let old = Digest {
            created_at: Some((Utc::now() - chrono::Duration::seconds(600)).to_rfc3339()),
            ..recent.clone()
        };
        assert!(recent.created_within(120));
        assert!(!old.created_within(120));
        assert!(old.age_secs() > 500.0);
    }

    #[test]
    fn naive_timestamps_parse_as_utc() {
        let digest: Digest =
            serde_json::from_str(r#"{"id": 1, "created_at": "2099-01-01T00:00:00.500"}"#).unwrap();
        assert!(digest.created_within(60));
    }

    #[tokio::test]
    async fn cache_zero_always_hits_the_network() {
        let store = MemoryStore::new();
        store.seed("9", "body", &["agent-config"], 0);
        let fetcher = PodFetcher::new(store.clone());

        for _ in 0..3 {
            let content = fetcher.fetch_by_id("9", "agent-config", true, 0).await.unwrap();
            assert_eq!(content, "body");
        }
        assert_eq!(store.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn cache_forever_stops_fetching_until_cleared() {
        let store = MemoryStore::new();
        store.seed("9", "body", &["agent-config"], 0);
        let fetcher = PodFetcher::new(store.clone());

        for _ in 0..3 {
            fetcher.fetch_by_id("9", "agent-config", true, -1).await.unwrap();
        }
        assert_eq!(store.fetch_calls(), 1);

        fetcher.clear_cache();
        fetcher.fetch_by_id("9", "agent-config", true, -1).await.unwrap();
        assert_eq!(store.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn positive_ttl_serves_from_cache_within_the_window() {
        let store = MemoryStore::new();
        store.seed("9", "body", &["agent-config"], 0);
        let fetcher = PodFetcher::new(store.clone());

        fetcher.fetch_by_id("9", "agent-config", true, 10).await.unwrap();
        fetcher.fetch_by_id("9", "agent-config", true, 10).await.unwrap();
        assert_eq!(store.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn script_lookups_never_cache() {
        let store = MemoryStore::new();
        store.seed("9", "body", &["agent-config"], 0);
        let fetcher = PodFetcher::new(store.clone());

        fetcher.fetch_by_id("9", "agent-config", false, 0).await.unwrap();
        fetcher.fetch_by_id("9", "agent-config", false, 0).await.unwrap();
        assert_eq!(store.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn lookup_miss_is_a_typed_error() {
        let store = MemoryStore::new();
        store.seed("9", "body", &["agent-config"], 0);
        let fetcher = PodFetcher::new(store);

        let err = fetcher
            .fetch_by_id("404", "agent-config", false, 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PodError>(),
            Some(PodError::DigestNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn lookback_filters_old_entries_but_keeps_undated_ones() {
        let store = MemoryStore::new();
        store.seed("1", "fresh", &["q"], 10);
        store.seed("2", "old", &["q"], 7_200);
        store.seed_undated("3", "undated", &["q"]);
        let fetcher = PodFetcher::new(store);

        let mut ids: Vec<String> = fetcher
            .fetch_with_lookback("q", 120)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "3"]);
    }
}
