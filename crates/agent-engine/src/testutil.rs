//! In-memory digest store used by the engine tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::config::parse_tags;
use crate::pod::{Digest, DigestPost, DigestStore, Tag};

/// Tag-indexed store backed by a `Vec`. Published digests become fetchable
/// immediately, so the cross-agent coordination paths can be exercised
/// in-process.
pub(crate) struct MemoryStore {
    digests: Mutex<Vec<Digest>>,
    posts: Mutex<Vec<DigestPost>>,
    next_id: AtomicU64,
    fetch_calls: AtomicU64,
}

impl MemoryStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            digests: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1_000),
            fetch_calls: AtomicU64::new(0),
        })
    }

    /// Seeds a digest created `age_secs` ago.
    pub(crate) fn seed(&self, id: &str, content: &str, tags: &[&str], age_secs: i64) {
        let created_at = (Utc::now() - chrono::Duration::seconds(age_secs)).to_rfc3339();
        self.insert(id, content, tags, Some(created_at));
    }

    /// Seeds a digest with no creation timestamp.
    pub(crate) fn seed_undated(&self, id: &str, content: &str, tags: &[&str]) {
        self.insert(id, content, tags, None);
    }

    fn insert(&self, id: &str, content: &str, tags: &[&str], created_at: Option<String>) {
        let digest = Digest {
            id: id.to_string(),
            content: content.to_string(),
            tags: tags.iter().copied().map(Tag::from).collect(),
            created_at,
        };
        self.digests.lock().unwrap().push(digest);
    }

    /// Rewrites the content of a seeded digest in place.
    pub(crate) fn set_content(&self, id: &str, content: &str) {
        let mut digests = self.digests.lock().unwrap();
        for digest in digests.iter_mut() {
            if digest.id == id {
                digest.content = content.to_string();
            }
        }
    }

    /// Everything published through `post_digest`, in order.
    pub(crate) fn posts(&self) -> Vec<DigestPost> {
        self.posts.lock().unwrap().clone()
    }

    /// Published digests whose tag list contains `tag`.
    pub(crate) fn posts_tagged(&self, tag: &str) -> Vec<DigestPost> {
        self.posts()
            .into_iter()
            .filter(|p| parse_tags(&p.tags).iter().any(|t| t == tag))
            .collect()
    }

    pub(crate) fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DigestStore for MemoryStore {
    async fn fetch_by_tags(&self, tags: &str, _max_pages: usize) -> anyhow::Result<Vec<Digest>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let wanted = parse_tags(tags);
        let digests = self.digests.lock().unwrap();
        Ok(digests
            .iter()
            .filter(|d| {
                let names = d.tag_names();
                wanted.iter().all(|w| names.iter().any(|n| n == w))
            })
            .cloned()
            .collect())
    }

    async fn post_digest(&self, post: DigestPost) -> anyhow::Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let tags: Vec<&str> = post.tags.split(',').map(str::trim).collect();
        let tags: Vec<&str> = tags.into_iter().filter(|t| !t.is_empty()).collect();
        self.insert(&id, &post.content, &tags, Some(Utc::now().to_rfc3339()));
        self.posts.lock().unwrap().push(post);
        Ok(())
    }
}
