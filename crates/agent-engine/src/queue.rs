//! The queue worker: observe, claim, execute, publish.
//!
//! Mutual exclusion is two-tier. The local lockfile is the permanent
//! per-host claim (atomic exclusive create, never deleted once work began);
//! the published lock digest is the best-effort fleet-wide claim. Between
//! the two sits a short fresh re-check that bounds the cross-agent race
//! window to roughly the pod's propagation delay.

use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;

use kash_agent_core::locks::LockStore;

use crate::api::{AgentEvent, EventSender, StopSignal};
use crate::exec::{self, Language, ScriptJob};
use crate::outcome;
use crate::pod::{Digest, DigestPost, PodFetcher};

/// Lock/done digests stay visible for at least this long regardless of the
/// job's own lookback, so stale claims and historical completion are not
/// forgotten before the work items themselves age out.
const LOCK_DONE_LOOKBACK_SECS: u64 = 86_400;

/// Window of the post-claim re-check for racing agents.
const FRESH_RECHECK_SECS: u64 = 60;

pub(crate) struct QueueContext {
    pub(crate) job_name: String,
    pub(crate) language: Language,
    pub(crate) logic_digest_id: String,
    /// Tag set searched for logic scripts (the endpoint's config tags).
    pub(crate) script_tags: String,
    pub(crate) device: String,
    pub(crate) timeout_secs: u64,
    pub(crate) lookback_secs: u64,
    pub(crate) queue_tag: String,
    pub(crate) lock_tag: String,
    pub(crate) done_tags: Vec<String>,
    pub(crate) fail_tags: Vec<String>,
    pub(crate) retry_failed: bool,
    pub(crate) context_prompt: Option<String>,
    pub(crate) fetcher: Arc<PodFetcher>,
    pub(crate) locks: LockStore,
    pub(crate) events: EventSender,
}

impl QueueContext {
    fn exclusion_window(&self) -> u64 {
        self.lookback_secs.max(LOCK_DONE_LOOKBACK_SECS)
    }
}

/// What one pass over the queue found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueuePoll {
    /// No work digests in the lookback window at all.
    NoWork,
    /// Candidates examined; this many were claimed and executed here.
    Processed(usize),
}

/// Digest ids completed somewhere in the fleet, read off `processed-{id}`
/// marker tags.
fn processed_ids(digests: &[Digest]) -> HashSet<String> {
    let mut ids = HashSet::new();
    for digest in digests {
        for tag in digest.tag_names() {
            if let Some(id) = tag.strip_prefix("processed-") {
                if !id.is_empty() {
                    ids.insert(id.to_string());
                }
            }
        }
    }
    ids
}

fn stagger_secs(worker_idx: usize) -> f64 {
    rand::thread_rng().gen_range(2.0..5.0) * worker_idx as f64
}

/// One observation/claim/execute pass over the queue tag.
pub(crate) async fn poll_once(ctx: &QueueContext, worker_idx: usize) -> anyhow::Result<QueuePoll> {
    let digests = ctx
        .fetcher
        .fetch_with_lookback(&ctx.queue_tag, ctx.lookback_secs)
        .await?;
    if digests.is_empty() {
        return Ok(QueuePoll::NoWork);
    }

    let window = ctx.exclusion_window();
    let lock_digests = ctx.fetcher.fetch_with_lookback(&ctx.lock_tag, window).await?;
    let done_digests = ctx
        .fetcher
        .fetch_with_lookback(&ctx.done_tags[0], window)
        .await?;

    // A lock digest's content is the id of the digest it claims.
    let locked_by_id: HashMap<String, &Digest> = lock_digests
        .iter()
        .filter_map(|d| {
            let content = d.content.trim();
            (!content.is_empty()).then(|| (content.to_string(), d))
        })
        .collect();
    let done_ids = processed_ids(&done_digests);
    let failed_ids = if ctx.retry_failed {
        HashSet::new()
    } else {
        let fail_digests = ctx
            .fetcher
            .fetch_with_lookback(&ctx.fail_tags[0], window)
            .await?;
        processed_ids(&fail_digests)
    };

    let mut candidates = Vec::new();
    for digest in &digests {
        if done_ids.contains(&digest.id) {
            continue;
        }
        if failed_ids.contains(&digest.id) {
            continue;
        }
        if let Some(lock) = locked_by_id.get(&digest.id) {
            let age = lock.age_secs();
            if age < ctx.timeout_secs as f64 {
                tracing::debug!(
                    job = %ctx.job_name,
                    digest_id = %digest.id,
                    age,
                    "digest is backend locked, skipping"
                );
                continue;
            }
            tracing::debug!(
                job = %ctx.job_name,
                digest_id = %digest.id,
                age,
                "backend lock is stale, claiming over it"
            );
        }
        if ctx.locks.exists(&ctx.job_name, &digest.id) {
            continue;
        }
        candidates.push(digest);
    }

    let mut processed = 0usize;
    for digest in candidates {
        if claim_and_run(ctx, worker_idx, digest).await? {
            processed += 1;
            let delay = stagger_secs(worker_idx);
            if delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }
    }
    Ok(QueuePoll::Processed(processed))
}

/// Claims one candidate and runs it. Returns whether the script executed.
///
/// Once the local lockfile is created it is never removed, whatever happens
/// after: that is the cross-restart idempotence guarantee.
async fn claim_and_run(
    ctx: &QueueContext,
    worker_idx: usize,
    digest: &Digest,
) -> anyhow::Result<bool> {
    let digest_id = digest.id.clone();

    if !ctx.locks.claim(&ctx.job_name, &digest_id)? {
        // Another worker in this process took it.
        return Ok(false);
    }

    // Fresh re-check: another agent may have claimed or finished the item
    // since the exclusion sets were fetched. The lockfile stays either way.
    let fresh_locks = ctx
        .fetcher
        .fetch_with_lookback(&ctx.lock_tag, FRESH_RECHECK_SECS)
        .await?;
    if fresh_locks.iter().any(|d| d.content.trim() == digest_id) {
        tracing::debug!(
            job = %ctx.job_name,
            digest_id = %digest_id,
            "digest was just locked by another agent, keeping lockfile"
        );
        return Ok(false);
    }
    let fresh_done = ctx
        .fetcher
        .fetch_with_lookback(&ctx.done_tags[0], FRESH_RECHECK_SECS)
        .await?;
    if processed_ids(&fresh_done).contains(&digest_id) {
        tracing::debug!(
            job = %ctx.job_name,
            digest_id = %digest_id,
            "digest was just processed by another agent, keeping lockfile"
        );
        return Ok(false);
    }

    ctx.events.emit(AgentEvent::DigestClaimed {
        job: ctx.job_name.clone(),
        digest_id: digest_id.clone(),
        worker_idx,
    });

    let mut lock_tags = vec![ctx.lock_tag.clone(), ctx.job_name.clone()];
    if !ctx.device.is_empty() {
        lock_tags.push(ctx.device.clone());
    }
    if let Err(err) = ctx
        .fetcher
        .post(DigestPost {
            content: digest_id.clone(),
            tags: lock_tags.join(","),
            filename: None,
            context_prompt: None,
        })
        .await
    {
        // The lockfile already makes this host idempotent; the re-check
        // above bounds the fleet race window.
        ctx.events.warning(format!(
            "queue job {}: failed to publish lock for {digest_id}: {err:#}",
            ctx.job_name
        ));
    }

    let script = match ctx
        .fetcher
        .fetch_by_id(&ctx.logic_digest_id, &ctx.script_tags, false, 0)
        .await
    {
        Ok(script) => script,
        Err(err) => {
            ctx.events.warning(format!(
                "queue job {}: could not fetch script {}: {err:#}",
                ctx.job_name, ctx.logic_digest_id
            ));
            return Ok(false);
        }
    };

    let input_file = if digest.content.is_empty() {
        None
    } else {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(digest.content.as_bytes())?;
        file.flush()?;
        Some(file)
    };

    let result = exec::run_script(
        ctx.language,
        &script,
        ScriptJob {
            job_name: &ctx.job_name,
            job_type: "queue",
            timeout_secs: ctx.timeout_secs,
            input_path: input_file.as_ref().map(|f| f.path()),
            digest: Some(digest),
        },
    )
    .await;

    let outcome = outcome::interpret(
        &result,
        &ctx.done_tags,
        &ctx.fail_tags,
        Some(&digest_id),
        &ctx.job_name,
    );
    if let Err(err) = ctx
        .fetcher
        .post(DigestPost {
            content: outcome.body,
            tags: outcome.tags.join(","),
            filename: None,
            context_prompt: ctx.context_prompt.clone(),
        })
        .await
    {
        ctx.events.warning(format!(
            "queue job {}: failed to publish result for {digest_id}: {err:#}",
            ctx.job_name
        ));
    }

    ctx.events.emit(AgentEvent::DigestProcessed {
        job: ctx.job_name.clone(),
        digest_id,
        success: outcome.success,
    });
    Ok(true)
}

/// The worker loop for one queue slot.
pub(crate) async fn run_queue_worker(
    ctx: Arc<QueueContext>,
    worker_idx: usize,
    shutdown: Arc<StopSignal>,
) {
    loop {
        if shutdown.is_stopped() {
            break;
        }
        let wait = match poll_once(&ctx, worker_idx).await {
            Ok(QueuePoll::NoWork) => Duration::from_secs(3),
            Ok(QueuePoll::Processed(0)) => Duration::from_secs(5),
            Ok(QueuePoll::Processed(_)) => Duration::ZERO,
            Err(err) => {
                ctx.events.error(format!(
                    "queue job {} worker {worker_idx}: {err:#}",
                    ctx.job_name
                ));
                Duration::from_secs(5)
            }
        };
        if !wait.is_zero() && !shutdown.sleep(wait).await {
            break;
        }
    }
}
