//! Setup/onetime jobs: run once per install, gated by a lockfile.

use std::sync::Arc;

use kash_agent_core::locks::LockStore;

use crate::api::{AgentEvent, EventSender, JobKind};
use crate::exec::{self, Language, ScriptJob};
use crate::outcome;
use crate::pod::{DigestPost, PodFetcher};

/// Lockfile key shared by both one-shot classes.
const ONESHOT_KEY: &str = "setup";

pub(crate) struct OneShotContext {
    pub(crate) job_name: String,
    pub(crate) kind: JobKind,
    pub(crate) language: Language,
    pub(crate) logic_digest_id: String,
    pub(crate) script_tags: String,
    pub(crate) device: String,
    pub(crate) timeout_secs: u64,
    pub(crate) lock_tag: String,
    pub(crate) done_tags: Vec<String>,
    pub(crate) fail_tags: Vec<String>,
    pub(crate) context_prompt: Option<String>,
    pub(crate) fetcher: Arc<PodFetcher>,
    pub(crate) locks: LockStore,
    pub(crate) events: EventSender,
}

/// Runs a setup/onetime job unless its lockfile already exists. The lockfile
/// persists forever; re-running requires deleting it by hand.
pub(crate) async fn run_oneshot(ctx: Arc<OneShotContext>) {
    if ctx.locks.exists(&ctx.job_name, ONESHOT_KEY) {
        tracing::debug!(job = %ctx.job_name, "one-shot lockfile exists, skipping");
        return;
    }
    match run_inner(&ctx).await {
        Ok(Some(success)) => ctx.events.emit(AgentEvent::OneShotCompleted {
            job: ctx.job_name.clone(),
            success,
        }),
        Ok(None) => {}
        Err(err) => ctx.events.warning(format!(
            "{} job {}: {err:#}",
            ctx.kind, ctx.job_name
        )),
    }
}

/// `Ok(None)` means the run was abandoned before execution (script missing,
/// or another dispatch of the same job won the lockfile).
async fn run_inner(ctx: &OneShotContext) -> anyhow::Result<Option<bool>> {
    let script = ctx
        .fetcher
        .fetch_by_id(&ctx.logic_digest_id, &ctx.script_tags, false, 0)
        .await
        .map_err(|err| anyhow::anyhow!("could not fetch script {}: {err:#}", ctx.logic_digest_id))?;

    let mut lock_tags = vec![
        ctx.lock_tag.clone(),
        ctx.job_name.clone(),
        ONESHOT_KEY.to_string(),
    ];
    if !ctx.device.is_empty() {
        lock_tags.push(ctx.device.clone());
    }
    if let Err(err) = ctx
        .fetcher
        .post(DigestPost {
            content: ONESHOT_KEY.to_string(),
            tags: lock_tags.join(","),
            filename: None,
            context_prompt: None,
        })
        .await
    {
        ctx.events.warning(format!(
            "{} job {}: failed to publish lock: {err:#}",
            ctx.kind, ctx.job_name
        ));
    }

    if !ctx.locks.claim(&ctx.job_name, ONESHOT_KEY)? {
        return Ok(None);
    }

    let job_type = ctx.kind.to_string();
    let result = exec::run_script(
        ctx.language,
        &script,
        ScriptJob {
            job_name: &ctx.job_name,
            job_type: &job_type,
            timeout_secs: ctx.timeout_secs,
            input_path: None,
            digest: None,
        },
    )
    .await;

    let outcome = outcome::interpret(&result, &ctx.done_tags, &ctx.fail_tags, None, &ctx.job_name);
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
            "{} job {}: failed to publish result: {err:#}",
            ctx.kind, ctx.job_name
        ));
    }
    Ok(Some(outcome.success))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStore;

    fn fixture(script: &str) -> (Arc<MemoryStore>, tempfile::TempDir, OneShotContext) {
        let store = MemoryStore::new();
        store.seed("3", script, &["agent-config"], 5);
        let lock_dir = tempfile::tempdir().unwrap();
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        let ctx = OneShotContext {
            job_name: "boot".to_string(),
            kind: JobKind::Setup,
            language: Language::Bash,
            logic_digest_id: "3".to_string(),
            script_tags: "agent-config".to_string(),
            device: "dev-1".to_string(),
            timeout_secs: 900,
            lock_tag: "boot-lock".to_string(),
            done_tags: vec!["boot-done".to_string()],
            fail_tags: vec!["boot-fail".to_string()],
            context_prompt: None,
            fetcher: Arc::new(PodFetcher::new(store.clone())),
            locks: LockStore::new(lock_dir.path().to_path_buf()),
            events: EventSender(event_tx),
        };
        (store, lock_dir, ctx)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_once_and_never_again() {
        let (store, _dir, ctx) = fixture(r#"echo '{"content":"b2s="}'"#);
        let ctx = Arc::new(ctx);

        run_oneshot(ctx.clone()).await;
        assert!(ctx.locks.exists("boot", "setup"));
        let locks = store.posts_tagged("boot-lock");
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].content, "setup");
        let lock_tags = crate::config::parse_tags(&locks[0].tags);
        assert!(lock_tags.contains(&"setup".to_string()));
        assert!(lock_tags.contains(&"dev-1".to_string()));
        assert_eq!(store.posts_tagged("boot-done").len(), 1);

        // Re-dispatch: the lockfile gates any further run.
        let posts_before = store.posts().len();
        run_oneshot(ctx).await;
        assert_eq!(store.posts().len(), posts_before);
    }

    #[tokio::test]
    async fn missing_script_leaves_the_job_retryable() {
        let (store, _dir, ctx) = fixture("echo hi");
        let ctx = Arc::new(OneShotContext {
            logic_digest_id: "404".to_string(),
            ..ctx
        });

        run_oneshot(ctx.clone()).await;
        // No lockfile: the next config refresh can try again.
        assert!(!ctx.locks.exists("boot", "setup"));
        assert!(store.posts().is_empty());
    }
}
