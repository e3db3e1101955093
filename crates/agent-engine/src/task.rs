//! The task scheduler: periodic per-thread runs, no fleet coordination.
//!
//! Pacing is a host-local lockfile per worker slot (`task-thread-{i}`),
//! overwritten on every run. Unlike queue claims it is a plain timing
//! marker, not an exclusion record.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;

use kash_agent_core::locks::LockStore;

use crate::api::{AgentEvent, EventSender, StopSignal};
use crate::exec::{self, Language, ScriptJob};
use crate::outcome;
use crate::pod::{DigestPost, PodFetcher};

pub(crate) struct TaskContext {
    pub(crate) job_name: String,
    pub(crate) language: Language,
    pub(crate) logic_digest_id: String,
    pub(crate) script_tags: String,
    pub(crate) timeout_secs: u64,
    /// Minimum seconds between runs of one worker slot.
    pub(crate) interval_secs: u64,
    pub(crate) done_tags: Vec<String>,
    pub(crate) fail_tags: Vec<String>,
    pub(crate) context_prompt: Option<String>,
    pub(crate) fetcher: Arc<PodFetcher>,
    pub(crate) locks: LockStore,
    pub(crate) events: EventSender,
}

/// One timed run: fetch the script fresh, stamp the pacing marker, execute,
/// publish. Returns whether the run met the success contract.
pub(crate) async fn run_tick(ctx: &TaskContext, marker_key: &str) -> anyhow::Result<bool> {
    let script = ctx
        .fetcher
        .fetch_by_id(&ctx.logic_digest_id, &ctx.script_tags, false, 0)
        .await
        .map_err(|err| anyhow::anyhow!("could not fetch script {}: {err:#}", ctx.logic_digest_id))?;

    ctx.locks.overwrite(&ctx.job_name, marker_key)?;

    let result = exec::run_script(
        ctx.language,
        &script,
        ScriptJob {
            job_name: &ctx.job_name,
            job_type: "task",
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
            "task job {}: failed to publish result: {err:#}",
            ctx.job_name
        ));
    }
    Ok(outcome.success)
}

/// The worker loop for one task slot.
pub(crate) async fn run_task_worker(
    ctx: Arc<TaskContext>,
    worker_idx: usize,
    shutdown: Arc<StopSignal>,
) {
    let initial = { rand::thread_rng().gen_range(2.0..5.0) * worker_idx as f64 };
    if !shutdown.sleep(Duration::from_secs_f64(initial)).await {
        return;
    }

    let marker_key = format!("task-thread-{worker_idx}");
    loop {
        if shutdown.is_stopped() {
            break;
        }

        if ctx.locks.read_age_secs(&ctx.job_name, &marker_key) >= ctx.interval_secs as f64 {
            match run_tick(&ctx, &marker_key).await {
                Ok(success) => ctx.events.emit(AgentEvent::TaskCompleted {
                    job: ctx.job_name.clone(),
                    worker_idx,
                    success,
                }),
                Err(err) => {
                    ctx.events
                        .warning(format!("task job {}: {err:#}", ctx.job_name));
                    if !shutdown.sleep(Duration::from_secs(5)).await {
                        break;
                    }
                    continue;
                }
            }
        }

        let pause = {
            let jitter: f64 = rand::thread_rng().gen_range(1.0..4.0);
            Duration::from_secs_f64(ctx.interval_secs as f64 + jitter)
        };
        if !shutdown.sleep(pause).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStore;

    fn fixture(script: &str) -> (Arc<MemoryStore>, tempfile::TempDir, TaskContext) {
        let store = MemoryStore::new();
        store.seed("12", script, &["agent-config"], 5);
        let lock_dir = tempfile::tempdir().unwrap();
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        let ctx = TaskContext {
            job_name: "beat".to_string(),
            language: Language::Bash,
            logic_digest_id: "12".to_string(),
            script_tags: "agent-config".to_string(),
            timeout_secs: 900,
            interval_secs: 3_600,
            done_tags: vec!["beat-done".to_string()],
            fail_tags: vec!["beat-fail".to_string()],
            context_prompt: None,
            fetcher: Arc::new(PodFetcher::new(store.clone())),
            locks: LockStore::new(lock_dir.path().to_path_buf()),
            events: EventSender(event_tx),
        };
        (store, lock_dir, ctx)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tick_runs_publishes_and_stamps_the_marker() {
        let (store, _dir, ctx) = fixture(r#"echo '{"content":"b2s="}'"#);

        let success = run_tick(&ctx, "task-thread-0").await.unwrap();
        assert!(success);
        assert!(ctx.locks.exists("beat", "task-thread-0"));
        assert!(ctx.locks.read_age_secs("beat", "task-thread-0") < ctx.interval_secs as f64);

        let done = store.posts_tagged("beat-done");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].content, "ok");
        let tags = crate::config::parse_tags(&done[0].tags);
        assert!(tags.contains(&"beat".to_string()));
        assert!(!tags.iter().any(|t| t.starts_with("processed-")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_tick_publishes_under_fail_tags() {
        let (store, _dir, ctx) = fixture("exit 7");

        let success = run_tick(&ctx, "task-thread-0").await.unwrap();
        assert!(!success);
        assert_eq!(store.posts_tagged("beat-fail").len(), 1);
        assert!(store.posts_tagged("beat-done").is_empty());
    }

    #[tokio::test]
    async fn missing_script_is_an_error_and_publishes_nothing() {
        let (store, _dir, ctx) = fixture("echo hi");
        let ctx = TaskContext {
            logic_digest_id: "404".to_string(),
            ..ctx
        };
        assert!(run_tick(&ctx, "task-thread-0").await.is_err());
        assert!(store.posts().is_empty());
        assert!(!ctx.locks.exists("beat", "task-thread-0"));
    }
}
