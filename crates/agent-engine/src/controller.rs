//! The controller: fetches the job configuration blob on a TTL-driven
//! cadence, dispatches job pools, and keeps the running set in sync with
//! the config (pools whose job disappears are signalled to stop).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kash_agent_core::duration::parse_duration;
use kash_agent_core::endpoint::EndpointConfig;
use kash_agent_core::locks::LockStore;

use crate::api::{AgentConfig, AgentEvent, AgentInner, EventSender, JobKind, StopSignal};
use crate::config::{self, JobEntry};
use crate::exec::Language;
use crate::oneshot::{self, OneShotContext};
use crate::pod::{PodClient, PodFetcher};
use crate::queue::{self, QueueContext};
use crate::task::{self, TaskContext};

struct JobPool {
    shutdown: Arc<StopSignal>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl JobPool {
    fn stop(&self) {
        self.shutdown.request_stop();
    }

    async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

struct ControllerState {
    cfg: AgentConfig,
    events: EventSender,
    locks: LockStore,
    fetcher: Option<Arc<PodFetcher>>,
    /// Dispatched pools keyed `"{name}:{type}"`. One-shot jobs are not
    /// tracked here: their own lockfile makes re-dispatch idempotent.
    running: HashMap<String, JobPool>,
    retiring: Vec<JobPool>,
    last_endpoint: Option<EndpointConfig>,
}

impl ControllerState {
    fn new(cfg: AgentConfig, events: EventSender) -> Self {
        let locks = LockStore::new(cfg.lock_root.clone());
        Self {
            cfg,
            events,
            locks,
            fetcher: None,
            running: HashMap::new(),
            retiring: Vec::new(),
            last_endpoint: None,
        }
    }

    /// One configuration refresh. Returns `false` when the config could not
    /// be fetched or parsed (the caller backs off and retries).
    async fn refresh(&mut self) -> bool {
        let Some(endpoint) = self.cfg.endpoints.current() else {
            self.events.warning("no endpoint configured");
            return false;
        };

        // The front-end can rebind the agent to a different pod at any time;
        // pools built against the old endpoint are drained, not leaked.
        if self
            .last_endpoint
            .as_ref()
            .is_some_and(|last| *last != endpoint)
        {
            self.events
                .warning("endpoint changed; stopping all running job pools");
            self.retire_all();
        }
        self.last_endpoint = Some(endpoint.clone());

        let store = match &self.cfg.store {
            Some(store) => Some(store.clone()),
            None if endpoint.has_pod() => match PodClient::new(&endpoint) {
                Ok(client) => Some(Arc::new(client) as _),
                Err(err) => {
                    self.events.error(format!("failed to build pod client: {err:#}"));
                    None
                }
            },
            None => None,
        };
        self.fetcher = store.map(|s| Arc::new(PodFetcher::new(s)));
        let Some(fetcher) = self.fetcher.clone() else {
            self.events
                .warning("pod not configured; cannot fetch job config");
            return false;
        };
        fetcher.clear_cache();

        if endpoint.config_digest_id.trim().is_empty() {
            self.events.warning("no config digest id configured");
            return false;
        }
        let yaml = match fetcher
            .fetch_by_id(
                &endpoint.config_digest_id,
                &endpoint.config_digest_tags,
                true,
                endpoint.config_cache_minutes,
            )
            .await
        {
            Ok(yaml) => yaml,
            Err(err) => {
                self.events
                    .warning(format!("could not fetch config digest: {err:#}"));
                return false;
            }
        };

        let parsed = match config::parse_config(&yaml) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.events.warning(format!("could not parse config: {err:#}"));
                return false;
            }
        };
        for reason in &parsed.skipped {
            self.events
                .warning(format!("skipping invalid job entry {reason}"));
        }
        self.events.emit(AgentEvent::ConfigLoaded {
            jobs: parsed.jobs.len(),
        });

        self.sync_jobs(&endpoint, fetcher, parsed.jobs);
        true
    }

    fn sync_jobs(
        &mut self,
        endpoint: &EndpointConfig,
        fetcher: Arc<PodFetcher>,
        jobs: Vec<(String, JobEntry)>,
    ) {
        let mut current_keys = HashSet::new();

        for (name, entry) in jobs {
            let key = format!("{name}:{}", entry.kind);
            current_keys.insert(key.clone());

            let spec = entry.job;
            let Some(language) = Language::parse(&spec.language) else {
                self.events.warning(format!(
                    "unsupported language {:?} for job {name}",
                    spec.language
                ));
                continue;
            };
            let Some(logic_digest_id) = spec
                .logic_digest_id
                .clone()
                .filter(|id| !id.trim().is_empty())
            else {
                self.events
                    .warning(format!("no logic_digest_id for job {name}"));
                continue;
            };

            match entry.kind {
                JobKind::Setup | JobKind::Onetime => {
                    let ctx = Arc::new(OneShotContext {
                        job_name: name.clone(),
                        kind: entry.kind,
                        language,
                        logic_digest_id,
                        script_tags: endpoint.config_digest_tags.clone(),
                        device: endpoint.device.clone(),
                        timeout_secs: spec.timeout,
                        lock_tag: spec.lock_tag(&name),
                        done_tags: spec.done_tags(&name),
                        fail_tags: spec.fail_tags(&name),
                        context_prompt: spec.context_prompt.clone(),
                        fetcher: fetcher.clone(),
                        locks: self.locks.clone(),
                        events: self.events.clone(),
                    });
                    tokio::spawn(oneshot::run_oneshot(ctx));
                }
                JobKind::Task => {
                    if self.running.contains_key(&key) {
                        continue;
                    }
                    let Some(timing) = spec.timing.clone() else {
                        self.events
                            .warning(format!("task job {name} has no timing entry"));
                        continue;
                    };
                    let interval_secs = match parse_duration(&timing) {
                        Ok(secs) => secs,
                        Err(err) => {
                            self.events
                                .warning(format!("task job {name}: bad timing: {err:#}"));
                            continue;
                        }
                    };

                    let threads = spec.threads.max(1);
                    let ctx = Arc::new(TaskContext {
                        job_name: name.clone(),
                        language,
                        logic_digest_id,
                        script_tags: endpoint.config_digest_tags.clone(),
                        timeout_secs: spec.timeout,
                        interval_secs,
                        done_tags: spec.done_tags(&name),
                        fail_tags: spec.fail_tags(&name),
                        context_prompt: spec.context_prompt.clone(),
                        fetcher: fetcher.clone(),
                        locks: self.locks.clone(),
                        events: self.events.clone(),
                    });
                    let shutdown = Arc::new(StopSignal::new());
                    let workers = (0..threads)
                        .map(|idx| {
                            tokio::spawn(task::run_task_worker(
                                ctx.clone(),
                                idx,
                                shutdown.clone(),
                            ))
                        })
                        .collect();
                    self.running.insert(key, JobPool { shutdown, workers });
                    self.events.emit(AgentEvent::JobDispatched {
                        job: name,
                        kind: JobKind::Task,
                        threads,
                    });
                }
                JobKind::Queue => {
                    if self.running.contains_key(&key) {
                        continue;
                    }
                    if self.cfg.store.is_none() && !endpoint.has_pod() {
                        self.events.warning(format!(
                            "queue job {name} requires pod configuration, skipping"
                        ));
                        continue;
                    }
                    let Some(queue_tag) = spec
                        .queue_tag
                        .clone()
                        .filter(|tag| !tag.trim().is_empty())
                    else {
                        self.events
                            .warning(format!("queue job {name} has no queue_tag defined"));
                        continue;
                    };
                    let lookback_secs = match parse_duration(&spec.lookback) {
                        Ok(secs) => secs,
                        Err(err) => {
                            self.events
                                .warning(format!("queue job {name}: bad lookback: {err:#}"));
                            continue;
                        }
                    };

                    let threads = spec.threads.max(1);
                    let ctx = Arc::new(QueueContext {
                        job_name: name.clone(),
                        language,
                        logic_digest_id,
                        script_tags: endpoint.config_digest_tags.clone(),
                        device: endpoint.device.clone(),
                        timeout_secs: spec.timeout,
                        lookback_secs,
                        queue_tag,
                        lock_tag: spec.lock_tag(&name),
                        done_tags: spec.done_tags(&name),
                        fail_tags: spec.fail_tags(&name),
                        retry_failed: spec.retry_failed,
                        context_prompt: spec.context_prompt.clone(),
                        fetcher: fetcher.clone(),
                        locks: self.locks.clone(),
                        events: self.events.clone(),
                    });
                    let shutdown = Arc::new(StopSignal::new());
                    let workers = (0..threads)
                        .map(|idx| {
                            tokio::spawn(queue::run_queue_worker(
                                ctx.clone(),
                                idx,
                                shutdown.clone(),
                            ))
                        })
                        .collect();
                    self.running.insert(key, JobPool { shutdown, workers });
                    self.events.emit(AgentEvent::JobDispatched {
                        job: name,
                        kind: JobKind::Queue,
                        threads,
                    });
                }
            }
        }

        let stale: Vec<String> = self
            .running
            .keys()
            .filter(|key| !current_keys.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            self.events.warning(format!(
                "job {key} removed from config; stopping its workers"
            ));
            if let Some(pool) = self.running.remove(&key) {
                pool.stop();
                self.retiring.push(pool);
            }
            self.events.emit(AgentEvent::JobRetired { job: key });
        }
    }

    fn retire_all(&mut self) {
        for (_, pool) in self.running.drain() {
            pool.stop();
            self.retiring.push(pool);
        }
    }

    async fn shutdown_pools(mut self) {
        self.retire_all();
        for pool in self.retiring.drain(..) {
            pool.join().await;
        }
    }
}

pub(crate) async fn run_controller(
    inner: Arc<AgentInner>,
    cfg: AgentConfig,
) -> anyhow::Result<()> {
    let events = EventSender(inner.event_tx.clone());
    events.emit(AgentEvent::Started);

    let mut state = ControllerState::new(cfg, events.clone());
    let mut last_fetch: Option<Instant> = None;

    loop {
        if inner.stop.is_stopped() {
            break;
        }

        let cache_minutes = state
            .cfg
            .endpoints
            .current()
            .map(|e| e.config_cache_minutes)
            .unwrap_or(5);
        let should_fetch = match (last_fetch, cache_minutes) {
            (None, _) => true,
            (Some(_), 0) => true,
            (Some(_), -1) => false,
            (Some(at), minutes) => at.elapsed().as_secs_f64() / 60.0 >= minutes as f64,
        };

        if should_fetch {
            if state.refresh().await {
                last_fetch = Some(Instant::now());
            } else {
                if !inner.stop.sleep(Duration::from_secs(60)).await {
                    break;
                }
                continue;
            }
        }

        let pause = match cache_minutes {
            0 => 30,
            -1 => 3_600,
            _ => 60,
        };
        if !inner.stop.sleep(Duration::from_secs(pause)).await {
            break;
        }
    }

    state.shutdown_pools().await;
    events.emit(AgentEvent::Stopped);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::DigestStore;
    use crate::testutil::MemoryStore;
    use kash_agent_core::endpoint::EndpointProvider;
    use std::sync::Mutex;

    const CONFIG_FULL: &str = r#"
mirror:
  type: queue
  job: { language: bash, logic_digest_id: 9, queue_tag: q }
beat:
  type: task
  job: { language: bash, logic_digest_id: 9, timing: 1h, threads: 2 }
"#;

    struct SwapProvider(Mutex<EndpointConfig>);

    impl SwapProvider {
        fn endpoint(config_digest_id: &str) -> EndpointConfig {
            EndpointConfig {
                name: "test".into(),
                device: "dev-1".into(),
                pod_url: String::new(),
                pod_key: String::new(),
                node_name: String::new(),
                probe_id: String::new(),
                probe_key: String::new(),
                config_digest_id: config_digest_id.into(),
                config_digest_tags: "agent-config".into(),
                config_cache_minutes: 5,
            }
        }

        fn set_config_digest(&self, id: &str) {
            self.0.lock().unwrap().config_digest_id = id.to_string();
        }
    }

    impl EndpointProvider for SwapProvider {
        fn current(&self) -> Option<EndpointConfig> {
            Some(self.0.lock().unwrap().clone())
        }
    }

    fn state(
        store: Arc<MemoryStore>,
        provider: Arc<SwapProvider>,
        lock_dir: &tempfile::TempDir,
    ) -> ControllerState {
        let (event_tx, _) = tokio::sync::broadcast::channel(256);
        let cfg = AgentConfig {
            endpoints: provider,
            lock_root: lock_dir.path().to_path_buf(),
            store: Some(store as Arc<dyn DigestStore>),
        };
        ControllerState::new(cfg, EventSender(event_tx))
    }

    #[tokio::test]
    async fn refresh_dispatches_each_job_once() {
        let store = MemoryStore::new();
        store.seed("77", CONFIG_FULL, &["agent-config"], 5);
        let provider = Arc::new(SwapProvider(Mutex::new(SwapProvider::endpoint("77"))));
        let lock_dir = tempfile::tempdir().unwrap();
        let mut state = state(store, provider, &lock_dir);

        assert!(state.refresh().await);
        let mut keys: Vec<&String> = state.running.keys().collect();
        keys.sort();
        assert_eq!(keys, ["beat:task", "mirror:queue"]);
        assert_eq!(state.running["beat:task"].workers.len(), 2);

        // Second refresh with the same config: keyed dedup, no new pools.
        assert!(state.refresh().await);
        assert_eq!(state.running.len(), 2);
        assert!(state.retiring.is_empty());

        state.shutdown_pools().await;
    }

    #[tokio::test]
    async fn jobs_dropped_from_config_are_retired() {
        let store = MemoryStore::new();
        store.seed("77", CONFIG_FULL, &["agent-config"], 5);
        let provider = Arc::new(SwapProvider(Mutex::new(SwapProvider::endpoint("77"))));
        let lock_dir = tempfile::tempdir().unwrap();
        let mut state = state(store.clone(), provider, &lock_dir);

        assert!(state.refresh().await);
        assert_eq!(state.running.len(), 2);

        store.set_content("77", "{}");
        assert!(state.refresh().await);
        assert!(state.running.is_empty());
        assert_eq!(state.retiring.len(), 2);
        assert!(state.retiring.iter().all(|pool| pool.shutdown.is_stopped()));

        state.shutdown_pools().await;
    }

    #[tokio::test]
    async fn endpoint_change_retires_every_pool() {
        let store = MemoryStore::new();
        store.seed("77", CONFIG_FULL, &["agent-config"], 5);
        store.seed("78", CONFIG_FULL, &["agent-config"], 5);
        let provider = Arc::new(SwapProvider(Mutex::new(SwapProvider::endpoint("77"))));
        let lock_dir = tempfile::tempdir().unwrap();
        let mut state = state(store, provider.clone(), &lock_dir);

        assert!(state.refresh().await);
        assert_eq!(state.running.len(), 2);

        provider.set_config_digest("78");
        assert!(state.refresh().await);
        // Old pools were drained and the same jobs redispatched fresh.
        assert_eq!(state.running.len(), 2);
        assert_eq!(state.retiring.len(), 2);

        state.shutdown_pools().await;
    }

    #[tokio::test]
    async fn invalid_jobs_are_skipped_without_pools() {
        let store = MemoryStore::new();
        store.seed(
            "77",
            "odd:\n  type: queue\n  job: { language: cobol, logic_digest_id: 9, queue_tag: q }\nbare:\n  type: queue\n  job: { language: bash, logic_digest_id: 9 }\n",
            &["agent-config"],
            5,
        );
        let provider = Arc::new(SwapProvider(Mutex::new(SwapProvider::endpoint("77"))));
        let lock_dir = tempfile::tempdir().unwrap();
        let mut state = state(store, provider, &lock_dir);

        assert!(state.refresh().await);
        assert!(state.running.is_empty());
        state.shutdown_pools().await;
    }

    #[tokio::test]
    async fn missing_config_digest_backs_off() {
        let store = MemoryStore::new();
        let provider = Arc::new(SwapProvider(Mutex::new(SwapProvider::endpoint("77"))));
        let lock_dir = tempfile::tempdir().unwrap();
        let mut state = state(store, provider, &lock_dir);

        assert!(!state.refresh().await);
        assert!(state.running.is_empty());
    }
}
