//! Public API types for the in-process kash-stash agent engine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kash_agent_core::endpoint::EndpointProvider;

use crate::pod::DigestStore;

/// Configuration for the in-process agent.
#[derive(Clone)]
pub struct AgentConfig {
    /// Source of the current endpoint, consulted on every controller tick.
    pub endpoints: Arc<dyn EndpointProvider>,

    /// Directory for local claim lockfiles.
    pub lock_root: PathBuf,

    /// Digest store override. `None` builds an HTTP pod client from the
    /// current endpoint; tests inject an in-memory store here.
    pub store: Option<Arc<dyn DigestStore>>,
}

/// Class of a configured job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Runs once per install, gated by a lockfile.
    Setup,
    /// Same lifecycle as `setup`; separate name in configs.
    Onetime,
    /// Runs periodically on a per-thread interval.
    Task,
    /// Pulls tagged work items and coordinates claims across the fleet.
    Queue,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Setup => "setup",
            JobKind::Onetime => "onetime",
            JobKind::Task => "task",
            JobKind::Queue => "queue",
        };
        f.write_str(s)
    }
}

/// Agent event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Agent started.
    Started,
    /// Agent is stopping (graceful shutdown requested).
    StopRequested,
    /// A job configuration blob was fetched and parsed.
    ConfigLoaded {
        /// Number of job entries in the parsed config.
        jobs: usize,
    },
    /// A job pool was started.
    JobDispatched {
        /// Job name.
        job: String,
        /// Job class.
        kind: JobKind,
        /// Worker count for the pool.
        threads: usize,
    },
    /// A job disappeared from the config and its pool was signalled to stop.
    JobRetired {
        /// Running-set key (`name:type`).
        job: String,
    },
    /// A queue worker claimed a work digest.
    DigestClaimed {
        /// Job name.
        job: String,
        /// Claimed digest id.
        digest_id: String,
        /// Worker index (0-based).
        worker_idx: usize,
    },
    /// A queue worker finished a work digest and published the result.
    DigestProcessed {
        /// Job name.
        job: String,
        /// Processed digest id.
        digest_id: String,
        /// Whether the script run met the success contract.
        success: bool,
    },
    /// A task worker completed one timed run.
    TaskCompleted {
        /// Job name.
        job: String,
        /// Worker index (0-based).
        worker_idx: usize,
        /// Whether the script run met the success contract.
        success: bool,
    },
    /// A setup/onetime job completed its single run.
    OneShotCompleted {
        /// Job name.
        job: String,
        /// Whether the script run met the success contract.
        success: bool,
    },
    /// A warning from the agent.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the agent.
    Error {
        /// Error message.
        message: String,
    },
    /// Agent stopped (controller and pools have wound down).
    Stopped,
}

/// Stop flag shared by a pool of workers; sleeps are cut short when a stop
/// is requested.
pub(crate) struct StopSignal {
    stopped: AtomicBool,
    notify: tokio::sync::Notify,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Returns `true` on the first call.
    pub(crate) fn request_stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleeps for `dur`, returning `false` when a stop arrived instead.
    pub(crate) async fn sleep(&self, dur: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => !self.is_stopped(),
            _ = self.notify.notified() => false,
        }
    }
}

#[derive(Clone)]
pub(crate) struct EventSender(pub(crate) tokio::sync::broadcast::Sender<AgentEvent>);

impl EventSender {
    pub(crate) fn emit(&self, event: AgentEvent) {
        let _ = self.0.send(event);
    }

    pub(crate) fn warning(&self, message: impl Into<String>) {
        self.emit(AgentEvent::Warning {
            message: message.into(),
        });
    }

    pub(crate) fn error(&self, message: impl Into<String>) {
        self.emit(AgentEvent::Error {
            message: message.into(),
        });
    }
}

pub(crate) struct AgentInner {
    pub(crate) event_tx: tokio::sync::broadcast::Sender<AgentEvent>,
    pub(crate) stop: StopSignal,
}

impl AgentInner {
    pub(crate) fn request_stop(&self) {
        if self.stop.request_stop() {
            let _ = self.event_tx.send(AgentEvent::StopRequested);
        }
    }
}

/// Handle to a running in-process agent instance.
pub struct AgentHandle {
    pub(crate) inner: Arc<AgentInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl AgentHandle {
    /// Subscribe to the agent event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Request a graceful shutdown (finish in-flight work, stop polling).
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the agent to stop, returning the controller task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("agent task join error: {err}")),
        }
    }
}

/// Start a new in-process agent instance.
pub fn start_agent(config: AgentConfig) -> AgentHandle {
    let (event_tx, _) = tokio::sync::broadcast::channel::<AgentEvent>(1024);
    let inner = Arc::new(AgentInner {
        event_tx,
        stop: StopSignal::new(),
    });

    let join = tokio::spawn(crate::controller::run_controller(inner.clone(), config));
    AgentHandle { inner, join }
}
