mod cli;
mod shutdown;

use std::sync::Arc;

use clap::Parser;

use kash_agent_core::endpoint::FileEndpointProvider;
use kash_agent_core::locks::LockStore;
use kash_agent_engine::{start_agent, AgentConfig, AgentEvent};

use crate::cli::Cli;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => FileEndpointProvider::default_path()?,
    };
    let lock_root = match cli.lock_root {
        Some(path) => path,
        None => LockStore::default_root()?,
    };

    let agent = start_agent(AgentConfig {
        endpoints: Arc::new(FileEndpointProvider::new(config_path.clone())),
        lock_root,
        store: None,
    });
    let mut events = agent.subscribe();

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown_tx);

    println!(
        "kash-stash agent {} (config: {})",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    let mut immediate_exit = false;

    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!("Stop requested — finishing current work before exiting (press CTRL+C again to exit immediately).");
                        agent.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("Stop requested again — exiting immediately.");
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match evt {
                    AgentEvent::Started | AgentEvent::StopRequested => {}
                    AgentEvent::ConfigLoaded { jobs } => {
                        println!("config loaded: {jobs} job(s)");
                    }
                    AgentEvent::JobDispatched { job, kind, threads } => {
                        println!("[{job}] started {kind} pool with {threads} worker(s)");
                    }
                    AgentEvent::JobRetired { job } => {
                        println!("[{job}] stopped (removed from config)");
                    }
                    AgentEvent::DigestClaimed { job, digest_id, worker_idx } => {
                        println!("[{job}] worker {worker_idx} claimed digest {digest_id}");
                    }
                    AgentEvent::DigestProcessed { job, digest_id, success } => {
                        let status = if success { "done" } else { "failed" };
                        println!("[{job}] digest {digest_id} {status}");
                    }
                    AgentEvent::TaskCompleted { job, worker_idx, success } => {
                        let status = if success { "ok" } else { "failed" };
                        println!("[{job}] task run (worker {worker_idx}) {status}");
                    }
                    AgentEvent::OneShotCompleted { job, success } => {
                        let status = if success { "ok" } else { "failed" };
                        println!("[{job}] one-shot run {status}");
                    }
                    AgentEvent::Warning { message } => {
                        eprintln!("warning: {message}");
                    }
                    AgentEvent::Error { message } => {
                        eprintln!("error: {message}");
                    }
                    AgentEvent::Stopped => break,
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    agent.wait().await?;
    Ok(())
}
