#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process engine for the kash-stash agent (configuration lifecycle, job
//! dispatch, queue claim/execute/publish coordination).

/// Public API for the engine crate.
pub mod api;

mod config;
mod controller;
mod exec;
mod oneshot;
mod outcome;
mod pod;
mod queue;
mod task;

#[cfg(test)]
mod testutil;

pub use api::{start_agent, AgentConfig, AgentEvent, AgentHandle, JobKind};
pub use pod::{Digest, DigestPost, DigestStore, PodClient, PodError, Tag};
