#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Host-local state shared by the kash-stash agent and its front-ends:
//! endpoint configuration, the claim lockfile store, and the duration grammar.

pub mod duration;
pub mod endpoint;
pub mod locks;
