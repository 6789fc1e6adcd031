//! refbuild - turns pull requests and branch pushes into packaged build artifacts.
//!
//! Candidate commits arrive from GitHub webhooks and from periodic
//! reconciliation against the GitHub API. The [`enqueue`] decision engine
//! deduplicates them into queued builds; the [`runner`] claims queued builds,
//! checks each one out into an isolated git worktree, and runs the
//! [`pipeline`] that installs, builds, packages and publishes the binary.

pub mod config;
pub mod enqueue;
pub mod github;
pub mod pipeline;
pub mod runner;
pub mod server;
pub mod store;
pub mod sync;
pub mod types;
pub mod webhooks;
pub mod workspace;
