//! autoland: policy-driven pull request merge automation.
//!
//! The engine watches a repository's pull requests, classifies each one into
//! a policy tier (by labels, author, paths, and diff size), holds eligible
//! PRs through a tier-specific soak delay, and lands them through a merge
//! queue that rebases, re-checks, and merges at most one PR at a time.
//! Every state transition is recorded in an append-only audit log before it
//! takes effect.
//!
//! The crate is split into a pure core and an effectful shell:
//!
//! - [`normalize`], [`policy`], [`engine::decide`], and [`safeguard`] are
//!   pure functions over snapshots; no I/O
//! - [`soak`] and [`queue`] hold the concurrent timer and queue tables
//! - [`engine`] orchestrates everything against a [`platform::HostService`]
//! - [`store`] and [`audit`] make the whole thing crash-recoverable

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod platform;
pub mod policy;
pub mod queue;
pub mod safeguard;
pub mod soak;
pub mod store;
pub mod types;
