//! Outbox orchestrator for role-based coding-agent workers.
//!
//! An append-only issue timeline is the source of truth. A polling sync tick
//! per role discovers work, gates it, runs one isolated worker subprocess per
//! issue and writes a structured audit comment back. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (labels, preconditions, comment
//!   protocol, result classification, merge gate). No I/O.
//! - **[`io`]**: Side-effecting adapters (SQLite store, KV cache, git
//!   worktrees, context packs, subprocesses, codex). Behind traits where tests
//!   substitute them.
//!
//! Orchestration modules ([`sync`], [`dispatch`], [`issues`], [`quality`],
//! [`pipeline`], [`worker`]) coordinate core logic with I/O to implement CLI
//! commands and the webhook server.

pub mod core;
pub mod dispatch;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod issues;
pub mod logging;
pub mod pipeline;
pub mod quality;
pub mod sync;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
