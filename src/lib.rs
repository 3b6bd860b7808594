//! Safe execution subsystem for agent-driven development tools.
//!
//! Every command an agent asks to run passes through a whitelist validator,
//! a per-session rate limiter, and an append-only audit log before it is
//! spawned directly (never via a shell) inside a sandbox directory. File
//! edits go through the same boundary with automatic backups and rollback,
//! and the workflow orchestrator drives git publication flows through the
//! same pipeline.

pub mod api;
pub mod audit;
pub mod config;
pub mod edit;
pub mod error;
pub mod exec;
pub mod security;
pub mod workflow;

pub use api::ExecService;
pub use config::Config;
pub use error::{ExecError, Result};
