//! agentbox: sandboxed execution of AI-generated code.
//!
//! This crate provides:
//! - Static risk classification and deployment security modes
//! - Process, container and pooled managed-environment backends
//! - Per-session workspaces with path containment
//! - Human-in-the-loop confirmation for high-risk code
//! - A hash-chained security audit log

pub mod cli;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod paths;
pub mod sandbox;
pub mod security;

pub use config::Config;
pub use error::{ErrorCode, Result, SandboxError};
pub use sandbox::{ExecutionRequest, ExecutionResult, SandboxManager};
