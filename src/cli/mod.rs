pub mod audit;
pub mod config;
pub mod exec;
pub mod paths;
pub mod sandbox;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "agentbox")]
#[command(author, version, about = "Sandboxed code execution for AI agents")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "AGENTBOX_LOG_JSON")]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute code in a sandbox
    Exec(exec::ExecArgs),

    /// Sandbox capabilities, backends and smoke tests
    Sandbox(sandbox::SandboxArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Security audit log
    Audit(audit::AuditArgs),

    /// Show resolved XDG directory paths
    Paths,
}
