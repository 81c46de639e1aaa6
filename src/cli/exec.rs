use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use std::io::{BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::sandbox::{
    BackendKind, ConfirmationPrompt, ConfirmationService, ExecutionRequest, ExecutionResult,
    Language, NotificationChannel, PendingPrompts, SandboxManager, SessionScope,
};

#[derive(Args)]
pub struct ExecArgs {
    /// Code to run. Read from --file or stdin when omitted.
    pub code: Option<String>,

    /// Read the program from a file
    #[arg(short, long, conflicts_with = "code")]
    pub file: Option<PathBuf>,

    /// python, shell or javascript
    #[arg(short, long, default_value = "python")]
    pub language: Language,

    /// Session id; calls with the same id share a workspace
    #[arg(short, long, default_value = "cli")]
    pub session: String,

    #[arg(long, default_value = "default")]
    pub organization: String,

    #[arg(long, default_value = "default")]
    pub team: String,

    #[arg(long, default_value = "default")]
    pub workspace: String,

    /// Timeout in seconds (default: sandbox.default_timeout_secs)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Preferred backend: process, managed-environment or container
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// Approve confirmation prompts without asking
    #[arg(short, long)]
    pub yes: bool,

    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,

    /// Tear down the session workspace afterwards
    #[arg(long)]
    pub cleanup: bool,
}

/// Asks on the controlling terminal.
struct TerminalChannel {
    prompts: PendingPrompts,
    auto_approve: bool,
}

#[async_trait]
impl NotificationChannel for TerminalChannel {
    async fn notify(&self, prompt: &ConfirmationPrompt) -> Result<()> {
        if self.auto_approve {
            eprintln!("Auto-approving {} risk execution", prompt.risk_level);
            self.prompts.resolve(&prompt.id, true);
            return Ok(());
        }

        eprintln!();
        eprintln!("Confirmation required ({} risk):", prompt.risk_level);
        for reason in &prompt.reasons {
            eprintln!("  - {}", reason);
        }
        eprintln!();
        eprintln!("{}", prompt.description);
        eprint!("Run this? [y/N] ");
        std::io::stderr().flush()?;

        let prompts = self.prompts.clone();
        let id = prompt.id.clone();
        tokio::task::spawn_blocking(move || {
            let mut answer = String::new();
            let approved = std::io::stdin().lock().read_line(&mut answer).is_ok()
                && matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes");
            prompts.resolve(&id, approved);
        });
        Ok(())
    }
}

pub async fn run(args: ExecArgs) -> Result<()> {
    let config = Config::load()?;
    let code = read_code(&args)?;

    let prompts = PendingPrompts::new();
    let channel = Arc::new(TerminalChannel {
        prompts: prompts.clone(),
        auto_approve: args.yes,
    });
    let confirmation =
        ConfirmationService::with_prompts(channel, prompts, config.confirmation.timeout());
    let manager = SandboxManager::from_config(&config)
        .await
        .with_confirmation(confirmation);

    let scope = SessionScope::new(
        args.organization.as_str(),
        args.team.as_str(),
        args.workspace.as_str(),
        args.session.as_str(),
    );
    let mut request = ExecutionRequest::new(scope, args.language, code)
        .with_timeout(
            args.timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.sandbox.default_timeout()),
        )
        .with_memory_limit(config.sandbox.max_memory_bytes)
        .with_output_limit(config.sandbox.max_output_bytes);
    if let Some(backend) = args.backend {
        request = request.with_backend(backend);
    }

    let result = match manager.execute(request).await {
        Ok(result) => result,
        Err(e) => ExecutionResult::from_error(&e),
    };

    if args.cleanup
        && let Err(e) = manager.cleanup_session(&args.session).await
    {
        tracing::warn!("Cleanup of session {} failed: {}", args.session, e);
    }
    manager.shutdown().await;

    print_result(&result, args.json)?;
    if !result.success {
        std::process::exit(if result.exit_code > 0 { result.exit_code } else { 1 });
    }
    Ok(())
}

fn read_code(args: &ExecArgs) -> Result<String> {
    if let Some(ref code) = args.code {
        return Ok(code.clone());
    }
    if let Some(ref path) = args.file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    let mut code = String::new();
    std::io::stdin()
        .read_to_string(&mut code)
        .context("Failed to read program from stdin")?;
    Ok(code)
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if result.stdout_truncated || result.stderr_truncated {
        eprintln!("[output truncated]");
    }
    if let Some(ref error) = result.error {
        eprintln!("agentbox: {}", error);
    }
    if !result.created_files.is_empty() {
        eprintln!("Created files:");
        for file in &result.created_files {
            eprintln!("  {}", file.display());
        }
    }
    Ok(())
}
