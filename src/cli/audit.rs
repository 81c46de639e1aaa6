use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::security::{audit_file_path, read_audit_log, verify_audit_chain};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Print recent audit entries
    Show {
        /// Number of most recent entries to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Only entries for this session
        #[arg(short, long)]
        session: Option<String>,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Verify the hash chain of the audit log
    Verify,
}

pub async fn run(args: AuditArgs) -> Result<()> {
    let config = Config::load()?;
    let state_dir = &config.paths.state_dir;

    match args.command {
        AuditCommands::Show {
            limit,
            session,
            json,
        } => {
            let entries: Vec<_> = read_audit_log(state_dir)?
                .into_iter()
                .filter(|e| session.as_ref().is_none_or(|s| &e.session_id == s))
                .collect();
            let skip = entries.len().saturating_sub(limit);

            if entries.is_empty() {
                println!("No audit entries in {}", audit_file_path(state_dir).display());
                return Ok(());
            }
            for entry in &entries[skip..] {
                if json {
                    println!("{}", serde_json::to_string(entry)?);
                } else {
                    let action = serde_json::to_value(entry.action)?;
                    println!(
                        "{}  {:<26} {:<20} {}",
                        entry.ts,
                        action.as_str().unwrap_or_default(),
                        entry.session_id,
                        entry.detail.as_deref().unwrap_or("")
                    );
                }
            }
        }
        AuditCommands::Verify => {
            let broken = verify_audit_chain(state_dir)?;
            let path = audit_file_path(state_dir);
            if broken.is_empty() {
                println!("Audit chain intact: {}", path.display());
            } else {
                anyhow::bail!(
                    "Audit chain broken at {} entr{} (lines {:?}) in {}",
                    broken.len(),
                    if broken.len() == 1 { "y" } else { "ies" },
                    broken.iter().map(|i| i + 1).collect::<Vec<_>>(),
                    path.display()
                );
            }
        }
    }

    Ok(())
}
