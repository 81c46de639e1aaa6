//! CLI subcommand: `agentbox paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use crate::config::Config;

pub fn run() -> Result<()> {
    let config = Config::load()?;
    let paths = &config.paths;

    println!("agentbox Paths (XDG Base Directory)");
    println!("===================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  workspaces:     {}", config.workspaces_root().display());
    println!("  archive:        {}", config.archive_dir().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  audit log:      {}", paths.audit_log().display());

    Ok(())
}
