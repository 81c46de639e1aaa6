use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use agentbox::cli::{self, Cli, Commands};
use agentbox::config::{Config, LoggingConfig};

fn main() -> Result<()> {
    // argv[0] dispatch: if re-exec'd as "agentbox-sandbox", enter sandbox child path
    // immediately, before Tokio, Clap, or any other initialization.
    #[cfg(unix)]
    if let Some(arg0) = std::env::args_os().next()
        && arg0
            .to_string_lossy()
            .ends_with(agentbox::sandbox::child::SANDBOX_ARG0)
    {
        agentbox::sandbox::sandbox_child_main();
    }

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let logging = Config::load().map(|c| c.logging).unwrap_or_default();
    init_logging(&logging, cli.verbose, cli.log_json);

    match cli.command {
        Commands::Exec(args) => cli::exec::run(args).await,
        Commands::Sandbox(args) => cli::sandbox::run(args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Audit(args) => cli::audit::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
