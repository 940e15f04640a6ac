use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use opsdash::transfer;
use opsdash::{Config, DataContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Operator CLI for the opsdash document store.
#[derive(Parser, Debug)]
#[command(name = "opsdash")]
#[command(about = "Inspect, back up and restore the opsdash document store")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the stored document as JSON
    Export {
        /// Output file (stdout when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Replace the stored document with a backup, ignoring concurrent changes
    Import {
        /// Backup file produced by `export`
        file: PathBuf,
        /// Confirm the unconditional overwrite
        #[arg(long)]
        yes: bool,
    },
    /// List servers in display order
    Servers,
    /// List services in display order
    Services,
    /// Show the DNS zone display order
    Domains,
    /// Push the local cache to the remote backend
    Sync,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so exported JSON on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let context = DataContext::from_config(&cli.config)?;

    let result = run(&context, cli.command).await;
    // Flush cached writes even when the command failed
    context
        .shutdown()
        .await
        .context("failed to flush cache on shutdown")?;
    result
}

async fn run(context: &DataContext, command: Command) -> anyhow::Result<()> {
    let repository = context.repository();

    match command {
        Command::Export { output } => {
            let bytes = transfer::export(context.store().as_ref()).await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &bytes)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!("Exported {} bytes to {}", bytes.len(), path.display());
                }
                None => std::io::stdout().write_all(&bytes)?,
            }
        }
        Command::Import { file, yes } => {
            if !yes {
                bail!(
                    "import overwrites the stored document unconditionally; pass --yes to confirm"
                );
            }
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let summary = transfer::import(context.store().as_ref(), &bytes).await?;
            println!(
                "Imported {} servers, {} services, {} domains",
                summary.servers, summary.services, summary.domains
            );
        }
        Command::Servers => {
            let servers = repository.list_servers().await?;
            println!("{}", serde_json::to_string_pretty(&servers)?);
        }
        Command::Services => {
            let services = repository.list_services().await?;
            println!("{}", serde_json::to_string_pretty(&services)?);
        }
        Command::Domains => {
            for zone in repository.get_domain_order().await? {
                println!("{}", zone);
            }
        }
        Command::Sync => {
            let Some(cache) = context.cache() else {
                bail!("no cache configured; sync needs a remote backend with --cache");
            };
            cache.flush().await?;
            println!("Pushed {} to the remote backend", cache.cache_path().display());
        }
    }
    Ok(())
}
