use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use fundgrube_storage::{connect_store, PostingStore};
use fundgrube_sync::{
    dispatcher_for, failure_alert, AlertDispatcher, RunOptions, SyncConfig, SyncPipeline,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fundgrube")]
#[command(about = "Crawls MediaMarkt/Saturn outlet listings and mails matching deals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,

    /// Log to /tmp/fundgrube-<timestamp>.txt instead of stderr.
    #[arg(long, env = "LOG_TO_FILE", global = true)]
    log_to_file: bool,
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    /// Only page until no new postings show up; no deactivation.
    #[arg(long, env = "ONLY_NEW_POSTINGS")]
    only_new: bool,
    /// Skip crawling and only run the saved queries.
    #[arg(long, env = "SKIP_CRAWLING")]
    skip_crawl: bool,
    /// Read listings from the fixture file instead of the network.
    #[arg(long, env = "MOCKED_POSTINGS")]
    mocked: bool,
    /// Match every posting regardless of when a query last ran.
    #[arg(long, env = "FIND_ALL")]
    find_all: bool,
    /// Crawl only the first few outlets of each category.
    #[arg(long, env = "LIMIT_OUTLETS")]
    limit_outlets: bool,
}

impl From<&RunArgs> for RunOptions {
    fn from(args: &RunArgs) -> Self {
        RunOptions {
            only_new: args.only_new,
            skip_crawl: args.skip_crawl,
            mocked: args.mocked,
            find_all: args.find_all,
            limit_outlets: args.limit_outlets,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Crawl both shops and run the saved queries (default).
    Run,
    /// Apply schema migrations and repair stored documents.
    Migrate,
    /// Delete postings inactive for longer than the given age.
    Cleanup {
        #[arg(long, default_value_t = 30)]
        older_than_days: u32,
    },
    /// Delete every stored posting.
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

fn log_file_path() -> PathBuf {
    PathBuf::from(format!(
        "/tmp/fundgrube-{}.txt",
        Utc::now().format("%Y-%m-%dT%H-%M-%S")
    ))
}

fn init_logging(log_to_file: bool) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if !log_to_file {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    let path = log_file_path();
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(Some(path))
}

async fn execute(
    command: Commands,
    run: &RunArgs,
    config: &SyncConfig,
    dispatcher: Arc<dyn AlertDispatcher>,
) -> Result<()> {
    match command {
        Commands::Run => {
            let pipeline = SyncPipeline::from_config(config, run.into(), dispatcher).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} shops={} postings={} inserted={} updated={} deactivated={} queries={} deals={} alerts={}",
                summary.run_id,
                summary.shops_crawled,
                summary.crawl.postings,
                summary.crawl.inserted,
                summary.crawl.updated,
                summary.crawl.deactivated,
                summary.queries_run,
                summary.deals_found,
                summary.alerts_sent
            );
        }
        Commands::Migrate => {
            let store = connect_store(&config.database_url).await?;
            let report = store.migrate().await?;
            println!(
                "migrate complete: backend={} schema_version={} documents_repaired={}",
                store.backend(),
                report
                    .schema_version
                    .map_or_else(|| "none".to_string(), |v| v.to_string()),
                report.documents_repaired
            );
        }
        Commands::Cleanup { older_than_days } => {
            let cutoff = fundgrube_core::now() - chrono::Duration::days(i64::from(older_than_days));
            let store = connect_store(&config.database_url).await?;
            let purged = store.purge_inactive(cutoff).await?;
            info!(%cutoff, purged, "purged inactive postings");
            println!("cleanup complete: purged={purged}");
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("refusing to delete all postings without --yes");
            }
            let store = connect_store(&config.database_url).await?;
            let deleted = store.delete_all_postings().await?;
            println!("reset complete: deleted={deleted}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_file = init_logging(cli.log_to_file)?;
    let config = SyncConfig::from_env();
    let dispatcher: Arc<dyn AlertDispatcher> = Arc::from(dispatcher_for(config.smtp.as_ref())?);

    let command = cli.command.clone().unwrap_or(Commands::Run);
    let result = execute(command, &cli.run, &config, dispatcher.clone()).await;

    if let Err(err) = &result {
        error!("{err:#}");
        let log = log_file.as_ref().and_then(|path| std::fs::read(path).ok());
        let (subject, body) = failure_alert(err, log.as_deref());
        if let Err(alert_err) = dispatcher.dispatch(&subject, &body).await {
            error!("failure alert could not be sent: {alert_err}");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_runs_with_flags() {
        let cli = Cli::try_parse_from(["fundgrube", "--only-new", "--limit-outlets"]).unwrap();
        assert!(cli.command.is_none());
        let options = RunOptions::from(&cli.run);
        assert!(options.only_new && options.limit_outlets);
        assert!(!options.mocked);
    }

    #[test]
    fn maintenance_subcommands() {
        let cli = Cli::try_parse_from(["fundgrube", "cleanup", "--older-than-days", "7"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Cleanup { older_than_days: 7 })));

        let cli = Cli::try_parse_from(["fundgrube", "reset"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Reset { yes: false })));

        let cli = Cli::try_parse_from(["fundgrube", "migrate", "--log-to-file"]).unwrap();
        assert!(cli.log_to_file);
    }

    #[test]
    fn log_file_lives_in_tmp() {
        let path = log_file_path();
        assert!(path.starts_with("/tmp"));
        assert!(path.to_string_lossy().ends_with(".txt"));
    }
}
