use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use synd_publish::{
    ensure_persisted, report_recent_runs_markdown, write_run_report, DraftSaver, ListingDocument,
    PublishConfig, PublishEvent, PublishOrchestrator, PublishRequest, SharedSession,
};
use synd_storage::PgRecordStore;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "synd-cli")]
#[command(about = "Listing syndication command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the editing API.
    Serve {
        #[arg(long)]
        listing: Option<PathBuf>,
        /// Send to target endpoints instead of the outbox.
        #[arg(long)]
        live: bool,
    },
    /// Print per-target readiness for a listing.
    Validate {
        #[arg(long)]
        listing: PathBuf,
        /// Also check targets the listing has not selected yet.
        #[arg(long)]
        all: bool,
    },
    /// Save the listing, then publish it to its selected targets.
    Publish {
        #[arg(long)]
        listing: PathBuf,
        /// Only these targets (comma separated).
        #[arg(long, value_delimiter = ',')]
        targets: Vec<String>,
        #[arg(long)]
        live: bool,
    },
    /// Summarise recent publish runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Create the draft table in postgres.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PublishConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve {
        listing: None,
        live: false,
    }) {
        Commands::Serve { listing, live } => {
            synd_web::serve(config, listing.as_deref(), live).await?;
        }
        Commands::Validate { listing, all } => validate(&config, listing, all)?,
        Commands::Publish {
            listing,
            targets,
            live,
        } => publish(&config, listing, targets, live).await?,
        Commands::Report { runs } => {
            println!("{}", report_recent_runs_markdown(&config.reports_dir, runs)?);
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to migrate")?;
            let store = PgRecordStore::connect(url).await?;
            store.ensure_schema().await?;
            info!("listing_drafts schema ready");
            println!("migrate complete");
        }
    }

    Ok(())
}

fn validate(config: &PublishConfig, listing: PathBuf, all: bool) -> Result<()> {
    let registry = config.load_registry()?;
    let mut session = ListingDocument::load(&listing)?.into_session(registry.catalog().clone())?;
    if all {
        for id in registry.catalog().ids() {
            session.select_target(&id)?;
        }
    }

    for profile in session.profiles().iter() {
        let v = profile.validation();
        println!(
            "{:<24} {:<8} score={:>3}",
            profile.target_id,
            if v.is_valid { "ready" } else { "blocked" },
            v.score
        );
        for err in &v.errors {
            println!("    error:   {err}");
        }
        for warning in &v.warnings {
            println!("    warning: {warning}");
        }
    }
    Ok(())
}

async fn publish(
    config: &PublishConfig,
    listing: PathBuf,
    targets: Vec<String>,
    live: bool,
) -> Result<()> {
    let registry = config.load_registry()?;
    let session = SharedSession::new(
        ListingDocument::load(&listing)?.into_session(registry.catalog().clone())?,
    );
    let store = config.open_record_store().await?;
    let saver = DraftSaver::new(session.clone(), store).await;
    let record_id = ensure_persisted(&saver).await?;
    info!(%record_id, listing = %listing.display(), "draft persisted before publish");

    let snapshot = session.snapshot().await;
    ListingDocument::from_session(&snapshot)
        .save(&listing)
        .await
        .context("recording draft id in listing")?;

    let subset = (!targets.is_empty()).then_some(targets);
    let request = PublishRequest::from_session(&snapshot, subset.as_deref())?;
    let orchestrator = PublishOrchestrator::new(
        config.target_client(registry, live)?,
        config.publish_options(),
    );
    let mut run = orchestrator.start(request)?;

    let cancel = run.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; remaining targets will be cancelled");
            cancel.cancel();
        }
    });

    println!("publishing record {record_id} (run {})", run.run_id);
    while let Some(event) = run.events.recv().await {
        match event {
            PublishEvent::Attempt(attempt) if attempt.status.is_terminal() => {
                println!(
                    "{:<24} {:<10} {}",
                    attempt.target_id,
                    attempt.status.as_str(),
                    attempt.message.unwrap_or_default()
                );
            }
            PublishEvent::Attempt(_) => {}
            PublishEvent::Finished(summary) => {
                let dir = write_run_report(&config.reports_dir, &summary).await?;
                println!(
                    "publish complete: succeeded={} failed={} cancelled={} report={}",
                    summary.succeeded,
                    summary.failed,
                    summary.cancelled,
                    dir.display()
                );
            }
        }
    }
    run.wait().await?;
    Ok(())
}
