use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trialwatch_adapters::{CtgovClient, ExportHarvester, PlaywrightLauncher, WalkQuery};
use trialwatch_storage::{ArtifactSink, FsArtifactSink, HttpFetcher};
use trialwatch_sync::{
    invoke_harvest, HarvestScheduler, PgConnector, PipelineOrchestrator, RunLimits, TrialwatchConfig,
};

#[derive(Debug, Parser)]
#[command(name = "trialwatch")]
#[command(about = "Clinical trial ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk the ClinicalTrials.gov registry and upsert matching studies.
    Sync {
        #[arg(long)]
        condition: String,
        #[arg(long)]
        phase: Option<String>,
        /// Only keep studies changed on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,
        #[arg(long, default_value_t = 100)]
        max_records: usize,
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Download the EU CTIS export for one day (default: yesterday).
    Harvest {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Upsert the rows of a harvested export file.
    LoadExport {
        path: PathBuf,
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
    },
    /// Run one harvest and publish it, printing the invocation response.
    Invoke {
        #[arg(long)]
        event: Option<String>,
    },
    /// Run scheduled harvests until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn harvester(config: &TrialwatchConfig) -> Result<ExportHarvester<PlaywrightLauncher>> {
    let harvest_config = config.harvest().context("loading harvest configuration")?;
    let launcher = PlaywrightLauncher::new(config.node_bin.clone(), config.headless);
    Ok(ExportHarvester::new(launcher, harvest_config))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = TrialwatchConfig::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Sync {
            condition,
            phase,
            since,
            max_records,
            batch_size,
            page_size,
        } => {
            let http = HttpFetcher::new(config.http_client())?;
            let client = CtgovClient::new(http, config.ctg_endpoint.clone(), config.ctg_rps);
            let query = WalkQuery::new(condition)
                .with_phase(phase)
                .with_since(since.and_then(|d| d.and_hms_opt(0, 0, 0)).map(|dt| dt.and_utc()))
                .with_page_size(page_size.unwrap_or(config.ctg_page_size));
            let orchestrator = PipelineOrchestrator::new(PgConnector::new(config.database()?));

            let report = orchestrator
                .run(&client, query, RunLimits { max_records, batch_size })
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(err) = report.error {
                bail!("sync stopped early: {err}");
            }
        }
        Commands::Harvest { date } => {
            let harvester = harvester(&config)?;
            let artifact = match date {
                Some(date) => harvester.harvest_for(date).await?,
                None => harvester.harvest().await?,
            };
            println!(
                "harvest complete: path={} bytes={} sha256={}",
                artifact.path.display(),
                artifact.byte_size,
                artifact.content_hash
            );
        }
        Commands::LoadExport { path, batch_size } => {
            let orchestrator = PipelineOrchestrator::new(PgConnector::new(config.database()?));
            let limits = RunLimits {
                max_records: usize::MAX,
                batch_size,
            };
            let report = orchestrator.load_export(&path, limits).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Invoke { event } => {
            let event = match event {
                Some(raw) => serde_json::from_str(&raw).context("parsing --event as JSON")?,
                None => serde_json::json!({}),
            };
            let harvester = harvester(&config)?;
            let sink = FsArtifactSink::new(config.publish_dir.clone());
            let response = invoke_harvest(&harvester, &sink, event).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.status_code != 200 {
                bail!("harvest invocation failed");
            }
        }
        Commands::Schedule => {
            let harvester = Arc::new(harvester(&config)?);
            let sink: Arc<dyn ArtifactSink> = Arc::new(FsArtifactSink::new(config.publish_dir.clone()));
            let mut scheduler = HarvestScheduler::new(&config.harvest_cron, harvester, sink).await?;
            scheduler.start().await?;
            tracing::info!(cron = %config.harvest_cron, "harvest scheduler running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            scheduler.shutdown().await?;
        }
    }

    Ok(())
}
