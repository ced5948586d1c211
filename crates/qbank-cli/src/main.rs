use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use qbank_adapters::{extract_examples, load_batch, match_solutions, write_batch};
use qbank_storage::PgQuestionStore;
use qbank_sync::{open_store, run_reconciliation, QbankConfig, StoreBackend, TextMode};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "qbank")]
#[command(about = "Question bank maintenance tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sanitize examples and solutions from a batch and patch them into the store.
    Clean(ReconcileArgs),
    /// Patch examples and solutions from a batch into the store without cleaning.
    Populate(ReconcileArgs),
    /// Attach solution files to batch records by slug.
    MatchSolutions {
        #[arg(long, default_value = "qn_full.json")]
        input: PathBuf,
        #[arg(long, default_value = "questions_with_solutions.json")]
        output: PathBuf,
        #[arg(long, env = "QBANK_SOLUTIONS_DIR", default_value = "./solutions")]
        solutions_dir: PathBuf,
    },
    /// Fill batch examples from each record's problem HTML.
    ExtractExamples {
        #[arg(long, default_value = "qn_full.json")]
        input: PathBuf,
        #[arg(long, default_value = "qn_full_with_examples.json")]
        output: PathBuf,
    },
    /// Create the questions table in Postgres.
    Migrate,
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    #[arg(long, default_value = "qn_full_with_soln.json")]
    batch: PathBuf,
    /// json or postgres.
    #[arg(long, env = "QBANK_STORE")]
    store: Option<StoreBackend>,
    #[arg(long, env = "QBANK_STORE_PATH")]
    store_path: Option<PathBuf>,
    /// Skip writing run reports.
    #[arg(long)]
    no_reports: bool,
}

impl ReconcileArgs {
    fn apply(&self, config: &mut QbankConfig) {
        if let Some(backend) = self.store {
            config.store_backend = backend;
        }
        if let Some(path) = &self.store_path {
            config.store_path = path.clone();
        }
        if self.no_reports {
            config.write_reports = false;
        }
    }
}

async fn reconcile(args: ReconcileArgs, mode: TextMode) -> Result<()> {
    let mut config = QbankConfig::from_env()?;
    args.apply(&mut config);
    let store = open_store(&config).await?;
    let summary = run_reconciliation(&config, store, &args.batch, mode).await?;
    let report = &summary.report;
    println!(
        "reconcile complete: run_id={} mode={} updated={} skipped={} failed={}{}",
        report.run_id,
        report.mode,
        report.updated,
        report.skipped,
        report.failed,
        summary
            .reports_dir
            .as_ref()
            .map(|dir| format!(" reports={}", dir.display()))
            .unwrap_or_default()
    );
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Clean(args) => reconcile(args, TextMode::Sanitize).await?,
        Commands::Populate(args) => reconcile(args, TextMode::Raw).await?,
        Commands::MatchSolutions {
            input,
            output,
            solutions_dir,
        } => {
            let records = load_batch(&input)?;
            let (records, summary) = match_solutions(records, &solutions_dir)?;
            write_batch(&output, &records).await?;
            println!(
                "match complete: matched={} unmatched={} missing_slug={} output={}",
                summary.matched,
                summary.unmatched,
                summary.missing_slug,
                output.display()
            );
        }
        Commands::ExtractExamples { input, output } => {
            let records = load_batch(&input)?;
            let (records, summary) = extract_examples(records);
            write_batch(&output, &records).await?;
            println!(
                "extract complete: records={} examples={} without_content={} output={}",
                summary.extracted,
                summary.examples,
                summary.without_content,
                output.display()
            );
        }
        Commands::Migrate => {
            let config = QbankConfig::from_env()?;
            if config.store_backend != StoreBackend::Postgres {
                bail!("migrate only applies to the postgres store; set QBANK_STORE=postgres");
            }
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set")?;
            let store = PgQuestionStore::connect(url).await?;
            store.migrate().await?;
            info!("questions table ready");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(rust_log))
        .with_target(false)
        .init();

    run(Cli::parse()).await
}
