mod config;
mod db;
mod driver;
mod interrupt;
mod phone;
mod pipeline;
mod pool;
mod retry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::driver::webdriver::WebDriverFactory;
use crate::driver::DriverFactory;
use crate::interrupt::InterruptRouter;
use crate::pipeline::{Pipeline, RunReport, Stage};

#[derive(Parser)]
#[command(
    name = "listing_phones",
    about = "Collect listing phone numbers from classifieds search results"
)]
struct Cli {
    /// Settings file (default: ./listing_phones.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pipeline stages (all five by default). Ctrl+C skips to the next stage.
    Run {
        /// Search results URL; remembered for later runs
        url: Option<String>,
        /// Stages to run, e.g. `--stages 3 4 5`
        #[arg(short, long, num_args = 1.., value_parser = clap::value_parser!(u8).range(1..=5))]
        stages: Vec<u8>,
        /// Cap on search result pages
        #[arg(long)]
        max_pages: Option<usize>,
        /// Concurrent browsers for stage 1
        #[arg(long)]
        workers_search: Option<usize>,
        /// Concurrent browsers for stage 3
        #[arg(long)]
        workers_details: Option<usize>,
    },
    /// Per-stage progress and last run status
    Status,
    /// Final records
    Show {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Forget one stage's output so it runs again from scratch
    Reset {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=5))]
        stage: u8,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            url,
            stages,
            max_pages,
            workers_search,
            workers_details,
        } => {
            if max_pages.is_some() {
                settings.search.max_pages = max_pages;
            }
            if let Some(n) = workers_search {
                settings.workers.search = n;
            }
            if let Some(n) = workers_details {
                settings.workers.details = n;
            }
            let stages: Vec<Stage> = if stages.is_empty() {
                Stage::ALL.to_vec()
            } else {
                stages.into_iter().filter_map(Stage::from_ordinal).collect()
            };

            let conn = db::connect(&settings.storage.db_path)?;
            let router = Arc::new(InterruptRouter::new());
            let _listener = router.listen();
            let drivers: Arc<dyn DriverFactory> = Arc::new(
                WebDriverFactory::new(settings.browser.clone())
                    .context("Failed to set up the webdriver client")?,
            );

            let report = Pipeline::new(&conn, &settings, Arc::clone(&router), drivers)
                .with_search_url(url)
                .run(&stages)
                .await;
            print_report(&report);

            if report.produced(Stage::Filter) {
                println!(
                    "Final records: {} in {} ({})",
                    db::artifact_count(&conn, Stage::Filter)?,
                    Stage::Filter.artifact_table(),
                    settings.storage.db_path.display()
                );
            }
            println!("\nPipeline completed in {}", format_duration(t0.elapsed()));

            if let Some(e) = report.error {
                return Err(anyhow::Error::new(e).context(format!("Run {} did not finish", report.run_id)));
            }
            Ok(())
        }
        Commands::Status => {
            let conn = db::connect(&settings.storage.db_path)?;
            if let Some(url) = db::get_meta(&conn, pipeline::SEARCH_URL_KEY)? {
                println!("Search URL: {}\n", url);
            }
            println!(
                "{:<19} | {:>9} | {:>9} | {:>8} | {:<19} | {:<19}",
                "Stage", "Rows", "Done", "Failed", "Last run", "Finished"
            );
            println!("{}", "-".repeat(96));
            for s in db::stage_stats(&conn)? {
                println!(
                    "{:<19} | {:>9} | {:>9} | {:>8} | {:<19} | {:<19}",
                    s.stage.to_string(),
                    s.artifact_rows,
                    s.completed_items,
                    s.failures,
                    s.last_status.as_deref().unwrap_or("-"),
                    s.last_finished.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        Commands::Show { limit } => {
            let conn = db::connect(&settings.storage.db_path)?;
            let rows = db::fetch_phones(&conn, Some(limit))?;
            if rows.is_empty() {
                println!("No records yet. Run stage 5 first.");
                return Ok(());
            }
            println!("{:>3} | {:<40} | {:<14} | {}", "#", "Title", "Phone", "Link");
            println!("{}", "-".repeat(110));
            for (i, r) in rows.iter().enumerate() {
                println!(
                    "{:>3} | {:<40} | {:<14} | {}",
                    i + 1,
                    truncate(&r.title, 40),
                    r.phone,
                    r.source_url
                );
            }
            println!("\n{} of {} records", rows.len(), db::artifact_count(&conn, Stage::Filter)?);
            Ok(())
        }
        Commands::Reset { stage } => {
            let stage = Stage::from_ordinal(stage).context("Stage must be 1-5")?;
            let conn = db::connect(&settings.storage.db_path)?;
            let removed = db::reset_stage(&conn, stage)?;
            println!("Cleared {} row(s) and the progress of {}", removed, stage);
            Ok(())
        }
    }
}

fn print_report(report: &RunReport) {
    println!(
        "\n{:<19} | {:<19} | {:>9} | {:>9} | {:>9} | {:>8} | {:>8}",
        "Stage", "Status", "Attempted", "Succeeded", "Exhausted", "Rejected", "Resumed"
    );
    println!("{}", "-".repeat(100));
    for o in &report.outcomes {
        let s = &o.summary;
        println!(
            "{:<19} | {:<19} | {:>9} | {:>9} | {:>9} | {:>8} | {:>8}",
            o.stage.to_string(),
            o.status.as_str(),
            s.attempted,
            s.succeeded,
            s.exhausted,
            s.rejected,
            s.resumed
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max - 3).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}
