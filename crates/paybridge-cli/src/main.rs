use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use paybridge_core::{ExternalId, SyncRunReport};
use paybridge_source::{RecordSource, RecordSourceClient};
use paybridge_sync::{
    maybe_build_scheduler, rate_table_for, run_epp_backfill, run_payment_recalculation,
    run_payment_sync, write_run_report, BridgeConfig, BridgeStore, PgStore, ProgressTracker,
    SyncOptions,
};
use paybridge_web::AppState;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "paybridge-cli")]
#[command(about = "PayBridge command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web trigger surface (and the scheduler when enabled).
    Serve,
    /// Run one payment sync pass over the saved id list.
    Sync {
        /// Clear the id list after a successful run.
        #[arg(long)]
        clear_list: bool,
    },
    /// Backfill missing EPP costs.
    Backfill,
    /// Recalculate invoice payment state from current payments.
    Recalculate,
    /// Replace the saved sync id list with a comma-separated set of ids.
    SaveList {
        #[arg(long)]
        ids: String,
    },
    /// List recorded sync problems, or clear them.
    Problems {
        #[arg(long)]
        clear: bool,
        #[arg(long)]
        clear_id: Option<String>,
    },
    /// Page through a source collection and save its ids as the sync list.
    PullIds {
        #[arg(long, default_value = "payment")]
        object_type: String,
        #[arg(long, default_value_t = 100)]
        page_limit: usize,
    },
    /// Apply database migrations.
    Migrate,
}

struct Runtime {
    config: BridgeConfig,
    store: Arc<PgStore>,
    client: Arc<RecordSourceClient>,
}

impl Runtime {
    async fn connect() -> Result<Self> {
        let config = BridgeConfig::from_env();
        let store = Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .context("connecting to the database")?,
        );
        let client = Arc::new(
            RecordSourceClient::new(config.source_client_config())
                .context("building the source client")?,
        );
        Ok(Self {
            config,
            store,
            client,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let rt = Runtime::connect().await?;
            let tracker = ProgressTracker::new();
            let rates = rate_table_for(&rt.config)?;
            let store: Arc<dyn BridgeStore> = rt.store.clone();
            let source: Arc<dyn RecordSource> = rt.client.clone();

            if let Some(scheduler) =
                maybe_build_scheduler(&rt.config, source.clone(), store.clone(), tracker.clone())
                    .await?
            {
                scheduler.start().await.context("starting scheduler")?;
            }

            let state = AppState::new(
                store,
                source,
                tracker,
                rates,
                rt.config.reports_dir.clone(),
            );
            paybridge_web::serve(state, rt.config.web_port).await?;
        }
        Commands::Sync { clear_list } => {
            let rt = Runtime::connect().await?;
            let tracker = ProgressTracker::new();
            let session_id = format!("cli-{}", Uuid::new_v4());
            let options = SyncOptions {
                clear_list_after: clear_list,
                ..Default::default()
            };
            let started_at = Utc::now();
            let summary = run_payment_sync(
                rt.client.as_ref(),
                rt.store.as_ref(),
                &tracker,
                &session_id,
                &options,
            )
            .await?;
            println!(
                "sync complete: session={} updated={} skipped={} errored={}",
                session_id, summary.updated, summary.skipped, summary.errored
            );
            for problem in &summary.problems {
                println!("  problem {}: {}", problem.id, problem.reason);
            }
            if let Some(reports_dir) = &rt.config.reports_dir {
                let report = SyncRunReport {
                    run_id: Uuid::new_v4(),
                    session_id,
                    started_at,
                    finished_at: Utc::now(),
                    summary,
                };
                let path = write_run_report(reports_dir, &report).await?;
                println!("report written to {}", path.display());
            }
        }
        Commands::Backfill => {
            let rt = Runtime::connect().await?;
            let rates = rate_table_for(&rt.config)?;
            let summary = run_epp_backfill(rt.store.as_ref(), &rates).await?;
            println!(
                "backfill complete: updated={} skipped={} errors={}",
                summary.updated, summary.skipped, summary.errors
            );
            for skip in &summary.skips {
                println!("  skipped {}: {}", skip.id, skip.reason);
            }
        }
        Commands::Recalculate => {
            let rt = Runtime::connect().await?;
            let summary = run_payment_recalculation(rt.store.as_ref()).await?;
            println!(
                "recalculation complete: invoices={} updated={} errors={}",
                summary.invoices, summary.updated, summary.errors
            );
        }
        Commands::SaveList { ids } => {
            let rt = Runtime::connect().await?;
            let ids: Vec<ExternalId> = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ExternalId::from)
                .collect();
            anyhow::ensure!(!ids.is_empty(), "no ids supplied");
            rt.store.save_id_list(&ids).await?;
            println!("saved {} ids", ids.len());
        }
        Commands::Problems { clear, clear_id } => {
            let rt = Runtime::connect().await?;
            if clear {
                rt.store.clear_problems().await?;
                println!("problem list cleared");
            } else if let Some(id) = clear_id {
                rt.store.clear_problem(&ExternalId::from(id.as_str())).await?;
                println!("cleared problem entry for {id}");
            } else {
                let problems = rt.store.list_problems().await?;
                if problems.is_empty() {
                    println!("no sync problems recorded");
                }
                for problem in problems {
                    println!(
                        "{}  {}  {}",
                        problem.recorded_at.to_rfc3339(),
                        problem.id,
                        problem.reason
                    );
                }
            }
        }
        Commands::PullIds {
            object_type,
            page_limit,
        } => {
            let rt = Runtime::connect().await?;
            let results = rt
                .client
                .fetch_all_results(&object_type, page_limit)
                .await
                .context("paging the source collection")?;
            let ids = paybridge_records::extract_ids(&results);
            anyhow::ensure!(!ids.is_empty(), "source returned no ids for {object_type}");
            rt.store.save_id_list(&ids).await?;
            println!("saved {} {} ids from the source", ids.len(), object_type);
        }
        Commands::Migrate => {
            let rt = Runtime::connect().await?;
            rt.store.run_migrations().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
