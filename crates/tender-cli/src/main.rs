use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tender_core::PortalConfig;
use tender_driver::scripted::{Script, ScriptedBrowser};
use tender_engine::classify::{CachedClassifier, HttpClassifier};
use tender_engine::config::{load_portal_registry, portal_by_id, EngineConfig};
use tender_engine::orchestrator::{Orchestrator, WorkerExit, WorkerHandle, WorkerLauncher};
use tender_engine::worker::run_worker;
use tender_store::Store;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "tender-cli")]
#[command(about = "Multi-portal tender crawler")]
struct Cli {
    /// Portal registry YAML; the built-in production set when omitted.
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
    /// Scripted site fixture (JSON) to crawl instead of a live browser.
    /// Falls back to the TENDER_FIXTURES environment variable.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every portal, one worker process each.
    Run {
        /// Restrict the run to these portal ids.
        #[arg(long = "portal")]
        portals: Vec<String>,
    },
    /// Crawl a single portal in this process. Spawned by `run`.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        portal: String,
    },
    /// Print per-portal record counts and the last run of each portal.
    Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let portals = load_portal_registry(cli.registry.as_deref())?;
    let fixtures = cli
        .fixtures
        .clone()
        .or_else(|| std::env::var_os("TENDER_FIXTURES").map(PathBuf::from));

    match cli.command.unwrap_or(Commands::Run { portals: vec![] }) {
        Commands::Run { portals: selected } => {
            let portals = select_portals(portals, &selected)?;
            let launcher = ProcessLauncher {
                registry: cli.registry.clone(),
                fixtures: fixtures.clone(),
            };
            let summary = Orchestrator::new(config.stagger_delay)
                .run(&launcher, &portals)
                .await;

            for portal in &summary.portals {
                let status = match portal.exit {
                    WorkerExit::Completed => "completed".to_string(),
                    WorkerExit::Failed { code } => format!("failed (exit {code:?})"),
                };
                println!(
                    "{:<6} {:<28} {} in {:?}",
                    portal.portal_id, portal.display_name, status, portal.duration
                );
            }
            println!(
                "run finished: {} completed, {} failed, took {:?}",
                summary.completed(),
                summary.failed(),
                summary.total_duration
            );
            if !summary.all_completed() {
                std::process::exit(1);
            }
        }
        Commands::Worker { portal } => {
            let portal = portal_by_id(&portals, &portal)?;
            let report = run_portal_worker(&config, &portal, fixtures.as_deref()).await?;
            if !report.outcome.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Report => {
            let store = Store::open(&config.database_path).await?;
            for portal in &portals {
                print_portal_report(&store, portal).await?;
            }
        }
    }

    Ok(())
}

fn select_portals(portals: Vec<PortalConfig>, selected: &[String]) -> Result<Vec<PortalConfig>> {
    if selected.is_empty() {
        return Ok(portals);
    }
    selected
        .iter()
        .map(|id| portal_by_id(&portals, id))
        .collect()
}

async fn run_portal_worker(
    config: &EngineConfig,
    portal: &PortalConfig,
    fixtures: Option<&std::path::Path>,
) -> Result<tender_engine::worker::WorkerReport> {
    let Some(fixtures) = fixtures else {
        bail!(
            "no browser fixture configured; pass --fixtures or set TENDER_FIXTURES \
             (live browser bindings plug in via the tender-driver traits)"
        );
    };
    let script = Script::from_json_file(fixtures)
        .with_context(|| format!("loading fixture {}", fixtures.display()))?;
    let browser = ScriptedBrowser::new(script);

    let store = Store::open(&config.database_path).await?;
    let classifier = config
        .classifier
        .clone()
        .map(|c| CachedClassifier::new(Box::new(HttpClassifier::new(c))));
    if classifier.is_none() {
        info!(portal = %portal.portal_id, "classifier not configured, skipping classification");
    }

    run_worker(config, portal, &store, &browser, classifier.as_ref()).await
}

async fn print_portal_report(store: &Store, portal: &PortalConfig) -> Result<()> {
    let stats = store.portal_statistics(&portal.portal_id).await?;
    let failures = store.failure_count(&portal.portal_id).await?;
    println!("{} ({})", portal.display_name, portal.portal_id);
    println!(
        "  records: {} total, {} kept, {} rejected, {} unclassified",
        stats.total, stats.kept, stats.rejected, stats.unclassified
    );
    println!(
        "  details: {} enriched, {} failed, {} pending, {} open failures",
        stats.enrich_success, stats.enrich_failed, stats.enrich_pending, failures
    );
    match store.latest_execution(&portal.portal_id).await? {
        Some(run) => println!(
            "  last run: {} at {} ({} pages)",
            run.outcome,
            run.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.pages_traversed
        ),
        None => println!("  last run: never"),
    }
    Ok(())
}

/// Spawns `tender-cli worker --portal <id>` per portal, so a crashed crawl
/// takes down only its own process.
struct ProcessLauncher {
    registry: Option<PathBuf>,
    fixtures: Option<PathBuf>,
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, portal: &PortalConfig) -> Result<Box<dyn WorkerHandle>> {
        let exe = std::env::current_exe().context("resolving worker executable")?;
        let mut command = tokio::process::Command::new(exe);
        command.arg("worker").arg("--portal").arg(&portal.portal_id);
        if let Some(registry) = &self.registry {
            command.arg("--registry").arg(registry);
        }
        if let Some(fixtures) = &self.fixtures {
            command.arg("--fixtures").arg(fixtures);
        }
        let child = command
            .spawn()
            .with_context(|| format!("spawning worker for {}", portal.portal_id))?;
        Ok(Box::new(ProcessHandle { child }))
    }
}

struct ProcessHandle {
    child: tokio::process::Child,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    async fn wait(&mut self) -> Result<WorkerExit> {
        let status = self.child.wait().await.context("waiting on worker process")?;
        Ok(if status.success() {
            WorkerExit::Completed
        } else {
            WorkerExit::Failed {
                code: status.code(),
            }
        })
    }
}
