//! One portal, one worker: run the full phase pipeline and always leave an
//! execution log row behind, whatever happened.

use anyhow::{Context, Result};
use chrono::Utc;
use tender_core::PortalConfig;
use tender_driver::{Browser, Page};
use tender_store::{ExecutionLogEntry, Store};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::classify::CachedClassifier;
use crate::config::EngineConfig;
use crate::phases::{self, ClassifyStats, EnrichStats, ExtractStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Success,
    Failed { error: String },
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub portal_id: String,
    pub run_id: Uuid,
    pub outcome: WorkerOutcome,
    pub extract: ExtractStats,
    pub classify: ClassifyStats,
    pub enrich: EnrichStats,
}

/// Run extract, classify, enrich for one portal. Pipeline errors are caught at
/// this boundary and turned into a failed report; the caller decides the exit
/// code. Exactly one execution log row is written either way.
pub async fn run_worker(
    config: &EngineConfig,
    portal: &PortalConfig,
    store: &Store,
    browser: &dyn Browser,
    classifier: Option<&CachedClassifier>,
) -> Result<WorkerReport> {
    let run_id = Uuid::new_v4();
    let span = info_span!("worker", portal = %portal.portal_id, run = %run_id);
    async {
        let started_at = Utc::now();
        info!(portal = %portal.display_name, "worker starting");

        let mut report = WorkerReport {
            portal_id: portal.portal_id.clone(),
            run_id,
            outcome: WorkerOutcome::Success,
            extract: ExtractStats::default(),
            classify: ClassifyStats::default(),
            enrich: EnrichStats::default(),
        };

        match run_pipeline(config, portal, store, browser, classifier).await {
            Ok((extract, classify, enrich)) => {
                report.extract = extract;
                report.classify = classify;
                report.enrich = enrich;
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "worker pipeline failed");
                report.outcome = WorkerOutcome::Failed {
                    error: format!("{err:#}"),
                };
            }
        }

        let finished_at = Utc::now();
        let snapshot = store
            .portal_statistics(&portal.portal_id)
            .await
            .context("reading portal statistics for the execution log")?;
        // Pages walked by this run only; a rerun that skips a completed
        // extract phase logs zero, not the previous run's count.
        let pages_traversed = i64::from(report.extract.pages);

        let error_text = match &report.outcome {
            WorkerOutcome::Success => None,
            WorkerOutcome::Failed { error } => Some(error.clone()),
        };
        store
            .append_execution_log(&ExecutionLogEntry {
                portal_id: portal.portal_id.clone(),
                run_id,
                started_at,
                finished_at,
                outcome: report.outcome.label().to_string(),
                total_records: snapshot.total,
                kept: snapshot.kept,
                rejected: snapshot.rejected,
                unclassified: snapshot.unclassified,
                enrich_success: snapshot.enrich_success,
                enrich_failed: snapshot.enrich_failed,
                pages_traversed,
                error_text,
            })
            .await?;

        info!(
            outcome = report.outcome.label(),
            total = snapshot.total,
            kept = snapshot.kept,
            "worker finished"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

async fn run_pipeline(
    config: &EngineConfig,
    portal: &PortalConfig,
    store: &Store,
    browser: &dyn Browser,
    classifier: Option<&CachedClassifier>,
) -> Result<(ExtractStats, ClassifyStats, EnrichStats)> {
    let run_date = Utc::now().format("%Y-%m-%d").to_string();

    let mut page = browser.new_page().await.context("opening listing page")?;
    let extract = phases::run_extract(store, &mut *page, portal, config, &run_date).await?;
    if let Err(err) = page.close().await {
        info!(error = %err, "listing page close failed");
    }

    let classify = match classifier {
        Some(classifier) => phases::run_classify(store, classifier, portal, config).await?,
        None => {
            info!("no classifier configured, records stay unclassified");
            ClassifyStats::default()
        }
    };

    let enrich = phases::run_enrich(store, browser, portal, config).await?;
    Ok((extract, classify, enrich))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use tender_driver::scripted::{ElementScript, PageScript, Script, ScriptedBrowser};

    use crate::pagination::{listing_url, ROW_SELECTOR};

    fn portal() -> PortalConfig {
        PortalConfig {
            portal_id: "WB".into(),
            display_name: "West Bengal".into(),
            base_url: "https://portal.invalid".into(),
            portal_url: "https://portal.invalid/app".into(),
            pre_step: None,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            pagination_delay: Duration::from_millis(1),
            detail_delay: Duration::from_millis(1),
            stale_retry_delay: Duration::from_millis(1),
            ..EngineConfig::default()
        }
    }

    fn site(portal: &PortalConfig) -> Script {
        let row = ElementScript::default().children(
            "td",
            vec![
                ElementScript::with_text("1"),
                ElementScript::with_text("18-Aug-2026"),
                ElementScript::with_text("22-Aug-2026"),
                ElementScript::with_text("23-Aug-2026"),
                ElementScript::with_text("Road resurfacing\nREF-1").child(
                    "a",
                    ElementScript::with_text("Road resurfacing").attr("href", "/view?t=1"),
                ),
                ElementScript::with_text("PWD||Roads"),
            ],
        );
        Script::default()
            .with_page(&portal.portal_url, PageScript::default())
            .with_page(
                listing_url(portal),
                PageScript {
                    elements: HashMap::from([(ROW_SELECTOR.to_string(), vec![row])]),
                    ..PageScript::default()
                },
            )
            .with_page(
                "https://portal.invalid/view?t=1",
                PageScript {
                    texts: HashMap::from([(
                        crate::enrich::DETAIL_PRIMARY_SELECTOR.to_string(),
                        "Resurfacing of NH-34".to_string(),
                    )]),
                    ..PageScript::default()
                },
            )
    }

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("tenders.db")).await.expect("store");
        (dir, store)
    }

    #[tokio::test]
    async fn full_pipeline_logs_a_success_row() {
        let portal = portal();
        let (_dir, store) = open_store().await;
        let browser = ScriptedBrowser::new(site(&portal));

        let report = run_worker(&config(), &portal, &store, &browser, None)
            .await
            .expect("worker");
        assert!(report.outcome.is_success());
        assert_eq!(report.extract.inserted, 1);
        assert_eq!(report.enrich.success, 1);

        let logged = store
            .latest_execution("WB")
            .await
            .expect("log")
            .expect("one row");
        assert_eq!(logged.outcome, "success");
        assert_eq!(logged.run_id, report.run_id);
        assert_eq!(logged.total_records, 1);
        assert_eq!(logged.pages_traversed, 1);
        assert_eq!(logged.enrich_success, 1);
        assert!(logged.error_text.is_none());
    }

    #[tokio::test]
    async fn pipeline_failure_still_logs_and_reports() {
        let portal = portal();
        let (_dir, store) = open_store().await;
        // Nothing scripted: even the portal root is unreachable.
        let browser = ScriptedBrowser::new(Script::default());

        let report = run_worker(&config(), &portal, &store, &browser, None)
            .await
            .expect("worker returns a report, not an error");
        assert!(!report.outcome.is_success());

        let logged = store
            .latest_execution("WB")
            .await
            .expect("log")
            .expect("one row");
        assert_eq!(logged.outcome, "failed");
        assert!(logged.error_text.is_some());
        assert_eq!(logged.pages_traversed, 0);
    }

    #[tokio::test]
    async fn rerun_after_success_is_idempotent() {
        let portal = portal();
        let (_dir, store) = open_store().await;
        let browser = ScriptedBrowser::new(site(&portal));

        run_worker(&config(), &portal, &store, &browser, None)
            .await
            .expect("first run");
        let report = run_worker(&config(), &portal, &store, &browser, None)
            .await
            .expect("second run");
        assert!(report.outcome.is_success());
        assert_eq!(report.extract.pages, 0);
        assert_eq!(report.enrich.success, 0);

        let snapshot = store.portal_statistics("WB").await.expect("stats");
        assert_eq!(snapshot.total, 1);

        // The second run's log row reports its own (empty) traversal, not the
        // first run's page count.
        let logged = store
            .latest_execution("WB")
            .await
            .expect("log")
            .expect("second row");
        assert_eq!(logged.run_id, report.run_id);
        assert_eq!(logged.pages_traversed, 0);
    }
}
