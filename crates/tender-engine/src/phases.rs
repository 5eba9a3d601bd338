//! The three per-portal phases, each resumable through its persisted state.
//!
//! Phase order is strict: extract populates records, classify tags them, and
//! enrich fills in detail text. A phase that already reads `Complete` for the
//! current run is skipped, which is what makes re-running a crashed worker
//! safe and cheap.

use anyhow::{Context, Result};
use tender_core::{ExtractProgress, Phase, PhaseState, PortalConfig, TenderDraft};
use tender_driver::{Browser, Page};
use tender_store::{EnrichmentWrite, Store};
use tracing::{info, warn};

use crate::classify::CachedClassifier;
use crate::config::EngineConfig;
use crate::enrich::{fetch_detail, EnrichOutcome};
use crate::pagination::{enter_listing, extract_rows, inspect_next_control, NextControl, PageExtract};
use crate::retry::{navigate_with_retry, NavRetryPolicy, StaleRetryPolicy};

/// Audit checkpoint: highest listing page whose batch committed.
pub const LAST_PAGE_KEY: &str = "extract.last_page";

pub async fn load_phase(store: &Store, portal_id: &str, phase: Phase) -> Result<PhaseState> {
    let value = store.checkpoint_get(portal_id, phase.checkpoint_key()).await?;
    Ok(PhaseState::decode(value.as_deref()))
}

pub async fn save_phase(
    store: &Store,
    portal_id: &str,
    phase: Phase,
    state: &PhaseState,
) -> Result<()> {
    store
        .checkpoint_set(portal_id, phase.checkpoint_key(), &state.encode())
        .await
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractStats {
    pub pages: u32,
    pub rows_skipped: usize,
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyStats {
    pub examined: usize,
    pub kept: usize,
    pub rejected: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrichStats {
    pub success: usize,
    pub failed: usize,
}

/// Walk the listing from wherever the last run stopped, upserting every page's
/// rows before moving on. A page's batch commits before its successor URL is
/// checkpointed, so a crash never skips rows.
pub async fn run_extract(
    store: &Store,
    page: &mut dyn Page,
    portal: &PortalConfig,
    config: &EngineConfig,
    run_date: &str,
) -> Result<ExtractStats> {
    let mut stats = ExtractStats::default();
    let state = load_phase(store, &portal.portal_id, Phase::Extract).await?;
    if state.is_complete() {
        info!(portal = %portal.portal_id, "extract already complete, skipping");
        return Ok(stats);
    }

    let stale = StaleRetryPolicy {
        max_attempts: config.max_stale_retries,
        delay: config.stale_retry_delay,
    };
    let nav = NavRetryPolicy {
        max_attempts: config.max_navigation_retries,
        delay: config.stale_retry_delay,
    };

    let mut page_no = match state {
        PhaseState::InProgress {
            progress: Some(progress),
        } => {
            let Some(next_url) = progress.next_url else {
                // Last page committed but completion never got written.
                save_phase(store, &portal.portal_id, Phase::Extract, &PhaseState::Complete).await?;
                return Ok(stats);
            };
            info!(
                portal = %portal.portal_id,
                resume_page = progress.last_page + 1,
                "resuming extract mid-listing"
            );
            page.goto(&portal.portal_url, config.page_load_timeout)
                .await
                .context("re-establishing portal session")?;
            if navigate_with_retry(page, &next_url, config.page_load_timeout, &nav)
                .await
                .is_err()
            {
                warn!(portal = %portal.portal_id, url = %next_url, "resume target unreachable, closing extract");
                save_phase(store, &portal.portal_id, Phase::Extract, &PhaseState::Complete).await?;
                return Ok(stats);
            }
            progress.last_page + 1
        }
        _ => {
            save_phase(
                store,
                &portal.portal_id,
                Phase::Extract,
                &PhaseState::InProgress { progress: None },
            )
            .await?;
            enter_listing(page, portal, config.page_load_timeout)
                .await
                .context("entering tender listing")?;
            1
        }
    };

    loop {
        let extract = extract_page_rows(page, portal, run_date, &stale).await?;
        stats.rows_skipped += extract.skipped_rows;

        let batch: Vec<(String, TenderDraft)> = extract
            .drafts
            .into_iter()
            .map(|draft| (config.identity.hash(&draft), draft))
            .collect();
        let outcome = upsert_with_retry(store, &portal.portal_id, &batch, config).await?;
        stats.inserted += outcome.inserted;
        stats.updated += outcome.updated;
        stats.pages += 1;
        store
            .checkpoint_set(&portal.portal_id, LAST_PAGE_KEY, &page_no.to_string())
            .await?;
        info!(
            portal = %portal.portal_id,
            page = page_no,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "listing page committed"
        );

        let control = inspect_next(page, portal, &stale).await?;
        match control {
            NextControl::Available { next_url } => {
                save_phase(
                    store,
                    &portal.portal_id,
                    Phase::Extract,
                    &PhaseState::InProgress {
                        progress: Some(ExtractProgress {
                            last_page: page_no,
                            next_url: Some(next_url.clone()),
                        }),
                    },
                )
                .await?;
                tokio::time::sleep(config.pagination_delay).await;
                if navigate_with_retry(page, &next_url, config.page_load_timeout, &nav)
                    .await
                    .is_err()
                {
                    warn!(portal = %portal.portal_id, url = %next_url, "next page unreachable, closing extract");
                    break;
                }
                page_no += 1;
            }
            end => {
                info!(portal = %portal.portal_id, reason = end.reason(), "end of listing");
                break;
            }
        }
    }

    save_phase(store, &portal.portal_id, Phase::Extract, &PhaseState::Complete).await?;
    Ok(stats)
}

async fn extract_page_rows(
    page: &dyn Page,
    portal: &PortalConfig,
    run_date: &str,
    stale: &StaleRetryPolicy,
) -> Result<PageExtract> {
    let mut attempt = 1;
    loop {
        match extract_rows(page, portal, run_date).await {
            Ok(extract) => return Ok(extract),
            Err(err) if stale.should_retry(&err, attempt) => {
                warn!(portal = %portal.portal_id, attempt, "stale rows, re-querying");
                attempt += 1;
                tokio::time::sleep(stale.delay).await;
            }
            Err(err) => return Err(err).context("extracting listing rows"),
        }
    }
}

async fn inspect_next(
    page: &dyn Page,
    portal: &PortalConfig,
    stale: &StaleRetryPolicy,
) -> Result<NextControl> {
    let mut attempt = 1;
    loop {
        match inspect_next_control(page, portal).await {
            Ok(control) => return Ok(control),
            Err(err) if stale.should_retry(&err, attempt) => {
                warn!(portal = %portal.portal_id, attempt, "stale next control, re-querying");
                attempt += 1;
                tokio::time::sleep(stale.delay).await;
            }
            Err(err) => return Err(err).context("inspecting pagination control"),
        }
    }
}

async fn upsert_with_retry(
    store: &Store,
    portal_id: &str,
    batch: &[(String, TenderDraft)],
    config: &EngineConfig,
) -> Result<tender_store::UpsertOutcome> {
    let mut attempt = 1;
    loop {
        match store.upsert_batch(portal_id, batch).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if attempt < config.batch_upsert_attempts => {
                warn!(portal = %portal_id, attempt, error = %err, "batch upsert failed, retrying");
                attempt += 1;
                tokio::time::sleep(config.stale_retry_delay).await;
            }
            Err(err) => return Err(err).context("committing listing batch"),
        }
    }
}

/// Tag every unclassified record. One pass; verdicts missing from the
/// classifier response count as meaningful.
pub async fn run_classify(
    store: &Store,
    classifier: &CachedClassifier,
    portal: &PortalConfig,
    config: &EngineConfig,
) -> Result<ClassifyStats> {
    let mut stats = ClassifyStats::default();
    let state = load_phase(store, &portal.portal_id, Phase::Classify).await?;
    if state.is_complete() {
        info!(portal = %portal.portal_id, "classify already complete, skipping");
        return Ok(stats);
    }
    save_phase(
        store,
        &portal.portal_id,
        Phase::Classify,
        &PhaseState::InProgress { progress: None },
    )
    .await?;

    let pending = store.pending_classification(&portal.portal_id).await?;
    for chunk in pending.chunks(config.classify_batch_size.max(1)) {
        let titles: Vec<String> = chunk.iter().map(|p| p.title.clone()).collect();
        let verdicts = classifier.classify(&titles).await;

        let marks: Vec<_> = chunk
            .iter()
            .map(|p| {
                let meaningful = verdicts.get(&p.title).copied().unwrap_or(true);
                (p.identity_hash.clone(), config.keep_policy.verdict(meaningful))
            })
            .collect();
        for (_, state) in &marks {
            match state {
                tender_core::ClassifyState::Kept => stats.kept += 1,
                tender_core::ClassifyState::Rejected => stats.rejected += 1,
                tender_core::ClassifyState::Unclassified => {}
            }
        }
        stats.examined += marks.len();
        store.mark_classified(&portal.portal_id, &marks).await?;
    }

    save_phase(store, &portal.portal_id, Phase::Classify, &PhaseState::Complete).await?;
    info!(
        portal = %portal.portal_id,
        examined = stats.examined,
        kept = stats.kept,
        rejected = stats.rejected,
        "classification pass finished"
    );
    Ok(stats)
}

/// Fetch detail text for every record still waiting on it. Each result commits
/// individually; a crash mid-pass loses at most the in-flight record.
pub async fn run_enrich(
    store: &Store,
    browser: &dyn Browser,
    portal: &PortalConfig,
    config: &EngineConfig,
) -> Result<EnrichStats> {
    let mut stats = EnrichStats::default();
    let state = load_phase(store, &portal.portal_id, Phase::Enrich).await?;
    if state.is_complete() {
        info!(portal = %portal.portal_id, "enrich already complete, skipping");
        return Ok(stats);
    }
    save_phase(
        store,
        &portal.portal_id,
        Phase::Enrich,
        &PhaseState::InProgress { progress: None },
    )
    .await?;

    let targets = store.pending_enrichment(&portal.portal_id).await?;
    info!(portal = %portal.portal_id, pending = targets.len(), "starting enrichment pass");

    for (index, target) in targets.iter().enumerate() {
        if index > 0 && index % config.session_refresh_every.max(1) == 0 {
            refresh_session(browser, portal, config).await;
        }

        let outcome = fetch_detail(browser, &target.detail_url, config).await;
        let write = match outcome {
            EnrichOutcome::Success(detail_text) => {
                stats.success += 1;
                EnrichmentWrite::Success { detail_text }
            }
            other => {
                stats.failed += 1;
                EnrichmentWrite::Failure {
                    reason: other
                        .failure_reason()
                        .unwrap_or_else(|| "FETCH_ERROR: unknown".to_string()),
                }
            }
        };
        store
            .record_enrichment(&portal.portal_id, target, &write)
            .await?;
        tokio::time::sleep(config.detail_delay).await;
    }

    save_phase(store, &portal.portal_id, Phase::Enrich, &PhaseState::Complete).await?;
    info!(
        portal = %portal.portal_id,
        success = stats.success,
        failed = stats.failed,
        "enrichment pass finished"
    );
    Ok(stats)
}

/// Long detail runs expire the portal session; touching the root page renews
/// it. Best effort, a refresh failure only surfaces on the next fetch.
async fn refresh_session(browser: &dyn Browser, portal: &PortalConfig, config: &EngineConfig) {
    match browser.new_page().await {
        Ok(mut page) => {
            if let Err(err) = page.goto(&portal.portal_url, config.page_load_timeout).await {
                warn!(portal = %portal.portal_id, error = %err, "session refresh navigation failed");
            }
            if let Err(err) = page.close().await {
                warn!(portal = %portal.portal_id, error = %err, "session refresh page close failed");
            }
        }
        Err(err) => warn!(portal = %portal.portal_id, error = %err, "session refresh page open failed"),
    }
}
