//! Durable tender storage: identity-based upsert, checkpoints, failure ledger,
//! execution log. One SQLite file shared by all portal workers; every write is
//! a single bounded transaction so a killed worker never leaves partial state.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tender_core::{ClassifyState, EnrichStatus, TenderDraft, TenderRecord};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tender-store";

/// Statements applied idempotently at open. Workers from different portals
/// race on first open; IF NOT EXISTS makes that benign.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        portal_id TEXT NOT NULL,
        identity_hash TEXT NOT NULL,
        portal_source TEXT NOT NULL,
        sequence_no TEXT NOT NULL,
        published_date TEXT NOT NULL,
        closing_date TEXT NOT NULL,
        opening_date TEXT NOT NULL,
        title TEXT NOT NULL,
        org_chain TEXT NOT NULL,
        detail_url TEXT NOT NULL,
        run_date TEXT NOT NULL,
        detail_text TEXT,
        extract_status TEXT NOT NULL DEFAULT 'extracted',
        classify_state TEXT NOT NULL DEFAULT 'unclassified',
        enrich_status TEXT NOT NULL DEFAULT 'pending',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(portal_id, identity_hash)
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_classify
        ON records(portal_id, classify_state)",
    "CREATE INDEX IF NOT EXISTS idx_records_enrich
        ON records(portal_id, enrich_status)",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        portal_id TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY(portal_id, key)
    )",
    "CREATE TABLE IF NOT EXISTS failures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        portal_id TEXT NOT NULL,
        record_id INTEGER NOT NULL,
        detail_url TEXT NOT NULL,
        reason TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'failed',
        created_at TEXT NOT NULL,
        FOREIGN KEY(record_id) REFERENCES records(id)
    )",
    "CREATE TABLE IF NOT EXISTS execution_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        portal_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        outcome TEXT NOT NULL,
        total_records INTEGER NOT NULL,
        kept INTEGER NOT NULL,
        rejected INTEGER NOT NULL,
        unclassified INTEGER NOT NULL,
        enrich_success INTEGER NOT NULL,
        enrich_failed INTEGER NOT NULL,
        pages_traversed INTEGER NOT NULL,
        error_text TEXT
    )",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

/// Record slice the classify phase works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTitle {
    pub identity_hash: String,
    pub title: String,
}

/// Record slice the enrich phase works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichTarget {
    pub record_id: i64,
    pub identity_hash: String,
    pub detail_url: String,
}

/// What the enrich phase writes back for one record, atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentWrite {
    Success { detail_text: String },
    Failure { reason: String },
}

/// Per-portal aggregate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortalStatistics {
    pub total: i64,
    pub kept: i64,
    pub rejected: i64,
    pub unclassified: i64,
    pub enrich_success: i64,
    pub enrich_failed: i64,
    pub enrich_pending: i64,
    pub with_detail_url: i64,
}

/// One immutable summary row per worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLogEntry {
    pub portal_id: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: String,
    pub total_records: i64,
    pub kept: i64,
    pub rejected: i64,
    pub unclassified: i64,
    pub enrich_success: i64,
    pub enrich_failed: i64,
    pub pages_traversed: i64,
    pub error_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the shared store file. WAL plus a generous
    /// busy timeout lets one writer per portal coexist on a single file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening store at {}", path.as_ref().display()))?;

        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    async fn apply_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("applying store schema")?;
        }
        debug!(statements = SCHEMA.len(), "store schema applied");
        Ok(())
    }

    /// Insert-or-refresh one page's batch inside a single transaction.
    ///
    /// Existing rows (matched on `(portal_id, identity_hash)`) get their source
    /// fields overwritten and `updated_at` bumped; classification, enrichment
    /// state and detail text are never touched by re-extraction. Any failure
    /// rolls the whole batch back, so the caller can retry it unchanged.
    pub async fn upsert_batch(
        &self,
        portal_id: &str,
        batch: &[(String, TenderDraft)],
    ) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let mut outcome = UpsertOutcome::default();
        let mut tx = self.pool.begin().await.context("beginning upsert batch")?;

        for (identity_hash, draft) in batch {
            let existing: Option<i64> =
                sqlx::query_scalar("SELECT id FROM records WHERE portal_id = ? AND identity_hash = ?")
                    .bind(portal_id)
                    .bind(identity_hash)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("looking up existing record")?;

            if existing.is_some() {
                sqlx::query(
                    "UPDATE records SET
                        portal_source = ?, sequence_no = ?, published_date = ?,
                        closing_date = ?, opening_date = ?, title = ?, org_chain = ?,
                        detail_url = ?, run_date = ?, updated_at = ?
                     WHERE portal_id = ? AND identity_hash = ?",
                )
                .bind(&draft.portal_source)
                .bind(&draft.sequence_no)
                .bind(&draft.published_date)
                .bind(&draft.closing_date)
                .bind(&draft.opening_date)
                .bind(&draft.title)
                .bind(&draft.org_chain)
                .bind(&draft.detail_url)
                .bind(&draft.run_date)
                .bind(now)
                .bind(portal_id)
                .bind(identity_hash)
                .execute(&mut *tx)
                .await
                .context("updating existing record")?;
                outcome.updated += 1;
            } else {
                sqlx::query(
                    "INSERT INTO records (
                        portal_id, identity_hash, portal_source, sequence_no,
                        published_date, closing_date, opening_date, title, org_chain,
                        detail_url, run_date, classify_state, enrich_status,
                        created_at, updated_at
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'unclassified', 'pending', ?, ?)",
                )
                .bind(portal_id)
                .bind(identity_hash)
                .bind(&draft.portal_source)
                .bind(&draft.sequence_no)
                .bind(&draft.published_date)
                .bind(&draft.closing_date)
                .bind(&draft.opening_date)
                .bind(&draft.title)
                .bind(&draft.org_chain)
                .bind(&draft.detail_url)
                .bind(&draft.run_date)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("inserting new record")?;
                outcome.inserted += 1;
            }
        }

        tx.commit().await.context("committing upsert batch")?;
        debug!(
            portal_id,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "upsert batch committed"
        );
        Ok(outcome)
    }

    pub async fn checkpoint_get(&self, portal_id: &str, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM checkpoints WHERE portal_id = ? AND key = ?")
            .bind(portal_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading checkpoint {key} for {portal_id}"))
    }

    /// Last-write-wins per `(portal_id, key)`.
    pub async fn checkpoint_set(&self, portal_id: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (portal_id, key, value, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(portal_id, key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(portal_id)
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing checkpoint {key} for {portal_id}"))?;
        Ok(())
    }

    /// Records still awaiting a classification verdict.
    pub async fn pending_classification(&self, portal_id: &str) -> Result<Vec<PendingTitle>> {
        let rows = sqlx::query(
            "SELECT identity_hash, title FROM records
             WHERE portal_id = ? AND classify_state = 'unclassified'
             ORDER BY id",
        )
        .bind(portal_id)
        .fetch_all(&self.pool)
        .await
        .context("querying records pending classification")?;

        Ok(rows
            .into_iter()
            .map(|row| PendingTitle {
                identity_hash: row.get("identity_hash"),
                title: row.get("title"),
            })
            .collect())
    }

    pub async fn mark_classified(
        &self,
        portal_id: &str,
        verdicts: &[(String, ClassifyState)],
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("beginning classify batch")?;
        for (identity_hash, state) in verdicts {
            sqlx::query(
                "UPDATE records SET classify_state = ?, updated_at = ?
                 WHERE portal_id = ? AND identity_hash = ?",
            )
            .bind(state.as_str())
            .bind(now)
            .bind(portal_id)
            .bind(identity_hash)
            .execute(&mut *tx)
            .await
            .context("writing classification verdict")?;
        }
        tx.commit().await.context("committing classify batch")?;
        Ok(())
    }

    /// Records eligible for enrichment: navigable URL, never enriched or
    /// previously failed.
    pub async fn pending_enrichment(&self, portal_id: &str) -> Result<Vec<EnrichTarget>> {
        let rows = sqlx::query(
            "SELECT id, identity_hash, detail_url FROM records
             WHERE portal_id = ?
               AND detail_url != ''
               AND enrich_status IN ('pending', 'failed')
             ORDER BY id",
        )
        .bind(portal_id)
        .fetch_all(&self.pool)
        .await
        .context("querying records pending enrichment")?;

        Ok(rows
            .into_iter()
            .map(|row| EnrichTarget {
                record_id: row.get("id"),
                identity_hash: row.get("identity_hash"),
                detail_url: row.get("detail_url"),
            })
            .collect())
    }

    /// Persist one enrichment outcome atomically with the record. Failures also
    /// land in the failure ledger with a running retry count; the ledger is
    /// diagnostic, nothing drains it.
    pub async fn record_enrichment(
        &self,
        portal_id: &str,
        target: &EnrichTarget,
        write: &EnrichmentWrite,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("beginning enrichment write")?;

        match write {
            EnrichmentWrite::Success { detail_text } => {
                sqlx::query(
                    "UPDATE records SET detail_text = ?, enrich_status = 'success', updated_at = ?
                     WHERE portal_id = ? AND identity_hash = ?",
                )
                .bind(detail_text)
                .bind(now)
                .bind(portal_id)
                .bind(&target.identity_hash)
                .execute(&mut *tx)
                .await
                .context("writing enrichment success")?;
            }
            EnrichmentWrite::Failure { reason } => {
                sqlx::query(
                    "UPDATE records SET enrich_status = 'failed', updated_at = ?
                     WHERE portal_id = ? AND identity_hash = ?",
                )
                .bind(now)
                .bind(portal_id)
                .bind(&target.identity_hash)
                .execute(&mut *tx)
                .await
                .context("writing enrichment failure")?;

                let prior: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM failures WHERE record_id = ?")
                        .bind(target.record_id)
                        .fetch_one(&mut *tx)
                        .await
                        .context("counting prior failures")?;
                sqlx::query(
                    "INSERT INTO failures (
                        portal_id, record_id, detail_url, reason, retry_count, status, created_at
                     ) VALUES (?, ?, ?, ?, ?, 'failed', ?)",
                )
                .bind(portal_id)
                .bind(target.record_id)
                .bind(&target.detail_url)
                .bind(reason)
                .bind(prior)
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("appending failure ledger entry")?;
            }
        }

        tx.commit().await.context("committing enrichment write")?;
        Ok(())
    }

    pub async fn failure_count(&self, portal_id: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM failures WHERE portal_id = ? AND status = 'failed'")
            .bind(portal_id)
            .fetch_one(&self.pool)
            .await
            .context("counting ledger failures")
    }

    pub async fn portal_statistics(&self, portal_id: &str) -> Result<PortalStatistics> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN classify_state = 'kept' THEN 1 ELSE 0 END), 0) AS kept,
                COALESCE(SUM(CASE WHEN classify_state = 'rejected' THEN 1 ELSE 0 END), 0) AS rejected,
                COALESCE(SUM(CASE WHEN classify_state = 'unclassified' THEN 1 ELSE 0 END), 0) AS unclassified,
                COALESCE(SUM(CASE WHEN enrich_status = 'success' THEN 1 ELSE 0 END), 0) AS enrich_success,
                COALESCE(SUM(CASE WHEN enrich_status = 'failed' THEN 1 ELSE 0 END), 0) AS enrich_failed,
                COALESCE(SUM(CASE WHEN detail_url != '' AND enrich_status = 'pending' THEN 1 ELSE 0 END), 0) AS enrich_pending,
                COALESCE(SUM(CASE WHEN detail_url != '' THEN 1 ELSE 0 END), 0) AS with_detail_url
             FROM records WHERE portal_id = ?",
        )
        .bind(portal_id)
        .fetch_one(&self.pool)
        .await
        .context("computing portal statistics")?;

        Ok(PortalStatistics {
            total: row.get("total"),
            kept: row.get("kept"),
            rejected: row.get("rejected"),
            unclassified: row.get("unclassified"),
            enrich_success: row.get("enrich_success"),
            enrich_failed: row.get("enrich_failed"),
            enrich_pending: row.get("enrich_pending"),
            with_detail_url: row.get("with_detail_url"),
        })
    }

    /// Append-only: one row per worker run, written once at completion.
    pub async fn append_execution_log(&self, entry: &ExecutionLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO execution_log (
                portal_id, run_id, started_at, finished_at, outcome,
                total_records, kept, rejected, unclassified,
                enrich_success, enrich_failed, pages_traversed, error_text
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.portal_id)
        .bind(entry.run_id.to_string())
        .bind(entry.started_at)
        .bind(entry.finished_at)
        .bind(&entry.outcome)
        .bind(entry.total_records)
        .bind(entry.kept)
        .bind(entry.rejected)
        .bind(entry.unclassified)
        .bind(entry.enrich_success)
        .bind(entry.enrich_failed)
        .bind(entry.pages_traversed)
        .bind(&entry.error_text)
        .execute(&self.pool)
        .await
        .context("appending execution log entry")?;
        Ok(())
    }

    pub async fn latest_execution(&self, portal_id: &str) -> Result<Option<ExecutionLogEntry>> {
        let row = sqlx::query(
            "SELECT portal_id, run_id, started_at, finished_at, outcome,
                    total_records, kept, rejected, unclassified,
                    enrich_success, enrich_failed, pages_traversed, error_text
             FROM execution_log WHERE portal_id = ?
             ORDER BY id DESC LIMIT 1",
        )
        .bind(portal_id)
        .fetch_optional(&self.pool)
        .await
        .context("reading latest execution log entry")?;

        row.map(|row| -> Result<ExecutionLogEntry> {
            let run_id: String = row.get("run_id");
            Ok(ExecutionLogEntry {
                portal_id: row.get("portal_id"),
                run_id: run_id.parse().context("parsing run id")?,
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
                outcome: row.get("outcome"),
                total_records: row.get("total_records"),
                kept: row.get("kept"),
                rejected: row.get("rejected"),
                unclassified: row.get("unclassified"),
                enrich_success: row.get("enrich_success"),
                enrich_failed: row.get("enrich_failed"),
                pages_traversed: row.get("pages_traversed"),
                error_text: row.get("error_text"),
            })
        })
        .transpose()
    }

    pub async fn fetch_record(
        &self,
        portal_id: &str,
        identity_hash: &str,
    ) -> Result<Option<TenderRecord>> {
        let row = sqlx::query(
            "SELECT * FROM records WHERE portal_id = ? AND identity_hash = ?",
        )
        .bind(portal_id)
        .bind(identity_hash)
        .fetch_optional(&self.pool)
        .await
        .context("fetching record")?;
        row.map(record_from_row).transpose()
    }
}

fn record_from_row(row: SqliteRow) -> Result<TenderRecord> {
    let classify: String = row.get("classify_state");
    let enrich: String = row.get("enrich_status");
    Ok(TenderRecord {
        id: row.get("id"),
        portal_id: row.get("portal_id"),
        identity_hash: row.get("identity_hash"),
        portal_source: row.get("portal_source"),
        sequence_no: row.get("sequence_no"),
        published_date: row.get("published_date"),
        closing_date: row.get("closing_date"),
        opening_date: row.get("opening_date"),
        title: row.get("title"),
        org_chain: row.get("org_chain"),
        detail_url: row.get("detail_url"),
        run_date: row.get("run_date"),
        detail_text: row.get("detail_text"),
        extract_status: row.get("extract_status"),
        classify_state: ClassifyState::parse(&classify)
            .ok_or_else(|| anyhow!("unknown classify_state {classify:?}"))?,
        enrich_status: EnrichStatus::parse(&enrich)
            .ok_or_else(|| anyhow!("unknown enrich_status {enrich:?}"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
