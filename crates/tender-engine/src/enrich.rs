//! Detail-page enrichment: fetch one tender's work description.

use tender_driver::{Browser, Element, Page};
use tracing::debug;

use crate::config::EngineConfig;
use crate::retry::NavRetryPolicy;

/// Work description cell adjacent to its caption on the detail layout.
pub const DETAIL_PRIMARY_SELECTOR: &str =
    "td.td_caption:has-text('Work Description') + td.td_field";
const DETAIL_ROW_SELECTOR: &str = "tbody tr";
const DESCRIPTION_LABEL: &str = "work description";

/// Portals redirect expired sessions here instead of serving the detail page.
pub const SESSION_ERROR_MARKER: &str = "CommonErrorPage";

pub const SESSION_EXPIRED_REASON: &str = "ERROR: Session expired";
pub const NOT_FOUND_REASON: &str = "WORK_DESCRIPTION_NOT_FOUND";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichOutcome {
    Success(String),
    /// The portal bounced us to its error page; the whole session needs
    /// re-anchoring before further detail fetches can work.
    SessionExpired,
    NotFound,
    FetchError(String),
}

impl EnrichOutcome {
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Success(_) => None,
            Self::SessionExpired => Some(SESSION_EXPIRED_REASON.to_string()),
            Self::NotFound => Some(NOT_FOUND_REASON.to_string()),
            Self::FetchError(detail) => Some(format!("FETCH_ERROR: {detail}")),
        }
    }
}

/// Open the detail URL on a fresh page and pull the work description. The page
/// is always closed before returning; no driver error escapes as `Err`.
pub async fn fetch_detail(browser: &dyn Browser, url: &str, config: &EngineConfig) -> EnrichOutcome {
    let mut page = match browser.new_page().await {
        Ok(page) => page,
        Err(err) => return EnrichOutcome::FetchError(err.to_string()),
    };

    let policy = NavRetryPolicy {
        max_attempts: config.max_navigation_retries,
        delay: config.stale_retry_delay,
    };
    let outcome = match crate::retry::navigate_with_retry(
        &mut *page,
        url,
        config.page_load_timeout,
        &policy,
    )
    .await
    {
        Ok(()) => read_description(&*page).await,
        Err(err) => EnrichOutcome::FetchError(err.to_string()),
    };

    if let Err(err) = page.close().await {
        debug!(url, error = %err, "detail page close failed");
    }
    outcome
}

async fn read_description(page: &dyn Page) -> EnrichOutcome {
    if page.current_url().contains(SESSION_ERROR_MARKER) {
        return EnrichOutcome::SessionExpired;
    }

    match page.inner_text(DETAIL_PRIMARY_SELECTOR).await {
        Ok(Some(text)) if !text.trim().is_empty() => {
            return EnrichOutcome::Success(text.trim().to_string());
        }
        Ok(_) => {}
        Err(err) => return EnrichOutcome::FetchError(err.to_string()),
    }

    // Some skins render the detail table without the caption classes; scan
    // label/value rows instead.
    match scan_rows(page).await {
        Ok(Some(text)) => EnrichOutcome::Success(text),
        Ok(None) => EnrichOutcome::NotFound,
        Err(err) => EnrichOutcome::FetchError(err.to_string()),
    }
}

async fn scan_rows(page: &dyn Page) -> tender_driver::DriverResult<Option<String>> {
    for row in page.query_all(DETAIL_ROW_SELECTOR).await? {
        let cells = row.query_all("td").await?;
        if cells.len() < 2 {
            continue;
        }
        let label = cells[0].inner_text().await?;
        if label.trim().to_lowercase().contains(DESCRIPTION_LABEL) {
            let value = cells[1].inner_text().await?;
            let value = value.trim();
            if !value.is_empty() {
                return Ok(Some(value.to_string()));
            }
        }
    }
    Ok(None)
}
