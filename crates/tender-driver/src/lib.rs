//! Browser automation boundary: the capability set the crawl engine consumes.
//!
//! The engine never talks to a concrete browser; it drives these traits. A real
//! Playwright/CDP binding lives outside this workspace and plugs in here. The
//! [`scripted`] module ships a deterministic in-memory implementation used by
//! the engine's tests and by fixture-replay runs.

pub mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub const CRATE_NAME: &str = "tender-driver";

#[derive(Debug, Error)]
pub enum DriverError {
    /// The element detached from the DOM between query and use. Transient;
    /// call sites retry these, nothing else.
    #[error("stale element reference: {0}")]
    Stale(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("page already closed")]
    Closed,
}

impl DriverError {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    pub fn is_navigation(&self) -> bool {
        matches!(self, Self::Navigation { .. } | Self::Timeout(_))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// A browser context that hands out independently scoped pages.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self) -> DriverResult<Box<dyn Page>>;
}

/// One open page. Selectors are driver-interpreted; the engine treats them as
/// opaque strings from portal configuration.
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&mut self, url: &str, timeout: Duration) -> DriverResult<()>;
    async fn reload(&mut self) -> DriverResult<()>;
    /// The URL the page actually landed on; server-side redirects show here.
    fn current_url(&self) -> String;
    async fn evaluate(&self, script: &str) -> DriverResult<()>;
    async fn query(&self, selector: &str) -> DriverResult<Option<Box<dyn Element>>>;
    async fn query_all(&self, selector: &str) -> DriverResult<Vec<Box<dyn Element>>>;
    /// Text of the first match, or None when nothing matches.
    async fn inner_text(&self, selector: &str) -> DriverResult<Option<String>>;
    async fn close(self: Box<Self>) -> DriverResult<()>;
}

/// A handle to a matched DOM element.
#[async_trait]
pub trait Element: Send + Sync {
    async fn inner_text(&self) -> DriverResult<String>;
    async fn attribute(&self, name: &str) -> DriverResult<Option<String>>;
    async fn is_visible(&self) -> DriverResult<bool>;
    async fn is_enabled(&self) -> DriverResult<bool>;
    async fn query(&self, selector: &str) -> DriverResult<Option<Box<dyn Element>>>;
    async fn query_all(&self, selector: &str) -> DriverResult<Vec<Box<dyn Element>>>;
    async fn click(&self) -> DriverResult<()>;
}
