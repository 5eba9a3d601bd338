//! Environment-driven engine configuration and the portal registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tender_core::{production_portals, IdentityScheme, PortalConfig};

use crate::classify::KeepPolicy;

/// Credentials and endpoint for the external title classifier.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub classifier: Option<ClassifierConfig>,
    pub identity: IdentityScheme,
    pub keep_policy: KeepPolicy,
    pub page_load_timeout: Duration,
    pub pagination_delay: Duration,
    pub detail_delay: Duration,
    /// Re-anchor the browser session on the portal root every N enriched
    /// records; long enrichment runs expire server-side sessions otherwise.
    pub session_refresh_every: usize,
    pub max_stale_retries: u32,
    pub stale_retry_delay: Duration,
    pub max_navigation_retries: u32,
    /// Attempts for one page's upsert batch before the extract phase fails.
    pub batch_upsert_attempts: u32,
    pub classify_batch_size: usize,
    pub stagger_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./tenders.db"),
            classifier: None,
            identity: IdentityScheme::default(),
            keep_policy: KeepPolicy::default(),
            page_load_timeout: Duration::from_secs(45),
            pagination_delay: Duration::from_secs(1),
            detail_delay: Duration::from_secs(2),
            session_refresh_every: 10,
            max_stale_retries: 3,
            stale_retry_delay: Duration::from_secs(2),
            max_navigation_retries: 3,
            batch_upsert_attempts: 3,
            classify_batch_size: 50,
            stagger_delay: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let api_key = std::env::var("TENDER_CLASSIFIER_API_KEY")
            .or_else(|_| std::env::var("MISTRAL_API_KEY"))
            .ok()
            .filter(|v| !v.is_empty());
        let classifier = api_key.map(|api_key| ClassifierConfig {
            api_key,
            endpoint: std::env::var("TENDER_CLASSIFIER_URL")
                .unwrap_or_else(|_| "https://api.mistral.ai/v1/chat/completions".to_string()),
            model: std::env::var("TENDER_CLASSIFIER_MODEL")
                .unwrap_or_else(|_| "mistral-large-latest".to_string()),
        });

        Self {
            database_path: std::env::var("TENDER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            classifier,
            identity: IdentityScheme {
                include_detail_url: env_flag("TENDER_IDENTITY_INCLUDE_URL"),
                include_sequence_no: env_flag("TENDER_IDENTITY_INCLUDE_SEQ"),
            },
            keep_policy: std::env::var("TENDER_KEEP_POLICY")
                .ok()
                .and_then(|v| KeepPolicy::parse(&v))
                .unwrap_or_default(),
            session_refresh_every: env_usize("TENDER_SESSION_REFRESH_EVERY")
                .unwrap_or(defaults.session_refresh_every),
            classify_batch_size: env_usize("TENDER_CLASSIFY_BATCH_SIZE")
                .unwrap_or(defaults.classify_batch_size),
            stagger_delay: env_usize("TENDER_STAGGER_SECS")
                .map(|secs| Duration::from_secs(secs as u64))
                .unwrap_or(defaults.stagger_delay),
            ..defaults
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, Deserialize)]
struct PortalRegistryFile {
    portals: Vec<PortalConfig>,
}

/// Load the portal set: a YAML registry file when one is configured, else the
/// built-in production portals. The set is closed per deployment, not
/// discovered at runtime.
pub fn load_portal_registry(path: Option<&Path>) -> Result<Vec<PortalConfig>> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading portal registry {}", path.display()))?;
            let registry: PortalRegistryFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing portal registry {}", path.display()))?;
            Ok(registry.portals)
        }
        None => Ok(production_portals()),
    }
}

/// Resolve one portal id against the registry.
pub fn portal_by_id(portals: &[PortalConfig], portal_id: &str) -> Result<PortalConfig> {
    portals
        .iter()
        .find(|p| p.portal_id == portal_id)
        .cloned()
        .with_context(|| format!("unknown portal id {portal_id:?}"))
}
