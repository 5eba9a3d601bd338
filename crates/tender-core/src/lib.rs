//! Core domain model for the multi-portal tender crawler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "tender-core";

/// Classification verdict for a tender title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyState {
    Unclassified,
    Kept,
    Rejected,
}

impl ClassifyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unclassified => "unclassified",
            Self::Kept => "kept",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unclassified" => Some(Self::Unclassified),
            "kept" => Some(Self::Kept),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Detail-page enrichment progress for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichStatus {
    Pending,
    Success,
    Failed,
}

impl EnrichStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One listing row parsed into a persistable candidate. Dates stay in the
/// portal's own display format; they are identity material, not calendar data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderDraft {
    pub portal_source: String,
    pub sequence_no: String,
    pub published_date: String,
    pub closing_date: String,
    pub opening_date: String,
    pub title: String,
    pub org_chain: String,
    pub detail_url: String,
    pub run_date: String,
}

/// Persisted tender row, deduplicated by `(portal_id, identity_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub id: i64,
    pub portal_id: String,
    pub identity_hash: String,
    pub portal_source: String,
    pub sequence_no: String,
    pub published_date: String,
    pub closing_date: String,
    pub opening_date: String,
    pub title: String,
    pub org_chain: String,
    pub detail_url: String,
    pub run_date: String,
    pub detail_text: Option<String>,
    /// Constant 'extracted' marker set at insert; kept for audit symmetry with
    /// the phase columns, it never transitions.
    pub extract_status: String,
    pub classify_state: ClassifyState,
    pub enrich_status: EnrichStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which draft fields feed the dedup digest.
///
/// The listing exposes no stable external id, so identity is a content
/// fingerprint over title + published date + organisation chain. Two distinct
/// tenders sharing all three on the same day collapse into one record; widening
/// the scheme with the detail URL or sequence number is a deployment choice,
/// not a default, because re-listed tenders get fresh values for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityScheme {
    #[serde(default)]
    pub include_detail_url: bool,
    #[serde(default)]
    pub include_sequence_no: bool,
}

impl IdentityScheme {
    pub fn hash(&self, draft: &TenderDraft) -> String {
        let mut hasher = Sha256::new();
        hasher.update(draft.title.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(draft.published_date.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(draft.org_chain.as_bytes());
        if self.include_detail_url {
            hasher.update(b"\x1f");
            hasher.update(draft.detail_url.as_bytes());
        }
        if self.include_sequence_no {
            hasher.update(b"\x1f");
            hasher.update(draft.sequence_no.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Collapse whitespace the way listing cells need it: newlines and tabs become
/// spaces, runs of spaces collapse, ends trimmed.
pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Portal-specific step executed right after landing on the portal root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreStep {
    /// Dismiss the blocking alert overlay some skins show on first load.
    CloseAlertDialog,
}

/// Static description of one portal. Loaded once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalConfig {
    pub portal_id: String,
    pub display_name: String,
    pub base_url: String,
    pub portal_url: String,
    #[serde(default)]
    pub pre_step: Option<PreStep>,
}

impl PortalConfig {
    /// Absolutize a listing href against this portal's origin.
    pub fn absolutize(&self, href: &str) -> String {
        if href.starts_with('/') {
            format!("{}{}", self.base_url, href)
        } else {
            href.to_string()
        }
    }
}

/// The built-in production portal set.
pub fn production_portals() -> Vec<PortalConfig> {
    let portal = |portal_id: &str, display_name: &str, base_url: &str, pre_step| PortalConfig {
        portal_id: portal_id.to_string(),
        display_name: display_name.to_string(),
        base_url: base_url.to_string(),
        portal_url: format!("{base_url}/nicgep/app"),
        pre_step,
    };
    vec![
        portal("WB", "West Bengal", "https://wbtenders.gov.in", None),
        portal("BHEL", "BHEL", "https://eprocurebhel.co.in", None),
        portal("COAL", "Coal India", "https://coalindiatenders.nic.in", None),
        portal(
            "NTPC",
            "NTPC",
            "https://eprocurentpc.nic.in",
            Some(PreStep::CloseAlertDialog),
        ),
    ]
}

/// The three strictly ordered worker phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extract,
    Classify,
    Enrich,
}

impl Phase {
    /// Checkpoint key under which this phase persists its state.
    pub fn checkpoint_key(self) -> &'static str {
        match self {
            Self::Extract => "phase.extract",
            Self::Classify => "phase.classify",
            Self::Enrich => "phase.enrich",
        }
    }
}

/// Where the extract phase picks up after an interruption: the last page whose
/// batch committed, plus the already-resolved URL of the page after it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtractProgress {
    pub last_page: u32,
    #[serde(default)]
    pub next_url: Option<String>,
}

/// Durable lifecycle of one phase, persisted as a checkpoint value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PhaseState {
    NotStarted,
    InProgress {
        #[serde(default)]
        progress: Option<ExtractProgress>,
    },
    Complete,
}

impl PhaseState {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("phase state serializes")
    }

    /// Missing or unreadable checkpoint values mean the phase never ran.
    pub fn decode(value: Option<&str>) -> Self {
        value
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or(Self::NotStarted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(title: &str, published: &str, org: &str) -> TenderDraft {
        TenderDraft {
            portal_source: "West Bengal".into(),
            sequence_no: "1".into(),
            published_date: published.into(),
            closing_date: "20-Aug-2026".into(),
            opening_date: "21-Aug-2026".into(),
            title: title.into(),
            org_chain: org.into(),
            detail_url: "https://wbtenders.gov.in/nicgep/app?x=1".into(),
            run_date: "2026-08-25".into(),
        }
    }

    #[test]
    fn identity_hash_is_deterministic() {
        let scheme = IdentityScheme::default();
        let a = scheme.hash(&draft("Road resurfacing", "18-Aug-2026", "PWD||Roads"));
        let b = scheme.hash(&draft("Road resurfacing", "18-Aug-2026", "PWD||Roads"));
        assert_eq!(a, b);
    }

    #[test]
    fn identity_hash_changes_with_each_input() {
        let scheme = IdentityScheme::default();
        let base = scheme.hash(&draft("Road resurfacing", "18-Aug-2026", "PWD||Roads"));
        assert_ne!(
            base,
            scheme.hash(&draft("Bridge painting", "18-Aug-2026", "PWD||Roads"))
        );
        assert_ne!(
            base,
            scheme.hash(&draft("Road resurfacing", "19-Aug-2026", "PWD||Roads"))
        );
        assert_ne!(
            base,
            scheme.hash(&draft("Road resurfacing", "18-Aug-2026", "PWD||Bridges"))
        );
    }

    #[test]
    fn default_scheme_ignores_url_and_sequence() {
        let scheme = IdentityScheme::default();
        let mut other = draft("Road resurfacing", "18-Aug-2026", "PWD||Roads");
        other.detail_url = "https://wbtenders.gov.in/nicgep/app?x=2".into();
        other.sequence_no = "44".into();
        assert_eq!(
            scheme.hash(&draft("Road resurfacing", "18-Aug-2026", "PWD||Roads")),
            scheme.hash(&other)
        );

        let widened = IdentityScheme {
            include_detail_url: true,
            include_sequence_no: false,
        };
        assert_ne!(
            widened.hash(&draft("Road resurfacing", "18-Aug-2026", "PWD||Roads")),
            widened.hash(&other)
        );
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  a\tb\n\nc  d "), "a b c d");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn phase_state_round_trips_and_tolerates_garbage() {
        let state = PhaseState::InProgress {
            progress: Some(ExtractProgress {
                last_page: 7,
                next_url: Some("https://example.invalid/page8".into()),
            }),
        };
        assert_eq!(PhaseState::decode(Some(&state.encode())), state);
        assert_eq!(PhaseState::decode(None), PhaseState::NotStarted);
        assert_eq!(PhaseState::decode(Some("not json")), PhaseState::NotStarted);
    }
}
