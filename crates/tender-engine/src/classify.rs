//! Title classification: an LLM call behind a trait, a per-worker cache, and
//! the policy that maps verdicts onto record state.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tender_core::ClassifyState;
use tracing::warn;

use crate::config::ClassifierConfig;

/// Which classifier verdict a record must carry to stay `kept`. Default keeps
/// the meaningful ones; the inverse exists for screening workflows that review
/// the low-signal titles instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepPolicy {
    #[default]
    KeepMeaningful,
    KeepUnmeaningful,
}

impl KeepPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "meaningful" | "keep_meaningful" => Some(Self::KeepMeaningful),
            "unmeaningful" | "keep_unmeaningful" => Some(Self::KeepUnmeaningful),
            _ => None,
        }
    }

    pub fn verdict(self, meaningful: bool) -> ClassifyState {
        let keep = match self {
            Self::KeepMeaningful => meaningful,
            Self::KeepUnmeaningful => !meaningful,
        };
        if keep {
            ClassifyState::Kept
        } else {
            ClassifyState::Rejected
        }
    }
}

/// Batch title classifier: title -> is the tender meaningful work.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify_titles(&self, titles: &[String]) -> Result<HashMap<String, bool>>;
}

/// Chat-completions backed classifier. One request per batch, JSON verdict
/// object keyed by 1-based index.
pub struct HttpClassifier {
    client: reqwest::Client,
    config: ClassifierConfig,
}

impl HttpClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn prompt(titles: &[String]) -> String {
        let mut numbered = String::new();
        for (i, title) in titles.iter().enumerate() {
            numbered.push_str(&format!("{}. {}\n", i + 1, title.replace('\n', " / ")));
        }
        format!(
            "You review public tender titles. For each numbered title below, decide whether it \
             describes meaningful procurement work (construction, supply, services with real \
             scope) or is administrative noise (corrigenda, cancellations, empty placeholders). \
             Respond with a JSON object mapping each number (as a string) to \"meaningful\" or \
             \"unmeaningful\". No other keys, no commentary.\n\n{numbered}"
        )
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify_titles(&self, titles: &[String]) -> Result<HashMap<String, bool>> {
        if titles.is_empty() {
            return Ok(HashMap::new());
        }

        let body = json!({
            "model": self.config.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "user", "content": Self::prompt(titles) }
            ],
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("classifier request failed")?
            .error_for_status()
            .context("classifier returned an error status")?;

        let payload: serde_json::Value =
            response.json().await.context("classifier response was not JSON")?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("classifier response missing message content"))?;

        let verdicts: HashMap<String, String> = serde_json::from_str(strip_fences(content))
            .context("classifier verdict was not a JSON object of strings")?;

        let mut out = HashMap::new();
        for (i, title) in titles.iter().enumerate() {
            let key = (i + 1).to_string();
            let verdict = verdicts
                .get(&key)
                .ok_or_else(|| anyhow!("classifier verdict missing entry {key}"))?;
            out.insert(title.clone(), verdict.eq_ignore_ascii_case("meaningful"));
        }
        Ok(out)
    }
}

/// Models sometimes wrap the JSON in a code fence despite the response format.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Caching wrapper. Classification is advisory: when the inner classifier
/// fails, every uncached title is treated as meaningful so no tender is
/// rejected on the back of an API outage.
pub struct CachedClassifier {
    inner: Box<dyn Classifier>,
    cache: Mutex<HashMap<String, bool>>,
}

impl CachedClassifier {
    pub fn new(inner: Box<dyn Classifier>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn classify(&self, titles: &[String]) -> HashMap<String, bool> {
        let mut out = HashMap::new();
        let mut misses = Vec::new();
        {
            let cache = self.cache.lock().expect("classifier cache lock");
            for title in titles {
                match cache.get(title) {
                    Some(&verdict) => {
                        out.insert(title.clone(), verdict);
                    }
                    None => misses.push(title.clone()),
                }
            }
        }
        if misses.is_empty() {
            return out;
        }

        match self.inner.classify_titles(&misses).await {
            Ok(fresh) => {
                let mut cache = self.cache.lock().expect("classifier cache lock");
                for title in &misses {
                    let verdict = fresh.get(title).copied().unwrap_or(true);
                    cache.insert(title.clone(), verdict);
                    out.insert(title.clone(), verdict);
                }
            }
            Err(err) => {
                warn!(error = %err, batch = misses.len(), "classifier unavailable, keeping batch");
                for title in misses {
                    out.insert(title, true);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedClassifier {
        calls: Arc<AtomicUsize>,
        verdicts: HashMap<String, bool>,
        fail: bool,
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify_titles(&self, titles: &[String]) -> Result<HashMap<String, bool>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("api down"));
            }
            Ok(titles
                .iter()
                .filter_map(|t| self.verdicts.get(t).map(|&v| (t.clone(), v)))
                .collect())
        }
    }

    #[test]
    fn keep_policy_maps_verdicts() {
        assert_eq!(
            KeepPolicy::KeepMeaningful.verdict(true),
            ClassifyState::Kept
        );
        assert_eq!(
            KeepPolicy::KeepMeaningful.verdict(false),
            ClassifyState::Rejected
        );
        assert_eq!(
            KeepPolicy::KeepUnmeaningful.verdict(true),
            ClassifyState::Rejected
        );
        assert_eq!(KeepPolicy::parse("meaningful"), Some(KeepPolicy::KeepMeaningful));
        assert_eq!(KeepPolicy::parse("nonsense"), None);
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("{\"1\": \"meaningful\"}"), "{\"1\": \"meaningful\"}");
        assert_eq!(
            strip_fences("```json\n{\"1\": \"meaningful\"}\n```"),
            "{\"1\": \"meaningful\"}"
        );
    }

    #[tokio::test]
    async fn cache_avoids_repeat_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = FixedClassifier {
            calls: Arc::clone(&calls),
            verdicts: HashMap::from([("road work".to_string(), true), ("corrigendum".to_string(), false)]),
            fail: false,
        };
        let classifier = CachedClassifier::new(Box::new(inner));

        let titles = vec!["road work".to_string(), "corrigendum".to_string()];
        let first = classifier.classify(&titles).await;
        assert_eq!(first["road work"], true);
        assert_eq!(first["corrigendum"], false);

        let second = classifier.classify(&titles).await;
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outage_keeps_everything() {
        let inner = FixedClassifier {
            calls: Arc::new(AtomicUsize::new(0)),
            verdicts: HashMap::new(),
            fail: true,
        };
        let classifier = CachedClassifier::new(Box::new(inner));
        let verdicts = classifier
            .classify(&["anything".to_string(), "at all".to_string()])
            .await;
        assert!(verdicts.values().all(|&v| v));
        // Failures are not cached; the next batch asks again.
        assert!(classifier.cache.lock().expect("lock").is_empty());
    }
}
