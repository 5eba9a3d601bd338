//! Bounded retry policies for the two transient fault classes the portals
//! exhibit: detached DOM references and flaky page loads.

use std::time::Duration;

use tender_driver::{DriverError, DriverResult, Page};
use tracing::warn;

/// Stale-element retries: small fixed bound, fixed delay. Anything that is not
/// a stale reference propagates on the first failure.
#[derive(Debug, Clone, Copy)]
pub struct StaleRetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl StaleRetryPolicy {
    /// Whether `err` on attempt `attempt` (1-based) warrants another try.
    pub fn should_retry(&self, err: &DriverError, attempt: u32) -> bool {
        err.is_stale() && attempt < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NavRetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// Navigate with a reload between attempts. Exhaustion returns the last error;
/// callers treat that as phase-terminating, never process-fatal.
pub async fn navigate_with_retry(
    page: &mut dyn Page,
    url: &str,
    timeout: Duration,
    policy: &NavRetryPolicy,
) -> DriverResult<()> {
    let mut last = None;
    for attempt in 1..=policy.max_attempts.max(1) {
        match page.goto(url, timeout).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(attempt, url, error = %err, "navigation attempt failed");
                last = Some(err);
                if attempt < policy.max_attempts {
                    let _ = page.reload().await;
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
    Err(last.unwrap_or(DriverError::Closed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tender_driver::scripted::{PageScript, Script, ScriptedBrowser};
    use tender_driver::Browser;

    fn policy() -> NavRetryPolicy {
        NavRetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn navigation_recovers_within_the_bound() {
        let script = Script::default().with_page(
            "https://portal.invalid/list",
            PageScript {
                fail_navigations: 2,
                ..PageScript::default()
            },
        );
        let browser = ScriptedBrowser::new(script);
        let mut page = browser.new_page().await.expect("page");
        navigate_with_retry(
            &mut *page,
            "https://portal.invalid/list",
            Duration::from_secs(1),
            &policy(),
        )
        .await
        .expect("recovers on third attempt");
    }

    #[tokio::test]
    async fn navigation_exhaustion_surfaces_last_error() {
        let script = Script::default().with_page(
            "https://portal.invalid/list",
            PageScript {
                fail_navigations: 5,
                ..PageScript::default()
            },
        );
        let browser = ScriptedBrowser::new(script);
        let mut page = browser.new_page().await.expect("page");
        let err = navigate_with_retry(
            &mut *page,
            "https://portal.invalid/list",
            Duration::from_secs(1),
            &policy(),
        )
        .await
        .expect_err("still failing after three attempts");
        assert!(err.is_navigation());
    }

    #[test]
    fn stale_policy_only_retries_stale() {
        let policy = StaleRetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        };
        let stale = DriverError::Stale("a#linkFwd".into());
        let nav = DriverError::Navigation {
            url: "u".into(),
            reason: "r".into(),
        };
        assert!(policy.should_retry(&stale, 1));
        assert!(policy.should_retry(&stale, 2));
        assert!(!policy.should_retry(&stale, 3));
        assert!(!policy.should_retry(&nav, 1));
    }
}
