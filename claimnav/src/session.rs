use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{config::Timings, page::Page, AutomationError};

/// Page text that means the host dropped the session.
pub const TIMEOUT_PHRASES: [&str; 7] = [
    "session expired",
    "your session has expired",
    "please log in again",
    "session timeout",
    "re-login required",
    "authentication required",
    "login to continue",
];

/// Checks a URL for login or expired-session routes.
pub fn url_looks_invalid(page_url: &str) -> bool {
    let lower = page_url.to_lowercase();
    if ["login", "auth", "signin", "/login."]
        .iter()
        .any(|p| lower.contains(p))
    {
        return true;
    }
    let path = url::Url::parse(&lower)
        .map(|u| u.path().to_string())
        .unwrap_or_default();
    path.contains("session") || path.contains("expired") || path.ends_with("/login")
}

pub fn text_looks_invalid(body_text: &str) -> bool {
    let lower = body_text.to_lowercase();
    TIMEOUT_PHRASES.iter().any(|p| lower.contains(p))
}

/// Watches a page for signs that the user's session is gone.
#[derive(Clone)]
pub struct SessionGate {
    page: Arc<dyn Page>,
    timings: Timings,
}

impl SessionGate {
    pub fn new(page: Arc<dyn Page>, timings: Timings) -> Self {
        Self { page, timings }
    }

    pub async fn is_invalid(&self) -> Result<bool, AutomationError> {
        if url_looks_invalid(&self.page.url().await?) {
            return Ok(true);
        }
        Ok(text_looks_invalid(&self.page.body_text().await?))
    }

    /// Resolves once the page has looked valid for a full settle period.
    ///
    /// Re-checks after DOM mutations (debounced) and whenever the URL changes.
    /// Fails with [`AutomationError::Timeout`] if the page never settles.
    #[instrument(skip(self))]
    pub async fn wait_until_valid(&self) -> Result<(), AutomationError> {
        if !self.is_invalid().await? {
            return Ok(());
        }
        info!(timeout = ?self.timings.session_timeout(), "session invalid; waiting for it to recover");

        let deadline = Instant::now() + self.timings.session_timeout();
        let mut mutations = self.page.mutations();
        let mut observing = true;
        let mut last_url = self.page.url().await?;
        let mut url_poll = tokio::time::interval(self.timings.session_url_poll());
        url_poll.tick().await;

        loop {
            let recheck = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("session did not become valid in time");
                    return Err(AutomationError::Timeout(format!(
                        "session did not become valid within {:?}",
                        self.timings.session_timeout()
                    )));
                }
                changed = mutations.changed(), if observing => {
                    if changed.is_err() {
                        observing = false;
                        false
                    } else {
                        tokio::time::sleep(self.timings.session_debounce()).await;
                        true
                    }
                }
                _ = url_poll.tick() => {
                    let now = self.page.url().await?;
                    let moved = now != last_url;
                    last_url = now;
                    moved
                }
            };
            if !recheck || self.is_invalid().await? {
                continue;
            }

            // Valid now; hold for the settle period so a page mid-redirect is
            // not mistaken for a recovered one.
            let settle_until = Instant::now() + self.timings.session_settle();
            if settle_until >= deadline {
                tokio::time::sleep_until(deadline).await;
            } else {
                tokio::time::sleep_until(settle_until).await;
            }
            if !self.is_invalid().await? {
                info!("session valid again");
                return Ok(());
            }
            debug!("session flipped back to invalid during settle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePage;
    use std::time::Duration;

    #[test]
    fn url_patterns() {
        assert!(url_looks_invalid("https://cc.corp/Login.do"));
        assert!(url_looks_invalid("https://sso.corp/oauth2/authorize"));
        assert!(url_looks_invalid("https://cc.corp/session/ended"));
        assert!(url_looks_invalid("https://cc.corp/app/expired"));
        assert!(!url_looks_invalid("https://cc.corp/ClaimCenter.do?claimNumber=A1"));
    }

    #[test]
    fn text_patterns_are_case_insensitive() {
        assert!(text_looks_invalid("Your Session Has Expired. Sign in."));
        assert!(!text_looks_invalid("Claim A12345678901 summary"));
    }

    #[tokio::test(start_paused = true)]
    async fn valid_page_passes_immediately() {
        let page = Arc::new(FakePage::new("https://cc.corp/ClaimCenter.do"));
        let gate = SessionGate::new(page, Timings::default());
        let started = Instant::now();
        gate.wait_until_valid().await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_redirect_back_and_settle() {
        let page = FakePage::new("https://cc.corp/Login.do");
        let gate = SessionGate::new(Arc::new(page.clone()), Timings::default());
        let host = page.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            host.set_url("https://cc.corp/ClaimCenter.do");
        });
        let started = Instant::now();
        gate.wait_until_valid().await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(21_200), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(25), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn never_recovering_times_out_as_transient() {
        let page = FakePage::new("https://cc.corp/ClaimCenter.do");
        page.set_page_text("Session timeout. Please log in again.");
        let timings = Timings::default();
        let gate = SessionGate::new(Arc::new(page), timings.clone());
        let started = Instant::now();
        let err = gate.wait_until_valid().await.unwrap_err();
        assert!(matches!(err, AutomationError::Timeout(_)));
        assert!(err.is_retryable());
        assert!(started.elapsed() >= timings.session_timeout());
    }
}
