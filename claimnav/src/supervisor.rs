//! Retry, watchdog and scheduling policy around one logical run.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::Timings,
    errors::ErrorKind,
    handoff::OwnershipGuard,
    menu::MatchStrategy,
    navigate::NavState,
    page::Page,
    session::SessionGate,
    store::{self, keys, KvStore},
    AutomationError,
};

/// How a run request ended, as reported back to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded {
        reached: NavState,
        #[serde(rename = "rowMatched")]
        row_matched: bool,
        #[serde(rename = "menuStrategy", skip_serializing_if = "Option::is_none")]
        menu_strategy: Option<MatchStrategy>,
        #[serde(rename = "formUrl", skip_serializing_if = "Option::is_none")]
        form_url: Option<String>,
    },
    /// A newer request took over. Not an error.
    Superseded,
    Failed {
        error: String,
        kind: ErrorKind,
    },
    /// The claim has failed too often recently; nothing was attempted.
    Suppressed { failures: u32 },
    /// Same request and claim already completed.
    Duplicate,
    /// Another run is in flight; this request will be picked up after it.
    Queued,
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, RunOutcome::Failed { .. } | RunOutcome::Suppressed { .. })
    }
}

/// Bounded retries with a per-attempt watchdog and a session gate.
#[derive(Clone)]
pub struct Supervisor {
    gate: SessionGate,
    timings: Timings,
}

impl Supervisor {
    pub fn new(page: Arc<dyn Page>, timings: Timings) -> Self {
        Self {
            gate: SessionGate::new(page, timings.clone()),
            timings,
        }
    }

    /// Runs `attempt` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is used up. The attempt number (from 1) is passed in.
    ///
    /// Each attempt first waits for a valid session; a gate timeout counts as
    /// a failed, retryable attempt. A failure that coincides with an invalid
    /// session is reclassified as [`AutomationError::SessionInvalid`].
    #[instrument(skip(self, guard, attempt), fields(request_id = %guard.request_id()))]
    pub async fn run<T, F, Fut>(&self, guard: &OwnershipGuard, mut attempt: F) -> Result<T, AutomationError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AutomationError>>,
    {
        let max = self.timings.max_attempts.max(1);
        let mut last = None;
        for n in 1..=max {
            guard.ensure().await?;

            let result = match self.gate.wait_until_valid().await {
                Err(e) => Err(e),
                Ok(()) => match tokio::time::timeout(self.timings.watchdog(), attempt(n)).await {
                    Ok(r) => r,
                    Err(_) => Err(AutomationError::Watchdog(self.timings.watchdog())),
                },
            };

            let e = match result {
                Ok(v) => {
                    if n > 1 {
                        info!(attempt = n, "run succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) if e.is_stale() => {
                    debug!(attempt = n, "run superseded");
                    return Err(e);
                }
                Err(e) => e,
            };

            let session_lost = !matches!(e, AutomationError::SessionInvalid(_))
                && self.gate.is_invalid().await.unwrap_or(false);
            let e = if session_lost {
                AutomationError::SessionInvalid(format!("session dropped during attempt: {e}"))
            } else {
                e
            };

            if !e.is_retryable() {
                error!(attempt = n, kind = ?e.kind(), error = %e, "run failed");
                return Err(e);
            }
            warn!(attempt = n, max, kind = ?e.kind(), error = %e, "attempt failed");
            last = Some(e);
            if n < max {
                tokio::time::sleep(self.timings.retry_delay()).await;
            }
        }

        let last = last.unwrap_or_else(|| AutomationError::Internal("no attempt ran".into()));
        error!(attempts = max, error = %last, "retries exhausted");
        Err(AutomationError::Exhausted {
            attempts: max,
            last: Box::new(last),
        })
    }
}

struct SchedulerState<R> {
    running: bool,
    pending: Option<R>,
}

/// At most one run at a time. Requests arriving during a run collapse into a
/// single pending slot (latest wins) that is run once afterwards.
pub struct RunScheduler<R> {
    state: Mutex<SchedulerState<R>>,
}

impl<R> Default for RunScheduler<R> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                running: false,
                pending: None,
            }),
        }
    }
}

impl<R> RunScheduler<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands `request` back when the caller should run it now; otherwise it
    /// is parked as the pending rerun.
    pub fn try_begin(&self, request: R) -> Option<R> {
        let mut s = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if s.running {
            s.pending = Some(request);
            None
        } else {
            s.running = true;
            Some(request)
        }
    }

    /// Ends the current run. Returns the pending request, if any, which the
    /// caller must run next.
    pub fn finish(&self) -> Option<R> {
        let mut s = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let next = s.pending.take();
        s.running = next.is_some();
        next
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).running
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimFailureRecord {
    pub count: u32,
    pub last_request_id: Option<String>,
    /// Unix millis.
    pub last_failure_at: i64,
}

/// Definitive failures per claim, counted once per request.
#[derive(Clone)]
pub struct FailureLedger {
    store: Arc<dyn KvStore>,
    threshold: u32,
    cooldown_ms: i64,
}

impl FailureLedger {
    pub fn new(store: Arc<dyn KvStore>, timings: &Timings) -> Self {
        Self {
            store,
            threshold: timings.claim_failure_threshold,
            cooldown_ms: i64::try_from(timings.claim_failure_cooldown_ms).unwrap_or(i64::MAX),
        }
    }

    async fn load(&self) -> Result<HashMap<String, ClaimFailureRecord>, AutomationError> {
        Ok(store::read(self.store.as_ref(), keys::CLAIM_FAILURES)
            .await?
            .unwrap_or_default())
    }

    pub async fn record(&self, claim: &str) -> Result<Option<ClaimFailureRecord>, AutomationError> {
        Ok(self.load().await?.remove(claim))
    }

    /// Counts a definitive failure of `request_id` on `claim`. A request that
    /// already failed is not counted twice.
    pub async fn record_failure(&self, claim: &str, request_id: &str) -> Result<u32, AutomationError> {
        self.record_failure_at(claim, request_id, chrono::Utc::now().timestamp_millis())
            .await
    }

    async fn record_failure_at(&self, claim: &str, request_id: &str, now_ms: i64) -> Result<u32, AutomationError> {
        let mut all = self.load().await?;
        let rec = all.entry(claim.to_string()).or_default();
        if rec.last_request_id.as_deref() != Some(request_id) {
            rec.count += 1;
            rec.last_request_id = Some(request_id.to_string());
        }
        rec.last_failure_at = now_ms;
        let count = rec.count;
        store::write(self.store.as_ref(), keys::CLAIM_FAILURES, &all).await?;
        info!(claim, count, "claim failure recorded");
        Ok(count)
    }

    pub async fn clear(&self, claim: &str) -> Result<(), AutomationError> {
        let mut all = self.load().await?;
        if all.remove(claim).is_some() {
            store::write(self.store.as_ref(), keys::CLAIM_FAILURES, &all).await?;
            debug!(claim, "claim failure count cleared");
        }
        Ok(())
    }

    /// Failure count when automatic runs for `claim` are suppressed.
    pub async fn suppressed(&self, claim: &str, force: bool) -> Result<Option<u32>, AutomationError> {
        self.suppressed_at(claim, force, chrono::Utc::now().timestamp_millis())
            .await
    }

    async fn suppressed_at(&self, claim: &str, force: bool, now_ms: i64) -> Result<Option<u32>, AutomationError> {
        if force {
            return Ok(None);
        }
        let Some(rec) = self.record(claim).await? else {
            return Ok(None);
        };
        let cooling = now_ms.saturating_sub(rec.last_failure_at) < self.cooldown_ms;
        Ok((rec.count >= self.threshold && cooling).then_some(rec.count))
    }
}
