//! The listener living in a managed claim application tab.
//!
//! Answers `PING`, runs `RUN_NOW` requests through the supervisor and the
//! navigation driver, and owns the tab's form parameter stash.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    config::{HostSelectors, Timings},
    errors::ErrorKind,
    form::{params_from_url, FormConfig, FormLauncher, FormOutcome, FormStash},
    handoff::{new_request_id, HandoffStore, OwnershipGuard},
    messages::{FormParams, Message, MessageHandler, PingReply, RunReply},
    navigate::{NavRequest, NavState, NavigationDriver},
    page::{query_param, strip_query, Page},
    settings::{RunMode, SettingsResolver},
    store::KvStore,
    supervisor::{FailureLedger, RunOutcome, RunScheduler, Supervisor},
    AutomationError,
};

/// One run request as received, before fallbacks are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunInput {
    pub request_id: Option<String>,
    pub claim: Option<String>,
    pub target_page: Option<String>,
    pub form_params: Option<FormParams>,
}

#[derive(Debug, Default)]
struct Remembered {
    claim: Option<String>,
    target_page: Option<String>,
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub struct TargetAgent {
    page: Arc<dyn Page>,
    selectors: Arc<HostSelectors>,
    timings: Timings,
    handoff: HandoffStore,
    settings: SettingsResolver,
    ledger: FailureLedger,
    supervisor: Supervisor,
    stash: Arc<FormStash>,
    form: FormLauncher,
    scheduler: RunScheduler<RunInput>,
    remembered: Mutex<Remembered>,
}

impl TargetAgent {
    pub fn new(
        page: Arc<dyn Page>,
        store: Arc<dyn KvStore>,
        selectors: Arc<HostSelectors>,
        timings: Timings,
        form_config: FormConfig,
    ) -> Self {
        let stash = Arc::new(FormStash::new());
        Self {
            form: FormLauncher::new(
                page.clone(),
                selectors.clone(),
                timings.clone(),
                form_config,
                stash.clone(),
            ),
            supervisor: Supervisor::new(page.clone(), timings.clone()),
            ledger: FailureLedger::new(store.clone(), &timings),
            settings: SettingsResolver::new(store.clone()),
            handoff: HandoffStore::new(store),
            page,
            selectors,
            timings,
            stash,
            scheduler: RunScheduler::new(),
            remembered: Mutex::new(Remembered::default()),
        }
    }

    /// Picks up a run encoded in the page URL. Returns `None` when the tab
    /// was not opened for automation.
    pub async fn on_load(&self) -> Result<Option<RunOutcome>, AutomationError> {
        let url = self.page.url().await?;
        self.stash.merge(None, &params_from_url(&url));
        let has_claim = query_param(&url, "TargetClaim")
            .or_else(|| query_param(&url, "claimNumber"))
            .is_some();
        if !has_claim || query_param(&url, "process").as_deref() != Some("true") {
            debug!("no automation parameters on load");
            return Ok(None);
        }
        Ok(Some(self.request_run(RunInput::default()).await))
    }

    /// Runs `input` now, or parks it behind the run already in flight.
    ///
    /// The reply describes the last run this call executed, which includes
    /// any request that was parked while it ran.
    pub async fn request_run(&self, input: RunInput) -> RunOutcome {
        let Some(mut current) = self.scheduler.try_begin(input) else {
            info!("run in flight; request queued");
            return RunOutcome::Queued;
        };
        loop {
            let outcome = self.execute(current).await;
            match self.scheduler.finish() {
                Some(next) => {
                    info!("starting queued rerun");
                    current = next;
                }
                None => return outcome,
            }
        }
    }

    fn remember(&self, input: &RunInput) {
        let mut r = self.remembered.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(c) = non_blank(input.claim.clone()) {
            r.claim = Some(c);
        }
        if let Some(t) = non_blank(input.target_page.clone()) {
            r.target_page = Some(t);
        }
    }

    fn recalled(&self) -> (Option<String>, Option<String>) {
        let r = self.remembered.lock().unwrap_or_else(|p| p.into_inner());
        (r.claim.clone(), r.target_page.clone())
    }

    async fn execute(&self, input: RunInput) -> RunOutcome {
        let url = self.page.url().await.unwrap_or_default();
        self.remember(&input);
        let (remembered_claim, remembered_target) = self.recalled();

        let request_id = non_blank(input.request_id.clone())
            .or_else(|| query_param(&url, "tm_t"))
            .or_else(|| query_param(&url, "processRequestId"));
        let claim = non_blank(input.claim.clone())
            .or_else(|| query_param(&url, "TargetClaim"))
            .or_else(|| query_param(&url, "claimNumber"))
            .or(remembered_claim);
        let target_page = non_blank(input.target_page.clone())
            .or_else(|| query_param(&url, "TargetPage"))
            .or(remembered_target);
        self.stash.merge(input.form_params.as_ref(), &params_from_url(&url));

        let Some(claim) = claim else {
            warn!("run requested without a claim number");
            let e = AutomationError::MissingInput("no claim number in message or URL".into());
            return RunOutcome::Failed {
                error: e.to_string(),
                kind: e.kind(),
            };
        };

        let span = info_span!(
            "run",
            request_id = request_id.as_deref().unwrap_or("-"),
            claim = %claim
        );
        self.execute_claim(request_id, claim, target_page)
            .instrument(span)
            .await
    }

    async fn execute_claim(
        &self,
        request_id: Option<String>,
        claim: String,
        target_page: Option<String>,
    ) -> RunOutcome {
        let (guard, force) = match &request_id {
            Some(id) => {
                let force = matches!(
                    self.handoff.handoff().await,
                    Ok(Some(h)) if &h.request_id == id && h.force
                );
                (OwnershipGuard::new(self.handoff.clone(), id.clone()), force)
            }
            None => (OwnershipGuard::unowned(new_request_id()), false),
        };

        if let Some(id) = &request_id {
            match self.handoff.is_duplicate(id, &claim).await {
                Ok(true) => {
                    info!("request already completed; skipping");
                    return RunOutcome::Duplicate;
                }
                Ok(false) => {}
                Err(e) => debug!(error = %e, "duplicate check failed; running"),
            }
        }
        match self.ledger.suppressed(&claim, force).await {
            Ok(Some(failures)) => {
                warn!(failures, "claim keeps failing; automatic run suppressed");
                return RunOutcome::Suppressed { failures };
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "failure ledger unreadable"),
        }

        let run_mode = self.settings.run_mode().await;
        let nav_req = NavRequest {
            claim: claim.clone(),
            target_page: target_page.clone(),
            run_mode,
        };
        info!(run_mode = run_mode.as_str(), target_page = ?target_page, "run started");

        let result = self
            .supervisor
            .run(&guard, |attempt| {
                let mut driver = NavigationDriver::new(
                    self.page.clone(),
                    self.selectors.clone(),
                    self.timings.clone(),
                    guard.clone(),
                );
                let nav_req = &nav_req;
                async move {
                    debug!(attempt, "navigation attempt");
                    driver.run(nav_req).await
                }
            })
            .await;

        let report = match result {
            Ok(report) => report,
            Err(e) if e.is_stale() => {
                debug!("run superseded by a newer request");
                return RunOutcome::Superseded;
            }
            Err(e) => return self.fail(&guard, &claim, e).await,
        };
        if guard.ensure().await.is_err() {
            return RunOutcome::Superseded;
        }

        let mut form_url = None;
        let mut form_error = None;
        if run_mode == RunMode::Full && report.reached == NavState::SubPageConfirmed {
            match self.form.open_after_navigation(target_page.as_deref()).await {
                Ok(Some(FormOutcome::Opened { url })) => form_url = Some(url),
                Ok(Some(FormOutcome::Debounced)) => form_url = Some(String::new()),
                Ok(None) => {}
                Err(e) => form_error = Some(e),
            }
        }
        if form_url.is_none() && form_error.is_none() {
            self.clean_url().await;
        }

        if let Some(id) = &request_id {
            if let Err(e) = self.handoff.record_success(id, &claim).await {
                warn!(error = %e, "could not record success");
            }
        }
        if let Err(e) = self.ledger.clear(&claim).await {
            debug!(error = %e, "could not clear failure count");
        }

        if let Some(e) = form_error {
            warn!(error = %e, "navigation finished but the form could not be opened");
            return RunOutcome::Failed {
                error: e.to_string(),
                kind: e.kind(),
            };
        }
        info!(reached = ?report.reached, row_matched = report.row_matched, "run finished");
        RunOutcome::Succeeded {
            reached: report.reached,
            row_matched: report.row_matched,
            menu_strategy: report.menu_match.map(|m| m.strategy),
            form_url: form_url.filter(|u| !u.is_empty()),
        }
    }

    async fn fail(&self, guard: &OwnershipGuard, claim: &str, e: AutomationError) -> RunOutcome {
        if e.kind() == ErrorKind::UnrecoverableInput {
            // Nothing to retry; leave the page where the user can see it.
            self.clean_url().await;
        } else if let Err(le) = self.ledger.record_failure(claim, guard.request_id()).await {
            debug!(error = %le, "could not record claim failure");
        }
        error!(kind = ?e.kind(), error = %e, "run failed");
        RunOutcome::Failed {
            error: e.to_string(),
            kind: e.kind(),
        }
    }

    /// Drops automation parameters from the address bar.
    async fn clean_url(&self) {
        let result = match self.page.url().await {
            Ok(url) => self.page.replace_url(&strip_query(&url)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!(error = %e, "could not clean url");
        }
    }

    async fn ping(&self) -> Result<PingReply, AutomationError> {
        Ok(PingReply {
            alive: true,
            current_url: self.page.url().await?,
            title: self.page.title().await?,
            ready_state: self.page.ready_state().await?,
        })
    }
}

fn run_reply(outcome: &RunOutcome) -> Result<Value, AutomationError> {
    let error = match outcome {
        RunOutcome::Failed { error, .. } => Some(error.clone()),
        RunOutcome::Suppressed { failures } => Some(format!("suppressed after {failures} failures")),
        _ => None,
    };
    Ok(serde_json::to_value(RunReply {
        ok: outcome.is_ok(),
        result: Some(serde_json::to_value(outcome)?),
        error,
    })?)
}

#[async_trait]
impl MessageHandler for TargetAgent {
    async fn handle(&self, message: Message) -> Result<Value, AutomationError> {
        match message {
            Message::Ping => Ok(serde_json::to_value(self.ping().await?)?),
            Message::RunNow {
                request_id,
                claim,
                target_page,
                form_params,
            } => {
                let outcome = self
                    .request_run(RunInput {
                        request_id: Some(request_id),
                        claim,
                        target_page,
                        form_params,
                    })
                    .await;
                run_reply(&outcome)
            }
            Message::OpenForm => {
                let url = self.page.url().await?;
                self.stash.merge(None, &params_from_url(&url));
                let reply = match self.form.open_form().await {
                    Ok(FormOutcome::Opened { url }) => RunReply {
                        ok: true,
                        result: Some(serde_json::json!({ "formUrl": url })),
                        error: None,
                    },
                    Ok(FormOutcome::Debounced) => RunReply {
                        ok: true,
                        result: Some(serde_json::json!({ "debounced": true })),
                        error: None,
                    },
                    Err(e) => RunReply {
                        ok: false,
                        result: None,
                        error: Some(e.to_string()),
                    },
                };
                Ok(serde_json::to_value(reply)?)
            }
            other => Err(AutomationError::InvalidArgument(format!(
                "{} is not handled by the target page",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::MemoryStore,
        testing::{script_claim_app, FakePage},
    };

    const ENTRY: &str =
        "https://cc.corp/ClaimCenter.do?tm_t=1-aaaaaa&process=true&claimNumber=A12345678901&TargetPage=loss_details";

    fn agent(page: &FakePage, store: Arc<dyn KvStore>) -> TargetAgent {
        TargetAgent::new(
            Arc::new(page.clone()),
            store,
            Arc::new(HostSelectors::default()),
            Timings::default(),
            FormConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn ping_reports_page_state() {
        let page = FakePage::new(ENTRY);
        let a = agent(&page, Arc::new(MemoryStore::new()));
        let reply: PingReply = serde_json::from_value(a.handle(Message::Ping).await.unwrap()).unwrap();
        assert!(reply.alive);
        assert_eq!(reply.current_url, ENTRY);
        assert_eq!(reply.ready_state, "complete");
    }

    #[tokio::test(start_paused = true)]
    async fn load_runs_from_url_then_cleans_it() {
        let sel = HostSelectors::default();
        let page = FakePage::new(ENTRY);
        script_claim_app(&page, &sel, &["Summary", "Loss Details"]);
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = agent(&page, store.clone());

        let outcome = a.on_load().await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Succeeded {
                reached: NavState::SubPageConfirmed,
                row_matched: true,
                ..
            }
        ));
        assert_eq!(page.replaced_urls(), vec!["https://cc.corp/ClaimCenter.do".to_string()]);
        let last = HandoffStore::new(store).last_success().await.unwrap();
        assert_eq!(last.last_request_id.as_deref(), Some("1-aaaaaa"));
        assert_eq!(last.last_claim.as_deref(), Some("A12345678901"));
    }

    #[tokio::test(start_paused = true)]
    async fn message_fallbacks_cover_a_stripped_url() {
        let sel = HostSelectors::default();
        let page = FakePage::new("https://cc.corp/ClaimCenter.do");
        script_claim_app(&page, &sel, &["Summary"]);
        let a = agent(&page, Arc::new(MemoryStore::new()));

        let reply: RunReply = serde_json::from_value(
            a.handle(Message::RunNow {
                request_id: "1-aaaaaa".into(),
                claim: Some("A12345678901".into()),
                target_page: Some("summary".into()),
                form_params: None,
            })
            .await
            .unwrap(),
        )
        .unwrap();
        assert!(reply.ok, "{reply:?}");
        assert_eq!(reply.result.unwrap()["reached"], "sub_page_confirmed");
    }

    #[tokio::test(start_paused = true)]
    async fn run_without_claim_is_missing_input() {
        let page = FakePage::new("https://cc.corp/ClaimCenter.do");
        let a = agent(&page, Arc::new(MemoryStore::new()));
        let outcome = a.request_run(RunInput::default()).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                kind: ErrorKind::UnrecoverableInput,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn portal_messages_are_rejected() {
        let page = FakePage::new("https://cc.corp/ClaimCenter.do");
        let a = agent(&page, Arc::new(MemoryStore::new()));
        let err = a
            .handle(Message::OpenTarget {
                request_id: "1-aaaaaa".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AutomationError::InvalidArgument(_)));
    }
}
