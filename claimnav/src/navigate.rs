//! Drives the claim application from wherever it is to the requested claim
//! and, optionally, one of its sub-pages.
//!
//! The protocol is strictly sequential. Each step has its own bounded retry
//! loop for host quirks (swallowed clicks, reverted inputs); anything still
//! wrong after that is returned to the supervisor. Ownership is re-checked
//! after every step and before every retry.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{HostSelectors, Timings},
    handoff::OwnershipGuard,
    interact::Interactor,
    menu::{find_label_match, LabelMatch},
    page::{ElementHandle, Page},
    settings::RunMode,
    wait::{any_visible, first_visible, wait_for_any, wait_for_condition, wait_for_element, wait_until_gone},
    AutomationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavState {
    AtLanding,
    OnSearchScreen,
    SearchSubmitted,
    ResultVisible,
    ClaimOpen,
    MenuClicked,
    SubPageConfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavStep {
    SearchScreen,
    ClaimSearch,
    ClaimSelect,
    MenuNavigate,
    SubPageWait,
}

impl fmt::Display for NavStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NavStep::SearchScreen => "search_screen",
            NavStep::ClaimSearch => "claim_search",
            NavStep::ClaimSelect => "claim_select",
            NavStep::MenuNavigate => "menu_navigate",
            NavStep::SubPageWait => "sub_page_wait",
        };
        f.write_str(s)
    }
}

/// Per-run bookkeeping. Lives only as long as one attempt.
#[derive(Debug, Clone)]
pub struct NavigationAttemptState {
    pub step: NavStep,
    pub reached: NavState,
    pub failures: HashMap<NavStep, u32>,
    pub started: Instant,
}

impl NavigationAttemptState {
    fn new() -> Self {
        Self {
            step: NavStep::SearchScreen,
            reached: NavState::AtLanding,
            failures: HashMap::new(),
            started: Instant::now(),
        }
    }

    fn fail(&mut self) -> u32 {
        let n = self.failures.entry(self.step).or_insert(0);
        *n += 1;
        *n
    }

    pub fn failures_at(&self, step: NavStep) -> u32 {
        self.failures.get(&step).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavRequest {
    pub claim: String,
    pub target_page: Option<String>,
    pub run_mode: RunMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationReport {
    pub reached: NavState,
    /// The opened row showed the requested claim number. `false` means the
    /// row was opened on presence alone.
    pub row_matched: bool,
    pub menu_match: Option<LabelMatch>,
}

pub struct NavigationDriver {
    page: Arc<dyn Page>,
    selectors: Arc<HostSelectors>,
    timings: Timings,
    guard: OwnershipGuard,
    state: NavigationAttemptState,
}

impl NavigationDriver {
    pub fn new(
        page: Arc<dyn Page>,
        selectors: Arc<HostSelectors>,
        timings: Timings,
        guard: OwnershipGuard,
    ) -> Self {
        Self {
            page,
            selectors,
            timings,
            guard,
            state: NavigationAttemptState::new(),
        }
    }

    pub fn attempt_state(&self) -> &NavigationAttemptState {
        &self.state
    }

    fn interactor(&self) -> Interactor<'_> {
        Interactor::new(self.page.as_ref(), self.selectors.as_ref(), &self.timings)
    }

    fn enter(&mut self, step: NavStep) {
        self.state.step = step;
        debug!(%step, "entering step");
    }

    fn reach(&mut self, state: NavState) {
        self.state.reached = state;
        info!(
            state = ?state,
            elapsed_ms = self.state.started.elapsed().as_millis() as u64,
            "navigation state reached"
        );
    }

    async fn backoff(&mut self) {
        let failures = self.state.fail();
        let delay = self.timings.step_backoff(failures.saturating_sub(1));
        debug!(step = %self.state.step, failures, ?delay, "step retry backoff");
        tokio::time::sleep(delay).await;
    }

    fn report(&self, row_matched: bool, menu_match: Option<LabelMatch>) -> NavigationReport {
        NavigationReport {
            reached: self.state.reached,
            row_matched,
            menu_match,
        }
    }

    /// Runs the protocol as far as `req.run_mode` allows.
    #[instrument(skip(self), fields(request_id = %self.guard.request_id()))]
    pub async fn run(&mut self, req: &NavRequest) -> Result<NavigationReport, AutomationError> {
        if req.run_mode == RunMode::CopyOnly {
            info!("copy_only: no navigation");
            return Ok(self.report(false, None));
        }

        self.to_search_screen().await?;
        self.guard.ensure().await?;

        self.submit_search(&req.claim).await?;
        self.guard.ensure().await?;
        if req.run_mode == RunMode::ClaimOnly {
            info!("claim_only: stopping after search submission");
            return Ok(self.report(false, None));
        }

        let (row, row_matched) = self.await_result(&req.claim).await?;
        self.guard.ensure().await?;

        self.open_claim(row).await?;
        self.guard.ensure().await?;

        let Some(target) = req.target_page.as_deref().filter(|t| !t.trim().is_empty()) else {
            return Ok(self.report(row_matched, None));
        };

        let menu_match = self.click_menu(target).await?;
        self.guard.ensure().await?;

        self.await_sub_page().await?;
        self.guard.ensure().await?;

        Ok(self.report(row_matched, Some(menu_match)))
    }

    async fn to_search_screen(&mut self) -> Result<(), AutomationError> {
        self.enter(NavStep::SearchScreen);
        let sel = self.selectors.clone();
        if self.page.query(&sel.search_screen_title).await?.is_some() {
            self.reach(NavState::OnSearchScreen);
            return Ok(());
        }

        for round in 0..self.timings.search_tab_rounds {
            self.guard.ensure().await?;
            let wait = if round == 0 {
                self.timings.element()
            } else {
                Duration::ZERO
            };
            let tab = wait_for_element(
                self.page.as_ref(),
                &sel.search_tab,
                None,
                wait,
                self.timings.poll(),
            )
            .await?;
            match tab {
                Some(tab) => self.interactor().click(&tab).await?,
                None if round == 0 => {
                    return Err(AutomationError::ElementNotFound(format!(
                        "search tab {}",
                        sel.search_tab
                    )))
                }
                None => debug!(round, "search tab missing this round"),
            }

            wait_until_gone(
                self.page.as_ref(),
                &sel.loading_markers,
                self.timings.loading_clear(),
                self.timings.poll(),
            )
            .await?;
            let screen = wait_for_element(
                self.page.as_ref(),
                &sel.search_screen_title,
                None,
                self.timings.search_screen_wait(),
                self.timings.poll(),
            )
            .await?;
            if screen.is_some() {
                self.reach(NavState::OnSearchScreen);
                return Ok(());
            }
            self.backoff().await;
        }
        Err(AutomationError::HostAnomaly(format!(
            "search screen did not open after {} rounds",
            self.timings.search_tab_rounds
        )))
    }

    /// The claim input, but only while the search screen is confirmed and
    /// the input is visible and attached.
    async fn live_claim_input(&self, timeout: Duration) -> Result<Option<ElementHandle>, AutomationError> {
        let page = self.page.as_ref();
        let sel = self.selectors.as_ref();
        wait_for_condition(page, timeout, self.timings.poll(), move || async move {
            if page.query(&sel.search_screen_title).await?.is_none() {
                return Ok(None);
            }
            first_visible(page, &sel.claim_input).await
        })
        .await
    }

    async fn submission_started(&self, button: &ElementHandle) -> Result<bool, AutomationError> {
        let page = self.page.as_ref();
        let sel = self.selectors.as_ref();
        let started = wait_for_condition(
            page,
            self.timings.submit_start(),
            self.timings.poll(),
            move || async move {
                if any_visible(page, &sel.loading_markers).await?
                    || page.query(&sel.results_container).await?.is_some()
                {
                    return Ok(Some(()));
                }
                let disabled = match page.is_disabled(button).await {
                    Ok(d) => d,
                    Err(AutomationError::ElementNotFound(_)) => false,
                    Err(e) => return Err(e),
                };
                Ok(disabled.then_some(()))
            },
        )
        .await?;
        Ok(started.is_some())
    }

    async fn submit_search(&mut self, claim: &str) -> Result<(), AutomationError> {
        self.enter(NavStep::ClaimSearch);
        let sel = self.selectors.clone();

        for attempt in 1..=self.timings.submit_attempts {
            self.guard.ensure().await?;
            let wait = if attempt == 1 {
                self.timings.element()
            } else {
                self.timings.search_screen_wait()
            };
            let input = self.live_claim_input(wait).await?.ok_or_else(|| {
                AutomationError::ElementNotFound(format!("visible claim input {}", sel.claim_input))
            })?;

            let interactor = self.interactor();
            interactor.click(&input).await?;
            if !interactor.set_value(&input, claim).await? {
                debug!(attempt, "claim input did not take the value on first write");
            }
            let latch = interactor.latch_value(&input, claim, &self.guard).await?;
            if latch.superseded {
                return Err(AutomationError::Superseded {
                    request_id: self.guard.request_id().to_string(),
                });
            }
            if !latch.verified {
                warn!(attempt, focus_lost = latch.focus_lost, "claim value did not hold");
                self.backoff().await;
                continue;
            }
            if latch.reapplied > 0 {
                debug!(reapplied = latch.reapplied, "host reverted the claim input");
            }

            let button = wait_for_element(
                self.page.as_ref(),
                &sel.search_button,
                None,
                self.timings.element(),
                self.timings.poll(),
            )
            .await?
            .ok_or_else(|| AutomationError::ElementNotFound(format!("search button {}", sel.search_button)))?;
            self.interactor().click(&button).await?;

            if self.submission_started(&button).await? {
                self.reach(NavState::SearchSubmitted);
                return Ok(());
            }
            warn!(attempt, "search submission showed no sign of starting");
            self.backoff().await;
        }
        Err(AutomationError::HostAnomaly(format!(
            "search did not start after {} submissions",
            self.timings.submit_attempts
        )))
    }

    async fn await_result(&mut self, claim: &str) -> Result<(ElementHandle, bool), AutomationError> {
        self.enter(NavStep::ClaimSelect);
        let sel = self.selectors.clone();
        let page = self.page.as_ref();

        let mut row = wait_for_element(page, &sel.result_row, Some(claim), self.timings.result_text(), self.timings.poll())
            .await?;
        if row.is_none() {
            self.guard.ensure().await?;
            warn!("result row never showed the claim; re-clicking search once");
            if let Some(button) = page.query(&sel.search_button).await? {
                self.interactor().click(&button).await?;
            }
            row = wait_for_element(page, &sel.result_row, Some(claim), self.timings.result_text(), self.timings.poll())
                .await?;
        }
        if let Some(row) = row {
            self.reach(NavState::ResultVisible);
            return Ok((row, true));
        }

        self.guard.ensure().await?;
        let fallback = wait_for_element(page, &sel.result_row, None, self.timings.result_row(), self.timings.poll())
            .await?;
        match fallback {
            Some(row) => {
                warn!("opening first result row without a claim number match");
                self.reach(NavState::ResultVisible);
                Ok((row, false))
            }
            None => Err(AutomationError::Timeout(format!(
                "no result row {} appeared",
                sel.result_row
            ))),
        }
    }

    async fn open_claim(&mut self, mut row: ElementHandle) -> Result<(), AutomationError> {
        let sel = self.selectors.clone();
        for attempt in 1..=self.timings.open_click_attempts {
            self.guard.ensure().await?;
            if !self.page.is_connected(&row).await.unwrap_or(false) {
                match self.page.query(&sel.result_row).await? {
                    Some(fresh) => row = fresh,
                    None if any_visible(self.page.as_ref(), &sel.claim_open_markers).await? => {
                        self.reach(NavState::ClaimOpen);
                        return Ok(());
                    }
                    None => {
                        return Err(AutomationError::ElementNotFound(format!(
                            "result row {} vanished",
                            sel.result_row
                        )))
                    }
                }
            }
            self.interactor().click(&row).await?;
            let opened = wait_for_any(
                self.page.as_ref(),
                &sel.claim_open_markers,
                self.timings.open_marker(),
                self.timings.poll(),
            )
            .await?;
            if let Some((marker, _)) = opened {
                debug!(attempt, marker = %sel.claim_open_markers[marker], "claim open marker seen");
                self.reach(NavState::ClaimOpen);
                return Ok(());
            }
            self.state.fail();
            debug!(attempt, "result click swallowed; retrying");
            tokio::time::sleep(self.timings.open_gap()).await;
        }
        Err(AutomationError::HostAnomaly(format!(
            "claim did not open after {} clicks",
            self.timings.open_click_attempts
        )))
    }

    async fn click_menu(&mut self, target: &str) -> Result<LabelMatch, AutomationError> {
        self.enter(NavStep::MenuNavigate);
        let sel = self.selectors.clone();
        let page = self.page.as_ref();

        let container = wait_for_element(page, &sel.menu_container, None, self.timings.menu(), self.timings.poll())
            .await?
            .ok_or_else(|| AutomationError::ElementNotFound(format!("menu {}", sel.menu_container)))?;

        let container_ref = &container;
        let menu_labels = sel.menu_labels.as_str();
        let found = wait_for_condition(page, self.timings.menu(), self.timings.poll(), move || async move {
            let mut handles = Vec::new();
            let mut texts = Vec::new();
            for el in page.query_all(menu_labels, Some(container_ref)).await? {
                if !page.is_visible(&el).await.unwrap_or(false) {
                    continue;
                }
                texts.push(page.text(&el).await.unwrap_or_default());
                handles.push(el);
            }
            Ok(find_label_match(&texts, target).map(|m| (handles[m.index].clone(), texts[m.index].clone(), m)))
        })
        .await?;

        let Some((label, text, m)) = found else {
            return Err(AutomationError::MissingInput(format!(
                "no menu entry matches target page {target:?}"
            )));
        };
        info!(target, label = %text.trim(), strategy = ?m.strategy, "menu label matched");

        let clickable = match page.closest(&label, &sel.menu_clickable).await? {
            Some(c) => c,
            None => match page.closest(&label, "li").await? {
                Some(li) => li,
                None => page.parent(&label).await?.unwrap_or_else(|| label.clone()),
            },
        };
        self.interactor().click(&clickable).await?;
        self.reach(NavState::MenuClicked);
        tokio::time::sleep(self.timings.menu_settle()).await;
        Ok(m)
    }

    async fn await_sub_page(&mut self) -> Result<(), AutomationError> {
        self.enter(NavStep::SubPageWait);
        let sel = self.selectors.clone();
        let loaded = wait_for_any(
            self.page.as_ref(),
            &sel.subpage_markers,
            self.timings.subpage(),
            self.timings.poll(),
        )
        .await?;
        if loaded.is_none() {
            self.state.fail();
            return Err(AutomationError::HostAnomaly(format!(
                "target screen not confirmed within {:?}",
                self.timings.subpage()
            )));
        }
        self.reach(NavState::SubPageConfirmed);
        Ok(())
    }
}
