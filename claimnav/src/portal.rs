//! The initiating page: reads the claim number off the portal task and hands
//! it to the claim application.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::HostSelectors,
    handoff::{HandoffCoordinator, HandoffTicket},
    page::Page,
    settings::{RunMode, SettingsResolver},
    AutomationError,
};

pub const MISSING_CLAIM_ALERT: &str = "Could not find Claim # in #taskDescription.";

static CLAIM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z]\d{11})\b").expect("claim pattern compiles"));
static POLICY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]\d{6,12})\b").expect("policy pattern compiles"));

/// Copies text for the user to paste elsewhere.
pub trait Clipboard: Send + Sync {
    fn copy_text(&self, text: &str) -> Result<(), AutomationError>;
}

/// First claim number (a letter and eleven digits) in `text`.
pub fn extract_claim(text: &str) -> Option<String> {
    CLAIM_RE.captures(text).map(|c| c[1].to_string())
}

/// First policy-looking token that is not the claim number itself.
pub fn extract_policy(text: &str, claim: &str) -> Option<String> {
    POLICY_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .find(|p| p != claim)
}

pub enum TriggerOutcome {
    /// Pressed again within the cooldown of an accepted trigger.
    CoolingDown,
    HandedOff { ticket: HandoffTicket, copied: bool },
}

pub struct Portal {
    page: Arc<dyn Page>,
    selectors: Arc<HostSelectors>,
    coordinator: Arc<HandoffCoordinator>,
    settings: SettingsResolver,
    clipboard: Arc<dyn Clipboard>,
    cooldown: Duration,
    last_trigger: Mutex<Option<Instant>>,
}

impl Portal {
    pub fn new(
        page: Arc<dyn Page>,
        selectors: Arc<HostSelectors>,
        coordinator: Arc<HandoffCoordinator>,
        settings: SettingsResolver,
        clipboard: Arc<dyn Clipboard>,
        cooldown: Duration,
    ) -> Self {
        Self {
            page,
            selectors,
            coordinator,
            settings,
            clipboard,
            cooldown,
            last_trigger: Mutex::new(None),
        }
    }

    fn cooling_down(&self) -> bool {
        let mut last = self.last_trigger.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        if last.is_some_and(|t| now.duration_since(t) < self.cooldown) {
            return true;
        }
        *last = Some(now);
        false
    }

    async fn task_text(&self) -> Result<String, AutomationError> {
        match self.page.query(&self.selectors.task_description).await? {
            Some(el) => Ok(self.page.text(&el).await.unwrap_or_default()),
            None => Ok(String::new()),
        }
    }

    /// Handles one press of the portal button.
    ///
    /// A missing claim number is reported to the user and returned as
    /// [`AutomationError::MissingInput`]; nothing is written in that case.
    #[instrument(skip(self))]
    pub async fn trigger(&self, force: bool) -> Result<TriggerOutcome, AutomationError> {
        if self.cooling_down() {
            debug!("trigger ignored during cooldown");
            return Ok(TriggerOutcome::CoolingDown);
        }

        let text = self.task_text().await?;
        let Some(claim) = extract_claim(&text) else {
            warn!("no claim number on the task");
            self.page.alert(MISSING_CLAIM_ALERT).await?;
            return Err(AutomationError::MissingInput("claim number on task".into()));
        };
        let policy = extract_policy(&text, &claim);

        let mut copied = false;
        if self.settings.run_mode().await == RunMode::CopyOnly {
            match self.clipboard.copy_text(&claim) {
                Ok(()) => {
                    copied = true;
                    info!(%claim, "claim copied to clipboard");
                }
                Err(e) => warn!(error = %e, "clipboard copy failed"),
            }
        }

        let ticket = self
            .coordinator
            .submit_handoff(&claim, policy.as_deref(), force)
            .await?;
        info!(
            request_id = %ticket.record.request_id,
            %claim,
            policy = ?policy,
            kick = ticket.kick,
            "portal handoff submitted"
        );
        Ok(TriggerOutcome::HandedOff { ticket, copied })
    }
}
