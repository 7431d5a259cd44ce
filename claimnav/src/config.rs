//! Runtime configuration: host endpoints, timing constants and the selector
//! tables used to drive the claim application and the portal.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::AutomationError;

pub const DEFAULT_TARGET_ORIGIN: &str = "https://claimcenter.example.internal";
pub const DEFAULT_ENTRY_PATH: &str = "/ClaimCenter.do";
pub const DEFAULT_BRIDGE_ADDR: &str = "127.0.0.1:17373";

fn optional_env(key: &str) -> Result<Option<String>, AutomationError> {
    match std::env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(AutomationError::InvalidArgument(format!("{key}: {e}"))),
    }
}

/// Process-level settings for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Origin of the claim application, e.g. `https://cc.corp`.
    pub target_origin: String,
    /// Path of the entry page on the target origin.
    pub entry_path: String,
    /// Loopback address the extension bridge listens on.
    pub bridge_addr: String,
    pub log_level: String,
    /// Overrides the default log directory under the platform data dir.
    pub log_dir: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            target_origin: DEFAULT_TARGET_ORIGIN.to_string(),
            entry_path: DEFAULT_ENTRY_PATH.to_string(),
            bridge_addr: DEFAULT_BRIDGE_ADDR.to_string(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl HostConfig {
    /// Resolves every field from `CLAIMNAV_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, AutomationError> {
        let defaults = Self::default();
        let target_origin = optional_env("CLAIMNAV_TARGET_ORIGIN")?
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(defaults.target_origin);
        url::Url::parse(&target_origin).map_err(|e| {
            AutomationError::InvalidArgument(format!(
                "CLAIMNAV_TARGET_ORIGIN must be an absolute URL: {e}"
            ))
        })?;
        Ok(Self {
            target_origin,
            entry_path: optional_env("CLAIMNAV_ENTRY_PATH")?.unwrap_or(defaults.entry_path),
            bridge_addr: optional_env("CLAIMNAV_BRIDGE_ADDR")?.unwrap_or(defaults.bridge_addr),
            log_level: optional_env("CLAIMNAV_LOG_LEVEL")?.unwrap_or(defaults.log_level),
            log_dir: optional_env("CLAIMNAV_LOG_DIR")?,
        })
    }

    pub fn entry_url(&self) -> String {
        format!("{}{}", self.target_origin, self.entry_path)
    }
}

/// Every timeout, retry count and backoff used by the automation, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timings {
    pub poll_ms: u64,
    pub overlay_ms: u64,
    pub element_ms: u64,
    pub loading_clear_ms: u64,

    pub search_tab_rounds: u32,
    pub search_screen_wait_ms: u64,
    pub step_backoff_base_ms: u64,
    pub step_backoff_max_ms: u64,

    pub latch_window_ms: u64,
    pub latch_tick_ms: u64,
    pub submit_attempts: u32,
    pub submit_start_ms: u64,

    pub result_text_ms: u64,
    pub result_row_ms: u64,

    pub open_click_attempts: u32,
    pub open_marker_ms: u64,
    pub open_gap_ms: u64,

    pub menu_ms: u64,
    pub menu_settle_ms: u64,
    pub subpage_ms: u64,

    pub driver_poll_ms: u64,
    pub driver_settle_ms: u64,

    pub session_timeout_ms: u64,
    pub session_settle_ms: u64,
    pub session_debounce_ms: u64,
    pub session_url_poll_ms: u64,

    pub watchdog_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub claim_failure_threshold: u32,
    pub claim_failure_cooldown_ms: u64,

    pub tab_complete_ms: u64,
    pub tab_poll_ms: u64,
    pub ping_attempts: u32,
    pub ping_backoff_base_ms: u64,
    pub ping_backoff_step_ms: u64,
    pub delivery_timeout_ms: u64,

    pub trigger_cooldown_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_ms: 250,
            overlay_ms: 10_000,
            element_ms: 15_000,
            loading_clear_ms: 4_000,

            search_tab_rounds: 20,
            search_screen_wait_ms: 900,
            step_backoff_base_ms: 150,
            step_backoff_max_ms: 1_500,

            latch_window_ms: 600,
            latch_tick_ms: 40,
            submit_attempts: 4,
            submit_start_ms: 2_200,

            result_text_ms: 10_000,
            result_row_ms: 14_000,

            open_click_attempts: 20,
            open_marker_ms: 1_400,
            open_gap_ms: 300,

            menu_ms: 15_000,
            menu_settle_ms: 1_200,
            subpage_ms: 20_000,

            driver_poll_ms: 15_000,
            driver_settle_ms: 300,

            session_timeout_ms: 300_000,
            session_settle_ms: 1_200,
            session_debounce_ms: 400,
            session_url_poll_ms: 800,

            watchdog_ms: 45_000,
            max_attempts: 3,
            retry_delay_ms: 2_500,
            claim_failure_threshold: 3,
            claim_failure_cooldown_ms: 600_000,

            tab_complete_ms: 25_000,
            tab_poll_ms: 250,
            ping_attempts: 12,
            ping_backoff_base_ms: 250,
            ping_backoff_step_ms: 50,
            delivery_timeout_ms: 5_000,

            trigger_cooldown_ms: 300,
        }
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

impl Timings {
    pub fn poll(&self) -> Duration {
        ms(self.poll_ms)
    }
    pub fn overlay(&self) -> Duration {
        ms(self.overlay_ms)
    }
    pub fn element(&self) -> Duration {
        ms(self.element_ms)
    }
    pub fn loading_clear(&self) -> Duration {
        ms(self.loading_clear_ms)
    }
    pub fn search_screen_wait(&self) -> Duration {
        ms(self.search_screen_wait_ms)
    }
    pub fn latch_window(&self) -> Duration {
        ms(self.latch_window_ms)
    }
    pub fn latch_tick(&self) -> Duration {
        ms(self.latch_tick_ms)
    }
    pub fn submit_start(&self) -> Duration {
        ms(self.submit_start_ms)
    }
    pub fn result_text(&self) -> Duration {
        ms(self.result_text_ms)
    }
    pub fn result_row(&self) -> Duration {
        ms(self.result_row_ms)
    }
    pub fn open_marker(&self) -> Duration {
        ms(self.open_marker_ms)
    }
    pub fn open_gap(&self) -> Duration {
        ms(self.open_gap_ms)
    }
    pub fn menu(&self) -> Duration {
        ms(self.menu_ms)
    }
    pub fn menu_settle(&self) -> Duration {
        ms(self.menu_settle_ms)
    }
    pub fn subpage(&self) -> Duration {
        ms(self.subpage_ms)
    }
    pub fn driver_poll(&self) -> Duration {
        ms(self.driver_poll_ms)
    }
    pub fn driver_settle(&self) -> Duration {
        ms(self.driver_settle_ms)
    }
    pub fn session_timeout(&self) -> Duration {
        ms(self.session_timeout_ms)
    }
    pub fn session_settle(&self) -> Duration {
        ms(self.session_settle_ms)
    }
    pub fn session_debounce(&self) -> Duration {
        ms(self.session_debounce_ms)
    }
    pub fn session_url_poll(&self) -> Duration {
        ms(self.session_url_poll_ms)
    }
    pub fn watchdog(&self) -> Duration {
        ms(self.watchdog_ms)
    }
    pub fn retry_delay(&self) -> Duration {
        ms(self.retry_delay_ms)
    }
    pub fn claim_failure_cooldown(&self) -> Duration {
        ms(self.claim_failure_cooldown_ms)
    }
    pub fn tab_complete(&self) -> Duration {
        ms(self.tab_complete_ms)
    }
    pub fn tab_poll(&self) -> Duration {
        ms(self.tab_poll_ms)
    }
    pub fn delivery_timeout(&self) -> Duration {
        ms(self.delivery_timeout_ms)
    }
    pub fn trigger_cooldown(&self) -> Duration {
        ms(self.trigger_cooldown_ms)
    }

    /// Backoff between navigation step retries: doubles from the base, capped.
    pub fn step_backoff(&self, failures: u32) -> Duration {
        let factor = 1u64 << failures.min(16);
        ms(self
            .step_backoff_base_ms
            .saturating_mul(factor)
            .min(self.step_backoff_max_ms))
    }

    /// Sleep before the `attempt`-th ping retry (zero based).
    pub fn ping_backoff(&self, attempt: u32) -> Duration {
        ms(self.ping_backoff_base_ms + self.ping_backoff_step_ms * u64::from(attempt))
    }
}

/// Selector strings and label texts for the pages being driven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostSelectors {
    pub search_screen_title: String,
    pub search_tab: String,
    pub claim_input: String,
    pub search_button: String,
    pub result_row: String,
    pub results_container: String,
    pub loading_markers: Vec<String>,
    pub click_overlay: String,
    pub click_overlay_busy_class: String,
    pub claim_open_markers: Vec<String>,
    pub menu_container: String,
    pub menu_labels: String,
    pub menu_clickable: String,
    pub subpage_markers: Vec<String>,
    pub vehicle_incident_rows: String,
    pub driver_value: String,
    pub loss_party: String,
    pub insured_loss_text: String,
    pub task_description: String,
}

impl Default for HostSelectors {
    fn default() -> Self {
        Self {
            search_screen_title: "#SimpleClaimSearch-SimpleClaimSearchScreen-ttlBar".into(),
            search_tab: "#TabBar-SearchTab div".into(),
            claim_input:
                r#"input[name="SimpleClaimSearch-SimpleClaimSearchScreen-SimpleClaimSearchDV-ClaimNumber"]"#
                    .into(),
            search_button:
                "#SimpleClaimSearch-SimpleClaimSearchScreen-SimpleClaimSearchDV-ClaimSearchAndResetInputSet-Search"
                    .into(),
            result_row:
                "#SimpleClaimSearch-SimpleClaimSearchScreen-SimpleClaimSearchResultsLV-0-ClaimNumber_button"
                    .into(),
            results_container: "#SimpleClaimSearch-SimpleClaimSearchScreen-SimpleClaimSearchResultsLV"
                .into(),
            loading_markers: vec![".gw-loading".into(), ".gw-busy-indicator".into()],
            click_overlay: "#gw-click-overlay".into(),
            click_overlay_busy_class: "gw-disable-click".into(),
            claim_open_markers: vec![
                "#Claim-MenuLinks".into(),
                "#Claim-ClaimInfoBar".into(),
                "#ClaimSummary-ClaimSummaryScreen-ttlBar".into(),
            ],
            menu_container: "#Claim-MenuLinks".into(),
            menu_labels:
                "div.gw-label, span.gw-label, a.gw-label, li.gw-menu-item, a[role='menuitem'], li a"
                    .into(),
            menu_clickable: r#"a, button, [role="menuitem"]"#.into(),
            subpage_markers: vec![
                "#ClaimLossDetails-ClaimLossDetailsScreen-ttlBar".into(),
                r#"[id$="Screen-ttlBar"]:not(#SimpleClaimSearch-SimpleClaimSearchScreen-ttlBar)"#
                    .into(),
            ],
            vehicle_incident_rows:
                "#ClaimLossDetails-ClaimLossDetailsScreen-LossDetailsPanelSet-LossDetailsCardCV-LossDetailsDV-EditableVehicleIncidentsLV tbody tr"
                    .into(),
            driver_value:
                r#"[id*="-Driver"] .gw-value-readonly-wrapper, [id*="-Driver"] .gw-vw--value"#
                    .into(),
            loss_party: r#"[id*="-LossParty"]"#.into(),
            insured_loss_text: "Insured's loss".into(),
            task_description: "#taskDescription".into(),
        }
    }
}

fn read_config(path: &Path) -> Result<String, AutomationError> {
    std::fs::read_to_string(path)
        .map_err(|e| AutomationError::InvalidArgument(format!("read {}: {e}", path.display())))
}

impl HostSelectors {
    /// Loads overrides from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AutomationError> {
        Ok(serde_json::from_str(&read_config(path.as_ref())?)?)
    }
}

impl Timings {
    /// Same override rules as [`HostSelectors::from_json_file`], camelCase keys.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AutomationError> {
        Ok(serde_json::from_str(&read_config(path.as_ref())?)?)
    }
}
