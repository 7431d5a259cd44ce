//! Opening the external underwriting form with values scraped from the claim's
//! loss details screen.
//!
//! Parameters arrive on the entry URL or with `RUN_NOW` and are stashed per
//! tab, since the host's own navigation strips the query string long before
//! the loss details screen renders.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{HostSelectors, Timings},
    menu::normalize_label,
    messages::FormParams,
    page::{query_param, ElementHandle, Page},
    wait::wait_for_condition,
    AutomationError,
};

/// Normalised target label that enables the form hand-off.
pub const LOSS_DETAILS_TARGET: &str = "loss details";

pub const MISSING_DRIVER_ALERT: &str = "Could not find driver name in Loss Details. Ensure you are on Loss Details and the Vehicle Incident row is expanded/visible.";

/// Where the form server lives. Parameter names are fixed by that server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FormConfig {
    pub base_url: String,
    pub template_path: String,
}

impl Default for FormConfig {
    fn default() -> Self {
        Self {
            base_url: "http://forms.example.internal/sites/formsmgmt/CommlForms/_layouts/15/FormServer.aspx"
                .into(),
            template_path: "/sites/formsmgmt/CommlForms/CUW134/forms/template.xsn".into(),
        }
    }
}

/// Builds the form URL. The template location is encoded once and the
/// `%3Fopenin=browser` suffix is appended literally, so the form server sees
/// a single level of encoding.
pub fn build_form_url(cfg: &FormConfig, driver: Option<&str>, params: &FormParams) -> String {
    let mut url = format!(
        "{}?XsnLocation={}%3Fopenin=browser",
        cfg.base_url,
        urlencoding::encode(&cfg.template_path)
    );
    let fields = [
        ("x", params.x.as_deref()),
        ("t4", driver),
        ("t3", params.t3.as_deref()),
        ("t5", params.t5.as_deref()),
    ];
    for (name, value) in fields {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            url.push('&');
            url.push_str(name);
            url.push('=');
            url.push_str(&urlencoding::encode(v));
        }
    }
    url
}

/// Reads `x`, `t3`, `t5` and `openCUW134` from a page URL.
pub fn params_from_url(page_url: &str) -> FormParams {
    FormParams {
        x: query_param(page_url, "x"),
        t3: query_param(page_url, "t3"),
        t5: query_param(page_url, "t5"),
        open: query_param(page_url, "openCUW134").is_some_and(|v| v.eq_ignore_ascii_case("1")),
    }
}

/// Accepts trimmed text of 2 to 80 characters that does not look like a
/// field label.
pub fn pick_driver_name(text: &str) -> Option<String> {
    let name = text.trim();
    let len = name.chars().count();
    if !(2..=80).contains(&len) {
        return None;
    }
    let lower = name.to_lowercase();
    let mentions_label = ["driver", "claim", "loss"].iter().any(|w| lower.contains(w));
    if mentions_label && name.contains(':') {
        return None;
    }
    Some(name.to_string())
}

/// Per-tab parameter stash and open-debounce signature.
#[derive(Debug, Default)]
pub struct FormStash {
    params: Mutex<Option<FormParams>>,
    last_signature: Mutex<Option<String>>,
}

impl FormStash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges message, URL and stashed values, first non-empty wins, and
    /// stashes the result. The open flag comes from the message when one was
    /// sent, otherwise it is set if either the URL or the stash has it.
    pub fn merge(&self, from_message: Option<&FormParams>, from_url: &FormParams) -> FormParams {
        let mut slot = self.params.lock().unwrap_or_else(|p| p.into_inner());
        let stashed = slot.clone().unwrap_or_default();
        let pick = |m: Option<&Option<String>>, u: &Option<String>, s: &Option<String>| {
            [m.and_then(Option::as_ref), u.as_ref(), s.as_ref()]
                .into_iter()
                .flatten()
                .find(|v| !v.is_empty())
                .cloned()
        };
        let merged = FormParams {
            x: pick(from_message.map(|m| &m.x), &from_url.x, &stashed.x),
            t3: pick(from_message.map(|m| &m.t3), &from_url.t3, &stashed.t3),
            t5: pick(from_message.map(|m| &m.t5), &from_url.t5, &stashed.t5),
            open: match from_message {
                Some(m) => m.open,
                None => from_url.open || stashed.open,
            },
        };
        *slot = Some(merged.clone());
        merged
    }

    pub fn current(&self) -> FormParams {
        self.params
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .unwrap_or_default()
    }

    /// Records `signature`; false when it equals the previous one.
    fn claim_signature(&self, signature: String) -> bool {
        let mut last = self.last_signature.lock().unwrap_or_else(|p| p.into_inner());
        if last.as_deref() == Some(signature.as_str()) {
            return false;
        }
        *last = Some(signature);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormOutcome {
    Opened { url: String },
    /// Same page and values as the last open.
    Debounced,
}

pub struct FormLauncher {
    page: Arc<dyn Page>,
    selectors: Arc<HostSelectors>,
    timings: Timings,
    config: FormConfig,
    stash: Arc<FormStash>,
}

impl FormLauncher {
    pub fn new(
        page: Arc<dyn Page>,
        selectors: Arc<HostSelectors>,
        timings: Timings,
        config: FormConfig,
        stash: Arc<FormStash>,
    ) -> Self {
        Self {
            page,
            selectors,
            timings,
            config,
            stash,
        }
    }

    pub fn wants_form(&self, target_page: Option<&str>) -> bool {
        self.stash.current().open
            && target_page.is_some_and(|t| normalize_label(t) == LOSS_DETAILS_TARGET)
    }

    async fn insured_row(&self) -> Result<Option<ElementHandle>, AutomationError> {
        for row in self.page.query_all(&self.selectors.vehicle_incident_rows, None).await? {
            let text = self.page.text(&row).await.unwrap_or_default();
            if text.contains(&self.selectors.insured_loss_text) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    async fn text_in_row(&self, row: &ElementHandle, selector: &str) -> Result<Option<String>, AutomationError> {
        let Some(el) = self.page.query_all(selector, Some(row)).await?.into_iter().next() else {
            return Ok(None);
        };
        Ok(self.page.text(&el).await.ok())
    }

    pub async fn read_driver(&self) -> Result<Option<String>, AutomationError> {
        let Some(row) = self.insured_row().await? else {
            debug!("no insured's loss row");
            return Ok(None);
        };
        Ok(self
            .text_in_row(&row, &self.selectors.driver_value)
            .await?
            .and_then(|t| pick_driver_name(&t)))
    }

    pub async fn read_loss_party(&self) -> Result<Option<String>, AutomationError> {
        let Some(row) = self.insured_row().await? else {
            return Ok(None);
        };
        Ok(self
            .text_in_row(&row, &self.selectors.loss_party)
            .await?
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()))
    }

    /// Navigates the tab to the form using the driver currently on screen.
    #[instrument(skip(self))]
    pub async fn open_form(&self) -> Result<FormOutcome, AutomationError> {
        let Some(driver) = self.read_driver().await? else {
            warn!("driver name not found on loss details");
            self.page.alert(MISSING_DRIVER_ALERT).await?;
            return Err(AutomationError::MissingInput("driver name".into()));
        };
        let loss_party = self.read_loss_party().await?;
        let params = self.stash.current();
        info!(driver = %driver, loss_party = ?loss_party, x = ?params.x, t3 = ?params.t3, t5 = ?params.t5, "form values collected");

        let signature = json!({
            "href": self.page.url().await?,
            "x": params.x,
            "t3": params.t3,
            "t5": params.t5,
            "driver": driver,
        })
        .to_string();
        if !self.stash.claim_signature(signature) {
            info!("form already opened with these values");
            return Ok(FormOutcome::Debounced);
        }

        let url = build_form_url(&self.config, Some(&driver), &params);
        info!(%url, "opening form");
        self.page.navigate(&url).await?;
        Ok(FormOutcome::Opened { url })
    }

    /// Runs after the loss details screen is confirmed: waits for the driver
    /// value to render, then opens the form. `None` when the form was not
    /// requested for this run.
    #[instrument(skip(self))]
    pub async fn open_after_navigation(
        &self,
        target_page: Option<&str>,
    ) -> Result<Option<FormOutcome>, AutomationError> {
        if !self.wants_form(target_page) {
            return Ok(None);
        }
        info!("form requested; waiting for driver value");
        let driver = wait_for_condition(
            self.page.as_ref(),
            self.timings.driver_poll(),
            self.timings.poll(),
            || self.read_driver(),
        )
        .await?;
        if driver.is_none() {
            warn!(timeout = ?self.timings.driver_poll(), "driver value never populated");
            self.page.alert(MISSING_DRIVER_ALERT).await?;
            return Err(AutomationError::MissingInput("driver name never populated".into()));
        }
        tokio::time::sleep(self.timings.driver_settle()).await;
        self.open_form().await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_vehicle_incidents, FakePage};
    use std::time::Duration;

    fn params(x: &str, t3: &str, t5: &str, open: bool) -> FormParams {
        let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());
        FormParams {
            x: opt(x),
            t3: opt(t3),
            t5: opt(t5),
            open,
        }
    }

    fn launcher(page: &FakePage, stash: Arc<FormStash>) -> FormLauncher {
        FormLauncher::new(
            Arc::new(page.clone()),
            Arc::new(HostSelectors::default()),
            Timings::default(),
            FormConfig::default(),
            stash,
        )
    }

    #[test]
    fn driver_name_filter() {
        assert_eq!(pick_driver_name("  Jane Doe "), Some("Jane Doe".into()));
        assert_eq!(pick_driver_name("J"), None);
        assert_eq!(pick_driver_name(&"x".repeat(81)), None);
        assert_eq!(pick_driver_name("Driver:"), None);
        assert_eq!(pick_driver_name("Claim Loss Driver"), Some("Claim Loss Driver".into()));
    }

    #[test]
    fn form_url_keeps_parameter_order_and_single_encoding() {
        let cfg = FormConfig {
            base_url: "http://forms.corp/FormServer.aspx".into(),
            ..FormConfig::default()
        };
        let url = build_form_url(&cfg, Some("Jane Doe"), &params("P 1", "T&3", "01/02/2024", true));
        assert_eq!(
            url,
            "http://forms.corp/FormServer.aspx?XsnLocation=%2Fsites%2Fformsmgmt%2FCommlForms%2FCUW134%2Fforms%2Ftemplate.xsn%3Fopenin=browser&x=P%201&t4=Jane%20Doe&t3=T%263&t5=01%2F02%2F2024"
        );
        let bare = build_form_url(&cfg, None, &FormParams::default());
        assert!(bare.ends_with("%3Fopenin=browser"));
    }

    #[test]
    fn url_params_and_merge_precedence() {
        let from_url = params_from_url("https://cc.corp/ClaimCenter.do?x=URLX&t5=URL5&openCUW134=1");
        assert_eq!(from_url, params("URLX", "", "URL5", true));

        let stash = FormStash::new();
        stash.merge(None, &params("OLD", "OLD3", "", false));
        let merged = stash.merge(Some(&params("MSG", "", "", false)), &from_url);
        assert_eq!(merged, params("MSG", "OLD3", "URL5", false));

        // Later in-app navigation has no query string; the stash survives it.
        let after_nav = stash.merge(None, &FormParams::default());
        assert_eq!(after_nav, merged);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_form_once_driver_renders() {
        let sel = HostSelectors::default();
        let page = FakePage::new("https://cc.corp/ClaimCenter.do");
        let stash = Arc::new(FormStash::new());
        stash.merge(Some(&params("PUB6", "T3", "T5", true)), &FormParams::default());

        let host = page.clone();
        let s = sel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            add_vehicle_incidents(&host, &s, "Jane Doe", "Insured");
        });

        let l = launcher(&page, stash);
        let outcome = l.open_after_navigation(Some("loss_details")).await.unwrap();
        let Some(FormOutcome::Opened { url }) = outcome else {
            panic!("expected the form to open, got {outcome:?}");
        };
        assert!(url.contains("&x=PUB6&t4=Jane%20Doe&t3=T3&t5=T5"));
        assert_eq!(page.navigations(), vec![url]);
        assert!(page.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn other_targets_or_missing_flag_skip_the_form() {
        let page = FakePage::new("https://cc.corp/ClaimCenter.do");
        let stash = Arc::new(FormStash::new());
        let l = launcher(&page, stash.clone());
        assert_eq!(l.open_after_navigation(Some("loss_details")).await.unwrap(), None);

        stash.merge(Some(&params("", "", "", true)), &FormParams::default());
        assert_eq!(l.open_after_navigation(Some("summary")).await.unwrap(), None);
        assert!(page.navigations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_driver_alerts_and_is_not_retryable() {
        let page = FakePage::new("https://cc.corp/ClaimCenter.do");
        let stash = Arc::new(FormStash::new());
        stash.merge(Some(&params("", "", "", true)), &FormParams::default());
        let l = launcher(&page, stash);

        let err = l.open_after_navigation(Some("Loss Details")).await.unwrap_err();
        assert!(matches!(err, AutomationError::MissingInput(_)));
        assert!(!err.is_retryable());
        assert_eq!(page.alerts(), vec![MISSING_DRIVER_ALERT.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_signature_is_debounced() {
        let sel = HostSelectors::default();
        let page = FakePage::new("https://cc.corp/ClaimCenter.do");
        add_vehicle_incidents(&page, &sel, "Jane Doe", "Insured");
        let stash = Arc::new(FormStash::new());
        stash.merge(Some(&params("PUB6", "", "", true)), &FormParams::default());
        let l = launcher(&page, stash);

        // Reset the URL so the second attempt sees the same href.
        let first = l.open_form().await.unwrap();
        assert!(matches!(first, FormOutcome::Opened { .. }));
        page.set_url("https://cc.corp/ClaimCenter.do");
        assert_eq!(l.open_form().await.unwrap(), FormOutcome::Debounced);
        assert_eq!(page.navigations().len(), 1);
    }
}
