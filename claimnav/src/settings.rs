use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    store::{self, keys, KvStore},
    AutomationError,
};

pub const DEFAULT_TARGET_PAGE: &str = "claim_overview_summary";

/// How far a run may drive the claim application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Search, open the claim and navigate to the target page.
    #[default]
    Full,
    /// Submit the search, stop before opening the result.
    ClaimOnly,
    /// No navigation; the claim is only copied to the clipboard.
    CopyOnly,
}

impl RunMode {
    /// Lenient parse; anything unrecognised is `Full`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "claim_only" => RunMode::ClaimOnly,
            "copy_only" => RunMode::CopyOnly,
            _ => RunMode::Full,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::ClaimOnly => "claim_only",
            RunMode::CopyOnly => "copy_only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonToggles {
    pub p2cc: bool,
    #[serde(rename = "thirdYear")]
    pub third_year: bool,
}

impl Default for ButtonToggles {
    fn default() -> Self {
        Self {
            p2cc: true,
            third_year: true,
        }
    }
}

/// User preferences, stored under `settings_v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub run_mode: RunMode,
    pub target_page: String,
    pub buttons: ButtonToggles,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Full,
            target_page: DEFAULT_TARGET_PAGE.to_string(),
            buttons: ButtonToggles::default(),
        }
    }
}

impl Settings {
    /// Builds settings from whatever shape was stored, filling defaults for
    /// missing or mistyped fields.
    pub fn normalize(raw: &Value) -> Self {
        let defaults = Settings::default();
        let run_mode = raw
            .get("runMode")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(RunMode::parse)
            .unwrap_or(defaults.run_mode);
        let target_page = raw
            .get("targetPage")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or(defaults.target_page);
        let buttons = raw.get("buttons");
        let flag = |name: &str, default: bool| {
            buttons
                .and_then(|b| b.get(name))
                .and_then(Value::as_bool)
                .unwrap_or(default)
        };
        Self {
            run_mode,
            target_page,
            buttons: ButtonToggles {
                p2cc: flag("p2cc", defaults.buttons.p2cc),
                third_year: flag("thirdYear", defaults.buttons.third_year),
            },
        }
    }
}

/// Reads and writes [`Settings`], migrating the legacy key on first read.
#[derive(Clone)]
pub struct SettingsResolver {
    store: Arc<dyn KvStore>,
}

impl SettingsResolver {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn try_load(&self) -> Result<Settings, AutomationError> {
        if let Some(v1) = store::read::<Value>(self.store.as_ref(), keys::SETTINGS_V1).await? {
            return Ok(Settings::normalize(&v1));
        }
        if let Some(v2) = store::read::<Value>(self.store.as_ref(), keys::SETTINGS_V2).await? {
            let migrated = Settings::normalize(&v2);
            store::write(self.store.as_ref(), keys::SETTINGS_V1, &migrated).await?;
            info!(run_mode = migrated.run_mode.as_str(), "migrated settings_v2 to settings_v1");
            return Ok(migrated);
        }
        Ok(Settings::default())
    }

    /// Never fails; storage problems yield defaults.
    pub async fn load(&self) -> Settings {
        match self.try_load().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "settings unreadable, using defaults");
                Settings::default()
            }
        }
    }

    pub async fn run_mode(&self) -> RunMode {
        let mode = self.load().await.run_mode;
        debug!(run_mode = mode.as_str(), "resolved run mode");
        mode
    }

    pub async fn save(&self, settings: &Value) -> Result<Settings, AutomationError> {
        let safe = Settings::normalize(settings);
        store::write(self.store.as_ref(), keys::SETTINGS_V1, &safe).await?;
        Ok(safe)
    }
}
