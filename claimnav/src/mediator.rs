//! Background mediator: owns the managed claim application tab and delivers
//! run requests to the agent inside it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{HostConfig, Timings},
    handoff::{HandoffNotifier, HandoffStore},
    messages::{Message, OpenTargetReply, PingReply, Router, RunReply, TabId},
    settings::{RunMode, SettingsResolver},
    store::KvStore,
    AutomationError,
};

pub const REASON_DELIVERED: &str = "ping_ok_run_ok";
pub const REASON_NO_RECEIVER: &str = "no_receiver_after_retries";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Loading,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    #[serde(default)]
    pub url: String,
    pub status: TabStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabEvent {
    Updated(TabInfo),
    Removed(TabId),
}

/// Browser tab operations the mediator needs.
#[async_trait]
pub trait TabHost: Send + Sync {
    /// `None` when the tab no longer exists.
    async fn get(&self, id: TabId) -> Result<Option<TabInfo>, AutomationError>;
    /// Tabs whose URL starts with `url_prefix`.
    async fn query(&self, url_prefix: &str) -> Result<Vec<TabInfo>, AutomationError>;
    async fn create(&self, url: &str) -> Result<TabInfo, AutomationError>;
    /// Navigates an existing tab and brings it to the front.
    async fn update(&self, id: TabId, url: &str) -> Result<TabInfo, AutomationError>;
    async fn remove(&self, id: TabId) -> Result<(), AutomationError>;
    fn events(&self) -> broadcast::Receiver<TabEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: bool,
    pub reason: &'static str,
    pub run: Option<RunReply>,
}

pub struct Mediator {
    host: Arc<dyn TabHost>,
    router: Arc<Router>,
    handoff: HandoffStore,
    settings: SettingsResolver,
    config: HostConfig,
    timings: Timings,
    process_tab: Mutex<Option<TabId>>,
}

impl Mediator {
    pub fn new(
        host: Arc<dyn TabHost>,
        router: Arc<Router>,
        store: Arc<dyn KvStore>,
        config: HostConfig,
        timings: Timings,
    ) -> Self {
        Self {
            host,
            router,
            handoff: HandoffStore::new(store.clone()),
            settings: SettingsResolver::new(store),
            config,
            timings,
            process_tab: Mutex::new(None),
        }
    }

    pub fn process_tab(&self) -> Option<TabId> {
        *self.process_tab.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn track(&self, tab: Option<TabId>) {
        *self.process_tab.lock().unwrap_or_else(|p| p.into_inner()) = tab;
    }

    /// Clears the tracked tab if it is `tab`.
    pub fn forget_tab(&self, tab: TabId) {
        let mut slot = self.process_tab.lock().unwrap_or_else(|p| p.into_inner());
        if *slot == Some(tab) {
            debug!(tab, "tracked tab closed");
            *slot = None;
        }
    }

    fn origin_prefix(&self) -> String {
        format!("{}/", self.config.target_origin.trim_end_matches('/'))
    }

    /// Entry URL carrying the request token, the managed-tab marker and,
    /// when known, the claim and configured target page.
    pub async fn entry_url(&self, request_id: &str, claim: Option<&str>) -> Result<String, AutomationError> {
        let mut url = url::Url::parse(&self.config.entry_url())
            .map_err(|e| AutomationError::InvalidArgument(format!("entry url: {e}")))?;
        let settings = self.settings.load().await;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("tm_t", request_id);
            q.append_pair("process", "true");
            if let Some(claim) = claim.filter(|c| !c.is_empty()) {
                q.append_pair("claimNumber", claim);
            }
            if settings.run_mode == RunMode::Full && !settings.target_page.trim().is_empty() {
                q.append_pair("TargetPage", &settings.target_page);
            }
        }
        Ok(url.to_string())
    }

    /// A tab on the target origin carrying `process=true`.
    pub fn is_process_url(&self, tab_url: &str) -> bool {
        let (Ok(u), Ok(target)) = (url::Url::parse(tab_url), url::Url::parse(&self.config.target_origin)) else {
            return false;
        };
        u.origin() == target.origin()
            && u.query_pairs().any(|(k, v)| k == "process" && v == "true")
    }

    /// The tracked tab while it still shows the target origin, else any
    /// managed tab. Ordinary user tabs on the same origin are never reused.
    pub async fn find_existing_process_tab(&self) -> Result<Option<TabInfo>, AutomationError> {
        let prefix = self.origin_prefix();
        if let Some(id) = self.process_tab() {
            match self.host.get(id).await {
                Ok(Some(tab)) if tab.url.starts_with(&prefix) => return Ok(Some(tab)),
                Ok(_) | Err(_) => {
                    debug!(tab = id, "tracked tab gone or navigated away");
                    self.track(None);
                }
            }
        }
        Ok(self
            .host
            .query(&prefix)
            .await?
            .into_iter()
            .find(|t| self.is_process_url(&t.url)))
    }

    /// True once `tab` reports complete, false on timeout or removal.
    pub async fn wait_for_tab_complete(&self, tab: TabId) -> bool {
        let mut events = self.host.events();
        if let Ok(Some(t)) = self.host.get(tab).await {
            if t.status == TabStatus::Complete {
                return true;
            }
        }

        let deadline = Instant::now() + self.timings.tab_complete();
        let mut listening = true;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                ev = events.recv(), if listening => match ev {
                    Ok(TabEvent::Updated(t)) if t.id == tab && t.status == TabStatus::Complete => return true,
                    Ok(TabEvent::Removed(id)) if id == tab => return false,
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => debug!(skipped = n, "tab events lagged"),
                    Err(RecvError::Closed) => listening = false,
                },
                _ = tokio::time::sleep(self.timings.tab_poll()) => {
                    if let Ok(Some(t)) = self.host.get(tab).await {
                        if t.status == TabStatus::Complete {
                            return true;
                        }
                    }
                }
            }
        }
    }

    /// Pings until the tab's agent answers, then sends `RUN_NOW`. A failed
    /// run send after a good ping is retried in the same loop.
    pub async fn ping_then_run(
        &self,
        tab: TabId,
        request_id: &str,
        claim: Option<&str>,
        target_page: Option<&str>,
    ) -> Delivery {
        for i in 0..self.timings.ping_attempts {
            match self.router.send(tab, Message::Ping).await {
                Ok(pong) => {
                    if let Ok(p) = serde_json::from_value::<PingReply>(pong) {
                        debug!(tab, url = %p.current_url, ready = %p.ready_state, "agent alive");
                    }
                    let run = Message::RunNow {
                        request_id: request_id.to_string(),
                        claim: claim.map(str::to_string),
                        target_page: target_page.map(str::to_string),
                        form_params: None,
                    };
                    match self.router.send(tab, run).await {
                        Ok(v) => {
                            return Delivery {
                                delivered: true,
                                reason: REASON_DELIVERED,
                                run: serde_json::from_value(v).ok(),
                            }
                        }
                        Err(e) => warn!(tab, error = %e, "RUN_NOW failed after ping ok"),
                    }
                }
                Err(e) => debug!(tab, attempt = i + 1, error = %e, "ping failed"),
            }
            tokio::time::sleep(self.timings.ping_backoff(i)).await;
        }
        Delivery {
            delivered: false,
            reason: REASON_NO_RECEIVER,
            run: None,
        }
    }

    /// Brings up the managed tab for `request_id` and delivers the run.
    #[instrument(skip(self))]
    pub async fn open_target(&self, request_id: &str) -> Result<OpenTargetReply, AutomationError> {
        let claim = self
            .handoff
            .handoff()
            .await?
            .filter(|h| h.request_id == request_id)
            .map(|h| h.claim);
        if !self.handoff.assert_owner(request_id).await? {
            info!("request is no longer the latest handoff; tab left alone");
            return Ok(OpenTargetReply {
                ok: true,
                skipped: true,
                ..Default::default()
            });
        }
        let url = self.entry_url(request_id, claim.as_deref()).await?;

        let tab = match self.find_existing_process_tab().await? {
            Some(existing) => {
                let tab = self.host.update(existing.id, &url).await?;
                info!(tab = tab.id, "reusing managed tab");
                tab
            }
            None => {
                let tab = self.host.create(&url).await?;
                info!(tab = tab.id, "created managed tab");
                tab
            }
        };
        self.track(Some(tab.id));

        let completed = self.wait_for_tab_complete(tab.id).await;
        debug!(tab = tab.id, completed, "tab load finished");

        let skipped = || OpenTargetReply {
            ok: true,
            tab_id: Some(tab.id),
            completed,
            delivered: false,
            skipped: true,
            ..Default::default()
        };
        if !self.handoff.still_latest(request_id).await {
            info!("newer request exists; not delivering");
            return Ok(skipped());
        }

        let target_page = {
            let s = self.settings.load().await;
            (s.run_mode == RunMode::Full).then_some(s.target_page)
        };
        let delivery = self
            .ping_then_run(tab.id, request_id, claim.as_deref(), target_page.as_deref())
            .await;

        if !self.handoff.still_latest(request_id).await {
            info!("request superseded during delivery");
            return Ok(skipped());
        }
        info!(tab = tab.id, delivered = delivery.delivered, reason = delivery.reason, "delivery finished");
        Ok(OpenTargetReply {
            ok: true,
            tab_id: Some(tab.id),
            completed,
            delivered: delivery.delivered,
            skipped: false,
            reason: Some(delivery.reason.to_string()),
            run: delivery.run,
        })
    }

    /// Makes `sender` the only managed tab.
    #[instrument(skip(self))]
    pub async fn claim_process_tab(&self, sender: TabId) -> Result<(), AutomationError> {
        for t in self.host.query(&self.origin_prefix()).await? {
            if t.id != sender && self.is_process_url(&t.url) {
                if let Err(e) = self.host.remove(t.id).await {
                    debug!(tab = t.id, error = %e, "could not close duplicate tab");
                } else {
                    info!(tab = t.id, "closed duplicate managed tab");
                }
            }
        }
        self.track(Some(sender));
        Ok(())
    }

    /// Messages from extension pages and tabs addressed to the mediator.
    pub async fn handle_runtime(&self, sender: Option<TabId>, message: Message) -> Result<Value, AutomationError> {
        match message {
            Message::OpenTarget { request_id } => Ok(serde_json::to_value(self.open_target(&request_id).await?)?),
            Message::ClaimProcessTab => {
                if let Some(tab) = sender {
                    self.claim_process_tab(tab).await?;
                }
                Ok(json!({ "ok": true }))
            }
            other => Ok(json!({ "ok": false, "error": format!("Unhandled message type {}", other.kind()) })),
        }
    }

    /// Forgets the tracked tab when the browser closes it.
    pub fn spawn_removal_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut events = this.host.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TabEvent::Removed(id)) => this.forget_tab(id),
                    Ok(TabEvent::Updated(_)) => {}
                    Err(RecvError::Lagged(n)) => debug!(skipped = n, "tab events lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl HandoffNotifier for Mediator {
    async fn open_target(&self, request_id: &str) -> Result<OpenTargetReply, AutomationError> {
        Mediator::open_target(self, request_id).await
    }
}
