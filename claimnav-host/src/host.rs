//! Wires bridge events to the mediator, the per-tab agents and the portal.

use std::{collections::HashMap, sync::Arc};

use claimnav::{
    bridge_page::BridgePage,
    extension_bridge::{BridgeEvent, BridgeTransport},
    form::FormConfig,
    handoff::HandoffCoordinator,
    mediator::TabHost,
    messages::{Message, MessageHandler, Router, TabId},
    portal::{Clipboard, TriggerOutcome},
    settings::SettingsResolver,
    store::KvStore,
    AutomationError, HostConfig, HostSelectors, Mediator, Portal, TargetAgent, Timings,
};
use serde_json::Value;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tracing::{debug, error, info, warn};

/// System clipboard through `arboard`.
pub struct SystemClipboard;

impl Clipboard for SystemClipboard {
    fn copy_text(&self, text: &str) -> Result<(), AutomationError> {
        arboard::Clipboard::new()
            .and_then(|mut c| c.set_text(text.to_string()))
            .map_err(|e| AutomationError::Internal(format!("clipboard: {e}")))
    }
}

pub struct Host {
    transport: Arc<dyn BridgeTransport>,
    store: Arc<dyn KvStore>,
    router: Arc<Router>,
    mediator: Arc<Mediator>,
    coordinator: Arc<HandoffCoordinator>,
    selectors: Arc<HostSelectors>,
    timings: Timings,
    form: FormConfig,
    clipboard: Arc<dyn Clipboard>,
    agents: Mutex<HashMap<TabId, Arc<TargetAgent>>>,
    portals: Mutex<HashMap<TabId, Arc<Portal>>>,
}

/// A `runtime_message` payload, if it is one of ours.
fn decode_message(raw: Value) -> Option<Message> {
    match serde_json::from_value(raw) {
        Ok(m) => Some(m),
        Err(e) => {
            debug!(error = %e, "ignoring unrecognised runtime message");
            None
        }
    }
}

impl Host {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn BridgeTransport>,
        tabs: Arc<dyn TabHost>,
        store: Arc<dyn KvStore>,
        config: HostConfig,
        selectors: HostSelectors,
        timings: Timings,
        form: FormConfig,
        clipboard: Arc<dyn Clipboard>,
    ) -> Self {
        let router = Arc::new(Router::new(timings.delivery_timeout()));
        let mediator = Arc::new(Mediator::new(
            tabs,
            router.clone(),
            store.clone(),
            config,
            timings.clone(),
        ));
        let coordinator = Arc::new(HandoffCoordinator::new(store.clone(), mediator.clone()));
        Self {
            transport,
            store,
            router,
            mediator,
            coordinator,
            selectors: Arc::new(selectors),
            timings,
            form,
            clipboard,
            agents: Mutex::new(HashMap::new()),
            portals: Mutex::new(HashMap::new()),
        }
    }

    fn page_for(&self, tab: TabId) -> Arc<BridgePage> {
        Arc::new(BridgePage::new(
            self.transport.clone(),
            tab,
            self.timings.delivery_timeout(),
        ))
    }

    /// Consumes bridge events until the bridge shuts down.
    pub async fn run(self: Arc<Self>) {
        let _removal = self.mediator.spawn_removal_watch();
        let mut events = self.transport.subscribe();
        loop {
            match events.recv().await {
                Ok(event) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.on_event(event).await });
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "bridge events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
        info!("bridge event stream closed");
    }

    async fn on_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected { from } => info!(from = ?from, "extension ready"),
            BridgeEvent::TabUpdated {
                tab_id,
                status: Some(status),
                url: Some(url),
            } if status == "complete" && self.mediator.is_process_url(&url) => {
                self.attach_agent(tab_id).await;
            }
            BridgeEvent::TabRemoved { tab_id } => {
                self.router.unregister(tab_id).await;
                self.agents.lock().await.remove(&tab_id);
                self.portals.lock().await.remove(&tab_id);
                self.mediator.forget_tab(tab_id);
            }
            BridgeEvent::RuntimeMessage { tab_id, message } => {
                if let Some(message) = decode_message(message) {
                    self.on_runtime(tab_id, message).await;
                }
            }
            BridgeEvent::TabUpdated { .. } | BridgeEvent::DomMutation { .. } => {}
        }
    }

    /// Runs the agent for a managed tab that finished loading, creating it
    /// on first sight.
    async fn attach_agent(&self, tab: TabId) {
        let agent = {
            let mut agents = self.agents.lock().await;
            agents
                .entry(tab)
                .or_insert_with(|| {
                    Arc::new(TargetAgent::new(
                        self.page_for(tab),
                        self.store.clone(),
                        self.selectors.clone(),
                        self.timings.clone(),
                        self.form.clone(),
                    ))
                })
                .clone()
        };
        self.router
            .register(tab, agent.clone() as Arc<dyn MessageHandler>)
            .await;
        if let Err(e) = self.mediator.claim_process_tab(tab).await {
            warn!(tab, error = %e, "could not claim managed tab");
        }
        match agent.on_load().await {
            Ok(Some(outcome)) => info!(tab, outcome = ?outcome, "load-triggered run finished"),
            Ok(None) => debug!(tab, "managed tab loaded without a run"),
            Err(e) => warn!(tab, error = %e, "load-triggered run could not start"),
        }
    }

    async fn on_runtime(&self, sender: Option<TabId>, message: Message) {
        match message {
            Message::OpenTarget { .. } | Message::ClaimProcessTab => {
                match self.mediator.handle_runtime(sender, message).await {
                    Ok(reply) => debug!(reply = %reply, "runtime message handled"),
                    Err(e) => warn!(error = %e, "runtime message failed"),
                }
            }
            Message::PortalTrigger { force } => {
                let Some(tab) = sender else {
                    warn!("portal trigger without a sender tab");
                    return;
                };
                self.portal_trigger(tab, force).await;
            }
            other => {
                let Some(tab) = sender else {
                    return;
                };
                if let Err(e) = self.router.send(tab, other).await {
                    warn!(tab, error = %e, "could not relay message to tab");
                }
            }
        }
    }

    async fn portal_trigger(&self, tab: TabId, force: bool) {
        let portal = {
            let mut portals = self.portals.lock().await;
            portals
                .entry(tab)
                .or_insert_with(|| {
                    Arc::new(Portal::new(
                        self.page_for(tab),
                        self.selectors.clone(),
                        self.coordinator.clone(),
                        SettingsResolver::new(self.store.clone()),
                        self.clipboard.clone(),
                        self.timings.trigger_cooldown(),
                    ))
                })
                .clone()
        };
        match portal.trigger(force).await {
            Ok(TriggerOutcome::CoolingDown) => {}
            Ok(TriggerOutcome::HandedOff { ticket, .. }) => match ticket.delivery.await {
                Ok(Ok(reply)) => info!(ok = reply.ok, delivered = reply.delivered, "handoff delivered"),
                Ok(Err(e)) => warn!(error = %e, "handoff delivery failed"),
                Err(e) => error!("delivery task failed: {}", e),
            },
            Err(e) => warn!(tab, error = %e, "portal trigger rejected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn runtime_payloads_decode_by_type_tag() {
        assert_eq!(
            decode_message(json!({ "type": "PORTAL_TRIGGER", "force": true })),
            Some(Message::PortalTrigger { force: true })
        );
        assert_eq!(
            decode_message(json!({ "type": "OPEN_TARGET", "requestId": "1-abcdef" })),
            Some(Message::OpenTarget {
                request_id: "1-abcdef".into()
            })
        );
        assert_eq!(decode_message(json!({ "type": "SOMETHING_ELSE" })), None);
    }
}
