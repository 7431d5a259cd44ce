use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    extension_bridge::{BridgeEvent, BridgeTransport},
    mediator::{TabEvent, TabHost, TabInfo, TabStatus},
    messages::TabId,
    AutomationError,
};

/// [`TabHost`] backed by the extension's `chrome.tabs` access.
pub struct BridgeTabHost {
    transport: Arc<dyn BridgeTransport>,
    timeout: Duration,
    events: broadcast::Sender<TabEvent>,
    pump: JoinHandle<()>,
}

fn parse_status(status: Option<&str>) -> TabStatus {
    match status {
        Some("complete") => TabStatus::Complete,
        _ => TabStatus::Loading,
    }
}

impl BridgeTabHost {
    pub fn new(transport: Arc<dyn BridgeTransport>, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        let tx = events.clone();
        let mut incoming = transport.subscribe();
        let pump = tokio::spawn(async move {
            loop {
                let event = match incoming.recv().await {
                    Ok(BridgeEvent::TabUpdated { tab_id, status, url }) => TabEvent::Updated(TabInfo {
                        id: tab_id,
                        url: url.unwrap_or_default(),
                        status: parse_status(status.as_deref()),
                    }),
                    Ok(BridgeEvent::TabRemoved { tab_id }) => TabEvent::Removed(tab_id),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "tab event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let _ = tx.send(event);
            }
        });
        Self {
            transport,
            timeout,
            events,
            pump,
        }
    }

    async fn call(&self, action: &str, params: Value) -> Result<Value, AutomationError> {
        self.transport
            .request(action, None, params, self.timeout)
            .await?
            .ok_or_else(|| AutomationError::Bridge(format!("extension did not answer {action}")))
    }
}

impl Drop for BridgeTabHost {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl TabHost for BridgeTabHost {
    async fn get(&self, id: TabId) -> Result<Option<TabInfo>, AutomationError> {
        Ok(serde_json::from_value(self.call("tabs.get", json!({ "tabId": id })).await?)?)
    }

    async fn query(&self, url_prefix: &str) -> Result<Vec<TabInfo>, AutomationError> {
        let all: Vec<TabInfo> = serde_json::from_value(self.call("tabs.query", json!({})).await?)?;
        Ok(all.into_iter().filter(|t| t.url.starts_with(url_prefix)).collect())
    }

    async fn create(&self, url: &str) -> Result<TabInfo, AutomationError> {
        Ok(serde_json::from_value(
            self.call("tabs.create", json!({ "url": url, "active": true })).await?,
        )?)
    }

    async fn update(&self, id: TabId, url: &str) -> Result<TabInfo, AutomationError> {
        Ok(serde_json::from_value(
            self.call("tabs.update", json!({ "tabId": id, "url": url, "active": true }))
                .await?,
        )?)
    }

    async fn remove(&self, id: TabId) -> Result<(), AutomationError> {
        self.call("tabs.remove", json!({ "tabId": id })).await.map(|_| ())
    }

    fn events(&self) -> broadcast::Receiver<TabEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Canned {
        reply: Mutex<Option<Value>>,
        seen: Mutex<Vec<(String, Value)>>,
        events: broadcast::Sender<BridgeEvent>,
    }

    #[async_trait]
    impl BridgeTransport for Canned {
        async fn request(
            &self,
            action: &str,
            _tab: Option<TabId>,
            params: Value,
            _timeout: Duration,
        ) -> Result<Option<Value>, AutomationError> {
            self.seen.lock().unwrap().push((action.to_string(), params));
            Ok(self.reply.lock().unwrap().clone())
        }

        fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
            self.events.subscribe()
        }
    }

    fn canned(reply: Option<Value>) -> Arc<Canned> {
        Arc::new(Canned {
            reply: Mutex::new(reply),
            seen: Mutex::new(Vec::new()),
            events: broadcast::channel(8).0,
        })
    }

    #[tokio::test]
    async fn query_filters_by_prefix() {
        let t = canned(Some(json!([
            { "id": 1, "url": "https://cc.corp/ClaimCenter.do?process=true", "status": "complete" },
            { "id": 2, "url": "https://portal.corp/tasks", "status": "loading" }
        ])));
        let host = BridgeTabHost::new(t.clone(), Duration::from_secs(1));
        let tabs = host.query("https://cc.corp/").await.unwrap();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].status, TabStatus::Complete);
        assert_eq!(t.seen.lock().unwrap()[0].0, "tabs.query");
    }

    #[tokio::test]
    async fn missing_tab_and_silence() {
        let host = BridgeTabHost::new(canned(Some(Value::Null)), Duration::from_secs(1));
        assert_eq!(host.get(3).await.unwrap(), None);

        let host = BridgeTabHost::new(canned(None), Duration::from_secs(1));
        assert!(matches!(host.remove(3).await, Err(AutomationError::Bridge(_))));
    }

    #[tokio::test]
    async fn bridge_tab_events_are_translated() {
        let t = canned(None);
        let host = BridgeTabHost::new(t.clone(), Duration::from_secs(1));
        let mut rx = host.events();
        t.events
            .send(BridgeEvent::DomMutation { tab_id: 4 })
            .unwrap();
        t.events
            .send(BridgeEvent::TabUpdated {
                tab_id: 4,
                status: Some("complete".into()),
                url: Some("https://cc.corp/".into()),
            })
            .unwrap();
        t.events.send(BridgeEvent::TabRemoved { tab_id: 4 }).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            TabEvent::Updated(TabInfo {
                id: 4,
                url: "https://cc.corp/".into(),
                status: TabStatus::Complete,
            })
        );
        assert_eq!(rx.recv().await.unwrap(), TabEvent::Removed(4));
    }
}
