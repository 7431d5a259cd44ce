//! Cross-context message protocol between the portal, the mediator and the
//! agent running inside the target tab.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::AutomationError;

pub type TabId = i64;

/// Scraped-form parameters carried alongside a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t5: Option<String>,
    /// The `openCUW134` flag.
    #[serde(default, rename = "openCUW134")]
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Liveness probe answered by the target tab.
    Ping,
    RunNow {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        claim: Option<String>,
        #[serde(default, rename = "targetPage", skip_serializing_if = "Option::is_none")]
        target_page: Option<String>,
        #[serde(default, rename = "formParams", skip_serializing_if = "Option::is_none")]
        form_params: Option<FormParams>,
    },
    /// Portal asks the mediator to bring up the target tab.
    OpenTarget {
        #[serde(rename = "requestId")]
        request_id: String,
    },
    /// A managed tab announces itself after loading.
    ClaimProcessTab,
    /// Re-open the external form from the current page.
    OpenForm,
    /// Portal button press relayed by the extension.
    PortalTrigger {
        #[serde(default)]
        force: bool,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping => "PING",
            Message::RunNow { .. } => "RUN_NOW",
            Message::OpenTarget { .. } => "OPEN_TARGET",
            Message::ClaimProcessTab => "CLAIM_PROCESS_TAB",
            Message::OpenForm => "OPEN_FORM",
            Message::PortalTrigger { .. } => "PORTAL_TRIGGER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReply {
    pub alive: bool,
    pub current_url: String,
    pub title: String,
    pub ready_state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTargetReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    pub completed: bool,
    pub delivered: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The target's reply to `RUN_NOW`, when one was delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunReply>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Nothing is listening in the addressed tab yet.
    #[error("Could not establish connection. Receiving end does not exist. (tab {0})")]
    NoReceiver(TabId),
    #[error("Receiver in tab {tab} failed: {message}")]
    Handler { tab: TabId, message: String },
    #[error("Receiver in tab {0} did not answer in time")]
    TimedOut(TabId),
}

impl From<DeliveryError> for AutomationError {
    fn from(e: DeliveryError) -> Self {
        AutomationError::Delivery(e.to_string())
    }
}

/// Something that answers messages addressed to one tab.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<Value, AutomationError>;
}

/// Delivers messages to the handler registered for a tab.
pub struct Router {
    handlers: RwLock<HashMap<TabId, Arc<dyn MessageHandler>>>,
    timeout: Duration,
}

impl Router {
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub async fn register(&self, tab: TabId, handler: Arc<dyn MessageHandler>) {
        debug!(tab, "message handler registered");
        self.handlers.write().await.insert(tab, handler);
    }

    pub async fn unregister(&self, tab: TabId) -> bool {
        self.handlers.write().await.remove(&tab).is_some()
    }

    pub async fn has_receiver(&self, tab: TabId) -> bool {
        self.handlers.read().await.contains_key(&tab)
    }

    /// Sends `message` and waits for the reply.
    ///
    /// Replies to `RUN_NOW` may take as long as a whole run, so the router's
    /// timeout only applies to the other message kinds.
    pub async fn send(&self, tab: TabId, message: Message) -> Result<Value, DeliveryError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(&tab)
            .cloned()
            .ok_or(DeliveryError::NoReceiver(tab))?;
        let kind = message.kind();
        let bounded = !matches!(message, Message::RunNow { .. });

        // Run on its own task so a panicking handler surfaces as a delivery error.
        let task = tokio::spawn(async move { handler.handle(message).await });
        let joined = if bounded {
            match tokio::time::timeout(self.timeout, task).await {
                Ok(j) => j,
                Err(_) => {
                    warn!(tab, kind, "receiver timed out");
                    return Err(DeliveryError::TimedOut(tab));
                }
            }
        } else {
            task.await
        };
        match joined {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(DeliveryError::Handler {
                tab,
                message: e.to_string(),
            }),
            Err(join) => Err(DeliveryError::Handler {
                tab,
                message: format!("receiver task failed: {join}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, message: Message) -> Result<Value, AutomationError> {
            Ok(json!({ "type": message.kind() }))
        }
    }

    struct Panics;

    #[async_trait]
    impl MessageHandler for Panics {
        async fn handle(&self, _message: Message) -> Result<Value, AutomationError> {
            panic!("listener crashed")
        }
    }

    #[test]
    fn run_now_decodes_with_optional_fallbacks() {
        let msg: Message = serde_json::from_value(json!({
            "type": "RUN_NOW",
            "requestId": "1700000000000-abc123",
            "targetPage": "loss_details",
            "formParams": {"x": "PUBC6", "openCUW134": true}
        }))
        .unwrap();
        let Message::RunNow {
            request_id,
            claim,
            target_page,
            form_params,
        } = msg
        else {
            panic!("wrong variant");
        };
        assert_eq!(request_id, "1700000000000-abc123");
        assert_eq!(claim, None);
        assert_eq!(target_page.as_deref(), Some("loss_details"));
        let fp = form_params.unwrap();
        assert!(fp.open);
        assert_eq!(fp.x.as_deref(), Some("PUBC6"));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(serde_json::from_value::<Message>(json!({"type": "PING_TM"})).is_err());
        assert!(serde_json::from_value::<Message>(json!({"type": "OPEN_TARGET"})).is_err());
    }

    #[tokio::test]
    async fn send_without_receiver_reports_no_receiver() {
        let router = Router::new(Duration::from_secs(1));
        let err = router.send(7, Message::Ping).await.unwrap_err();
        assert_eq!(err, DeliveryError::NoReceiver(7));
        assert!(err.to_string().contains("Receiving end does not exist"));
    }

    #[tokio::test]
    async fn routes_to_registered_handler_and_folds_panics() {
        let router = Router::new(Duration::from_secs(1));
        router.register(1, Arc::new(Echo)).await;
        router.register(2, Arc::new(Panics)).await;

        let reply = router.send(1, Message::ClaimProcessTab).await.unwrap();
        assert_eq!(reply["type"], "CLAIM_PROCESS_TAB");

        let err = router.send(2, Message::Ping).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Handler { tab: 2, .. }));

        assert!(router.unregister(1).await);
        assert!(!router.has_receiver(1).await);
    }
}
