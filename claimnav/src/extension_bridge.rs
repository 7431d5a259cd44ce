use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::{messages::TabId, AutomationError};

type BridgeResult = Result<Value, String>;
type PendingMap = HashMap<String, oneshot::Sender<BridgeResult>>;
type Pending = Arc<Mutex<PendingMap>>;
type Clients = Arc<Mutex<Vec<Client>>>;

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    id: String,
    action: &'a str,
    #[serde(rename = "tabId", skip_serializing_if = "Option::is_none")]
    tab_id: Option<TabId>,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeIncoming {
    Result {
        id: String,
        ok: bool,
        result: Option<Value>,
        error: Option<String>,
    },
    Typed(TypedIncoming),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TypedIncoming {
    #[serde(rename = "hello")]
    Hello { from: Option<String> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "console_event")]
    ConsoleEvent {
        #[serde(rename = "tabId")]
        tab_id: Option<TabId>,
        level: Option<String>,
        args: Option<Value>,
    },
    #[serde(rename = "dom_mutation")]
    DomMutation {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    #[serde(rename = "tab_updated")]
    TabUpdated {
        #[serde(rename = "tabId")]
        tab_id: TabId,
        status: Option<String>,
        url: Option<String>,
    },
    #[serde(rename = "tab_removed")]
    TabRemoved {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    #[serde(rename = "runtime_message")]
    RuntimeMessage {
        #[serde(rename = "tabId")]
        tab_id: Option<TabId>,
        message: Value,
    },
}

/// Something the extension reported without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Connected { from: Option<String> },
    DomMutation { tab_id: TabId },
    TabUpdated {
        tab_id: TabId,
        status: Option<String>,
        url: Option<String>,
    },
    TabRemoved { tab_id: TabId },
    /// A `chrome.runtime` message from a tab or extension page.
    RuntimeMessage { tab_id: Option<TabId>, message: Value },
}

/// Request/response channel to the browser extension.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    /// Sends `action` and waits up to `timeout` for its result. `Ok(None)`
    /// when no extension is connected or it never answered.
    async fn request(
        &self,
        action: &str,
        tab: Option<TabId>,
        params: Value,
        timeout: Duration,
    ) -> Result<Option<Value>, AutomationError>;

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent>;
}

struct Client {
    sender: mpsc::UnboundedSender<WsMessage>,
}

pub struct ExtensionBridge {
    _server_task: JoinHandle<()>,
    local_addr: Option<SocketAddr>,
    clients: Clients,
    pending: Pending,
    events: broadcast::Sender<BridgeEvent>,
}

static GLOBAL: OnceCell<Arc<ExtensionBridge>> = OnceCell::new();

/// Resolves a pending request or fans a typed event out to subscribers.
async fn dispatch_incoming(txt: &str, pending: &Pending, events: &broadcast::Sender<BridgeEvent>) {
    let event = match serde_json::from_str::<BridgeIncoming>(txt) {
        Ok(BridgeIncoming::Result {
            id,
            ok,
            result,
            error,
        }) => {
            if ok {
                let size = result.as_ref().map(|r| r.to_string().len()).unwrap_or(0);
                tracing::debug!(id = %id, result_size = size, "bridge result");
            } else {
                let head: String = error.as_deref().unwrap_or("unknown error").chars().take(400).collect();
                tracing::warn!(id = %id, error = %head, "bridge request failed in extension");
            }
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(if ok {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    Err(error.unwrap_or_else(|| "unknown error".into()))
                });
            }
            return;
        }
        Ok(BridgeIncoming::Typed(TypedIncoming::Hello { from })) => {
            tracing::info!(from = ?from, "extension connected");
            BridgeEvent::Connected { from }
        }
        Ok(BridgeIncoming::Typed(TypedIncoming::Pong)) => return,
        Ok(BridgeIncoming::Typed(TypedIncoming::ConsoleEvent { tab_id, level, args })) => {
            let args = args.map(|v| v.to_string()).unwrap_or_else(|| "[]".into());
            match level.as_deref().unwrap_or("log") {
                "error" => tracing::error!(tab = ?tab_id, args = %args, "page console error"),
                "warning" | "warn" => tracing::warn!(tab = ?tab_id, args = %args, "page console warn"),
                _ => tracing::debug!(tab = ?tab_id, args = %args, "page console"),
            }
            return;
        }
        Ok(BridgeIncoming::Typed(TypedIncoming::DomMutation { tab_id })) => BridgeEvent::DomMutation { tab_id },
        Ok(BridgeIncoming::Typed(TypedIncoming::TabUpdated { tab_id, status, url })) => {
            tracing::debug!(tab = tab_id, status = ?status, "tab updated");
            BridgeEvent::TabUpdated { tab_id, status, url }
        }
        Ok(BridgeIncoming::Typed(TypedIncoming::TabRemoved { tab_id })) => BridgeEvent::TabRemoved { tab_id },
        Ok(BridgeIncoming::Typed(TypedIncoming::RuntimeMessage { tab_id, message })) => {
            BridgeEvent::RuntimeMessage { tab_id, message }
        }
        Err(e) => {
            tracing::warn!("Invalid incoming JSON: {}", e);
            return;
        }
    };
    // No subscribers is fine.
    let _ = events.send(event);
}

impl ExtensionBridge {
    /// The process-wide bridge, started on `addr` by the first caller.
    pub async fn global(addr: &str) -> Arc<ExtensionBridge> {
        if let Some(h) = GLOBAL.get() {
            return h.clone();
        }
        let bridge = ExtensionBridge::start(addr).await;
        let arc = Arc::new(bridge);
        let _ = GLOBAL.set(arc.clone());
        GLOBAL.get().cloned().unwrap_or(arc)
    }

    fn detached(clients: Clients, pending: Pending, events: broadcast::Sender<BridgeEvent>) -> ExtensionBridge {
        ExtensionBridge {
            _server_task: tokio::spawn(async move {}),
            local_addr: None,
            clients,
            pending,
            events,
        }
    }

    /// Binds the WebSocket listener. A bind failure leaves a bridge that
    /// reports no connected clients rather than an error.
    pub async fn start(addr: &str) -> ExtensionBridge {
        let clients: Clients = Arc::new(Mutex::new(Vec::new()));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(%addr, ?e, "Port in use, waiting 2 seconds and retrying once...");
                tokio::time::sleep(Duration::from_secs(2)).await;
                match TcpListener::bind(addr).await {
                    Ok(l) => l,
                    Err(e2) => {
                        tracing::error!(%addr, ?e2, "Failed to bind after retry. Extension bridge will be non-functional.");
                        return Self::detached(clients, pending, events);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%addr, ?e, "failed to bind ws");
                return Self::detached(clients, pending, events);
            }
        };
        let local_addr = listener.local_addr().ok();
        tracing::info!(addr = ?local_addr, "extension bridge listening");

        let clients_clone = clients.clone();
        let pending_clone = pending.clone();
        let events_clone = events.clone();
        let server_task = tokio::spawn(async move {
            loop {
                let (stream, _peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("ws accept error: {}", e);
                        continue;
                    }
                };
                let ws_clients = clients_clone.clone();
                let ws_pending = pending_clone.clone();
                let ws_events = events_clone.clone();
                tokio::spawn(async move {
                    let ws_stream = match accept_async(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!("ws handshake error: {}", e);
                            return;
                        }
                    };
                    let (mut sink, mut stream) = ws_stream.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

                    let writer = tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            if let Err(e) = sink.send(msg).await {
                                tracing::warn!("ws send error: {}", e);
                                break;
                            }
                        }
                    });

                    ws_clients.lock().await.push(Client { sender: tx.clone() });

                    while let Some(Ok(msg)) = stream.next().await {
                        if !msg.is_text() {
                            continue;
                        }
                        let txt = msg.into_text().unwrap_or_default();
                        dispatch_incoming(&txt, &ws_pending, &ws_events).await;
                    }

                    ws_clients.lock().await.retain(|c| !c.sender.same_channel(&tx));
                    tracing::info!("extension disconnected");
                    writer.abort();
                });
            }
        });

        ExtensionBridge {
            _server_task: server_task,
            local_addr,
            clients,
            pending,
            events,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn is_client_connected(&self) -> bool {
        !self.clients.lock().await.is_empty()
    }

    /// Evaluates `code` in `tab`, awaiting a returned promise.
    pub async fn eval_in_tab(&self, tab: TabId, code: &str, timeout: Duration) -> Result<Option<Value>, AutomationError> {
        self.request("eval", Some(tab), json!({ "code": code, "awaitPromise": true }), timeout)
            .await
    }
}

#[async_trait]
impl BridgeTransport for ExtensionBridge {
    async fn request(
        &self,
        action: &str,
        tab: Option<TabId>,
        params: Value,
        timeout: Duration,
    ) -> Result<Option<Value>, AutomationError> {
        if self.clients.lock().await.is_empty() {
            tracing::debug!(action, "no extension connected; request skipped");
            return Ok(None);
        }
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel::<BridgeResult>();
        self.pending.lock().await.insert(id.clone(), tx);
        let req = BridgeRequest {
            id: id.clone(),
            action,
            tab_id: tab,
            params,
        };
        let payload = serde_json::to_string(&req)
            .map_err(|e| AutomationError::Bridge(format!("bridge serialize: {e}")))?;

        let sent = {
            let clients = self.clients.lock().await;
            tracing::trace!(clients = clients.len(), preview = %payload.chars().take(120).collect::<String>(), "sending to extension");
            clients
                .first()
                .is_some_and(|c| c.sender.send(WsMessage::Text(payload)).is_ok())
        };
        if !sent {
            self.pending.lock().await.remove(&id);
            tracing::warn!(action, "failed to send to extension");
            return Ok(None);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(val))) => Ok(Some(val)),
            Ok(Ok(Err(err))) => Err(AutomationError::Bridge(err)),
            Ok(Err(_canceled)) => {
                tracing::warn!(action, "bridge reply channel dropped");
                Ok(None)
            }
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                tracing::warn!(action, id = %id, "timed out waiting for extension");
                Ok(None)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }
}
