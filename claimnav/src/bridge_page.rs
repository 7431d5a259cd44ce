//! [`Page`] over a live browser tab, driven by script evaluation through the
//! extension bridge.
//!
//! Element handles are the value of a `data-claimnav-id` attribute stamped on
//! the element the first time a query returns it. The extension forwards
//! `MutationObserver` activity as `dom_mutation` events, which feed
//! [`Page::mutations`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    extension_bridge::{BridgeEvent, BridgeTransport},
    messages::TabId,
    page::{DomEvent, ElementHandle, Page, Rect},
    AutomationError,
};

const PRELUDE: &str = r#"
const __h = (id) => document.querySelector('[data-claimnav-id="' + id + '"]');
const __tag = (el) => {
  if (!el) return null;
  if (!el.dataset.claimnavId) {
    window.__claimnavSeq = (window.__claimnavSeq || 0) + 1;
    el.dataset.claimnavId = 'h' + window.__claimnavSeq;
  }
  return el.dataset.claimnavId;
};
"#;

fn js_str(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

fn script(body: &str) -> String {
    format!("(() => {{ {PRELUDE} {body} }})()")
}

fn decode<T: DeserializeOwned>(v: Value) -> Result<T, AutomationError> {
    Ok(serde_json::from_value(v)?)
}

fn event_script(event: DomEvent) -> String {
    let name = event.name();
    let ctor = match event {
        DomEvent::PointerDown { .. } | DomEvent::PointerUp { .. } => "PointerEvent",
        DomEvent::MouseDown { .. } | DomEvent::MouseUp { .. } | DomEvent::Click { .. } => "MouseEvent",
        DomEvent::Focus | DomEvent::Blur => "FocusEvent",
        DomEvent::Input | DomEvent::Change => "Event",
    };
    let init = match event.coordinates() {
        Some((x, y)) => format!("{{ bubbles: true, cancelable: true, view: window, clientX: {x}, clientY: {y} }}"),
        None => "{ bubbles: true }".to_string(),
    };
    let prefix = match event {
        DomEvent::Focus => "el.focus(), ",
        DomEvent::Blur => "el.blur(), ",
        _ => "",
    };
    format!("({prefix}el.dispatchEvent(new {ctor}('{name}', {init})), true)")
}

pub struct BridgePage {
    transport: Arc<dyn BridgeTransport>,
    tab: TabId,
    timeout: Duration,
    mutations: watch::Receiver<u64>,
    pump: JoinHandle<()>,
}

impl BridgePage {
    /// Attaches to `tab`. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn BridgeTransport>, tab: TabId, timeout: Duration) -> Self {
        let (tx, rx) = watch::channel(0u64);
        let mut events = transport.subscribe();
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BridgeEvent::DomMutation { tab_id }) | Ok(BridgeEvent::TabUpdated { tab_id, .. })
                        if tab_id == tab =>
                    {
                        tx.send_modify(|g| *g += 1);
                    }
                    Ok(BridgeEvent::TabRemoved { tab_id }) if tab_id == tab => break,
                    Ok(_) => {}
                    // Missed events still mean the page changed.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => tx.send_modify(|g| *g += 1),
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self {
            transport,
            tab,
            timeout,
            mutations: rx,
            pump,
        }
    }

    pub fn tab(&self) -> TabId {
        self.tab
    }

    async fn eval(&self, body: &str) -> Result<Value, AutomationError> {
        let code = script(body);
        self.transport
            .request(
                "eval",
                Some(self.tab),
                json!({ "code": code, "awaitPromise": true }),
                self.timeout,
            )
            .await?
            .ok_or_else(|| AutomationError::Bridge(format!("no response from tab {}", self.tab)))
    }

    /// Evaluates `expr` with `el` bound to the handle's element. A handle
    /// whose element left the document is [`AutomationError::ElementNotFound`].
    async fn on_element(&self, el: &ElementHandle, expr: &str) -> Result<Value, AutomationError> {
        let body = format!(
            "const el = __h({}); if (!el || !el.isConnected) return {{ missing: true }}; \
             return {{ value: {expr} }};",
            js_str(&el.0)
        );
        let mut reply = self.eval(&body).await?;
        if reply.get("missing").and_then(Value::as_bool) == Some(true) {
            return Err(AutomationError::ElementNotFound(format!("stale handle {el}")));
        }
        Ok(reply.get_mut("value").map(Value::take).unwrap_or(Value::Null))
    }

    async fn tagged(&self, el: &ElementHandle, expr: &str) -> Result<Option<ElementHandle>, AutomationError> {
        let v = self.on_element(el, &format!("__tag({expr})")).await?;
        Ok(decode::<Option<String>>(v)?.map(ElementHandle))
    }
}

impl Drop for BridgePage {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl Page for BridgePage {
    async fn url(&self) -> Result<String, AutomationError> {
        decode(self.eval("return location.href;").await?)
    }

    async fn title(&self) -> Result<String, AutomationError> {
        decode(self.eval("return document.title;").await?)
    }

    async fn ready_state(&self) -> Result<String, AutomationError> {
        decode(self.eval("return document.readyState;").await?)
    }

    async fn body_text(&self) -> Result<String, AutomationError> {
        decode(self.eval("return document.body ? document.body.innerText : '';").await?)
    }

    async fn query_all(
        &self,
        selector: &str,
        within: Option<&ElementHandle>,
    ) -> Result<Vec<ElementHandle>, AutomationError> {
        let root = within.map(|w| js_str(&w.0)).unwrap_or_else(|| "null".into());
        let body = format!(
            "const id = {root}; const root = id === null ? document : __h(id); \
             if (!root) return []; \
             return Array.from(root.querySelectorAll({})).map(__tag);",
            js_str(selector)
        );
        let ids: Vec<String> = decode(self.eval(&body).await?)?;
        Ok(ids.into_iter().map(ElementHandle).collect())
    }

    async fn text(&self, el: &ElementHandle) -> Result<String, AutomationError> {
        decode(self.on_element(el, "(el.innerText ?? el.textContent ?? '')").await?)
    }

    async fn value(&self, el: &ElementHandle) -> Result<String, AutomationError> {
        decode(self.on_element(el, "String(el.value ?? '')").await?)
    }

    async fn is_visible(&self, el: &ElementHandle) -> Result<bool, AutomationError> {
        let expr = "(() => { const r = el.getBoundingClientRect(); const s = getComputedStyle(el); \
                    return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none'; })()";
        decode(self.on_element(el, expr).await?)
    }

    async fn is_connected(&self, el: &ElementHandle) -> Result<bool, AutomationError> {
        let body = format!("const el = __h({}); return !!(el && el.isConnected);", js_str(&el.0));
        decode(self.eval(&body).await?)
    }

    async fn is_disabled(&self, el: &ElementHandle) -> Result<bool, AutomationError> {
        decode(
            self.on_element(el, "(!!el.disabled || el.getAttribute('aria-disabled') === 'true')")
                .await?,
        )
    }

    async fn has_class(&self, el: &ElementHandle, class: &str) -> Result<bool, AutomationError> {
        decode(
            self.on_element(el, &format!("el.classList.contains({})", js_str(class)))
                .await?,
        )
    }

    async fn bounds(&self, el: &ElementHandle) -> Result<Rect, AutomationError> {
        let expr = "(() => { const r = el.getBoundingClientRect(); \
                    return { x: r.x, y: r.y, width: r.width, height: r.height }; })()";
        decode(self.on_element(el, expr).await?)
    }

    async fn closest(
        &self,
        el: &ElementHandle,
        selector: &str,
    ) -> Result<Option<ElementHandle>, AutomationError> {
        self.tagged(el, &format!("el.closest({})", js_str(selector))).await
    }

    async fn parent(&self, el: &ElementHandle) -> Result<Option<ElementHandle>, AutomationError> {
        self.tagged(el, "el.parentElement").await
    }

    async fn focused(&self) -> Result<Option<ElementHandle>, AutomationError> {
        let body = "const a = document.activeElement; \
                    return __tag(a && a !== document.body ? a : null);";
        Ok(decode::<Option<String>>(self.eval(body).await?)?.map(ElementHandle))
    }

    async fn dispatch(&self, el: &ElementHandle, event: DomEvent) -> Result<(), AutomationError> {
        self.on_element(el, &event_script(event)).await.map(|_| ())
    }

    async fn activate(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        self.on_element(el, "(el.click(), true)").await.map(|_| ())
    }

    async fn set_native_value(&self, el: &ElementHandle, value: &str) -> Result<(), AutomationError> {
        let expr = format!(
            "(() => {{ const d = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value'); \
             if (d && d.set) d.set.call(el, {v}); else el.value = {v}; return true; }})()",
            v = js_str(value)
        );
        self.on_element(el, &expr).await.map(|_| ())
    }

    async fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        self.eval(&format!("location.href = {}; return true;", js_str(url)))
            .await
            .map(|_| ())
    }

    async fn replace_url(&self, url: &str) -> Result<(), AutomationError> {
        self.eval(&format!(
            "history.replaceState(history.state, '', {}); return true;",
            js_str(url)
        ))
        .await
        .map(|_| ())
    }

    async fn alert(&self, message: &str) -> Result<(), AutomationError> {
        // Deferred so the eval returns before the dialog blocks the page.
        self.eval(&format!(
            "setTimeout(() => alert({}), 0); return true;",
            js_str(message)
        ))
        .await
        .map(|_| ())
    }

    fn mutations(&self) -> watch::Receiver<u64> {
        self.mutations.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{first_visible, wait_for_element};
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct Inner {
        requests: Vec<(String, Option<TabId>, Value)>,
        replies: Vec<Option<Value>>,
    }

    struct Scripted {
        inner: Mutex<Inner>,
        events: broadcast::Sender<BridgeEvent>,
    }

    impl Scripted {
        fn new(replies: Vec<Option<Value>>) -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(Inner {
                    requests: Vec::new(),
                    replies,
                }),
                events: broadcast::channel(16).0,
            })
        }

        fn codes(&self) -> Vec<String> {
            self.inner
                .lock()
                .unwrap()
                .requests
                .iter()
                .map(|(_, _, p)| p["code"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl BridgeTransport for Scripted {
        async fn request(
            &self,
            action: &str,
            tab: Option<TabId>,
            params: Value,
            _timeout: Duration,
        ) -> Result<Option<Value>, AutomationError> {
            let mut inner = self.inner.lock().unwrap();
            inner.requests.push((action.to_string(), tab, params));
            Ok(if inner.replies.is_empty() {
                None
            } else {
                inner.replies.remove(0)
            })
        }

        fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
            self.events.subscribe()
        }
    }

    #[tokio::test]
    async fn query_embeds_selector_and_returns_handles() {
        let t = Scripted::new(vec![Some(json!(["h1", "h2"]))]);
        let page = BridgePage::new(t.clone(), 9, Duration::from_secs(1));
        let found = page.query_all("a[title=\"Search\"]", None).await.unwrap();
        assert_eq!(found, vec![ElementHandle("h1".into()), ElementHandle("h2".into())]);

        let req = t.inner.lock().unwrap().requests[0].clone();
        assert_eq!(req.0, "eval");
        assert_eq!(req.1, Some(9));
        assert!(t.codes()[0].contains(r#"querySelectorAll("a[title=\"Search\"]")"#));
    }

    #[tokio::test]
    async fn element_ops_target_the_stamped_handle() {
        let t = Scripted::new(vec![
            Some(json!({ "value": { "x": 10.0, "y": 4.0, "width": 20.0, "height": 8.0 } })),
            Some(json!({ "value": true })),
            Some(json!({ "value": null })),
        ]);
        let page = BridgePage::new(t.clone(), 1, Duration::from_secs(1));
        let el = ElementHandle("h7".into());

        assert_eq!(page.bounds(&el).await.unwrap().center(), (20, 8));
        page.dispatch(&el, DomEvent::Click { x: 20, y: 8 }).await.unwrap();
        assert_eq!(page.parent(&el).await.unwrap(), None);

        let codes = t.codes();
        assert!(codes.iter().all(|c| c.contains(r#"__h("h7")"#)));
        assert!(codes[1].contains("new MouseEvent('click'"));
        assert!(codes[1].contains("clientX: 20, clientY: 8"));
    }

    #[tokio::test]
    async fn detached_handle_reads_as_not_found_and_waits_keep_going() {
        let t = Scripted::new(vec![
            Some(json!(["h1"])),
            Some(json!({ "missing": true })),
            Some(json!(["h1"])),
            Some(json!({ "missing": true })),
            Some(json!({ "missing": true })),
        ]);
        let page = BridgePage::new(t.clone(), 2, Duration::from_secs(1));

        let found = wait_for_element(
            &page,
            "#row",
            Some("A12345678901"),
            Duration::ZERO,
            Duration::from_millis(250),
        )
        .await
        .unwrap();
        assert_eq!(found, None);

        assert_eq!(first_visible(&page, "#row").await.unwrap(), None);

        let err = page.text(&ElementHandle("h1".into())).await.unwrap_err();
        assert!(matches!(err, AutomationError::ElementNotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn silent_tab_is_a_bridge_error() {
        let t = Scripted::new(vec![]);
        let page = BridgePage::new(t, 1, Duration::from_millis(10));
        let err = page.title().await.err().unwrap();
        assert!(matches!(err, AutomationError::Bridge(_)));
    }

    #[tokio::test]
    async fn mutation_events_for_this_tab_bump_the_counter() {
        let t = Scripted::new(vec![]);
        let page = BridgePage::new(t.clone(), 5, Duration::from_secs(1));
        let mut rx = page.mutations();

        t.events.send(BridgeEvent::DomMutation { tab_id: 6 }).unwrap();
        t.events.send(BridgeEvent::DomMutation { tab_id: 5 }).unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
    }
}
