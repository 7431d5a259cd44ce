//! In-memory stand-ins for the browser used across unit and integration tests.
//!
//! Provides:
//! - [`FakePage`]: a scripted DOM implementing [`Page`], with reaction hooks
//!   for simulating how the host application responds to clicks and writes
//! - [`FakeTabHost`]: a tab registry implementing [`TabHost`]
//! - [`StubClipboard`]: records copied text
//!
//! Elements answer to the selector strings they were tagged with. A selector
//! list (`a, b`) matches an element tagged with any of its parts.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::{
    config::HostSelectors,
    mediator::{TabEvent, TabHost, TabInfo, TabStatus},
    messages::TabId,
    page::{DomEvent, ElementHandle, Page, Rect},
    portal::Clipboard,
    AutomationError,
};

#[derive(Debug, Clone)]
pub struct FakeElement {
    pub selectors: Vec<String>,
    pub text: String,
    pub value: String,
    pub visible: bool,
    pub disabled: bool,
    pub classes: Vec<String>,
    pub parent: Option<usize>,
    pub removed: bool,
    pub bounds: Rect,
}

impl FakeElement {
    pub fn new(selector: &str) -> Self {
        Self {
            selectors: vec![selector.to_string()],
            text: String::new(),
            value: String::new(),
            visible: true,
            disabled: false,
            classes: Vec::new(),
            parent: None,
            removed: false,
            bounds: Rect::new(10.0, 10.0, 120.0, 24.0),
        }
    }

    pub fn also(mut self, selector: &str) -> Self {
        self.selectors.push(selector.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn with_value(mut self, value: &str) -> Self {
        self.value = value.to_string();
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn child_of(mut self, parent: usize) -> Self {
        self.parent = Some(parent);
        self
    }

    fn answers(&self, selector: &str) -> bool {
        let selector = selector.trim();
        self.selectors.iter().any(|s| s == selector)
            || selector
                .split(',')
                .map(str::trim)
                .any(|part| self.selectors.iter().any(|s| s == part))
    }
}

/// Mutable document state, handed to reaction hooks.
#[derive(Debug)]
pub struct FakeDom {
    pub url: String,
    pub title: String,
    pub ready_state: String,
    /// Text outside any tagged element.
    pub page_text: String,
    elements: Vec<FakeElement>,
    focused: Option<usize>,
    events: Vec<(usize, &'static str)>,
    activations: Vec<usize>,
    value_writes: Vec<(usize, String)>,
    alerts: Vec<String>,
    navigations: Vec<String>,
    replaced_urls: Vec<String>,
    failing_events: Vec<&'static str>,
}

impl FakeDom {
    pub fn add(&mut self, el: FakeElement) -> usize {
        self.elements.push(el);
        self.elements.len() - 1
    }

    /// First live element answering to `selector`.
    pub fn find(&self, selector: &str) -> Option<usize> {
        self.elements
            .iter()
            .position(|e| !e.removed && e.answers(selector))
    }

    pub fn element_mut(&mut self, idx: usize) -> &mut FakeElement {
        &mut self.elements[idx]
    }

    pub fn element(&self, idx: usize) -> &FakeElement {
        &self.elements[idx]
    }

    pub fn remove(&mut self, idx: usize) {
        self.elements[idx].removed = true;
        if self.focused == Some(idx) {
            self.focused = None;
        }
    }

    fn is_descendant(&self, mut idx: usize, ancestor: usize) -> bool {
        while let Some(p) = self.elements[idx].parent {
            if p == ancestor {
                return true;
            }
            idx = p;
        }
        false
    }

    fn resolve(&self, el: &ElementHandle) -> Result<usize, AutomationError> {
        el.0.strip_prefix("fake-")
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|i| *i < self.elements.len())
            .ok_or_else(|| AutomationError::ElementNotFound(format!("no such handle {el}")))
    }

    /// Like `resolve`, but a removed element is gone: reads through its
    /// handle fail the way a detached node does in the browser.
    fn resolve_live(&self, el: &ElementHandle) -> Result<usize, AutomationError> {
        let i = self.resolve(el)?;
        if self.elements[i].removed {
            return Err(AutomationError::ElementNotFound(format!("stale handle {el}")));
        }
        Ok(i)
    }
}

type Hook = Box<dyn FnMut(&mut FakeDom) + Send>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum HookTrigger {
    Activate,
    SetValue,
}

struct Inner {
    dom: Mutex<FakeDom>,
    hooks: Mutex<Vec<(String, HookTrigger, Hook)>>,
    mutations: watch::Sender<u64>,
}

/// Scripted DOM. Cheap to clone; clones share the same document.
#[derive(Clone)]
pub struct FakePage {
    inner: Arc<Inner>,
}

fn handle(idx: usize) -> ElementHandle {
    ElementHandle(format!("fake-{idx}"))
}

impl FakePage {
    pub fn new(url: &str) -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                dom: Mutex::new(FakeDom {
                    url: url.to_string(),
                    title: "Guidewire ClaimCenter".to_string(),
                    ready_state: "complete".to_string(),
                    page_text: String::new(),
                    elements: Vec::new(),
                    focused: None,
                    events: Vec::new(),
                    activations: Vec::new(),
                    value_writes: Vec::new(),
                    alerts: Vec::new(),
                    navigations: Vec::new(),
                    replaced_urls: Vec::new(),
                    failing_events: Vec::new(),
                }),
                hooks: Mutex::new(Vec::new()),
                mutations: tx,
            }),
        }
    }

    fn dom(&self) -> std::sync::MutexGuard<'_, FakeDom> {
        self.inner.dom.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bump(&self) {
        self.inner.mutations.send_modify(|g| *g += 1);
    }

    /// Applies a change to the document and notifies mutation observers.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut FakeDom) -> R) -> R {
        let out = f(&mut self.dom());
        self.bump();
        out
    }

    pub fn add(&self, el: FakeElement) -> usize {
        self.mutate(|d| d.add(el))
    }

    pub fn set_text(&self, idx: usize, text: &str) {
        self.mutate(|d| d.element_mut(idx).text = text.to_string());
    }

    pub fn set_value(&self, idx: usize, value: &str) {
        self.mutate(|d| d.element_mut(idx).value = value.to_string());
    }

    pub fn remove(&self, idx: usize) {
        self.mutate(|d| d.remove(idx));
    }

    pub fn set_class(&self, idx: usize, class: &str, on: bool) {
        self.mutate(|d| {
            let el = d.element_mut(idx);
            el.classes.retain(|c| c != class);
            if on {
                el.classes.push(class.to_string());
            }
        });
    }

    pub fn set_url(&self, url: &str) {
        self.mutate(|d| d.url = url.to_string());
    }

    pub fn set_page_text(&self, text: &str) {
        self.mutate(|d| d.page_text = text.to_string());
    }

    /// Makes `dispatch` fail for one event type.
    pub fn fail_event(&self, name: &'static str) {
        self.dom().failing_events.push(name);
    }

    /// Runs `hook` every time an element answering to `selector` is activated.
    pub fn on_activate(&self, selector: &str, hook: impl FnMut(&mut FakeDom) + Send + 'static) {
        self.push_hook(selector, HookTrigger::Activate, Box::new(hook));
    }

    /// Runs `hook` after every native value write to a matching element.
    pub fn on_set_value(&self, selector: &str, hook: impl FnMut(&mut FakeDom) + Send + 'static) {
        self.push_hook(selector, HookTrigger::SetValue, Box::new(hook));
    }

    fn push_hook(&self, selector: &str, trigger: HookTrigger, hook: Hook) {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((selector.to_string(), trigger, hook));
    }

    fn fire(&self, idx: usize, trigger: HookTrigger) {
        let mut hooks = self.inner.hooks.lock().unwrap_or_else(|p| p.into_inner());
        let mut dom = self.dom();
        let mut fired = false;
        for (selector, t, hook) in hooks.iter_mut() {
            if *t == trigger && dom.elements[idx].answers(selector) {
                hook(&mut dom);
                fired = true;
            }
        }
        drop(dom);
        if fired {
            self.bump();
        }
    }

    pub fn url_now(&self) -> String {
        self.dom().url.clone()
    }

    pub fn value_of(&self, idx: usize) -> String {
        self.dom().elements[idx].value.clone()
    }

    pub fn events_for(&self, idx: usize) -> Vec<&'static str> {
        self.dom()
            .events
            .iter()
            .filter(|(i, _)| *i == idx)
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn count_events(&self, idx: usize, name: &str) -> usize {
        self.events_for(idx).iter().filter(|n| **n == name).count()
    }

    pub fn activations(&self, idx: usize) -> usize {
        self.dom().activations.iter().filter(|i| **i == idx).count()
    }

    pub fn value_writes(&self, idx: usize) -> Vec<String> {
        self.dom()
            .value_writes
            .iter()
            .filter(|(i, _)| *i == idx)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.dom().alerts.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.dom().navigations.clone()
    }

    pub fn replaced_urls(&self) -> Vec<String> {
        self.dom().replaced_urls.clone()
    }

    pub fn focus(&self, idx: Option<usize>) {
        self.dom().focused = idx;
    }
}

#[async_trait]
impl Page for FakePage {
    async fn url(&self) -> Result<String, AutomationError> {
        Ok(self.dom().url.clone())
    }

    async fn title(&self) -> Result<String, AutomationError> {
        Ok(self.dom().title.clone())
    }

    async fn ready_state(&self) -> Result<String, AutomationError> {
        Ok(self.dom().ready_state.clone())
    }

    async fn body_text(&self) -> Result<String, AutomationError> {
        let dom = self.dom();
        let mut out = dom.page_text.clone();
        for el in dom.elements.iter().filter(|e| !e.removed && e.visible) {
            if !el.text.is_empty() {
                out.push('\n');
                out.push_str(&el.text);
            }
        }
        Ok(out)
    }

    async fn query_all(
        &self,
        selector: &str,
        within: Option<&ElementHandle>,
    ) -> Result<Vec<ElementHandle>, AutomationError> {
        let dom = self.dom();
        let scope = within.map(|w| dom.resolve(w)).transpose()?;
        Ok(dom
            .elements
            .iter()
            .enumerate()
            .filter(|(i, e)| {
                !e.removed
                    && e.answers(selector)
                    && scope.map_or(true, |s| dom.is_descendant(*i, s))
            })
            .map(|(i, _)| handle(i))
            .collect())
    }

    async fn text(&self, el: &ElementHandle) -> Result<String, AutomationError> {
        let dom = self.dom();
        let i = dom.resolve_live(el)?;
        Ok(dom.elements[i].text.clone())
    }

    async fn value(&self, el: &ElementHandle) -> Result<String, AutomationError> {
        let dom = self.dom();
        let i = dom.resolve_live(el)?;
        Ok(dom.elements[i].value.clone())
    }

    async fn is_visible(&self, el: &ElementHandle) -> Result<bool, AutomationError> {
        let dom = self.dom();
        let i = dom.resolve_live(el)?;
        Ok(dom.elements[i].visible)
    }

    async fn is_connected(&self, el: &ElementHandle) -> Result<bool, AutomationError> {
        let dom = self.dom();
        let i = dom.resolve(el)?;
        Ok(!dom.elements[i].removed)
    }

    async fn is_disabled(&self, el: &ElementHandle) -> Result<bool, AutomationError> {
        let dom = self.dom();
        let i = dom.resolve_live(el)?;
        Ok(dom.elements[i].disabled)
    }

    async fn has_class(&self, el: &ElementHandle, class: &str) -> Result<bool, AutomationError> {
        let dom = self.dom();
        let i = dom.resolve_live(el)?;
        Ok(dom.elements[i].classes.iter().any(|c| c == class))
    }

    async fn focused(&self) -> Result<Option<ElementHandle>, AutomationError> {
        Ok(self.dom().focused.map(handle))
    }

    async fn bounds(&self, el: &ElementHandle) -> Result<Rect, AutomationError> {
        let dom = self.dom();
        let i = dom.resolve_live(el)?;
        Ok(dom.elements[i].bounds)
    }

    async fn closest(
        &self,
        el: &ElementHandle,
        selector: &str,
    ) -> Result<Option<ElementHandle>, AutomationError> {
        let dom = self.dom();
        let mut cur = Some(dom.resolve_live(el)?);
        while let Some(i) = cur {
            if dom.elements[i].answers(selector) {
                return Ok(Some(handle(i)));
            }
            cur = dom.elements[i].parent;
        }
        Ok(None)
    }

    async fn parent(&self, el: &ElementHandle) -> Result<Option<ElementHandle>, AutomationError> {
        let dom = self.dom();
        let i = dom.resolve_live(el)?;
        Ok(dom.elements[i].parent.map(handle))
    }

    async fn dispatch(&self, el: &ElementHandle, event: DomEvent) -> Result<(), AutomationError> {
        let mut dom = self.dom();
        let i = dom.resolve_live(el)?;
        let name = event.name();
        if dom.failing_events.contains(&name) {
            return Err(AutomationError::Internal(format!("{name} dispatch failed")));
        }
        dom.events.push((i, name));
        match event {
            DomEvent::Focus => dom.focused = Some(i),
            DomEvent::Blur if dom.focused == Some(i) => dom.focused = None,
            _ => {}
        }
        Ok(())
    }

    async fn activate(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        let i = {
            let mut dom = self.dom();
            let i = dom.resolve_live(el)?;
            dom.activations.push(i);
            i
        };
        self.fire(i, HookTrigger::Activate);
        Ok(())
    }

    async fn set_native_value(
        &self,
        el: &ElementHandle,
        value: &str,
    ) -> Result<(), AutomationError> {
        let i = {
            let mut dom = self.dom();
            let i = dom.resolve_live(el)?;
            dom.elements[i].value = value.to_string();
            dom.value_writes.push((i, value.to_string()));
            i
        };
        self.fire(i, HookTrigger::SetValue);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        self.mutate(|d| {
            d.navigations.push(url.to_string());
            d.url = url.to_string();
        });
        Ok(())
    }

    async fn replace_url(&self, url: &str) -> Result<(), AutomationError> {
        let mut dom = self.dom();
        dom.replaced_urls.push(url.to_string());
        dom.url = url.to_string();
        Ok(())
    }

    async fn alert(&self, message: &str) -> Result<(), AutomationError> {
        self.dom().alerts.push(message.to_string());
        Ok(())
    }

    fn mutations(&self) -> watch::Receiver<u64> {
        self.inner.mutations.subscribe()
    }
}

struct TabsInner {
    tabs: Vec<TabInfo>,
    next_id: TabId,
    complete_on_create: bool,
    removed: Vec<TabId>,
    updates: Vec<(TabId, String)>,
}

/// Tab registry with scripted load completion.
#[derive(Clone)]
pub struct FakeTabHost {
    inner: Arc<Mutex<TabsInner>>,
    events: broadcast::Sender<TabEvent>,
}

impl Default for FakeTabHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTabHost {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(TabsInner {
                tabs: Vec::new(),
                next_id: 1,
                complete_on_create: true,
                removed: Vec::new(),
                updates: Vec::new(),
            })),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TabsInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Newly created or updated tabs stay `loading` until [`Self::complete`].
    pub fn hold_loading(&self) {
        self.lock().complete_on_create = false;
    }

    pub fn open(&self, url: &str, status: TabStatus) -> TabId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.tabs.push(TabInfo {
            id,
            url: url.to_string(),
            status,
        });
        id
    }

    pub fn complete(&self, id: TabId) {
        let tab = {
            let mut inner = self.lock();
            let Some(tab) = inner.tabs.iter_mut().find(|t| t.id == id) else {
                return;
            };
            tab.status = TabStatus::Complete;
            tab.clone()
        };
        let _ = self.events.send(TabEvent::Updated(tab));
    }

    pub fn tabs(&self) -> Vec<TabInfo> {
        self.lock().tabs.clone()
    }

    pub fn removed(&self) -> Vec<TabId> {
        self.lock().removed.clone()
    }

    pub fn updates(&self) -> Vec<(TabId, String)> {
        self.lock().updates.clone()
    }
}

#[async_trait]
impl TabHost for FakeTabHost {
    async fn get(&self, id: TabId) -> Result<Option<TabInfo>, AutomationError> {
        Ok(self.lock().tabs.iter().find(|t| t.id == id).cloned())
    }

    async fn query(&self, url_prefix: &str) -> Result<Vec<TabInfo>, AutomationError> {
        Ok(self
            .lock()
            .tabs
            .iter()
            .filter(|t| t.url.starts_with(url_prefix))
            .cloned()
            .collect())
    }

    async fn create(&self, url: &str) -> Result<TabInfo, AutomationError> {
        let tab = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            let status = if inner.complete_on_create {
                TabStatus::Complete
            } else {
                TabStatus::Loading
            };
            let tab = TabInfo {
                id,
                url: url.to_string(),
                status,
            };
            inner.tabs.push(tab.clone());
            tab
        };
        let _ = self.events.send(TabEvent::Updated(tab.clone()));
        Ok(tab)
    }

    async fn update(&self, id: TabId, url: &str) -> Result<TabInfo, AutomationError> {
        let tab = {
            let mut inner = self.lock();
            let complete = inner.complete_on_create;
            inner.updates.push((id, url.to_string()));
            let tab = inner
                .tabs
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| AutomationError::Bridge(format!("no tab with id {id}")))?;
            tab.url = url.to_string();
            tab.status = if complete {
                TabStatus::Complete
            } else {
                TabStatus::Loading
            };
            tab.clone()
        };
        let _ = self.events.send(TabEvent::Updated(tab.clone()));
        Ok(tab)
    }

    async fn remove(&self, id: TabId) -> Result<(), AutomationError> {
        {
            let mut inner = self.lock();
            inner.tabs.retain(|t| t.id != id);
            inner.removed.push(id);
        }
        let _ = self.events.send(TabEvent::Removed(id));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TabEvent> {
        self.events.subscribe()
    }
}

/// Installs a claim application that behaves when driven correctly: the
/// search tab reveals the search form, the search button renders a result row
/// echoing the typed claim, the row opens the claim with the given side menu,
/// and any menu link loads a sub-page.
pub fn script_claim_app(page: &FakePage, sel: &HostSelectors, menu: &[&str]) {
    page.add(FakeElement::new(&sel.search_tab).with_text("Search"));

    let s = sel.clone();
    page.on_activate(&sel.search_tab, move |dom| {
        if dom.find(&s.search_screen_title).is_none() {
            dom.add(FakeElement::new(&s.search_screen_title).with_text("Search Claims"));
            dom.add(FakeElement::new(&s.claim_input));
            dom.add(FakeElement::new(&s.search_button).with_text("Search"));
        }
    });

    let s = sel.clone();
    page.on_activate(&sel.search_button, move |dom| {
        let typed = dom
            .find(&s.claim_input)
            .map(|i| dom.element(i).value.clone())
            .unwrap_or_default();
        if dom.find(&s.results_container).is_none() {
            dom.add(FakeElement::new(&s.results_container));
        }
        match dom.find(&s.result_row) {
            Some(row) => dom.element_mut(row).text = typed,
            None => {
                dom.add(FakeElement::new(&s.result_row).with_text(&typed));
            }
        }
    });

    let s = sel.clone();
    let labels: Vec<String> = menu.iter().map(|l| l.to_string()).collect();
    page.on_activate(&sel.result_row, move |dom| {
        if dom.find(&s.menu_container).is_some() {
            return;
        }
        let container = dom.add(FakeElement::new(&s.menu_container));
        for label in &labels {
            let li = dom.add(FakeElement::new("li").child_of(container));
            dom.add(
                FakeElement::new("li a")
                    .also("a")
                    .with_text(label)
                    .child_of(li),
            );
        }
    });

    let s = sel.clone();
    page.on_activate("a", move |dom| {
        if let Some(marker) = s.subpage_markers.first() {
            if dom.find(marker).is_none() {
                dom.add(FakeElement::new(marker).with_text("Loss Details"));
            }
        }
    });
}

/// Adds the vehicle incident table of the loss details screen.
pub fn add_vehicle_incidents(page: &FakePage, sel: &HostSelectors, driver: &str, loss_party: &str) -> usize {
    page.add(
        FakeElement::new(&sel.vehicle_incident_rows).with_text("Third party's loss  Other Driver"),
    );
    let row = page.add(
        FakeElement::new(&sel.vehicle_incident_rows)
            .with_text(&format!("Insured's loss  {driver}  {loss_party}")),
    );
    page.add(
        FakeElement::new(r#"[id*="-Driver"] .gw-value-readonly-wrapper"#)
            .with_text(driver)
            .child_of(row),
    );
    page.add(FakeElement::new(&sel.loss_party).with_text(loss_party).child_of(row));
    row
}

/// Clipboard that remembers every copy.
#[derive(Default, Clone)]
pub struct StubClipboard {
    copied: Arc<Mutex<Vec<String>>>,
}

impl StubClipboard {
    pub fn copied(&self) -> Vec<String> {
        self.copied
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Clipboard for StubClipboard {
    fn copy_text(&self, text: &str) -> Result<(), AutomationError> {
        self.copied
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(text.to_string());
        Ok(())
    }
}
