use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::AutomationError;

/// Opaque reference to an element inside one page.
///
/// Handles may outlive the element they point at; use
/// [`Page::is_connected`] before writing through a handle obtained earlier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub String);

impl std::fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Visual center in whole pixels.
    pub fn center(&self) -> (i64, i64) {
        (
            (self.x + self.width / 2.0).floor() as i64,
            (self.y + self.height / 2.0).floor() as i64,
        )
    }
}

/// Synthetic DOM events. Pointer and mouse events carry client coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DomEvent {
    Focus,
    PointerDown { x: i64, y: i64 },
    MouseDown { x: i64, y: i64 },
    PointerUp { x: i64, y: i64 },
    MouseUp { x: i64, y: i64 },
    Click { x: i64, y: i64 },
    Input,
    Change,
    Blur,
}

impl DomEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomEvent::Focus => "focus",
            DomEvent::PointerDown { .. } => "pointerdown",
            DomEvent::MouseDown { .. } => "mousedown",
            DomEvent::PointerUp { .. } => "pointerup",
            DomEvent::MouseUp { .. } => "mouseup",
            DomEvent::Click { .. } => "click",
            DomEvent::Input => "input",
            DomEvent::Change => "change",
            DomEvent::Blur => "blur",
        }
    }

    pub fn coordinates(&self) -> Option<(i64, i64)> {
        match *self {
            DomEvent::PointerDown { x, y }
            | DomEvent::MouseDown { x, y }
            | DomEvent::PointerUp { x, y }
            | DomEvent::MouseUp { x, y }
            | DomEvent::Click { x, y } => Some((x, y)),
            _ => None,
        }
    }
}

/// One rendered document the automation can observe and drive.
///
/// Query methods answer "nothing there" with `Ok(None)`/`Ok(vec![])`; errors
/// are reserved for a broken transport or a handle that cannot be resolved.
#[async_trait]
pub trait Page: Send + Sync {
    async fn url(&self) -> Result<String, AutomationError>;
    async fn title(&self) -> Result<String, AutomationError>;
    async fn ready_state(&self) -> Result<String, AutomationError>;
    /// Visible text of the whole document.
    async fn body_text(&self) -> Result<String, AutomationError>;

    async fn query_all(
        &self,
        selector: &str,
        within: Option<&ElementHandle>,
    ) -> Result<Vec<ElementHandle>, AutomationError>;

    async fn query(&self, selector: &str) -> Result<Option<ElementHandle>, AutomationError> {
        Ok(self.query_all(selector, None).await?.into_iter().next())
    }

    async fn text(&self, el: &ElementHandle) -> Result<String, AutomationError>;
    async fn value(&self, el: &ElementHandle) -> Result<String, AutomationError>;
    async fn is_visible(&self, el: &ElementHandle) -> Result<bool, AutomationError>;
    async fn is_connected(&self, el: &ElementHandle) -> Result<bool, AutomationError>;
    async fn is_disabled(&self, el: &ElementHandle) -> Result<bool, AutomationError>;
    async fn has_class(&self, el: &ElementHandle, class: &str) -> Result<bool, AutomationError>;
    async fn bounds(&self, el: &ElementHandle) -> Result<Rect, AutomationError>;
    async fn closest(
        &self,
        el: &ElementHandle,
        selector: &str,
    ) -> Result<Option<ElementHandle>, AutomationError>;
    async fn parent(&self, el: &ElementHandle) -> Result<Option<ElementHandle>, AutomationError>;

    /// The element owning keyboard focus, if any.
    async fn focused(&self) -> Result<Option<ElementHandle>, AutomationError>;

    async fn dispatch(&self, el: &ElementHandle, event: DomEvent) -> Result<(), AutomationError>;
    /// The element's own `click()` activation.
    async fn activate(&self, el: &ElementHandle) -> Result<(), AutomationError>;
    /// Writes through the prototype-level `value` setter so framework
    /// change tracking observes the write.
    async fn set_native_value(&self, el: &ElementHandle, value: &str)
        -> Result<(), AutomationError>;

    async fn navigate(&self, url: &str) -> Result<(), AutomationError>;
    /// Rewrites the address bar without reloading.
    async fn replace_url(&self, url: &str) -> Result<(), AutomationError>;
    /// Blocking notification shown to the user.
    async fn alert(&self, message: &str) -> Result<(), AutomationError>;

    /// Generation counter bumped on every observed DOM mutation.
    fn mutations(&self) -> watch::Receiver<u64>;
}

/// Reads a query parameter, treating empty values as absent.
pub fn query_param(page_url: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(page_url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// `origin + path`, dropping query and fragment.
pub fn strip_query(page_url: &str) -> String {
    match url::Url::parse(page_url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => page_url
            .split(['?', '#'])
            .next()
            .unwrap_or(page_url)
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_is_floored() {
        let r = Rect::new(10.0, 20.0, 15.0, 7.0);
        assert_eq!(r.center(), (17, 23));
    }

    #[test]
    fn query_param_ignores_empty_values() {
        let u = "https://cc.corp/ClaimCenter.do?claimNumber=A12345678901&TargetPage=";
        assert_eq!(
            query_param(u, "claimNumber").as_deref(),
            Some("A12345678901")
        );
        assert_eq!(query_param(u, "TargetPage"), None);
        assert_eq!(query_param("not a url", "x"), None);
    }

    #[test]
    fn strip_query_keeps_origin_and_path() {
        assert_eq!(
            strip_query("https://cc.corp/ClaimCenter.do?tm_t=1&process=true#top"),
            "https://cc.corp/ClaimCenter.do"
        );
    }
}
