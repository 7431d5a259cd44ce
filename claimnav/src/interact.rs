use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::{
    config::{HostSelectors, Timings},
    handoff::OwnershipGuard,
    page::{DomEvent, ElementHandle, Page},
    wait::{vanished_as_none, wait_for_condition},
    AutomationError,
};

/// Result of a value latch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatchOutcome {
    /// Times the value had to be written again after the host reverted it.
    pub reapplied: u32,
    /// Field held the requested value when the latch ended.
    pub verified: bool,
    /// Another element took focus, so the latch stopped early.
    pub focus_lost: bool,
    /// A newer request took ownership, so the latch stopped early.
    pub superseded: bool,
}

/// Synthetic clicks and value writes against one page.
pub struct Interactor<'a> {
    page: &'a dyn Page,
    selectors: &'a HostSelectors,
    timings: &'a Timings,
}

impl<'a> Interactor<'a> {
    pub fn new(page: &'a dyn Page, selectors: &'a HostSelectors, timings: &'a Timings) -> Self {
        Self {
            page,
            selectors,
            timings,
        }
    }

    /// Waits for the host's input-blocking overlay to drop its busy class.
    /// Returns `false` if it was still busy when the bound expired.
    pub async fn wait_until_clickable(&self) -> Result<bool, AutomationError> {
        let page = self.page;
        let overlay = self.selectors.click_overlay.as_str();
        let busy = self.selectors.click_overlay_busy_class.as_str();
        let cleared = wait_for_condition(
            page,
            self.timings.overlay(),
            self.timings.poll(),
            move || async move {
                let Some(el) = page.query(overlay).await? else {
                    return Ok(Some(()));
                };
                // A re-rendered overlay counts as cleared.
                let busy_now = vanished_as_none(page.has_class(&el, busy).await)?.unwrap_or(false);
                Ok((!busy_now).then_some(()))
            },
        )
        .await?;
        Ok(cleared.is_some())
    }

    /// Focus, pointer and mouse sequence at the element's center, then the
    /// native activation. A failed dispatch never stops the rest.
    #[instrument(level = "debug", skip(self))]
    pub async fn click(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        if !self.wait_until_clickable().await? {
            warn!(element = %el, "click overlay still busy; clicking anyway");
        }
        let (x, y) = match self.page.bounds(el).await {
            Ok(r) => r.center(),
            Err(e) => {
                debug!(element = %el, error = %e, "no bounds; using origin");
                (0, 0)
            }
        };
        let sequence = [
            DomEvent::Focus,
            DomEvent::PointerDown { x, y },
            DomEvent::MouseDown { x, y },
            DomEvent::PointerUp { x, y },
            DomEvent::MouseUp { x, y },
            DomEvent::Click { x, y },
        ];
        for event in sequence {
            if let Err(e) = self.page.dispatch(el, event).await {
                debug!(event = event.name(), error = %e, "dispatch failed");
            }
        }
        if let Err(e) = self.page.activate(el).await {
            debug!(element = %el, error = %e, "native activation failed");
        }
        Ok(())
    }

    async fn write(&self, el: &ElementHandle, value: &str, blur: bool) -> Result<(), AutomationError> {
        self.page.set_native_value(el, value).await?;
        let tail: &[DomEvent] = if blur {
            &[DomEvent::Input, DomEvent::Change, DomEvent::Blur]
        } else {
            &[DomEvent::Input, DomEvent::Change]
        };
        for event in tail {
            if let Err(e) = self.page.dispatch(el, *event).await {
                debug!(event = event.name(), error = %e, "dispatch failed");
            }
        }
        Ok(())
    }

    /// Writes `value` through the native setter, fires input/change/blur and
    /// reports whether the field reads back the same value.
    pub async fn set_value(&self, el: &ElementHandle, value: &str) -> Result<bool, AutomationError> {
        self.write(el, value, true).await?;
        Ok(self.page.value(el).await? == value)
    }

    /// Re-asserts `value` for the latch window, rewriting whenever the host
    /// reverts it. Stops early when another element takes focus or the
    /// request loses ownership.
    #[instrument(level = "debug", skip(self, guard))]
    pub async fn latch_value(
        &self,
        el: &ElementHandle,
        value: &str,
        guard: &OwnershipGuard,
    ) -> Result<LatchOutcome, AutomationError> {
        let deadline = Instant::now() + self.timings.latch_window();
        let mut outcome = LatchOutcome::default();
        loop {
            if !guard.check().await? {
                outcome.superseded = true;
                break;
            }
            if let Some(other) = self.page.focused().await? {
                if &other != el {
                    outcome.focus_lost = true;
                    break;
                }
            }
            if self.page.value(el).await? != value {
                self.write(el, value, false).await?;
                outcome.reapplied += 1;
                debug!(reapplied = outcome.reapplied, "value reverted by host; rewritten");
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.timings.latch_tick()).await;
        }
        outcome.verified = self.page.value(el).await? == value;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeElement, FakePage};
    use std::time::Duration;

    fn fixtures() -> (HostSelectors, Timings) {
        (HostSelectors::default(), Timings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn click_dispatches_full_sequence_even_when_one_event_fails() {
        let (sel, t) = fixtures();
        let page = FakePage::new("https://cc.corp/");
        let btn = page.add(FakeElement::new("#btn"));
        page.fail_event("pointerdown");
        let i = Interactor::new(&page, &sel, &t);
        let el = page.query("#btn").await.unwrap().unwrap();
        i.click(&el).await.unwrap();
        assert_eq!(
            page.events_for(btn),
            vec!["focus", "mousedown", "pointerup", "mouseup", "click"]
        );
        assert_eq!(page.activations(btn), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn click_waits_for_overlay_to_clear() {
        let (sel, t) = fixtures();
        let page = FakePage::new("https://cc.corp/");
        let overlay = page.add(FakeElement::new("#gw-click-overlay").with_class("gw-disable-click"));
        let btn = page.add(FakeElement::new("#btn"));
        let writer = page.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            writer.set_class(overlay, "gw-disable-click", false);
        });
        let started = Instant::now();
        let i = Interactor::new(&page, &sel, &t);
        let el = page.query("#btn").await.unwrap().unwrap();
        i.click(&el).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < t.overlay());
        assert_eq!(page.activations(btn), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_value_uses_native_setter_and_blurs() {
        let (sel, t) = fixtures();
        let page = FakePage::new("https://cc.corp/");
        let input = page.add(FakeElement::new("input"));
        let i = Interactor::new(&page, &sel, &t);
        let el = page.query("input").await.unwrap().unwrap();
        assert!(i.set_value(&el, "A12345678901").await.unwrap());
        assert_eq!(page.value_writes(input), vec!["A12345678901"]);
        assert_eq!(page.events_for(input), vec!["input", "change", "blur"]);
    }

    #[tokio::test(start_paused = true)]
    async fn latch_reapplies_after_external_reset() {
        let (sel, t) = fixtures();
        let page = FakePage::new("https://cc.corp/");
        let input = page.add(FakeElement::new("input"));
        let i = Interactor::new(&page, &sel, &t);
        let el = page.query("input").await.unwrap().unwrap();
        i.set_value(&el, "A12345678901").await.unwrap();

        let host = page.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            host.set_value(input, "");
        });
        let guard = OwnershipGuard::unowned("1-aaaaaa");
        let out = i.latch_value(&el, "A12345678901", &guard).await.unwrap();
        assert_eq!(out.reapplied, 1);
        assert!(out.verified);
        assert!(!out.focus_lost);
        assert_eq!(page.value_of(input), "A12345678901");
    }

    #[tokio::test(start_paused = true)]
    async fn latch_stops_when_focus_moves_elsewhere() {
        let (sel, t) = fixtures();
        let page = FakePage::new("https://cc.corp/");
        page.add(FakeElement::new("input"));
        let other = page.add(FakeElement::new("#other"));
        page.focus(Some(other));
        let i = Interactor::new(&page, &sel, &t);
        let el = page.query("input").await.unwrap().unwrap();
        let guard = OwnershipGuard::unowned("1-aaaaaa");
        let out = i.latch_value(&el, "A12345678901", &guard).await.unwrap();
        assert!(out.focus_lost);
        assert!(!out.verified);
        assert_eq!(out.reapplied, 0);
    }
}
