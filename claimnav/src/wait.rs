use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::{
    page::{ElementHandle, Page},
    AutomationError,
};

/// Resolves once `probe` yields a value, or with `None` when `timeout` elapses.
///
/// The probe runs once before any waiting, then again after every DOM
/// mutation and on each `poll` tick (some changes, like SPA URL changes, are
/// not visible as mutations). A zero timeout means a single check. The
/// mutation subscription is dropped on every exit path.
pub async fn wait_for_condition<T, F, Fut>(
    page: &dyn Page,
    timeout: Duration,
    poll: Duration,
    mut probe: F,
) -> Result<Option<T>, AutomationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, AutomationError>>,
{
    let mut mutations = page.mutations();

    if let Some(v) = probe().await? {
        return Ok(Some(v));
    }
    if timeout.is_zero() {
        return Ok(None);
    }

    let deadline = Instant::now() + timeout;
    let mut observing = true;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Ok(None),
            changed = mutations.changed(), if observing => {
                if changed.is_err() {
                    observing = false;
                }
            }
            _ = tokio::time::sleep(poll) => {}
        }
        if let Some(v) = probe().await? {
            return Ok(Some(v));
        }
    }
}

/// Maps a handle whose element left the document to "absent".
pub(crate) fn vanished_as_none<T>(r: Result<T, AutomationError>) -> Result<Option<T>, AutomationError> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(AutomationError::ElementNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Waits for the first element matching `selector`, optionally requiring its
/// text to contain `text`.
#[instrument(level = "debug", skip(page, timeout, poll))]
pub async fn wait_for_element(
    page: &dyn Page,
    selector: &str,
    text: Option<&str>,
    timeout: Duration,
    poll: Duration,
) -> Result<Option<ElementHandle>, AutomationError> {
    let found = wait_for_condition(page, timeout, poll, move || async move {
        let Some(el) = page.query(selector).await? else {
            return Ok(None);
        };
        match text {
            None => Ok(Some(el)),
            Some(expected) => match vanished_as_none(page.text(&el).await)? {
                Some(t) if t.contains(expected) => Ok(Some(el)),
                _ => Ok(None),
            },
        }
    })
    .await?;
    if found.is_none() {
        debug!(selector, ?timeout, "element did not appear");
    }
    Ok(found)
}

/// Waits for any of `selectors`; returns the index of the selector that
/// matched together with the element.
pub async fn wait_for_any(
    page: &dyn Page,
    selectors: &[String],
    timeout: Duration,
    poll: Duration,
) -> Result<Option<(usize, ElementHandle)>, AutomationError> {
    wait_for_condition(page, timeout, poll, move || async move {
        for (i, sel) in selectors.iter().enumerate() {
            if let Some(el) = page.query(sel).await? {
                return Ok(Some((i, el)));
            }
        }
        Ok(None)
    })
    .await
}

/// First visible, connected element matching `selector`.
pub async fn first_visible(
    page: &dyn Page,
    selector: &str,
) -> Result<Option<ElementHandle>, AutomationError> {
    for el in page.query_all(selector, None).await? {
        let usable = vanished_as_none(page.is_visible(&el).await)?.unwrap_or(false)
            && vanished_as_none(page.is_connected(&el).await)?.unwrap_or(false);
        if usable {
            return Ok(Some(el));
        }
    }
    Ok(None)
}

/// True when any of `selectors` currently matches a visible element.
pub async fn any_visible(page: &dyn Page, selectors: &[String]) -> Result<bool, AutomationError> {
    for sel in selectors {
        if first_visible(page, sel).await?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Waits until none of `selectors` is visible. Returns `false` on timeout.
pub async fn wait_until_gone(
    page: &dyn Page,
    selectors: &[String],
    timeout: Duration,
    poll: Duration,
) -> Result<bool, AutomationError> {
    let cleared = wait_for_condition(page, timeout, poll, move || async move {
        Ok((!any_visible(page, selectors).await?).then_some(()))
    })
    .await?;
    Ok(cleared.is_some())
}
