//! Handoff records, ownership and completion tracking in the shared store.
//!
//! Ownership is "latest writer wins": every new handoff overwrites
//! `ownerRequestId` and bumps `kick`. Nothing is locked; running code checks
//! [`OwnershipGuard::ensure`] after each suspension point and stops when a
//! newer request has taken over.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    messages::OpenTargetReply,
    store::{self, keys, KvStore},
    AutomationError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRecord {
    pub claim: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    pub request_id: String,
    /// Unix millis at creation. Informational.
    pub timestamp: i64,
    /// Bypass per-claim failure suppression for this request.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipState {
    pub owner_request_id: Option<String>,
    pub kick: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastSuccessState {
    pub last_request_id: Option<String>,
    pub last_claim: Option<String>,
    /// `kick` observed when the run completed.
    pub last_kick: Option<u64>,
}

/// `<unix millis>-<6 lowercase alphanumerics>`.
pub fn new_request_id() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

/// Typed access to the handoff keys.
#[derive(Clone)]
pub struct HandoffStore {
    store: Arc<dyn KvStore>,
}

impl HandoffStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub async fn handoff(&self) -> Result<Option<HandoffRecord>, AutomationError> {
        store::read(self.store.as_ref(), keys::HANDOFF).await
    }

    pub async fn ownership(&self) -> Result<OwnershipState, AutomationError> {
        Ok(OwnershipState {
            owner_request_id: store::read(self.store.as_ref(), keys::OWNER_REQUEST_ID).await?,
            kick: store::read(self.store.as_ref(), keys::KICK)
                .await?
                .unwrap_or(0),
        })
    }

    pub async fn last_success(&self) -> Result<LastSuccessState, AutomationError> {
        Ok(LastSuccessState {
            last_request_id: store::read(self.store.as_ref(), keys::LAST_REQUEST_ID).await?,
            last_claim: store::read(self.store.as_ref(), keys::LAST_CLAIM).await?,
            last_kick: store::read(self.store.as_ref(), keys::LAST_KICK).await?,
        })
    }

    /// Writes a new handoff, takes ownership and bumps `kick` in one change.
    pub async fn write_handoff(&self, record: &HandoffRecord) -> Result<u64, AutomationError> {
        let handoff = serde_json::to_value(record)?;
        let owner = json!(record.request_id);
        let written = self
            .store
            .update(
                &[keys::KICK],
                Box::new(move |current: &HashMap<String, Value>| {
                    let kick = current.get(keys::KICK).and_then(Value::as_u64).unwrap_or(0) + 1;
                    vec![
                        (keys::HANDOFF.into(), handoff),
                        (keys::OWNER_REQUEST_ID.into(), owner),
                        (keys::KICK.into(), json!(kick)),
                    ]
                }),
            )
            .await?;
        written
            .iter()
            .find(|(k, _)| k == keys::KICK)
            .and_then(|(_, v)| v.as_u64())
            .ok_or_else(|| AutomationError::Storage("kick missing after handoff write".into()))
    }

    /// Re-asserts `request_id` as owner without touching `kick`, but only
    /// while the stored handoff is still that request. Returns whether
    /// ownership was taken.
    pub async fn assert_owner(&self, request_id: &str) -> Result<bool, AutomationError> {
        let id = request_id.to_string();
        let written = self
            .store
            .update(
                &[keys::HANDOFF],
                Box::new(move |current: &HashMap<String, Value>| {
                    let current_id = current
                        .get(keys::HANDOFF)
                        .and_then(|h| h.get("requestId"))
                        .and_then(Value::as_str);
                    if current_id == Some(id.as_str()) {
                        vec![(keys::OWNER_REQUEST_ID.into(), json!(id))]
                    } else {
                        Vec::new()
                    }
                }),
            )
            .await?;
        Ok(!written.is_empty())
    }

    /// True only while `request_id` is both the owner and the current
    /// handoff. Read failures count as stale.
    pub async fn still_latest(&self, request_id: &str) -> bool {
        let owner = match self.ownership().await {
            Ok(o) => o.owner_request_id,
            Err(e) => {
                debug!(error = %e, "ownership unreadable");
                return false;
            }
        };
        let handoff = self.handoff().await.ok().flatten();
        owner.as_deref() == Some(request_id)
            && handoff.is_some_and(|h| h.request_id == request_id)
    }

    pub async fn record_success(&self, request_id: &str, claim: &str) -> Result<(), AutomationError> {
        let kick = self.ownership().await?.kick;
        self.store
            .set_many(vec![
                (keys::LAST_REQUEST_ID.into(), json!(request_id)),
                (keys::LAST_CLAIM.into(), json!(claim)),
                (keys::LAST_KICK.into(), json!(kick)),
            ])
            .await
    }

    /// Same request, same claim, and no new kick since it last succeeded.
    pub async fn is_duplicate(&self, request_id: &str, claim: &str) -> Result<bool, AutomationError> {
        let last = self.last_success().await?;
        if last.last_request_id.as_deref() != Some(request_id)
            || last.last_claim.as_deref() != Some(claim)
        {
            return Ok(false);
        }
        let kick = self.ownership().await?.kick;
        Ok(last.last_kick.map_or(true, |k| k == kick))
    }
}

/// Cooperative cancellation token for one request.
#[derive(Clone)]
pub struct OwnershipGuard {
    state: Option<HandoffStore>,
    request_id: String,
}

impl OwnershipGuard {
    pub fn new(state: HandoffStore, request_id: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            request_id: request_id.into(),
        }
    }

    /// A guard that never reports loss of ownership.
    pub fn unowned(request_id: impl Into<String>) -> Self {
        Self {
            state: None,
            request_id: request_id.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// True while no other request holds ownership. An empty owner slot
    /// (a run started from a bare link) counts as ours.
    pub async fn check(&self) -> Result<bool, AutomationError> {
        let Some(state) = &self.state else {
            return Ok(true);
        };
        let owner = state.ownership().await?.owner_request_id;
        Ok(owner.map_or(true, |o| o == self.request_id))
    }

    pub async fn ensure(&self) -> Result<(), AutomationError> {
        if self.check().await? {
            Ok(())
        } else {
            debug!(request_id = %self.request_id, "ownership lost");
            Err(AutomationError::Superseded {
                request_id: self.request_id.clone(),
            })
        }
    }
}

/// Receives the "open the target" signal after a handoff is recorded.
#[async_trait]
pub trait HandoffNotifier: Send + Sync {
    async fn open_target(&self, request_id: &str) -> Result<OpenTargetReply, AutomationError>;
}

pub struct HandoffTicket {
    pub record: HandoffRecord,
    pub kick: u64,
    /// Resolves with the mediator's reply.
    pub delivery: JoinHandle<Result<OpenTargetReply, AutomationError>>,
}

pub struct HandoffCoordinator {
    state: HandoffStore,
    notifier: Arc<dyn HandoffNotifier>,
}

impl HandoffCoordinator {
    pub fn new(store: Arc<dyn KvStore>, notifier: Arc<dyn HandoffNotifier>) -> Self {
        Self {
            state: HandoffStore::new(store),
            notifier,
        }
    }

    pub fn state(&self) -> &HandoffStore {
        &self.state
    }

    /// Records a fresh handoff for `claim`, superseding any earlier one.
    #[instrument(skip(self))]
    pub async fn submit(
        &self,
        claim: &str,
        policy: Option<&str>,
        force: bool,
    ) -> Result<(HandoffRecord, u64), AutomationError> {
        let claim = claim.trim();
        if claim.is_empty() {
            return Err(AutomationError::MissingInput("claim number is empty".into()));
        }
        let record = HandoffRecord {
            claim: claim.to_string(),
            policy: policy.map(str::to_string),
            request_id: new_request_id(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            force,
        };
        let kick = self.state.write_handoff(&record).await?;
        info!(request_id = %record.request_id, claim, kick, "handoff recorded");
        Ok((record, kick))
    }

    /// [`Self::submit`] followed by a detached notification to the mediator.
    pub async fn submit_handoff(
        &self,
        claim: &str,
        policy: Option<&str>,
        force: bool,
    ) -> Result<HandoffTicket, AutomationError> {
        let (record, kick) = self.submit(claim, policy, force).await?;
        let notifier = self.notifier.clone();
        let request_id = record.request_id.clone();
        let delivery = tokio::spawn(async move {
            let reply = notifier.open_target(&request_id).await;
            if let Err(e) = &reply {
                warn!(%request_id, error = %e, "mediator did not accept handoff");
            }
            reply
        });
        Ok(HandoffTicket {
            record,
            kick,
            delivery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl HandoffNotifier for Recorder {
        async fn open_target(&self, request_id: &str) -> Result<OpenTargetReply, AutomationError> {
            self.0.lock().unwrap().push(request_id.to_string());
            Ok(OpenTargetReply {
                ok: true,
                ..Default::default()
            })
        }
    }

    #[test]
    fn request_ids_have_millis_and_suffix() {
        let id = new_request_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(new_request_id(), id);
    }

    #[tokio::test]
    async fn later_handoff_supersedes_earlier() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let recorder = Arc::new(Recorder::default());
        let coordinator = HandoffCoordinator::new(store.clone(), recorder.clone());

        let a = coordinator.submit_handoff("X12345678901", None, false).await.unwrap();
        let b = coordinator
            .submit_handoff("Y12345678901", Some("Q1234567"), false)
            .await
            .unwrap();
        a.delivery.await.unwrap().unwrap();
        b.delivery.await.unwrap().unwrap();

        assert_eq!(b.kick, a.kick + 1);
        let state = coordinator.state();
        assert!(!state.still_latest(&a.record.request_id).await);
        assert!(state.still_latest(&b.record.request_id).await);

        let guard_a = OwnershipGuard::new(state.clone(), a.record.request_id.clone());
        assert!(guard_a.ensure().await.unwrap_err().is_stale());
        assert_eq!(recorder.0.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_detection_respects_kick() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let coordinator = HandoffCoordinator::new(store, Arc::new(Recorder::default()));
        let (rec, _) = coordinator.submit("X12345678901", None, false).await.unwrap();
        let state = coordinator.state();

        assert!(!state.is_duplicate(&rec.request_id, &rec.claim).await.unwrap());
        state.record_success(&rec.request_id, &rec.claim).await.unwrap();
        assert!(state.is_duplicate(&rec.request_id, &rec.claim).await.unwrap());

        // A manual re-trigger bumps kick even if the request id were reused.
        state.write_handoff(&rec).await.unwrap();
        assert!(!state.is_duplicate(&rec.request_id, &rec.claim).await.unwrap());
    }

    fn record(request_id: &str) -> HandoffRecord {
        HandoffRecord {
            claim: "X12345678901".into(),
            policy: None,
            request_id: request_id.into(),
            timestamp: 0,
            force: false,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_handoffs_get_distinct_kicks() {
        let state = HandoffStore::new(Arc::new(MemoryStore::new()));
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let state = state.clone();
                tokio::spawn(async move {
                    state
                        .write_handoff(&record(&format!("{i}-aaaaaa")))
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut kicks = Vec::new();
        for t in tasks {
            kicks.push(t.await.unwrap());
        }
        kicks.sort_unstable();
        assert_eq!(kicks, (1..=16).collect::<Vec<u64>>());
        assert_eq!(state.ownership().await.unwrap().kick, 16);
    }

    #[tokio::test]
    async fn superseded_request_cannot_reclaim_ownership() {
        let state = HandoffStore::new(Arc::new(MemoryStore::new()));
        state.write_handoff(&record("1-aaaaaa")).await.unwrap();
        state.write_handoff(&record("2-bbbbbb")).await.unwrap();

        assert!(!state.assert_owner("1-aaaaaa").await.unwrap());
        let owner = state.ownership().await.unwrap().owner_request_id;
        assert_eq!(owner.as_deref(), Some("2-bbbbbb"));

        assert!(state.assert_owner("2-bbbbbb").await.unwrap());
        assert_eq!(state.ownership().await.unwrap().kick, 2);
    }

    #[tokio::test]
    async fn empty_owner_slot_is_allowed() {
        let state = HandoffStore::new(Arc::new(MemoryStore::new()));
        let guard = OwnershipGuard::new(state, "1-aaaaaa");
        assert!(guard.check().await.unwrap());
    }

    #[tokio::test]
    async fn blank_claim_is_missing_input() {
        let coordinator = HandoffCoordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Recorder::default()),
        );
        let err = coordinator.submit("  ", None, false).await.unwrap_err();
        assert!(matches!(err, AutomationError::MissingInput(_)));
    }
}
