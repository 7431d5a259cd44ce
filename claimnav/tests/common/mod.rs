#![allow(dead_code)]

use std::sync::Arc;

use claimnav::{
    form::FormConfig,
    store::{KvStore, MemoryStore},
    testing::FakePage,
    HostSelectors, TargetAgent, Timings,
};
use tracing_subscriber::EnvFilter;

pub const CLAIM: &str = "A12345678901";
pub const APP_URL: &str = "https://cc.corp/ClaimCenter.do";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("claimnav=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn memory_store() -> Arc<dyn KvStore> {
    Arc::new(MemoryStore::new())
}

pub fn agent_for(page: &FakePage, store: &Arc<dyn KvStore>) -> Arc<TargetAgent> {
    Arc::new(TargetAgent::new(
        Arc::new(page.clone()),
        store.clone(),
        Arc::new(HostSelectors::default()),
        Timings::default(),
        FormConfig::default(),
    ))
}

pub async fn set_run_mode(store: &Arc<dyn KvStore>, mode: &str) {
    store
        .set_many(vec![(
            "settings_v1".into(),
            serde_json::json!({ "runMode": mode, "targetPage": "claim_overview_summary" }),
        )])
        .await
        .unwrap();
}

/// Index of the first element answering `selector`.
pub fn element(page: &FakePage, selector: &str) -> Option<usize> {
    page.mutate(|d| d.find(selector))
}
