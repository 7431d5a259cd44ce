mod common;

use claimnav::{
    agent::RunInput,
    navigate::NavState,
    settings::{RunMode, SettingsResolver},
    testing::{script_claim_app, FakePage},
    HostSelectors, RunOutcome,
};
use common::{agent_for, element, init_tracing, memory_store, set_run_mode, APP_URL, CLAIM};
use serde_json::json;

fn input() -> RunInput {
    RunInput {
        request_id: Some("1-aaaaaa".into()),
        claim: Some(CLAIM.into()),
        target_page: Some("summary".into()),
        form_params: None,
    }
}

#[tokio::test(start_paused = true)]
async fn claim_only_stops_after_the_search() {
    init_tracing();
    let sel = HostSelectors::default();
    let store = memory_store();
    set_run_mode(&store, "claim_only").await;
    let page = FakePage::new(APP_URL);
    script_claim_app(&page, &sel, &["Summary"]);

    let outcome = agent_for(&page, &store).request_run(input()).await;
    assert!(
        matches!(
            outcome,
            RunOutcome::Succeeded {
                reached: NavState::SearchSubmitted,
                menu_strategy: None,
                ..
            }
        ),
        "{outcome:?}"
    );
    let row = element(&page, &sel.result_row).unwrap();
    assert_eq!(page.activations(row), 0);
    assert!(element(&page, &sel.menu_container).is_none());
}

#[tokio::test(start_paused = true)]
async fn copy_only_never_touches_the_app() {
    init_tracing();
    let sel = HostSelectors::default();
    let store = memory_store();
    set_run_mode(&store, "copy_only").await;
    let page = FakePage::new(APP_URL);
    script_claim_app(&page, &sel, &["Summary"]);

    let outcome = agent_for(&page, &store).request_run(input()).await;
    assert!(
        matches!(
            outcome,
            RunOutcome::Succeeded {
                reached: NavState::AtLanding,
                ..
            }
        ),
        "{outcome:?}"
    );
    let search_tab = element(&page, &sel.search_tab).unwrap();
    assert_eq!(page.activations(search_tab), 0);
}

#[tokio::test(start_paused = true)]
async fn legacy_settings_are_migrated_once() {
    let store = memory_store();
    store
        .set_many(vec![(
            "settings_v2".into(),
            json!({ "runMode": "claim_only", "targetPage": "loss_details" }),
        )])
        .await
        .unwrap();
    let resolver = SettingsResolver::new(store.clone());
    assert_eq!(resolver.run_mode().await, RunMode::ClaimOnly);

    let migrated = store.get(&["settings_v1"]).await.unwrap();
    assert_eq!(migrated["settings_v1"]["runMode"], "claim_only");
    assert_eq!(migrated["settings_v1"]["targetPage"], "loss_details");
}
