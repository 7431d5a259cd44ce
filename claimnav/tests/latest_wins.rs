mod common;

use std::time::Duration;

use claimnav::{
    agent::RunInput,
    handoff::{HandoffRecord, HandoffStore},
    navigate::NavState,
    testing::{script_claim_app, FakePage},
    HostSelectors, RunOutcome,
};
use common::{agent_for, element, init_tracing, memory_store, APP_URL};

fn record(request_id: &str, claim: &str) -> HandoffRecord {
    HandoffRecord {
        claim: claim.into(),
        policy: None,
        request_id: request_id.into(),
        timestamp: 0,
        force: false,
    }
}

fn input(request_id: &str, claim: &str) -> RunInput {
    RunInput {
        request_id: Some(request_id.into()),
        claim: Some(claim.into()),
        target_page: Some("summary".into()),
        form_params: None,
    }
}

#[tokio::test(start_paused = true)]
async fn newer_handoff_stops_the_older_run_and_wins() {
    init_tracing();
    let store = memory_store();
    let handoff = HandoffStore::new(store.clone());
    handoff.write_handoff(&record("1-aaaaaa", "A11111111111")).await.unwrap();

    // The app has not rendered yet, so A spends its first attempt waiting.
    let page = FakePage::new(APP_URL);
    let agent = agent_for(&page, &store);

    let racer = handoff.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        racer.write_handoff(&record("2-bbbbbb", "B22222222222")).await.unwrap();
    });

    let a = agent.request_run(input("1-aaaaaa", "A11111111111")).await;
    assert_eq!(a, RunOutcome::Superseded);
    let last = handoff.last_success().await.unwrap();
    assert_eq!(last.last_request_id, None);

    script_claim_app(&page, &HostSelectors::default(), &["Summary"]);
    let b = agent.request_run(input("2-bbbbbb", "B22222222222")).await;
    assert!(
        matches!(
            b,
            RunOutcome::Succeeded {
                reached: NavState::SubPageConfirmed,
                ..
            }
        ),
        "{b:?}"
    );
    let last = handoff.last_success().await.unwrap();
    assert_eq!(last.last_request_id.as_deref(), Some("2-bbbbbb"));
    assert_eq!(last.last_claim.as_deref(), Some("B22222222222"));
}

#[tokio::test(start_paused = true)]
async fn stale_request_does_not_start() {
    init_tracing();
    let store = memory_store();
    let handoff = HandoffStore::new(store.clone());
    handoff.write_handoff(&record("1-aaaaaa", "A11111111111")).await.unwrap();
    handoff.write_handoff(&record("2-bbbbbb", "B22222222222")).await.unwrap();

    let page = FakePage::new(APP_URL);
    let sel = HostSelectors::default();
    script_claim_app(&page, &sel, &["Summary"]);
    let agent = agent_for(&page, &store);

    let a = agent.request_run(input("1-aaaaaa", "A11111111111")).await;
    assert_eq!(a, RunOutcome::Superseded);
    let search_tab = common::element(&page, &sel.search_tab).unwrap();
    assert_eq!(page.activations(search_tab), 0);
}

#[tokio::test(start_paused = true)]
async fn requests_during_a_run_collapse_into_one_rerun() {
    init_tracing();
    let store = memory_store();
    let sel = HostSelectors::default();
    let page = FakePage::new(APP_URL);
    script_claim_app(&page, &sel, &["Summary"]);
    let agent = agent_for(&page, &store);

    let first = agent.clone();
    let running = tokio::spawn(async move {
        first.request_run(input("1-aaaaaa", "A11111111111")).await
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    for (id, claim) in [
        ("2-bbbbbb", "B22222222222"),
        ("3-cccccc", "C33333333333"),
        ("4-dddddd", "D44444444444"),
    ] {
        assert_eq!(agent.request_run(input(id, claim)).await, RunOutcome::Queued);
    }

    // The caller that owns the loop reports the rerun it executed last.
    let outcome = running.await.unwrap();
    assert!(matches!(outcome, RunOutcome::Succeeded { .. }), "{outcome:?}");
    let last = HandoffStore::new(store.clone()).last_success().await.unwrap();
    assert_eq!(last.last_request_id.as_deref(), Some("4-dddddd"));
    assert_eq!(last.last_claim.as_deref(), Some("D44444444444"));

    // Exactly two runs typed a claim: the first and the newest parked one.
    let claim_input = element(&page, &sel.claim_input).unwrap();
    let mut typed = page.value_writes(claim_input);
    typed.dedup();
    assert_eq!(typed, vec!["A11111111111", "D44444444444"]);
}
