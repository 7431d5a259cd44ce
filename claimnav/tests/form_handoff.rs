mod common;

use std::sync::Arc;

use claimnav::{
    agent::TargetAgent,
    errors::ErrorKind,
    form::{build_form_url, FormConfig, MISSING_DRIVER_ALERT},
    handoff::HandoffStore,
    messages::FormParams,
    testing::{add_vehicle_incidents, script_claim_app, FakePage},
    HostSelectors, RunOutcome, Timings,
};
use common::{init_tracing, memory_store};

const ENTRY: &str = "https://cc.corp/ClaimCenter.do?tm_t=1-aaaaaa&process=true&claimNumber=A12345678901\
&TargetPage=loss_details&openCUW134=1&x=POL%2F77&t3=2024-03-01&t5=Main%20St";

fn agent(page: &FakePage, store: &Arc<dyn claimnav::store::KvStore>) -> TargetAgent {
    TargetAgent::new(
        Arc::new(page.clone()),
        store.clone(),
        Arc::new(HostSelectors::default()),
        Timings::default(),
        FormConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn loss_details_run_opens_the_prefilled_form() {
    init_tracing();
    let sel = HostSelectors::default();
    let page = FakePage::new(ENTRY);
    script_claim_app(&page, &sel, &["Summary", "Loss Details"]);
    add_vehicle_incidents(&page, &sel, "Jane Doe", "Insured");
    let store = memory_store();

    let outcome = agent(&page, &store).on_load().await.unwrap().unwrap();

    let expected = build_form_url(
        &FormConfig::default(),
        Some("Jane Doe"),
        &FormParams {
            x: Some("POL/77".into()),
            t3: Some("2024-03-01".into()),
            t5: Some("Main St".into()),
            open: true,
        },
    );
    assert!(expected.ends_with("&x=POL%2F77&t4=Jane%20Doe&t3=2024-03-01&t5=Main%20St"));
    let RunOutcome::Succeeded { form_url, .. } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(form_url.as_deref(), Some(expected.as_str()));
    assert_eq!(page.navigations(), vec![expected]);
    // Leaving for the form replaces the page, so the URL is not tidied first.
    assert!(page.replaced_urls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_driver_alerts_but_keeps_the_navigation() {
    init_tracing();
    let sel = HostSelectors::default();
    let page = FakePage::new(ENTRY);
    script_claim_app(&page, &sel, &["Summary", "Loss Details"]);
    let store = memory_store();

    let outcome = agent(&page, &store).on_load().await.unwrap().unwrap();
    let RunOutcome::Failed { kind, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(kind, ErrorKind::UnrecoverableInput);
    assert_eq!(page.alerts(), vec![MISSING_DRIVER_ALERT.to_string()]);
    assert!(page.navigations().is_empty());

    let last = HandoffStore::new(store).last_success().await.unwrap();
    assert_eq!(last.last_request_id.as_deref(), Some("1-aaaaaa"));
}
