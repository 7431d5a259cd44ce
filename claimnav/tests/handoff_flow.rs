mod common;

use std::{sync::Arc, time::Duration};

use claimnav::{
    handoff::{HandoffCoordinator, HandoffStore},
    messages::{Message, MessageHandler, RunReply, Router},
    portal::TriggerOutcome,
    settings::SettingsResolver,
    store::KvStore,
    testing::{script_claim_app, FakeElement, FakePage, FakeTabHost, StubClipboard},
    HostConfig, HostSelectors, Mediator, Portal, TargetAgent, Timings,
};
use common::{agent_for, element, init_tracing, memory_store, APP_URL, CLAIM};

struct World {
    store: Arc<dyn KvStore>,
    tabs: FakeTabHost,
    router: Arc<Router>,
    app: FakePage,
    agent: Arc<TargetAgent>,
    portal: Portal,
}

async fn world(menu: &[&str]) -> World {
    init_tracing();
    let sel = HostSelectors::default();
    let store = memory_store();
    let tabs = FakeTabHost::new();
    let router = Arc::new(Router::new(Duration::from_secs(5)));
    let mediator = Arc::new(Mediator::new(
        Arc::new(tabs.clone()),
        router.clone(),
        store.clone(),
        HostConfig {
            target_origin: "https://cc.corp".into(),
            ..HostConfig::default()
        },
        Timings::default(),
    ));
    let coordinator = Arc::new(HandoffCoordinator::new(store.clone(), mediator));

    let portal_page = FakePage::new("https://portal.corp/tasks/42");
    portal_page.add(
        FakeElement::new(&sel.task_description)
            .with_text(&format!("Review claim {CLAIM} on policy Q1234567")),
    );
    let portal = Portal::new(
        Arc::new(portal_page),
        Arc::new(sel.clone()),
        coordinator,
        SettingsResolver::new(store.clone()),
        Arc::new(StubClipboard::default()),
        Duration::from_millis(300),
    );

    let app = FakePage::new(APP_URL);
    script_claim_app(&app, &sel, menu);
    let agent = agent_for(&app, &store);
    // The fake tab host numbers tabs from 1; the first tab opened is the app.
    router.register(1, agent.clone()).await;

    World {
        store,
        tabs,
        router,
        app,
        agent,
        portal,
    }
}

#[tokio::test(start_paused = true)]
async fn portal_press_runs_the_claim_in_a_new_tab() {
    let w = world(&["Summary", "Loss Details"]).await;

    let TriggerOutcome::HandedOff { ticket, .. } = w.portal.trigger(false).await.unwrap() else {
        panic!("expected a handoff");
    };
    let reply = ticket.delivery.await.unwrap().unwrap();
    assert!(reply.ok && reply.completed && reply.delivered, "{reply:?}");
    assert_eq!(reply.tab_id, Some(1));

    let tab = &w.tabs.tabs()[0];
    assert!(tab.url.contains(&format!("tm_t={}", ticket.record.request_id)));
    assert!(tab.url.contains(&format!("claimNumber={CLAIM}")));

    let run = reply.run.expect("run reply");
    assert!(run.ok, "{run:?}");
    let result = run.result.unwrap();
    assert_eq!(result["outcome"], "succeeded");
    assert_eq!(result["reached"], "sub_page_confirmed");
    // "claim_overview_summary" only matches the "Summary" link by its last word.
    assert_eq!(result["menuStrategy"], "significant_word");

    let last = HandoffStore::new(w.store.clone()).last_success().await.unwrap();
    assert_eq!(last.last_request_id.as_deref(), Some(ticket.record.request_id.as_str()));
    assert_eq!(last.last_claim.as_deref(), Some(CLAIM));
    assert_eq!(last.last_kick, Some(ticket.kick));
}

#[tokio::test(start_paused = true)]
async fn repeating_a_completed_request_does_nothing() {
    let w = world(&["Summary"]).await;
    let TriggerOutcome::HandedOff { ticket, .. } = w.portal.trigger(false).await.unwrap() else {
        panic!("expected a handoff");
    };
    assert!(ticket.delivery.await.unwrap().unwrap().delivered);

    let sel = HostSelectors::default();
    let search_tab = element(&w.app, &sel.search_tab).unwrap();
    let clicks_before = w.app.activations(search_tab);

    let again = w
        .router
        .send(
            1,
            Message::RunNow {
                request_id: ticket.record.request_id.clone(),
                claim: Some(CLAIM.into()),
                target_page: Some("summary".into()),
                form_params: None,
            },
        )
        .await
        .unwrap();
    let again: RunReply = serde_json::from_value(again).unwrap();
    assert!(again.ok);
    assert_eq!(again.result.unwrap()["outcome"], "duplicate");
    assert_eq!(w.app.activations(search_tab), clicks_before);
}

#[tokio::test(start_paused = true)]
async fn ping_reaches_the_registered_agent() {
    let w = world(&["Summary"]).await;
    let reply = w.agent.handle(Message::Ping).await.unwrap();
    assert_eq!(reply["alive"], true);
    assert_eq!(reply["currentUrl"], APP_URL);
    assert!(w.router.has_receiver(1).await);
    assert!(!w.router.has_receiver(2).await);
}
