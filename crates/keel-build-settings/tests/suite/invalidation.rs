use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use keel_bsp::protocol::{BuildTargetEvent, BuildTargetEventKind};
use keel_bsp::{BuildBackend, ServerMessage, ServerMessageSender};
use keel_build_model::{BuildTarget, Language};
use keel_build_settings::{BuildServerSpec, BuildTargetGraph, TargetsChangedCause};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;

use super::support::{
    assert_quiet, id, in_process, next, options, start, url, DelegateEvent, RecordingListener,
    WorkspaceBackend, LIB_C, MAIN_C,
};

fn changed(name: &str) -> TargetsChangedCause {
    TargetsChangedCause::Notification(Some(vec![BuildTargetEvent {
        target: id(name),
        kind: Some(BuildTargetEventKind::Changed),
    }]))
}

#[tokio::test]
async fn concurrent_queries_share_one_backend_request() {
    let backend = WorkspaceBackend::new()
        .with_options_delay(Duration::from_millis(50))
        .into_arc();
    let harness = start(in_process(&backend), options(), None);
    let lib = url(LIB_C);
    let target = id("Lib");

    let results = futures::future::join_all(
        (0..8).map(|_| harness.manager.build_settings(&lib, &target, Language::C, false)),
    )
    .await;
    assert!(results.iter().all(|settings| *settings == results[0]));
    assert!(!results[0].is_fallback);
    assert_eq!(backend.options_calls(), 1);
}

#[tokio::test]
async fn target_change_only_recomputes_affected_settings() {
    let backend = WorkspaceBackend::new().into_arc();
    let mut harness = start(in_process(&backend), options(), None);
    let manager = &harness.manager;
    let (lib, main) = (url(LIB_C), url(MAIN_C));

    manager.build_settings(&lib, &id("Lib"), Language::C, false).await;
    manager.build_settings(&main, &id("App"), Language::C, false).await;
    manager.build_settings(&lib, &id("Lib"), Language::C, false).await;
    assert_eq!(backend.options_calls(), 2);

    manager.build_targets_did_change(changed("Lib")).await;
    manager.build_settings(&lib, &id("Lib"), Language::C, false).await;
    manager.build_settings(&main, &id("App"), Language::C, false).await;
    assert_eq!(backend.options_calls(), 3);

    manager
        .build_targets_did_change(TargetsChangedCause::Notification(None))
        .await;
    manager.build_settings(&lib, &id("Lib"), Language::C, false).await;
    manager.build_settings(&main, &id("App"), Language::C, false).await;
    assert_eq!(backend.options_calls(), 5);

    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(Some(BTreeSet::from([id("Lib")])))
    );
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(None)
    );
}

#[tokio::test]
async fn delayed_target_list_replaces_the_cached_graph() {
    let backend = WorkspaceBackend::new().into_arc();
    let harness = start(in_process(&backend), options(), None);
    let manager = &harness.manager;
    let lib = url(LIB_C);

    manager.build_settings(&lib, &id("Lib"), Language::C, false).await;
    assert_eq!(manager.build_targets().await.len(), 2);
    let targets_calls = backend.targets_calls();

    let graph = BuildTargetGraph::new(vec![BuildTarget::new(id("Lib"), Vec::new())]);
    manager
        .build_targets_did_change(TargetsChangedCause::DelayedTargets(Arc::new(graph)))
        .await;
    assert_eq!(manager.build_targets().await.len(), 1);
    manager.build_settings(&lib, &id("Lib"), Language::C, false).await;
    assert_eq!(backend.targets_calls(), targets_calls);
    assert_eq!(backend.options_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_target_list_is_kept_once_it_arrives() {
    let backend = WorkspaceBackend::new()
        .with_targets_delay(Duration::from_secs(3))
        .into_arc();
    let mut harness = start(in_process(&backend), options(), None);

    assert!(harness.manager.build_targets().await.is_empty());
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(None)
    );
    assert_eq!(harness.manager.build_targets().await.len(), 2);

    let targets_calls = backend.targets_calls();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.manager.build_targets().await.len(), 2);
    assert_eq!(
        harness.manager.canonical_target(&url(MAIN_C)).await,
        Some(id("App"))
    );
    assert_eq!(backend.targets_calls(), targets_calls);
}

#[tokio::test(start_paused = true)]
async fn slow_sources_are_kept_once_they_arrive() {
    let backend = WorkspaceBackend::new()
        .with_sources_delay(Duration::from_secs(3))
        .into_arc();
    let mut harness = start(in_process(&backend), options(), None);
    let main = url(MAIN_C);

    assert_eq!(harness.manager.canonical_target(&main).await, None);
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(None)
    );
    assert_eq!(
        harness.manager.canonical_target(&main).await,
        Some(id("App"))
    );

    let sources_requests = backend.sources_requests().len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        harness.manager.canonical_target(&main).await,
        Some(id("App"))
    );
    assert_eq!(backend.sources_requests().len(), sources_requests);
}

#[tokio::test]
async fn backend_target_change_notification_invalidates_settings() {
    let backend = WorkspaceBackend::new().into_arc();
    let messages: Arc<Mutex<Option<ServerMessageSender>>> = Arc::default();
    let spec = {
        let backend = Arc::clone(&backend);
        let messages = Arc::clone(&messages);
        BuildServerSpec::in_process(move |sender| {
            *messages.lock() = Some(sender);
            backend as Arc<dyn BuildBackend>
        })
    };
    let mut harness = start(spec, options(), None);
    assert!(harness.manager.wait_until_initialized().await);
    let lib = url(LIB_C);
    harness
        .manager
        .build_settings(&lib, &id("Lib"), Language::C, false)
        .await;

    let sender = messages.lock().clone().unwrap();
    sender
        .send(ServerMessage::Notification {
            method: "buildTarget/didChange".to_string(),
            params: json!({ "changes": [{ "target": { "uri": "target://Lib" } }] }),
        })
        .unwrap();
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(Some(BTreeSet::from([id("Lib")])))
    );
    harness
        .manager
        .build_settings(&lib, &id("Lib"), Language::C, false)
        .await;
    assert_eq!(backend.options_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn late_target_list_triggers_a_refresh() {
    let backend = WorkspaceBackend::new()
        .with_first_targets_delay(Duration::from_secs(5))
        .into_arc();
    let mut harness = start(in_process(&backend), options(), None);

    assert!(harness.manager.build_targets().await.is_empty());
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(None)
    );
    assert_eq!(harness.manager.build_targets().await.len(), 2);
    assert_eq!(
        harness.manager.canonical_target(&url(MAIN_C)).await,
        Some(id("App"))
    );
}

#[tokio::test]
async fn sources_are_derived_from_a_cached_superset() {
    let backend = WorkspaceBackend::new().into_arc();
    let harness = start(in_process(&backend), options(), None);
    let manager = &harness.manager;

    let all = manager
        .sources_of_targets(BTreeSet::from([id("Lib"), id("App")]))
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    let lib_only = manager
        .sources_of_targets(BTreeSet::from([id("Lib")]))
        .await
        .unwrap();
    assert_eq!(lib_only.len(), 1);
    assert_eq!(lib_only[0].target, id("Lib"));
    assert!(!backend.sources_requests().contains(&vec![id("Lib")]));
}

#[tokio::test]
async fn listeners_follow_target_changes_until_removed() {
    let backend = WorkspaceBackend::new().into_arc();
    let mut harness = start(in_process(&backend), options(), None);
    let (events, mut listener_events) = mpsc::unbounded_channel();
    let listener = harness
        .manager
        .add_build_targets_changed_listener(Arc::new(RecordingListener { events }));

    harness.manager.build_targets_did_change(changed("App")).await;
    assert_eq!(
        next(&mut listener_events).await,
        Some(BTreeSet::from([id("App")]))
    );

    harness.manager.remove_build_targets_changed_listener(listener);
    harness
        .manager
        .build_targets_did_change(TargetsChangedCause::Notification(None))
        .await;
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(Some(BTreeSet::from([id("App")])))
    );
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(None)
    );
    assert_quiet(&mut listener_events).await;
}
