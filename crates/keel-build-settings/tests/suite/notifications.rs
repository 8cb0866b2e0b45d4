use std::collections::BTreeSet;
use std::sync::Arc;

use keel_bsp::protocol::{FileChangeType, FileEvent};
use keel_build_model::Language;
use keel_build_settings::TargetsChangedCause;
use pretty_assertions::assert_eq;

use super::support::{
    assert_quiet, id, in_process, next, options, start, url, DelegateEvent, TableMainFiles,
    WorkspaceBackend, LIB_C, MAIN_C,
};

fn changed_file(path: &str) -> FileEvent {
    FileEvent {
        uri: url(path),
        kind: FileChangeType::Changed,
    }
}

#[tokio::test(start_paused = true)]
async fn target_changes_announce_watched_files_in_one_batch() {
    let backend = WorkspaceBackend::new().into_arc();
    let mut harness = start(in_process(&backend), options(), None);
    let manager = &harness.manager;
    let (lib, main) = (url(LIB_C), url(MAIN_C));

    manager
        .register_for_change_notifications(lib.clone(), Language::C)
        .await;
    manager
        .register_for_change_notifications(main.clone(), Language::C)
        .await;
    manager
        .build_targets_did_change(TargetsChangedCause::Notification(None))
        .await;
    manager
        .build_targets_did_change(TargetsChangedCause::Notification(None))
        .await;

    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(None)
    );
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(None)
    );
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::SettingsChanged(BTreeSet::from([lib.clone(), main.clone()]))
    );
    assert_quiet(&mut harness.delegate).await;

    harness.manager.unregister_for_change_notifications(lib).await;
    let targets = BTreeSet::from([id("Lib"), id("App")]);
    let items = harness
        .manager
        .sources_of_targets(targets.clone())
        .await
        .unwrap();
    harness
        .manager
        .build_targets_did_change(TargetsChangedCause::DelayedSources { targets, items })
        .await;
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(None)
    );
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::SettingsChanged(BTreeSet::from([main]))
    );
}

#[tokio::test]
async fn flushing_delivers_pending_notifications_immediately() {
    let backend = WorkspaceBackend::new().into_arc();
    let mut harness = start(in_process(&backend), options(), None);
    let lib = url(LIB_C);

    harness
        .manager
        .register_for_change_notifications(lib.clone(), Language::C)
        .await;
    harness
        .manager
        .build_targets_did_change(TargetsChangedCause::Notification(None))
        .await;
    harness.manager.flush_notifications().await;

    let mut events = Vec::new();
    while let Ok(event) = harness.delegate.try_recv() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            DelegateEvent::TargetsChanged(None),
            DelegateEvent::SettingsChanged(BTreeSet::from([lib])),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn changed_files_update_dependents() {
    let backend = WorkspaceBackend::new().into_arc();
    let mut harness = start(in_process(&backend), options(), None);
    let (lib, main) = (url(LIB_C), url(MAIN_C));

    harness
        .manager
        .register_for_change_notifications(main.clone(), Language::C)
        .await;
    harness.manager.files_did_change(vec![changed_file(LIB_C)]).await;
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::DependenciesUpdated(BTreeSet::from([main]))
    );
    assert_eq!(backend.watched_changes(), vec![lib]);

    // A file outside every target may be a build file: everything is affected.
    harness
        .manager
        .files_did_change(vec![changed_file("/ws/BUILD")])
        .await;
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::DependenciesUpdated(BTreeSet::new())
    );
}

#[tokio::test(start_paused = true)]
async fn unrelated_changes_do_not_notify() {
    let backend = WorkspaceBackend::new().into_arc();
    let mut harness = start(in_process(&backend), options(), None);

    harness
        .manager
        .register_for_change_notifications(url(LIB_C), Language::C)
        .await;
    harness.manager.files_did_change(vec![changed_file(MAIN_C)]).await;
    assert_quiet(&mut harness.delegate).await;
}

#[tokio::test(start_paused = true)]
async fn main_file_changes_are_announced() {
    let backend = WorkspaceBackend::new().into_arc();
    let main_files = Arc::new(TableMainFiles::default());
    let header = url("/ws/Sources/shared.h");
    main_files.set(header.clone(), [url(LIB_C)]);
    let mut harness = start(in_process(&backend), options(), Some(main_files.clone()));

    harness
        .manager
        .register_for_change_notifications(header.clone(), Language::C)
        .await;
    harness.manager.main_files_changed().await;
    assert_quiet(&mut harness.delegate).await;

    main_files.set(header.clone(), [url(MAIN_C)]);
    harness.manager.main_files_changed().await;
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::SettingsChanged(BTreeSet::from([header.clone()]))
    );

    let settings = harness
        .manager
        .build_settings_inferred_from_main_file(&header, None, Some(Language::C), false)
        .await
        .unwrap();
    assert!(settings
        .compiler_arguments
        .contains(&"/ws/build/main.o".to_string()));
}
