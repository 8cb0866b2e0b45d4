use std::path::PathBuf;

use keel_build_model::{SourceItem, SourceKitSourceItemData};
use keel_build_settings::{BuildSettingsOptions, ManagerState};
use pretty_assertions::assert_eq;

use super::support::{
    eventually, id, in_process, next, options, start, url, ConnectionEvent, WorkspaceBackend,
};

#[tokio::test]
async fn index_paths_are_resolved_against_the_root() {
    let backend = WorkspaceBackend::new().into_arc();
    let harness = start(in_process(&backend), options(), None);

    assert_eq!(
        harness.manager.index_store_path().await,
        Some(PathBuf::from("/ws/index/store"))
    );
    assert_eq!(
        harness.manager.index_database_path().await,
        Some(PathBuf::from("/db/index"))
    );
}

#[tokio::test]
async fn backend_watchers_are_registered_with_the_editor() {
    let backend = WorkspaceBackend::new().with_watcher("**/BUILD").into_arc();
    let mut harness = start(in_process(&backend), options(), None);

    match next(&mut harness.connection).await {
        ConnectionEvent::WatchFiles(watchers) => {
            let globs: Vec<_> = watchers.iter().map(|w| w.glob_pattern.as_str()).collect();
            assert_eq!(globs, vec!["**/BUILD"]);
        }
        other => panic!("unexpected connection event: {other:?}"),
    }
}

#[tokio::test]
async fn background_indexing_also_watches_source_files() {
    let backend = WorkspaceBackend::new().with_watcher("**/BUILD").into_arc();
    let options = BuildSettingsOptions {
        background_indexing: true,
        ..options()
    };
    let mut harness = start(in_process(&backend), options, None);

    match next(&mut harness.connection).await {
        ConnectionEvent::WatchFiles(watchers) => {
            assert_eq!(watchers.len(), 2);
            assert!(watchers.iter().any(|w| w.glob_pattern == "**/BUILD"));
            assert!(watchers.iter().any(|w| w.glob_pattern.contains("swift")));
        }
        other => panic!("unexpected connection event: {other:?}"),
    }
}

#[tokio::test]
async fn copied_files_map_back_to_their_sources() {
    let original = url("/ws/Resources/data.json");
    let copy = url("/ws/build/Lib/data.json");
    let item = SourceItem::file(original.clone()).with_source_kit_data(SourceKitSourceItemData {
        copy_destinations: Some(vec![copy.clone()]),
        ..SourceKitSourceItemData::default()
    });
    let backend = WorkspaceBackend::new().with_source(id("Lib"), item).into_arc();
    let harness = start(in_process(&backend), options(), None);

    let manager = harness.manager.clone();
    eventually(|| {
        let manager = manager.clone();
        async move { !manager.copied_file_map().is_empty() }
    })
    .await;
    assert_eq!(
        harness.manager.location_adjusted_for_copied_files(&copy),
        original
    );
    assert_eq!(
        harness.manager.location_adjusted_for_copied_files(&original),
        original
    );
}

#[tokio::test]
async fn shutdown_reaches_the_backend() {
    let backend = WorkspaceBackend::new().into_arc();
    let harness = start(in_process(&backend), options(), None);
    assert!(harness.manager.wait_until_initialized().await);

    harness.manager.shutdown().await;
    assert_eq!(harness.manager.state(), ManagerState::ShutDown);
    assert_eq!(backend.shutdown_calls(), 1);
}
