use std::sync::Arc;
use std::time::Duration;

use keel_bsp::protocol::{
    RegisterAction, RegisterForChangesParams, SourceKitOptionsChangedParams,
    SourceKitOptionsParams, TextDocumentIdentifier,
};
use keel_bsp::{server_message_channel, BuildBackend, LegacyBuildServer, ServerMessage};
use keel_build_model::{Language, SourceItemKind};
use pretty_assertions::assert_eq;
use url::Url;

use super::external::start;

#[tokio::test]
async fn pushed_options_are_served_through_the_synthetic_target() {
    let (root, adapter, mut remote_messages, init) = start(&["--legacy"]).await;
    let data = init.source_kit_data();
    assert_eq!(
        data.as_ref().and_then(|data| data.source_kit_options_provider),
        None
    );

    let root_uri = Url::from_directory_path(root.path()).unwrap();
    let (tx, mut messages) = server_message_channel();
    let legacy = LegacyBuildServer::new(Arc::new(adapter), root_uri.clone(), data, tx)
        .with_shutdown_graces(Duration::from_secs(5), Duration::from_secs(5));

    let targets = legacy.build_targets().await.unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].id, LegacyBuildServer::target());
    let sources = legacy
        .build_target_sources(vec![LegacyBuildServer::target()])
        .await
        .unwrap();
    assert_eq!(sources[0].sources[0].uri, root_uri);
    assert_eq!(sources[0].sources[0].kind, SourceItemKind::Directory);
    assert_eq!(legacy.index_store_path().as_deref(), Some("index/store"));

    let file = Url::from_file_path(root.path().join("a.c")).unwrap();
    let params = SourceKitOptionsParams {
        text_document: TextDocumentIdentifier { uri: file.clone() },
        target: LegacyBuildServer::target(),
        language: Language::C,
    };
    assert_eq!(legacy.source_kit_options(params.clone()).await.unwrap(), None);

    legacy
        .register_for_changes(RegisterForChangesParams {
            uri: file.clone(),
            action: RegisterAction::Register,
        })
        .await;

    let pushed = tokio::time::timeout(Duration::from_secs(10), remote_messages.recv())
        .await
        .unwrap()
        .unwrap();
    let ServerMessage::Notification { method, params: pushed } = pushed else {
        panic!("expected a notification");
    };
    assert_eq!(method, "build/sourceKitOptionsChanged");
    let pushed: SourceKitOptionsChangedParams = serde_json::from_value(pushed).unwrap();
    legacy.did_change_options(pushed);

    let options = legacy.source_kit_options(params).await.unwrap().unwrap();
    assert_eq!(options.compiler_arguments[..2], ["clang", "-DLEGACY"]);

    match messages.recv().await.unwrap() {
        ServerMessage::Notification { method, .. } => {
            assert_eq!(method, "buildTarget/didChange")
        }
        other => panic!("unexpected message: {other:?}"),
    }

    legacy.shutdown().await.unwrap();
}
