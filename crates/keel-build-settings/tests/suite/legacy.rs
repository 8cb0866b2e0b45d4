use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_bsp::protocol::RequestId;
use keel_bsp::{
    LegacyBuildServer, MessageHandler, ResponseError, ServerMessage, ServerMessageSender,
};
use keel_build_model::Language;
use keel_build_settings::{BuildServerSpec, BuildSystemManager, ManagerState};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use url::Url;

use super::support::{
    eventually, next, options, start, url, ConnectionEvent, DelegateEvent, TableMainFiles,
};

type Log = Arc<Mutex<Vec<(String, Value)>>>;

/// Pushes settings after `textDocument/registerForChanges` instead of answering
/// `textDocument/sourceKitOptions`.
struct PushingServer {
    messages: ServerMessageSender,
    notifications: Log,
    pushes: AtomicUsize,
}

#[async_trait]
impl MessageHandler for PushingServer {
    async fn handle_request(
        &self,
        _id: RequestId,
        method: &str,
        _params: Value,
    ) -> Result<Value, ResponseError> {
        match method {
            "build/initialize" => Ok(json!({
                "displayName": "pushing",
                "version": "1.0",
                "bspVersion": "2.2.0",
                "capabilities": {},
                "dataKind": "sourceKit",
                "data": {
                    "indexStorePath": "/idx/store",
                    "watchers": [{ "globPattern": "**/BUILD" }],
                },
            })),
            "build/shutdown" => Ok(Value::Null),
            other => Err(ResponseError::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        self.notifications
            .lock()
            .push((method.to_string(), params.clone()));
        if method != "textDocument/registerForChanges" || params["action"] != "register" {
            return;
        }
        let uri = params["uri"].as_str().unwrap().to_string();
        let path = Url::parse(&uri).unwrap().to_file_path().unwrap();
        let define = format!("-DPUSH={}", self.pushes.fetch_add(1, Ordering::SeqCst) + 1);
        let _ = self.messages.send(ServerMessage::Notification {
            method: "build/sourceKitOptionsChanged".to_string(),
            params: json!({
                "uri": uri,
                "updatedOptions": {
                    "options": ["clang", define, "-c", path.display().to_string()],
                    "workingDirectory": "/ws",
                },
            }),
        });
    }
}

fn pushing_server(notifications: &Log) -> BuildServerSpec {
    let notifications = Arc::clone(notifications);
    BuildServerSpec::injected(move |messages| {
        Arc::new(PushingServer {
            messages,
            notifications,
            pushes: AtomicUsize::new(0),
        })
    })
}

fn received(notifications: &Log, method: &str, action: &str) -> bool {
    notifications
        .lock()
        .iter()
        .any(|(name, params)| name == method && params["action"] == action)
}

#[tokio::test]
async fn pushed_settings_answer_queries() {
    let notifications = Log::default();
    let mut harness = start(pushing_server(&notifications), options(), None);
    let manager = harness.manager.clone();
    assert!(manager.wait_until_initialized().await);

    match next(&mut harness.connection).await {
        ConnectionEvent::WatchFiles(watchers) => {
            assert_eq!(watchers.len(), 1);
            assert_eq!(watchers[0].glob_pattern, "**/BUILD");
        }
        other => panic!("unexpected connection event: {other:?}"),
    }
    assert_eq!(
        manager.index_store_path().await,
        Some(PathBuf::from("/idx/store"))
    );

    let document = url("/ws/Sources/a.c");
    manager
        .register_for_change_notifications(document.clone(), Language::C)
        .await;
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::TargetsChanged(None)
    );
    assert_eq!(
        next(&mut harness.delegate).await,
        DelegateEvent::SettingsChanged(BTreeSet::from([document.clone()]))
    );

    assert_eq!(
        manager.canonical_target(&document).await,
        Some(LegacyBuildServer::target())
    );
    let settings = manager
        .build_settings_inferred_from_main_file(&document, None, Some(Language::C), false)
        .await
        .unwrap();
    assert!(!settings.is_fallback);
    assert_eq!(settings.working_directory.as_deref(), Some("/ws"));
    assert_eq!(
        &settings.compiler_arguments[..3],
        ["clang", "-DPUSH=1", "/ws/Sources/a.c"]
    );

    manager.unregister_for_change_notifications(document).await;
    eventually(|| {
        let found = received(&notifications, "textDocument/registerForChanges", "unregister");
        async move { found }
    })
    .await;

    manager.shutdown().await;
    assert_eq!(manager.state(), ManagerState::ShutDown);
    eventually(|| {
        let exited = notifications
            .lock()
            .iter()
            .any(|(name, _)| name == "build/exit");
        async move { exited }
    })
    .await;
}

#[tokio::test]
async fn main_file_stays_registered_while_a_document_uses_it() {
    let notifications = Log::default();
    let main_files = Arc::new(TableMainFiles::default());
    let source = url("/ws/Sources/b.c");
    let header = url("/ws/Sources/b.h");
    main_files.set(header.clone(), [source.clone()]);
    let harness = start(pushing_server(&notifications), options(), Some(main_files));
    let manager = &harness.manager;

    manager
        .register_for_change_notifications(source.clone(), Language::C)
        .await;
    manager
        .register_for_change_notifications(header.clone(), Language::C)
        .await;
    eventually(|| {
        let found = received(&notifications, "textDocument/registerForChanges", "register");
        async move { found }
    })
    .await;

    manager.unregister_for_change_notifications(header).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!received(
        &notifications,
        "textDocument/registerForChanges",
        "unregister"
    ));

    manager.unregister_for_change_notifications(source).await;
    eventually(|| {
        let found = received(&notifications, "textDocument/registerForChanges", "unregister");
        async move { found }
    })
    .await;
}

#[tokio::test]
async fn repushed_settings_replace_earlier_answers() {
    let notifications = Log::default();
    let harness = start(pushing_server(&notifications), options(), None);
    let manager = harness.manager.clone();
    let document = url("/ws/Sources/c.c");

    let define = |manager: BuildSystemManager, document: Url| async move {
        manager
            .build_settings_inferred_from_main_file(&document, None, Some(Language::C), false)
            .await
            .and_then(|settings| settings.compiler_arguments.get(1).cloned())
    };

    manager
        .register_for_change_notifications(document.clone(), Language::C)
        .await;
    eventually(|| {
        let define = define(manager.clone(), document.clone());
        async move { define.await.as_deref() == Some("-DPUSH=1") }
    })
    .await;

    manager
        .unregister_for_change_notifications(document.clone())
        .await;
    manager
        .register_for_change_notifications(document.clone(), Language::C)
        .await;
    eventually(|| {
        let define = define(manager.clone(), document.clone());
        async move { define.await.as_deref() == Some("-DPUSH=2") }
    })
    .await;
}
