use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_build_model::protocol::{
    BuildNotification, DidChangeWatchedFiles, DidChangeWatchedFilesParams, FileEvent,
    FileSystemWatcher, OnBuildTargetDidChange, OnBuildTargetDidChangeParams, RegisterAction,
    RegisterForChanges, RegisterForChangesParams, SourceKitInitializeBuildResponseData,
    SourceKitOptionsChangedParams, SourceKitOptionsParams, SourceKitOptionsResult,
};
use keel_build_model::{
    BuildTarget, BuildTargetIdentifier, ResponseError, SourceItem, SourcesItem,
};
use parking_lot::Mutex;
use url::Url;

use crate::{BuildBackend, BuildServerAdapter, ServerMessage, ServerMessageSender};

/// Presents a server that pushes settings (`build/sourceKitOptionsChanged`) through the
/// pull-based [`BuildBackend`] interface.
///
/// The server gets one synthetic target that owns the whole project root. Settings are
/// answered from the most recent push for a document; until one arrives the document has
/// no settings.
pub struct LegacyBuildServer {
    remote: Arc<BuildServerAdapter>,
    root: Url,
    data: Option<SourceKitInitializeBuildResponseData>,
    messages: ServerMessageSender,
    options: Mutex<HashMap<Url, SourceKitOptionsResult>>,
    shutdown_grace: Duration,
    exit_grace: Duration,
}

impl LegacyBuildServer {
    pub const TARGET_URI: &'static str = "dummy://legacy-build-server";

    /// `messages` receives the synthetic target change emitted after each settings push.
    pub fn new(
        remote: Arc<BuildServerAdapter>,
        root: Url,
        data: Option<SourceKitInitializeBuildResponseData>,
        messages: ServerMessageSender,
    ) -> Self {
        Self {
            remote,
            root,
            data,
            messages,
            options: Mutex::new(HashMap::new()),
            shutdown_grace: Duration::from_secs(2),
            exit_grace: Duration::from_secs(2),
        }
    }

    /// Grace periods used when shutting down the wrapped server.
    pub fn with_shutdown_graces(mut self, shutdown_grace: Duration, exit_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self.exit_grace = exit_grace;
        self
    }

    pub fn target() -> BuildTargetIdentifier {
        BuildTargetIdentifier::new(Self::TARGET_URI)
    }

    pub fn remote(&self) -> &Arc<BuildServerAdapter> {
        &self.remote
    }

    /// Records settings pushed by the server and announces a change of the synthetic target.
    pub fn did_change_options(&self, params: SourceKitOptionsChangedParams) {
        let SourceKitOptionsChangedParams {
            uri,
            updated_options,
        } = params;
        tracing::debug!(target = "keel.bsp", uri = %uri, "build server pushed new settings");
        self.options.lock().insert(
            uri,
            SourceKitOptionsResult {
                compiler_arguments: updated_options.options,
                working_directory: updated_options.working_directory,
                data: None,
            },
        );

        let params = OnBuildTargetDidChangeParams { changes: None };
        match serde_json::to_value(params) {
            Ok(params) => {
                let _ = self.messages.send(ServerMessage::Notification {
                    method: OnBuildTargetDidChange::METHOD.to_owned(),
                    params,
                });
            }
            Err(err) => {
                tracing::error!(target = "keel.bsp", error = %err, "failed to encode target change");
            }
        }
    }
}

#[async_trait]
impl BuildBackend for LegacyBuildServer {
    async fn build_targets(&self) -> Result<Vec<BuildTarget>, ResponseError> {
        Ok(vec![BuildTarget::new(Self::target(), Vec::new())])
    }

    async fn build_target_sources(
        &self,
        targets: Vec<BuildTargetIdentifier>,
    ) -> Result<Vec<SourcesItem>, ResponseError> {
        let target = Self::target();
        if !targets.contains(&target) {
            return Ok(Vec::new());
        }
        Ok(vec![SourcesItem {
            target,
            sources: vec![SourceItem::directory(self.root.clone())],
            roots: None,
        }])
    }

    async fn source_kit_options(
        &self,
        params: SourceKitOptionsParams,
    ) -> Result<Option<SourceKitOptionsResult>, ResponseError> {
        Ok(self.options.lock().get(&params.text_document.uri).cloned())
    }

    async fn did_change_watched_files(&self, changes: Vec<FileEvent>) {
        self.remote
            .send_notification::<DidChangeWatchedFiles>(DidChangeWatchedFilesParams { changes });
    }

    async fn register_for_changes(&self, params: RegisterForChangesParams) {
        if params.action == RegisterAction::Unregister {
            self.options.lock().remove(&params.uri);
        }
        self.remote.send_notification::<RegisterForChanges>(params);
    }

    async fn shutdown(&self) -> Result<(), ResponseError> {
        self.remote
            .shutdown(self.shutdown_grace, self.exit_grace)
            .await;
        Ok(())
    }

    fn file_watchers(&self) -> Vec<FileSystemWatcher> {
        self.data
            .as_ref()
            .and_then(|data| data.watchers.clone())
            .unwrap_or_default()
    }

    fn index_store_path(&self) -> Option<String> {
        self.data.as_ref()?.index_store_path.clone()
    }

    fn index_database_path(&self) -> Option<String> {
        self.data.as_ref()?.index_database_path.clone()
    }
}
