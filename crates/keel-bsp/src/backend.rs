use async_trait::async_trait;
use keel_build_model::protocol::{
    BuildTargetPrepare, BuildRequest, FileEvent, FileSystemWatcher, InitializeBuildResult,
    MultiTargetPreparationSupport, RegisterForChangesParams, RequestId,
    SourceKitInitializeBuildResponseData, SourceKitOptionsParams, SourceKitOptionsResult,
};
use keel_build_model::{BuildTarget, BuildTargetIdentifier, ResponseError, SourcesItem};
use serde_json::Value;

use crate::{BSP_VERSION, CLIENT_NAME};

/// Capabilities a build backend living in the same process implements.
///
/// Optional capabilities have defaults: preparation reports "not supported"
/// (`-32601`), notifications are ignored and the read-only properties are empty.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    async fn build_targets(&self) -> Result<Vec<BuildTarget>, ResponseError>;

    async fn build_target_sources(
        &self,
        targets: Vec<BuildTargetIdentifier>,
    ) -> Result<Vec<SourcesItem>, ResponseError>;

    /// Compiler options for one file in one target. `Ok(None)` means the backend has no
    /// settings for the file.
    async fn source_kit_options(
        &self,
        params: SourceKitOptionsParams,
    ) -> Result<Option<SourceKitOptionsResult>, ResponseError>;

    async fn prepare(&self, _targets: Vec<BuildTargetIdentifier>) -> Result<(), ResponseError> {
        Err(ResponseError::method_not_found(BuildTargetPrepare::METHOD))
    }

    async fn did_change_watched_files(&self, _changes: Vec<FileEvent>) {}

    /// Resolves once in-flight build graph reloads have settled.
    async fn wait_for_build_system_updates(&self) {}

    async fn register_for_changes(&self, _params: RegisterForChangesParams) {}

    async fn shutdown(&self) -> Result<(), ResponseError> {
        Ok(())
    }

    fn file_watchers(&self) -> Vec<FileSystemWatcher> {
        Vec::new()
    }

    fn index_store_path(&self) -> Option<String> {
        None
    }

    fn index_database_path(&self) -> Option<String> {
        None
    }

    fn supports_preparation(&self) -> bool {
        false
    }

    fn supports_multi_target_preparation(&self) -> bool {
        false
    }

    fn supports_output_paths(&self) -> bool {
        false
    }

    /// The `build/initialize` answer for this backend.
    fn initialize_result(&self) -> InitializeBuildResult {
        initialize_result_for(self)
    }
}

/// Builds a `build/initialize` result from a backend's read-only properties.
pub fn initialize_result_for<B: BuildBackend + ?Sized>(backend: &B) -> InitializeBuildResult {
    let watchers = backend.file_watchers();
    let data = SourceKitInitializeBuildResponseData {
        index_database_path: backend.index_database_path(),
        index_store_path: backend.index_store_path(),
        watchers: (!watchers.is_empty()).then_some(watchers),
        prepare_provider: Some(backend.supports_preparation()),
        source_kit_options_provider: Some(true),
        output_paths_provider: Some(backend.supports_output_paths()),
        multi_target_preparation: Some(MultiTargetPreparationSupport {
            supported: backend.supports_multi_target_preparation(),
            batch_size: None,
        }),
    };
    InitializeBuildResult {
        display_name: format!("{CLIENT_NAME} in-process backend"),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        bsp_version: BSP_VERSION.to_owned(),
        capabilities: Value::Object(Default::default()),
        data_kind: Some(InitializeBuildResult::SOURCE_KIT_DATA_KIND.to_owned()),
        data: serde_json::to_value(data).ok(),
    }
}

/// Stand-in for a backend that receives raw JSON-RPC messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_request(
        &self,
        id: RequestId,
        method: &str,
        params: Value,
    ) -> Result<Value, ResponseError>;

    async fn handle_notification(&self, method: &str, params: Value);
}
