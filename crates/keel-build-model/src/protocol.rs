//! Build server requests and notifications.
//!
//! Every message is a zero-sized marker type implementing [`BuildRequest`] or
//! [`BuildNotification`], pairing the JSON-RPC method name with its parameter and result
//! types.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{BuildTarget, BuildTargetIdentifier, Language, SourcesItem};

pub trait BuildRequest {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
    type Result: Serialize + DeserializeOwned + Send + 'static;
}

pub trait BuildNotification {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
}

/// JSON-RPC request id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::String(id) => f.write_str(id),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

/// Parameters of requests and notifications that carry no payload (`{}` on the wire).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyParams {}

/// Result of requests that only signal completion. Any JSON value is accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoidResponse;

impl Serialize for VoidResponse {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_unit()
    }
}

impl<'de> Deserialize<'de> for VoidResponse {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde::de::IgnoredAny::deserialize(deserializer)?;
        Ok(VoidResponse)
    }
}

// ---------------------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeBuildParams {
    pub display_name: String,
    pub version: String,
    pub bsp_version: String,
    pub root_uri: Url,
    pub capabilities: BuildClientCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildClientCapabilities {
    #[serde(default)]
    pub language_ids: Vec<Language>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeBuildResult {
    pub display_name: String,
    pub version: String,
    pub bsp_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl InitializeBuildResult {
    pub const SOURCE_KIT_DATA_KIND: &'static str = "sourceKit";

    /// Decodes the `sourceKit` initialize data. Servers that omit `dataKind` but send a
    /// data object are accepted too.
    pub fn source_kit_data(&self) -> Option<SourceKitInitializeBuildResponseData> {
        match self.data_kind.as_deref() {
            None | Some(Self::SOURCE_KIT_DATA_KIND) => {}
            Some(_) => return None,
        }
        self.data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok())
    }
}

/// Backend properties reported during initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitInitializeBuildResponseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_database_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_store_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchers: Option<Vec<FileSystemWatcher>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_provider: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kit_options_provider: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_paths_provider: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_target_preparation: Option<MultiTargetPreparationSupport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiTargetPreparationSupport {
    pub supported: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemWatcher {
    pub glob_pattern: String,
    /// LSP `WatchKind` bit set; `None` means create, change and delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u8>,
}

impl FileSystemWatcher {
    pub fn new(glob_pattern: impl Into<String>) -> Self {
        Self {
            glob_pattern: glob_pattern.into(),
            kind: None,
        }
    }
}

pub enum InitializeBuild {}

impl BuildRequest for InitializeBuild {
    const METHOD: &'static str = "build/initialize";
    type Params = InitializeBuildParams;
    type Result = InitializeBuildResult;
}

pub enum OnBuildInitialized {}

impl BuildNotification for OnBuildInitialized {
    const METHOD: &'static str = "build/initialized";
    type Params = EmptyParams;
}

pub enum ShutdownBuild {}

impl BuildRequest for ShutdownBuild {
    const METHOD: &'static str = "build/shutdown";
    type Params = EmptyParams;
    type Result = VoidResponse;
}

pub enum OnBuildExit {}

impl BuildNotification for OnBuildExit {
    const METHOD: &'static str = "build/exit";
    type Params = EmptyParams;
}

// ---------------------------------------------------------------------------------------
// Build graph
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceBuildTargetsResult {
    pub targets: Vec<BuildTarget>,
}

pub enum WorkspaceBuildTargets {}

impl BuildRequest for WorkspaceBuildTargets {
    const METHOD: &'static str = "workspace/buildTargets";
    type Params = EmptyParams;
    type Result = WorkspaceBuildTargetsResult;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTargetSourcesParams {
    pub targets: Vec<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTargetSourcesResult {
    pub items: Vec<SourcesItem>,
}

pub enum BuildTargetSources {}

impl BuildRequest for BuildTargetSources {
    const METHOD: &'static str = "buildTarget/sources";
    type Params = BuildTargetSourcesParams;
    type Result = BuildTargetSourcesResult;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTargetPrepareParams {
    pub targets: Vec<BuildTargetIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

pub enum BuildTargetPrepare {}

impl BuildRequest for BuildTargetPrepare {
    const METHOD: &'static str = "buildTarget/prepare";
    type Params = BuildTargetPrepareParams;
    type Result = VoidResponse;
}

pub enum WaitForBuildSystemUpdates {}

impl BuildRequest for WaitForBuildSystemUpdates {
    const METHOD: &'static str = "workspace/waitForBuildSystemUpdates";
    type Params = EmptyParams;
    type Result = VoidResponse;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BuildTargetEventKind {
    Created,
    Changed,
    Deleted,
}

impl TryFrom<u8> for BuildTargetEventKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Created),
            2 => Ok(Self::Changed),
            3 => Ok(Self::Deleted),
            other => Err(format!("unknown build target event kind {other}")),
        }
    }
}

impl From<BuildTargetEventKind> for u8 {
    fn from(kind: BuildTargetEventKind) -> Self {
        match kind {
            BuildTargetEventKind::Created => 1,
            BuildTargetEventKind::Changed => 2,
            BuildTargetEventKind::Deleted => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTargetEvent {
    pub target: BuildTargetIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<BuildTargetEventKind>,
}

/// `changes: null` means any target may have changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnBuildTargetDidChangeParams {
    #[serde(default)]
    pub changes: Option<Vec<BuildTargetEvent>>,
}

pub enum OnBuildTargetDidChange {}

impl BuildNotification for OnBuildTargetDidChange {
    const METHOD: &'static str = "buildTarget/didChange";
    type Params = OnBuildTargetDidChangeParams;
}

// ---------------------------------------------------------------------------------------
// Compiler options
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextDocumentIdentifier {
    pub uri: Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitOptionsParams {
    pub text_document: TextDocumentIdentifier,
    pub target: BuildTargetIdentifier,
    pub language: Language,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitOptionsResult {
    pub compiler_arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub enum SourceKitOptions {}

impl BuildRequest for SourceKitOptions {
    const METHOD: &'static str = "textDocument/sourceKitOptions";
    type Params = SourceKitOptionsParams;
    type Result = Option<SourceKitOptionsResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterAction {
    Register,
    Unregister,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterForChangesParams {
    pub uri: Url,
    pub action: RegisterAction,
}

/// Asks a push-based server to start or stop sending options for a file.
pub enum RegisterForChanges {}

impl BuildNotification for RegisterForChanges {
    const METHOD: &'static str = "textDocument/registerForChanges";
    type Params = RegisterForChangesParams;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedOptions {
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitOptionsChangedParams {
    pub uri: Url,
    pub updated_options: UpdatedOptions,
}

/// Options pushed by a legacy server after `textDocument/registerForChanges`.
pub enum SourceKitOptionsChanged {}

impl BuildNotification for SourceKitOptionsChanged {
    const METHOD: &'static str = "build/sourceKitOptionsChanged";
    type Params = SourceKitOptionsChangedParams;
}

// ---------------------------------------------------------------------------------------
// File system events
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FileChangeType {
    Created,
    Changed,
    Deleted,
}

impl TryFrom<u8> for FileChangeType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Created),
            2 => Ok(Self::Changed),
            3 => Ok(Self::Deleted),
            other => Err(format!("unknown file change type {other}")),
        }
    }
}

impl From<FileChangeType> for u8 {
    fn from(kind: FileChangeType) -> Self {
        match kind {
            FileChangeType::Created => 1,
            FileChangeType::Changed => 2,
            FileChangeType::Deleted => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEvent {
    pub uri: Url,
    #[serde(rename = "type")]
    pub kind: FileChangeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidChangeWatchedFilesParams {
    pub changes: Vec<FileEvent>,
}

pub enum DidChangeWatchedFiles {}

impl BuildNotification for DidChangeWatchedFiles {
    const METHOD: &'static str = "workspace/didChangeWatchedFiles";
    type Params = DidChangeWatchedFilesParams;
}

// ---------------------------------------------------------------------------------------
// Cancellation, logging and progress
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}

pub enum CancelRequest {}

impl BuildNotification for CancelRequest {
    const METHOD: &'static str = "$/cancelRequest";
    type Params = CancelParams;
}

/// LSP `MessageType`, encoded as `1..=4` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    Error,
    Warning,
    Info,
    Log,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Info),
            4 => Some(Self::Log),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Error => 1,
            Self::Warning => 2,
            Self::Info => 3,
            Self::Log => 4,
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code).ok_or_else(|| {
            serde::de::Error::custom(format_args!("unknown message type {code}"))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessageParams {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

pub enum OnBuildLogMessage {}

impl BuildNotification for OnBuildLogMessage {
    const METHOD: &'static str = "build/logMessage";
    type Params = LogMessageParams;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNotificationParams {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub enum OnBuildTaskStart {}

impl BuildNotification for OnBuildTaskStart {
    const METHOD: &'static str = "build/taskStart";
    type Params = TaskNotificationParams;
}

pub enum OnBuildTaskProgress {}

impl BuildNotification for OnBuildTaskProgress {
    const METHOD: &'static str = "build/taskProgress";
    type Params = TaskNotificationParams;
}

pub enum OnBuildTaskFinish {}

impl BuildNotification for OnBuildTaskFinish {
    const METHOD: &'static str = "build/taskFinish";
    type Params = TaskNotificationParams;
}

/// Server-to-client request that creates a progress token; answered with `null`.
pub enum CreateWorkDoneProgress {}

impl BuildRequest for CreateWorkDoneProgress {
    const METHOD: &'static str = "window/workDoneProgress/create";
    type Params = Value;
    type Result = VoidResponse;
}
