use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_bsp::protocol::{
    FileEvent, FileSystemWatcher, MessageType, SourceKitOptionsParams, SourceKitOptionsResult,
};
use keel_bsp::{BuildBackend, ResponseError};
use keel_build_model::{
    pseudo_path, BuildTarget, BuildTargetIdentifier, SourceItem, SourceKitSourceItemData,
    SourceKitSourceItemKind, SourcesItem,
};
use keel_build_settings::{
    BuildServerSpec, BuildSettingsOptions, BuildSystemManager, BuildSystemManagerDelegate,
    BuildTargetsChangedListener, EditorConnection, MainFilesProvider,
};
use keel_config::PathStandardization;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

pub const LIB_C: &str = "/ws/Sources/Lib/lib.c";
pub const MAIN_C: &str = "/ws/Sources/App/main.c";

pub fn url(path: &str) -> Url {
    Url::parse(&format!("file://{path}")).unwrap()
}

pub fn id(name: &str) -> BuildTargetIdentifier {
    BuildTargetIdentifier::new(format!("target://{name}"))
}

pub fn args(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

pub fn options() -> BuildSettingsOptions {
    BuildSettingsOptions {
        path_standardization: PathStandardization::None,
        ..BuildSettingsOptions::default()
    }
}

/// In-process backend for a workspace rooted at `/ws` with two C targets: `App`
/// (`Sources/App/main.c`) depends on `Lib` (`Sources/Lib/lib.c`).
pub struct WorkspaceBackend {
    options_delay: Option<Duration>,
    first_targets_delay: Mutex<Option<Duration>>,
    targets_delay: Option<Duration>,
    sources_delay: Option<Duration>,
    supports_preparation: bool,
    multi_target_preparation: bool,
    watchers: Vec<FileSystemWatcher>,
    extra_sources: Vec<(BuildTargetIdentifier, SourceItem)>,
    options_calls: AtomicUsize,
    targets_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
    sources_requests: Mutex<Vec<Vec<BuildTargetIdentifier>>>,
    prepared: Mutex<Vec<Vec<BuildTargetIdentifier>>>,
    watched_changes: Mutex<Vec<Url>>,
}

impl WorkspaceBackend {
    pub fn new() -> Self {
        Self {
            options_delay: None,
            first_targets_delay: Mutex::new(None),
            targets_delay: None,
            sources_delay: None,
            supports_preparation: false,
            multi_target_preparation: false,
            watchers: Vec::new(),
            extra_sources: Vec::new(),
            options_calls: AtomicUsize::new(0),
            targets_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
            sources_requests: Mutex::new(Vec::new()),
            prepared: Mutex::new(Vec::new()),
            watched_changes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_options_delay(mut self, delay: Duration) -> Self {
        self.options_delay = Some(delay);
        self
    }

    /// Only the first `workspace/buildTargets` request is delayed.
    pub fn with_first_targets_delay(self, delay: Duration) -> Self {
        *self.first_targets_delay.lock() = Some(delay);
        self
    }

    /// Every `workspace/buildTargets` request is delayed.
    pub fn with_targets_delay(mut self, delay: Duration) -> Self {
        self.targets_delay = Some(delay);
        self
    }

    /// Every `buildTarget/sources` request is delayed.
    pub fn with_sources_delay(mut self, delay: Duration) -> Self {
        self.sources_delay = Some(delay);
        self
    }

    pub fn with_preparation(mut self, multi_target: bool) -> Self {
        self.supports_preparation = true;
        self.multi_target_preparation = multi_target;
        self
    }

    pub fn with_watcher(mut self, glob: &str) -> Self {
        self.watchers.push(FileSystemWatcher::new(glob));
        self
    }

    pub fn with_source(mut self, target: BuildTargetIdentifier, item: SourceItem) -> Self {
        self.extra_sources.push((target, item));
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn options_calls(&self) -> usize {
        self.options_calls.load(Ordering::SeqCst)
    }

    pub fn targets_calls(&self) -> usize {
        self.targets_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn sources_requests(&self) -> Vec<Vec<BuildTargetIdentifier>> {
        self.sources_requests.lock().clone()
    }

    pub fn prepared(&self) -> Vec<Vec<BuildTargetIdentifier>> {
        self.prepared.lock().clone()
    }

    pub fn watched_changes(&self) -> Vec<Url> {
        self.watched_changes.lock().clone()
    }

    fn main_source(target: &BuildTargetIdentifier) -> Option<(&'static str, &'static str)> {
        if *target == id("Lib") {
            Some((LIB_C, "/ws/build/lib.o"))
        } else if *target == id("App") {
            Some((MAIN_C, "/ws/build/main.o"))
        } else {
            None
        }
    }
}

pub fn c_source(path: &str, output_path: &str) -> SourceItem {
    SourceItem::file(url(path)).with_source_kit_data(SourceKitSourceItemData {
        language: Some("c".to_string()),
        kind: Some(SourceKitSourceItemKind::Source),
        output_path: Some(output_path.to_string()),
        copy_destinations: None,
    })
}

#[async_trait]
impl BuildBackend for WorkspaceBackend {
    async fn build_targets(&self) -> Result<Vec<BuildTarget>, ResponseError> {
        self.targets_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.first_targets_delay.lock().take().or(self.targets_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(vec![
            BuildTarget::new(id("Lib"), Vec::new()).with_tags(["library"]),
            BuildTarget::new(id("App"), vec![id("Lib")]).with_tags(["application"]),
        ])
    }

    async fn build_target_sources(
        &self,
        targets: Vec<BuildTargetIdentifier>,
    ) -> Result<Vec<SourcesItem>, ResponseError> {
        self.sources_requests.lock().push(targets.clone());
        if let Some(delay) = self.sources_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(targets
            .into_iter()
            .filter_map(|target| {
                let (path, output) = Self::main_source(&target)?;
                let mut sources = vec![c_source(path, output)];
                sources.extend(
                    self.extra_sources
                        .iter()
                        .filter(|(owner, _)| *owner == target)
                        .map(|(_, item)| item.clone()),
                );
                Some(SourcesItem {
                    target,
                    sources,
                    roots: None,
                })
            })
            .collect())
    }

    async fn source_kit_options(
        &self,
        params: SourceKitOptionsParams,
    ) -> Result<Option<SourceKitOptionsResult>, ResponseError> {
        self.options_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.options_delay {
            tokio::time::sleep(delay).await;
        }
        let Some((path, output)) = Self::main_source(&params.target) else {
            return Ok(None);
        };
        if params.text_document.uri != url(path) {
            return Ok(None);
        }
        Ok(Some(SourceKitOptionsResult {
            compiler_arguments: vec![
                "clang".to_string(),
                "-c".to_string(),
                pseudo_path(&params.text_document.uri),
                "-o".to_string(),
                output.to_string(),
            ],
            working_directory: Some("/ws".to_string()),
            data: None,
        }))
    }

    async fn prepare(&self, targets: Vec<BuildTargetIdentifier>) -> Result<(), ResponseError> {
        self.prepared.lock().push(targets);
        Ok(())
    }

    async fn did_change_watched_files(&self, changes: Vec<FileEvent>) {
        self.watched_changes
            .lock()
            .extend(changes.into_iter().map(|change| change.uri));
    }

    async fn shutdown(&self) -> Result<(), ResponseError> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn file_watchers(&self) -> Vec<FileSystemWatcher> {
        self.watchers.clone()
    }

    fn index_store_path(&self) -> Option<String> {
        Some("index/store".to_string())
    }

    fn index_database_path(&self) -> Option<String> {
        Some("/db/index".to_string())
    }

    fn supports_preparation(&self) -> bool {
        self.supports_preparation
    }

    fn supports_multi_target_preparation(&self) -> bool {
        self.multi_target_preparation
    }
}

pub fn in_process(backend: &Arc<WorkspaceBackend>) -> BuildServerSpec {
    let backend = Arc::clone(backend);
    BuildServerSpec::in_process(move |_messages| backend as Arc<dyn BuildBackend>)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateEvent {
    SettingsChanged(BTreeSet<Url>),
    DependenciesUpdated(BTreeSet<Url>),
    TargetsChanged(Option<BTreeSet<BuildTargetIdentifier>>),
}

pub struct RecordingDelegate {
    events: mpsc::UnboundedSender<DelegateEvent>,
}

#[async_trait]
impl BuildSystemManagerDelegate for RecordingDelegate {
    async fn file_build_settings_changed(&self, changed_files: BTreeSet<Url>) {
        let _ = self.events.send(DelegateEvent::SettingsChanged(changed_files));
    }

    async fn files_dependencies_updated(&self, changed_files: BTreeSet<Url>) {
        let _ = self.events.send(DelegateEvent::DependenciesUpdated(changed_files));
    }

    async fn build_targets_changed(
        &self,
        changed_targets: Option<BTreeSet<BuildTargetIdentifier>>,
    ) {
        let _ = self.events.send(DelegateEvent::TargetsChanged(changed_targets));
    }
}

pub struct RecordingListener {
    pub events: mpsc::UnboundedSender<Option<BTreeSet<BuildTargetIdentifier>>>,
}

#[async_trait]
impl BuildTargetsChangedListener for RecordingListener {
    async fn build_targets_changed(
        &self,
        changed_targets: Option<BTreeSet<BuildTargetIdentifier>>,
    ) {
        let _ = self.events.send(changed_targets);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    WatchFiles(Vec<FileSystemWatcher>),
    Log(MessageType, String),
}

pub struct RecordingConnection {
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

#[async_trait]
impl EditorConnection for RecordingConnection {
    async fn wait_until_initialized(&self) {}

    async fn watch_files(&self, watchers: Vec<FileSystemWatcher>) {
        let _ = self.events.send(ConnectionEvent::WatchFiles(watchers));
    }

    async fn log_message(&self, kind: MessageType, message: String) {
        let _ = self.events.send(ConnectionEvent::Log(kind, message));
    }
}

/// Main files looked up in a table that tests can replace.
#[derive(Default)]
pub struct TableMainFiles {
    table: Mutex<BTreeMap<Url, BTreeSet<Url>>>,
}

impl TableMainFiles {
    pub fn set(&self, header: Url, main_files: impl IntoIterator<Item = Url>) {
        self.table
            .lock()
            .insert(header, main_files.into_iter().collect());
    }
}

#[async_trait]
impl MainFilesProvider for TableMainFiles {
    async fn main_files_containing(&self, uri: &Url) -> BTreeSet<Url> {
        self.table.lock().get(uri).cloned().unwrap_or_default()
    }
}

pub struct Harness {
    pub manager: BuildSystemManager,
    pub delegate: mpsc::UnboundedReceiver<DelegateEvent>,
    pub connection: mpsc::UnboundedReceiver<ConnectionEvent>,
}

pub fn start(
    spec: BuildServerSpec,
    options: BuildSettingsOptions,
    main_files: Option<Arc<dyn MainFilesProvider>>,
) -> Harness {
    let (connection_tx, connection) = mpsc::unbounded_channel();
    let (delegate_tx, delegate) = mpsc::unbounded_channel();
    let manager = BuildSystemManager::new(
        spec,
        Url::parse("file:///ws/").unwrap(),
        options,
        Arc::new(RecordingConnection {
            events: connection_tx,
        }),
        main_files,
    );
    manager.set_delegate(Arc::new(RecordingDelegate { events: delegate_tx }));
    Harness {
        manager,
        delegate,
        connection,
    }
}

pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(event) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

/// Polls `condition` until it holds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition did not hold in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
