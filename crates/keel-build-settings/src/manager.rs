use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use keel_bsp::protocol::{
    BuildClientCapabilities, BuildNotification, BuildRequest, BuildTargetEvent,
    BuildTargetPrepare, BuildTargetPrepareParams, BuildTargetSources, BuildTargetSourcesParams,
    BuildTargetSourcesResult, CreateWorkDoneProgress, DidChangeWatchedFiles,
    DidChangeWatchedFilesParams, EmptyParams,
    FileEvent, FileSystemWatcher, InitializeBuild, InitializeBuildParams, LogMessageParams,
    MessageType, OnBuildInitialized, OnBuildLogMessage, OnBuildTargetDidChange,
    OnBuildTargetDidChangeParams, OnBuildTaskFinish, OnBuildTaskProgress, OnBuildTaskStart,
    RegisterAction, RegisterForChanges, RegisterForChangesParams,
    SourceKitInitializeBuildResponseData, SourceKitOptions, SourceKitOptionsChanged,
    SourceKitOptionsChangedParams, SourceKitOptionsParams, TaskNotificationParams,
    TextDocumentIdentifier, WaitForBuildSystemUpdates, WorkspaceBuildTargets,
    WorkspaceBuildTargetsResult,
};
use keel_bsp::{
    server_message_channel, BspConnectionConfig, BuildBackend, BuildServerAdapter,
    LegacyBuildServer, MessageHandler, ServerMessage, ServerMessageReceiver,
    ServerMessageSender, BSP_VERSION, CLIENT_NAME,
};
use keel_build_model::{
    BuildTargetIdentifier, FileBuildSettings, Language, ResponseError, SourceFileInfo,
    SourcesItem,
};
use keel_config::{BuildSettingsConfig, FallbackConfig, PathStandardization, PreparationMode};
use keel_scheduler::{race_with_timeout, with_timeout, AsyncQueue, Debouncer, DependencyTracker};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use url::Url;

use crate::main_files::main_files_for;
use crate::{
    adjust, fallback_build_settings, path_standardizer, select_main_file, AsyncCache,
    BuildSystemManagerDelegate, BuildTargetGraph, BuildTargetsChangedListener, EditorConnection,
    MainFilesProvider, PathStandardizer, SourceFilesAndDirectories,
};

/// Source patterns watched in addition to the backend's own watchers when background
/// indexing keeps the index current.
const SOURCE_FILE_WATCHERS: &[&str] = &["**/*.{swift,c,cc,cpp,cxx,c++,m,mm,h,hh,hpp,hxx,inc}"];

/// Which backend a [`BuildSystemManager`] talks to.
///
/// The factories receive the channel on which the backend reports messages of its own
/// (target changes, pushed settings, log messages).
pub enum BuildServerSpec {
    /// No backend: every settings query is answered with generic defaults.
    None,
    InProcess(Box<dyn FnOnce(ServerMessageSender) -> Arc<dyn BuildBackend> + Send>),
    External {
        config: BspConnectionConfig,
        workspace_root: PathBuf,
    },
    Injected(Box<dyn FnOnce(ServerMessageSender) -> Arc<dyn MessageHandler> + Send>),
}

impl BuildServerSpec {
    pub fn in_process<F>(factory: F) -> Self
    where
        F: FnOnce(ServerMessageSender) -> Arc<dyn BuildBackend> + Send + 'static,
    {
        Self::InProcess(Box::new(factory))
    }

    pub fn injected<F>(factory: F) -> Self
    where
        F: FnOnce(ServerMessageSender) -> Arc<dyn MessageHandler> + Send + 'static,
    {
        Self::Injected(Box::new(factory))
    }
}

/// Timeouts and policies of a [`BuildSystemManager`], resolved from
/// [`BuildSettingsConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSettingsOptions {
    pub settings_timeout: Duration,
    pub workspace_request_timeout: Duration,
    pub settings_changed_debounce: Duration,
    pub dependencies_updated_debounce: Duration,
    pub background_indexing: bool,
    pub preparation: PreparationMode,
    pub server_shutdown_grace: Duration,
    pub process_exit_grace: Duration,
    pub path_standardization: PathStandardization,
    pub fallback: FallbackConfig,
}

impl From<&BuildSettingsConfig> for BuildSettingsOptions {
    fn from(config: &BuildSettingsConfig) -> Self {
        Self {
            settings_timeout: config.settings_timeout(),
            workspace_request_timeout: config.workspace_request_timeout(),
            settings_changed_debounce: config.settings_changed_debounce(),
            dependencies_updated_debounce: config.dependencies_updated_debounce(),
            background_indexing: config.background_indexing,
            preparation: config.preparation,
            server_shutdown_grace: config.server_shutdown_grace(),
            process_exit_grace: config.process_exit_grace(),
            path_standardization: config.path_standardization,
            fallback: config.fallback.clone(),
        }
    }
}

impl Default for BuildSettingsOptions {
    fn default() -> Self {
        Self::from(&BuildSettingsConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Initialized,
    ShuttingDown,
    ShutDown,
}

/// Why cached build graph information has to be discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetsChangedCause {
    /// The backend sent `buildTarget/didChange`. `None` means any target may have
    /// changed.
    Notification(Option<Vec<BuildTargetEvent>>),
    /// A target list arrived after its request had already timed out. It replaces the
    /// empty graph cached at the timeout.
    DelayedTargets(Arc<BuildTargetGraph>),
    /// Sources of `targets` arrived after their request had already timed out.
    DelayedSources {
        targets: BTreeSet<BuildTargetIdentifier>,
        items: Arc<Vec<SourcesItem>>,
    },
}

/// Handle returned by [`BuildSystemManager::add_build_targets_changed_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordering classes of the manager's task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskMetadata {
    /// Mutates manager state; waits for everything queued before it.
    StateChange,
    /// Reads manager state; waits for queued state changes only.
    StateRead,
    /// Backend progress reporting; ordered among itself.
    TaskProgress,
}

impl DependencyTracker for TaskMetadata {
    fn is_dependency(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::StateChange, _) => true,
            (Self::StateRead, Self::StateChange) => true,
            (Self::TaskProgress, Self::TaskProgress) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OptionsKey {
    document: Url,
    target: BuildTargetIdentifier,
    language: Language,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WatchedFile {
    main_file: Url,
    language: Language,
}

/// A backend that completed initialization.
struct Backend {
    adapter: Arc<BuildServerAdapter>,
    /// Set when the server pushes settings instead of answering requests for them.
    legacy: Option<Arc<LegacyBuildServer>>,
    data: SourceKitInitializeBuildResponseData,
}

type Initialization = Shared<BoxFuture<'static, Option<Arc<Backend>>>>;

enum DelegateCall {
    SettingsChanged(BTreeSet<Url>),
    DependenciesUpdated(BTreeSet<Url>),
    TargetsChanged(Option<BTreeSet<BuildTargetIdentifier>>),
}

struct DelegateEvent {
    call: DelegateCall,
    delivered: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Subscribers {
    delegate: Mutex<Option<Arc<dyn BuildSystemManagerDelegate>>>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn BuildTargetsChangedListener>)>>,
    next_listener: AtomicU64,
}

struct Inner {
    root: Url,
    options: BuildSettingsOptions,
    connection: Arc<dyn EditorConnection>,
    main_files_provider: Option<Arc<dyn MainFilesProvider>>,
    standardizer: Arc<dyn PathStandardizer>,
    state: Arc<Mutex<ManagerState>>,
    initialization: Initialization,
    queue: AsyncQueue<TaskMetadata>,

    cached_adjusted_options: AsyncCache<OptionsKey, Option<FileBuildSettings>, ResponseError>,
    cached_build_targets: AsyncCache<(), Arc<BuildTargetGraph>, ResponseError>,
    cached_target_sources:
        AsyncCache<BTreeSet<BuildTargetIdentifier>, Arc<Vec<SourcesItem>>, ResponseError>,
    cached_source_files: AsyncCache<(), Arc<SourceFilesAndDirectories>, ResponseError>,

    copied_files: Mutex<Arc<BTreeMap<Url, Url>>>,
    copied_files_task: Mutex<Option<AbortHandle>>,
    watched_files: Mutex<BTreeMap<Url, WatchedFile>>,
    last_logged_settings: Mutex<HashMap<Url, FileBuildSettings>>,

    settings_changed: Debouncer<BTreeSet<Url>>,
    dependencies_updated: Debouncer<BTreeSet<Url>>,
    subscribers: Arc<Subscribers>,
    delegate_events: mpsc::UnboundedSender<DelegateEvent>,
    background_tasks: Mutex<Vec<AbortHandle>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.background_tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(task) = self.copied_files_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Arbitrates build settings between the editor-facing layer and one build backend.
///
/// All backend-originated messages and all state mutations run through one ordered task
/// queue; queries wait for queued mutations before they read caches. Backend round trips
/// happen outside of any lock.
#[derive(Clone)]
pub struct BuildSystemManager {
    inner: Arc<Inner>,
}

impl BuildSystemManager {
    /// Creates the manager and starts backend initialization. Must be called from within a
    /// tokio runtime.
    pub fn new(
        spec: BuildServerSpec,
        root: Url,
        options: BuildSettingsOptions,
        connection: Arc<dyn EditorConnection>,
        main_files_provider: Option<Arc<dyn MainFilesProvider>>,
    ) -> Self {
        let (messages_tx, messages_rx) = server_message_channel();
        let state = Arc::new(Mutex::new(ManagerState::Uninitialized));

        let adapter = match spec {
            BuildServerSpec::None => None,
            BuildServerSpec::InProcess(factory) => Some(BuildServerAdapter::in_process(factory(
                messages_tx.clone(),
            ))),
            BuildServerSpec::Injected(factory) => {
                Some(BuildServerAdapter::injected(factory(messages_tx.clone())))
            }
            BuildServerSpec::External {
                config,
                workspace_root,
            } => match BuildServerAdapter::spawn_external(
                &config,
                &workspace_root,
                messages_tx.clone(),
            ) {
                Ok(adapter) => Some(adapter),
                Err(err) => {
                    tracing::error!(
                        target = "keel.build_settings",
                        server = %config.name,
                        error = %format!("{err:#}"),
                        "failed to launch build server"
                    );
                    report_to_editor(
                        Arc::clone(&connection),
                        format!("Failed to launch build server {}: {err:#}", config.name),
                    );
                    None
                }
            },
        };

        let initialization: Initialization = match adapter {
            None => {
                *state.lock() = ManagerState::Initialized;
                futures::future::ready(None).boxed().shared()
            }
            Some(adapter) => {
                let handle = tokio::spawn(initialize(
                    adapter,
                    InitContext {
                        root: root.clone(),
                        options: options.clone(),
                        connection: Arc::clone(&connection),
                        state: Arc::clone(&state),
                        messages: messages_tx,
                    },
                ));
                async move { handle.await.ok().flatten() }.boxed().shared()
            }
        };

        let subscribers = Arc::new(Subscribers::default());
        let delegate_events = spawn_delegate_loop(Arc::clone(&subscribers));
        let settings_changed = Debouncer::new(
            options.settings_changed_debounce,
            |mut lhs: BTreeSet<Url>, rhs| {
                lhs.extend(rhs);
                lhs
            },
            delegate_sink(delegate_events.clone(), DelegateCall::SettingsChanged),
        );
        let dependencies_updated = Debouncer::new(
            options.dependencies_updated_debounce,
            |mut lhs: BTreeSet<Url>, rhs| {
                // Empty means "every watched file".
                if lhs.is_empty() || rhs.is_empty() {
                    return BTreeSet::new();
                }
                lhs.extend(rhs);
                lhs
            },
            delegate_sink(delegate_events.clone(), DelegateCall::DependenciesUpdated),
        );

        let inner = Arc::new(Inner {
            root,
            standardizer: path_standardizer(options.path_standardization),
            options,
            connection,
            main_files_provider,
            state,
            initialization,
            queue: AsyncQueue::new(),
            cached_adjusted_options: AsyncCache::new(),
            cached_build_targets: AsyncCache::new(),
            cached_target_sources: AsyncCache::new(),
            cached_source_files: AsyncCache::new(),
            copied_files: Mutex::new(Arc::new(BTreeMap::new())),
            copied_files_task: Mutex::new(None),
            watched_files: Mutex::new(BTreeMap::new()),
            last_logged_settings: Mutex::new(HashMap::new()),
            settings_changed,
            dependencies_updated,
            subscribers,
            delegate_events,
            background_tasks: Mutex::new(Vec::new()),
        });

        let pump = tokio::spawn(pump_server_messages(Arc::downgrade(&inner), messages_rx));
        let after_initialization = tokio::spawn({
            let weak = Arc::downgrade(&inner);
            let initialization = inner.initialization.clone();
            async move {
                if initialization.await.is_some() {
                    if let Some(inner) = weak.upgrade() {
                        inner.schedule_copied_file_map_update();
                    }
                }
            }
        });
        inner
            .background_tasks
            .lock()
            .extend([pump.abort_handle(), after_initialization.abort_handle()]);

        Self { inner }
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.lock()
    }

    /// Waits for backend initialization. Returns whether a backend is available.
    pub async fn wait_until_initialized(&self) -> bool {
        self.inner.backend().await.is_some()
    }

    /// Installs the delegate.
    ///
    /// # Panics
    ///
    /// Panics if a delegate is already installed.
    pub fn set_delegate(&self, delegate: Arc<dyn BuildSystemManagerDelegate>) {
        let mut slot = self.inner.subscribers.delegate.lock();
        assert!(slot.is_none(), "build system manager delegate set twice");
        *slot = Some(delegate);
    }

    /// Drops the delegate. The owning layer calls this before tearing the delegate down.
    pub fn clear_delegate(&self) {
        self.inner.subscribers.delegate.lock().take();
    }

    pub fn add_build_targets_changed_listener(
        &self,
        listener: Arc<dyn BuildTargetsChangedListener>,
    ) -> ListenerId {
        let subscribers = &self.inner.subscribers;
        let id = ListenerId(subscribers.next_listener.fetch_add(1, Ordering::Relaxed));
        subscribers.listeners.lock().push((id, listener));
        id
    }

    pub fn remove_build_targets_changed_listener(&self, id: ListenerId) {
        self.inner
            .subscribers
            .listeners
            .lock()
            .retain(|(existing, _)| *existing != id);
    }

    /// Index store path reported by the backend, resolved against the workspace root.
    pub async fn index_store_path(&self) -> Option<PathBuf> {
        let backend = self.inner.backend().await?;
        self.inner
            .resolve_path(backend.data.index_store_path.as_deref()?)
    }

    /// Index database path reported by the backend, resolved against the workspace root.
    pub async fn index_database_path(&self) -> Option<PathBuf> {
        let backend = self.inner.backend().await?;
        self.inner
            .resolve_path(backend.data.index_database_path.as_deref()?)
    }

    pub async fn supports_preparation(&self) -> bool {
        self.inner
            .backend()
            .await
            .is_some_and(|backend| backend.data.prepare_provider.unwrap_or(false))
    }

    /// The current dependency graph.
    pub async fn build_targets(&self) -> Arc<BuildTargetGraph> {
        let Some(backend) = self.inner.ready_backend().await else {
            return Arc::default();
        };
        match self.inner.build_target_graph(&backend).await {
            Ok(graph) => graph,
            Err(err) => {
                tracing::warn!(
                    target = "keel.build_settings",
                    error = %err,
                    "failed to get build targets"
                );
                Arc::default()
            }
        }
    }

    /// Sorts `targets` so that dependencies precede their dependents.
    pub async fn topological_sort(
        &self,
        targets: impl IntoIterator<Item = BuildTargetIdentifier>,
    ) -> Vec<BuildTargetIdentifier> {
        self.build_targets().await.topological_sort(targets)
    }

    /// Every target that transitively depends on one of `targets`.
    pub async fn targets_depending_on(
        &self,
        targets: &BTreeSet<BuildTargetIdentifier>,
    ) -> BTreeSet<BuildTargetIdentifier> {
        self.build_targets().await.targets_depending_on(targets)
    }

    /// Source items of `targets`. Answered from a cached superset when possible.
    pub async fn sources_of_targets(
        &self,
        targets: BTreeSet<BuildTargetIdentifier>,
    ) -> Result<Arc<Vec<SourcesItem>>, ResponseError> {
        let Some(backend) = self.inner.ready_backend().await else {
            return Ok(Arc::default());
        };
        self.inner.target_sources(&backend, targets).await
    }

    pub async fn source_files_and_directories(&self) -> Arc<SourceFilesAndDirectories> {
        let Some(backend) = self.inner.ready_backend().await else {
            return Arc::default();
        };
        self.inner.snapshot_or_empty(&backend).await
    }

    pub async fn source_files(&self, include_non_buildable: bool) -> BTreeMap<Url, SourceFileInfo> {
        self.source_files_and_directories()
            .await
            .source_files(include_non_buildable)
    }

    pub async fn buildable_source_files(&self) -> BTreeSet<Url> {
        self.source_files_and_directories()
            .await
            .buildable_source_files()
    }

    pub async fn targets_for(&self, document: &Url) -> BTreeSet<BuildTargetIdentifier> {
        self.source_files_and_directories().await.targets_for(document)
    }

    pub async fn canonical_target(&self, document: &Url) -> Option<BuildTargetIdentifier> {
        self.source_files_and_directories()
            .await
            .canonical_target(document)
    }

    pub async fn output_paths(&self, target: &BuildTargetIdentifier) -> Vec<String> {
        self.source_files_and_directories().await.output_paths(target)
    }

    /// Copy destination to original source. May lag behind the latest source snapshot.
    pub fn copied_file_map(&self) -> Arc<BTreeMap<Url, Url>> {
        Arc::clone(&self.inner.copied_files.lock())
    }

    /// Maps a copy of a source file back to the original; other URIs are returned as is.
    pub fn location_adjusted_for_copied_files(&self, uri: &Url) -> Url {
        self.inner
            .copied_files
            .lock()
            .get(uri)
            .cloned()
            .unwrap_or_else(|| uri.clone())
    }

    /// Backend settings for `document` in `target`, adjusted for semantic functionality.
    ///
    /// With `fallback_after_timeout`, a backend that does not answer within the settings
    /// timeout yields fallback settings; the real answer is announced through
    /// `file_build_settings_changed` once it arrives.
    pub async fn build_settings(
        &self,
        document: &Url,
        target: &BuildTargetIdentifier,
        language: Language,
        fallback_after_timeout: bool,
    ) -> FileBuildSettings {
        self.inner.wait_for_state_changes().await;
        self.inner
            .build_settings(document, target, language, fallback_after_timeout)
            .await
    }

    /// Settings for `document`, borrowed from its main file when it is not compiled on its
    /// own. `None` only if no language can be determined.
    pub async fn build_settings_inferred_from_main_file(
        &self,
        document: &Url,
        target: Option<BuildTargetIdentifier>,
        language: Option<Language>,
        fallback_after_timeout: bool,
    ) -> Option<FileBuildSettings> {
        self.inner.wait_for_state_changes().await;
        self.inner
            .build_settings_inferred_from_main_file(
                document,
                target,
                language,
                fallback_after_timeout,
            )
            .await
    }

    /// Starts tracking `document` for settings change notifications.
    pub async fn register_for_change_notifications(&self, document: Url, language: Language) {
        let inner = Arc::clone(&self.inner);
        let operation = self.inner.queue.spawn(TaskMetadata::StateChange, move || async move {
            let backend = inner.backend().await;
            let main_file = inner
                .main_file(backend.as_ref(), &document, Some(language))
                .await;
            tracing::debug!(
                target = "keel.build_settings",
                uri = %document,
                main_file = %main_file,
                "watching file for build settings changes"
            );
            inner.watched_files.lock().insert(
                document,
                WatchedFile {
                    main_file: main_file.clone(),
                    language,
                },
            );
            if let Some(backend) = backend.filter(|backend| backend.legacy.is_some()) {
                backend
                    .adapter
                    .send_notification::<RegisterForChanges>(RegisterForChangesParams {
                        uri: main_file,
                        action: RegisterAction::Register,
                    });
            }
        });
        let _ = operation.await;
    }

    pub async fn unregister_for_change_notifications(&self, document: Url) {
        let inner = Arc::clone(&self.inner);
        let operation = self.inner.queue.spawn(TaskMetadata::StateChange, move || async move {
            let removed = inner.watched_files.lock().remove(&document);
            inner.last_logged_settings.lock().remove(&document);
            let Some(removed) = removed else {
                return;
            };
            let still_used = inner
                .watched_files
                .lock()
                .values()
                .any(|watched| watched.main_file == removed.main_file);
            if still_used {
                return;
            }
            let backend = inner.backend().await;
            if let Some(backend) = backend.filter(|backend| backend.legacy.is_some()) {
                backend
                    .adapter
                    .send_notification::<RegisterForChanges>(RegisterForChangesParams {
                        uri: removed.main_file,
                        action: RegisterAction::Unregister,
                    });
            }
        });
        let _ = operation.await;
    }

    /// Re-resolves the main file of every watched document; documents whose main file
    /// changed get a settings change notification.
    pub async fn main_files_changed(&self) {
        let inner = Arc::clone(&self.inner);
        let operation = self.inner.queue.spawn(TaskMetadata::StateChange, move || async move {
            let backend = inner.backend().await;
            let watched: Vec<(Url, WatchedFile)> = inner
                .watched_files
                .lock()
                .iter()
                .map(|(uri, watched)| (uri.clone(), watched.clone()))
                .collect();
            let mut changed = BTreeSet::new();
            for (document, watched) in watched {
                let main_file = inner
                    .main_file(backend.as_ref(), &document, Some(watched.language))
                    .await;
                if main_file == watched.main_file {
                    continue;
                }
                tracing::debug!(
                    target = "keel.build_settings",
                    uri = %document,
                    old = %watched.main_file,
                    new = %main_file,
                    "main file changed"
                );
                if let Some(entry) = inner.watched_files.lock().get_mut(&document) {
                    entry.main_file = main_file;
                }
                changed.insert(document);
            }
            if !changed.is_empty() {
                inner.settings_changed.schedule_call(changed);
            }
        });
        let _ = operation.await;
    }

    /// Discards cached build graph information affected by `cause` and notifies
    /// subscribers. Resolves once the change has been processed.
    pub async fn build_targets_did_change(&self, cause: TargetsChangedCause) {
        let _ = self.inner.enqueue_targets_changed(cause).await;
    }

    /// Forwards file system changes to the backend and announces updated dependencies of
    /// the watched files they affect.
    pub async fn files_did_change(&self, events: Vec<FileEvent>) {
        let Some(backend) = self.inner.backend().await else {
            return;
        };
        backend
            .adapter
            .send_notification::<DidChangeWatchedFiles>(DidChangeWatchedFilesParams {
                changes: events.clone(),
            });

        self.inner.wait_for_state_changes().await;
        let snapshot = self.inner.snapshot_or_empty(&backend).await;
        let mut changed_targets = BTreeSet::new();
        let mut outside_known_targets = false;
        for event in &events {
            let targets = snapshot.targets_for(&event.uri);
            if targets.is_empty() {
                outside_known_targets = true;
            }
            changed_targets.extend(targets);
        }

        let graph = self.build_targets().await;
        let dependents = graph.targets_depending_on(&changed_targets);
        let affected: BTreeSet<BuildTargetIdentifier> =
            changed_targets.union(&dependents).cloned().collect();

        if self.inner.options.preparation == PreparationMode::Eager && !dependents.is_empty() {
            if let Err(err) = self.prepare(dependents).await {
                tracing::warn!(
                    target = "keel.build_settings",
                    error = %err,
                    "failed to prepare dependents of changed files"
                );
            }
        }

        if outside_known_targets {
            // Possibly a build file: assume every watched file is affected.
            self.inner.dependencies_updated.schedule_call(BTreeSet::new());
            return;
        }
        let files: BTreeSet<Url> = self
            .inner
            .watched_files
            .lock()
            .iter()
            .filter(|(_, watched)| {
                snapshot
                    .targets_for(&watched.main_file)
                    .iter()
                    .any(|target| affected.contains(target))
            })
            .map(|(uri, _)| uri.clone())
            .collect();
        if !files.is_empty() {
            self.inner.dependencies_updated.schedule_call(files);
        }
    }

    /// Prepares `targets` (builds what semantic functionality needs), dependencies first.
    ///
    /// Backends without preparation support are skipped silently.
    pub async fn prepare(
        &self,
        targets: BTreeSet<BuildTargetIdentifier>,
    ) -> Result<(), ResponseError> {
        if self.inner.options.preparation == PreparationMode::Off || targets.is_empty() {
            return Ok(());
        }
        let Some(backend) = self.inner.ready_backend().await else {
            return Ok(());
        };
        if !backend.data.prepare_provider.unwrap_or(false) {
            return Ok(());
        }

        let ordered = self.build_targets().await.topological_sort(targets);
        let batch_size = match &backend.data.multi_target_preparation {
            Some(support) if support.supported => {
                support.batch_size.filter(|size| *size > 0).unwrap_or(ordered.len())
            }
            _ => 1,
        };
        for batch in ordered.chunks(batch_size.max(1)) {
            tracing::debug!(
                target = "keel.build_settings",
                targets = ?batch.iter().map(|target| target.uri.as_str()).collect::<Vec<_>>(),
                "preparing targets"
            );
            let params = BuildTargetPrepareParams {
                targets: batch.to_vec(),
                origin_id: None,
            };
            match backend.adapter.send::<BuildTargetPrepare>(params).await {
                Ok(_) => {}
                Err(err) if err.is_method_not_found() => {
                    tracing::debug!(
                        target = "keel.build_settings",
                        "build server does not support preparation"
                    );
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Waits until queued build graph changes are processed and the backend has settled.
    pub async fn wait_for_up_to_date_build_graph(&self) {
        self.inner.queue.wait_for(&TaskMetadata::StateChange).await;
        let Some(backend) = self.inner.backend().await else {
            return;
        };
        if let Err(err) = backend
            .adapter
            .send::<WaitForBuildSystemUpdates>(EmptyParams {})
            .await
        {
            if !err.is_method_not_found() {
                tracing::warn!(
                    target = "keel.build_settings",
                    error = %err,
                    "waiting for build system updates failed"
                );
            }
        }
        self.inner.queue.wait_for(&TaskMetadata::StateChange).await;
    }

    /// Delivers pending debounced notifications now and waits for the delegate to handle
    /// them.
    pub async fn flush_notifications(&self) {
        self.inner.settings_changed.flush().await;
        self.inner.dependencies_updated.flush().await;
        let (delivered, wait) = oneshot::channel();
        let barrier = DelegateEvent {
            call: DelegateCall::SettingsChanged(BTreeSet::new()),
            delivered: Some(delivered),
        };
        if self.inner.delegate_events.send(barrier).is_ok() {
            let _ = wait.await;
        }
    }

    /// Shuts the backend down within the configured grace periods.
    pub async fn shutdown(&self) {
        *self.inner.state.lock() = ManagerState::ShuttingDown;
        let grace = self.inner.options.server_shutdown_grace;
        let exit_grace = self.inner.options.process_exit_grace;
        match with_timeout(grace, self.inner.backend()).await {
            Ok(Some(backend)) => match &backend.legacy {
                Some(legacy) => legacy.remote().shutdown(grace, exit_grace).await,
                None => backend.adapter.shutdown(grace, exit_grace).await,
            },
            Ok(None) => {}
            Err(timed_out) => {
                tracing::warn!(
                    target = "keel.build_settings",
                    error = %timed_out,
                    "build server still initializing at shutdown"
                );
            }
        }
        if let Some(task) = self.inner.copied_files_task.lock().take() {
            task.abort();
        }
        *self.inner.state.lock() = ManagerState::ShutDown;
    }
}

impl Inner {
    async fn backend(&self) -> Option<Arc<Backend>> {
        self.initialization.clone().await
    }

    async fn wait_for_state_changes(&self) {
        self.queue.wait_for(&TaskMetadata::StateRead).await;
    }

    async fn ready_backend(&self) -> Option<Arc<Backend>> {
        let backend = self.backend().await?;
        self.wait_for_state_changes().await;
        Some(backend)
    }

    fn resolve_path(&self, path: &str) -> Option<PathBuf> {
        let path = Path::new(path);
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        Some(self.root.to_file_path().ok()?.join(path))
    }

    fn enqueue_targets_changed(
        self: &Arc<Self>,
        cause: TargetsChangedCause,
    ) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(self);
        self.queue.spawn(TaskMetadata::StateChange, move || async move {
            inner.process_targets_changed(cause).await
        })
    }

    async fn process_targets_changed(self: &Arc<Self>, cause: TargetsChangedCause) {
        let changed: Option<BTreeSet<BuildTargetIdentifier>> = match &cause {
            TargetsChangedCause::Notification(Some(events)) => {
                Some(events.iter().map(|event| event.target.clone()).collect())
            }
            _ => None,
        };
        tracing::debug!(
            target = "keel.build_settings",
            cause = ?cause,
            "build targets changed"
        );

        match (&cause, &changed) {
            (TargetsChangedCause::Notification(_), Some(changed)) => {
                self.cached_adjusted_options
                    .clear(|key| changed.contains(&key.target));
                self.cached_target_sources
                    .clear(|targets| !targets.is_disjoint(changed));
                self.cached_build_targets.clear_all();
            }
            (TargetsChangedCause::Notification(_), None) => {
                self.cached_adjusted_options.clear_all();
                self.cached_target_sources.clear_all();
                self.cached_build_targets.clear_all();
            }
            (TargetsChangedCause::DelayedTargets(graph), _) => {
                self.cached_build_targets.set((), Arc::clone(graph));
            }
            (TargetsChangedCause::DelayedSources { targets, items }, _) => {
                self.cached_target_sources
                    .set(targets.clone(), Arc::clone(items));
            }
        }
        self.cached_source_files.clear_all();
        self.schedule_copied_file_map_update();

        let _ = self.delegate_events.send(DelegateEvent {
            call: DelegateCall::TargetsChanged(changed),
            delivered: None,
        });
        let watched: BTreeSet<Url> = self.watched_files.lock().keys().cloned().collect();
        if !watched.is_empty() {
            self.settings_changed.schedule_call(watched);
        }
    }

    fn schedule_copied_file_map_update(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Some(backend) = inner.backend().await else {
                return;
            };
            inner.wait_for_state_changes().await;
            let snapshot = inner.snapshot_or_empty(&backend).await;
            *inner.copied_files.lock() = Arc::new(snapshot.copied_file_map());
        });
        if let Some(previous) = self.copied_files_task.lock().replace(task.abort_handle()) {
            previous.abort();
        }
    }

    async fn build_target_graph(
        self: &Arc<Self>,
        backend: &Arc<Backend>,
    ) -> Result<Arc<BuildTargetGraph>, ResponseError> {
        let adapter = Arc::clone(&backend.adapter);
        let weak = Arc::downgrade(self);
        let timeout = self.options.workspace_request_timeout;
        self.cached_build_targets
            .get((), move |()| async move {
                let request =
                    async move { adapter.send::<WorkspaceBuildTargets>(EmptyParams {}).await };
                let on_late = move |result: Result<WorkspaceBuildTargetsResult, ResponseError>| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match result {
                        Ok(result) => {
                            let graph = Arc::new(BuildTargetGraph::new(result.targets));
                            inner.enqueue_targets_changed(TargetsChangedCause::DelayedTargets(
                                graph,
                            ));
                        }
                        Err(err) => tracing::warn!(
                            target = "keel.build_settings",
                            error = %err,
                            "late build targets request failed"
                        ),
                    }
                };
                match race_with_timeout(timeout, request, on_late).await {
                    Ok(result) => {
                        result.map(|result| Arc::new(BuildTargetGraph::new(result.targets)))
                    }
                    Err(timed_out) => {
                        tracing::warn!(
                            target = "keel.build_settings",
                            error = %timed_out,
                            "build targets request timed out; continuing with no targets"
                        );
                        Ok(Arc::default())
                    }
                }
            })
            .await
    }

    async fn target_sources(
        self: &Arc<Self>,
        backend: &Arc<Backend>,
        targets: BTreeSet<BuildTargetIdentifier>,
    ) -> Result<Arc<Vec<SourcesItem>>, ResponseError> {
        let narrowed = targets.clone();
        let derived = self
            .cached_target_sources
            .get_derived(
                targets.clone(),
                |cached| targets.is_subset(cached),
                move |items: Arc<Vec<SourcesItem>>| {
                    Arc::new(
                        items
                            .iter()
                            .filter(|item| narrowed.contains(&item.target))
                            .cloned()
                            .collect(),
                    )
                },
            )
            .await;
        if let Some(result) = derived {
            return result;
        }

        let adapter = Arc::clone(&backend.adapter);
        let weak = Arc::downgrade(self);
        let timeout = self.options.workspace_request_timeout;
        self.cached_target_sources
            .get(targets, move |targets| async move {
                let params = BuildTargetSourcesParams {
                    targets: targets.iter().cloned().collect(),
                };
                let request = async move { adapter.send::<BuildTargetSources>(params).await };
                let on_late = move |result: Result<BuildTargetSourcesResult, ResponseError>| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match result {
                        Ok(result) => {
                            inner.enqueue_targets_changed(TargetsChangedCause::DelayedSources {
                                targets,
                                items: Arc::new(result.items),
                            });
                        }
                        Err(err) => tracing::warn!(
                            target = "keel.build_settings",
                            error = %err,
                            "late sources request failed"
                        ),
                    }
                };
                match race_with_timeout(timeout, request, on_late).await {
                    Ok(result) => result.map(|result| Arc::new(result.items)),
                    Err(timed_out) => {
                        tracing::warn!(
                            target = "keel.build_settings",
                            error = %timed_out,
                            "sources request timed out; continuing with no sources"
                        );
                        Ok(Arc::default())
                    }
                }
            })
            .await
    }

    async fn source_snapshot(
        self: &Arc<Self>,
        backend: &Arc<Backend>,
    ) -> Result<Arc<SourceFilesAndDirectories>, ResponseError> {
        let inner = Arc::clone(self);
        let backend = Arc::clone(backend);
        self.cached_source_files
            .get((), move |()| async move {
                let graph = inner.build_target_graph(&backend).await?;
                let items = inner
                    .target_sources(&backend, graph.ids().cloned().collect())
                    .await?;
                Ok::<_, ResponseError>(Arc::new(SourceFilesAndDirectories::new(
                    &graph,
                    items.as_ref().clone(),
                )))
            })
            .await
    }

    async fn snapshot_or_empty(
        self: &Arc<Self>,
        backend: &Arc<Backend>,
    ) -> Arc<SourceFilesAndDirectories> {
        match self.source_snapshot(backend).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    target = "keel.build_settings",
                    error = %err,
                    "failed to compute source files"
                );
                Arc::default()
            }
        }
    }

    async fn main_file(
        self: &Arc<Self>,
        backend: Option<&Arc<Backend>>,
        document: &Url,
        language: Option<Language>,
    ) -> Url {
        let language = language.or_else(|| Language::infer_from_uri(document));
        let Some(provider) = self.main_files_provider.as_deref() else {
            return document.clone();
        };
        if language.is_some_and(Language::is_self_compilable) {
            return document.clone();
        }
        let snapshot = match backend {
            Some(backend) => Some(self.snapshot_or_empty(backend).await),
            None => None,
        };
        let main_files = main_files_for(
            document,
            language,
            Some(provider),
            self.standardizer.as_ref(),
            |uri: &Url| {
                snapshot
                    .as_ref()
                    .is_some_and(|snapshot| snapshot.is_known_source(uri))
            },
        )
        .await;
        select_main_file(document, &main_files)
    }

    fn adjusted_options(
        self: &Arc<Self>,
        backend: Arc<Backend>,
        key: OptionsKey,
    ) -> impl Future<Output = Result<Option<FileBuildSettings>, ResponseError>> + Send + 'static
    {
        let inner = Arc::clone(self);
        async move {
            let adapter = Arc::clone(&backend.adapter);
            inner
                .cached_adjusted_options
                .get(key, move |key| async move {
                    let params = SourceKitOptionsParams {
                        text_document: TextDocumentIdentifier {
                            uri: key.document.clone(),
                        },
                        target: key.target.clone(),
                        language: key.language,
                    };
                    let options = adapter.send::<SourceKitOptions>(params).await?;
                    Ok::<_, ResponseError>(options.map(|options| FileBuildSettings {
                        compiler_arguments: adjust::for_semantic_functionality(
                            key.language,
                            &options.compiler_arguments,
                        ),
                        working_directory: options.working_directory,
                        language: Some(key.language),
                        data: options.data,
                        is_fallback: false,
                    }))
                })
                .await
        }
    }

    async fn build_settings(
        self: &Arc<Self>,
        document: &Url,
        target: &BuildTargetIdentifier,
        language: Language,
        fallback_after_timeout: bool,
    ) -> FileBuildSettings {
        let fallback = || fallback_build_settings(document, language, &self.options.fallback);
        let Some(backend) = self.backend().await else {
            return fallback();
        };
        let request = self.adjusted_options(
            backend,
            OptionsKey {
                document: document.clone(),
                target: target.clone(),
                language,
            },
        );

        let result = if fallback_after_timeout {
            let weak = Arc::downgrade(self);
            let late_document = document.clone();
            let on_late = move |late: Result<Option<FileBuildSettings>, ResponseError>| {
                if !matches!(late, Ok(Some(_))) {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    tracing::debug!(
                        target = "keel.build_settings",
                        uri = %late_document,
                        "build settings arrived after the timeout"
                    );
                    inner
                        .settings_changed
                        .schedule_call(BTreeSet::from([late_document]));
                }
            };
            match race_with_timeout(self.options.settings_timeout, request, on_late).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(
                        target = "keel.build_settings",
                        uri = %document,
                        "build settings timed out; using fallback settings"
                    );
                    return fallback();
                }
            }
        } else {
            request.await
        };

        match result {
            Ok(Some(settings)) => settings,
            Ok(None) => fallback(),
            Err(err) => {
                tracing::warn!(
                    target = "keel.build_settings",
                    uri = %document,
                    build_target = %target,
                    error = %err,
                    "failed to get build settings"
                );
                fallback()
            }
        }
    }

    async fn build_settings_inferred_from_main_file(
        self: &Arc<Self>,
        document: &Url,
        target: Option<BuildTargetIdentifier>,
        language: Option<Language>,
        fallback_after_timeout: bool,
    ) -> Option<FileBuildSettings> {
        let Some(backend) = self.backend().await else {
            let language = language.or_else(|| Language::infer_from_uri(document))?;
            // No better answer will ever arrive.
            let settings = fallback_build_settings(document, language, &self.options.fallback)
                .marked_fallback(false);
            self.log_settings(document, &settings);
            return Some(settings);
        };

        let main_file = self.main_file(Some(&backend), document, language).await;
        let settings = self
            .settings_for_main_file(
                &backend,
                &main_file,
                target.clone(),
                language,
                fallback_after_timeout,
            )
            .await?;
        let mut settings = if main_file == *document {
            settings
        } else {
            settings.patching(document, &main_file)
        };

        if settings.is_fallback {
            if let Some(resolved) = resolve_symlinks(document).await {
                let resolved_main = self.main_file(Some(&backend), &resolved, language).await;
                if resolved_main != main_file {
                    let retry = self
                        .settings_for_main_file(
                            &backend,
                            &resolved_main,
                            target,
                            language,
                            fallback_after_timeout,
                        )
                        .await;
                    if let Some(retry) = retry.filter(|retry| !retry.is_fallback) {
                        settings = retry.patching(document, &resolved_main);
                    }
                }
            }
        }

        self.log_settings(document, &settings);
        Some(settings)
    }

    async fn settings_for_main_file(
        self: &Arc<Self>,
        backend: &Arc<Backend>,
        main_file: &Url,
        target: Option<BuildTargetIdentifier>,
        language: Option<Language>,
        fallback_after_timeout: bool,
    ) -> Option<FileBuildSettings> {
        let (target, lookup_timed_out) = match target {
            Some(target) => (Some(target), false),
            None => {
                let inner = Arc::clone(self);
                let lookup_backend = Arc::clone(backend);
                let lookup_file = main_file.clone();
                let lookup = async move {
                    inner
                        .snapshot_or_empty(&lookup_backend)
                        .await
                        .canonical_target(&lookup_file)
                };
                match race_with_timeout(self.options.workspace_request_timeout, lookup, |_| {})
                    .await
                {
                    Ok(target) => (target, false),
                    Err(_) => (None, true),
                }
            }
        };

        let language = match language {
            Some(language) => language,
            None if lookup_timed_out => Language::infer_from_uri(main_file)?,
            None => self
                .snapshot_or_empty(backend)
                .await
                .language(main_file)
                .or_else(|| Language::infer_from_uri(main_file))?,
        };

        if let Some(target) = target {
            return Some(
                self.build_settings(main_file, &target, language, fallback_after_timeout)
                    .await,
            );
        }
        if !lookup_timed_out {
            if let Some(settings) = self
                .settings_from_sibling(backend, main_file, language, fallback_after_timeout)
                .await
            {
                return Some(settings);
            }
        }
        Some(fallback_build_settings(
            main_file,
            language,
            &self.options.fallback,
        ))
    }

    /// Settings of a known file next to `document` with the same language, patched to
    /// `document`. They are a guess and therefore marked as fallback.
    async fn settings_from_sibling(
        self: &Arc<Self>,
        backend: &Arc<Backend>,
        document: &Url,
        language: Language,
        fallback_after_timeout: bool,
    ) -> Option<FileBuildSettings> {
        let snapshot = self.snapshot_or_empty(backend).await;
        let sibling = snapshot.siblings(document, language).into_iter().next()?;
        let target = snapshot.canonical_target(&sibling)?;
        let settings = self
            .build_settings(&sibling, &target, language, fallback_after_timeout)
            .await;
        if settings.is_fallback {
            return None;
        }
        tracing::debug!(
            target = "keel.build_settings",
            uri = %document,
            sibling = %sibling,
            "inferring build settings from a sibling file"
        );
        Some(settings.patching(document, &sibling).marked_fallback(true))
    }

    fn log_settings(&self, document: &Url, settings: &FileBuildSettings) {
        let mut last_logged = self.last_logged_settings.lock();
        if last_logged.get(document) == Some(settings) {
            return;
        }
        tracing::debug!(
            target = "keel.build_settings",
            uri = %document,
            arguments = ?settings.compiler_arguments,
            working_directory = ?settings.working_directory,
            is_fallback = settings.is_fallback,
            "build settings"
        );
        last_logged.insert(document.clone(), settings.clone());
    }

    /// Hands pushed settings to the legacy server. The target change it announces discards
    /// the cached options, so the next query is answered from its store.
    async fn did_change_source_kit_options(
        self: &Arc<Self>,
        params: SourceKitOptionsChangedParams,
    ) {
        let Some(backend) = self.backend().await else {
            return;
        };
        let Some(legacy) = &backend.legacy else {
            tracing::warn!(
                target = "keel.build_settings",
                uri = %params.uri,
                "ignoring pushed settings from a build server that answers settings requests"
            );
            return;
        };
        legacy.did_change_options(params);
    }

    fn handle_server_message(self: &Arc<Self>, message: ServerMessage) {
        match message {
            ServerMessage::Notification { method, params } => {
                self.handle_server_notification(&method, params)
            }
            ServerMessage::Request {
                id,
                method,
                responder,
                ..
            } => {
                if method == CreateWorkDoneProgress::METHOD {
                    responder.respond(Ok(Value::Null));
                } else {
                    tracing::debug!(
                        target = "keel.build_settings",
                        id = %id,
                        method = %method,
                        "unsupported request from build server"
                    );
                    responder.respond(Err(ResponseError::method_not_found(&method)));
                }
            }
            ServerMessage::Disconnected => {
                tracing::warn!(target = "keel.build_settings", "build server disconnected");
            }
        }
    }

    fn handle_server_notification(self: &Arc<Self>, method: &str, params: Value) {
        match method {
            OnBuildTargetDidChange::METHOD => {
                if let Some(params) = decode::<OnBuildTargetDidChangeParams>(method, params) {
                    self.enqueue_targets_changed(TargetsChangedCause::Notification(
                        params.changes,
                    ));
                }
            }
            SourceKitOptionsChanged::METHOD => {
                if let Some(params) = decode::<SourceKitOptionsChangedParams>(method, params) {
                    let inner = Arc::clone(self);
                    self.queue.spawn(TaskMetadata::StateChange, move || async move {
                        inner.did_change_source_kit_options(params).await
                    });
                }
            }
            OnBuildLogMessage::METHOD => {
                if let Some(params) = decode::<LogMessageParams>(method, params) {
                    log_server_message(&params);
                }
            }
            OnBuildTaskStart::METHOD | OnBuildTaskProgress::METHOD | OnBuildTaskFinish::METHOD => {
                if let Some(params) = decode::<TaskNotificationParams>(method, params) {
                    let method = method.to_owned();
                    self.queue.spawn(TaskMetadata::TaskProgress, move || async move {
                        tracing::debug!(
                            target = "keel.build_settings",
                            method = %method,
                            task = %params.task_id.id,
                            message = params.message.as_deref().unwrap_or_default(),
                            "build server task"
                        );
                    });
                }
            }
            other => {
                tracing::debug!(
                    target = "keel.build_settings",
                    method = %other,
                    "ignoring notification from build server"
                );
            }
        }
    }
}

struct InitContext {
    root: Url,
    options: BuildSettingsOptions,
    connection: Arc<dyn EditorConnection>,
    state: Arc<Mutex<ManagerState>>,
    messages: ServerMessageSender,
}

async fn initialize(adapter: BuildServerAdapter, cx: InitContext) -> Option<Arc<Backend>> {
    *cx.state.lock() = ManagerState::Initializing;
    let adapter = Arc::new(adapter);
    let params = InitializeBuildParams {
        display_name: CLIENT_NAME.to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        bsp_version: BSP_VERSION.to_owned(),
        root_uri: cx.root.clone(),
        capabilities: BuildClientCapabilities {
            language_ids: vec![
                Language::C,
                Language::Cpp,
                Language::ObjectiveC,
                Language::ObjectiveCpp,
                Language::Swift,
            ],
        },
        data: None,
    };

    let result = match adapter.send::<InitializeBuild>(params).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(
                target = "keel.build_settings",
                error = %err,
                "build server failed to initialize"
            );
            *cx.state.lock() = ManagerState::Initialized;
            report_to_editor(
                cx.connection,
                format!("Failed to initialize the build server: {}", err.message),
            );
            let grace = cx.options.server_shutdown_grace;
            let exit_grace = cx.options.process_exit_grace;
            tokio::spawn(async move { adapter.shutdown(grace, exit_grace).await });
            return None;
        }
    };

    let data = result.source_kit_data().unwrap_or_default();
    tracing::info!(
        target = "keel.build_settings",
        server = %result.display_name,
        version = %result.version,
        "build server initialized"
    );
    adapter.send_notification::<OnBuildInitialized>(EmptyParams {});

    let (adapter, legacy) = if data.source_kit_options_provider.unwrap_or(false) {
        (adapter, None)
    } else {
        tracing::info!(
            target = "keel.build_settings",
            "build server pushes settings; wrapping it in the legacy adapter"
        );
        let legacy = Arc::new(
            LegacyBuildServer::new(adapter, cx.root.clone(), Some(data.clone()), cx.messages)
                .with_shutdown_graces(
                    cx.options.server_shutdown_grace,
                    cx.options.process_exit_grace,
                ),
        );
        let backend: Arc<dyn BuildBackend> = Arc::clone(&legacy) as Arc<dyn BuildBackend>;
        (Arc::new(BuildServerAdapter::in_process(backend)), Some(legacy))
    };

    let mut watchers: BTreeSet<FileSystemWatcher> = data
        .watchers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    if cx.options.background_indexing {
        watchers.extend(SOURCE_FILE_WATCHERS.iter().copied().map(FileSystemWatcher::new));
    }
    if !watchers.is_empty() {
        let connection = Arc::clone(&cx.connection);
        tokio::spawn(async move {
            connection.wait_until_initialized().await;
            connection.watch_files(watchers.into_iter().collect()).await;
        });
    }

    *cx.state.lock() = ManagerState::Initialized;
    Some(Arc::new(Backend {
        adapter,
        legacy,
        data,
    }))
}

async fn pump_server_messages(inner: Weak<Inner>, mut messages: ServerMessageReceiver) {
    while let Some(message) = messages.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_server_message(message);
    }
}

fn spawn_delegate_loop(subscribers: Arc<Subscribers>) -> mpsc::UnboundedSender<DelegateEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<DelegateEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            deliver(&subscribers, event.call).await;
            if let Some(delivered) = event.delivered {
                let _ = delivered.send(());
            }
        }
    });
    tx
}

async fn deliver(subscribers: &Subscribers, call: DelegateCall) {
    let delegate = subscribers.delegate.lock().clone();
    match call {
        DelegateCall::SettingsChanged(files) => {
            if let Some(delegate) = delegate.filter(|_| !files.is_empty()) {
                delegate.file_build_settings_changed(files).await;
            }
        }
        DelegateCall::DependenciesUpdated(files) => {
            if let Some(delegate) = delegate {
                delegate.files_dependencies_updated(files).await;
            }
        }
        DelegateCall::TargetsChanged(targets) => {
            let listeners: Vec<_> = subscribers
                .listeners
                .lock()
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            if let Some(delegate) = delegate {
                delegate.build_targets_changed(targets.clone()).await;
            }
            for listener in listeners {
                listener.build_targets_changed(targets.clone()).await;
            }
        }
    }
}

fn delegate_sink(
    events: mpsc::UnboundedSender<DelegateEvent>,
    wrap: fn(BTreeSet<Url>) -> DelegateCall,
) -> impl Fn(BTreeSet<Url>) -> BoxFuture<'static, ()> + Send + Sync + 'static {
    move |files| {
        let events = events.clone();
        async move {
            let (delivered, wait) = oneshot::channel();
            let event = DelegateEvent {
                call: wrap(files),
                delivered: Some(delivered),
            };
            if events.send(event).is_ok() {
                let _ = wait.await;
            }
        }
        .boxed()
    }
}

fn report_to_editor(connection: Arc<dyn EditorConnection>, message: String) {
    tokio::spawn(async move {
        connection.wait_until_initialized().await;
        connection.log_message(MessageType::Error, message).await;
    });
}

fn log_server_message(params: &LogMessageParams) {
    let message = params.message.as_str();
    match params.kind {
        MessageType::Error => tracing::error!(target = "keel.bsp", "{message}"),
        MessageType::Warning => tracing::warn!(target = "keel.bsp", "{message}"),
        MessageType::Info => tracing::info!(target = "keel.bsp", "{message}"),
        MessageType::Log => tracing::debug!(target = "keel.bsp", "{message}"),
    }
}

fn decode<T: DeserializeOwned>(method: &str, params: Value) -> Option<T> {
    match serde_json::from_value(params) {
        Ok(params) => Some(params),
        Err(err) => {
            tracing::error!(
                target = "keel.build_settings",
                method = %method,
                error = %err,
                "malformed notification from build server"
            );
            None
        }
    }
}

async fn resolve_symlinks(uri: &Url) -> Option<Url> {
    let path = uri.to_file_path().ok()?;
    let resolved = tokio::fs::canonicalize(&path).await.ok()?;
    if resolved == path {
        return None;
    }
    Url::from_file_path(resolved).ok()
}
