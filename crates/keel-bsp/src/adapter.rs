use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use keel_build_model::protocol::{
    BuildNotification, BuildRequest, BuildTargetPrepare, BuildTargetSources,
    BuildTargetSourcesResult, CancelParams, CancelRequest, DidChangeWatchedFiles, EmptyParams,
    InitializeBuild, OnBuildExit, OnBuildInitialized, RegisterForChanges, RequestId,
    ShutdownBuild, SourceKitOptions, VoidResponse, WaitForBuildSystemUpdates,
    WorkspaceBuildTargets, WorkspaceBuildTargetsResult,
};
use keel_build_model::ResponseError;
use keel_scheduler::with_timeout;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    BspConnectionConfig, BuildBackend, BuildServerProcess, CancelOnce, JsonRpcConnection,
    MessageHandler, ServerMessageSender,
};

/// A request the in-process variant can route to a [`BuildBackend`] method.
pub trait DispatchRequest: BuildRequest {
    fn dispatch(
        backend: Arc<dyn BuildBackend>,
        params: Self::Params,
    ) -> BoxFuture<'static, Result<Self::Result, ResponseError>>;
}

/// A notification the in-process variant can route to a [`BuildBackend`] method.
pub trait DispatchNotification: BuildNotification {
    fn dispatch(backend: Arc<dyn BuildBackend>, params: Self::Params) -> BoxFuture<'static, ()>;
}

/// Uniform request/notification interface over one build backend.
///
/// Notifications are delivered in the order they were sent. Dropping the future returned
/// by [`BuildServerAdapter::send`] cancels the request; backends reached through messages
/// receive `$/cancelRequest` once.
pub enum BuildServerAdapter {
    InProcess(InProcessAdapter),
    OutOfProcess(ExternalAdapter),
    Injected(InjectedAdapter),
}

pub struct InProcessAdapter {
    backend: Arc<dyn BuildBackend>,
    notifications: NotificationQueue,
}

pub struct ExternalAdapter {
    connection: JsonRpcConnection,
    process: Mutex<Option<BuildServerProcess>>,
}

pub struct InjectedAdapter {
    handler: Arc<dyn MessageHandler>,
    notifications: NotificationQueue,
    next_id: AtomicI64,
}

/// Runs notification futures one after another on a dedicated task.
#[derive(Clone)]
struct NotificationQueue {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl NotificationQueue {
    fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                notification.await;
            }
        });
        Self { tx }
    }

    fn push(&self, notification: BoxFuture<'static, ()>) {
        if self.tx.send(notification).is_err() {
            tracing::debug!(target = "keel.bsp", "notification dropped after adapter shutdown");
        }
    }
}

impl BuildServerAdapter {
    /// Wraps a backend living in this process. Must be called from within a tokio runtime.
    pub fn in_process(backend: Arc<dyn BuildBackend>) -> Self {
        Self::InProcess(InProcessAdapter {
            backend,
            notifications: NotificationQueue::start(),
        })
    }

    /// Wraps a caller-supplied message handler. Must be called from within a tokio runtime.
    pub fn injected(handler: Arc<dyn MessageHandler>) -> Self {
        Self::Injected(InjectedAdapter {
            handler,
            notifications: NotificationQueue::start(),
            next_id: AtomicI64::new(1),
        })
    }

    /// Talks JSON-RPC over an already established connection (no process is managed).
    pub fn from_connection(connection: JsonRpcConnection) -> Self {
        Self::OutOfProcess(ExternalAdapter {
            connection,
            process: Mutex::new(None),
        })
    }

    /// Launches an external build server with its working directory set to
    /// `workspace_root` and connects to its stdio.
    pub fn spawn_external(
        config: &BspConnectionConfig,
        workspace_root: &Path,
        incoming: ServerMessageSender,
    ) -> anyhow::Result<Self> {
        let (process, connection) = BuildServerProcess::spawn(config, workspace_root, incoming)?;
        Ok(Self::OutOfProcess(ExternalAdapter {
            connection,
            process: Mutex::new(Some(process)),
        }))
    }

    pub fn is_out_of_process(&self) -> bool {
        matches!(self, Self::OutOfProcess(_))
    }

    pub async fn send<R: DispatchRequest>(
        &self,
        params: R::Params,
    ) -> Result<R::Result, ResponseError> {
        match self {
            Self::InProcess(adapter) => R::dispatch(Arc::clone(&adapter.backend), params).await,
            Self::OutOfProcess(adapter) => {
                let params = serde_json::to_value(params)?;
                let result = adapter.connection.request(R::METHOD, params).await?;
                decode_result::<R>(result)
            }
            Self::Injected(adapter) => {
                let params = serde_json::to_value(params)?;
                let result = adapter.request(R::METHOD, params).await?;
                decode_result::<R>(result)
            }
        }
    }

    pub fn send_notification<N: DispatchNotification>(&self, params: N::Params) {
        match self {
            Self::InProcess(adapter) => adapter
                .notifications
                .push(N::dispatch(Arc::clone(&adapter.backend), params)),
            Self::OutOfProcess(adapter) => {
                let result = serde_json::to_value(params)
                    .map_err(crate::TransportError::from)
                    .and_then(|params| adapter.connection.notify(N::METHOD, params));
                if let Err(err) = result {
                    tracing::warn!(
                        target = "keel.bsp",
                        method = N::METHOD,
                        error = %err,
                        "failed to send notification to build server"
                    );
                }
            }
            Self::Injected(adapter) => match serde_json::to_value(params) {
                Ok(params) => {
                    let handler = Arc::clone(&adapter.handler);
                    adapter.notifications.push(
                        async move { handler.handle_notification(N::METHOD, params).await }
                            .boxed(),
                    );
                }
                Err(err) => tracing::warn!(
                    target = "keel.bsp",
                    method = N::METHOD,
                    error = %err,
                    "failed to encode notification"
                ),
            },
        }
    }

    /// Sends `build/shutdown` (waiting at most `shutdown_grace`) and `build/exit`. An
    /// external process then gets `exit_grace` to terminate before it is killed.
    pub async fn shutdown(&self, shutdown_grace: Duration, exit_grace: Duration) {
        match with_timeout(shutdown_grace, self.send::<ShutdownBuild>(EmptyParams {})).await {
            Ok(Ok(VoidResponse)) => {}
            Ok(Err(err)) => {
                tracing::warn!(target = "keel.bsp", error = %err, "build server failed to shut down cleanly");
            }
            Err(timed_out) => {
                tracing::warn!(target = "keel.bsp", error = %timed_out, "build server did not answer build/shutdown");
            }
        }
        self.send_notification::<OnBuildExit>(EmptyParams {});

        if let Self::OutOfProcess(adapter) = self {
            let process = adapter.process.lock().take();
            if let Some(mut process) = process {
                process.wait_or_kill(exit_grace).await;
            }
            adapter.connection.close();
        }
    }
}

impl InjectedAdapter {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ResponseError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler = Arc::clone(&self.handler);
        let notifications = self.notifications.clone();
        let cancel = CancelOnce::new(move |id| {
            let handler = Arc::clone(&handler);
            let params = serde_json::to_value(CancelParams { id }).unwrap_or(Value::Null);
            notifications.push(
                async move {
                    handler
                        .handle_notification(CancelRequest::METHOD, params)
                        .await
                }
                .boxed(),
            );
        });
        cancel.register(id.clone());
        let result = self.handler.handle_request(id, method, params).await;
        cancel.finish();
        result
    }
}

fn decode_result<R: BuildRequest>(value: Value) -> Result<R::Result, ResponseError> {
    serde_json::from_value(value).map_err(|err| {
        tracing::error!(
            target = "keel.bsp",
            method = R::METHOD,
            error = %err,
            "malformed response from build server"
        );
        ResponseError::from(err)
    })
}

impl DispatchRequest for InitializeBuild {
    fn dispatch(
        backend: Arc<dyn BuildBackend>,
        _params: Self::Params,
    ) -> BoxFuture<'static, Result<Self::Result, ResponseError>> {
        async move { Ok(backend.initialize_result()) }.boxed()
    }
}

impl DispatchRequest for ShutdownBuild {
    fn dispatch(
        backend: Arc<dyn BuildBackend>,
        _params: Self::Params,
    ) -> BoxFuture<'static, Result<Self::Result, ResponseError>> {
        async move { backend.shutdown().await.map(|()| VoidResponse) }.boxed()
    }
}

impl DispatchRequest for WorkspaceBuildTargets {
    fn dispatch(
        backend: Arc<dyn BuildBackend>,
        _params: Self::Params,
    ) -> BoxFuture<'static, Result<Self::Result, ResponseError>> {
        async move {
            let targets = backend.build_targets().await?;
            Ok(WorkspaceBuildTargetsResult { targets })
        }
        .boxed()
    }
}

impl DispatchRequest for BuildTargetSources {
    fn dispatch(
        backend: Arc<dyn BuildBackend>,
        params: Self::Params,
    ) -> BoxFuture<'static, Result<Self::Result, ResponseError>> {
        async move {
            let items = backend.build_target_sources(params.targets).await?;
            Ok(BuildTargetSourcesResult { items })
        }
        .boxed()
    }
}

impl DispatchRequest for SourceKitOptions {
    fn dispatch(
        backend: Arc<dyn BuildBackend>,
        params: Self::Params,
    ) -> BoxFuture<'static, Result<Self::Result, ResponseError>> {
        async move { backend.source_kit_options(params).await }.boxed()
    }
}

impl DispatchRequest for BuildTargetPrepare {
    fn dispatch(
        backend: Arc<dyn BuildBackend>,
        params: Self::Params,
    ) -> BoxFuture<'static, Result<Self::Result, ResponseError>> {
        async move { backend.prepare(params.targets).await.map(|()| VoidResponse) }.boxed()
    }
}

impl DispatchRequest for WaitForBuildSystemUpdates {
    fn dispatch(
        backend: Arc<dyn BuildBackend>,
        _params: Self::Params,
    ) -> BoxFuture<'static, Result<Self::Result, ResponseError>> {
        async move {
            backend.wait_for_build_system_updates().await;
            Ok(VoidResponse)
        }
        .boxed()
    }
}

impl DispatchNotification for OnBuildInitialized {
    fn dispatch(_backend: Arc<dyn BuildBackend>, _params: Self::Params) -> BoxFuture<'static, ()> {
        futures::future::ready(()).boxed()
    }
}

impl DispatchNotification for OnBuildExit {
    fn dispatch(_backend: Arc<dyn BuildBackend>, _params: Self::Params) -> BoxFuture<'static, ()> {
        futures::future::ready(()).boxed()
    }
}

impl DispatchNotification for DidChangeWatchedFiles {
    fn dispatch(backend: Arc<dyn BuildBackend>, params: Self::Params) -> BoxFuture<'static, ()> {
        async move { backend.did_change_watched_files(params.changes).await }.boxed()
    }
}

impl DispatchNotification for RegisterForChanges {
    fn dispatch(backend: Arc<dyn BuildBackend>, params: Self::Params) -> BoxFuture<'static, ()> {
        async move { backend.register_for_changes(params).await }.boxed()
    }
}
