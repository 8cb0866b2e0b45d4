use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use keel_build_model::protocol::{BuildNotification, CancelParams, CancelRequest, RequestId};
use keel_build_model::ResponseError;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::framing::{read_message, write_message};
use crate::{CancelOnce, TransportError};

/// A message the backend sent on its own initiative.
#[derive(Debug)]
pub enum ServerMessage {
    Notification {
        method: String,
        params: Value,
    },
    Request {
        id: RequestId,
        method: String,
        params: Value,
        responder: ServerResponder,
    },
    /// The transport closed; no further messages follow.
    Disconnected,
}

pub type ServerMessageSender = mpsc::UnboundedSender<ServerMessage>;
pub type ServerMessageReceiver = mpsc::UnboundedReceiver<ServerMessage>;

pub fn server_message_channel() -> (ServerMessageSender, ServerMessageReceiver) {
    mpsc::unbounded_channel()
}

/// Answers a backend-initiated request. Dropping it unanswered replies with an internal
/// error.
#[derive(Debug)]
pub struct ServerResponder {
    tx: oneshot::Sender<Result<Value, ResponseError>>,
}

impl ServerResponder {
    pub fn new() -> (Self, oneshot::Receiver<Result<Value, ResponseError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn respond(self, result: Result<Value, ResponseError>) {
        let _ = self.tx.send(result);
    }
}

type PendingResponse = oneshot::Sender<Result<Value, ResponseError>>;

struct ConnectionInner {
    next_id: AtomicI64,
    outgoing: mpsc::UnboundedSender<Value>,
    pending: Mutex<HashMap<RequestId, PendingResponse>>,
    closed: AtomicBool,
}

impl ConnectionInner {
    fn send(&self, message: Value) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        self.outgoing
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let mut message = json!({ "jsonrpc": "2.0", "method": method });
        if !params.is_null() {
            message["params"] = params;
        }
        self.send(message)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, tx) in pending {
            let _ = tx.send(Err(ResponseError::connection_closed()));
        }
    }
}

/// JSON-RPC 2.0 client over a `Content-Length` framed byte stream.
///
/// Requests are multiplexed; responses are matched by id. A request future that is dropped
/// before its response arrives sends `$/cancelRequest` exactly once.
#[derive(Clone)]
pub struct JsonRpcConnection {
    inner: Arc<ConnectionInner>,
}

impl JsonRpcConnection {
    /// Starts the read and write loops. Backend-initiated messages go to `incoming`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<R, W>(reader: R, writer: W, incoming: ServerMessageSender) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            next_id: AtomicI64::new(1),
            outgoing,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(write_loop(writer, outgoing_rx, Arc::downgrade(&inner)));
        tokio::spawn(read_loop(reader, Arc::downgrade(&inner), incoming));

        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ResponseError> {
        if self.is_closed() {
            return Err(ResponseError::connection_closed());
        }

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);

        let weak = Arc::downgrade(&self.inner);
        let cancel = CancelOnce::new(move |id| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.pending.lock().remove(&id);
            tracing::debug!(target = "keel.bsp", request_id = %id, "cancelling request");
            let params = serde_json::to_value(CancelParams { id }).unwrap_or(Value::Null);
            let _ = inner.notify(CancelRequest::METHOD, params);
        });
        cancel.register(id.clone());

        let mut message = json!({ "jsonrpc": "2.0", "id": id, "method": method });
        if !params.is_null() {
            message["params"] = params;
        }
        if let Err(err) = self.inner.send(message) {
            cancel.finish();
            self.inner.pending.lock().remove(&id);
            tracing::debug!(target = "keel.bsp", method, error = %err, "failed to send request");
            return Err(ResponseError::connection_closed());
        }

        let result = rx
            .await
            .unwrap_or_else(|_| Err(ResponseError::connection_closed()));
        cancel.finish();
        result
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        self.inner.notify(method, params)
    }

    /// Fails every pending request and rejects new messages.
    pub fn close(&self) {
        self.inner.close();
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<Value>,
    inner: Weak<ConnectionInner>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        if let Err(err) = write_message(&mut writer, &message).await {
            tracing::warn!(target = "keel.bsp", error = %err, "failed to write to build server");
            if let Some(inner) = inner.upgrade() {
                inner.close();
            }
            break;
        }
    }
}

async fn read_loop<R>(reader: R, inner: Weak<ConnectionInner>, incoming: ServerMessageSender)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let message = match read_message(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(target = "keel.bsp", "build server closed its output");
                break;
            }
            Err(err) => {
                tracing::error!(target = "keel.bsp", error = %err, "failed to read from build server");
                break;
            }
        };
        let Some(connection) = inner.upgrade() else {
            return;
        };
        dispatch_incoming(&connection, &incoming, message);
    }

    if let Some(inner) = inner.upgrade() {
        inner.close();
    }
    let _ = incoming.send(ServerMessage::Disconnected);
}

fn dispatch_incoming(inner: &Arc<ConnectionInner>, incoming: &ServerMessageSender, message: Value) {
    let id = message
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
    let method = message
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    match (id, method) {
        (Some(id), None) => {
            let Some(tx) = inner.pending.lock().remove(&id) else {
                tracing::debug!(target = "keel.bsp", request_id = %id, "response for unknown request");
                return;
            };
            let result = match message.get("error") {
                Some(error) => Err(serde_json::from_value::<ResponseError>(error.clone())
                    .unwrap_or_else(|err| {
                        ResponseError::internal(format!("malformed error response: {err}"))
                    })),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
        }
        (Some(id), Some(method)) => {
            let (responder, response) = ServerResponder::new();
            let weak = Arc::downgrade(inner);
            let response_id = id.clone();
            tokio::spawn(async move {
                let result = response.await.unwrap_or_else(|_| {
                    Err(ResponseError::internal("request dropped without a response"))
                });
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let message = match result {
                    Ok(result) => json!({ "jsonrpc": "2.0", "id": response_id, "result": result }),
                    Err(error) => json!({ "jsonrpc": "2.0", "id": response_id, "error": error }),
                };
                let _ = inner.send(message);
            });
            let _ = incoming.send(ServerMessage::Request {
                id,
                method,
                params,
                responder,
            });
        }
        (None, Some(method)) => {
            let _ = incoming.send(ServerMessage::Notification { method, params });
        }
        (None, None) => {
            tracing::error!(target = "keel.bsp", "malformed message from build server: {message}");
        }
    }
}
