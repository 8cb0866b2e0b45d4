//! Build server adapters.
//!
//! A [`BuildServerAdapter`] gives the build-settings manager one request/notification
//! interface over three kinds of backends:
//! - an in-process [`BuildBackend`] implementation,
//! - an external build server spoken to over `Content-Length` framed JSON-RPC
//!   ([`JsonRpcConnection`], usually on the stdio of a [`BuildServerProcess`]),
//! - an injected [`MessageHandler`] (tests and embedders).
//!
//! Messages the backend sends on its own (target changes, log messages, server requests)
//! are delivered in order on a [`ServerMessage`] channel owned by the caller.

mod adapter;
mod backend;
mod cancel;
mod connection;
mod discovery;
mod error;
mod framing;
mod legacy;
mod process;

pub use adapter::{BuildServerAdapter, DispatchNotification, DispatchRequest};
pub use backend::{initialize_result_for, BuildBackend, MessageHandler};
pub use cancel::CancelOnce;
pub use connection::{
    server_message_channel, JsonRpcConnection, ServerMessage, ServerMessageReceiver,
    ServerMessageSender, ServerResponder,
};
pub use discovery::BspConnectionConfig;
pub use error::TransportError;
pub use framing::{read_message, write_message, MAX_MESSAGE_BYTES};
pub use legacy::LegacyBuildServer;
pub use process::BuildServerProcess;

pub use keel_build_model::protocol;
pub use keel_build_model::ResponseError;

/// Name reported to backends during `build/initialize`.
pub const CLIENT_NAME: &str = "keel";

/// BSP version spoken by Keel.
pub const BSP_VERSION: &str = "2.2.0";
