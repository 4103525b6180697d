#![cfg_attr(docsrs, feature(doc_cfg))]
//! A Model Context Protocol runtime: a bidirectional JSON-RPC 2.0
//! service core with request correlation, cancellation, timeouts,
//! progress and capability gating, plus streamable HTTP and legacy SSE
//! transports and an OAuth 2.1 client.
//!
//! The session runtime lives in [`service`]; implement a
//! [`ServerHandler`] or [`ClientHandler`] (or register handlers on a
//! [`handler::router::MethodRouter`]) and connect it to a transport
//! with [`ServiceExt::serve`].

mod error;
pub use error::{ErrorData, McplexError};

/// Basic data types of the protocol
pub mod model;
#[cfg(any(feature = "client", feature = "server"))]
pub mod service;
#[cfg(any(feature = "client", feature = "server"))]
pub use service::{CancelSignal, Peer, Service, ServiceError, ServiceExt};
#[cfg(feature = "client")]
pub use service::{RoleClient, serve_client};
#[cfg(feature = "server")]
pub use service::{RoleServer, serve_server};

#[cfg(any(feature = "client", feature = "server"))]
pub mod handler;
#[cfg(feature = "client")]
pub use handler::ClientHandler;
#[cfg(feature = "server")]
pub use handler::ServerHandler;

#[cfg(any(feature = "client", feature = "server"))]
pub mod transport;

// re-export
pub use serde;
pub use serde_json;
