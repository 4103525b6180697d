//! Trait-based and map-based ways to implement a [`Service`].
//!
//! [`ServerHandler`] and [`ClientHandler`] give one overridable method
//! per protocol operation, with defaults that answer
//! `MethodNotFound`. [`router::MethodRouter`] instead dispatches on the
//! wire method name at runtime, for hosts that register handlers
//! dynamically.
//!
//! [`Service`]: crate::service::Service

pub mod router;

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::ClientHandler;

#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::ServerHandler;
