//! Protocol negotiation run at the start of every connection.
//!
//! The client advertises every protocol it can speak (see
//! [`crate::protocol`]); the server picks one, answers with its UUID and
//! hands the socket to that protocol's interpreter.

pub mod client;
pub mod server;

pub use client::{ClientProtocol, HandshakingConnector, PendingConnection};
pub use server::{ConnectHandler, ConnectionContext, HandshakingConnectionCreator, ServerProtocol};
