//! Area IPC
//!
//! Client/server connection layer for the Area display server: a Unix
//! socket transport with a descriptor side channel, protocol negotiation,
//! a request/response/event RPC channel for clients, and request dispatch
//! plus connection acceptance for the server.
//!
//! Clients connect with [`StreamTransport::connect`], negotiate through a
//! [`HandshakingConnector`] and talk over the resulting [`RpcChannel`].
//! Servers publish a [`PublishedSocketConnector`] whose
//! [`HandshakingConnectionCreator`] hands each client to an
//! [`RpcServerProtocol`], which serves it with a [`MethodTable`].

pub mod completion;
pub mod connector;
pub mod error;
mod fd;
pub mod handshake;
pub mod processor;
pub mod protocol;
pub mod report;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod wire;

pub use completion::{Completer, Completion};
pub use connector::PublishedSocketConnector;
pub use error::{Error, Result};
pub use handshake::{
    ClientProtocol, ConnectHandler, ConnectionContext, HandshakingConnectionCreator,
    HandshakingConnector, PendingConnection, ServerProtocol,
};
pub use processor::{Done, HandlerError, MessageProcessor, MethodTable, ResourceCache};
pub use protocol::ProtocolDescriptor;
pub use report::{ConnectorReport, MessageProcessorReport, TracingReport};
pub use rpc::{Event, EventSink, Response, RpcChannel, RpcProtocol};
pub use session::{RpcServerProtocol, Session};
pub use transport::{Observer, StreamTransport};

/// File name of the default server socket.
pub const SOCKET_NAME: &str = "area_socket";

/// Default server socket path: `$XDG_RUNTIME_DIR/area_socket`.
pub fn socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    std::path::PathBuf::from(runtime_dir).join(SOCKET_NAME)
}
