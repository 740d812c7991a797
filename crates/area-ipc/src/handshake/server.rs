//! Server side of the handshake.
//!
//! Runs on the acceptor's tokio runtime. The whole advertisement must arrive
//! within the handshake deadline; after that the server names its choice
//! and hands a blocking socket to the chosen protocol's interpreter.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{self, Advertisement, ProtocolDescriptor};
use crate::session::Session;

/// Called with every session created for a connection.
pub type ConnectHandler = Arc<dyn Fn(Arc<Session>) + Send + Sync>;

/// Per-connection values passed from the acceptor to the interpreter.
#[derive(Clone, Default)]
pub struct ConnectionContext {
    connect_handler: Option<ConnectHandler>,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("connect_handler", &self.connect_handler.is_some())
            .finish()
    }
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_handler(handler: ConnectHandler) -> Self {
        Self {
            connect_handler: Some(handler),
        }
    }

    /// Tell the embedding server about a new session.
    pub fn handle_connect(&self, session: &Arc<Session>) {
        if let Some(handler) = &self.connect_handler {
            handler(Arc::clone(session));
        }
    }
}

/// A protocol the server speaks, and how to serve a connection with it.
pub trait ServerProtocol: Send + Sync {
    fn descriptor(&self) -> &ProtocolDescriptor;

    /// Take over a socket on which this protocol has been agreed.
    fn create_connection_for(
        &self,
        socket: std::os::unix::net::UnixStream,
        context: ConnectionContext,
    ) -> Result<()>;
}

/// Classifies new connections by the protocol their client asks for.
pub struct HandshakingConnectionCreator {
    protocols: Vec<Arc<dyn ServerProtocol>>,
    timeout: Duration,
}

impl std::fmt::Debug for HandshakingConnectionCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<_> = self.protocols.iter().map(|p| p.descriptor().id()).collect();
        f.debug_struct("HandshakingConnectionCreator")
            .field("protocols", &ids)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HandshakingConnectionCreator {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

    pub fn new(protocols: Vec<Arc<dyn ServerProtocol>>) -> Self {
        Self {
            protocols,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Deadline for receiving the client's advertisement.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Negotiate on `socket` and hand it to the chosen protocol.
    pub async fn create_connection_for(
        &self,
        mut socket: UnixStream,
        context: ConnectionContext,
    ) -> Result<()> {
        let body = tokio::time::timeout(self.timeout, read_advertisement(&mut socket))
            .await
            .map_err(|_| {
                Error::TimedOut(format!(
                    "client did not send its handshake within {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        let advertised = protocol::parse_client_header(&body)?;
        let chosen = self.select(&advertised)?;
        let descriptor = chosen.descriptor();
        debug!(protocol = %descriptor.id(), "Client protocol selected");

        socket
            .write_all(&descriptor.uuid_text())
            .await
            .map_err(|e| stream_error("failed to send handshake reply", e))?;

        let socket = socket
            .into_std()
            .map_err(|e| Error::io("failed to detach client socket", e))?;
        socket
            .set_nonblocking(false)
            .map_err(|e| Error::io("failed to make client socket blocking", e))?;
        chosen.create_connection_for(socket, context)
    }

    /// Most preferred server protocol that the client also advertised.
    fn select(&self, advertised: &[Advertisement]) -> Result<&Arc<dyn ServerProtocol>> {
        for protocol in &self.protocols {
            let Some(offer) = advertised.iter().find(|a| a.id == protocol.descriptor().id()) else {
                continue;
            };
            let expected = protocol.descriptor().header_size();
            if offer.header.len() != expected {
                return Err(Error::violation(format!(
                    "protocol {} expects a {expected} byte client header, client advertised {} bytes",
                    offer.id,
                    offer.header.len()
                )));
            }
            return Ok(protocol);
        }
        Err(Error::ProtocolMismatch("no matching protocols found".to_owned()))
    }
}

async fn read_advertisement(socket: &mut UnixStream) -> Result<Vec<u8>> {
    let mut size = [0u8; 2];
    socket
        .read_exact(&mut size)
        .await
        .map_err(|e| stream_error("failed to read handshake size", e))?;

    let mut body = vec![0u8; usize::from(u16::from_le_bytes(size))];
    socket
        .read_exact(&mut body)
        .await
        .map_err(|e| stream_error("failed to read handshake", e))?;
    Ok(body)
}

fn stream_error(context: &'static str, error: io::Error) -> Error {
    match error.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
            Error::Disconnected(format!("{context}: client went away"))
        }
        _ => Error::io(context, error),
    }
}
