//! Connection acceptor.
//!
//! A [`PublishedSocketConnector`] listens on a Unix socket path, accepts
//! clients on the tokio runtime it is started on and runs each one through
//! the server handshake. Pre-connected clients can also be created directly
//! with [`client_socket_fd`](PublishedSocketConnector::client_socket_fd).

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::handshake::server::{ConnectHandler, ConnectionContext, HandshakingConnectionCreator};
use crate::report::ConnectorReport;
use crate::transport::abstract_name;

/// Back-off after a failed `accept`, so descriptor exhaustion does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

struct Running {
    handle: Handle,
    accept_loop: JoinHandle<()>,
}

pub struct PublishedSocketConnector {
    path: PathBuf,
    owns_file: bool,
    listener: StdUnixListener,
    creator: Arc<HandshakingConnectionCreator>,
    report: Arc<dyn ConnectorReport>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for PublishedSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedSocketConnector")
            .field("path", &self.path)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PublishedSocketConnector {
    /// Bind `path`, replacing a stale socket file left by a dead server.
    ///
    /// Paths starting with `@` bind in the abstract namespace.
    pub fn bind(
        path: impl AsRef<Path>,
        creator: HandshakingConnectionCreator,
        report: Arc<dyn ConnectorReport>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (listener, owns_file) = match abstract_name(&path) {
            Some(name) => {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)
                    .map_err(|e| Error::io("invalid abstract socket name", e))?;
                let listener = StdUnixListener::bind_addr(&addr)
                    .map_err(|e| Error::io("failed to bind abstract socket", e))?;
                (listener, false)
            }
            None => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::io("failed to create socket directory", e))?;
                }
                remove_if_stale(&path)?;
                let listener = StdUnixListener::bind(&path)
                    .map_err(|e| Error::io("failed to bind server socket", e))?;
                (listener, true)
            }
        };
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::io("failed to make listener non-blocking", e))?;

        report.listening_on(&path);
        Ok(Self {
            path,
            owns_file,
            listener,
            creator: Arc::new(creator),
            report,
            running: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start accepting on the current tokio runtime.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|_| Error::usage("connector must be started inside a tokio runtime"))?;
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Ok(());
        }

        let listener = {
            let _enter = handle.enter();
            let std_listener = self
                .listener
                .try_clone()
                .map_err(|e| Error::io("failed to duplicate listener", e))?;
            UnixListener::from_std(std_listener)
                .map_err(|e| Error::io("failed to register listener", e))?
        };
        let accept_loop = handle.spawn(accept_loop(
            listener,
            Arc::clone(&self.creator),
            Arc::clone(&self.report),
        ));

        info!(socket_path = %self.path.display(), "Connector started");
        *running = Some(Running {
            handle,
            accept_loop,
        });
        Ok(())
    }

    /// Stop accepting. Established sessions are left running.
    pub fn stop(&self) {
        let stopped = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(running) = stopped {
            running.accept_loop.abort();
            info!(socket_path = %self.path.display(), "Connector stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Create a session over a fresh socket pair and return the client end.
    ///
    /// The client must still perform the handshake on the returned socket.
    pub fn client_socket_fd(&self, connect_handler: Option<ConnectHandler>) -> Result<OwnedFd> {
        let handle = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|running| running.handle.clone())
            .ok_or_else(|| Error::usage("connector is not running"))?;

        let (server, client) =
            StdUnixStream::pair().map_err(|e| Error::io("could not create socket pair", e))?;
        server
            .set_nonblocking(true)
            .map_err(|e| Error::io("failed to make socket non-blocking", e))?;
        self.report.creating_socket_pair();

        let context = match connect_handler {
            Some(handler) => ConnectionContext::with_connect_handler(handler),
            None => ConnectionContext::new(),
        };
        let creator = Arc::clone(&self.creator);
        let report = Arc::clone(&self.report);
        handle.spawn(async move {
            let result = match UnixStream::from_std(server) {
                Ok(stream) => creator.create_connection_for(stream, context).await,
                Err(e) => Err(Error::io("failed to register socket pair", e)),
            };
            if let Err(e) = result {
                report.handshake_failed(&e);
            }
        });

        Ok(OwnedFd::from(client))
    }
}

impl Drop for PublishedSocketConnector {
    fn drop(&mut self) {
        self.stop();
        if self.owns_file {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(socket_path = %self.path.display(), "Removed socket file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => debug!(socket_path = %self.path.display(), "Failed to remove socket file: {}", e),
            }
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    creator: Arc<HandshakingConnectionCreator>,
    report: Arc<dyn ConnectorReport>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                report.creating_session_for(&format!("fd {}", stream.as_raw_fd()));
                let creator = Arc::clone(&creator);
                let report = Arc::clone(&report);
                tokio::spawn(async move {
                    if let Err(e) = creator
                        .create_connection_for(stream, ConnectionContext::new())
                        .await
                    {
                        report.handshake_failed(&e);
                    }
                });
            }
            Err(e) => {
                report.accept_error(&e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Remove `path` if it is a socket nobody is listening on.
fn remove_if_stale(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io("failed to stat socket path", e)),
    };
    if !metadata.file_type().is_socket() {
        return Err(Error::io(
            "refusing to replace socket path",
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists but is not a socket", path.display()),
            ),
        ));
    }
    if socket_in_use(path) {
        return Ok(());
    }
    std::fs::remove_file(path).map_err(|e| Error::io("failed removing stale socket file", e))?;
    debug!(socket_path = %path.display(), "Removed stale socket file");
    Ok(())
}

/// Whether some process still has `path` bound, per `/proc/net/unix`.
///
/// If the table cannot be read the socket is assumed to be in use.
fn socket_in_use(path: &Path) -> bool {
    let Ok(table) = std::fs::read_to_string("/proc/net/unix") else {
        return true;
    };
    let needle = format!(" {}", path.display());
    table.lines().any(|line| line.ends_with(&needle))
}
