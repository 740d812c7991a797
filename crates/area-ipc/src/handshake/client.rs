//! Client side of the handshake.
//!
//! [`HandshakingConnector::connect_to`] writes the advertisement, then waits
//! for the server's choice on a dedicated thread so the caller is never
//! blocked. The outcome is delivered through a [`PendingConnection`].

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::Waker;
use tracing::{debug, trace, warn};

use crate::completion::{self, Completer, Completion};
use crate::error::{Error, Result};
use crate::protocol::{self, ProtocolDescriptor, UUID_TEXT_LEN};
use crate::rpc::RpcChannel;
use crate::transport::{Observer, StreamTransport};

/// A protocol the client can speak, and how to build a channel for it.
pub trait ClientProtocol: Send + Sync {
    fn descriptor(&self) -> &ProtocolDescriptor;

    /// Take over a transport on which this protocol has been agreed.
    fn create_channel(&self, transport: StreamTransport) -> Result<RpcChannel>;
}

/// Negotiates a protocol over a freshly connected transport.
pub struct HandshakingConnector {
    protocols: Arc<Vec<Arc<dyn ClientProtocol>>>,
}

impl std::fmt::Debug for HandshakingConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<_> = self.protocols.iter().map(|p| p.descriptor().id()).collect();
        f.debug_struct("HandshakingConnector").field("protocols", &ids).finish()
    }
}

impl HandshakingConnector {
    /// `protocols` in order of preference, most preferred first.
    pub fn new(protocols: Vec<Arc<dyn ClientProtocol>>) -> Result<Self> {
        if protocols.is_empty() {
            return Err(Error::usage("at least one client protocol is required"));
        }
        Ok(Self {
            protocols: Arc::new(protocols),
        })
    }

    /// The advertisement frame this connector sends.
    pub fn client_header(&self) -> Result<Vec<u8>> {
        let descriptors: Vec<_> = self.protocols.iter().map(|p| p.descriptor()).collect();
        protocol::encode_client_header(&descriptors)
    }

    /// Start the handshake on `transport`.
    ///
    /// The advertisement is written before this returns; the server's reply
    /// is awaited in the background.
    pub fn connect_to(&self, transport: StreamTransport) -> Result<PendingConnection> {
        transport.send(&self.client_header()?, Vec::new())?;

        let canceller = transport.try_clone_socket()?;
        let waker = transport.waker();
        let (completer, completion) = completion::completion();
        let protocols = Arc::clone(&self.protocols);

        let thread = thread::Builder::new()
            .name("area-ipc/handshake".into())
            .spawn(move || negotiate(transport, &protocols, completer))
            .map_err(|e| Error::io("failed to spawn handshake thread", e))?;

        Ok(PendingConnection {
            completion: Some(completion),
            canceller,
            waker,
            thread: Some(thread),
        })
    }
}

#[derive(Default)]
struct ReplyWatcher {
    readable: AtomicBool,
    hung_up: AtomicBool,
}

impl Observer for ReplyWatcher {
    fn on_data_available(&self) {
        self.readable.store(true, Ordering::Release);
    }

    fn on_disconnected(&self) {
        self.hung_up.store(true, Ordering::Release);
    }
}

fn negotiate(
    transport: StreamTransport,
    protocols: &[Arc<dyn ClientProtocol>],
    completer: Completer<RpcChannel>,
) {
    let watcher = Arc::new(ReplyWatcher::default());
    let observer: Arc<dyn Observer> = watcher.clone();
    transport.register_observer(&observer);

    let chosen = loop {
        if completer.is_abandoned() {
            trace!("Handshake abandoned");
            return;
        }
        if let Err(e) = transport.wait_and_dispatch(None) {
            break Err(e);
        }
        if watcher.readable.load(Ordering::Acquire) {
            let mut reply = [0u8; UUID_TEXT_LEN];
            break transport
                .receive(&mut reply)
                .and_then(|()| protocol::parse_uuid_text(&reply));
        }
        if watcher.hung_up.load(Ordering::Acquire) {
            break Err(Error::Disconnected(
                "server closed the connection during the handshake".to_owned(),
            ));
        }
    };
    transport.unregister_observer(&observer);

    let result = chosen.and_then(|id| {
        let protocol = protocols
            .iter()
            .find(|p| p.descriptor().id() == id)
            .ok_or_else(|| Error::ProtocolMismatch(format!("server chose unsupported protocol {id}")))?;
        debug!(protocol = %id, "Handshake complete");
        protocol.create_channel(transport)
    });
    if let Err(e) = &result {
        debug!("Handshake failed: {}", e);
    }
    completer.complete(result);
}

/// A handshake in progress.
///
/// Dropping it before the handshake resolves cancels the negotiation: any
/// registered continuation receives [`Error::Cancelled`] and the background
/// thread is torn down before `drop` returns.
pub struct PendingConnection {
    completion: Option<Completion<RpcChannel>>,
    canceller: UnixStream,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnection")
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

impl PendingConnection {
    /// Run `continuation` with the channel (or the failure) once known.
    ///
    /// It runs immediately if the handshake has already resolved, otherwise
    /// on the handshake thread. Registering twice is a usage error.
    pub fn on_complete<F>(&mut self, continuation: F) -> Result<()>
    where
        F: FnOnce(Result<RpcChannel>) + Send + 'static,
    {
        match self.completion.as_mut() {
            Some(completion) => completion.on_complete(continuation),
            None => Err(Error::usage("handshake result already taken")),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.completion.as_ref().is_some_and(Completion::is_ready)
    }

    /// Block until the handshake resolves.
    pub fn wait(mut self) -> Result<RpcChannel> {
        match self.completion.take() {
            Some(completion) => completion.wait(),
            None => Err(Error::usage("handshake result already taken")),
        }
    }

    /// Block for at most `timeout`; on timeout the handshake is cancelled.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<RpcChannel> {
        let Some(completion) = self.completion.take() else {
            return Err(Error::usage("handshake result already taken"));
        };
        let result = completion.wait_timeout(timeout);
        if matches!(result, Err(Error::TimedOut(_))) {
            self.interrupt();
        }
        result
    }

    fn interrupt(&self) {
        if let Err(e) = self.canceller.shutdown(std::net::Shutdown::Both) {
            trace!("Handshake socket shutdown: {}", e);
        }
        if let Err(e) = self.waker.wake() {
            trace!("Failed to wake handshake thread: {}", e);
        }
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            if completion.cancel() {
                self.interrupt();
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!("Handshake thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcProtocol;
    use std::io::{Read, Write};
    use std::sync::Mutex;
    use std::sync::mpsc;
    use uuid::Uuid;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn rpc_protocol(id: &str, header: &[u8]) -> Arc<dyn ClientProtocol> {
        Arc::new(RpcProtocol::new(ProtocolDescriptor::new(
            Uuid::parse_str(id).unwrap(),
            header,
        )))
    }

    fn connect(protocols: Vec<Arc<dyn ClientProtocol>>) -> (PendingConnection, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        let connector = HandshakingConnector::new(protocols).unwrap();
        let pending = connector
            .connect_to(StreamTransport::new(client).unwrap())
            .unwrap();
        (pending, server)
    }

    fn read_advertisement(server: &mut UnixStream) -> Vec<u8> {
        let mut size = [0u8; 2];
        server.read_exact(&mut size).unwrap();
        let mut body = vec![0u8; u16::from_le_bytes(size) as usize];
        server.read_exact(&mut body).unwrap();
        body
    }

    const FIRST: &str = "be094b17-4ca0-40fd-9394-913a4aab05f0";
    const SECOND: &str = "eba0cf92-30c2-4375-9560-305f592a4161";

    #[test]
    fn test_writes_client_header() {
        let header = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02];
        let (_pending, mut server) = connect(vec![rpc_protocol(FIRST, &header)]);

        let mut sent = [0u8; 2 + 2 + 36 + 7];
        server.read_exact(&mut sent).unwrap();
        assert_eq!(&sent[..4], &[0x2d, 0x00, 0x2b, 0x00]);
        assert_eq!(&sent[4..40], FIRST.as_bytes());
        assert_eq!(&sent[40..], &header);
    }

    #[test]
    fn test_selects_protocol_named_by_server() {
        let (pending, mut server) = connect(vec![
            rpc_protocol(FIRST, &[]),
            rpc_protocol(SECOND, &[]),
        ]);
        read_advertisement(&mut server);
        server.write_all(SECOND.as_bytes()).unwrap();

        let channel = pending.wait_timeout(TIMEOUT).unwrap();
        assert_eq!(channel.protocol_id(), Uuid::parse_str(SECOND).unwrap());
    }

    #[test]
    fn test_unknown_server_choice_is_mismatch() {
        let (pending, mut server) = connect(vec![rpc_protocol(FIRST, &[])]);
        read_advertisement(&mut server);
        server.write_all(SECOND.as_bytes()).unwrap();

        assert!(matches!(
            pending.wait_timeout(TIMEOUT),
            Err(Error::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn test_server_hang_up_is_disconnect() {
        let (pending, mut server) = connect(vec![rpc_protocol(FIRST, &[])]);
        read_advertisement(&mut server);
        drop(server);

        assert!(pending.wait_timeout(TIMEOUT).unwrap_err().is_disconnect());
    }

    #[test]
    fn test_continuation_registered_before_and_after_resolution() {
        let (mut pending, mut server) = connect(vec![rpc_protocol(FIRST, &[])]);
        let (tx, rx) = mpsc::channel();
        pending
            .on_complete(move |result| tx.send(result.is_ok()).unwrap())
            .unwrap();
        assert!(matches!(pending.on_complete(|_| {}), Err(Error::Usage(_))));

        read_advertisement(&mut server);
        server.write_all(FIRST.as_bytes()).unwrap();
        assert!(rx.recv_timeout(TIMEOUT).unwrap());

        let (mut pending, mut server) = connect(vec![rpc_protocol(FIRST, &[])]);
        read_advertisement(&mut server);
        server.write_all(FIRST.as_bytes()).unwrap();
        while !pending.is_ready() {
            thread::sleep(Duration::from_millis(5));
        }
        let (tx, rx) = mpsc::channel();
        pending
            .on_complete(move |result| tx.send(result.is_ok()).unwrap())
            .unwrap();
        assert!(rx.recv_timeout(TIMEOUT).unwrap());
    }

    #[test]
    fn test_dropping_unresolved_handshake_cancels_continuation() {
        let (mut pending, _server) = connect(vec![rpc_protocol(FIRST, &[])]);
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        pending
            .on_complete(move |result| {
                sink.lock().unwrap().push(matches!(result, Err(Error::Cancelled)));
            })
            .unwrap();

        drop(pending);
        assert_eq!(*outcomes.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_wait_timeout_tears_down_handshake() {
        let (pending, _server) = connect(vec![rpc_protocol(FIRST, &[])]);
        let err = pending.wait_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)));
    }

    #[test]
    fn test_requires_a_protocol() {
        assert!(matches!(
            HandshakingConnector::new(Vec::new()),
            Err(Error::Usage(_))
        ));
    }
}
