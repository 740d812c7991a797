//! Stream transport over a Unix domain socket.
//!
//! A [`StreamTransport`] owns one connected `SOCK_STREAM` socket. Reads and
//! writes are blocking; readiness is reported through [`Observer`]s whenever
//! the owning event loop calls [`StreamTransport::dispatch`].
//!
//! Readiness comes from an edge-triggered `mio::Poll`. Each dispatch consumes
//! one edge and re-arms the registration, so a reader that leaves data queued
//! is told about it again on the next dispatch.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::fd::{self, CodecError};

const SOCKET: Token = Token(0);
const WAKE: Token = Token(1);

/// Receives readiness notifications from a transport.
///
/// Callbacks run on whichever thread calls [`StreamTransport::dispatch`] (or
/// on a thread whose read hits end-of-stream); implementations must do their
/// own synchronisation.
pub trait Observer: Send + Sync {
    /// Unread data is queued on the socket.
    fn on_data_available(&self);

    /// The connection is gone. Raised at most once per transport.
    fn on_disconnected(&self);
}

struct PollState {
    poll: Poll,
    events: Events,
}

/// Duplex byte stream plus descriptor side channel.
///
/// Observers are held weakly; an observer that has been dropped is skipped.
/// Because [`dispatch`](Self::dispatch) borrows the transport, the transport
/// cannot be destroyed while one of its callbacks is running.
pub struct StreamTransport {
    socket: UnixStream,
    poll: Mutex<PollState>,
    registry: Registry,
    watch_fd: RawFd,
    waker: Arc<Waker>,
    observers: Mutex<Vec<Weak<dyn Observer>>>,
    disconnected: AtomicBool,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("socket", &self.socket.as_raw_fd())
            .field("watch_fd", &self.watch_fd)
            .finish_non_exhaustive()
    }
}

impl StreamTransport {
    /// Wrap an already-connected socket.
    pub fn new(socket: UnixStream) -> Result<Self> {
        socket
            .set_nonblocking(false)
            .map_err(|e| Error::io("failed to make socket blocking", e))?;

        let poll = Poll::new().map_err(|e| Error::io("failed to create readiness monitor", e))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| Error::io("failed to clone readiness registry", e))?;
        let raw = socket.as_raw_fd();
        registry
            .register(&mut SourceFd(&raw), SOCKET, Interest::READABLE)
            .map_err(|e| Error::io("failed to watch socket", e))?;
        let waker = Waker::new(&registry, WAKE)
            .map_err(|e| Error::io("failed to create transport waker", e))?;
        let watch_fd = poll.as_raw_fd();

        Ok(Self {
            socket,
            poll: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(4),
            }),
            registry,
            watch_fd,
            waker: Arc::new(waker),
            observers: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        })
    }

    /// Wrap an owned descriptor referring to a connected stream socket.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        Self::new(UnixStream::from(fd))
    }

    /// Connect to a server socket.
    ///
    /// Paths starting with `@` or NUL name the Linux abstract namespace.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let socket = match abstract_name(path) {
            Some(name) => {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)
                    .map_err(|e| Error::io("invalid abstract socket name", e))?;
                UnixStream::connect_addr(&addr)
            }
            None => UnixStream::connect(path),
        }
        .map_err(|e| Error::io("failed to connect to server socket", e))?;

        debug!(socket_path = %path.display(), "Connected to server socket");
        Self::new(socket)
    }

    pub fn register_observer(&self, observer: &Arc<dyn Observer>) {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.push(Arc::downgrade(observer));
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn Observer>) {
        let target = Arc::downgrade(observer);
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.retain(|candidate| !Weak::ptr_eq(candidate, &target));
    }

    /// Read exactly `buffer.len()` bytes.
    ///
    /// Descriptors arriving on this read are a usage error: the caller did
    /// not ask for them and they would otherwise be lost.
    pub fn receive(&self, buffer: &mut [u8]) -> Result<()> {
        if buffer.is_empty() {
            return Err(Error::usage("attempted to receive 0 bytes"));
        }
        fd::receive(self.socket.as_raw_fd(), buffer, 0)
            .map(|_| ())
            .map_err(|e| self.map_codec_error("failed to read message", e))
    }

    /// Read exactly `buffer.len()` bytes and exactly `expected_fds` descriptors.
    pub fn receive_with_fds(&self, buffer: &mut [u8], expected_fds: usize) -> Result<Vec<OwnedFd>> {
        if buffer.is_empty() {
            return Err(Error::usage("attempted to receive 0 bytes"));
        }
        fd::receive(self.socket.as_raw_fd(), buffer, expected_fds)
            .map_err(|e| self.map_codec_error("failed to read message", e))
    }

    /// Write all of `buffer`, passing `fds` with the same write.
    ///
    /// The descriptors are closed locally once the kernel has taken its copy.
    pub fn send(&self, buffer: &[u8], fds: Vec<OwnedFd>) -> Result<()> {
        if buffer.is_empty() && !fds.is_empty() {
            return Err(Error::usage("descriptors must accompany at least one byte"));
        }
        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        fd::send(self.socket.as_raw_fd(), buffer, &raw)
            .map_err(|e| self.map_codec_error("failed to send message", e))
    }

    /// Descriptor that polls readable while a readiness edge is pending.
    pub fn watch_fd(&self) -> RawFd {
        self.watch_fd
    }

    /// Waker that interrupts a blocked [`wait_and_dispatch`](Self::wait_and_dispatch).
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Process at most one pending readiness edge without blocking.
    pub fn dispatch(&self) -> Result<()> {
        self.wait_and_dispatch(Some(Duration::ZERO))
    }

    /// Block until a readiness edge (or a wake-up) arrives, then process it.
    ///
    /// A hang-up with unread data left raises "data available" first and
    /// leaves the hang-up for a later call; a hang-up with nothing left to
    /// read raises "disconnected" and stops watching the socket.
    pub fn wait_and_dispatch(&self, timeout: Option<Duration>) -> Result<()> {
        let Some((readable, hung_up)) = self.next_socket_event(timeout)? else {
            return Ok(());
        };
        trace!(readable, hung_up, "Transport readiness");

        if hung_up {
            if readable && fd::has_pending_data(self.socket.as_raw_fd()) {
                self.notify_data_available();
                self.rearm();
                return Ok(());
            }
            self.stop_watching();
            self.notify_disconnected();
        } else if readable {
            self.notify_data_available();
            self.rearm();
        }
        Ok(())
    }

    /// Shut down both directions; blocked readers see end-of-stream.
    pub fn shutdown(&self) {
        if let Err(e) = self.socket.shutdown(std::net::Shutdown::Both) {
            trace!("Socket shutdown: {}", e);
        }
    }

    /// Whether "disconnected" has been raised.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// A second handle on the socket, used to cancel blocked reads.
    pub(crate) fn try_clone_socket(&self) -> Result<UnixStream> {
        self.socket
            .try_clone()
            .map_err(|e| Error::io("failed to duplicate socket", e))
    }

    fn next_socket_event(&self, timeout: Option<Duration>) -> Result<Option<(bool, bool)>> {
        let mut state = self.poll.lock().unwrap_or_else(|e| e.into_inner());
        let PollState { poll, events } = &mut *state;
        loop {
            match poll.poll(events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("failed to wait for socket readiness", e)),
            }
        }
        Ok(events
            .iter()
            .filter(|event| event.token() == SOCKET)
            .map(|event| {
                (
                    event.is_readable(),
                    event.is_read_closed() || event.is_error(),
                )
            })
            .next())
    }

    fn rearm(&self) {
        if self.is_disconnected() {
            return;
        }
        let raw = self.socket.as_raw_fd();
        if let Err(e) = self
            .registry
            .reregister(&mut SourceFd(&raw), SOCKET, Interest::READABLE)
        {
            warn!("Failed to re-arm socket readiness: {}", e);
        }
    }

    fn stop_watching(&self) {
        let raw = self.socket.as_raw_fd();
        if let Err(e) = self.registry.deregister(&mut SourceFd(&raw)) {
            trace!("Socket already deregistered: {}", e);
        }
    }

    fn map_codec_error(&self, context: &'static str, error: CodecError) -> Error {
        match error {
            CodecError::Closed => {
                self.notify_disconnected();
                Error::Disconnected(format!("{context}: peer has shut down"))
            }
            CodecError::Disconnected(errno) => {
                self.notify_disconnected();
                Error::Disconnected(format!("{context}: {errno}"))
            }
            CodecError::UnexpectedFds => Error::usage(format!("{context}: unexpectedly received fds")),
            CodecError::FdCountMismatch { expected, received } if received < expected => {
                Error::violation(format!(
                    "{context}: received fewer fds than expected ({received} < {expected})"
                ))
            }
            CodecError::FdCountMismatch { expected, received } => Error::violation(format!(
                "{context}: received more fds than expected ({received} > {expected})"
            )),
            CodecError::Os(errno) => Error::io(context, errno),
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn Observer>> {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    fn notify_data_available(&self) {
        for observer in self.live_observers() {
            observer.on_data_available();
        }
    }

    fn notify_disconnected(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(socket = self.socket.as_raw_fd(), "Transport disconnected");
        for observer in self.live_observers() {
            observer.on_disconnected();
        }
    }
}

/// Abstract-namespace name for `@name` / `\0name` paths.
pub(crate) fn abstract_name(path: &Path) -> Option<&[u8]> {
    use std::os::unix::ffi::OsStrExt;
    let bytes = path.as_os_str().as_bytes();
    match bytes.first() {
        Some(b'@') | Some(0) => Some(&bytes[1..]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    #[derive(Default)]
    struct CountingObserver {
        data: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn on_data_available(&self) {
            self.data.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnected(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn transport_pair() -> (Arc<StreamTransport>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Arc::new(StreamTransport::new(ours).unwrap()), theirs)
    }

    fn observe(transport: &StreamTransport) -> Arc<CountingObserver> {
        let observer = Arc::new(CountingObserver::default());
        let as_dyn: Arc<dyn Observer> = observer.clone();
        transport.register_observer(&as_dyn);
        observer
    }

    const WAIT: Option<Duration> = Some(Duration::from_secs(1));

    #[test]
    fn test_watch_fd_is_a_real_descriptor() {
        let (transport, _peer) = transport_pair();
        assert!(transport.watch_fd() >= 3);
    }

    #[test]
    fn test_does_not_notify_until_data_available() {
        let (transport, _peer) = transport_pair();
        let observer = observe(&transport);

        transport.dispatch().unwrap();
        assert_eq!(observer.data.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_notifies_on_data_available() {
        let (transport, mut peer) = transport_pair();
        let observer = observe(&transport);

        peer.write_all(b"ping").unwrap();
        transport.wait_and_dispatch(WAIT).unwrap();
        assert_eq!(observer.data.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_keeps_notifying_until_all_data_is_read() {
        let (transport, mut peer) = transport_pair();
        let observer = observe(&transport);

        peer.write_all(&[0u8; 8]).unwrap();
        let mut half = [0u8; 4];

        transport.wait_and_dispatch(WAIT).unwrap();
        transport.receive(&mut half).unwrap();
        transport.wait_and_dispatch(WAIT).unwrap();
        transport.receive(&mut half).unwrap();
        assert_eq!(observer.data.load(Ordering::SeqCst), 2);

        transport.dispatch().unwrap();
        assert_eq!(observer.data.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reads_and_writes_correct_data() {
        let (transport, mut peer) = transport_pair();
        let expected = b"I am the very model of a modern major general";

        peer.write_all(expected).unwrap();
        let mut received = vec![0u8; expected.len()];
        transport.receive(&mut received).unwrap();
        assert_eq!(&received, expected);

        transport.send(expected, Vec::new()).unwrap();
        let mut echoed = vec![0u8; expected.len()];
        peer.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, expected);
    }

    #[test]
    fn test_zero_length_read_is_usage_error() {
        let (transport, _peer) = transport_pair();
        assert!(matches!(transport.receive(&mut []), Err(Error::Usage(_))));
    }

    #[test]
    fn test_notices_remote_disconnect_once() {
        let (transport, peer) = transport_pair();
        let observer = observe(&transport);

        drop(peer);
        transport.wait_and_dispatch(WAIT).unwrap();
        transport.dispatch().unwrap();

        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(observer.data.load(Ordering::SeqCst), 0);
        assert!(transport.is_disconnected());
    }

    #[test]
    fn test_remaining_data_is_reported_before_disconnect() {
        let (transport, mut peer) = transport_pair();
        let observer = observe(&transport);

        peer.write_all(&0xdead_beef_u32.to_le_bytes()).unwrap();
        drop(peer);

        transport.wait_and_dispatch(WAIT).unwrap();
        assert_eq!(observer.data.load(Ordering::SeqCst), 1);
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 0);

        let mut word = [0u8; 4];
        transport.receive(&mut word).unwrap();
        transport.wait_and_dispatch(WAIT).unwrap();
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(observer.data.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_short_read_raises_disconnect() {
        let (transport, mut peer) = transport_pair();
        let observer = observe(&transport);

        peer.write_all(&[1, 2, 3, 4]).unwrap();
        drop(peer);

        let mut buffer = [0u8; 8];
        let err = transport.receive(&mut buffer).unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_to_closed_peer_fails() {
        let (transport, peer) = transport_pair();
        let observer = observe(&transport);
        drop(peer);

        let err = transport.send(&[0u8; 16], Vec::new()).unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fds_travel_with_data() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let sender = StreamTransport::new(ours).unwrap();
        let receiver = StreamTransport::new(theirs).unwrap();

        let file = tempfile::tempfile().unwrap();
        let dup = file.try_clone().unwrap();
        sender.send(b"abc", vec![OwnedFd::from(dup)]).unwrap();

        let mut buffer = [0u8; 3];
        let fds = receiver.receive_with_fds(&mut buffer, 1).unwrap();
        assert_eq!(&buffer, b"abc");
        assert_eq!(fds.len(), 1);

        let err = sender.send(&[], vec![OwnedFd::from(file)]).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn test_fd_count_mismatch_is_protocol_violation() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let sender = StreamTransport::new(ours).unwrap();
        let receiver = StreamTransport::new(theirs).unwrap();

        let fds = (0..2)
            .map(|_| OwnedFd::from(tempfile::tempfile().unwrap()))
            .collect();
        sender.send(b"abcd", fds).unwrap();

        let mut buffer = [0u8; 4];
        let err = receiver.receive_with_fds(&mut buffer, 5).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(ref m) if m.contains("fewer fds")));
    }

    #[test]
    fn test_surplus_fds_are_protocol_violation() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let sender = StreamTransport::new(ours).unwrap();
        let receiver = StreamTransport::new(theirs).unwrap();

        let fds = (0..4)
            .map(|_| OwnedFd::from(tempfile::tempfile().unwrap()))
            .collect();
        sender.send(b"abcd", fds).unwrap();

        let mut buffer = [0u8; 4];
        let err = receiver.receive_with_fds(&mut buffer, 1).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(ref m) if m.contains("more fds")));
    }

    #[test]
    fn test_unrequested_fds_are_usage_error() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let sender = StreamTransport::new(ours).unwrap();
        let receiver = StreamTransport::new(theirs).unwrap();

        sender
            .send(b"abcd", vec![OwnedFd::from(tempfile::tempfile().unwrap())])
            .unwrap();

        let mut buffer = [0u8; 4];
        let err = receiver.receive(&mut buffer).unwrap_err();
        assert!(matches!(err, Error::Usage(ref m) if m.contains("unexpectedly received fds")));
    }

    #[test]
    fn test_waker_interrupts_blocking_dispatch() {
        let (transport, _peer) = transport_pair();
        let waker = transport.waker();
        let (tx, rx) = mpsc::channel();

        let waiter = Arc::clone(&transport);
        let handle = thread::spawn(move || {
            waiter.wait_and_dispatch(None).unwrap();
            tx.send(()).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        waker.wake().unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_unregistered_observer_is_not_notified() {
        let (transport, mut peer) = transport_pair();
        let observer = observe(&transport);
        let as_dyn: Arc<dyn Observer> = observer.clone();
        transport.unregister_observer(&as_dyn);

        peer.write_all(b"x").unwrap();
        transport.wait_and_dispatch(WAIT).unwrap();
        assert_eq!(observer.data.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abstract_name_detection() {
        assert_eq!(abstract_name(Path::new("@area")), Some(&b"area"[..]));
        assert_eq!(abstract_name(Path::new("/run/area")), None);
    }
}
