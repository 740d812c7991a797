//! Client RPC channel.
//!
//! An [`RpcChannel`] owns a transport that has completed the handshake. Calls
//! get a fresh request id and a [`Completion`] for the reply; a background
//! thread reads envelopes and routes each response to its pending call and
//! each event to the channel's event sink.
//!
//! Replies are delivered in arrival order, except that
//! [`process_next_request_first`](RpcChannel::process_next_request_first)
//! makes the next call's reply jump the queue: replies arriving before it
//! are held back, then released in their original order.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::completion::{self, Completer, Completion};
use crate::error::{Error, Result};
use crate::handshake::client::ClientProtocol;
use crate::protocol::ProtocolDescriptor;
use crate::transport::{Observer, StreamTransport};
use crate::wire::{self, Frame, FrameHeader, FrameKind};

/// Successful reply to a call.
#[derive(Debug)]
pub struct Response {
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl Response {
    /// Decode a JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::violation(format!("undecodable response: {e}")))
    }
}

/// Server-pushed message with no correlated request.
#[derive(Debug)]
pub struct Event {
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

type Delivery = (Completer<Response>, Result<Response>);

#[derive(Default)]
struct CallTable {
    next_id: u32,
    pending: HashMap<u32, Completer<Response>>,
    prioritise_next: bool,
    prioritised: Option<u32>,
    deferred: Vec<Delivery>,
    disconnected: bool,
}

impl CallTable {
    fn allocate_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.pending.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    /// Everything still owed to callers, deferred replies first.
    fn drain(&mut self, error: impl Fn() -> Error) -> Vec<Delivery> {
        self.prioritised = None;
        let mut deliveries = std::mem::take(&mut self.deferred);
        let mut rest: Vec<_> = self.pending.drain().collect();
        rest.sort_unstable_by_key(|(id, _)| *id);
        deliveries.extend(rest.into_iter().map(|(_, completer)| (completer, Err(error()))));
        deliveries
    }
}

struct ChannelInner {
    transport: StreamTransport,
    protocol: Uuid,
    send_lock: Mutex<()>,
    calls: Mutex<CallTable>,
    event_sink: Option<EventSink>,
    shutdown: AtomicBool,
}

impl ChannelInner {
    fn calls(&self) -> MutexGuard<'_, CallTable> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn route(&self, id: u32, result: Result<Response>) {
        let deliveries = {
            let mut calls = self.calls();
            let Some(completer) = calls.pending.remove(&id) else {
                drop(calls);
                self.fail(format!("response for unknown request id {id}"));
                return;
            };
            match calls.prioritised {
                Some(priority) if priority != id => {
                    trace!(id, priority, "Holding back response");
                    calls.deferred.push((completer, result));
                    return;
                }
                Some(_) => {
                    calls.prioritised = None;
                    let mut deliveries = vec![(completer, result)];
                    deliveries.append(&mut calls.deferred);
                    deliveries
                }
                None => vec![(completer, result)],
            }
        };
        deliver(deliveries);
    }

    /// Fatal protocol error: fail every call and drop the connection.
    fn fail(&self, reason: String) {
        warn!(protocol = %self.protocol, "Closing RPC channel: {}", reason);
        let deliveries = {
            let mut calls = self.calls();
            calls.disconnected = true;
            calls.drain(|| Error::ProtocolViolation(reason.clone()))
        };
        self.transport.shutdown();
        deliver(deliveries);
    }

    fn read_one(&self) -> Result<()> {
        let Frame {
            header,
            payload,
            fds,
        } = wire::read_frame(&self.transport)?;

        match header.kind()? {
            FrameKind::Response => self.route(header.id, Ok(Response { payload, fds })),
            FrameKind::Error => {
                let message = String::from_utf8_lossy(&payload).into_owned();
                self.route(header.id, Err(Error::Handler(message)));
            }
            FrameKind::Event => match &self.event_sink {
                Some(sink) => sink(Event { payload, fds }),
                None => trace!(len = payload.len(), "Dropping event, no sink installed"),
            },
            FrameKind::Request => {
                return Err(Error::violation("server sent a request envelope"));
            }
        }
        Ok(())
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    for (completer, result) in deliveries {
        completer.complete(result);
    }
}

impl Observer for ChannelInner {
    fn on_data_available(&self) {
        match self.read_one() {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {}
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn on_disconnected(&self) {
        debug!(protocol = %self.protocol, "RPC channel disconnected");
        let deliveries = {
            let mut calls = self.calls();
            calls.disconnected = true;
            calls.drain(|| Error::Disconnected("connection to server lost".to_owned()))
        };
        deliver(deliveries);
    }
}

/// Request/response channel to a server.
pub struct RpcChannel {
    inner: Arc<ChannelInner>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("protocol", &self.inner.protocol)
            .field("transport", &self.inner.transport)
            .finish_non_exhaustive()
    }
}

impl RpcChannel {
    /// Take over `transport` and start reading replies.
    pub fn new(transport: StreamTransport, protocol: Uuid, event_sink: Option<EventSink>) -> Result<Self> {
        let inner = Arc::new(ChannelInner {
            transport,
            protocol,
            send_lock: Mutex::new(()),
            calls: Mutex::new(CallTable::default()),
            event_sink,
            shutdown: AtomicBool::new(false),
        });
        let observer: Arc<dyn Observer> = inner.clone();
        inner.transport.register_observer(&observer);

        let reader = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("area-ipc/rpc".into())
            .spawn(move || {
                while !reader.shutdown.load(Ordering::Acquire) && !reader.transport.is_disconnected() {
                    if let Err(e) = reader.transport.wait_and_dispatch(None) {
                        reader.fail(e.to_string());
                        break;
                    }
                }
                trace!("RPC reader thread exiting");
            })
            .map_err(|e| Error::io("failed to spawn RPC reader thread", e))?;

        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    /// Id of the protocol negotiated for this channel.
    pub fn protocol_id(&self) -> Uuid {
        self.inner.protocol
    }

    pub fn call(&self, method: u32, payload: &[u8]) -> Completion<Response> {
        self.call_with_fds(method, payload, Vec::new())
    }

    /// JSON-encode `request` and call `method`.
    pub fn call_json<T: Serialize>(&self, method: u32, request: &T) -> Completion<Response> {
        match serde_json::to_vec(request) {
            Ok(payload) => self.call(method, &payload),
            Err(e) => completion::completed(Err(Error::usage(format!("unencodable request: {e}")))),
        }
    }

    /// Call `method`, passing `fds` alongside the request.
    pub fn call_with_fds(&self, method: u32, payload: &[u8], fds: Vec<OwnedFd>) -> Completion<Response> {
        let fd_count = fds.len();
        let (completer, completion) = completion::completion();

        let (id, header) = {
            let mut calls = self.inner.calls();
            // The mark belongs to this call even if it never reaches the wire.
            let prioritise = std::mem::take(&mut calls.prioritise_next);
            if calls.disconnected {
                return completion::completed(Err(Error::Disconnected(
                    "channel is closed".to_owned(),
                )));
            }
            let id = calls.allocate_id();
            let header = match FrameHeader::request(id, method, payload.len(), fd_count) {
                Ok(header) => header,
                Err(e) => return completion::completed(Err(e)),
            };
            if prioritise {
                calls.prioritised = Some(id);
            }
            calls.pending.insert(id, completer);
            (id, header)
        };
        trace!(id, method, "Sending request");

        let sent = {
            let _guard = self.inner.send_lock.lock().unwrap_or_else(|e| e.into_inner());
            wire::write_frame(&self.inner.transport, &header, payload, fds)
        };
        if let Err(e) = sent {
            let deliveries = {
                let mut calls = self.inner.calls();
                let mut deliveries: Vec<Delivery> = calls
                    .pending
                    .remove(&id)
                    .map(|completer| (completer, Err(e)))
                    .into_iter()
                    .collect();
                if calls.prioritised == Some(id) {
                    calls.prioritised = None;
                    deliveries.append(&mut calls.deferred);
                }
                deliveries
            };
            deliver(deliveries);
        }
        completion
    }

    /// Deliver the next call's reply before any reply still held back.
    pub fn process_next_request_first(&self) {
        self.inner.calls().prioritise_next = true;
    }

    /// Whether the connection to the server is gone.
    pub fn is_disconnected(&self) -> bool {
        self.inner.calls().disconnected
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.transport.shutdown();
        if let Err(e) = self.inner.transport.waker().wake() {
            trace!("Failed to wake RPC reader: {}", e);
        }
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!("RPC reader thread panicked");
            }
        }

        let deliveries = {
            let mut calls = self.inner.calls();
            calls.disconnected = true;
            calls.drain(|| Error::Cancelled)
        };
        deliver(deliveries);
    }
}

/// Client-side protocol interpreter producing [`RpcChannel`]s.
pub struct RpcProtocol {
    descriptor: ProtocolDescriptor,
    event_sink: Option<EventSink>,
}

impl RpcProtocol {
    pub fn new(descriptor: ProtocolDescriptor) -> Self {
        Self {
            descriptor,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }
}

impl ClientProtocol for RpcProtocol {
    fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    fn create_channel(&self, transport: StreamTransport) -> Result<RpcChannel> {
        RpcChannel::new(transport, self.descriptor.id(), self.event_sink.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// The server end of a channel, driven by hand.
    struct FakeServer {
        transport: StreamTransport,
    }

    impl FakeServer {
        fn next_request(&self) -> Frame {
            let frame = wire::read_frame(&self.transport).unwrap();
            assert_eq!(frame.header.kind().unwrap(), FrameKind::Request);
            frame
        }

        fn respond(&self, id: u32, payload: &[u8]) {
            let header = FrameHeader::response(id, payload.len(), 0).unwrap();
            wire::write_frame(&self.transport, &header, payload, Vec::new()).unwrap();
        }

        fn respond_with_fds(&self, id: u32, payload: &[u8], fds: Vec<OwnedFd>) {
            let header = FrameHeader::response(id, payload.len(), fds.len()).unwrap();
            wire::write_frame(&self.transport, &header, payload, fds).unwrap();
        }

        fn fail(&self, id: u32, message: &str) {
            let header = FrameHeader::error(id, message.len()).unwrap();
            wire::write_frame(&self.transport, &header, message.as_bytes(), Vec::new()).unwrap();
        }

        fn event(&self, payload: &[u8]) {
            let header = FrameHeader::event(payload.len(), 0).unwrap();
            wire::write_frame(&self.transport, &header, payload, Vec::new()).unwrap();
        }
    }

    fn channel_with_sink(sink: Option<EventSink>) -> (RpcChannel, FakeServer) {
        let (client, server) = UnixStream::pair().unwrap();
        let channel = RpcChannel::new(StreamTransport::new(client).unwrap(), Uuid::nil(), sink).unwrap();
        let server = FakeServer {
            transport: StreamTransport::new(server).unwrap(),
        };
        (channel, server)
    }

    fn channel() -> (RpcChannel, FakeServer) {
        channel_with_sink(None)
    }

    fn arrival_order(completions: Vec<(u32, Completion<Response>)>) -> mpsc::Receiver<u32> {
        let (tx, rx) = mpsc::channel();
        for (label, completion) in completions {
            let tx = tx.clone();
            completion
                .then(move |result| {
                    assert!(result.is_ok());
                    tx.send(label).unwrap();
                })
                .unwrap();
        }
        rx
    }

    #[test]
    fn test_call_round_trip() {
        let (channel, server) = channel();
        let completion = channel.call(3, b"ping");

        let request = server.next_request();
        assert_eq!(request.header.method, 3);
        assert_eq!(request.payload, b"ping");
        server.respond(request.header.id, b"pong");

        let response = completion.wait_timeout(TIMEOUT).unwrap();
        assert_eq!(response.payload, b"pong");
    }

    #[test]
    fn test_request_ids_increase() {
        let (channel, server) = channel();
        let _first = channel.call(1, b"a");
        let _second = channel.call(1, b"b");

        let first = server.next_request().header.id;
        let second = server.next_request().header.id;
        assert!(second > first);
    }

    #[test]
    fn test_error_reply_reaches_caller() {
        let (channel, server) = channel();
        let completion = channel.call(1, b"");
        let id = server.next_request().header.id;
        server.fail(id, "surface does not exist");

        let err = completion.wait_timeout(TIMEOUT).unwrap_err();
        assert!(matches!(err, Error::Handler(ref m) if m == "surface does not exist"));
    }

    #[test]
    fn test_replies_delivered_in_arrival_order() {
        let (channel, server) = channel();
        let a = channel.call(1, b"a");
        let b = channel.call(1, b"b");
        let id_a = server.next_request().header.id;
        let id_b = server.next_request().header.id;

        let order = arrival_order(vec![(1, a), (2, b)]);
        server.respond(id_b, b"");
        server.respond(id_a, b"");

        assert_eq!(order.recv_timeout(TIMEOUT).unwrap(), 2);
        assert_eq!(order.recv_timeout(TIMEOUT).unwrap(), 1);
    }

    #[test]
    fn test_prioritised_reply_jumps_the_queue() {
        let (channel, server) = channel();
        let earlier = channel.call(1, b"earlier");
        let earlier_id = server.next_request().header.id;

        channel.process_next_request_first();
        let urgent = channel.call(1, b"urgent");
        let urgent_id = server.next_request().header.id;

        let order = arrival_order(vec![(1, earlier), (2, urgent)]);
        server.respond(earlier_id, b"");
        assert!(order.recv_timeout(Duration::from_millis(100)).is_err());

        server.respond(urgent_id, b"");
        assert_eq!(order.recv_timeout(TIMEOUT).unwrap(), 2);
        assert_eq!(order.recv_timeout(TIMEOUT).unwrap(), 1);
    }

    #[test]
    fn test_rejected_call_consumes_priority_mark() {
        let (channel, server) = channel();
        let earlier = channel.call(1, b"earlier");
        let earlier_id = server.next_request().header.id;

        channel.process_next_request_first();
        let oversized = vec![0u8; wire::MAX_MESSAGE_SIZE + 1];
        let rejected = channel.call(1, &oversized).wait_timeout(TIMEOUT).unwrap_err();
        assert!(matches!(rejected, Error::ProtocolViolation(_)));

        let later = channel.call(1, b"later");
        let later_id = server.next_request().header.id;

        server.respond(earlier_id, b"first");
        let response = earlier.wait_timeout(TIMEOUT).unwrap();
        assert_eq!(response.payload, b"first");

        server.respond(later_id, b"second");
        assert_eq!(later.wait_timeout(TIMEOUT).unwrap().payload, b"second");
    }

    #[test]
    fn test_held_back_reply_keeps_its_descriptors() {
        let (channel, server) = channel();
        let earlier = channel.call(1, b"");
        let earlier_id = server.next_request().header.id;
        channel.process_next_request_first();
        let urgent = channel.call(1, b"");
        let urgent_id = server.next_request().header.id;

        let fds = (0..2)
            .map(|_| OwnedFd::from(tempfile::tempfile().unwrap()))
            .collect();
        server.respond_with_fds(earlier_id, b"buffer", fds);
        server.respond(urgent_id, b"");

        assert!(urgent.wait_timeout(TIMEOUT).is_ok());
        let response = earlier.wait_timeout(TIMEOUT).unwrap();
        assert_eq!(response.payload, b"buffer");
        assert_eq!(response.fds.len(), 2);
    }

    #[test]
    fn test_events_go_to_sink() {
        let (tx, rx) = mpsc::channel();
        let sink: EventSink = Arc::new(move |event: Event| {
            tx.send(event.payload).unwrap();
        });
        let (_channel, server) = channel_with_sink(Some(sink));

        server.event(b"focus-changed");
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), b"focus-changed");
    }

    #[test]
    fn test_disconnect_fails_pending_calls() {
        let (channel, server) = channel();
        let first = channel.call(1, b"");
        let second = channel.call(1, b"");
        drop(server);

        assert!(first.wait_timeout(TIMEOUT).unwrap_err().is_disconnect());
        assert!(second.wait_timeout(TIMEOUT).unwrap_err().is_disconnect());

        let later = channel.call(1, b"");
        assert!(later.wait_timeout(TIMEOUT).unwrap_err().is_disconnect());
        assert!(channel.is_disconnected());
    }

    #[test]
    fn test_unknown_response_id_closes_channel() {
        let (channel, server) = channel();
        let pending = channel.call(1, b"");
        server.next_request();
        server.respond(4242, b"");

        assert!(matches!(
            pending.wait_timeout(TIMEOUT),
            Err(Error::ProtocolViolation(ref m)) if m.contains("4242")
        ));
    }

    #[test]
    fn test_dropping_channel_completes_every_call_once() {
        let (channel, _server) = channel();
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            channel
                .call(1, b"")
                .then(move |result| tx.send(result.is_err()).unwrap())
                .unwrap();
        }
        drop(tx);
        drop(channel);

        let outcomes: Vec<bool> = rx.iter().collect();
        assert_eq!(outcomes, vec![true, true, true]);
    }
}
