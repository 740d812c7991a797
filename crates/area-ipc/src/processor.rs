//! Server-side request dispatch.
//!
//! A [`MessageProcessor`] decodes request envelopes, looks the selector up in
//! a [`MethodTable`] supplied by the embedding server and routes the result
//! back through a [`MessageSender`]. Handlers reply through a [`Done`]
//! handle, synchronously or later from another thread. Every request gets
//! exactly one answer: a handler that fails, or drops its `Done` without
//! replying, produces an error envelope instead.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::error::Result;
use crate::report::MessageProcessorReport;
use crate::wire::{Frame, FrameHeader, FrameKind};

/// Writes complete envelopes to one client.
///
/// Implementations write the header, the payload and then the descriptors
/// on the side channel without interleaving with other senders.
pub trait MessageSender: Send + Sync {
    fn send(&self, header: &FrameHeader, payload: &[u8], fds: Vec<OwnedFd>) -> Result<()>;
}

/// Failure reported by a method handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid request: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A decoded request.
#[derive(Debug)]
pub struct Invocation {
    pub id: u32,
    pub method: u32,
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

type Handler = Box<dyn Fn(Invocation, Responder) -> std::result::Result<(), HandlerError> + Send + Sync>;

struct Method {
    name: &'static str,
    ends_session: bool,
    handler: Handler,
}

/// Selector to handler mapping, fixed once the server starts.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<u32, Method>,
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.methods.iter().map(|(s, m)| (*s, m.name)).collect();
        names.sort_unstable();
        f.debug_struct("MethodTable").field("methods", &names).finish()
    }
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method whose request and reply are JSON-encoded.
    pub fn register<Req, Resp, F>(&mut self, selector: u32, name: &'static str, handler: F) -> &mut Self
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: Fn(Req, Vec<OwnedFd>, Done<Resp>) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(
            selector,
            name,
            Box::new(move |invocation, responder| {
                let request: Req = serde_json::from_slice(&invocation.payload)?;
                handler(request, invocation.fds, Done::new(responder, encode_json::<Resp>))
            }),
        )
    }

    /// Register a method that works on opaque payload bytes.
    pub fn register_raw<F>(&mut self, selector: u32, name: &'static str, handler: F) -> &mut Self
    where
        F: Fn(Vec<u8>, Vec<OwnedFd>, Done<Vec<u8>>) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(
            selector,
            name,
            Box::new(move |invocation, responder| {
                handler(invocation.payload, invocation.fds, Done::new(responder, Ok))
            }),
        )
    }

    /// Mark `selector` as ending the session once it has been dispatched.
    pub fn ends_session(&mut self, selector: u32) -> &mut Self {
        if let Some(method) = self.methods.get_mut(&selector) {
            method.ends_session = true;
        }
        self
    }

    pub fn name_of(&self, selector: u32) -> Option<&'static str> {
        self.methods.get(&selector).map(|m| m.name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    fn insert(&mut self, selector: u32, name: &'static str, handler: Handler) -> &mut Self {
        self.methods.insert(
            selector,
            Method {
                name,
                ends_session: false,
                handler,
            },
        );
        self
    }
}

fn encode_json<R: Serialize>(value: R) -> std::result::Result<Vec<u8>, HandlerError> {
    Ok(serde_json::to_vec(&value)?)
}

/// Keeps resources referenced by a response alive until its descriptors
/// have been written.
#[derive(Default)]
pub struct ResourceCache {
    resources: Mutex<HashMap<u32, Vec<Arc<dyn Any + Send + Sync>>>>,
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("responses", &self.held())
            .finish()
    }
}

impl ResourceCache {
    pub fn save_resource(&self, response: u32, resource: Arc<dyn Any + Send + Sync>) {
        let mut resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
        resources.entry(response).or_default().push(resource);
    }

    pub fn free_resource(&self, response: u32) {
        let released = {
            let mut resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
            resources.remove(&response)
        };
        drop(released);
    }

    /// Number of responses still holding resources.
    pub fn held(&self) -> usize {
        self.resources.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[derive(Default)]
struct ReplyState {
    replied: bool,
    in_handler: bool,
    dropped_unreplied: bool,
}

/// Sends the single answer for one request.
struct Responder {
    id: u32,
    session: u64,
    sender: Arc<dyn MessageSender>,
    resources: Arc<ResourceCache>,
    report: Arc<dyn MessageProcessorReport>,
    state: Arc<Mutex<ReplyState>>,
}

impl Responder {
    fn claim(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        !std::mem::replace(&mut state.replied, true)
    }

    fn send_response(&self, payload: Vec<u8>, fds: Vec<OwnedFd>) -> Result<()> {
        let header = match FrameHeader::response(self.id, payload.len(), fds.len()) {
            Ok(header) => header,
            Err(e) => {
                self.send_error(&e.to_string());
                return Err(e);
            }
        };
        let sent = self.sender.send(&header, &payload, fds);
        self.resources.free_resource(self.id);
        sent
    }

    fn send_error(&self, message: &str) {
        self.report.exception_handled(self.session, self.id, message);
        let sent = FrameHeader::error(self.id, message.len())
            .and_then(|header| self.sender.send(&header, message.as_bytes(), Vec::new()));
        self.resources.free_resource(self.id);
        if let Err(e) = sent {
            debug!(session = self.session, id = self.id, "Failed to send error response: {}", e);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        let orphaned = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.replied {
                false
            } else if state.in_handler {
                state.dropped_unreplied = true;
                false
            } else {
                state.replied = true;
                true
            }
        };
        if orphaned {
            self.send_error("request was dropped without a reply");
        }
    }
}

/// Reply handle given to a method handler. Consumed by the reply.
pub struct Done<R> {
    responder: Responder,
    encode: fn(R) -> std::result::Result<Vec<u8>, HandlerError>,
    _reply: PhantomData<fn(R)>,
}

impl<R> Done<R> {
    fn new(responder: Responder, encode: fn(R) -> std::result::Result<Vec<u8>, HandlerError>) -> Self {
        Self {
            responder,
            encode,
            _reply: PhantomData,
        }
    }

    pub fn id(&self) -> u32 {
        self.responder.id
    }

    pub fn reply(self, value: R) -> Result<()> {
        self.reply_with_fds(value, Vec::new())
    }

    /// Reply with descriptors; they follow the payload on the side channel.
    pub fn reply_with_fds(self, value: R, fds: Vec<OwnedFd>) -> Result<()> {
        if !self.responder.claim() {
            return Ok(());
        }
        match (self.encode)(value) {
            Ok(payload) => self.responder.send_response(payload, fds),
            Err(e) => {
                self.responder.send_error(&e.to_string());
                Ok(())
            }
        }
    }

    pub fn fail(self, message: impl AsRef<str>) {
        if self.responder.claim() {
            self.responder.send_error(message.as_ref());
        }
    }

    /// Hold `resource` until this reply's descriptors are on the wire.
    pub fn keep_alive(&self, resource: Arc<dyn Any + Send + Sync>) {
        self.responder.resources.save_resource(self.responder.id, resource);
    }
}

impl<R> std::fmt::Debug for Done<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Done").field("id", &self.responder.id).finish()
    }
}

/// Dispatches one session's requests.
pub struct MessageProcessor {
    session: u64,
    sender: Arc<dyn MessageSender>,
    methods: Arc<MethodTable>,
    resources: Arc<ResourceCache>,
    report: Arc<dyn MessageProcessorReport>,
}

impl std::fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("session", &self.session)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl MessageProcessor {
    pub fn new(
        session: u64,
        sender: Arc<dyn MessageSender>,
        methods: Arc<MethodTable>,
        report: Arc<dyn MessageProcessorReport>,
    ) -> Self {
        Self {
            session,
            sender,
            methods,
            resources: Arc::new(ResourceCache::default()),
            report,
        }
    }

    pub fn resource_cache(&self) -> &Arc<ResourceCache> {
        &self.resources
    }

    /// Handle one envelope read from the client.
    ///
    /// Returns `false` when no further requests should be processed.
    pub fn process_message(&self, frame: Frame) -> bool {
        match frame.header.kind() {
            Ok(FrameKind::Request) => self.dispatch(Invocation {
                id: frame.header.id,
                method: frame.header.method,
                payload: frame.payload,
                fds: frame.fds,
            }),
            _ => {
                self.report.exception_handled(
                    self.session,
                    frame.header.id,
                    "client sent a non-request envelope",
                );
                false
            }
        }
    }

    /// Run the handler for `invocation`.
    ///
    /// Unknown selectors get no reply and end processing; so does any method
    /// marked with [`MethodTable::ends_session`], after it has replied.
    pub fn dispatch(&self, invocation: Invocation) -> bool {
        let id = invocation.id;
        let selector = invocation.method;
        let name = self.methods.name_of(selector).unwrap_or("<unknown>");
        self.report.received_invocation(self.session, id, name);

        let keep_going = match self.methods.methods.get(&selector) {
            Some(method) => {
                self.invoke(method, invocation);
                !method.ends_session
            }
            None => {
                self.report.unknown_method(self.session, id, selector);
                false
            }
        };

        self.report.completed_invocation(self.session, id, keep_going);
        keep_going
    }

    /// Push an event envelope to the client.
    pub fn send_event(&self, payload: &[u8], fds: Vec<OwnedFd>) -> Result<()> {
        let header = FrameHeader::event(payload.len(), fds.len())?;
        self.sender.send(&header, payload, fds)
    }

    fn invoke(&self, method: &Method, invocation: Invocation) {
        let state = Arc::new(Mutex::new(ReplyState {
            in_handler: true,
            ..ReplyState::default()
        }));
        let responder = Responder {
            id: invocation.id,
            session: self.session,
            sender: Arc::clone(&self.sender),
            resources: Arc::clone(&self.resources),
            report: Arc::clone(&self.report),
            state: Arc::clone(&state),
        };
        let id = invocation.id;

        let outcome = (method.handler)(invocation, responder);

        let failure = {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_handler = false;
            let message = match outcome {
                _ if state.replied => None,
                Err(e) => Some(e.to_string()),
                Ok(()) if state.dropped_unreplied => Some("handler finished without a reply".to_owned()),
                Ok(()) => None,
            };
            if message.is_some() {
                state.replied = true;
            }
            message
        };

        if let Some(message) = failure {
            Responder::fallback(
                id,
                self.session,
                &self.sender,
                &self.resources,
                &self.report,
                &message,
            );
        }
    }
}

impl Responder {
    /// Error reply sent on behalf of a handler that no longer holds its `Done`.
    fn fallback(
        id: u32,
        session: u64,
        sender: &Arc<dyn MessageSender>,
        resources: &Arc<ResourceCache>,
        report: &Arc<dyn MessageProcessorReport>,
        message: &str,
    ) {
        let responder = Responder {
            id,
            session,
            sender: Arc::clone(sender),
            resources: Arc::clone(resources),
            report: Arc::clone(report),
            state: Arc::new(Mutex::new(ReplyState {
                replied: true,
                ..ReplyState::default()
            })),
        };
        responder.send_error(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::mpsc;
    use std::thread;

    #[derive(Debug)]
    struct Sent {
        kind: FrameKind,
        id: u32,
        payload: Vec<u8>,
        fd_count: usize,
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<Sent>>,
    }

    impl MessageSender for RecordingSender {
        fn send(&self, header: &FrameHeader, payload: &[u8], fds: Vec<OwnedFd>) -> Result<()> {
            assert_eq!(header.fd_count as usize, fds.len());
            self.sent.lock().unwrap().push(Sent {
                kind: header.kind().unwrap(),
                id: header.id,
                payload: payload.to_vec(),
                fd_count: fds.len(),
            });
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingReport {
        events: Mutex<Vec<String>>,
    }

    impl MessageProcessorReport for RecordingReport {
        fn received_invocation(&self, _: u64, id: u32, method: &str) {
            self.events.lock().unwrap().push(format!("received {id} {method}"));
        }
        fn completed_invocation(&self, _: u64, id: u32, keep_going: bool) {
            self.events.lock().unwrap().push(format!("completed {id} {keep_going}"));
        }
        fn unknown_method(&self, _: u64, id: u32, selector: u32) {
            self.events.lock().unwrap().push(format!("unknown {id} {selector}"));
        }
        fn exception_handled(&self, _: u64, id: u32, _: &str) {
            self.events.lock().unwrap().push(format!("exception {id}"));
        }
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Add {
        a: i32,
        b: i32,
    }

    const ADD: u32 = 1;
    const FAIL: u32 = 2;
    const LATER: u32 = 3;
    const FDS: u32 = 4;
    const FORGET: u32 = 5;
    const BYE: u32 = 6;

    struct Fixture {
        sender: Arc<RecordingSender>,
        report: Arc<RecordingReport>,
        processor: MessageProcessor,
        later: Arc<Mutex<Option<Done<i32>>>>,
    }

    fn fixture() -> Fixture {
        let later = Arc::new(Mutex::new(None));
        let parked = Arc::clone(&later);

        let mut methods = MethodTable::new();
        methods
            .register(ADD, "add", |req: Add, _fds, done: Done<i32>| {
                done.reply(req.a + req.b).map_err(|e| HandlerError::msg(e.to_string()))
            })
            .register(FAIL, "fail", |_: (), _fds, _done: Done<()>| {
                Err(HandlerError::msg("no buffers left"))
            })
            .register(LATER, "later", move |_: (), _fds, done: Done<i32>| {
                *parked.lock().unwrap() = Some(done);
                Ok(())
            })
            .register_raw(FDS, "fds", |payload, _fds, done| {
                let count = payload[0] as usize;
                let fds = (0..count)
                    .map(|_| OwnedFd::from(tempfile::tempfile().unwrap()))
                    .collect();
                done.reply_with_fds(Vec::new(), fds)
                    .map_err(|e| HandlerError::msg(e.to_string()))
            })
            .register(FORGET, "forget", |_: (), _fds, _done: Done<()>| Ok(()))
            .register(BYE, "disconnect", |_: (), _fds, done: Done<()>| {
                done.reply(()).map_err(|e| HandlerError::msg(e.to_string()))
            })
            .ends_session(BYE);

        let sender = Arc::new(RecordingSender::default());
        let report = Arc::new(RecordingReport::default());
        let processor = MessageProcessor::new(7, sender.clone(), Arc::new(methods), report.clone());
        Fixture {
            sender,
            report,
            processor,
            later,
        }
    }

    fn invocation(id: u32, method: u32, payload: &[u8]) -> Invocation {
        Invocation {
            id,
            method,
            payload: payload.to_vec(),
            fds: Vec::new(),
        }
    }

    #[test]
    fn test_typed_method_replies() {
        let f = fixture();
        let request = serde_json::to_vec(&Add { a: 2, b: 40 }).unwrap();

        assert!(f.processor.dispatch(invocation(1, ADD, &request)));

        let sent = f.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, FrameKind::Response);
        assert_eq!(sent[0].id, 1);
        assert_eq!(sent[0].payload, b"42");
        assert_eq!(
            *f.report.events.lock().unwrap(),
            vec!["received 1 add", "completed 1 true"]
        );
    }

    #[test]
    fn test_unknown_method_gets_no_reply_and_stops() {
        let f = fixture();
        assert!(!f.processor.dispatch(invocation(3, 99, b"")));

        assert!(f.sender.sent.lock().unwrap().is_empty());
        assert_eq!(
            *f.report.events.lock().unwrap(),
            vec!["received 3 <unknown>", "unknown 3 99", "completed 3 false"]
        );
    }

    #[test]
    fn test_handler_failure_becomes_error_reply() {
        let f = fixture();
        assert!(f.processor.dispatch(invocation(4, FAIL, b"null")));

        let sent = f.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, FrameKind::Error);
        assert_eq!(sent[0].payload, b"no buffers left");
        assert!(f.report.events.lock().unwrap().contains(&"exception 4".to_owned()));
    }

    #[test]
    fn test_undecodable_request_becomes_error_reply() {
        let f = fixture();
        assert!(f.processor.dispatch(invocation(5, ADD, b"{not json")));

        let sent = f.sender.sent.lock().unwrap();
        assert_eq!(sent[0].kind, FrameKind::Error);
        assert!(String::from_utf8_lossy(&sent[0].payload).starts_with("invalid request"));
    }

    #[test]
    fn test_reply_from_another_thread() {
        let f = fixture();
        assert!(f.processor.dispatch(invocation(6, LATER, b"null")));
        assert!(f.sender.sent.lock().unwrap().is_empty());

        let done = f.later.lock().unwrap().take().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            done.reply(5).unwrap();
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();

        let sent = f.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"5");
    }

    #[test]
    fn test_parked_reply_dropped_later_sends_error() {
        let f = fixture();
        f.processor.dispatch(invocation(8, LATER, b"null"));
        drop(f.later.lock().unwrap().take());

        let sent = f.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, FrameKind::Error);
    }

    #[test]
    fn test_handler_that_forgets_to_reply() {
        let f = fixture();
        assert!(f.processor.dispatch(invocation(9, FORGET, b"null")));

        let sent = f.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, FrameKind::Error);
        assert_eq!(sent[0].id, 9);
    }

    #[test]
    fn test_descriptors_follow_response() {
        let f = fixture();
        f.processor.dispatch(invocation(10, FDS, &[3]));

        let sent = f.sender.sent.lock().unwrap();
        assert_eq!(sent[0].kind, FrameKind::Response);
        assert_eq!(sent[0].fd_count, 3);
    }

    #[test]
    fn test_resources_released_after_reply() {
        let f = fixture();
        f.processor.dispatch(invocation(11, LATER, b"null"));
        let done = f.later.lock().unwrap().take().unwrap();

        let buffer: Arc<dyn Any + Send + Sync> = Arc::new(vec![0u8; 16]);
        done.keep_alive(Arc::clone(&buffer));
        assert_eq!(f.processor.resource_cache().held(), 1);
        assert_eq!(Arc::strong_count(&buffer), 2);

        done.reply(1).unwrap();
        assert_eq!(f.processor.resource_cache().held(), 0);
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[test]
    fn test_session_ending_method_still_replies() {
        let f = fixture();
        assert!(!f.processor.dispatch(invocation(12, BYE, b"null")));

        let sent = f.sender.sent.lock().unwrap();
        assert_eq!(sent[0].kind, FrameKind::Response);
        assert_eq!(sent[0].payload, b"null");
    }

    #[test]
    fn test_non_request_envelope_stops_processing() {
        let f = fixture();
        let frame = Frame {
            header: FrameHeader::event(0, 0).unwrap(),
            payload: Vec::new(),
            fds: Vec::new(),
        };
        assert!(!f.processor.process_message(frame));
    }

    #[test]
    fn test_send_event() {
        let f = fixture();
        f.processor.send_event(b"surface-changed", Vec::new()).unwrap();

        let sent = f.sender.sent.lock().unwrap();
        assert_eq!(sent[0].kind, FrameKind::Event);
        assert_eq!(sent[0].id, 0);
    }
}
