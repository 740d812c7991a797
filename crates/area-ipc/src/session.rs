//! Server-side protocol interpreter.
//!
//! Each connection that negotiates [`RpcServerProtocol`] becomes a
//! [`Session`] served by its own event-loop thread: the thread waits for
//! readiness on the session's transport, reads one envelope per
//! notification and feeds it to the session's [`MessageProcessor`].

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::handshake::server::{ConnectionContext, ServerProtocol};
use crate::processor::{MessageProcessor, MessageSender, MethodTable};
use crate::protocol::ProtocolDescriptor;
use crate::report::{MessageProcessorReport, TracingReport};
use crate::transport::{Observer, StreamTransport};
use crate::wire::{self, FrameHeader};

/// Serialises whole envelopes onto one transport.
struct TransportSender {
    transport: Arc<StreamTransport>,
    lock: Mutex<()>,
}

impl MessageSender for TransportSender {
    fn send(&self, header: &FrameHeader, payload: &[u8], fds: Vec<OwnedFd>) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        wire::write_frame(&self.transport, header, payload, fds)
    }
}

/// One connected client.
pub struct Session {
    id: u64,
    transport: Arc<StreamTransport>,
    processor: MessageProcessor,
    closing: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closing", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Push an event to the client.
    pub fn send_event(&self, payload: &[u8], fds: Vec<OwnedFd>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Disconnected(format!("session {} is closed", self.id)));
        }
        self.processor.send_event(payload, fds)
    }

    /// Stop serving the client and drop the connection.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.shutdown();
        if let Err(e) = self.transport.waker().wake() {
            debug!(session = self.id, "Failed to wake session thread: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.transport.is_disconnected()
    }

    fn run(self: Arc<Self>) {
        while !self.is_closed() {
            if let Err(e) = self.transport.wait_and_dispatch(None) {
                warn!(session = self.id, "Session event loop failed: {}", e);
                break;
            }
        }
        self.close();
        info!(session = self.id, "Session ended");
    }
}

impl Observer for Session {
    fn on_data_available(&self) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        match wire::read_frame(&self.transport) {
            Ok(frame) => {
                if !self.processor.process_message(frame) {
                    debug!(session = self.id, "Session finished by request");
                    self.close();
                }
            }
            Err(e) if e.is_disconnect() => {}
            Err(e) => {
                warn!(session = self.id, "Dropping client: {}", e);
                self.close();
            }
        }
    }

    fn on_disconnected(&self) {
        debug!(session = self.id, "Client disconnected");
    }
}

/// Serves connections with the RPC protocol.
pub struct RpcServerProtocol {
    descriptor: ProtocolDescriptor,
    methods: Arc<MethodTable>,
    report: Arc<dyn MessageProcessorReport>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for RpcServerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServerProtocol")
            .field("descriptor", &self.descriptor)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl RpcServerProtocol {
    pub fn new(descriptor: ProtocolDescriptor, methods: Arc<MethodTable>) -> Self {
        Self {
            descriptor,
            methods,
            report: Arc::new(TracingReport),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn with_report(mut self, report: Arc<dyn MessageProcessorReport>) -> Self {
        self.report = report;
        self
    }
}

impl ServerProtocol for RpcServerProtocol {
    fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    fn create_connection_for(
        &self,
        socket: std::os::unix::net::UnixStream,
        context: ConnectionContext,
    ) -> Result<()> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::new(StreamTransport::new(socket)?);
        let sender = Arc::new(TransportSender {
            transport: Arc::clone(&transport),
            lock: Mutex::new(()),
        });
        let session = Arc::new(Session {
            id,
            transport: Arc::clone(&transport),
            processor: MessageProcessor::new(
                id,
                sender,
                Arc::clone(&self.methods),
                Arc::clone(&self.report),
            ),
            closing: AtomicBool::new(false),
        });
        let observer: Arc<dyn Observer> = session.clone();
        transport.register_observer(&observer);

        context.handle_connect(&session);

        let runner = Arc::clone(&session);
        thread::Builder::new()
            .name(format!("area-ipc/session-{id}"))
            .spawn(move || runner.run())
            .map_err(|e| Error::io("failed to spawn session thread", e))?;

        info!(session = id, protocol = %self.descriptor.id(), "Session started");
        Ok(())
    }
}
