//! Observability hooks for the server side.
//!
//! The connector and the message processor report what they do through
//! these traits. [`TracingReport`] forwards everything to `tracing`; tests
//! and embedders can substitute their own.

use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::error::Error;

pub trait ConnectorReport: Send + Sync {
    fn listening_on(&self, path: &Path);
    fn creating_session_for(&self, client: &str);
    fn creating_socket_pair(&self);
    fn handshake_failed(&self, error: &Error);
    fn accept_error(&self, error: &std::io::Error);
}

pub trait MessageProcessorReport: Send + Sync {
    fn received_invocation(&self, session: u64, id: u32, method: &str);
    fn completed_invocation(&self, session: u64, id: u32, keep_going: bool);
    fn unknown_method(&self, session: u64, id: u32, selector: u32);
    fn exception_handled(&self, session: u64, id: u32, error: &str);
}

/// Reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReport;

impl ConnectorReport for TracingReport {
    fn listening_on(&self, path: &Path) {
        info!(socket_path = %path.display(), "Listening for clients");
    }

    fn creating_session_for(&self, client: &str) {
        debug!(client, "Creating session");
    }

    fn creating_socket_pair(&self) {
        debug!("Creating socket pair session");
    }

    fn handshake_failed(&self, error: &Error) {
        warn!("Client handshake failed: {}", error);
    }

    fn accept_error(&self, error: &std::io::Error) {
        error!("Failed to accept connection: {}", error);
    }
}

impl MessageProcessorReport for TracingReport {
    fn received_invocation(&self, session: u64, id: u32, method: &str) {
        debug!(session, id, method, "Received invocation");
    }

    fn completed_invocation(&self, session: u64, id: u32, keep_going: bool) {
        debug!(session, id, keep_going, "Completed invocation");
    }

    fn unknown_method(&self, session: u64, id: u32, selector: u32) {
        warn!(session, id, selector, "Unknown method");
    }

    fn exception_handled(&self, session: u64, id: u32, error: &str) {
        warn!(session, id, "Handler failed: {}", error);
    }
}
