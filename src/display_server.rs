//! Built-in display server methods
//!
//! A small method table served over the published socket until the
//! surface and input services register their own.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use area_ipc::wire::MAX_FDS;
use area_ipc::{Done, HandlerError, MethodTable, ProtocolDescriptor, RpcServerProtocol};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Identifies the display server protocol during the handshake.
pub const PROTOCOL_ID: Uuid = Uuid::from_u128(0x8c2d_4f0e_5a61_4b7e_9d3c_2e41_a7f0_0001);

pub const CONNECT: u32 = 1;
pub const ECHO: u32 = 2;
pub const TEST_FILE_DESCRIPTORS: u32 = 3;
pub const DISCONNECT: u32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub application_name: String,
}

/// What a client learns about the server when it connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectReply {
    pub server: String,
    pub version: String,
    /// Sequence number of this client since the server started.
    pub client: u64,
}

pub fn protocol() -> RpcServerProtocol {
    RpcServerProtocol::new(ProtocolDescriptor::new(PROTOCOL_ID, Vec::new()), Arc::new(methods()))
}

pub fn methods() -> MethodTable {
    let clients = Arc::new(AtomicU64::new(0));
    let mut methods = MethodTable::new();
    methods
        .register(CONNECT, "connect", move |request: ConnectRequest, _fds, done: Done<ConnectReply>| {
            let client = clients.fetch_add(1, Ordering::Relaxed) + 1;
            info!(client, application = %request.application_name, "Client connected");
            done.reply(ConnectReply {
                server: "area".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                client,
            })
            .map_err(failed)
        })
        .register_raw(ECHO, "echo", |payload, _fds, done| done.reply(payload).map_err(failed))
        .register(TEST_FILE_DESCRIPTORS, "test_file_descriptors", test_file_descriptors)
        .register(DISCONNECT, "disconnect", |_: (), _fds, done: Done<()>| {
            debug!(request = done.id(), "Client asked to disconnect");
            done.reply(()).map_err(failed)
        })
        .ends_session(DISCONNECT);
    methods
}

/// Replies with `count` descriptors for `/dev/null`.
fn test_file_descriptors(count: usize, _fds: Vec<OwnedFd>, done: Done<usize>) -> Result<(), HandlerError> {
    if count > MAX_FDS {
        done.fail(format!("at most {MAX_FDS} descriptors per message, {count} requested"));
        return Ok(());
    }
    let fds = (0..count)
        .map(|_| File::open("/dev/null").map(OwnedFd::from))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| HandlerError::msg(format!("failed to open /dev/null: {e}")))?;
    done.reply_with_fds(count, fds).map_err(failed)
}

fn failed(error: area_ipc::Error) -> HandlerError {
    HandlerError::msg(error.to_string())
}
