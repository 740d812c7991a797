//! Protocol descriptors and the handshake advertisement frame.
//!
//! The client opens every connection with
//!
//! ```text
//! u16 total_size
//! repeat {
//!     u16 record_size            // 36 + header length
//!     36 bytes UUID (text, lowercase, hyphenated)
//!     header bytes
//! }
//! ```
//!
//! and the server answers with the 36-byte UUID of the protocol it picked.
//! All integers are little-endian.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Length of a UUID in its textual, hyphenated form.
pub const UUID_TEXT_LEN: usize = 36;

/// One wire-protocol variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    id: Uuid,
    header: Vec<u8>,
}

impl ProtocolDescriptor {
    pub fn new(id: Uuid, header: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            header: header.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Size of the variant-specific header this protocol expects.
    pub fn header_size(&self) -> usize {
        self.header.len()
    }

    pub fn header_bytes(&self) -> &[u8] {
        &self.header
    }

    /// The 36-byte acceptance reply naming this protocol.
    pub fn uuid_text(&self) -> [u8; UUID_TEXT_LEN] {
        uuid_text(self.id)
    }
}

pub(crate) fn uuid_text(id: Uuid) -> [u8; UUID_TEXT_LEN] {
    let mut text = [0u8; UUID_TEXT_LEN];
    id.hyphenated().encode_lower(&mut text);
    text
}

/// Parse a 36-byte UUID reply.
pub fn parse_uuid_text(text: &[u8]) -> Result<Uuid> {
    let text = std::str::from_utf8(text)
        .map_err(|_| Error::violation("protocol id is not valid UTF-8"))?;
    Uuid::try_parse(text).map_err(|e| Error::violation(format!("invalid protocol id {text:?}: {e}")))
}

/// A protocol the client offered, as decoded by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: Uuid,
    pub header: Vec<u8>,
}

/// Build the client's advertisement for `protocols`, most preferred first.
pub fn encode_client_header(protocols: &[&ProtocolDescriptor]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for protocol in protocols {
        let record_size = u16::try_from(UUID_TEXT_LEN + protocol.header_size())
            .map_err(|_| Error::usage("protocol header too large to advertise"))?;
        body.extend_from_slice(&record_size.to_le_bytes());
        body.extend_from_slice(&protocol.uuid_text());
        body.extend_from_slice(protocol.header_bytes());
    }

    let total = u16::try_from(body.len())
        .map_err(|_| Error::usage("too many protocols to advertise"))?;
    let mut frame = Vec::with_capacity(body.len() + 2);
    frame.extend_from_slice(&total.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode the advertisement body (everything after `total_size`).
pub fn parse_client_header(mut body: &[u8]) -> Result<Vec<Advertisement>> {
    let mut advertised = Vec::new();
    while !body.is_empty() {
        let Some((size, rest)) = body.split_first_chunk::<2>() else {
            return Err(Error::violation("truncated protocol record size"));
        };
        let size = usize::from(u16::from_le_bytes(*size));
        if size < UUID_TEXT_LEN {
            return Err(Error::violation(format!(
                "protocol record of {size} bytes is shorter than a protocol id"
            )));
        }
        if rest.len() < size {
            return Err(Error::violation(format!(
                "protocol record claims {size} bytes but only {} remain",
                rest.len()
            )));
        }
        let (record, remainder) = rest.split_at(size);
        let (id, header) = record.split_at(UUID_TEXT_LEN);
        advertised.push(Advertisement {
            id: parse_uuid_text(id)?,
            header: header.to_vec(),
        });
        body = remainder;
    }
    Ok(advertised)
}
