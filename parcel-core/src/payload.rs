//! Message payload and its versioned wire envelope.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current envelope version. Any other value is rejected on decode.
pub const ENVELOPE_VERSION: u32 = 1;

/// One logical message: opaque bytes, an optional resource sent out-of-band, and the
/// id that correlates the two halves on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePayload {
    data: Vec<u8>,
    resource_location: Option<PathBuf>,
    id: Uuid,
}

impl MessagePayload {
    /// New payload with a freshly generated random id.
    pub fn new(data: impl Into<Vec<u8>>, resource_location: Option<PathBuf>) -> Self {
        Self {
            data: data.into(),
            resource_location,
            id: Uuid::new_v4(),
        }
    }

    /// Convenience for UTF-8 text messages.
    pub fn text(text: &str) -> Self {
        Self::new(text.as_bytes(), None)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Sender side: the local file to transfer. Receiver side: the relocated file, set
    /// only once the resource transfer has completed.
    pub fn resource_location(&self) -> Option<&Path> {
        self.resource_location.as_deref()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn set_resource_location(&mut self, location: Option<PathBuf>) {
        self.resource_location = location;
    }

    pub fn has_resource(&self) -> bool {
        self.resource_location.is_some()
    }

    /// Transfer name for the attached resource: `<id>/<file name>`.
    /// The receiver parses the first segment back into the id.
    pub fn resource_name(&self) -> Option<String> {
        let location = self.resource_location.as_ref()?;
        let file_name = location
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        Some(format!("{}/{}", self.id.hyphenated(), file_name))
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    id: &'a Uuid,
    data: &'a [u8],
    resource_url: Option<Cow<'a, str>>,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    id: Uuid,
    data: Vec<u8>,
    resource_url: Option<String>,
}

/// Encode a payload into its versioned envelope (bincode).
pub fn encode(payload: &MessagePayload) -> Result<Vec<u8>, bincode::Error> {
    let envelope = EnvelopeRef {
        version: ENVELOPE_VERSION,
        id: &payload.id,
        data: &payload.data,
        resource_url: payload
            .resource_location
            .as_deref()
            .map(|path| path.to_string_lossy()),
    };
    bincode::serialize(&envelope)
}

/// Decode an envelope. The version is read and checked before any other field.
pub fn decode(bytes: &[u8]) -> Result<MessagePayload, DecodeError> {
    let version: u32 = bincode::deserialize(bytes)?;
    if version != ENVELOPE_VERSION {
        return Err(DecodeError::VersionMismatch {
            found: version,
            expected: ENVELOPE_VERSION,
        });
    }
    let envelope: Envelope = bincode::deserialize(bytes)?;
    Ok(MessagePayload {
        data: envelope.data,
        resource_location: envelope.resource_url.map(PathBuf::from),
        id: envelope.id,
    })
}

/// Envelope could not be turned back into a payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope version {found} does not match the expected version {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("malformed envelope: {0}")]
    Malformed(#[from] bincode::Error),
}
