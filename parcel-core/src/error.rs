//! Failure taxonomy for sending and receiving payloads.

use std::collections::HashMap;

use crate::payload::DecodeError;
use crate::provider::{PeerId, TransportError};

/// Every way a send or a receive can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Send attempted with no session provider attached.
    #[error("no active session")]
    NoActiveSession,
    /// Send attempted with no recipients resolvable.
    #[error("no connected peers")]
    NoConnectedPeers,
    /// A resource arrived but no destination directory is configured.
    #[error("no resource container directory is configured")]
    MissingResourceContainer,
    /// Some recipients failed during fan-out. Only the failed peers are listed.
    #[error("resource transfer failed for {} peer(s)", .0.len())]
    PartialErrors(HashMap<PeerId, TransportError>),
    #[error("payload data corrupted: {0}")]
    DataCorrupted(#[from] DecodeError),
    #[error("payload encoding failed: {0}")]
    Encode(#[source] bincode::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The transport finished a resource with neither an error nor a location.
    #[error("resource finished without a local location")]
    MissingResourceLocation,
    #[error("invalid resource name {0:?}")]
    InvalidResourceName(String),
    /// A pending half was evicted before its counterpart arrived.
    #[error("pending transfer expired before completion")]
    TransferExpired,
    #[error("resource relocation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Per-peer failures of a fan-out, if this is a partial failure.
    pub fn partial_errors(&self) -> Option<&HashMap<PeerId, TransportError>> {
        match self {
            Error::PartialErrors(errors) => Some(errors),
            _ => None,
        }
    }
}
