//! Session provider contract: what the underlying peer-to-peer transport must expose.
//!
//! The transport owns peer identity, connection management and the bytes on the wire.
//! It reports events to a [`SessionProviderDelegate`] held through a `Weak` reference so
//! that the transport never keeps the session manager alive.

use std::fmt;
use std::path::Path;
use std::sync::Weak;

use crate::progress::Progress;

/// Opaque identity of a remote endpoint, defined by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        PeerId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connectivity of a remote peer as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    NotConnected,
    Connecting,
    Connected,
}

/// Error reported by the transport. Passed through unmodified by this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer is not connected")]
    NotConnected,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("operation not supported")]
    Unsupported,
    #[error("operation timed out")]
    TimedOut,
    #[error("operation cancelled")]
    Cancelled,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Completion for one resource transfer: `None` on success.
pub type ResourceCompletion = Box<dyn FnOnce(Option<TransportError>) + Send + 'static>;

/// Answer to an identity challenge: `true` accepts the connection.
pub type CertificateHandler = Box<dyn FnOnce(bool) + Send + 'static>;

/// The transport beneath the session manager.
pub trait SessionProvider: Send + Sync {
    /// This node's own identity.
    fn local_peer(&self) -> PeerId;

    /// Peers currently connected. Queried at call time, never cached by callers.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Reliable send of one bounded message to every peer in `peers`.
    fn send(&self, data: &[u8], peers: &[PeerId]) -> Result<(), TransportError>;

    /// Asynchronous transfer of the file at `path` to one peer. `name` must reach the
    /// receiver verbatim. `completion` fires exactly once.
    fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerId,
        completion: ResourceCompletion,
    ) -> Option<Progress>;

    /// Replace (or clear) the event delegate.
    fn set_delegate(&self, delegate: Option<Weak<dyn SessionProviderDelegate>>);

    /// Drop every connection.
    fn disconnect(&self);
}

/// Events a [`SessionProvider`] delivers, from any thread and in any order.
pub trait SessionProviderDelegate: Send + Sync {
    fn did_receive_data(&self, data: &[u8], from: &PeerId);

    /// A resource transfer finished. On success `location` is a temporary file the
    /// delegate must move before returning.
    fn did_finish_receiving_resource(
        &self,
        name: &str,
        from: &PeerId,
        location: Option<&Path>,
        error: Option<TransportError>,
    );

    fn peer_did_change_state(&self, peer: &PeerId, state: PeerState);

    fn did_receive_certificate(
        &self,
        certificate: Option<&[u8]>,
        from: &PeerId,
        handler: CertificateHandler,
    );
}
