//! Parcel: reliable, correlated delivery of messages and their out-of-band resources
//! between a local node and its peers, on top of any session provider.

pub mod callback;
pub mod config;
pub mod error;
pub mod manager;
pub mod payload;
pub mod progress;
pub mod provider;
pub mod session;
pub mod wire;

mod pending;
mod sync;

pub use callback::{CallbackContext, Job, SerialQueue};
pub use config::Config;
pub use error::Error;
pub use manager::{MessageManager, MessageManagerDelegate};
pub use payload::{DecodeError, MessagePayload, ENVELOPE_VERSION};
pub use pending::Evicted;
pub use progress::Progress;
pub use provider::{
    CertificateHandler, PeerId, PeerState, ResourceCompletion, SessionProvider,
    SessionProviderDelegate, TransportError,
};
pub use session::{SendCompletion, SessionManager, SessionManagerDelegate};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
