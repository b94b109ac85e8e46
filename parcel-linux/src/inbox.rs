//! Console delegate: reports what the message manager delivers.

use parcel_core::{Error, MessageManagerDelegate, MessagePayload, PeerId, PeerState};
use tracing::{info, warn};
use uuid::Uuid;

pub struct Inbox;

impl MessageManagerDelegate for Inbox {
    fn received(&self, payload: MessagePayload, from: &PeerId) {
        let text = String::from_utf8_lossy(payload.data());
        match payload.resource_location() {
            Some(path) => {
                info!(peer = %from, id = %payload.id(), file = %path.display(), "{text}")
            }
            None => info!(peer = %from, id = %payload.id(), "{text}"),
        }
    }

    fn peer_state_changed(&self, peer: &PeerId, state: PeerState) {
        info!(%peer, ?state, "peer state changed");
    }

    fn decoding_error_occurred(&self, error: Error, from: &PeerId) {
        warn!(peer = %from, %error, "could not decode message");
    }

    fn resource_error_occurred(&self, error: Error, resource_id: Uuid, from: &PeerId) {
        warn!(peer = %from, id = %resource_id, %error, "resource not received");
    }
}
