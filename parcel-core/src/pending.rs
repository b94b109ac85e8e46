//! Pending transfer state: halves of a message that arrived before their counterpart.
//!
//! Payloads wait here for their resource and resources wait for their payload. For a
//! given id at most one of the two maps holds an entry; every operation that inserts
//! first checks the other map while holding the same `&mut`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use crate::payload::MessagePayload;
use crate::provider::PeerId;

#[derive(Debug)]
struct Pending<T> {
    value: T,
    from: PeerId,
    since: Instant,
}

/// Entries evicted by [`PendingTransfers::purge_expired_at`].
#[derive(Debug, Default)]
pub struct Evicted {
    /// Payloads whose resource never arrived.
    pub payloads: Vec<(Uuid, PeerId)>,
    /// Relocated resources whose payload never arrived.
    pub resources: Vec<(Uuid, PeerId, PathBuf)>,
}

impl Evicted {
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty() && self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.payloads.len() + self.resources.len()
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingTransfers {
    payloads: HashMap<Uuid, Pending<MessagePayload>>,
    resources: HashMap<Uuid, Pending<PathBuf>>,
}

impl PendingTransfers {
    /// Data half arrived. Returns the combined payload if the resource was already here;
    /// otherwise buffers the payload (without its sender-side location).
    pub fn payload_arrived(
        &mut self,
        mut payload: MessagePayload,
        from: &PeerId,
        now: Instant,
    ) -> Option<MessagePayload> {
        let id = payload.id();
        if let Some(resource) = self.resources.remove(&id) {
            payload.set_resource_location(Some(resource.value));
            return Some(payload);
        }
        match self.payloads.entry(id) {
            Entry::Occupied(_) => {
                warn!(%id, peer = %from, "duplicate payload for pending transfer ignored");
            }
            Entry::Vacant(slot) => {
                payload.set_resource_location(None);
                slot.insert(Pending {
                    value: payload,
                    from: from.clone(),
                    since: now,
                });
            }
        }
        None
    }

    /// Resource half relocated. Returns the combined payload if the data was already
    /// here; otherwise buffers the location.
    pub fn resource_arrived(
        &mut self,
        id: Uuid,
        location: PathBuf,
        from: &PeerId,
        now: Instant,
    ) -> Option<MessagePayload> {
        if let Some(pending) = self.payloads.remove(&id) {
            let mut payload = pending.value;
            payload.set_resource_location(Some(location));
            return Some(payload);
        }
        match self.resources.entry(id) {
            Entry::Occupied(_) => {
                warn!(%id, peer = %from, "duplicate resource for pending transfer ignored");
            }
            Entry::Vacant(slot) => {
                slot.insert(Pending {
                    value: location,
                    from: from.clone(),
                    since: now,
                });
            }
        }
        None
    }

    /// Remove a buffered payload, if any.
    pub fn take_payload(&mut self, id: &Uuid) -> Option<MessagePayload> {
        self.payloads.remove(id).map(|pending| pending.value)
    }

    pub fn payload_count(&self) -> usize {
        self.payloads.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Evict every entry that has waited at least `ttl`.
    pub fn purge_expired_at(&mut self, now: Instant, ttl: Duration) -> Evicted {
        let mut evicted = Evicted::default();
        self.payloads.retain(|id, pending| {
            let expired = now.saturating_duration_since(pending.since) >= ttl;
            if expired {
                evicted.payloads.push((*id, pending.from.clone()));
            }
            !expired
        });
        self.resources.retain(|id, pending| {
            let expired = now.saturating_duration_since(pending.since) >= ttl;
            if expired {
                evicted
                    .resources
                    .push((*id, pending.from.clone(), pending.value.clone()));
            }
            !expired
        });
        evicted
    }
}
