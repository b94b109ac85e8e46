//! Session manager: drives one [`SessionProvider`], fans sends out to peers and
//! correlates inbound data with inbound resources.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::payload::{self, MessagePayload};
use crate::pending::{Evicted, PendingTransfers};
use crate::progress::Progress;
use crate::provider::{
    CertificateHandler, PeerId, PeerState, SessionProvider, SessionProviderDelegate,
    TransportError,
};
use crate::sync::{lock, read, write};

/// Completion of one logical send.
pub type SendCompletion = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// Owner of a [`SessionManager`]: relocates received resources and receives the
/// correlated notifications.
pub trait SessionManagerDelegate: Send + Sync {
    /// Move a received resource from its temporary location to permanent storage.
    fn relocate_resource(&self, name: &str, temporary: &Path) -> Result<PathBuf, Error>;

    fn received(&self, payload: MessagePayload, from: &PeerId);

    fn peer_state_changed(&self, peer: &PeerId, state: PeerState);

    fn decoding_error(&self, error: Error, from: &PeerId);

    fn resource_error(&self, error: Error, id: Uuid, from: &PeerId);
}

/// Coordinates sends and receives over one provider.
///
/// Dropping the manager clears its delegate, detaches it from the provider and
/// disconnects the provider, in that order.
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    provider: Arc<dyn SessionProvider>,
    delegate: RwLock<Option<Weak<dyn SessionManagerDelegate>>>,
    pending: Mutex<PendingTransfers>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        delegate: Weak<dyn SessionManagerDelegate>,
    ) -> Self {
        let inner = Arc::new(SessionInner {
            provider,
            delegate: RwLock::new(Some(delegate)),
            pending: Mutex::new(PendingTransfers::default()),
        });
        let weak = Arc::downgrade(&inner);
        let as_delegate: Weak<dyn SessionProviderDelegate> = weak;
        inner.provider.set_delegate(Some(as_delegate));
        Self { inner }
    }

    pub fn provider(&self) -> &Arc<dyn SessionProvider> {
        &self.inner.provider
    }

    /// Send `payload` to `peers`, or to every connected peer when `peers` is `None`.
    ///
    /// `completion` fires once: immediately on encode or bulk-send failure, immediately
    /// with `Ok` when there is no resource, otherwise after every recipient's resource
    /// transfer has reported. Returns the aggregate resource progress, if any.
    pub fn send<F>(
        &self,
        payload: &MessagePayload,
        peers: Option<&[PeerId]>,
        completion: F,
    ) -> Option<Progress>
    where
        F: FnOnce(Result<(), Error>) + Send + 'static,
    {
        let provider = &self.inner.provider;
        let recipients = match peers {
            Some(peers) => dedup(peers),
            None => provider.connected_peers(),
        };
        let bytes = match payload::encode(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                completion(Err(Error::Encode(e)));
                return None;
            }
        };
        if let Err(e) = provider.send(&bytes, &recipients) {
            completion(Err(Error::Transport(e)));
            return None;
        }
        let (Some(location), Some(name)) = (payload.resource_location(), payload.resource_name())
        else {
            completion(Ok(()));
            return None;
        };

        debug!(id = %payload.id(), recipients = recipients.len(), resource = %name, "sending resource");
        let fan_out = FanOut::new(&recipients, Box::new(completion));
        let progress = Progress::new(recipients.len() as u64);
        let mut weighted = 0u64;
        for recipient in &recipients {
            let fan_out = fan_out.clone();
            let peer = recipient.clone();
            let child = provider.send_resource(
                location,
                &name,
                recipient,
                Box::new(move |error| fan_out.record(&peer, error)),
            );
            if let Some(child) = child {
                progress.add_child(child, 1);
                weighted += 1;
            }
        }
        // Recipients without a progress handle do not count towards the total.
        progress.set_total_units(weighted);
        fan_out.arm();
        (weighted > 0).then_some(progress)
    }

    /// Payloads waiting for their resource.
    pub fn pending_payloads(&self) -> usize {
        lock(&self.inner.pending).payload_count()
    }

    /// Resources waiting for their payload.
    pub fn pending_resources(&self) -> usize {
        lock(&self.inner.pending).resource_count()
    }

    pub fn purge_expired(&self, ttl: Duration) -> Evicted {
        self.purge_expired_at(Instant::now(), ttl)
    }

    /// Evict pending halves that have waited at least `ttl`.
    pub fn purge_expired_at(&self, now: Instant, ttl: Duration) -> Evicted {
        let evicted = lock(&self.inner.pending).purge_expired_at(now, ttl);
        if !evicted.is_empty() {
            warn!(count = evicted.len(), "evicted stale pending transfers");
        }
        evicted
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        write(&self.inner.delegate).take();
        self.inner.provider.set_delegate(None);
        self.inner.provider.disconnect();
    }
}

fn dedup(peers: &[PeerId]) -> Vec<PeerId> {
    let mut seen = HashSet::with_capacity(peers.len());
    peers
        .iter()
        .filter(|peer| seen.insert(*peer))
        .cloned()
        .collect()
}

/// Aggregates the per-recipient outcomes of one resource fan-out.
///
/// The completion fires once every recipient has reported and the send loop has
/// finished (`arm`), whichever comes last.
#[derive(Clone)]
struct FanOut {
    state: Arc<Mutex<FanOutState>>,
}

struct FanOutState {
    outstanding: HashSet<PeerId>,
    armed: bool,
    errors: HashMap<PeerId, TransportError>,
    completion: Option<SendCompletion>,
}

impl FanOut {
    fn new(recipients: &[PeerId], completion: SendCompletion) -> Self {
        Self {
            state: Arc::new(Mutex::new(FanOutState {
                outstanding: recipients.iter().cloned().collect(),
                armed: false,
                errors: HashMap::new(),
                completion: Some(completion),
            })),
        }
    }

    fn record(&self, peer: &PeerId, error: Option<TransportError>) {
        let finished = {
            let mut state = lock(&self.state);
            if !state.outstanding.remove(peer) {
                warn!(%peer, "resource completion reported twice; ignored");
                return;
            }
            if let Some(error) = error {
                debug!(%peer, %error, "resource transfer failed");
                state.errors.insert(peer.clone(), error);
            }
            state.take_if_done()
        };
        finish(finished);
    }

    fn arm(&self) {
        let finished = {
            let mut state = lock(&self.state);
            state.armed = true;
            state.take_if_done()
        };
        finish(finished);
    }
}

impl FanOutState {
    fn take_if_done(&mut self) -> Option<(SendCompletion, HashMap<PeerId, TransportError>)> {
        if !self.armed || !self.outstanding.is_empty() {
            return None;
        }
        let completion = self.completion.take()?;
        Some((completion, std::mem::take(&mut self.errors)))
    }
}

fn finish(finished: Option<(SendCompletion, HashMap<PeerId, TransportError>)>) {
    if let Some((completion, errors)) = finished {
        if errors.is_empty() {
            completion(Ok(()));
        } else {
            completion(Err(Error::PartialErrors(errors)));
        }
    }
}

impl SessionInner {
    fn delegate(&self) -> Option<Arc<dyn SessionManagerDelegate>> {
        read(&self.delegate).as_ref().and_then(Weak::upgrade)
    }
}

impl SessionProviderDelegate for SessionInner {
    fn did_receive_data(&self, data: &[u8], from: &PeerId) {
        let Some(delegate) = self.delegate() else {
            return;
        };
        let payload = match payload::decode(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %from, error = %e, "undecodable payload");
                delegate.decoding_error(Error::DataCorrupted(e), from);
                return;
            }
        };
        if !payload.has_resource() {
            delegate.received(payload, from);
            return;
        }
        let id = payload.id();
        let combined = lock(&self.pending).payload_arrived(payload, from, Instant::now());
        match combined {
            Some(payload) => delegate.received(payload, from),
            None => debug!(%id, peer = %from, "payload waiting for resource"),
        }
    }

    fn did_finish_receiving_resource(
        &self,
        name: &str,
        from: &PeerId,
        location: Option<&Path>,
        error: Option<TransportError>,
    ) {
        let Some(id) = name
            .split('/')
            .next()
            .and_then(|segment| Uuid::try_parse(segment).ok())
        else {
            debug!(resource = name, peer = %from, "ignoring resource without a payload id");
            return;
        };
        let Some(delegate) = self.delegate() else {
            return;
        };
        let buffered = lock(&self.pending).take_payload(&id);
        let temporary = match (error, location) {
            (Some(error), _) => {
                delegate.resource_error(Error::Transport(error), id, from);
                return;
            }
            (None, None) => {
                delegate.resource_error(Error::MissingResourceLocation, id, from);
                return;
            }
            (None, Some(location)) => location,
        };
        // Relocation may block on I/O; the pending lock is not held here.
        let relocated = match delegate.relocate_resource(name, temporary) {
            Ok(relocated) => relocated,
            Err(e) => {
                delegate.resource_error(e, id, from);
                return;
            }
        };
        let combined = match buffered {
            Some(mut payload) => {
                payload.set_resource_location(Some(relocated));
                Some(payload)
            }
            // The data half may have landed while relocating.
            None => lock(&self.pending).resource_arrived(id, relocated, from, Instant::now()),
        };
        match combined {
            Some(payload) => delegate.received(payload, from),
            None => debug!(%id, peer = %from, "resource waiting for payload"),
        }
    }

    fn peer_did_change_state(&self, peer: &PeerId, state: PeerState) {
        if let Some(delegate) = self.delegate() {
            delegate.peer_state_changed(peer, state);
        }
    }

    fn did_receive_certificate(
        &self,
        _certificate: Option<&[u8]>,
        _from: &PeerId,
        handler: CertificateHandler,
    ) {
        handler(true);
    }
}
