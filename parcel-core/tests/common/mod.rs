#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parcel_core::{
    Error, MessageManagerDelegate, MessagePayload, PeerId, PeerState, Progress,
    ResourceCompletion, SessionManagerDelegate, SessionProvider, SessionProviderDelegate,
    TransportError,
};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn peer(name: &str) -> PeerId {
    PeerId::new(name)
}

pub fn peers(names: &[&str]) -> Vec<PeerId> {
    names.iter().map(|name| PeerId::new(*name)).collect()
}

/// One `send_resource` call captured by [`FakeProvider`].
pub struct ResourceCall {
    pub path: PathBuf,
    pub name: String,
    pub peer: PeerId,
    pub progress: Option<Progress>,
    completion: Option<ResourceCompletion>,
}

/// In-memory transport. Sends are recorded; resource completions fire when the test
/// says so (or synchronously when `auto_complete` is set).
pub struct FakeProvider {
    local: PeerId,
    connected: Mutex<Vec<PeerId>>,
    delegate: Mutex<Option<Weak<dyn SessionProviderDelegate>>>,
    sent: Mutex<Vec<(Vec<u8>, Vec<PeerId>)>>,
    resources: Mutex<Vec<ResourceCall>>,
    send_error: Mutex<Option<TransportError>>,
    without_progress: Mutex<HashSet<PeerId>>,
    auto_complete: Mutex<Option<Option<TransportError>>>,
    lifecycle: Mutex<Vec<&'static str>>,
    disconnects: AtomicUsize,
    peer_queries: AtomicUsize,
    peers_vanish: AtomicBool,
}

impl FakeProvider {
    pub fn new(connected: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            local: peer("ME"),
            connected: Mutex::new(peers(connected)),
            delegate: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            send_error: Mutex::new(None),
            without_progress: Mutex::new(HashSet::new()),
            auto_complete: Mutex::new(None),
            lifecycle: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            peer_queries: AtomicUsize::new(0),
            peers_vanish: AtomicBool::new(false),
        })
    }

    /// Every peer disconnects right after the next `connected_peers` call.
    pub fn peers_vanish_after_query(&self) {
        self.peers_vanish.store(true, Ordering::SeqCst);
    }

    pub fn peer_queries(&self) -> usize {
        self.peer_queries.load(Ordering::SeqCst)
    }

    pub fn fail_sends_with(&self, error: TransportError) {
        *self.send_error.lock().unwrap() = Some(error);
    }

    pub fn no_progress_for(&self, name: &str) {
        self.without_progress.lock().unwrap().insert(peer(name));
    }

    /// Complete every resource transfer inside `send_resource` itself.
    pub fn complete_synchronously(&self, error: Option<TransportError>) {
        *self.auto_complete.lock().unwrap() = Some(error);
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, Vec<PeerId>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn resource_calls(&self) -> Vec<(PathBuf, String, PeerId)> {
        self.resources
            .lock()
            .unwrap()
            .iter()
            .map(|call| (call.path.clone(), call.name.clone(), call.peer.clone()))
            .collect()
    }

    /// Progress handed out for the transfer to `to`.
    pub fn resource_progress(&self, to: &str) -> Option<Progress> {
        self.resources
            .lock()
            .unwrap()
            .iter()
            .find(|call| call.peer.as_str() == to)
            .and_then(|call| call.progress.clone())
    }

    /// Fire the pending completion of the transfer to `to`.
    pub fn complete_resource(&self, to: &str, error: Option<TransportError>) {
        let completion = self
            .resources
            .lock()
            .unwrap()
            .iter_mut()
            .find(|call| call.peer.as_str() == to && call.completion.is_some())
            .and_then(|call| call.completion.take())
            .expect("no pending transfer for peer");
        completion(error);
    }

    pub fn lifecycle(&self) -> Vec<&'static str> {
        self.lifecycle.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn delegate_attached(&self) -> bool {
        self.current_delegate().is_some()
    }

    fn current_delegate(&self) -> Option<Arc<dyn SessionProviderDelegate>> {
        self.delegate
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn deliver_data(&self, data: &[u8], from: &str) {
        if let Some(delegate) = self.current_delegate() {
            delegate.did_receive_data(data, &peer(from));
        }
    }

    pub fn deliver_payload(&self, payload: &MessagePayload, from: &str) {
        self.deliver_data(&parcel_core::payload::encode(payload).unwrap(), from);
    }

    pub fn deliver_resource(
        &self,
        name: &str,
        from: &str,
        location: Option<&Path>,
        error: Option<TransportError>,
    ) {
        if let Some(delegate) = self.current_delegate() {
            delegate.did_finish_receiving_resource(name, &peer(from), location, error);
        }
    }

    pub fn change_state(&self, who: &str, state: PeerState) {
        if let Some(delegate) = self.current_delegate() {
            delegate.peer_did_change_state(&peer(who), state);
        }
    }

    /// Present a certificate and return the delegate's answer.
    pub fn challenge(&self, from: &str) -> Option<bool> {
        let delegate = self.current_delegate()?;
        let (tx, rx) = unbounded();
        delegate.did_receive_certificate(
            Some(b"certificate"),
            &peer(from),
            Box::new(move |accepted| {
                let _ = tx.send(accepted);
            }),
        );
        rx.recv_timeout(WAIT).ok()
    }
}

impl SessionProvider for FakeProvider {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.peer_queries.fetch_add(1, Ordering::SeqCst);
        let mut connected = self.connected.lock().unwrap();
        let current = connected.clone();
        if self.peers_vanish.load(Ordering::SeqCst) {
            connected.clear();
        }
        current
    }

    fn send(&self, data: &[u8], peers: &[PeerId]) -> Result<(), TransportError> {
        if let Some(error) = self.send_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.sent
            .lock()
            .unwrap()
            .push((data.to_vec(), peers.to_vec()));
        Ok(())
    }

    fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerId,
        completion: ResourceCompletion,
    ) -> Option<Progress> {
        let progress =
            (!self.without_progress.lock().unwrap().contains(peer)).then(|| Progress::new(100));
        let auto = self.auto_complete.lock().unwrap().clone();
        let completion = match auto {
            Some(error) => {
                completion(error);
                None
            }
            None => Some(completion),
        };
        self.resources.lock().unwrap().push(ResourceCall {
            path: path.to_path_buf(),
            name: name.to_string(),
            peer: peer.clone(),
            progress: progress.clone(),
            completion,
        });
        progress
    }

    fn set_delegate(&self, delegate: Option<Weak<dyn SessionProviderDelegate>>) {
        self.lifecycle.lock().unwrap().push(if delegate.is_some() {
            "attach"
        } else {
            "detach"
        });
        *self.delegate.lock().unwrap() = delegate;
    }

    fn disconnect(&self) {
        self.lifecycle.lock().unwrap().push("disconnect");
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub enum Event {
    Received(MessagePayload, PeerId),
    PeerState(PeerId, PeerState),
    DecodingError(Error, PeerId),
    ResourceError(Error, Uuid, PeerId),
}

type Hook = Box<dyn FnOnce() + Send>;

/// Session manager delegate that moves resources into `inbox` and reports every event.
pub struct SessionRecorder {
    inbox: PathBuf,
    fail_relocation: Mutex<bool>,
    before_relocate: Mutex<Option<Hook>>,
    events: Sender<Event>,
}

impl SessionRecorder {
    pub fn new(inbox: &Path) -> (Arc<Self>, Receiver<Event>) {
        let (events, rx) = unbounded();
        let recorder = Arc::new(Self {
            inbox: inbox.to_path_buf(),
            fail_relocation: Mutex::new(false),
            before_relocate: Mutex::new(None),
            events,
        });
        (recorder, rx)
    }

    pub fn fail_relocation(&self) {
        *self.fail_relocation.lock().unwrap() = true;
    }

    /// Run `hook` at the start of the next relocation.
    pub fn before_relocate(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_relocate.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn as_delegate(self: &Arc<Self>) -> Weak<dyn SessionManagerDelegate> {
        let weak = Arc::downgrade(self);
        weak
    }
}

impl SessionManagerDelegate for SessionRecorder {
    fn relocate_resource(&self, name: &str, temporary: &Path) -> Result<PathBuf, Error> {
        let hook = self.before_relocate.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if *self.fail_relocation.lock().unwrap() {
            return Err(Error::MissingResourceContainer);
        }
        let destination = self.inbox.join(name);
        fs::create_dir_all(destination.parent().unwrap())?;
        fs::rename(temporary, &destination)?;
        Ok(destination)
    }

    fn received(&self, payload: MessagePayload, from: &PeerId) {
        let _ = self.events.send(Event::Received(payload, from.clone()));
    }

    fn peer_state_changed(&self, peer: &PeerId, state: PeerState) {
        let _ = self.events.send(Event::PeerState(peer.clone(), state));
    }

    fn decoding_error(&self, error: Error, from: &PeerId) {
        let _ = self.events.send(Event::DecodingError(error, from.clone()));
    }

    fn resource_error(&self, error: Error, id: Uuid, from: &PeerId) {
        let _ = self
            .events
            .send(Event::ResourceError(error, id, from.clone()));
    }
}

/// Message manager delegate that reports every event with the thread it ran on.
pub struct ManagerRecorder {
    events: Sender<(Event, Option<String>)>,
}

impl ManagerRecorder {
    pub fn new() -> (Arc<Self>, Receiver<(Event, Option<String>)>) {
        let (events, rx) = unbounded();
        (Arc::new(Self { events }), rx)
    }

    fn record(&self, event: Event) {
        let thread = thread::current().name().map(str::to_string);
        let _ = self.events.send((event, thread));
    }
}

impl MessageManagerDelegate for ManagerRecorder {
    fn received(&self, payload: MessagePayload, from: &PeerId) {
        self.record(Event::Received(payload, from.clone()));
    }

    fn peer_state_changed(&self, peer: &PeerId, state: PeerState) {
        self.record(Event::PeerState(peer.clone(), state));
    }

    fn decoding_error_occurred(&self, error: Error, from: &PeerId) {
        self.record(Event::DecodingError(error, from.clone()));
    }

    fn resource_error_occurred(&self, error: Error, resource_id: Uuid, from: &PeerId) {
        self.record(Event::ResourceError(error, resource_id, from.clone()));
    }
}

/// Write `contents` to a fresh file under `dir`, standing in for a transport's
/// temporary download.
pub fn temp_resource(dir: &Path, file_name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(format!("{}-{}", Uuid::new_v4(), file_name));
    fs::write(&path, contents).unwrap();
    path
}
