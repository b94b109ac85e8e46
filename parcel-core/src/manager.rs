//! Message manager: the application-facing entry point.
//!
//! Adds the "no session" / "no peers" preconditions in front of the session manager,
//! moves received resources into the configured container, and runs every completion
//! and delegate notification on one callback context.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::callback::{CallbackContext, SerialQueue};
use crate::config::Config;
use crate::error::Error;
use crate::payload::MessagePayload;
use crate::progress::Progress;
use crate::provider::{PeerId, PeerState, SessionProvider};
use crate::session::{SessionManager, SessionManagerDelegate};
use crate::sync::{read, write};

/// Receives everything the message manager observes, always on its callback context.
pub trait MessageManagerDelegate: Send + Sync {
    fn received(&self, payload: MessagePayload, from: &PeerId);

    fn peer_state_changed(&self, peer: &PeerId, state: PeerState);

    fn decoding_error_occurred(&self, error: Error, from: &PeerId);

    /// `resource_id` is the id of the payload the resource belonged to.
    fn resource_error_occurred(&self, error: Error, resource_id: Uuid, from: &PeerId);
}

/// Cheap to clone; clones share the same session and configuration.
#[derive(Clone)]
pub struct MessageManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    session: RwLock<Option<Arc<SessionManager>>>,
    resource_container: RwLock<Option<PathBuf>>,
    pending_ttl: RwLock<Option<Duration>>,
    callback_context: RwLock<Option<Arc<dyn CallbackContext>>>,
    default_context: Arc<SerialQueue>,
    delegate: RwLock<Option<Weak<dyn MessageManagerDelegate>>>,
}

impl MessageManager {
    pub fn new() -> Result<Self, Error> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self, Error> {
        let default_context = Arc::new(SerialQueue::new(&config.callback_label)?);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                session: RwLock::new(None),
                resource_container: RwLock::new(config.resource_container),
                pending_ttl: RwLock::new(config.pending_ttl),
                callback_context: RwLock::new(None),
                default_context,
                delegate: RwLock::new(None),
            }),
        })
    }

    /// Attach a provider (replacing and tearing down any previous session) or detach
    /// with `None`.
    pub fn set_session_provider(&self, provider: Option<Arc<dyn SessionProvider>>) {
        let previous = write(&self.inner.session).take();
        drop(previous);
        if let Some(provider) = provider {
            let inner = Arc::downgrade(&self.inner);
            let delegate: Weak<dyn SessionManagerDelegate> = inner;
            let session = Arc::new(SessionManager::new(provider, delegate));
            *write(&self.inner.session) = Some(session);
        }
    }

    pub fn session_provider(&self) -> Option<Arc<dyn SessionProvider>> {
        self.inner
            .session()
            .map(|session| Arc::clone(session.provider()))
    }

    pub fn set_resource_container(&self, directory: Option<PathBuf>) {
        *write(&self.inner.resource_container) = directory;
    }

    pub fn resource_container(&self) -> Option<PathBuf> {
        read(&self.inner.resource_container).clone()
    }

    /// Use `context` for callbacks; `None` restores the default serial queue.
    pub fn set_callback_context(&self, context: Option<Arc<dyn CallbackContext>>) {
        *write(&self.inner.callback_context) = context;
    }

    pub fn set_pending_ttl(&self, ttl: Option<Duration>) {
        *write(&self.inner.pending_ttl) = ttl;
    }

    /// The delegate is held weakly.
    pub fn set_delegate<D: MessageManagerDelegate + 'static>(&self, delegate: &Arc<D>) {
        let weak = Arc::downgrade(delegate);
        *write(&self.inner.delegate) = Some(weak);
    }

    pub fn clear_delegate(&self) {
        write(&self.inner.delegate).take();
    }

    /// Send `payload` to `peers`, or to every connected peer when `peers` is `None`.
    /// An empty recipient list fails with `NoConnectedPeers`.
    /// `completion` always runs on the callback context.
    pub fn send<F>(
        &self,
        payload: &MessagePayload,
        peers: Option<&[PeerId]>,
        completion: F,
    ) -> Option<Progress>
    where
        F: FnOnce(Result<(), Error>) + Send + 'static,
    {
        let context = self.inner.context();
        let Some(session) = self.inner.session() else {
            context.dispatch(Box::new(move || completion(Err(Error::NoActiveSession))));
            return None;
        };
        // Resolved once so the check and the send see the same recipients.
        let recipients = match peers {
            Some(peers) => peers.to_vec(),
            None => session.provider().connected_peers(),
        };
        if recipients.is_empty() {
            context.dispatch(Box::new(move || completion(Err(Error::NoConnectedPeers))));
            return None;
        }
        session.send(payload, Some(&recipients), move |result| {
            context.dispatch(Box::new(move || completion(result)));
        })
    }

    /// Payloads waiting for their resource in the current session.
    pub fn pending_payloads(&self) -> usize {
        self.inner
            .session()
            .map_or(0, |session| session.pending_payloads())
    }

    /// Resources waiting for their payload in the current session.
    pub fn pending_resources(&self) -> usize {
        self.inner
            .session()
            .map_or(0, |session| session.pending_resources())
    }

    /// Evict transfers pending longer than the configured TTL. Orphaned resource files
    /// are deleted and every evicted id is reported as `TransferExpired`.
    /// Returns the number of evicted entries.
    pub fn purge_stale_transfers(&self) -> usize {
        let Some(ttl) = *read(&self.inner.pending_ttl) else {
            return 0;
        };
        let Some(session) = self.inner.session() else {
            return 0;
        };
        let evicted = session.purge_expired(ttl);
        let count = evicted.len();
        for (id, from) in evicted.payloads {
            self.inner
                .notify(move |d| d.resource_error_occurred(Error::TransferExpired, id, &from));
        }
        for (id, from, location) in evicted.resources {
            if let Err(e) = fs::remove_file(&location) {
                warn!(%id, path = %location.display(), error = %e, "could not remove orphaned resource");
            }
            self.inner
                .notify(move |d| d.resource_error_occurred(Error::TransferExpired, id, &from));
        }
        count
    }
}

impl ManagerInner {
    fn session(&self) -> Option<Arc<SessionManager>> {
        read(&self.session).clone()
    }

    fn context(&self) -> Arc<dyn CallbackContext> {
        match read(&self.callback_context).as_ref() {
            Some(context) => Arc::clone(context),
            None => Arc::clone(&self.default_context) as Arc<dyn CallbackContext>,
        }
    }

    /// Run `f` against the delegate on the callback context. The delegate is upgraded
    /// when the job runs, so a delegate dropped in the meantime sees nothing.
    fn notify<F>(&self, f: F)
    where
        F: FnOnce(&dyn MessageManagerDelegate) + Send + 'static,
    {
        let Some(delegate) = read(&self.delegate).clone() else {
            return;
        };
        self.context().dispatch(Box::new(move || {
            if let Some(delegate) = delegate.upgrade() {
                f(delegate.as_ref());
            }
        }));
    }
}

impl SessionManagerDelegate for ManagerInner {
    fn relocate_resource(&self, name: &str, temporary: &Path) -> Result<PathBuf, Error> {
        let container = read(&self.resource_container)
            .clone()
            .ok_or(Error::MissingResourceContainer)?;
        let destination = resource_destination(&container, name)?;
        move_file_creating_directories(temporary, &destination)?;
        debug!(resource = name, path = %destination.display(), "resource relocated");
        Ok(destination)
    }

    fn received(&self, payload: MessagePayload, from: &PeerId) {
        let from = from.clone();
        self.notify(move |d| d.received(payload, &from));
    }

    fn peer_state_changed(&self, peer: &PeerId, state: PeerState) {
        let peer = peer.clone();
        self.notify(move |d| d.peer_state_changed(&peer, state));
    }

    fn decoding_error(&self, error: Error, from: &PeerId) {
        let from = from.clone();
        self.notify(move |d| d.decoding_error_occurred(error, &from));
    }

    fn resource_error(&self, error: Error, id: Uuid, from: &PeerId) {
        let from = from.clone();
        self.notify(move |d| d.resource_error_occurred(error, id, &from));
    }
}

/// Destination of a received resource inside `container`. Names that would leave the
/// container are rejected.
fn resource_destination(container: &Path, name: &str) -> Result<PathBuf, Error> {
    let relative = Path::new(name);
    let contained = !name.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !contained {
        return Err(Error::InvalidResourceName(name.to_string()));
    }
    Ok(container.join(relative))
}

/// Move `source` to `destination`, creating parent directories. When a plain rename is
/// not possible (e.g. across filesystems) the file is staged next to the destination
/// and persisted in one rename, so a partial destination file never exists.
fn move_file_creating_directories(source: &Path, destination: &Path) -> io::Result<()> {
    let parent = destination.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent")
    })?;
    fs::create_dir_all(parent)?;
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    copy_into_place(fs::File::open(source)?, source, destination, parent)
}

/// Once `destination` is persisted the move has succeeded; failing to remove the
/// source only leaves a stray file behind.
fn copy_into_place(
    mut source: fs::File,
    source_path: &Path,
    destination: &Path,
    parent: &Path,
) -> io::Result<()> {
    let mut staged = tempfile::NamedTempFile::new_in(parent)?;
    io::copy(&mut source, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(destination).map_err(|e| e.error)?;
    if let Err(e) = fs::remove_file(source_path) {
        warn!(path = %source_path.display(), error = %e, "could not remove moved resource source");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_keeps_id_directory() {
        let dest = resource_destination(Path::new("/inbox"), "abc/photo.jpg").unwrap();
        assert_eq!(dest, PathBuf::from("/inbox/abc/photo.jpg"));
    }

    #[test]
    fn destination_rejects_escaping_names() {
        for name in ["", "/etc/passwd", "abc/../../etc/passwd", "./abc", ".."] {
            assert!(
                matches!(
                    resource_destination(Path::new("/inbox"), name),
                    Err(Error::InvalidResourceName(_))
                ),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn move_creates_directories_and_removes_source() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("incoming.part");
        fs::write(&source, b"resource bytes").unwrap();
        let destination = tmp.path().join("inbox/1234/file.bin");

        move_file_creating_directories(&source, &destination).unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read(&destination).unwrap(), b"resource bytes");
    }

    #[test]
    fn copied_resource_survives_failed_source_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("incoming.part");
        fs::write(&source, b"resource bytes").unwrap();
        let handle = fs::File::open(&source).unwrap();
        fs::remove_file(&source).unwrap();
        let destination = tmp.path().join("file.bin");

        copy_into_place(handle, &source, &destination, tmp.path()).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"resource bytes");
    }

    #[test]
    fn move_missing_source_leaves_no_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let destination = tmp.path().join("inbox/file.bin");
        let err = move_file_creating_directories(&tmp.path().join("gone"), &destination)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!destination.exists());
    }
}
