//! TCP session provider: plaintext length-prefixed frames, one connection per peer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use parcel_core::wire::{frame_len, FrameEncodeError, LEN_SIZE};
use parcel_core::{
    decode_frame, encode_frame, PeerId, PeerState, Progress, ResourceCompletion,
    SessionProvider, SessionProviderDelegate, TransportError,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Hello { protocol_version: u32, name: String },
    Data(Vec<u8>),
    Resource { name: String, contents: Vec<u8> },
}

/// One encoded frame queued for a connection's writer. `done` learns the write result.
struct Outbound {
    bytes: Vec<u8>,
    done: Option<oneshot::Sender<io::Result<()>>>,
}

type PeerSenders = HashMap<PeerId, mpsc::UnboundedSender<Outbound>>;

pub struct TcpSessionProvider {
    shared: Arc<Shared>,
}

struct Shared {
    local: PeerId,
    local_addr: SocketAddr,
    runtime: Handle,
    peers: Mutex<PeerSenders>,
    delegate: RwLock<Option<Weak<dyn SessionProviderDelegate>>>,
    staging: tempfile::TempDir,
    shutdown: watch::Sender<bool>,
}

impl TcpSessionProvider {
    /// Listen on `port` (all interfaces) and accept peers until [`SessionProvider::disconnect`].
    /// Must be called from within a tokio runtime.
    pub async fn bind(name: PeerId, port: u16) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let staging = tempfile::Builder::new().prefix("parcel-staging-").tempdir()?;
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            local: name,
            local_addr: listener.local_addr()?,
            runtime: Handle::current(),
            peers: Mutex::new(HashMap::new()),
            delegate: RwLock::new(None),
            staging,
            shutdown,
        });
        info!(addr = %shared.local_addr, node = %shared.local, "listening for peers");
        tokio::spawn(accept_loop(listener, shared.clone()));
        Ok(Arc::new(Self { shared }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Dial `addr` once in the background.
    pub fn connect(&self, addr: SocketAddr) {
        let shared = self.shared.clone();
        self.shared.runtime.spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = run_connection(stream, shared).await {
                        warn!(%addr, error = %e, "connection ended");
                    }
                }
                Err(e) => warn!(%addr, error = %e, "could not reach peer"),
            }
        });
    }
}

impl SessionProvider for TcpSessionProvider {
    fn local_peer(&self) -> PeerId {
        self.shared.local.clone()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.shared.peers().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn send(&self, data: &[u8], peers: &[PeerId]) -> Result<(), TransportError> {
        if peers.is_empty() {
            return Err(TransportError::Unsupported);
        }
        let bytes = encode_frame(&Frame::Data(data.to_vec())).map_err(encode_error)?;
        let senders = self.shared.peers();
        let targets = peers
            .iter()
            .map(|peer| senders.get(peer).ok_or(TransportError::NotConnected))
            .collect::<Result<Vec<_>, _>>()?;
        for tx in targets {
            tx.send(Outbound {
                bytes: bytes.clone(),
                done: None,
            })
            .map_err(|_| TransportError::NotConnected)?;
        }
        Ok(())
    }

    fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerId,
        completion: ResourceCompletion,
    ) -> Option<Progress> {
        let sender = self.shared.peers().get(peer).cloned();
        let Some(tx) = sender else {
            completion(Some(TransportError::NotConnected));
            return None;
        };
        let progress = Progress::new(1);
        let handle = progress.clone();
        let path = path.to_path_buf();
        let name = name.to_string();
        let peer = peer.clone();
        self.shared.runtime.spawn(async move {
            let result = transmit_resource(&path, name, &tx, &handle).await;
            match &result {
                Ok(()) => handle.set_completed_units(1),
                Err(e) => debug!(%peer, error = %e, "resource transfer failed"),
            }
            completion(result.err());
        });
        Some(progress)
    }

    fn set_delegate(&self, delegate: Option<Weak<dyn SessionProviderDelegate>>) {
        *self
            .shared
            .delegate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = delegate;
    }

    fn disconnect(&self) {
        self.shared.shutdown.send_replace(true);
        self.shared.peers().clear();
    }
}

impl Drop for TcpSessionProvider {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

async fn transmit_resource(
    path: &Path,
    name: String,
    tx: &mpsc::UnboundedSender<Outbound>,
    progress: &Progress,
) -> Result<(), TransportError> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|e| TransportError::Failed(format!("{}: {e}", path.display())))?;
    if progress.is_cancelled() {
        return Err(TransportError::Cancelled);
    }
    let bytes = encode_frame(&Frame::Resource { name, contents }).map_err(encode_error)?;
    let (done, written) = oneshot::channel();
    tx.send(Outbound {
        bytes,
        done: Some(done),
    })
    .map_err(|_| TransportError::NotConnected)?;
    match written.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TransportError::Failed(e.to_string())),
        Err(_) => Err(TransportError::NotConnected),
    }
}

fn encode_error(e: FrameEncodeError) -> TransportError {
    match e {
        FrameEncodeError::TooLarge => TransportError::InvalidParameter,
        FrameEncodeError::Encode(e) => TransportError::Failed(e.to_string()),
    }
}

impl Shared {
    fn peers(&self) -> MutexGuard<'_, PeerSenders> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delegate(&self) -> Option<Arc<dyn SessionProviderDelegate>> {
        self.delegate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn announce(&self, peer: &PeerId, state: PeerState) {
        if let Some(delegate) = self.delegate() {
            delegate.peer_did_change_state(peer, state);
        }
    }

    /// Ask the delegate whether to keep the connection. Without a delegate there is
    /// nobody to ask and the peer is accepted.
    async fn accept_peer(&self, peer: &PeerId) -> bool {
        let Some(delegate) = self.delegate() else {
            return true;
        };
        let (tx, rx) = oneshot::channel();
        delegate.did_receive_certificate(
            None,
            peer,
            Box::new(move |accepted| {
                let _ = tx.send(accepted);
            }),
        );
        drop(delegate);
        rx.await.unwrap_or(false)
    }

    fn deliver(self: &Arc<Self>, frame: Frame, from: &PeerId) {
        match frame {
            Frame::Data(data) => {
                if let Some(delegate) = self.delegate() {
                    delegate.did_receive_data(&data, from);
                }
            }
            Frame::Resource { name, contents } => {
                let shared = self.clone();
                let from = from.clone();
                // Relocation downstream does blocking file I/O.
                tokio::task::spawn_blocking(move || shared.deliver_resource(&name, &from, &contents));
            }
            Frame::Hello { .. } => warn!(peer = %from, "unexpected hello; ignored"),
        }
    }

    fn deliver_resource(&self, name: &str, from: &PeerId, contents: &[u8]) {
        let Some(delegate) = self.delegate() else {
            return;
        };
        match stage(self.staging.path(), contents) {
            Ok(staged) => {
                delegate.did_finish_receiving_resource(name, from, Some(staged.path()), None);
            }
            Err(e) => {
                warn!(peer = %from, resource = name, error = %e, "could not stage resource");
                delegate.did_finish_receiving_resource(
                    name,
                    from,
                    None,
                    Some(TransportError::Failed(e.to_string())),
                );
            }
        }
    }
}

/// Write `contents` to a fresh temporary file. The file is removed when the handle
/// drops unless the delegate moved it away first.
fn stage(dir: &Path, contents: &[u8]) -> io::Result<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(contents)?;
    staged.flush()?;
    Ok(staged)
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_connection(stream, shared).await {
                            debug!(%addr, error = %e, "inbound connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed; listener stopped");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_connection(stream: TcpStream, shared: Arc<Shared>) -> io::Result<()> {
    let mut shutdown = shared.shutdown.subscribe();
    if *shutdown.borrow() {
        return Ok(());
    }
    let (mut reader, mut writer) = stream.into_split();
    let peer = handshake(&mut reader, &mut writer, &shared.local).await?;
    if !shared.accept_peer(&peer).await {
        info!(%peer, "peer rejected");
        return Err(io::Error::new(io::ErrorKind::PermissionDenied, "peer rejected"));
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    // Newest connection wins; an older one keeps reading until it closes.
    shared.peers().insert(peer.clone(), tx.clone());
    info!(%peer, "peer connected");
    shared.announce(&peer, PeerState::Connected);

    let writer_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let result = write_all_flush(&mut writer, &outbound.bytes).await;
            let failed = result.is_err();
            if let Some(done) = outbound.done {
                let _ = done.send(result);
            }
            if failed {
                break;
            }
        }
    });

    let ended = loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(frame) => shared.deliver(frame, &peer),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
                Err(e) => break Err(e),
            },
            _ = shutdown.changed() => break Ok(()),
        }
    };

    writer_task.abort();
    let removed = {
        let mut peers = shared.peers();
        match peers.get(&peer) {
            Some(current) if current.same_channel(&tx) => peers.remove(&peer).is_some(),
            _ => false,
        }
    };
    // After disconnect() the map is already empty; announce anyway.
    if removed || *shutdown.borrow() {
        info!(%peer, "peer disconnected");
        shared.announce(&peer, PeerState::NotConnected);
    }
    ended
}

/// Exchange `Hello` frames. Both sides write first, so either may dial.
async fn handshake<R, W>(reader: &mut R, writer: &mut W, local: &PeerId) -> io::Result<PeerId>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = encode_frame(&Frame::Hello {
        protocol_version: PROTOCOL_VERSION,
        name: local.as_str().to_string(),
    })
    .map_err(invalid_data)?;
    write_all_flush(writer, &hello).await?;
    match read_frame(reader).await? {
        Frame::Hello {
            protocol_version,
            name,
        } if protocol_version == PROTOCOL_VERSION => Ok(PeerId::new(name)),
        Frame::Hello {
            protocol_version, ..
        } => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported protocol version {protocol_version}"),
        )),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected hello",
        )),
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut header = [0u8; LEN_SIZE];
    reader.read_exact(&mut header).await?;
    let len = frame_len(header).map_err(invalid_data)?;
    let mut buf = vec![0u8; LEN_SIZE + len];
    buf[..LEN_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut buf[LEN_SIZE..]).await?;
    let (frame, _) = decode_frame::<Frame>(&buf).map_err(invalid_data)?;
    Ok(frame)
}

async fn write_all_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

fn invalid_data<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
