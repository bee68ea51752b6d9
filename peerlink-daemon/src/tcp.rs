//! TCP transport: one connection per send carrying one length-prefixed frame of blob
//! bytes; each listener accepts connections and turns every frame into an inbound blob.
//!
//! The stream frame is this transport's own delimiter and treats the blob as opaque.
//! With `BincodeCodec` the blob is itself a frame, so a packet on the wire carries two
//! length prefixes: the outer one ends at the blob, the inner one is the codec's.
//!
//! Writes and reads go in chunks. Before each write the sender asks the reactor for its
//! outbound allowance, and after each read the receiver asks how long to pause, so the
//! configured bandwidth caps apply to live connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use peerlink_core::transfer::Direction;
use peerlink_core::wire::{frame_bytes, LEN_SIZE, MAX_FRAME_LEN};
use peerlink_core::{BlobRef, ListenOptions, ListenerHandle, Transport, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::reactor::{EventSender, ReactorEvent};
use crate::store::FsBlobStore;

pub const PROTOCOL: &str = "tcp";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_CHUNK: usize = 64 * 1024;
const RECEIVE_CHUNK: usize = 64 * 1024;

/// Bandwidth questions for the reactor. If it is gone, traffic runs unthrottled.
#[derive(Clone)]
struct Throttle {
    events: EventSender,
}

impl Throttle {
    async fn send_chunk(&self, prev: usize, requested: usize) -> usize {
        let (reply, rx) = oneshot::channel();
        let asked = self.events.send(ReactorEvent::SendChunk {
            prev,
            requested,
            reply,
        });
        if asked.is_err() {
            return requested;
        }
        rx.await.unwrap_or(requested).max(1)
    }

    async fn pause_after(&self, bytes: u64) {
        let (reply, rx) = oneshot::channel();
        if self
            .events
            .send(ReactorEvent::ReceiveDelay { bytes, reply })
            .is_err()
        {
            return;
        }
        if let Ok(delay) = rx.await {
            if !delay.is_zero() {
                debug!("inbound cap reached, pausing {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

struct ActiveListener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
    addr: SocketAddr,
}

#[derive(Default)]
struct ListenerSetInner {
    next_id: u64,
    active: HashMap<ListenerHandle, ActiveListener>,
    /// Listeners asked to stop whose tasks have not been awaited yet.
    stopped: Vec<JoinHandle<()>>,
}

/// Listener bookkeeping shared between the transport (inside the dispatcher) and the
/// reactor, which awaits the teardown of stopped listeners.
#[derive(Clone, Default)]
pub struct ListenerSet {
    inner: Arc<Mutex<ListenerSetInner>>,
}

impl ListenerSet {
    fn lock(&self) -> MutexGuard<'_, ListenerSetInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_addr(&self, handle: ListenerHandle) -> Option<SocketAddr> {
        self.lock().active.get(&handle).map(|l| l.addr)
    }

    /// Join handles of listeners that were asked to stop.
    pub fn take_stopped(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.lock().stopped)
    }
}

pub struct TcpTransport {
    store: FsBlobStore,
    events: EventSender,
    listeners: ListenerSet,
}

impl TcpTransport {
    pub fn new(store: FsBlobStore, events: EventSender) -> Self {
        Self {
            store,
            events,
            listeners: ListenerSet::default(),
        }
    }

    pub fn listeners(&self) -> ListenerSet {
        self.listeners.clone()
    }
}

impl Transport for TcpTransport {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    fn send(&mut self, blob: &BlobRef, host: &str, port: u16) -> Result<(), TransportError> {
        if host.is_empty() || port == 0 {
            return Err(TransportError::InvalidAddress {
                host: host.to_owned(),
                port,
            });
        }
        let path = self.store.path(blob);
        let events = self.events.clone();
        let throttle = Throttle {
            events: events.clone(),
        };
        let blob = blob.clone();
        let host = host.to_owned();
        tokio::spawn(async move {
            let succeeded = match send_frame(&path, &host, port, &throttle).await {
                Ok(bytes) => {
                    let _ = events.send(ReactorEvent::Transfer {
                        protocol: PROTOCOL.into(),
                        direction: Direction::Send,
                        remote_address: format!("{}:{}", host, port),
                        blob: blob.clone(),
                        bytes,
                    });
                    true
                }
                Err(e) => {
                    debug!("tcp send of {} to {}:{} failed: {}", blob, host, port, e);
                    false
                }
            };
            let _ = events.send(ReactorEvent::SendCompleted {
                blob,
                succeeded,
                protocol: PROTOCOL.into(),
                host,
            });
        });
        Ok(())
    }

    fn receive(&mut self, options: &ListenOptions) -> Result<ListenerHandle, TransportError> {
        let std_listener = std::net::TcpListener::bind((options.host.as_str(), options.port))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let addr = listener.local_addr()?;
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            stop_rx,
            self.store.clone(),
            self.events.clone(),
        ));
        info!("tcp listener bound to {}", addr);

        let mut set = self.listeners.lock();
        set.next_id += 1;
        let handle = ListenerHandle(set.next_id);
        set.active.insert(handle, ActiveListener { stop, task, addr });
        Ok(handle)
    }

    fn stop_listening(&mut self, handle: ListenerHandle) -> Result<(), TransportError> {
        let mut set = self.listeners.lock();
        let listener = set
            .active
            .remove(&handle)
            .ok_or_else(|| TransportError::Unavailable(format!("no tcp listener {}", handle.0)))?;
        // The accept loop may already be gone; its task is awaited either way.
        let _ = listener.stop.send(());
        set.stopped.push(listener.task);
        Ok(())
    }
}

/// Connect, write one frame of the blob's bytes, close. Returns the payload size.
async fn send_frame(
    path: &Path,
    host: &str,
    port: u16,
    throttle: &Throttle,
) -> std::io::Result<u64> {
    let bytes = tokio::fs::read(path).await?;
    let frame = frame_bytes(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    let mut allowed = SEND_CHUNK;
    let mut rest = frame.as_slice();
    while !rest.is_empty() {
        allowed = throttle.send_chunk(allowed, SEND_CHUNK).await;
        let (chunk, tail) = rest.split_at(allowed.min(rest.len()));
        stream.write_all(chunk).await?;
        rest = tail;
    }
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(bytes.len() as u64)
}

async fn accept_loop(
    listener: TcpListener,
    mut stop: oneshot::Receiver<()>,
    store: FsBlobStore,
    events: EventSender,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(read_frames(stream, peer, store.clone(), events.clone()));
                }
                Err(e) => {
                    warn!("tcp accept failed: {}", e);
                    break;
                }
            },
        }
    }
    if let Ok(addr) = listener.local_addr() {
        debug!("tcp listener on {} stopped", addr);
    }
}

/// Read frames until the peer closes; every frame becomes an inbound blob.
async fn read_frames(
    mut stream: TcpStream,
    peer: SocketAddr,
    store: FsBlobStore,
    events: EventSender,
) {
    let host = peer.ip().to_string();
    let throttle = Throttle {
        events: events.clone(),
    };
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if stream.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            warn!("oversized frame ({} bytes) from {}, closing", len, peer);
            break;
        }
        let mut body = vec![0u8; len as usize];
        if read_body(&mut stream, &mut body, &throttle).await.is_err() {
            break;
        }
        let blob = store.new_ref("inbox");
        if let Err(e) = tokio::fs::write(store.path(&blob), &body).await {
            warn!("failed to store inbound blob from {}: {}", peer, e);
            break;
        }
        let _ = events.send(ReactorEvent::Transfer {
            protocol: PROTOCOL.into(),
            direction: Direction::Receive,
            remote_address: peer.to_string(),
            blob: blob.clone(),
            bytes: u64::from(len),
        });
        let _ = events.send(ReactorEvent::Inbound {
            blob,
            protocol: PROTOCOL.into(),
            host: host.clone(),
        });
    }
}

async fn read_body(
    stream: &mut TcpStream,
    body: &mut [u8],
    throttle: &Throttle,
) -> std::io::Result<()> {
    for chunk in body.chunks_mut(RECEIVE_CHUNK) {
        stream.read_exact(chunk).await?;
        throttle.pause_after(chunk.len() as u64).await;
    }
    Ok(())
}
