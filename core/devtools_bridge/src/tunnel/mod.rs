//! Socket tunnel: many local socket streams over one data channel
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      Tunnel Threads                           │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  signaling thread  - decodes packets, owns connection table   │
//! │  worker (per id)   - blocking connect + read loop             │
//! │  writer (per tun.) - ordered local socket writes / shutdowns  │
//! │                                                               │
//! │  data channel send is thread-safe: workers send data packets  │
//! │  directly, under the bound-channel read lock                  │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`server::SocketTunnelServer`] connects to a target socket per
//! `CLIENT_OPEN`; [`client::SocketTunnelClient`] accepts local connections
//! and opens them through the channel.

pub mod client;
pub mod packet;
pub mod server;

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};

use crate::executor::SignalingHandle;
use crate::metrics::Metrics;
use crate::peer::{ChannelState, DataChannel, DataChannelObserver, MessageType};

pub use client::SocketTunnelClient;
pub use packet::ProtocolError;
pub use server::SocketTunnelServer;

// ============================================================================
// Constants
// ============================================================================

/// Largest payload read from a local socket into one data packet, keeping
/// packets within the 16 KiB message size every data channel accepts
pub const READ_BUFFER_SIZE: usize = 16 * 1024 - 1;

// ============================================================================
// Tunnel Contract
// ============================================================================

/// A tunnel that a session attaches to one of its data channels.
///
/// All methods must be called on the session's signaling thread.
pub trait SocketTunnel: Send + Sync {
    fn bind(&self, channel: Arc<dyn DataChannel>);

    /// Detach from the channel, closing every logical connection
    fn unbind(&self) -> Option<Arc<dyn DataChannel>>;

    fn dispose(&self);
}

/// Hook for local socket events, used for logging and metrics
pub trait TunnelObserver: Send + Sync {
    fn on_connection_opened(&self, _connection_id: u8) {}
    fn on_connect_failed(&self, _connection_id: u8, _error: &io::Error) {}
    fn on_socket_error(&self, _connection_id: u8, _error: &io::Error) {}
    fn on_protocol_error(&self, _error: &ProtocolError) {}
    fn on_bytes_to_socket(&self, _count: usize) {}
    fn on_bytes_to_channel(&self, _count: usize) {}
}

impl TunnelObserver for Metrics {
    fn on_connection_opened(&self, _connection_id: u8) {
        self.tunnel_connections_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connect_failed(&self, _connection_id: u8, _error: &io::Error) {
        self.connect_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_socket_error(&self, _connection_id: u8, _error: &io::Error) {
        self.socket_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_protocol_error(&self, _error: &ProtocolError) {
        self.protocol_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_bytes_to_socket(&self, count: usize) {
        self.bytes_to_socket_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn on_bytes_to_channel(&self, count: usize) {
        self.bytes_to_channel_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

// ============================================================================
// Bound Channel
// ============================================================================

/// The data channel a tunnel is bound to. `bind`/`unbind` on the signaling
/// thread race with `send` from worker threads, hence the lock.
#[derive(Default)]
pub(crate) struct BoundChannel {
    channel: RwLock<Option<Arc<dyn DataChannel>>>,
}

impl BoundChannel {
    pub(crate) fn bind(&self, channel: Arc<dyn DataChannel>) -> Option<Arc<dyn DataChannel>> {
        self.channel.write().replace(channel)
    }

    pub(crate) fn unbind(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.write().take()
    }

    /// Send a binary message; dropped when unbound
    pub(crate) fn send(&self, data: &[u8]) -> bool {
        match self.channel.read().as_ref() {
            Some(channel) => {
                channel.send(data, MessageType::Binary);
                true
            }
            None => false,
        }
    }

    pub(crate) fn close(&self) {
        if let Some(channel) = self.channel.read().as_ref() {
            channel.close();
        }
    }
}

// ============================================================================
// Channel Observer
// ============================================================================

/// Packet handling half of a tunnel, run on the signaling thread
pub(crate) trait PacketHandler: Send + Sync + 'static {
    fn executor(&self) -> &SignalingHandle;
    fn on_packet(self: Arc<Self>, data: Vec<u8>);
    fn on_channel_open(self: Arc<Self>);
    fn on_channel_closed(self: Arc<Self>);
}

/// Re-posts data channel events onto the tunnel's signaling thread
pub(crate) struct TunnelChannelObserver<H: PacketHandler> {
    handler: Weak<H>,
}

impl<H: PacketHandler> TunnelChannelObserver<H> {
    pub(crate) fn new(handler: &Arc<H>) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::downgrade(handler),
        })
    }

    fn post(&self, task: impl FnOnce(Arc<H>) + Send + 'static) {
        if let Some(handler) = self.handler.upgrade() {
            let weak = Arc::downgrade(&handler);
            handler.executor().post(move || {
                if let Some(handler) = weak.upgrade() {
                    task(handler);
                }
            });
        }
    }
}

impl<H: PacketHandler> DataChannelObserver for TunnelChannelObserver<H> {
    fn on_state_change(&self, state: ChannelState) {
        match state {
            ChannelState::Open => self.post(|handler| handler.on_channel_open()),
            ChannelState::Closed => self.post(|handler| handler.on_channel_closed()),
        }
    }

    fn on_message(&self, data: &[u8]) {
        let data = data.to_vec();
        self.post(move |handler| handler.on_packet(data));
    }
}

// ============================================================================
// Logical Connection
// ============================================================================

enum IoState {
    /// Server side, before the target socket has connected
    Connecting { shutdown_output: bool },
    /// `control` is kept for shutdowns issued off the writer thread
    Connected { control: UnixStream },
    Closed,
}

/// Local socket end of one logical connection, shared by the signaling
/// thread, the tunnel writer and the connection's worker.
pub(crate) struct Connection {
    id: u8,
    io: Mutex<IoState>,
    writer: Mutex<Option<UnixStream>>,
    acknowledged: AtomicBool,
}

impl Connection {
    pub(crate) fn connecting(id: u8) -> Arc<Self> {
        Arc::new(Self {
            id,
            io: Mutex::new(IoState::Connecting {
                shutdown_output: false,
            }),
            writer: Mutex::new(None),
            acknowledged: AtomicBool::new(false),
        })
    }

    pub(crate) fn connected(id: u8, stream: UnixStream) -> io::Result<Arc<Self>> {
        let writer = stream.try_clone()?;
        Ok(Arc::new(Self {
            id,
            io: Mutex::new(IoState::Connected { control: stream }),
            writer: Mutex::new(Some(writer)),
            acknowledged: AtomicBool::new(false),
        }))
    }

    pub(crate) fn id(&self) -> u8 {
        self.id
    }

    /// Install a freshly connected stream; returns the read half for the
    /// worker, or `None` if the connection was closed meanwhile.
    pub(crate) fn attach(&self, stream: UnixStream) -> io::Result<Option<UnixStream>> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;

        let mut io = self.io.lock();
        let shutdown_output = match &*io {
            IoState::Connecting { shutdown_output } => *shutdown_output,
            IoState::Connected { .. } | IoState::Closed => return Ok(None),
        };
        if shutdown_output {
            let _ = stream.shutdown(Shutdown::Write);
        }
        *self.writer.lock() = Some(writer);
        *io = IoState::Connected { control: stream };
        Ok(Some(reader))
    }

    /// A second handle on the connected stream for a reader worker
    pub(crate) fn reader(&self) -> io::Result<UnixStream> {
        match &*self.io.lock() {
            IoState::Connected { control } => control.try_clone(),
            _ => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    pub(crate) fn mark_acknowledged(&self) {
        self.acknowledged.store(true, Ordering::Release);
    }

    pub(crate) fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    /// Writer thread only
    pub(crate) fn write(&self, data: &[u8]) -> io::Result<()> {
        match self.writer.lock().as_mut() {
            Some(stream) => stream.write_all(data),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Writer thread only, so that pending writes drain first
    pub(crate) fn shutdown_output(&self) {
        match &mut *self.io.lock() {
            IoState::Connecting { shutdown_output } => *shutdown_output = true,
            IoState::Connected { control } => {
                if let Err(e) = control.shutdown(Shutdown::Write) {
                    log::debug!("Connection {}: shutdown(write) failed: {}", self.id, e);
                }
            }
            IoState::Closed => {}
        }
    }

    /// Shut down both directions; unblocks the worker's read loop
    pub(crate) fn close(&self) {
        let mut io = self.io.lock();
        if let IoState::Connected { control } = &*io {
            let _ = control.shutdown(Shutdown::Both);
        }
        *io = IoState::Closed;
    }
}

/// Copy local socket reads into data packets until EOF or error
pub(crate) fn relay_reads(
    reader: &mut UnixStream,
    connection_id: u8,
    channel: &BoundChannel,
    observer: &dyn TunnelObserver,
) -> io::Result<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                log::trace!("Connection {}: {} bytes to channel", connection_id, n);
                if !channel.send(&packet::encode_data(connection_id, &buf[..n])) {
                    return Ok(());
                }
                observer.on_bytes_to_channel(n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Socket Writer
// ============================================================================

type WriteTask = Box<dyn FnOnce() + Send + 'static>;

/// Single writer thread per tunnel. Keeps local socket writes ordered
/// without blocking the signaling thread.
pub(crate) struct SocketWriter {
    tx: Mutex<Option<Sender<WriteTask>>>,
}

impl SocketWriter {
    pub(crate) fn spawn(name: &str) -> io::Result<Self> {
        let (tx, rx) = unbounded::<WriteTask>();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in rx {
                    task();
                }
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
        })
    }

    pub(crate) fn submit(&self, task: impl FnOnce() + Send + 'static) {
        match self.tx.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(Box::new(task));
            }
            None => log::debug!("Writer stopped, dropping task"),
        }
    }

    /// Let queued tasks finish, then stop the thread
    pub(crate) fn shutdown(&self) {
        self.tx.lock().take();
    }
}

// ============================================================================
// Local Sockets
// ============================================================================

/// Connect to a local socket. `@name` addresses the Linux abstract
/// namespace; anything else is a filesystem path.
pub fn connect_local(name: &str) -> io::Result<UnixStream> {
    match name.strip_prefix('@') {
        Some(abstract_name) => connect_abstract(abstract_name),
        None => UnixStream::connect(name),
    }
}

/// Listen on a local socket, same naming as [`connect_local`]
pub fn bind_local(name: &str) -> io::Result<UnixListener> {
    match name.strip_prefix('@') {
        Some(abstract_name) => bind_abstract(abstract_name),
        None => UnixListener::bind(name),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    UnixStream::connect_addr(&addr)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(_name: &str) -> io::Result<UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract sockets need Linux",
    ))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    UnixListener::bind_addr(&addr)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_abstract(_name: &str) -> io::Result<UnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract sockets need Linux",
    ))
}

// ============================================================================
// Tests
// ============================================================================
