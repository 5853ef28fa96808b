//! Client side of the socket tunnel
//!
//! Listens on a local socket. Every accepted stream becomes one logical
//! connection with the lowest free id, announced with `CLIENT_OPEN`.
//! Streams accepted before the data channel opens wait in a queue.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;

use super::packet::{self, OpCode, Packet, ProtocolError, MAX_CONNECTION_ID, MIN_CONNECTION_ID};
use super::{
    bind_local, connect_local, relay_reads, BoundChannel, Connection, PacketHandler, SocketTunnel,
    SocketWriter, TunnelChannelObserver, TunnelObserver,
};
use crate::executor::{SignalingHandle, ThreadChecker};
use crate::peer::DataChannel;

struct Entry {
    conn: Arc<Connection>,
    client_open: bool,
    server_open: bool,
}

#[derive(Default)]
struct ClientState {
    connections: HashMap<u8, Entry>,
    /// Accepted before the channel opened
    pending: VecDeque<UnixStream>,
    channel_open: bool,
    failed: bool,
}

/// Tunnel end that exposes a remote socket as a local listening socket
pub struct SocketTunnelClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    listen_name: String,
    executor: SignalingHandle,
    checker: ThreadChecker,
    channel: BoundChannel,
    writer: SocketWriter,
    observer: Arc<dyn TunnelObserver>,
    stopping: AtomicBool,
    state: Mutex<ClientState>,
}

impl SocketTunnelClient {
    /// Start listening on `listen_name` (a path, or `@name`)
    pub fn new(
        listen_name: impl Into<String>,
        executor: SignalingHandle,
        observer: Arc<dyn TunnelObserver>,
    ) -> io::Result<Self> {
        let listen_name = listen_name.into();
        let listener = bind_local(&listen_name)?;
        let writer = SocketWriter::spawn("tunnel-client-writer")?;

        let inner = Arc::new(ClientInner {
            listen_name,
            executor,
            checker: ThreadChecker::new(),
            channel: BoundChannel::default(),
            writer,
            observer,
            stopping: AtomicBool::new(false),
            state: Mutex::new(ClientState::default()),
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("tunnel-client-accept".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    if !accept_one(&weak, stream) {
                        break;
                    }
                }
                log::debug!("Tunnel accept loop stopped");
            })?;

        log::info!("Tunnel client listening on '{}'", inner.listen_name);
        Ok(Self { inner })
    }

    pub fn listen_name(&self) -> &str {
        &self.inner.listen_name
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }
}

/// Hand one accepted stream to the signaling thread. Returns false once the
/// tunnel is gone.
fn accept_one(weak: &Weak<ClientInner>, stream: io::Result<UnixStream>) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    if inner.stopping.load(Ordering::Acquire) {
        return false;
    }
    match stream {
        Ok(stream) => {
            let handler = inner.clone();
            inner.executor.post(move || handler.on_accepted(stream))
        }
        Err(e) => {
            log::warn!("Accept on '{}' failed: {}", inner.listen_name, e);
            true
        }
    }
}

impl SocketTunnel for SocketTunnelClient {
    fn bind(&self, channel: Arc<dyn DataChannel>) {
        debug_assert!(self.inner.checker.check(), "bind off the signaling thread");

        channel.register_observer(TunnelChannelObserver::new(&self.inner));
        if let Some(previous) = self.inner.channel.bind(channel) {
            previous.unregister_observer();
        }
        let mut state = self.inner.state.lock();
        state.failed = false;
        state.channel_open = false;
    }

    fn unbind(&self) -> Option<Arc<dyn DataChannel>> {
        debug_assert!(self.inner.checker.check(), "unbind off the signaling thread");

        let channel = self.inner.channel.unbind();
        if let Some(channel) = &channel {
            channel.unregister_observer();
        }
        self.inner.state.lock().channel_open = false;
        self.inner.close_all();
        channel
    }

    fn dispose(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.unbind();
        self.inner.state.lock().pending.clear();
        self.inner.writer.shutdown();

        // Wake the accept loop so it sees the stop flag.
        let _ = connect_local(&self.inner.listen_name);
        if !self.inner.listen_name.starts_with('@') {
            if let Err(e) = std::fs::remove_file(Path::new(&self.inner.listen_name)) {
                log::debug!("Removing '{}' failed: {}", self.inner.listen_name, e);
            }
        }
        log::info!("Tunnel client on '{}' disposed", self.inner.listen_name);
    }
}

impl PacketHandler for ClientInner {
    fn executor(&self) -> &SignalingHandle {
        &self.executor
    }

    fn on_packet(self: Arc<Self>, data: Vec<u8>) {
        debug_assert!(self.checker.check(), "packet off the signaling thread");

        if self.state.lock().failed {
            return;
        }

        let result = match packet::decode_packet(&data) {
            Ok(Packet::Control {
                op: OpCode::ServerOpenAck,
                connection_id,
            }) => self.on_open_ack(connection_id),
            Ok(Packet::Control {
                op: OpCode::ServerClose,
                connection_id,
            }) => self.on_server_close(connection_id),
            Ok(Packet::Control { op, connection_id }) => {
                Err(ProtocolError::UnexpectedControl { op, connection_id })
            }
            Ok(Packet::Data {
                connection_id,
                payload,
            }) => self.on_data(connection_id, payload),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            log::warn!("Tunnel protocol error, closing channel: {}", e);
            self.observer.on_protocol_error(&e);
            self.state.lock().failed = true;
            self.channel.close();
            self.close_all();
        }
    }

    fn on_channel_open(self: Arc<Self>) {
        let pending: Vec<UnixStream> = {
            let mut state = self.state.lock();
            state.channel_open = true;
            state.pending.drain(..).collect()
        };
        log::debug!(
            "Tunnel channel open, {} queued connections",
            pending.len()
        );
        for stream in pending {
            self.open_connection(stream);
        }
    }

    fn on_channel_closed(self: Arc<Self>) {
        log::info!("Tunnel channel for '{}' closed", self.listen_name);
        {
            let mut state = self.state.lock();
            state.channel_open = false;
            state.failed = true;
            state.pending.clear();
        }
        self.close_all();
    }
}

impl ClientInner {
    fn on_accepted(self: Arc<Self>, stream: UnixStream) {
        {
            let mut state = self.state.lock();
            if state.failed {
                log::debug!("Dropping connection accepted on a closed tunnel");
                return;
            }
            if !state.channel_open {
                state.pending.push_back(stream);
                return;
            }
        }
        self.open_connection(stream);
    }

    fn open_connection(&self, stream: UnixStream) {
        let mut state = self.state.lock();
        let free = (MIN_CONNECTION_ID..=MAX_CONNECTION_ID)
            .find(|id| !state.connections.contains_key(id));
        let Some(connection_id) = free else {
            log::warn!("All connection ids in use, dropping local connection");
            return;
        };

        let conn = match Connection::connected(connection_id, stream) {
            Ok(conn) => conn,
            Err(e) => {
                self.observer.on_socket_error(connection_id, &e);
                return;
            }
        };
        state.connections.insert(
            connection_id,
            Entry {
                conn,
                client_open: true,
                server_open: true,
            },
        );
        drop(state);

        log::debug!("Connection {}: opening", connection_id);
        self.channel
            .send(&packet::encode_control(OpCode::ClientOpen, connection_id));
    }

    fn on_open_ack(self: &Arc<Self>, connection_id: u8) -> Result<(), ProtocolError> {
        let unexpected = ProtocolError::UnexpectedControl {
            op: OpCode::ServerOpenAck,
            connection_id,
        };
        let conn = match self.state.lock().connections.get(&connection_id) {
            Some(entry) if entry.server_open && !entry.conn.is_acknowledged() => {
                entry.conn.clone()
            }
            _ => return Err(unexpected),
        };
        conn.mark_acknowledged();
        self.observer.on_connection_opened(connection_id);
        log::info!("Connection {}: open", connection_id);

        let mut reader = match conn.reader() {
            Ok(reader) => reader,
            Err(e) => {
                self.observer.on_socket_error(connection_id, &e);
                self.on_client_side_done(&conn);
                return Ok(());
            }
        };

        let inner = self.clone();
        let worker_conn = conn.clone();
        let spawned = thread::Builder::new()
            .name(format!("tunnel-conn-{}", connection_id))
            .spawn(move || {
                if let Err(e) = relay_reads(&mut reader, connection_id, &inner.channel, &*inner.observer)
                {
                    log::debug!("Connection {}: read failed: {}", connection_id, e);
                    inner.observer.on_socket_error(connection_id, &e);
                }
                let handler = inner.clone();
                inner
                    .executor
                    .post(move || handler.on_client_side_done(&worker_conn));
            });

        if let Err(e) = spawned {
            log::error!("Connection {}: failed to spawn reader: {}", connection_id, e);
            self.on_client_side_done(&conn);
        }
        Ok(())
    }

    fn on_server_close(&self, connection_id: u8) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        let entry = match state.connections.get_mut(&connection_id) {
            Some(entry) if entry.server_open => entry,
            _ => {
                return Err(ProtocolError::UnexpectedControl {
                    op: OpCode::ServerClose,
                    connection_id,
                })
            }
        };
        entry.server_open = false;
        let conn = entry.conn.clone();

        if !conn.is_acknowledged() {
            // Remote connect failed: nothing was relayed, close both sides.
            log::debug!("Connection {}: refused by server", connection_id);
            state.connections.remove(&connection_id);
            drop(state);
            conn.close();
            self.channel
                .send(&packet::encode_control(OpCode::ClientClose, connection_id));
            return Ok(());
        }

        let release = !entry.client_open;
        if release {
            state.connections.remove(&connection_id);
        }
        drop(state);

        log::debug!("Connection {}: server closed", connection_id);
        self.writer.submit(move || {
            conn.shutdown_output();
            if release {
                conn.close();
            }
        });
        Ok(())
    }

    fn on_data(&self, connection_id: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let conn = match self.state.lock().connections.get(&connection_id) {
            Some(entry) if entry.server_open && entry.conn.is_acknowledged() => entry.conn.clone(),
            _ => return Err(ProtocolError::UnexpectedData(connection_id)),
        };

        let data = payload.to_vec();
        let observer = self.observer.clone();
        self.writer.submit(move || match conn.write(&data) {
            Ok(()) => observer.on_bytes_to_socket(data.len()),
            Err(e) => {
                log::warn!("Connection {}: write failed: {}", conn.id(), e);
                observer.on_socket_error(conn.id(), &e);
                conn.close();
            }
        });
        Ok(())
    }

    /// Signaling thread: the local stream hit EOF or failed
    fn on_client_side_done(&self, conn: &Arc<Connection>) {
        let connection_id = conn.id();
        let mut state = self.state.lock();
        let entry = match state.connections.get_mut(&connection_id) {
            Some(entry) if Arc::ptr_eq(&entry.conn, conn) && entry.client_open => entry,
            _ => return,
        };

        entry.client_open = false;
        self.channel
            .send(&packet::encode_control(OpCode::ClientClose, connection_id));
        log::debug!("Connection {}: client closed", connection_id);

        if !entry.server_open {
            state.connections.remove(&connection_id);
            drop(state);
            conn.close();
        }
    }

    fn close_all(&self) {
        let connections: Vec<Entry> = self
            .state
            .lock()
            .connections
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in connections {
            entry.conn.close();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SignalingThread;
    use crate::metrics::Metrics;
    use crate::peer::ChannelState;
    use crate::tunnel::packet::encode_control;
    use crate::tunnel::test_support::{flush, on_thread, RecordingChannel};
    use std::io::{Read, Write};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        listen_path: String,
        thread: SignalingThread,
        tunnel: Arc<SocketTunnelClient>,
        channel: Arc<RecordingChannel>,
        metrics: Arc<Metrics>,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let listen_path = dir.path().join("local.sock").to_str().unwrap().to_string();
        let thread = SignalingThread::spawn("tunnel-client-test").unwrap();
        let metrics = Arc::new(Metrics::new());
        let tunnel = Arc::new(
            SocketTunnelClient::new(listen_path.clone(), thread.handle(), metrics.clone()).unwrap(),
        );
        let channel = RecordingChannel::new();

        let bind_tunnel = tunnel.clone();
        let bind_channel = channel.clone();
        on_thread(&thread.handle(), move || bind_tunnel.bind(bind_channel));

        Fixture {
            _dir: dir,
            listen_path,
            thread,
            tunnel,
            channel,
            metrics,
        }
    }

    fn control(op: OpCode, id: u8) -> Vec<u8> {
        encode_control(op, id).to_vec()
    }

    fn open_channel(f: &Fixture) {
        f.channel.set_state(ChannelState::Open);
        flush(&f.thread.handle());
    }

    #[test]
    fn test_full_connection_lifecycle() {
        let f = fixture();
        open_channel(&f);

        let mut local = UnixStream::connect(&f.listen_path).unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ClientOpen, 1));
        f.channel.deliver(&control(OpCode::ServerOpenAck, 1));

        local.write_all(b"ping").unwrap();
        assert_eq!(f.channel.next_sent(), b"\x01ping".to_vec());

        f.channel.deliver(&packet::encode_data(1, b"pong"));
        f.channel.deliver(&control(OpCode::ServerClose, 1));
        let mut reply = Vec::new();
        local.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"pong");
        assert_eq!(f.tunnel.connection_count(), 1);

        drop(local);
        assert_eq!(f.channel.next_sent(), control(OpCode::ClientClose, 1));
        flush(&f.thread.handle());
        assert_eq!(f.tunnel.connection_count(), 0);
        assert_eq!(f.metrics.bytes_to_channel_total.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_connections_queue_until_channel_opens() {
        let f = fixture();
        let _local = UnixStream::connect(&f.listen_path).unwrap();
        flush(&f.thread.handle());
        std::thread::sleep(Duration::from_millis(50));
        flush(&f.thread.handle());
        assert!(f.channel.sent.is_empty());

        open_channel(&f);
        assert_eq!(f.channel.next_sent(), control(OpCode::ClientOpen, 1));
    }

    #[test]
    fn test_refused_connection_frees_lowest_id() {
        let f = fixture();
        open_channel(&f);

        let mut first = UnixStream::connect(&f.listen_path).unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ClientOpen, 1));
        let _second = UnixStream::connect(&f.listen_path).unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ClientOpen, 2));

        f.channel.deliver(&control(OpCode::ServerClose, 1));
        assert_eq!(f.channel.next_sent(), control(OpCode::ClientClose, 1));
        let mut buf = [0u8; 4];
        assert_eq!(first.read(&mut buf).unwrap(), 0);

        let _third = UnixStream::connect(&f.listen_path).unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ClientOpen, 1));
    }

    #[test]
    fn test_data_before_ack_closes_channel() {
        let f = fixture();
        open_channel(&f);

        let _local = UnixStream::connect(&f.listen_path).unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ClientOpen, 1));
        f.channel.deliver(&packet::encode_data(1, b"early"));
        flush(&f.thread.handle());

        assert!(f.channel.closed.load(Ordering::SeqCst));
        assert_eq!(f.tunnel.connection_count(), 0);
        assert_eq!(f.metrics.protocol_errors_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dispose_removes_listening_socket() {
        let f = fixture();
        let tunnel = f.tunnel.clone();
        on_thread(&f.thread.handle(), move || tunnel.dispose());
        assert!(!Path::new(&f.listen_path).exists());
        assert!(!f.channel.has_observer());
    }
}
