//! Server side of the socket tunnel
//!
//! # Connection Lifecycle
//!
//! ```text
//! client                 SocketTunnelServer                target socket
//!   │── CLIENT_OPEN(n) ────►│ worker: connect ──────────────────►│
//!   │◄── SERVER_OPEN_ACK(n)─│ (or SERVER_CLOSE(n) on failure)    │
//!   │── data(n) ───────────►│ writer: write ────────────────────►│
//!   │◄─────────── data(n) ──│ worker: read ◄─────────────────────│
//!   │── CLIENT_CLOSE(n) ───►│ writer: shutdown(write) ──────────►│
//!   │◄── SERVER_CLOSE(n) ───│ worker: read loop ended ◄── EOF ───│
//! ```
//!
//! Connection `n` is released, and may be opened again, only once both
//! `CLIENT_CLOSE(n)` has been processed and `SERVER_CLOSE(n)` has been sent.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use super::packet::{self, OpCode, Packet, ProtocolError};
use super::{
    connect_local, relay_reads, BoundChannel, Connection, PacketHandler, SocketTunnel,
    SocketWriter, TunnelChannelObserver, TunnelObserver,
};
use crate::executor::{SignalingHandle, ThreadChecker};
use crate::peer::DataChannel;

/// Bookkeeping for one logical connection
struct Entry {
    conn: Arc<Connection>,
    /// Client may still send (no CLIENT_CLOSE yet)
    client_open: bool,
    /// Server may still send (no SERVER_CLOSE yet)
    server_open: bool,
}

#[derive(Default)]
struct ServerState {
    connections: HashMap<u8, Entry>,
    /// Set after a protocol error or channel close; packets are ignored
    failed: bool,
}

/// Tunnel end that connects each logical connection to one target socket
pub struct SocketTunnelServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    socket_name: String,
    executor: SignalingHandle,
    checker: ThreadChecker,
    channel: BoundChannel,
    writer: SocketWriter,
    observer: Arc<dyn TunnelObserver>,
    state: Mutex<ServerState>,
}

impl SocketTunnelServer {
    /// Create a tunnel that forwards to `socket_name` (a path, or `@name`
    /// for the abstract namespace)
    pub fn new(
        socket_name: impl Into<String>,
        executor: SignalingHandle,
        observer: Arc<dyn TunnelObserver>,
    ) -> io::Result<Self> {
        let socket_name = socket_name.into();
        let writer = SocketWriter::spawn("tunnel-server-writer")?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                socket_name,
                executor,
                checker: ThreadChecker::new(),
                channel: BoundChannel::default(),
                writer,
                observer,
                state: Mutex::new(ServerState::default()),
            }),
        })
    }

    pub fn socket_name(&self) -> &str {
        &self.inner.socket_name
    }

    /// Number of connection ids currently in use
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }
}

impl SocketTunnel for SocketTunnelServer {
    fn bind(&self, channel: Arc<dyn DataChannel>) {
        debug_assert!(self.inner.checker.check(), "bind off the signaling thread");

        channel.register_observer(TunnelChannelObserver::new(&self.inner));
        if let Some(previous) = self.inner.channel.bind(channel) {
            previous.unregister_observer();
        }
        self.inner.state.lock().failed = false;
    }

    fn unbind(&self) -> Option<Arc<dyn DataChannel>> {
        debug_assert!(self.inner.checker.check(), "unbind off the signaling thread");

        let channel = self.inner.channel.unbind();
        if let Some(channel) = &channel {
            channel.unregister_observer();
        }
        self.inner.close_all();
        channel
    }

    fn dispose(&self) {
        self.unbind();
        self.inner.writer.shutdown();
    }
}

impl PacketHandler for ServerInner {
    fn executor(&self) -> &SignalingHandle {
        &self.executor
    }

    fn on_packet(self: Arc<Self>, data: Vec<u8>) {
        debug_assert!(self.checker.check(), "packet off the signaling thread");

        if self.state.lock().failed {
            log::trace!("Ignoring {} byte packet on failed tunnel", data.len());
            return;
        }

        let result = match packet::decode_packet(&data) {
            Ok(Packet::Control {
                op: OpCode::ClientOpen,
                connection_id,
            }) => self.on_client_open(connection_id),
            Ok(Packet::Control {
                op: OpCode::ClientClose,
                connection_id,
            }) => self.on_client_close(connection_id),
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
            self.on_protocol_error(e);
        }
    }

    fn on_channel_open(self: Arc<Self>) {
        log::debug!("Tunnel channel to '{}' open", self.socket_name);
    }

    fn on_channel_closed(self: Arc<Self>) {
        log::info!("Tunnel channel to '{}' closed", self.socket_name);
        self.state.lock().failed = true;
        self.close_all();
    }
}

impl ServerInner {
    fn on_client_open(self: &Arc<Self>, connection_id: u8) -> Result<(), ProtocolError> {
        let conn = {
            let mut state = self.state.lock();
            if state.connections.contains_key(&connection_id) {
                return Err(ProtocolError::UnexpectedControl {
                    op: OpCode::ClientOpen,
                    connection_id,
                });
            }
            let conn = Connection::connecting(connection_id);
            state.connections.insert(
                connection_id,
                Entry {
                    conn: conn.clone(),
                    client_open: true,
                    server_open: true,
                },
            );
            conn
        };

        log::debug!("Connection {}: opening '{}'", connection_id, self.socket_name);

        let inner = self.clone();
        let worker_conn = conn.clone();
        let spawned = thread::Builder::new()
            .name(format!("tunnel-conn-{}", connection_id))
            .spawn(move || inner.run_connection(worker_conn));

        if let Err(e) = spawned {
            log::error!("Connection {}: failed to spawn worker: {}", connection_id, e);
            self.observer.on_connect_failed(connection_id, &e);
            self.on_server_side_done(&conn);
        }
        Ok(())
    }

    fn on_client_close(self: &Arc<Self>, connection_id: u8) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        let entry = match state.connections.get_mut(&connection_id) {
            Some(entry) if entry.client_open => entry,
            _ => {
                return Err(ProtocolError::UnexpectedControl {
                    op: OpCode::ClientClose,
                    connection_id,
                })
            }
        };

        log::debug!("Connection {}: client closed", connection_id);
        entry.client_open = false;
        let conn = entry.conn.clone();
        let release = !entry.server_open;
        if release {
            state.connections.remove(&connection_id);
        }
        drop(state);

        self.writer.submit(move || {
            conn.shutdown_output();
            if release {
                conn.close();
            }
        });
        if release {
            log::debug!("Connection {}: released", connection_id);
        }
        Ok(())
    }

    fn on_data(self: &Arc<Self>, connection_id: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let conn = match self.state.lock().connections.get(&connection_id) {
            Some(entry) if entry.client_open && entry.conn.is_acknowledged() => entry.conn.clone(),
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

    /// Worker thread: connect, acknowledge, relay reads until EOF
    fn run_connection(self: Arc<Self>, conn: Arc<Connection>) {
        let connection_id = conn.id();

        let stream = match connect_local(&self.socket_name) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!(
                    "Connection {}: connect to '{}' failed: {}",
                    connection_id,
                    self.socket_name,
                    e
                );
                self.observer.on_connect_failed(connection_id, &e);
                self.post_server_side_done(conn);
                return;
            }
        };

        let mut reader = match conn.attach(stream) {
            Ok(Some(reader)) => reader,
            Ok(None) => {
                log::debug!("Connection {}: closed while connecting", connection_id);
                self.post_server_side_done(conn);
                return;
            }
            Err(e) => {
                self.observer.on_connect_failed(connection_id, &e);
                self.post_server_side_done(conn);
                return;
            }
        };

        conn.mark_acknowledged();
        self.channel
            .send(&packet::encode_control(OpCode::ServerOpenAck, connection_id));
        self.observer.on_connection_opened(connection_id);
        log::info!("Connection {}: open", connection_id);

        if let Err(e) = relay_reads(&mut reader, connection_id, &self.channel, &*self.observer) {
            log::debug!("Connection {}: read failed: {}", connection_id, e);
            self.observer.on_socket_error(connection_id, &e);
        }

        self.post_server_side_done(conn);
    }

    fn post_server_side_done(self: &Arc<Self>, conn: Arc<Connection>) {
        let inner = self.clone();
        self.executor.post(move || inner.on_server_side_done(&conn));
    }

    /// Signaling thread: the server will send nothing more on `conn`
    fn on_server_side_done(&self, conn: &Arc<Connection>) {
        let connection_id = conn.id();
        let mut state = self.state.lock();
        let entry = match state.connections.get_mut(&connection_id) {
            Some(entry) if Arc::ptr_eq(&entry.conn, conn) && entry.server_open => entry,
            _ => return,
        };

        entry.server_open = false;
        self.channel
            .send(&packet::encode_control(OpCode::ServerClose, connection_id));
        log::debug!("Connection {}: server closed", connection_id);

        if !entry.client_open {
            state.connections.remove(&connection_id);
            drop(state);
            conn.close();
            log::debug!("Connection {}: released", connection_id);
        }
    }

    fn on_protocol_error(&self, error: ProtocolError) {
        log::warn!("Tunnel protocol error, closing channel: {}", error);
        self.observer.on_protocol_error(&error);
        self.state.lock().failed = true;
        self.channel.close();
        self.close_all();
    }

    fn close_all(&self) {
        let connections: Vec<Entry> = self
            .state
            .lock()
            .connections
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        if !connections.is_empty() {
            log::info!("Closing {} tunnel connections", connections.len());
        }
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
    use crate::tunnel::test_support::{flush, on_thread, RecordingChannel, WAIT};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        socket_path: String,
        thread: SignalingThread,
        tunnel: Arc<SocketTunnelServer>,
        channel: Arc<RecordingChannel>,
        metrics: Arc<Metrics>,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("devtools.sock").to_str().unwrap().to_string();
        let thread = SignalingThread::spawn("tunnel-server-test").unwrap();
        let metrics = Arc::new(Metrics::new());
        let tunnel = Arc::new(
            SocketTunnelServer::new(socket_path.clone(), thread.handle(), metrics.clone()).unwrap(),
        );
        let channel = RecordingChannel::new();

        let bind_tunnel = tunnel.clone();
        let bind_channel = channel.clone();
        on_thread(&thread.handle(), move || bind_tunnel.bind(bind_channel));

        Fixture {
            _dir: dir,
            socket_path,
            thread,
            tunnel,
            channel,
            metrics,
        }
    }

    fn control(op: OpCode, id: u8) -> Vec<u8> {
        encode_control(op, id).to_vec()
    }

    #[test]
    fn test_connect_failure_sends_single_server_close() {
        let f = fixture();
        // No listener at socket_path: connect fails.
        f.channel.deliver(&control(OpCode::ClientOpen, 5));

        assert_eq!(f.channel.next_sent(), control(OpCode::ServerClose, 5));
        flush(&f.thread.handle());
        assert!(f.channel.sent.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(f.metrics.connect_failures_total.load(Ordering::Relaxed), 1);

        // Id stays reserved until the client closes its side too.
        assert_eq!(f.tunnel.connection_count(), 1);
        f.channel.deliver(&control(OpCode::ClientClose, 5));
        flush(&f.thread.handle());
        assert_eq!(f.tunnel.connection_count(), 0);
    }

    #[test]
    fn test_open_then_close_before_data() {
        let f = fixture();
        let listener = UnixListener::bind(&f.socket_path).unwrap();

        f.channel.deliver(&control(OpCode::ClientOpen, 5));
        let (mut target, _) = listener.accept().unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ServerOpenAck, 5));

        f.channel.deliver(&control(OpCode::ClientClose, 5));

        // Target sees EOF from our shut-down output, then closes its end.
        let mut buf = [0u8; 16];
        assert_eq!(target.read(&mut buf).unwrap(), 0);
        flush(&f.thread.handle());
        assert_eq!(f.tunnel.connection_count(), 1);
        drop(target);

        assert_eq!(f.channel.next_sent(), control(OpCode::ServerClose, 5));
        flush(&f.thread.handle());
        assert_eq!(f.tunnel.connection_count(), 0);

        // Id 5 is free again.
        f.channel.deliver(&control(OpCode::ClientOpen, 5));
        let _ = listener.accept().unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ServerOpenAck, 5));
        assert!(!f.channel.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_bytes_relayed_both_ways() {
        let f = fixture();
        let listener = UnixListener::bind(&f.socket_path).unwrap();

        f.channel.deliver(&control(OpCode::ClientOpen, 1));
        let (mut target, _) = listener.accept().unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ServerOpenAck, 1));

        f.channel.deliver(&packet::encode_data(1, b"GET /json"));
        let mut buf = [0u8; 9];
        target.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"GET /json");

        target.write_all(b"[]").unwrap();
        assert_eq!(f.channel.next_sent(), b"\x01[]".to_vec());

        drop(target);
        assert_eq!(f.channel.next_sent(), control(OpCode::ServerClose, 1));
        assert_eq!(f.metrics.tunnel_connections_total.load(Ordering::Relaxed), 1);
        assert_eq!(f.metrics.bytes_to_socket_total.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn test_reused_id_is_protocol_error() {
        let f = fixture();
        let _listener = UnixListener::bind(&f.socket_path).unwrap();

        f.channel.deliver(&control(OpCode::ClientOpen, 3));
        assert_eq!(f.channel.next_sent(), control(OpCode::ServerOpenAck, 3));
        f.channel.deliver(&control(OpCode::ClientOpen, 3));
        flush(&f.thread.handle());

        assert!(f.channel.closed.load(Ordering::SeqCst));
        assert_eq!(f.tunnel.connection_count(), 0);
        assert_eq!(f.metrics.protocol_errors_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reopen_before_server_close_is_protocol_error() {
        let f = fixture();
        let listener = UnixListener::bind(&f.socket_path).unwrap();

        // Both sides closed: id 7 may be opened again.
        f.channel.deliver(&control(OpCode::ClientOpen, 7));
        let (target, _) = listener.accept().unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ServerOpenAck, 7));
        f.channel.deliver(&control(OpCode::ClientClose, 7));
        drop(target);
        assert_eq!(f.channel.next_sent(), control(OpCode::ServerClose, 7));
        flush(&f.thread.handle());

        f.channel.deliver(&control(OpCode::ClientOpen, 7));
        let (_target, _) = listener.accept().unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ServerOpenAck, 7));

        // Only the client side closed: reopening is an error.
        f.channel.deliver(&control(OpCode::ClientClose, 7));
        flush(&f.thread.handle());
        assert_eq!(f.tunnel.connection_count(), 1);
        f.channel.deliver(&control(OpCode::ClientOpen, 7));
        flush(&f.thread.handle());

        assert!(f.channel.closed.load(Ordering::SeqCst));
        assert_eq!(f.tunnel.connection_count(), 0);
        assert_eq!(f.metrics.protocol_errors_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_malformed_packets_close_channel() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0, 0],
            vec![0, 0, 65],
            vec![99, 1, 2],
            control(OpCode::ServerOpenAck, 1),
            control(OpCode::ClientClose, 8),
            packet::encode_data(8, b"no such connection"),
        ];

        for case in cases {
            let f = fixture();
            f.channel.deliver(&case);
            flush(&f.thread.handle());
            assert!(
                f.channel.closed.load(Ordering::SeqCst),
                "packet {:?} should close the channel",
                case
            );
            assert_eq!(f.metrics.protocol_errors_total.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn test_channel_closed_tears_down_connections() {
        let f = fixture();
        let listener = UnixListener::bind(&f.socket_path).unwrap();

        f.channel.deliver(&control(OpCode::ClientOpen, 2));
        let (mut target, _) = listener.accept().unwrap();
        assert_eq!(f.channel.next_sent(), control(OpCode::ServerOpenAck, 2));

        f.channel.set_state(ChannelState::Closed);
        flush(&f.thread.handle());
        assert_eq!(f.tunnel.connection_count(), 0);

        let mut buf = [0u8; 4];
        assert_eq!(target.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_unbind_detaches_observer() {
        let f = fixture();
        let tunnel = f.tunnel.clone();
        let unbound = on_thread(&f.thread.handle(), move || tunnel.unbind());
        assert!(unbound.is_some());
        assert!(!f.channel.has_observer());

        let tunnel = f.tunnel.clone();
        on_thread(&f.thread.handle(), move || tunnel.dispose());
        assert!(f.channel.sent.recv_timeout(WAIT / 50).is_err());
    }
}
