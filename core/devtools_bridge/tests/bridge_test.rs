//! End-to-end tests for the DevTools bridge
//!
//! Runs a `BridgeServer` and a `ClientSession` over the loopback peer
//! connection, with signaling over a framed UNIX socket pair and a real
//! echo service as the tunnel target.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use devtools_bridge::{
    serve_stream, BridgeServer, ClientSession, FixedSocketName, LoopbackNetwork, Metrics,
    RemoteEndpoint, RtcConfiguration, ServerHost, SessionConfig, SessionEndpoint, SessionError,
    SessionState, SignalingThread, SocketTunnelClient, DEFAULT_TUNNEL_CHANNEL_ID,
};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingHost {
    counts: Mutex<Vec<usize>>,
}

impl ServerHost for RecordingHost {
    fn on_session_count_changed(&self, count: usize) {
        self.counts.lock().push(count);
    }
}

/// Echo service standing in for the DevTools socket
fn spawn_echo_target(path: &Path) -> JoinHandle<()> {
    let listener = UnixListener::bind(path).unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = stream.shutdown(Shutdown::Write);
            });
        }
    })
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

struct Bridge {
    _dir: tempfile::TempDir,
    listen: String,
    metrics: Arc<Metrics>,
    host: Arc<RecordingHost>,
    server: BridgeServer,
    client_thread: Option<SignalingThread>,
    session: Arc<ClientSession>,
}

impl Bridge {
    fn start() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("devtools.sock");
        let listen = dir.path().join("forward.sock").to_string_lossy().into_owned();
        spawn_echo_target(&target);

        let config = SessionConfig::default().with_ice_gathering_delay(Duration::from_millis(20));
        let metrics = Arc::new(Metrics::new());
        let network = LoopbackNetwork::new();
        let host = Arc::new(RecordingHost::default());

        let server = BridgeServer::new(
            Arc::new(network.clone()),
            Arc::new(FixedSocketName(target.to_string_lossy().into_owned())),
            host.clone(),
            config,
            metrics.clone(),
        )
        .unwrap();

        let (client_stream, server_stream) = UnixStream::pair().unwrap();
        let endpoint = server.endpoint();
        thread::spawn(move || serve_stream(server_stream, endpoint));
        let remote: Arc<dyn SessionEndpoint> = Arc::new(RemoteEndpoint::new(client_stream).unwrap());

        let client_thread = SignalingThread::spawn("test-client").unwrap();
        let executor = client_thread.handle();
        let tunnel = SocketTunnelClient::new(listen.clone(), executor.clone(), metrics.clone()).unwrap();
        let session = Arc::new(ClientSession::new(
            "e2e",
            Arc::new(network),
            executor.clone(),
            config,
            remote,
        ));
        session.add_tunnel(DEFAULT_TUNNEL_CHANNEL_ID, Arc::new(tunnel));

        let starter = session.clone();
        executor.post(move || {
            starter.start(&RtcConfiguration::default()).unwrap();
        });

        Bridge {
            _dir: dir,
            listen,
            metrics,
            host,
            server,
            client_thread: Some(client_thread),
            session,
        }
    }

    fn stop_client(&mut self) {
        let session = self.session.clone();
        if let Some(thread) = self.client_thread.take() {
            thread.handle().post(move || session.stop());
            thread.shutdown();
        }
    }
}

fn echo_round_trip(listen: &str, message: &[u8]) -> Vec<u8> {
    let mut stream = UnixStream::connect(listen).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream.write_all(message).unwrap();
    let mut reply = vec![0u8; message.len()];
    stream.read_exact(&mut reply).unwrap();
    reply
}

#[test]
fn test_bytes_flow_through_bridge() {
    let mut bridge = Bridge::start();
    wait_for("client session established", || {
        bridge.session.state() == SessionState::Established
    });
    assert_eq!(bridge.server.session_count(), 1);

    assert_eq!(
        echo_round_trip(&bridge.listen, b"GET /json HTTP/1.1\r\n\r\n"),
        b"GET /json HTTP/1.1\r\n\r\n"
    );

    bridge.stop_client();
    assert_eq!(bridge.session.state(), SessionState::Stopped);
    assert!(bridge.metrics.tunnel_connections_total.load(Ordering::Relaxed) >= 1);
}

#[test]
fn test_concurrent_connections_are_multiplexed() {
    let mut bridge = Bridge::start();
    wait_for("client session established", || {
        bridge.session.state() == SessionState::Established
    });

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let listen = bridge.listen.clone();
            thread::spawn(move || {
                let message = format!("connection {} says hello", i).repeat(100);
                let reply = echo_round_trip(&listen, message.as_bytes());
                assert_eq!(reply, message.as_bytes());
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(bridge.metrics.tunnel_connections_total.load(Ordering::Relaxed) >= 4);
    bridge.stop_client();
}

#[test]
fn test_client_stop_closes_server_session() {
    let mut bridge = Bridge::start();
    wait_for("client session established", || {
        bridge.session.state() == SessionState::Established
    });

    bridge.stop_client();
    wait_for("server session removed", || {
        bridge.host.counts.lock().last() == Some(&0)
    });

    assert_eq!(*bridge.host.counts.lock(), vec![1, 0]);
    assert_eq!(bridge.server.session_count(), 0);
    assert_eq!(bridge.metrics.active_sessions.load(Ordering::Relaxed), 0);
}

#[test]
fn test_registry_errors_cross_signaling() {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = BridgeServer::new(
        Arc::new(LoopbackNetwork::new()),
        Arc::new(FixedSocketName("@devtools_bridge_test".to_string())),
        Arc::new(RecordingHost::default()),
        SessionConfig::default(),
        Arc::new(Metrics::new()),
    )
    .unwrap();
    let (client_stream, server_stream) = UnixStream::pair().unwrap();
    let endpoint = server.endpoint();
    thread::spawn(move || serve_stream(server_stream, endpoint));
    let remote = RemoteEndpoint::new(client_stream).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let reply = tx.clone();
    remote.start_session(
        "bad",
        RtcConfiguration::default(),
        "not an sdp".to_string(),
        Box::new(move |result| {
            let _ = reply.send(result.map(|sdp| vec![sdp]));
        }),
    );
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(SessionError::Negotiation(_))
    ));
    wait_for("failed session removed", || server.session_count() == 0);

    let reply = tx.clone();
    remote.ice_exchange(
        "missing",
        vec!["0:0:candidate".to_string()],
        Box::new(move |result| {
            let _ = reply.send(result);
        }),
    );
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(SessionError::SessionNotFound)
    );

    remote.renegotiate(
        "missing",
        "offer".to_string(),
        Box::new(move |result| {
            let _ = tx.send(result.map(|sdp| vec![sdp]));
        }),
    );
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(SessionError::SessionNotFound)
    );
}
