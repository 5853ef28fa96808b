//! DevTools Bridge loopback
//!
//! Runs both ends of a bridge session in one process:
//! - A `BridgeServer` whose sessions tunnel to `--target`
//! - A client session that offers over a framed signaling stream
//! - A client tunnel listening on `--listen`
//!
//! Connections to `--listen` reach `--target` through the full session and
//! tunnel stack, with an in-memory peer connection in between.

use std::error::Error;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use devtools_bridge::{
    generate_session_id, serve_stream, BridgeServer, ClientSession, FixedSocketName,
    LoggingKeepAlive, LoopbackNetwork, Metrics, RemoteEndpoint, RtcConfiguration,
    SessionConfig, SessionCountLock, SessionEndpoint, SignalingThread, SocketTunnelClient,
    DEFAULT_TUNNEL_CHANNEL_ID,
};

/// How often the main thread checks for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    // --target <socket>        Socket to expose (path, or @name)
    // --listen <socket>        Local socket to accept connections on
    // --auto-close-secs <n>    Close sessions whose control channel never opens
    // --ice-delay-ms <n>       Candidate gathering delay per ICE exchange

    let target = parse_arg(&args, "--target").ok_or("Missing --target <socket>")?;
    let listen = parse_arg(&args, "--listen").ok_or("Missing --listen <socket>")?;
    let auto_close_secs = parse_arg(&args, "--auto-close-secs")
        .map(|s| s.parse::<u64>())
        .transpose()
        .map_err(|_| "Invalid --auto-close-secs")?;
    let ice_delay_ms = parse_arg(&args, "--ice-delay-ms")
        .map(|s| s.parse::<u64>())
        .transpose()
        .map_err(|_| "Invalid --ice-delay-ms")?;

    let mut config = SessionConfig::default();
    if let Some(secs) = auto_close_secs {
        config = config.with_auto_close_timeout(Duration::from_secs(secs));
    }
    if let Some(ms) = ice_delay_ms {
        config = config.with_ice_gathering_delay(Duration::from_millis(ms));
    }

    log::info!("DevTools bridge loopback starting...");
    log::info!("  Target:     {}", target);
    log::info!("  Listen:     {}", listen);
    log::info!("  Auto-close: {:?}", config.auto_close_timeout);
    log::info!("  ICE delay:  {:?}", config.ice_gathering_delay);

    let metrics = Arc::new(Metrics::new());
    let network = LoopbackNetwork::new();

    // Server side
    let server = BridgeServer::new(
        Arc::new(network.clone()),
        Arc::new(FixedSocketName(target)),
        Arc::new(SessionCountLock::new(LoggingKeepAlive)),
        config,
        metrics.clone(),
    )?;

    // Signaling between the two sides
    let (client_stream, server_stream) = UnixStream::pair()?;
    let serve_handle = server_stream.try_clone()?;
    let endpoint = server.endpoint();
    let serve = thread::Builder::new()
        .name("signaling-serve".to_string())
        .spawn(move || {
            if let Err(e) = serve_stream(server_stream, endpoint) {
                log::error!("Signaling server stopped: {}", e);
            }
        })?;
    let remote: Arc<dyn SessionEndpoint> = Arc::new(RemoteEndpoint::new(client_stream)?);

    // Client side
    let client_thread = SignalingThread::spawn("client-signaling")?;
    let executor = client_thread.handle();
    let tunnel = SocketTunnelClient::new(listen, executor.clone(), metrics.clone())?;
    let session_id = generate_session_id().map_err(|_| "Failed to generate session ID")?;
    let session = Arc::new(ClientSession::new(
        session_id,
        Arc::new(network),
        executor.clone(),
        config,
        remote.clone(),
    ));
    session.add_tunnel(DEFAULT_TUNNEL_CHANNEL_ID, Arc::new(tunnel));

    // Shutdown on SIGINT/SIGTERM or when the session closes itself
    let done = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, done.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, done.clone())?;

    let closed = done.clone();
    session.set_close_hook(move || {
        log::warn!("Client session closed");
        closed.store(true, Ordering::SeqCst);
    });

    let starter = session.clone();
    let failed = done.clone();
    executor.post(move || {
        if let Err(e) = starter.start(&RtcConfiguration::default()) {
            log::error!("Session {}: start failed: {}", starter.session_id(), e);
            failed.store(true, Ordering::SeqCst);
        }
    });

    while !done.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);
    }

    log::info!("Shutting down...");

    let stopping = session.clone();
    executor.post(move || stopping.stop());
    client_thread.shutdown();
    drop(session);
    drop(remote);

    let _ = serve_handle.shutdown(Shutdown::Both);
    if serve.join().is_err() {
        log::error!("Signaling server thread panicked");
    }
    drop(server);

    log::info!("Final metrics:\n{}", metrics.render());
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
