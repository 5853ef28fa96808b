//! Signaling RPC transport
//!
//! Carries the [`SessionEndpoint`] surface over any UNIX stream so a client
//! session can negotiate with a [`BridgeServer`](crate::registry::BridgeServer)
//! in another process.
//!
//! Every frame is a 4-byte big-endian length followed by a bincode payload:
//!
//! ```text
//! +----------------+------------------------------------------+
//! | length (u32be) | bincode Frame { request_id, body }       |
//! +----------------+------------------------------------------+
//! ```
//!
//! Requests and responses are matched by `request_id`; responses may arrive
//! in any order.

use std::collections::HashMap;
use std::io::{self, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{
    IceExchangeCallback, IceExchangeResult, NegotiationCallback, NegotiationResult, SessionError,
};
use crate::peer::RtcConfiguration;
use crate::session::SessionEndpoint;

// ============================================================================
// Constants
// ============================================================================

/// Maximum frame payload size (64 KB)
pub const MAX_FRAME_SIZE: u32 = 65536;

/// Length of frame header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Messages
// ============================================================================

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    StartSession {
        session_id: String,
        config: RtcConfiguration,
        offer: String,
    },
    Renegotiate {
        session_id: String,
        offer: String,
    },
    IceExchange {
        session_id: String,
        candidates: Vec<String>,
    },
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Answer { sdp: String },
    Candidates { candidates: Vec<String> },
    Failure { error: SessionError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame<T> {
    pub request_id: u64,
    pub body: T,
}

/// Framing failures
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("invalid frame: {0}")]
    Invalid(String),
    #[error("signaling I/O error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Frame Encoding/Decoding
// ============================================================================

/// Encode a frame with its 4-byte length prefix
pub fn encode_frame<T: Serialize>(frame: &Frame<T>) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(frame).map_err(|e| FrameError::Invalid(e.to_string()))?;

    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

/// Read one frame. `Ok(None)` when the stream ends between frames.
///
/// A payload that fails to deserialize is still consumed, so the caller
/// may keep reading after [`FrameError::Invalid`].
pub fn read_frame<T: DeserializeOwned>(
    reader: &mut impl Read,
) -> Result<Option<Frame<T>>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE as usize {
        return Err(FrameError::TooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;

    bincode::deserialize(&payload)
        .map(Some)
        .map_err(|e| FrameError::Invalid(e.to_string()))
}

pub fn write_frame<T: Serialize>(
    writer: &mut impl Write,
    frame: &Frame<T>,
) -> Result<(), FrameError> {
    let buf = encode_frame(frame)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

// ============================================================================
// Server Side
// ============================================================================

type SharedWriter = Arc<Mutex<UnixStream>>;

/// Serve requests from `stream` into `endpoint` until the peer disconnects.
///
/// Blocks the calling thread. Responses are written from whichever thread
/// completes the request.
pub fn serve_stream(
    stream: UnixStream,
    endpoint: Arc<dyn SessionEndpoint>,
) -> Result<(), FrameError> {
    let writer: SharedWriter = Arc::new(Mutex::new(stream.try_clone()?));
    let mut reader = BufReader::new(stream);

    loop {
        let frame = match read_frame::<Request>(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("Signaling peer disconnected");
                return Ok(());
            }
            Err(FrameError::Invalid(e)) => {
                log::warn!("Dropping malformed signaling request: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };
        dispatch(endpoint.as_ref(), frame, &writer);
    }
}

fn dispatch(endpoint: &dyn SessionEndpoint, frame: Frame<Request>, writer: &SharedWriter) {
    let request_id = frame.request_id;
    let writer = writer.clone();
    match frame.body {
        Request::StartSession {
            session_id,
            config,
            offer,
        } => {
            log::debug!("Signaling #{}: start session {}", request_id, session_id);
            endpoint.start_session(
                &session_id,
                config,
                offer,
                Box::new(move |result| respond(&writer, request_id, negotiation_response(result))),
            );
        }
        Request::Renegotiate { session_id, offer } => {
            log::debug!("Signaling #{}: renegotiate {}", request_id, session_id);
            endpoint.renegotiate(
                &session_id,
                offer,
                Box::new(move |result| respond(&writer, request_id, negotiation_response(result))),
            );
        }
        Request::IceExchange {
            session_id,
            candidates,
        } => {
            log::debug!(
                "Signaling #{}: ICE exchange {} with {} candidates",
                request_id,
                session_id,
                candidates.len()
            );
            endpoint.ice_exchange(
                &session_id,
                candidates,
                Box::new(move |result| respond(&writer, request_id, ice_response(result))),
            );
        }
    }
}

fn negotiation_response(result: NegotiationResult) -> Response {
    match result {
        Ok(sdp) => Response::Answer { sdp },
        Err(error) => Response::Failure { error },
    }
}

fn ice_response(result: IceExchangeResult) -> Response {
    match result {
        Ok(candidates) => Response::Candidates { candidates },
        Err(error) => Response::Failure { error },
    }
}

fn respond(writer: &SharedWriter, request_id: u64, body: Response) {
    let frame = Frame { request_id, body };
    if let Err(e) = write_frame(&mut *writer.lock(), &frame) {
        log::warn!("Signaling #{}: response not sent: {}", request_id, e);
    }
}

// ============================================================================
// Client Side
// ============================================================================

enum Pending {
    Negotiation(NegotiationCallback),
    Ice(IceExchangeCallback),
}

impl Pending {
    fn fail(self, error: SessionError) {
        match self {
            Pending::Negotiation(callback) => callback(Err(error)),
            Pending::Ice(callback) => callback(Err(error)),
        }
    }
}

struct RemoteInner {
    writer: Mutex<UnixStream>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    /// Set under the `pending` lock once the reader has stopped
    closed: AtomicBool,
}

/// [`SessionEndpoint`] whose requests travel over a signaling stream.
///
/// Callbacks run on the stream's reader thread. When the stream ends every
/// outstanding request fails with [`SessionError::Transport`].
pub struct RemoteEndpoint {
    inner: Arc<RemoteInner>,
    reader: Option<JoinHandle<()>>,
}

impl RemoteEndpoint {
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        let inner = Arc::new(RemoteInner {
            writer: Mutex::new(stream.try_clone()?),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let reader_inner = inner.clone();
        let reader = thread::Builder::new()
            .name("signaling-client".to_string())
            .spawn(move || reader_inner.read_responses(stream))?;

        Ok(Self {
            inner,
            reader: Some(reader),
        })
    }

    /// Requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl Drop for RemoteEndpoint {
    fn drop(&mut self) {
        let _ = self.inner.writer.lock().shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            if reader.thread().id() != thread::current().id() {
                let _ = reader.join();
            }
        }
    }
}

impl SessionEndpoint for RemoteEndpoint {
    fn start_session(
        &self,
        session_id: &str,
        config: RtcConfiguration,
        offer: String,
        callback: NegotiationCallback,
    ) {
        let request = Request::StartSession {
            session_id: session_id.to_string(),
            config,
            offer,
        };
        self.inner.send(request, Pending::Negotiation(callback));
    }

    fn renegotiate(&self, session_id: &str, offer: String, callback: NegotiationCallback) {
        let request = Request::Renegotiate {
            session_id: session_id.to_string(),
            offer,
        };
        self.inner.send(request, Pending::Negotiation(callback));
    }

    fn ice_exchange(&self, session_id: &str, candidates: Vec<String>, callback: IceExchangeCallback) {
        let request = Request::IceExchange {
            session_id: session_id.to_string(),
            candidates,
        };
        self.inner.send(request, Pending::Ice(callback));
    }
}

impl RemoteInner {
    fn send(&self, body: Request, pending: Pending) {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut map = self.pending.lock();
            if self.closed.load(Ordering::Acquire) {
                drop(map);
                pending.fail(SessionError::Transport(
                    "signaling stream closed".to_string(),
                ));
                return;
            }
            map.insert(request_id, pending);
        }

        let result = write_frame(&mut *self.writer.lock(), &Frame { request_id, body });
        if let Err(e) = result {
            log::warn!("Signaling #{}: request not sent: {}", request_id, e);
            let pending = self.pending.lock().remove(&request_id);
            if let Some(pending) = pending {
                pending.fail(SessionError::Transport(e.to_string()));
            }
        }
    }

    fn read_responses(&self, stream: UnixStream) {
        let mut reader = BufReader::new(stream);
        let reason = loop {
            match read_frame::<Response>(&mut reader) {
                Ok(Some(frame)) => self.complete(frame),
                Ok(None) => break "signaling stream closed".to_string(),
                Err(e) => {
                    log::error!("Signaling stream failed: {}", e);
                    break e.to_string();
                }
            }
        };

        let pending: Vec<Pending> = {
            let mut map = self.pending.lock();
            self.closed.store(true, Ordering::Release);
            map.drain().map(|(_, pending)| pending).collect()
        };
        log::info!(
            "Signaling reader stopped, failing {} pending requests",
            pending.len()
        );
        for request in pending {
            request.fail(SessionError::Transport(reason.clone()));
        }
    }

    fn complete(&self, frame: Frame<Response>) {
        let pending = self.pending.lock().remove(&frame.request_id);
        let Some(pending) = pending else {
            log::warn!("Signaling #{}: response to unknown request", frame.request_id);
            return;
        };

        match (pending, frame.body) {
            (Pending::Negotiation(callback), Response::Answer { sdp }) => callback(Ok(sdp)),
            (Pending::Ice(callback), Response::Candidates { candidates }) => {
                callback(Ok(candidates))
            }
            (pending, Response::Failure { error }) => pending.fail(error),
            (pending, body) => {
                log::warn!("Signaling #{}: mismatched response", frame.request_id);
                pending.fail(SessionError::Transport(format!(
                    "unexpected response: {:?}",
                    body
                )));
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct ScriptedEndpoint {
        requests: Mutex<Vec<String>>,
    }

    impl SessionEndpoint for ScriptedEndpoint {
        fn start_session(
            &self,
            session_id: &str,
            config: RtcConfiguration,
            offer: String,
            callback: NegotiationCallback,
        ) {
            self.requests.lock().push(format!(
                "start:{}:{}:{}",
                session_id,
                offer,
                config.ice_servers().len()
            ));
            callback(Ok(format!("answer to {}", offer)));
        }

        fn renegotiate(&self, session_id: &str, _offer: String, callback: NegotiationCallback) {
            self.requests.lock().push(format!("renegotiate:{}", session_id));
            callback(Err(SessionError::NotImplemented));
        }

        fn ice_exchange(
            &self,
            session_id: &str,
            mut candidates: Vec<String>,
            callback: IceExchangeCallback,
        ) {
            self.requests.lock().push(format!("ice:{}", session_id));
            if session_id == "missing" {
                callback(Err(SessionError::SessionNotFound));
            } else {
                candidates.reverse();
                callback(Ok(candidates));
            }
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let frame = Frame {
            request_id: 7,
            body: Request::IceExchange {
                session_id: "s1".to_string(),
                candidates: vec!["0:0:candidate".to_string()],
            },
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        assert_eq!(&buf[..HEADER_LEN], &((buf.len() - HEADER_LEN) as u32).to_be_bytes());

        let mut reader = &buf[..];
        assert_eq!(read_frame::<Request>(&mut reader).unwrap(), Some(frame));
        assert!(read_frame::<Request>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_read_truncated_and_oversized() {
        let frame = Frame {
            request_id: 1,
            body: Response::Answer {
                sdp: "v=0".to_string(),
            },
        };
        let encoded = encode_frame(&frame).unwrap();

        let mut truncated = &encoded[..encoded.len() - 1];
        assert!(matches!(
            read_frame::<Response>(&mut truncated),
            Err(FrameError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));

        let mut oversized = (MAX_FRAME_SIZE + 1).to_be_bytes().to_vec();
        oversized.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            read_frame::<Response>(&mut &oversized[..]),
            Err(FrameError::TooLarge(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_offer() {
        let frame = Frame {
            request_id: 1,
            body: Request::Renegotiate {
                session_id: "s1".to_string(),
                offer: "x".repeat(MAX_FRAME_SIZE as usize + 1),
            },
        };
        assert!(matches!(encode_frame(&frame), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn test_read_frame_skips_malformed_payload() {
        let mut bytes = 3u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
        bytes.extend(
            encode_frame(&Frame {
                request_id: 2,
                body: Response::Candidates { candidates: vec![] },
            })
            .unwrap(),
        );

        let mut reader = &bytes[..];
        assert!(matches!(
            read_frame::<Response>(&mut reader),
            Err(FrameError::Invalid(_))
        ));
        let frame = read_frame::<Response>(&mut reader).unwrap().unwrap();
        assert_eq!(frame.request_id, 2);
        assert!(read_frame::<Response>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_requests_round_trip_over_stream() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (client_side, server_side) = UnixStream::pair().unwrap();
        let endpoint = Arc::new(ScriptedEndpoint::default());
        let served: Arc<dyn SessionEndpoint> = endpoint.clone();
        let server = thread::spawn(move || serve_stream(server_side, served));
        let remote = RemoteEndpoint::new(client_side).unwrap();

        let (tx, rx) = unbounded();
        let config = RtcConfiguration::builder()
            .ice_server("stun:stun.example.org")
            .build();
        remote.start_session(
            "s1",
            config,
            "offer".to_string(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Ok("answer to offer".to_string())
        );

        let (tx, rx) = unbounded();
        remote.renegotiate(
            "s1",
            "offer 2".to_string(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(SessionError::NotImplemented)
        );

        let (tx, rx) = unbounded();
        for session_id in ["s1", "missing"] {
            let tx = tx.clone();
            remote.ice_exchange(
                session_id,
                vec!["a:0:x".to_string(), "b:1:y".to_string()],
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );
        }
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Ok(vec!["b:1:y".to_string(), "a:0:x".to_string()])
        );
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(SessionError::SessionNotFound)
        );
        assert_eq!(remote.pending_requests(), 0);

        drop(remote);
        assert!(server.join().unwrap().is_ok());
        assert_eq!(
            *endpoint.requests.lock(),
            vec![
                "start:s1:offer:1".to_string(),
                "renegotiate:s1".to_string(),
                "ice:s1".to_string(),
                "ice:missing".to_string(),
            ]
        );
    }

    #[test]
    fn test_pending_requests_fail_when_stream_closes() {
        let (client_side, server_side) = UnixStream::pair().unwrap();
        let remote = RemoteEndpoint::new(client_side).unwrap();

        let (tx, rx) = unbounded();
        let first = tx.clone();
        remote.ice_exchange(
            "s1",
            vec![],
            Box::new(move |result| {
                let _ = first.send(result);
            }),
        );
        drop(server_side);

        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(SessionError::Transport(_))
        ));

        // Once the reader stopped, new requests fail straight away.
        let deadline = std::time::Instant::now() + WAIT;
        while !remote.inner.closed.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        remote.start_session(
            "s1",
            RtcConfiguration::default(),
            "offer".to_string(),
            Box::new(move |result| {
                let _ = tx.send(result.map(|sdp| vec![sdp]));
            }),
        );
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(SessionError::Transport(_))
        ));
    }
}
