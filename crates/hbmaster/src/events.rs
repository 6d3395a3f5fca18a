// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbmaster contributors

//! Event egress to an out-of-process observer (dashboard).
//!
//! One-way, backpressure-free: the hot path publishes into a bounded
//! channel and never blocks; the emitter task owns the observer socket.
//! While no observer is attached, frames collect in a drop-oldest ring
//! buffer. An observer may write a `{"type":"sync_request"}` frame to ask
//! the server for a full state snapshot.
//!
//! Wire format (both transports):
//! ```text
//! +----------------+--------------------------------------------+
//! | Length (4B BE) | {"type":...,"timestamp":...,"data":{...}}  |
//! +----------------+--------------------------------------------+
//! ```

use crate::config::{EmitterTransport, EventEmitterConfig};
use crate::server::ServerMsg;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the hot-path event channel.
const CHANNEL_CAP: usize = 1024;
/// Frames buffered while no observer is attached (drop-oldest beyond this).
const BUFFER_CAP: usize = 512;
/// Upper bound on an observer request frame.
const MAX_REQUEST_LEN: usize = 4096;

/// Event payloads, tagged for the wire as `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventBody {
    RepeaterConnected {
        repeater_id: u32,
        callsign: String,
        address: String,
        connection_type: &'static str,
        slot1_talkgroups: Option<Vec<u32>>,
        slot2_talkgroups: Option<Vec<u32>>,
    },
    RepeaterKeepalive {
        repeater_id: u32,
        missed_pings: u32,
        ping_count: u64,
    },
    RepeaterDisconnected {
        repeater_id: u32,
        callsign: String,
        reason: String,
    },
    RepeaterDetails {
        repeater_id: u32,
        callsign: String,
        location: String,
        description: String,
        latitude: String,
        longitude: String,
        height: String,
        tx_power: String,
        rx_freq: String,
        tx_freq: String,
        colorcode: String,
        slots: String,
        url: String,
        software_id: String,
        package_id: String,
        connection_type: &'static str,
        matched_pattern: Option<String>,
        pattern_description: Option<String>,
        match_reason: String,
        rpto_received: bool,
    },
    RepeaterOptionsUpdated {
        repeater_id: u32,
        slot1_talkgroups: Option<Vec<u32>>,
        slot2_talkgroups: Option<Vec<u32>>,
        rpto_received: bool,
    },
    StreamStart {
        repeater_id: u32,
        connection_type: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_name: Option<String>,
        slot: u8,
        rf_src: u32,
        dst_id: u32,
        stream_id: u32,
        call_type: &'static str,
        is_assumed: bool,
    },
    StreamUpdate {
        repeater_id: u32,
        connection_type: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_name: Option<String>,
        slot: u8,
        rf_src: u32,
        dst_id: u32,
        stream_id: u32,
        packets: u64,
        duration: f64,
    },
    StreamEnd {
        repeater_id: u32,
        connection_type: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_name: Option<String>,
        slot: u8,
        rf_src: u32,
        dst_id: u32,
        stream_id: u32,
        packets: u64,
        duration: f64,
        end_reason: &'static str,
        hang_time: f64,
        is_assumed: bool,
    },
    HangTimeExpired {
        repeater_id: u32,
        connection_type: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_name: Option<String>,
        slot: u8,
        stream_id: u32,
    },
    OutboundConnecting {
        connection_name: String,
        radio_id: u32,
    },
    OutboundConnected {
        connection_name: String,
        radio_id: u32,
        remote_address: String,
    },
    OutboundDisconnected {
        connection_name: String,
        radio_id: u32,
        reason: String,
    },
    OutboundError {
        connection_name: String,
        radio_id: u32,
        error: String,
    },
}

/// One wire event: the tagged body plus a wall-clock timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: f64,
    #[serde(flatten)]
    pub body: EventBody,
}

/// Seconds since the Unix epoch, for human-readable event timestamps.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Hot-path handle: fire-and-forget event publication.
#[derive(Debug, Clone)]
pub struct EventTx {
    tx: Option<mpsc::Sender<Event>>,
}

impl EventTx {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Publish into a caller-supplied channel (embedding, tests).
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Publish an event. Never blocks; a full channel drops the event.
    pub fn emit(&self, body: EventBody) {
        if let Some(tx) = &self.tx {
            let event = Event {
                timestamp: unix_now(),
                body,
            };
            if tx.try_send(event).is_err() {
                debug!("event channel full, dropping event");
            }
        }
    }

    /// Drop the sender so the emitter task drains and exits.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// Frame an encoded payload with a 4-byte big-endian length prefix.
async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Read one length-prefixed frame. `Ok(None)` on clean EOF.
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S, max: usize) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length {}", len),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// The single attached observer.
enum ObserverConn {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl ObserverConn {
    async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => write_frame(stream, payload).await,
            Self::Tcp(stream) => write_frame(stream, payload).await,
        }
    }

    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => read_frame(stream, MAX_REQUEST_LEN).await,
            Self::Tcp(stream) => read_frame(stream, MAX_REQUEST_LEN).await,
        }
    }
}

enum EmitterListener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl EmitterListener {
    async fn accept(&self) -> io::Result<ObserverConn> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ObserverConn::Unix(stream))
            }
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                debug!(%addr, "observer TCP connection");
                Ok(ObserverConn::Tcp(stream))
            }
        }
    }
}

/// A request frame sent by the observer.
#[derive(Debug, Deserialize)]
struct ObserverRequest {
    r#type: String,
}

/// Emitter task state.
struct EventEmitter {
    rx: mpsc::Receiver<Event>,
    listener: EmitterListener,
    server_tx: mpsc::Sender<ServerMsg>,
    observer: Option<ObserverConn>,
    buffer: VecDeque<Vec<u8>>,
}

/// Bind the configured transport and spawn the emitter task.
///
/// Returns the hot-path handle and the task handle (both `disabled`/`None`
/// when the emitter is off).
pub async fn spawn(
    config: &EventEmitterConfig,
    server_tx: mpsc::Sender<ServerMsg>,
) -> io::Result<(EventTx, Option<JoinHandle<()>>)> {
    if !config.enabled {
        return Ok((EventTx::disabled(), None));
    }

    let listener = match config.transport {
        #[cfg(unix)]
        EmitterTransport::Unix => {
            // A stale socket file from a previous run refuses the bind.
            let _ = std::fs::remove_file(&config.unix_socket);
            let listener = UnixListener::bind(&config.unix_socket)?;
            let perms = <std::fs::Permissions as std::os::unix::fs::PermissionsExt>::from_mode(0o660);
            std::fs::set_permissions(&config.unix_socket, perms)?;
            info!(path = %config.unix_socket.display(), "event emitter on unix socket");
            EmitterListener::Unix(listener)
        }
        #[cfg(not(unix))]
        EmitterTransport::Unix => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix socket transport is not available on this platform",
            ));
        }
        EmitterTransport::Tcp => {
            let addr = std::net::SocketAddr::new(config.host, config.port);
            let listener = TcpListener::bind(addr).await?;
            info!(%addr, "event emitter on TCP");
            EmitterListener::Tcp(listener)
        }
    };

    let (tx, rx) = mpsc::channel(CHANNEL_CAP);
    let emitter = EventEmitter {
        rx,
        listener,
        server_tx,
        observer: None,
        buffer: VecDeque::new(),
    };
    let handle = tokio::spawn(emitter.run());
    Ok((EventTx { tx: Some(tx) }, Some(handle)))
}

impl EventEmitter {
    async fn run(mut self) {
        loop {
            if let Some(mut observer) = self.observer.take() {
                let mut keep = true;
                tokio::select! {
                    maybe_event = self.rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                if let Ok(payload) = serde_json::to_vec(&event) {
                                    if let Err(e) = observer.write_frame(&payload).await {
                                        warn!("observer write failed, dropping events until reconnect: {}", e);
                                        keep = false;
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                    accepted = self.listener.accept() => {
                        // A new observer replaces the old connection.
                        keep = false;
                        self.attach(accepted).await;
                    }
                    frame = observer.read_frame() => {
                        match frame {
                            Ok(Some(payload)) => {
                                if is_sync_request(&payload) {
                                    debug!("observer requested state resync");
                                    let _ = self.server_tx.send(ServerMsg::ObserverSync).await;
                                }
                            }
                            Ok(None) => {
                                info!("observer disconnected, dropping events until reconnect");
                                keep = false;
                            }
                            Err(e) => {
                                warn!("observer read failed: {}", e);
                                keep = false;
                            }
                        }
                    }
                }
                if keep {
                    self.observer = Some(observer);
                }
            } else {
                tokio::select! {
                    maybe_event = self.rx.recv() => {
                        match maybe_event {
                            Some(event) => self.buffer_event(&event),
                            None => break,
                        }
                    }
                    accepted = self.listener.accept() => {
                        self.attach(accepted).await;
                    }
                }
            }
        }
        debug!("event emitter shutting down");
    }

    /// Install a freshly accepted observer: flush the backlog, then ask the
    /// server for a state snapshot.
    async fn attach(&mut self, accepted: io::Result<ObserverConn>) {
        let mut observer = match accepted {
            Ok(observer) => observer,
            Err(e) => {
                warn!("observer accept failed: {}", e);
                return;
            }
        };
        info!("observer connected");
        while let Some(payload) = self.buffer.pop_front() {
            if let Err(e) = observer.write_frame(&payload).await {
                warn!("observer write failed during backlog flush: {}", e);
                return;
            }
        }
        self.observer = Some(observer);
        let _ = self.server_tx.send(ServerMsg::ObserverSync).await;
    }

    /// Queue a frame while no observer is attached; drop the oldest on
    /// overflow.
    fn buffer_event(&mut self, event: &Event) {
        if let Ok(payload) = serde_json::to_vec(event) {
            if self.buffer.len() >= BUFFER_CAP {
                self.buffer.pop_front();
            }
            self.buffer.push_back(payload);
        }
    }
}

fn is_sync_request(payload: &[u8]) -> bool {
    matches!(
        serde_json::from_slice::<ObserverRequest>(payload),
        Ok(req) if req.r#type == "sync_request"
    )
}
