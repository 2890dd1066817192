//! Connection load generation.
//!
//! A [`Sender`] runs up to three modes against one target, each as its own
//! task:
//! - burst: a one-shot batch of greeting connections with no pacing
//! - stream: one connection reading a capped or unbounded byte stream
//! - load: greeting connections issued forever at a target rate
//!
//! Connection failures are expected under load and are counted per mode;
//! only resolving the target can fail a run.

mod burst;
mod load;
mod stream;

pub use stream::{read_capped, stream_request, StreamEnd, StreamOutcome};

use crate::engine::timeout::read_with_timeout;
use crate::metrics;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tcpflood_common::{SenderConfig, GREETING};
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("failed to resolve target {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("target {addr} resolved to no addresses")]
    NoAddress { addr: String },
}

/// Resolves the target once. Every mode connects to the returned address.
pub async fn resolve(addr: &str) -> Result<SocketAddr, SenderError> {
    let mut addrs = lookup_host(addr)
        .await
        .map_err(|source| SenderError::Resolve {
            addr: addr.to_string(),
            source,
        })?;
    addrs.next().ok_or_else(|| SenderError::NoAddress {
        addr: addr.to_string(),
    })
}

/// Mode parameters for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadRequest {
    /// Burst size. Zero disables burst mode.
    pub burst: u64,
    /// Stream byte cap. Zero reads until the peer closes.
    pub cap: u64,
    /// Load-mode connections per second. Zero is unpaced.
    pub hertz: u64,
    pub load: bool,
    pub stream: bool,
}

impl LoadRequest {
    pub fn is_empty(&self) -> bool {
        self.burst == 0 && !self.load && !self.stream
    }

    /// Whether the run only ends on cancellation (or, for an uncapped
    /// stream, on the peer closing).
    pub fn is_unbounded(&self) -> bool {
        self.load || (self.stream && self.cap == 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Burst,
    Stream,
    Load,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Burst => "burst",
            Mode::Stream => "stream",
            Mode::Load => "load",
        }
    }
}

#[derive(Debug, Default)]
pub struct ModeStats {
    attempted: AtomicU64,
    connected: AtomicU64,
    failed: AtomicU64,
    replies: AtomicU64,
    bytes_received: AtomicU64,
}

impl ModeStats {
    fn attempt(&self, mode: Mode) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        metrics::SENDER_ATTEMPTS
            .with_label_values(&[mode.as_str()])
            .inc();
    }

    fn fail(&self, mode: Mode, e: &io::Error) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::SENDER_FAILURES
            .with_label_values(&[mode.as_str()])
            .inc();
        debug!(mode = mode.as_str(), error = %e, "Connection failed");
    }

    fn received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ModeSummary {
        ModeSummary {
            attempted: self.attempted.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ModeSummary {
    pub attempted: u64,
    pub connected: u64,
    pub failed: u64,
    /// Connections that got any bytes back.
    pub replies: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst: Option<ModeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<ModeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<ModeSummary>,
}

/// State shared by every connection a run opens.
pub(crate) struct Target {
    addr: SocketAddr,
    config: SenderConfig,
    /// Bounds concurrent burst and load connections.
    in_flight: Arc<Semaphore>,
}

impl Target {
    async fn connect(&self) -> io::Result<TcpStream> {
        match timeout(self.config.connect_timeout(), TcpStream::connect(self.addr)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }

    /// Opens one connection, sends the greeting and waits up to the reply
    /// timeout for an answer. The connection is closed on return.
    async fn greet(&self, stats: &ModeStats, mode: Mode) {
        stats.attempt(mode);

        let mut socket = match self.connect().await {
            Ok(s) => s,
            Err(e) => return stats.fail(mode, &e),
        };
        stats.connected.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = socket.write_all(GREETING).await {
            return stats.fail(mode, &e);
        }

        let mut buf = [0u8; 64];
        match read_with_timeout(&mut socket, &mut buf, self.config.reply_timeout()).await {
            Ok(0) => {}
            Ok(n) => {
                stats.replies.fetch_add(1, Ordering::Relaxed);
                stats.received(n);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => debug!(mode = mode.as_str(), error = %e, "Reply read failed"),
        }
    }
}

pub struct Sender {
    target: Arc<Target>,
    request: LoadRequest,
}

impl Sender {
    pub fn new(addr: SocketAddr, request: LoadRequest, config: SenderConfig) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            target: Arc::new(Target {
                addr,
                config,
                in_flight,
            }),
            request,
        }
    }

    pub fn request(&self) -> &LoadRequest {
        &self.request
    }

    /// Runs every enabled mode concurrently and returns once all of them
    /// have finished. Load mode only finishes when `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> SenderReport {
        let req = self.request;
        info!(
            addr = %self.target.addr,
            burst = req.burst,
            cap = req.cap,
            hertz = req.hertz,
            load = req.load,
            stream = req.stream,
            "Sender started"
        );

        let burst = (req.burst > 0).then(|| {
            tokio::spawn(burst::run(
                Arc::clone(&self.target),
                req.burst,
                cancel.clone(),
            ))
        });
        let stream = req.stream.then(|| {
            tokio::spawn(stream::run(
                Arc::clone(&self.target),
                req.cap,
                cancel.clone(),
            ))
        });
        let load = req.load.then(|| {
            tokio::spawn(load::run(
                Arc::clone(&self.target),
                req.hertz,
                cancel.clone(),
            ))
        });

        let (burst, stream, load) = tokio::join!(
            join_mode(burst, Mode::Burst),
            join_mode(stream, Mode::Stream),
            join_mode(load, Mode::Load),
        );

        SenderReport {
            burst,
            stream,
            load,
        }
    }
}

async fn join_mode(handle: Option<JoinHandle<ModeSummary>>, mode: Mode) -> Option<ModeSummary> {
    match handle?.await {
        Ok(summary) => Some(summary),
        Err(e) => {
            error!(mode = mode.as_str(), error = %e, "Mode task failed");
            None
        }
    }
}
