//! The listener side of the harness.
//!
//! Every accepted connection is counted in the epoch it was accepted in and
//! classified by its first payload, read within the grace period:
//! - the greeting `"Hello world!\n"` is answered with the same greeting, but
//!   only for the first `greeting_replies_per_epoch` greeting connections
//!   *accepted* in an epoch. Later greetings are closed without a reply. A
//!   greeting still waiting on an earlier, slower connection of its epoch
//!   is held until that one is classified, which takes at most the grace
//!   period.
//! - any other non-empty payload gets an endless stream of random bytes.
//! - a silent peer is drained without reply until it closes or idles out.
//!
//! Completed epochs are logged with their accepted count and published as
//! [`ListenerEvent::EpochCompleted`].

use crate::engine::classify::{read_first_payload, Classification};
use crate::engine::epoch::{
    report_epochs, Admission, Epoch, EpochClock, EpochCounter, EpochReport,
};
use crate::engine::timeout::drain_until_idle;
use crate::metrics;
use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcpflood_common::{ListenerConfig, GREETING};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

struct ConnectionGuard;

impl ConnectionGuard {
    fn new() -> Self {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One accepted connection, as seen once its first payload is classified.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub epoch: Epoch,
    pub peer: SocketAddr,
    pub classification: Classification,
}

#[derive(Debug, Clone)]
pub enum ListenerEvent {
    Classified(ConnectionEvent),
    EpochCompleted(EpochReport),
}

struct Handler {
    config: ListenerConfig,
    counter: Arc<EpochCounter>,
    events: broadcast::Sender<ListenerEvent>,
}

pub struct Listener {
    listener: TcpListener,
    handler: Arc<Handler>,
    limit: Arc<Semaphore>,
}

impl Listener {
    /// Binds `config.addr`. Epoch 0 starts at bind time.
    pub async fn bind(config: ListenerConfig) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(&config.addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: config.addr.clone(),
                source,
            })?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let limit = Arc::new(Semaphore::new(config.max_connections.max(1)));
        let counter = Arc::new(EpochCounter::new(EpochClock::start()));

        Ok(Self {
            listener,
            handler: Arc::new(Handler {
                config,
                counter,
                events,
            }),
            limit,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn counter(&self) -> Arc<EpochCounter> {
        Arc::clone(&self.handler.counter)
    }

    /// Classification and epoch-report events. Slow subscribers lag rather
    /// than block the listener.
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.handler.events.subscribe()
    }

    /// Accepts connections until `cancel` fires, then closes every handler
    /// and waits for them to finish.
    pub async fn run(self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();

        let reporter = Arc::clone(&self.handler);
        let reporter_cancel = cancel.clone();
        tracker.spawn(async move {
            let events = reporter.events.clone();
            report_epochs(&reporter.counter, "accepted", reporter_cancel, |report| {
                metrics::LAST_EPOCH_CONNECTIONS.set(report.accepted as i64);
                let _ = events.send(ListenerEvent::EpochCompleted(report));
            })
            .await;
        });

        loop {
            if self.limit.available_permits() == 0 {
                debug!(
                    max_connections = self.handler.config.max_connections,
                    "Connection limit reached, pausing accept"
                );
            }

            // Holding a permit before accepting keeps excess peers in the
            // kernel backlog instead of in memory.
            let permit = tokio::select! {
                permit = Arc::clone(&self.limit).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };

            let (socket, peer) = tokio::select! {
                res = self.listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed, backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                            _ = cancel.cancelled() => break,
                        }
                    }
                },
                _ = cancel.cancelled() => break,
            };

            let admission = self.handler.counter.admit();
            metrics::ACCEPTED_CONNECTIONS.inc();

            let handler = Arc::clone(&self.handler);
            let conn_cancel = cancel.clone();
            tracker.spawn(async move {
                let _permit = permit;
                let _guard = ConnectionGuard::new();
                tokio::select! {
                    res = handler.handle(socket, peer, admission) => {
                        if let Err(e) = res {
                            warn!(client = %peer, error = %e, "Connection error");
                        }
                    }
                    _ = conn_cancel.cancelled() => {}
                }
            });
        }

        info!("Listener stopping, closing connections");
        tracker.close();
        tracker.wait().await;
    }
}

fn peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

impl Handler {
    async fn handle(
        &self,
        mut socket: TcpStream,
        peer: SocketAddr,
        mut admission: Admission,
    ) -> io::Result<()> {
        let epoch = admission.epoch();
        let first = read_first_payload(
            &mut socket,
            self.config.grace_period(),
            self.config.read_prefix_bytes,
        )
        .await?;
        let classification = first.classification;

        metrics::CLASSIFIED_CONNECTIONS
            .with_label_values(&[classification.as_str()])
            .inc();
        debug!(
            client = %peer,
            epoch = epoch.0,
            seq = admission.seq(),
            class = classification.as_str(),
            prefix_len = first.prefix.len(),
            "Connection classified"
        );
        let _ = self.events.send(ListenerEvent::Classified(ConnectionEvent {
            epoch,
            peer,
            classification,
        }));

        match classification {
            Classification::Greeting => self.reply_greeting(&mut socket, peer, admission).await,
            Classification::StreamRequest => {
                admission.settle();
                self.stream_random(&mut socket, peer).await
            }
            Classification::Other => {
                admission.settle();
                self.sink(&mut socket, peer).await
            }
        }
    }

    /// Replies if the connection is among the first greetings accepted in
    /// its epoch, then closes.
    async fn reply_greeting(
        &self,
        socket: &mut TcpStream,
        peer: SocketAddr,
        mut admission: Admission,
    ) -> io::Result<()> {
        let epoch = admission.epoch();
        if admission
            .claim_greeting(self.config.greeting_replies_per_epoch)
            .await
        {
            socket.write_all(GREETING).await?;
            metrics::GREETING_REPLIES.inc();
        } else {
            metrics::GREETINGS_SUPPRESSED.inc();
            debug!(
                client = %peer,
                epoch = epoch.0,
                seq = admission.seq(),
                "Greeting reply cap reached"
            );
        }

        let _ = socket.shutdown().await;
        Ok(())
    }

    /// Writes random bytes until the peer goes away. Never ends on its own.
    async fn stream_random(&self, socket: &mut TcpStream, peer: SocketAddr) -> io::Result<()> {
        let mut rng = StdRng::from_entropy();
        let mut chunk = BytesMut::zeroed(self.config.stream_chunk_bytes.max(1));
        let mut sent: u64 = 0;

        loop {
            rng.fill_bytes(&mut chunk[..]);
            match socket.write_all(&chunk).await {
                Ok(()) => {
                    sent += chunk.len() as u64;
                    metrics::STREAM_BYTES_SENT.inc_by(chunk.len() as u64);
                }
                Err(e) if peer_gone(&e) => {
                    debug!(client = %peer, sent, "Stream peer disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn sink(&self, socket: &mut TcpStream, peer: SocketAddr) -> io::Result<()> {
        match drain_until_idle(socket, self.config.idle_timeout()).await {
            Ok(drained) => debug!(client = %peer, drained, "Silent connection closed by peer"),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                debug!(client = %peer, "Silent connection idle, closing")
            }
            Err(e) if peer_gone(&e) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
