use super::{Mode, ModeStats, ModeSummary, Target};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

const READ_CHUNK: usize = 16 * 1024;

/// First payload of a stream connection. Anything other than the greeting
/// is a stream request to the listener; the cap is informational.
pub fn stream_request(cap: u64) -> Vec<u8> {
    format!("STREAM {cap}\n").into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    CapReached,
    PeerClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    pub received: u64,
    pub end: StreamEnd,
}

/// Reads until `cap` bytes have arrived or the peer closes. A cap of zero
/// reads until the peer closes. Never reads past the cap, however much the
/// peer sends.
pub async fn read_capped<R, F>(reader: &mut R, cap: u64, mut on_chunk: F) -> io::Result<StreamOutcome>
where
    R: AsyncRead + Unpin,
    F: FnMut(usize),
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut received: u64 = 0;

    loop {
        let want = if cap == 0 {
            buf.len()
        } else {
            let left = cap - received;
            if left == 0 {
                return Ok(StreamOutcome {
                    received,
                    end: StreamEnd::CapReached,
                });
            }
            left.min(buf.len() as u64) as usize
        };

        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Ok(StreamOutcome {
                received,
                end: StreamEnd::PeerClosed,
            });
        }
        received += n as u64;
        on_chunk(n);
    }
}

pub(super) async fn run(target: Arc<Target>, cap: u64, cancel: CancellationToken) -> ModeSummary {
    let stats = ModeStats::default();
    stats.attempt(Mode::Stream);

    let mut socket = match target.connect().await {
        Ok(s) => s,
        Err(e) => {
            stats.fail(Mode::Stream, &e);
            return stats.snapshot();
        }
    };
    stats.connected.fetch_add(1, Ordering::Relaxed);

    if let Err(e) = socket.write_all(&stream_request(cap)).await {
        stats.fail(Mode::Stream, &e);
        return stats.snapshot();
    }

    tokio::select! {
        res = read_capped(&mut socket, cap, |n| stats.received(n)) => match res {
            Ok(outcome) => {
                if outcome.received > 0 {
                    stats.replies.fetch_add(1, Ordering::Relaxed);
                }
                info!(cap, received = outcome.received, end = ?outcome.end, "Stream complete");
            }
            Err(e) => stats.fail(Mode::Stream, &e),
        },
        _ = cancel.cancelled() => {
            info!(
                cap,
                received = stats.snapshot().bytes_received,
                "Stream cancelled"
            );
        }
    }

    stats.snapshot()
}
