//! Time-bounded reads.
//!
//! Peers under load test are expected to misbehave: they go silent, trickle
//! bytes, or never close. Every read the listener and sender perform on a
//! peer is bounded either by a one-shot deadline ([`read_with_timeout`]) or
//! by an idle timeout that restarts whenever data arrives ([`IdleTimeout`]).

use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{sleep, timeout, Instant, Sleep};

pin_project! {
    /// A reader that fails with `TimedOut` once `idle_timeout` passes without
    /// any read completing.
    pub struct IdleTimeout<R> {
        #[pin]
        inner: R,
        #[pin]
        deadline: Sleep,
        idle_timeout: Duration,
    }
}

impl<R> IdleTimeout<R> {
    pub fn new(inner: R, idle_timeout: Duration) -> Self {
        Self {
            inner,
            deadline: sleep(idle_timeout),
            idle_timeout,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for IdleTimeout<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(res) => {
                let next = Instant::now() + *this.idle_timeout;
                this.deadline.as_mut().reset(next);
                Poll::Ready(res)
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer idle for too long",
                ))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Reads from an AsyncRead with a timeout.
///
/// Returns `Err(io::Error)` with kind `TimedOut` if the read doesn't complete
/// within the specified duration.
pub async fn read_with_timeout<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout_duration: Duration,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match timeout(timeout_duration, tokio::io::AsyncReadExt::read(reader, buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "read operation timed out",
        )),
    }
}

/// Reads and discards everything until EOF, returning the byte count.
/// Silence longer than `idle_timeout` ends the drain with `TimedOut`.
pub async fn drain_until_idle<R>(reader: R, idle_timeout: Duration) -> io::Result<u64>
where
    R: AsyncRead,
{
    let reader = IdleTimeout::new(reader, idle_timeout);
    tokio::pin!(reader);
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await
}
