use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tcpflood_common::GREETING;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};

/// How the listener treats a connection, decided from its first payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Starts with the canonical greeting.
    Greeting,
    /// Any other non-empty payload.
    StreamRequest,
    /// Nothing arrived within the grace period.
    Other,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Greeting => "greeting",
            Classification::StreamRequest => "stream_request",
            Classification::Other => "other",
        }
    }
}

pub enum InspectorResult {
    Complete(Classification),
    /// A proper prefix of the greeting, or nothing yet.
    Incomplete,
}

pub fn inspect_payload(buf: &[u8]) -> InspectorResult {
    if buf.is_empty() || (buf.len() < GREETING.len() && GREETING.starts_with(buf)) {
        return InspectorResult::Incomplete;
    }

    if buf.starts_with(GREETING) {
        InspectorResult::Complete(Classification::Greeting)
    } else {
        InspectorResult::Complete(Classification::StreamRequest)
    }
}

/// Classification of whatever was received when reading stopped short.
fn settle(buf: &[u8]) -> Classification {
    if buf.is_empty() {
        Classification::Other
    } else {
        Classification::StreamRequest
    }
}

#[derive(Debug, Clone)]
pub struct FirstPayload {
    pub classification: Classification,
    pub prefix: Bytes,
}

/// Reads the start of a connection until it can be classified.
///
/// At most `max_bytes` (never fewer than the greeting's length) are consumed
/// and reading stops at `grace`. A greeting split across segments is
/// reassembled; EOF or the grace period ending mid-greeting makes it a
/// stream request.
pub async fn read_first_payload<R>(
    reader: &mut R,
    grace: Duration,
    max_bytes: usize,
) -> io::Result<FirstPayload>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + grace;
    let mut buf = BytesMut::zeroed(max_bytes.max(GREETING.len()));
    let mut filled = 0;

    let classification = loop {
        if let InspectorResult::Complete(c) = inspect_payload(&buf[..filled]) {
            break c;
        }

        match timeout_at(deadline, reader.read(&mut buf[filled..])).await {
            Ok(Ok(0)) | Err(_) => break settle(&buf[..filled]),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e),
        }
    };

    buf.truncate(filled);
    Ok(FirstPayload {
        classification,
        prefix: buf.freeze(),
    })
}
