use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

// ---

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// Simple token bucket for bandwidth capping in [`LinkSimStream`].
///
/// Tokens represent bytes. On each [`TokenBucket::try_consume`] call the
/// bucket refills based on elapsed wall time at the configured rate, then
/// consumes up to `n` tokens. Capacity is capped at one second's worth so
/// long idle periods cannot accumulate an unbounded burst allowance.
pub(crate) struct TokenBucket {
    // ---
    /// Bytes per second limit.
    rate_bps: u64,

    /// Available tokens (bytes).
    tokens: f64,

    last_refill: Instant,
}

// ---

impl TokenBucket {
    // ---
    pub(crate) fn new(rate_bps: u64) -> Self {
        // ---
        Self {
            rate_bps,
            tokens: 0.0, // start empty, first write pays for tokens via refill
            last_refill: Instant::now(),
        }
    }

    // ---

    /// Refill from elapsed time, then consume up to `n` bytes.
    ///
    /// Returns bytes actually consumed; 0 means the bucket is empty.
    pub(crate) fn try_consume(&mut self, n: usize) -> usize {
        // ---
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        let cap = self.rate_bps as f64;
        self.tokens = (self.tokens + elapsed * cap).min(cap);

        let consumed = (self.tokens as usize).min(n);
        self.tokens -= consumed as f64;
        consumed
    }
}

// ---------------------------------------------------------------------------
// LinkSimStream
// ---------------------------------------------------------------------------

/// One end of an in-process connection backed by mpsc channels.
///
/// Created in connected pairs by [`LinkSimStream::pair`].  The write side
/// sends `Vec<u8>` chunks; the read side receives them.  An empty chunk,
/// sent on shutdown, signals EOF; so does the other end being dropped.
///
/// When `bucket` is `Some`, writes are throttled so throughput stays at or
/// below the configured rate.
pub struct LinkSimStream {
    // ---
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,

    /// Leftover bytes from a partially consumed chunk.
    read_buf: Vec<u8>,

    /// Set once the peer's EOF has been seen.
    eof: bool,

    /// Set once our write half has been shut down.
    finished: bool,

    /// `None` = unlimited. `Some` = token-bucket throttled.
    bucket: Option<TokenBucket>,
}

// ---

impl LinkSimStream {
    // ---
    /// Two connected ends; bytes written to one are read from the other.
    pub fn pair(bw_cap_bps: Option<u64>) -> (Self, Self) {
        // ---
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self::new(a_tx, a_rx, bw_cap_bps),
            Self::new(b_tx, b_rx, bw_cap_bps),
        )
    }

    // ---

    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>, bw_cap_bps: Option<u64>) -> Self {
        Self {
            tx,
            rx,
            read_buf: Vec::new(),
            eof: false,
            finished: false,
            bucket: bw_cap_bps.map(TokenBucket::new),
        }
    }
}

// ---

impl std::fmt::Debug for LinkSimStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSimStream")
            .field("eof", &self.eof)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

// ---

impl AsyncRead for LinkSimStream {
    // ---
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        // ---
        if !self.read_buf.is_empty() {
            let n = buf.remaining().min(self.read_buf.len());
            buf.put_slice(&self.read_buf[..n]);
            self.read_buf.drain(..n);
            return Poll::Ready(Ok(()));
        }

        if self.eof {
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) if chunk.is_empty() => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(chunk)) => {
                let n = buf.remaining().min(chunk.len());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.read_buf.extend_from_slice(&chunk[n..]);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ---

impl AsyncWrite for LinkSimStream {
    // ---
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        // ---
        if self.finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "link sim stream already shut down",
            )));
        }

        let allowed = match self.bucket.as_mut() {
            None => data.len(),
            Some(bucket) => bucket.try_consume(data.len()),
        };

        if allowed == 0 && !data.is_empty() {
            // Bucket empty: yield and reschedule immediately so tokens
            // can refill before the next poll.
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        match self.tx.send(data[..allowed].to_vec()) {
            Ok(()) => Poll::Ready(Ok(allowed)),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "link sim peer closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // ---
        if !self.finished {
            self.finished = true;
            let _ = self.tx.send(vec![]);
        }
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Instant;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{LinkSimStream, TokenBucket};

    // ---

    /// Verify the token bucket refills at the configured rate and enforces
    /// the cap across multiple consume calls.
    #[test]
    fn token_bucket_caps_throughput() {
        // ---
        let rate = 1_000_000_u64; // 1 MB/s
        let mut bucket = TokenBucket::new(rate);

        // Bucket starts empty: immediate consume should grant nothing.
        assert_eq!(bucket.try_consume(1_000_000), 0);

        std::thread::sleep(std::time::Duration::from_millis(100));
        let got = bucket.try_consume(1_000_000) as f64;
        let expected = rate as f64 * 0.1;
        let delta = (got - expected).abs() / expected;
        assert!(delta < 0.5, "after 100ms refill, got {got} bytes, expected ~{expected}");
    }

    // ---

    #[tokio::test]
    async fn pair_carries_bytes_both_ways_until_shutdown() {
        // ---
        let (mut a, mut b) = LinkSimStream::pair(None);

        a.write_all(b"hello").await.unwrap();
        b.write_all(b"world").await.unwrap();
        a.shutdown().await.unwrap();

        let mut got = Vec::new();
        b.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello");

        let mut buf = [0u8; 5];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        assert!(a.write_all(b"late").await.is_err(), "write after shutdown");
    }

    // ---

    #[tokio::test]
    async fn dropped_peer_reads_as_eof_and_breaks_writes() {
        // ---
        let (mut a, b) = LinkSimStream::pair(None);
        drop(b);

        let mut buf = Vec::new();
        assert_eq!(a.read_to_end(&mut buf).await.unwrap(), 0);
        assert!(a.write_all(b"x").await.is_err());
    }

    // ---

    /// A capped stream enforces throughput end-to-end through `poll_write`.
    #[tokio::test]
    async fn bw_cap_enforced() {
        // ---
        let rate_bps = 2_000_000_u64; // 2 MB/s
        let payload_bytes = 500_000_usize; // expect ~250ms

        let (mut a, _b) = LinkSimStream::pair(Some(rate_bps));

        let start = Instant::now();
        a.write_all(&vec![0u8; payload_bytes]).await.expect("write_all failed");
        let elapsed = start.elapsed().as_secs_f64();

        let actual_bps = payload_bytes as f64 / elapsed;
        assert!(
            actual_bps <= rate_bps as f64 * 1.15,
            "throughput {actual_bps:.0} bps exceeded cap {rate_bps} bps by more than 15%"
        );
    }
}
