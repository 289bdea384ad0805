//! Full-duplex copying between the two streams of a connection pair.
//!
//! Each direction runs in its own task. Whichever direction stops first
//! cancels the pair's token, which stops the other one; the streams close once
//! both tasks have dropped their halves.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::RelayError;

const BUFFER_SIZE: usize = 32 * 1024;

/// Direction of a copy task within a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound (source) connection into the outbound (destination) one
    Upstream,
    /// Outbound connection back into the inbound one
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("from source to destination"),
            Direction::Downstream => f.write_str("from destination back to source"),
        }
    }
}

/// How a copy task stopped
#[derive(Debug)]
enum End {
    Eof,
    Cancelled,
    Failed(io::Error),
}

/// Summary of a finished splice
#[derive(Debug, Default)]
pub struct SpliceReport {
    /// Bytes relayed from source to destination
    pub upstream: u64,
    /// Bytes relayed from destination to source
    pub downstream: u64,
    /// The pair was torn down because nothing moved for the idle timeout
    pub timed_out: bool,
    /// I/O errors seen by the copy tasks
    pub failures: Vec<RelayError>,
}

/// Last time any byte moved through the pair
#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let millis = self.origin.elapsed().as_millis() as u64;
        self.last_millis.store(millis, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Relay bytes between `inbound` and `outbound` until either side stops
///
/// Cancelling `cancel` tears the pair down from outside. With an idle timeout,
/// a pair that moves no bytes in either direction for that long is cancelled
/// too. Returns after both copy tasks have finished and dropped their streams.
pub async fn splice<A, B>(
    inbound: A,
    outbound: B,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
) -> SpliceReport
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (in_read, in_write) = tokio::io::split(inbound);
    let (out_read, out_write) = tokio::io::split(outbound);
    let activity = Arc::new(Activity::new());

    let upstream = tokio::spawn(copy_direction(
        Direction::Upstream,
        in_read,
        out_write,
        cancel.clone(),
        Arc::clone(&activity),
    ));
    let downstream = tokio::spawn(copy_direction(
        Direction::Downstream,
        out_read,
        in_write,
        cancel.clone(),
        Arc::clone(&activity),
    ));
    let watchdog = async {
        match idle_timeout {
            Some(limit) => watch_idle(limit, &cancel, &activity).await,
            None => false,
        }
    };

    let (upstream, downstream, timed_out) = tokio::join!(upstream, downstream, watchdog);

    let mut report = SpliceReport {
        timed_out,
        ..SpliceReport::default()
    };
    let finished = [
        (Direction::Upstream, upstream),
        (Direction::Downstream, downstream),
    ];
    for (direction, joined) in finished {
        let (copied, end) = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(%direction, error = %e, "Copy task did not complete");
                continue;
            }
        };
        match direction {
            Direction::Upstream => report.upstream = copied,
            Direction::Downstream => report.downstream = copied,
        }
        match end {
            End::Eof => debug!(%direction, copied, "Reached end of stream"),
            End::Cancelled => debug!(%direction, copied, "Stopped by teardown"),
            End::Failed(source) => report.failures.push(RelayError::Copy { direction, source }),
        }
    }
    report
}

/// Copy one direction until end of stream, error, or cancellation
///
/// Cancels the pair when it returns, whatever the reason.
async fn copy_direction<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
    activity: Arc<Activity>,
) -> (u64, End)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _teardown = cancel.clone().drop_guard();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return (copied, End::Cancelled),
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                // Propagate the EOF so the peer sees everything we forwarded.
                return match writer.shutdown().await {
                    Ok(()) => (copied, End::Eof),
                    Err(e) => (copied, End::Failed(e)),
                };
            }
            Ok(n) => n,
            Err(e) => return (copied, End::Failed(e)),
        };
        activity.touch();

        let written = tokio::select! {
            _ = cancel.cancelled() => return (copied, End::Cancelled),
            written = write_chunk(&mut writer, &buf[..n]) => written,
        };
        if let Err(e) = written {
            debug!(%direction, error = %e, "Write failed");
            return (copied, End::Failed(e));
        }
        copied += n as u64;
        activity.touch();
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

/// Cancel the pair once nothing has moved for `limit`; returns whether it fired
async fn watch_idle(limit: Duration, cancel: &CancellationToken, activity: &Activity) -> bool {
    loop {
        let idle = activity.idle_for();
        if idle >= limit {
            debug!(?limit, "Connection idle, closing");
            cancel.cancel();
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(limit - idle) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (mut client, relay_in) = duplex(1024);
        let (relay_out, mut server) = duplex(1024);
        let pair = tokio::spawn(splice(relay_in, relay_out, CancellationToken::new(), None));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        drop(client);
        let mut rest = Vec::new();
        timeout(TEST_TIMEOUT, server.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        let report = timeout(TEST_TIMEOUT, pair).await.unwrap().unwrap();
        assert_eq!(report.upstream, 5);
        assert_eq!(report.downstream, 6);
        assert!(!report.timed_out);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_large_payload_is_not_truncated() {
        let (mut client, relay_in) = duplex(4096);
        let (relay_out, mut server) = duplex(4096);
        let pair = tokio::spawn(splice(relay_in, relay_out, CancellationToken::new(), None));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::new();
        timeout(TEST_TIMEOUT, server.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let report = timeout(TEST_TIMEOUT, pair).await.unwrap().unwrap();
        assert_eq!(report.upstream, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_destination_close_tears_down_source() {
        let (mut client, relay_in) = duplex(1024);
        let (relay_out, server) = duplex(1024);
        let pair = tokio::spawn(splice(relay_in, relay_out, CancellationToken::new(), None));

        drop(server);
        let mut buf = [0u8; 8];
        let n = timeout(TEST_TIMEOUT, client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
        timeout(TEST_TIMEOUT, pair).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_closes_both_sides() {
        let (mut client, relay_in) = duplex(1024);
        let (relay_out, mut server) = duplex(1024);
        let cancel = CancellationToken::new();
        let pair = tokio::spawn(splice(relay_in, relay_out, cancel.clone(), None));

        cancel.cancel();
        let report = timeout(TEST_TIMEOUT, pair).await.unwrap().unwrap();
        assert!(!report.timed_out);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idle_pair_times_out() {
        let (mut client, relay_in) = duplex(1024);
        let (relay_out, _server) = duplex(1024);
        let pair = tokio::spawn(splice(
            relay_in,
            relay_out,
            CancellationToken::new(),
            Some(Duration::from_millis(100)),
        ));

        let report = timeout(TEST_TIMEOUT, pair).await.unwrap().unwrap();
        assert!(report.timed_out);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_activity_defers_idle_timeout() {
        let (mut client, relay_in) = duplex(1024);
        let (relay_out, mut server) = duplex(1024);
        let pair = tokio::spawn(splice(
            relay_in,
            relay_out,
            CancellationToken::new(),
            Some(Duration::from_millis(400)),
        ));

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            server.read_exact(&mut buf).await.unwrap();
        }
        assert!(!pair.is_finished());

        let report = timeout(TEST_TIMEOUT, pair).await.unwrap().unwrap();
        assert!(report.timed_out);
        assert_eq!(report.upstream, 6);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Upstream.to_string(), "from source to destination");
        assert_eq!(
            Direction::Downstream.to_string(),
            "from destination back to source"
        );
    }
}
