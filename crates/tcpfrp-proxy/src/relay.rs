//! Bidirectional byte relay between a public connection and a work connection
//!
//! Each direction is pumped through its own bounded buffer, so a slow reader on
//! one side applies backpressure to the writer on the other instead of growing
//! memory. When one side finishes sending, the other side's write half is shut
//! down and the opposite direction keeps flowing until it finishes as well.

use bytes::Bytes;
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Per-direction buffer used when none is configured
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    PublicToWork,
    WorkToPublic,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::PublicToWork => write!(f, "public->work"),
            Direction::WorkToPublic => write!(f, "work->public"),
        }
    }
}

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub public_to_work: u64,
    pub work_to_public: u64,
}

impl fmt::Display for RelayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes public->work, {} bytes work->public",
            self.public_to_work, self.work_to_public
        )
    }
}

/// Live byte counters for one relay
///
/// Owned by the caller so the totals stay readable when the relay future is
/// dropped before it finishes.
#[derive(Debug, Default)]
pub struct RelayCounters {
    public_to_work: AtomicU64,
    work_to_public: AtomicU64,
}

impl RelayCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            public_to_work: self.public_to_work.load(Ordering::Relaxed),
            work_to_public: self.work_to_public.load(Ordering::Relaxed),
        }
    }
}

/// A relay that ended on an I/O error. Both sides are closed by then.
#[derive(Debug, Error)]
#[error("Relay {direction} failed after {stats}: {source}")]
pub struct RelayError {
    pub direction: Direction,
    pub stats: RelayStats,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Clone, Copy)]
pub struct Relay {
    buffer_size: usize,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl Relay {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Pump bytes until both directions have reached end-of-stream
    ///
    /// `work_prelude` holds bytes already read from the work connection (past
    /// its handshake frame); they reach the public side before anything else.
    /// An error in either direction stops both and drops both streams.
    pub async fn run<P, W>(
        &self,
        public: P,
        work: W,
        work_prelude: Bytes,
    ) -> Result<RelayStats, RelayError>
    where
        P: AsyncRead + AsyncWrite,
        W: AsyncRead + AsyncWrite,
    {
        let counters = RelayCounters::new();
        self.run_counted(public, work, work_prelude, &counters).await
    }

    /// Like [`Relay::run`], recording progress in caller-owned counters
    ///
    /// Bytes are counted as soon as they are written, so `counters` holds the
    /// totals so far even if this future is cancelled.
    pub async fn run_counted<P, W>(
        &self,
        public: P,
        work: W,
        work_prelude: Bytes,
        counters: &RelayCounters,
    ) -> Result<RelayStats, RelayError>
    where
        P: AsyncRead + AsyncWrite,
        W: AsyncRead + AsyncWrite,
    {
        let (public_read, public_write) = tokio::io::split(public);
        let (work_read, work_write) = tokio::io::split(work);
        let work_read = Cursor::new(work_prelude).chain(work_read);

        let upstream = async {
            pump(public_read, work_write, self.buffer_size, &counters.public_to_work)
                .await
                .map_err(|e| (Direction::PublicToWork, e))
        };
        let downstream = async {
            pump(work_read, public_write, self.buffer_size, &counters.work_to_public)
                .await
                .map_err(|e| (Direction::WorkToPublic, e))
        };

        let result = tokio::try_join!(upstream, downstream);
        let stats = counters.snapshot();

        match result {
            Ok(_) => {
                debug!("Relay finished: {}", stats);
                Ok(stats)
            }
            Err((direction, source)) => {
                debug!("Relay {} failed: {}", direction, source);
                Err(RelayError {
                    direction,
                    stats,
                    source,
                })
            }
        }
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    counter: &AtomicU64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // Propagate the half-close; the peer may already be gone
            if let Err(e) = writer.shutdown().await {
                trace!("Shutdown after EOF failed: {}", e);
            }
            return Ok(());
        }

        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        writer.flush().await?;
    }
}
