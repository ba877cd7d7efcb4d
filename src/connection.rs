//! Byte-stream wrapper that paces every read and write through a shared
//! [`TokenBucketRegulator`].
//!
//! Before each operation the regulator is asked how long the expected
//! transfer would take. The expectation is the offered buffer size scaled by
//! a smoothed "fraction actually used" (a read into a large buffer rarely
//! fills it), and the smoothed duration of the I/O call itself is deducted
//! from the wait. After the operation the real byte count is settled, and the
//! wait returned by the settlement is served before the next operation in the
//! same direction, so transferred data is never held behind a timer.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::{Instant, Sleep, sleep};
use tracing::warn;

use crate::regulator::TokenBucketRegulator;

/// Lower bound on the settled period, keeps rate arithmetic finite.
const MIN_SETTLE_PERIOD: Duration = Duration::from_micros(10);

/// Weight of history in the exponential smoothing.
const HISTORY_WEIGHT: f64 = 0.9;

/// Smoothed usage estimates for one direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageEstimate {
    pub fraction_used: f64,
    pub avg_duration: Duration,
}

impl Default for UsageEstimate {
    fn default() -> Self {
        Self {
            fraction_used: 1.0,
            avg_duration: Duration::ZERO,
        }
    }
}

impl UsageEstimate {
    fn observe(&mut self, offered: usize, transferred: usize, took: Duration) {
        if offered > 0 {
            let fraction = (transferred as f64 / offered as f64).min(1.0);
            self.fraction_used =
                HISTORY_WEIGHT * self.fraction_used + (1.0 - HISTORY_WEIGHT) * fraction;
        }
        self.avg_duration =
            self.avg_duration.mul_f64(HISTORY_WEIGHT) + took.mul_f64(1.0 - HISTORY_WEIGHT);
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    /// Serving the wait owed by the previous settlement.
    Repaying(Pin<Box<Sleep>>),
    /// Serving the predicted wait ahead of the transfer.
    Pacing {
        sleep: Pin<Box<Sleep>>,
        started: Instant,
    },
    Transfer {
        started: Instant,
        io_started: Instant,
    },
}

#[derive(Debug)]
struct Throttle {
    estimate: UsageEstimate,
    owed: Duration,
    phase: Phase,
}

impl Throttle {
    fn new() -> Self {
        Self {
            estimate: UsageEstimate::default(),
            owed: Duration::ZERO,
            phase: Phase::Idle,
        }
    }

    /// Resolves once the transfer of up to `offered` bytes may start.
    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
        regulator: &TokenBucketRegulator,
        offered: usize,
    ) -> Poll<io::Result<()>> {
        loop {
            match &mut self.phase {
                Phase::Idle => {
                    if self.owed.is_zero() {
                        self.begin(regulator, offered)?;
                    } else {
                        let owed = std::mem::take(&mut self.owed);
                        self.phase = Phase::Repaying(Box::pin(sleep(owed)));
                    }
                }
                Phase::Repaying(repay) => {
                    ready!(repay.as_mut().poll(cx));
                    self.begin(regulator, offered)?;
                }
                Phase::Pacing { sleep, started } => {
                    ready!(sleep.as_mut().poll(cx));
                    let started = *started;
                    self.phase = Phase::Transfer {
                        started,
                        io_started: Instant::now(),
                    };
                }
                Phase::Transfer { .. } => return Poll::Ready(Ok(())),
            }
        }
    }

    fn begin(&mut self, regulator: &TokenBucketRegulator, offered: usize) -> io::Result<()> {
        let started = Instant::now();
        let planned = offered as f64 * self.estimate.fraction_used;
        let wait = regulator
            .predict(planned)
            .map_err(io::Error::other)?
            .saturating_sub(self.estimate.avg_duration);

        self.phase = if wait.is_zero() {
            Phase::Transfer {
                started,
                io_started: started,
            }
        } else {
            Phase::Pacing {
                sleep: Box::pin(sleep(wait)),
                started,
            }
        };
        Ok(())
    }

    fn finish(&mut self, regulator: &TokenBucketRegulator, offered: usize, transferred: usize) {
        let Phase::Transfer {
            started,
            io_started,
        } = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            return;
        };

        let now = Instant::now();
        let period = (now - started).max(MIN_SETTLE_PERIOD);
        match regulator.settle(transferred as f64, period) {
            Ok(wait) => self.owed = wait,
            // The next operation reports the closed regulator.
            Err(e) => warn!(error = %e, transferred, "Settlement failed"),
        }
        self.estimate.observe(offered, transferred, now - io_started);
    }

    fn abort(&mut self) {
        self.phase = Phase::Idle;
    }
}

/// A connection whose reads and writes are paced by a shared regulator.
///
/// Each direction keeps its own smoothing state. Concurrent use of the read
/// and write halves is as safe as the underlying stream allows.
#[derive(Debug)]
pub struct RegulatedConnection<S> {
    inner: S,
    regulator: TokenBucketRegulator,
    reader: Throttle,
    writer: Throttle,
}

impl<S> RegulatedConnection<S> {
    pub fn new(inner: S, regulator: TokenBucketRegulator) -> Self {
        Self {
            inner,
            regulator,
            reader: Throttle::new(),
            writer: Throttle::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn read_estimate(&self) -> UsageEstimate {
        self.reader.estimate
    }

    pub fn write_estimate(&self) -> UsageEstimate {
        self.writer.estimate
    }
}

impl RegulatedConnection<TcpStream> {
    /// Opens a TCP connection to `addr` paced by `regulator`.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        regulator: TokenBucketRegulator,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream, regulator))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RegulatedConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let offered = buf.remaining();
        ready!(this.reader.poll_ready(cx, &this.regulator, offered))?;

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                let transferred = buf.filled().len() - before;
                this.reader.finish(&this.regulator, offered, transferred);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.reader.abort();
                Poll::Ready(Err(e))
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RegulatedConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let offered = buf.len();
        ready!(this.writer.poll_ready(cx, &this.regulator, offered))?;

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(written)) => {
                this.writer.finish(&this.regulator, offered, written);
                Poll::Ready(Ok(written))
            }
            Poll::Ready(Err(e)) => {
                this.writer.abort();
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
