//! Two-lane fetch scheduler.
//!
//! High-priority fetches never sleep for the regulator: they run on the
//! caller's task in [`WaitMode::NonBlocking`] mode and hand their debt to the
//! dispatcher. Low-priority fetches go one at a time through the dispatcher,
//! which closes the low lane until all accumulated debt has been waited out.
//! The aggregate rate is the one a single regulator would enforce; the delay
//! lands entirely on the low lane.
//!
//! ```text
//!            high debt / low done
//!   Idle ───────────────────────────▶ Suspended
//!    │  ▲                                │
//!    │  └────────── timer ───────────────┘
//!    │ low accepted       ▲
//!    ▼                    │ low done, debt > 0
//!   LowInFlight ──────────┘
//!    └─ low done, no debt ─▶ Idle
//! ```

use reqwest::Request;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::fetch::{FetchOutcome, RegulatedFetch, WaitMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Low => "low",
        }
    }
}

struct LowRequest {
    request: Request,
    reply: oneshot::Sender<Result<FetchOutcome>>,
}

/// Handle to a running scheduler. Clones share the same dispatcher.
#[derive(Clone)]
pub struct PriorityFetchScheduler {
    fetcher: Arc<dyn RegulatedFetch>,
    low_tx: mpsc::Sender<LowRequest>,
    debt_tx: mpsc::UnboundedSender<Duration>,
    stop_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for PriorityFetchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityFetchScheduler")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PriorityFetchScheduler {
    /// Starts the dispatcher on the current tokio runtime.
    pub fn spawn(fetcher: Arc<dyn RegulatedFetch>) -> Self {
        let (low_tx, low_rx) = mpsc::channel(1);
        let (debt_tx, debt_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            fetcher: fetcher.clone(),
            low_rx,
            debt_rx,
            stop_rx,
            stop_open: true,
            state: LaneState::Idle,
            deferred: Duration::ZERO,
            reopen_at: None,
            in_flight: None,
            stopping: false,
            acks: Vec::new(),
        };
        tokio::spawn(dispatcher.run());

        Self {
            fetcher,
            low_tx,
            debt_tx,
            stop_tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fetches `request` in the given lane and returns its outcome.
    ///
    /// # Errors
    ///
    /// [`Error::FetcherClosed`] once a stop has been requested, including for
    /// low-priority requests still queued when it was.
    pub async fn fetch(&self, request: Request, priority: Priority) -> Result<FetchOutcome> {
        if self.is_closed() {
            return Err(Error::FetcherClosed);
        }

        match priority {
            Priority::High => {
                let (outcome, debt) = self.fetcher.fetch(request, WaitMode::NonBlocking).await?;
                if !debt.is_zero() {
                    // A stopped dispatcher no longer schedules low traffic.
                    let _ = self.debt_tx.send(debt);
                }
                Ok(outcome)
            }
            Priority::Low => {
                let (reply, rx) = oneshot::channel();
                self.low_tx
                    .send(LowRequest { request, reply })
                    .await
                    .map_err(|_| Error::FetcherClosed)?;
                rx.await.map_err(|_| Error::FetcherClosed)?
            }
        }
    }

    /// Stops admitting requests and returns a receiver that resolves once the
    /// in-flight low-priority fetch, if any, has been delivered.
    pub fn request_stop(&self) -> oneshot::Receiver<()> {
        self.closed.store(true, Ordering::Release);
        let (ack, done) = oneshot::channel();
        // If the dispatcher is gone the dropped sender resolves `done`.
        let _ = self.stop_tx.send(ack);
        done
    }

    /// Requests a stop and waits for the drain to finish.
    pub async fn close(&self) {
        let _ = self.request_stop().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneState {
    /// Low lane open, nothing in flight.
    Idle,
    /// One low-priority fetch running; low lane closed.
    LowInFlight,
    /// Waiting out deferred debt; low lane closed.
    Suspended,
}

struct Dispatcher {
    fetcher: Arc<dyn RegulatedFetch>,
    low_rx: mpsc::Receiver<LowRequest>,
    debt_rx: mpsc::UnboundedReceiver<Duration>,
    stop_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    stop_open: bool,
    state: LaneState,
    deferred: Duration,
    reopen_at: Option<Instant>,
    in_flight: Option<JoinHandle<Duration>>,
    stopping: bool,
    acks: Vec<oneshot::Sender<()>>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            if self.stopping && self.in_flight.is_none() {
                break;
            }

            let lane_open = self.state == LaneState::Idle && !self.stopping;
            let reopen_at = self.reopen_at;

            tokio::select! {
                biased;

                joined = wait_for(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    let debt = joined.unwrap_or_else(|e| {
                        error!(error = %e, "Low-priority fetch task failed");
                        Duration::ZERO
                    });
                    self.on_low_done(debt);
                }
                Some(debt) = self.debt_rx.recv() => self.on_high_debt(debt),
                () = sleep_until(reopen_at.unwrap_or_else(Instant::now)),
                    if reopen_at.is_some() =>
                {
                    self.on_reopen();
                }
                stop = self.stop_rx.recv(), if self.stop_open => match stop {
                    Some(ack) => {
                        self.acks.push(ack);
                        self.begin_stop();
                    }
                    None => {
                        self.stop_open = false;
                        self.begin_stop();
                    }
                },
                Some(low) = self.low_rx.recv(), if lane_open => self.dispatch_low(low),
                else => break,
            }
        }

        // Queued low requests are dropped with their reply senders.
        self.low_rx.close();
        for ack in self.acks.drain(..) {
            let _ = ack.send(());
        }
        info!("Fetch scheduler stopped");
    }

    fn begin_stop(&mut self) {
        if !self.stopping {
            debug!(draining = self.in_flight.is_some(), "Stopping fetch scheduler");
            self.stopping = true;
            self.low_rx.close();
        }
    }

    fn dispatch_low(&mut self, low: LowRequest) {
        self.state = LaneState::LowInFlight;
        let fetcher = self.fetcher.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let (result, debt) = match fetcher.fetch(low.request, WaitMode::NonBlocking).await {
                Ok((outcome, debt)) => (Ok(outcome), debt),
                Err(e) => (Err(e), Duration::ZERO),
            };
            // Delivered before the dispatcher sees completion.
            let _ = low.reply.send(result);
            debt
        }));
    }

    fn on_high_debt(&mut self, debt: Duration) {
        match self.state {
            LaneState::LowInFlight => self.deferred = self.deferred.saturating_add(debt),
            LaneState::Idle => {
                self.deferred = debt;
                self.suspend();
            }
            LaneState::Suspended => {
                self.deferred = self.deferred.saturating_add(debt);
                self.reopen_at = self.reopen_at.map(|at| deadline(at, debt));
            }
        }
        debug!(
            debt_ms = debt.as_millis() as u64,
            deferred_ms = self.deferred.as_millis() as u64,
            "High-priority debt deferred to low lane"
        );
    }

    fn on_low_done(&mut self, debt: Duration) {
        self.deferred = self.deferred.saturating_add(debt);
        if self.deferred.is_zero() {
            self.state = LaneState::Idle;
        } else {
            self.suspend();
        }
    }

    fn suspend(&mut self) {
        self.state = LaneState::Suspended;
        self.reopen_at = Some(deadline(Instant::now(), self.deferred));
    }

    fn on_reopen(&mut self) {
        self.state = LaneState::Idle;
        self.deferred = Duration::ZERO;
        self.reopen_at = None;
    }
}

/// Roughly 30 years; stands in for a deadline past `Instant`'s range.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline(from: Instant, wait: Duration) -> Instant {
    from.checked_add(wait).unwrap_or_else(|| from + FAR_FUTURE)
}

/// Waits for the in-flight task; pends forever if there is none.
async fn wait_for(
    in_flight: &mut Option<JoinHandle<Duration>>,
) -> std::result::Result<Duration, tokio::task::JoinError> {
    match in_flight {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Fetcher whose latency and debt depend on the request path.
    #[derive(Default)]
    struct ScriptedFetcher {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        log: Mutex<Vec<(String, Instant, Instant)>>,
    }

    impl ScriptedFetcher {
        fn spans(&self, path: &str) -> Vec<(Instant, Instant)> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _, _)| p == path)
                .map(|(_, s, e)| (*s, *e))
                .collect()
        }
    }

    #[async_trait]
    impl RegulatedFetch for ScriptedFetcher {
        async fn fetch(
            &self,
            request: Request,
            mode: WaitMode,
        ) -> Result<(FetchOutcome, Duration)> {
            assert_eq!(mode, WaitMode::NonBlocking);
            let path = request.url().path().to_string();
            let (latency, debt) = match path.as_str() {
                "/high" => (Duration::from_millis(100), Duration::from_secs(5)),
                "/unbounded" => (Duration::from_millis(100), Duration::MAX),
                "/slow" => (Duration::from_secs(2), Duration::ZERO),
                "/owing" => (Duration::from_secs(2), Duration::from_secs(3)),
                _ => (Duration::from_secs(1), Duration::ZERO),
            };

            let start = Instant::now();
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.log
                .lock()
                .unwrap()
                .push((path, start, Instant::now()));
            let mut outcome = FetchOutcome::started(start);
            outcome.body_closed = Some(Instant::now());
            Ok((outcome, debt))
        }
    }

    fn request(path: &str) -> Request {
        crate::fetch::get_request(&format!("http://feeds.example{path}")).unwrap()
    }

    fn scheduler() -> (Arc<ScriptedFetcher>, PriorityFetchScheduler) {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let scheduler = PriorityFetchScheduler::spawn(fetcher.clone());
        (fetcher, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_never_waits_for_debt() {
        let (_, scheduler) = scheduler();

        for _ in 0..5 {
            let start = Instant::now();
            scheduler.fetch(request("/high"), Priority::High).await.unwrap();
            assert!(start.elapsed() < Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_priority_absorbs_high_priority_debt() {
        let (_, scheduler) = scheduler();

        scheduler.fetch(request("/high"), Priority::High).await.unwrap();
        let start = Instant::now();
        scheduler.fetch(request("/low"), Priority::Low).await.unwrap();

        // 5s of debt, then a 1s fetch.
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_delay_grows_under_continuous_high_traffic() {
        let (_, scheduler) = scheduler();

        let high = scheduler.clone();
        let hammer = tokio::spawn(async move {
            for _ in 0..10 {
                let start = Instant::now();
                high.fetch(request("/high"), Priority::High).await.unwrap();
                assert!(start.elapsed() < Duration::from_millis(150));
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        let start = Instant::now();
        scheduler.fetch(request("/low"), Priority::Low).await.unwrap();
        hammer.await.unwrap();

        // Ten high fetches owe 50s in total, far beyond one debt.
        assert!(start.elapsed() > Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_low_priority_fetch_at_a_time() {
        let (fetcher, scheduler) = scheduler();

        let first = scheduler.clone();
        let second = scheduler.clone();
        let (a, b) = tokio::join!(
            first.fetch(request("/low"), Priority::Low),
            second.fetch(request("/low"), Priority::Low),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 1);
        let spans = fetcher.spans("/low");
        assert_eq!(spans.len(), 2);
        assert!(spans[1].0 >= spans[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_runs_alongside_low() {
        let (fetcher, scheduler) = scheduler();

        let low = scheduler.clone();
        let background =
            tokio::spawn(async move { low.fetch(request("/slow"), Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = Instant::now();
        scheduler.fetch(request("/high"), Priority::High).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(150));

        background.await.unwrap().unwrap();
        assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_priority_debt_suspends_next_low_fetch() {
        let (fetcher, scheduler) = scheduler();

        scheduler.fetch(request("/owing"), Priority::Low).await.unwrap();
        scheduler.fetch(request("/low"), Priority::Low).await.unwrap();

        let owing = fetcher.spans("/owing");
        let low = fetcher.spans("/low");
        assert!(low[0].0 >= owing[0].1 + Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_debt_during_low_fetch_applies_on_completion() {
        let (fetcher, scheduler) = scheduler();

        let low = scheduler.clone();
        let background =
            tokio::spawn(async move { low.fetch(request("/owing"), Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.fetch(request("/high"), Priority::High).await.unwrap();
        background.await.unwrap().unwrap();
        scheduler.fetch(request("/low"), Priority::Low).await.unwrap();

        // 3s owed by the low fetch itself plus 5s from the high one.
        let owing = fetcher.spans("/owing");
        let low = fetcher.spans("/low");
        assert!(low[0].0 >= owing[0].1 + Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_debt_keeps_dispatcher_alive() {
        let (_, scheduler) = scheduler();

        scheduler.fetch(request("/unbounded"), Priority::High).await.unwrap();
        // A second debt lands while the lane is suspended.
        scheduler.fetch(request("/unbounded"), Priority::High).await.unwrap();

        let waited = tokio::time::timeout(
            Duration::from_secs(60),
            scheduler.fetch(request("/low"), Priority::Low),
        )
        .await;
        assert!(waited.is_err(), "low fetch should still be suspended");

        assert!(scheduler.request_stop().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drains_in_flight_low_fetch() {
        let (_, scheduler) = scheduler();

        let low = scheduler.clone();
        let background =
            tokio::spawn(async move { low.fetch(request("/slow"), Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = Instant::now();
        scheduler.close().await;
        assert!(start.elapsed() >= Duration::from_millis(1990));

        let outcome = background.await.unwrap().unwrap();
        assert!(outcome.is_success());

        assert!(scheduler.is_closed());
        assert!(matches!(
            scheduler.fetch(request("/high"), Priority::High).await,
            Err(Error::FetcherClosed)
        ));
        assert!(matches!(
            scheduler.fetch(request("/low"), Priority::Low).await,
            Err(Error::FetcherClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_queued_low_requests() {
        let (fetcher, scheduler) = scheduler();

        // Suspend the low lane so the next low request stays queued.
        scheduler.fetch(request("/high"), Priority::High).await.unwrap();
        let low = scheduler.clone();
        let queued = tokio::spawn(async move { low.fetch(request("/low"), Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.close().await;

        assert!(matches!(queued.await.unwrap(), Err(Error::FetcherClosed)));
        assert!(fetcher.spans("/low").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_when_idle_is_immediate() {
        let (_, scheduler) = scheduler();
        let other = scheduler.clone();

        let start = Instant::now();
        let first = scheduler.request_stop();
        other.close().await;
        first.await.unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(other.is_closed());
    }
}
