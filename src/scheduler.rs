use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Error;

/// Deferred checks the engine asks to run later. Every job is a
/// "do this only if the ride is still waiting" check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpiryJob {
    BeginDispatch { ride_id: Uuid },
    SearchTimeout { ride_id: Uuid },
    OfferExpiry { ride_id: Uuid, offer_id: Uuid },
    MatchingPass { ride_id: Uuid },
}

impl ExpiryJob {
    pub fn ride_id(&self) -> Uuid {
        match self {
            Self::BeginDispatch { ride_id }
            | Self::SearchTimeout { ride_id }
            | Self::OfferExpiry { ride_id, .. }
            | Self::MatchingPass { ride_id } => *ride_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BeginDispatch { .. } => "begin_dispatch",
            Self::SearchTimeout { .. } => "search_timeout",
            Self::OfferExpiry { .. } => "offer_expiry",
            Self::MatchingPass { .. } => "matching_pass",
        }
    }
}

#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn fire(&self, job: ExpiryJob) -> Result<(), Error>;
}

#[derive(Debug)]
struct Scheduled {
    due: Duration,
    seq: u64,
    job: ExpiryJob,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Timer queue keyed on the clock's monotonic time. Jobs due at the same
/// instant fire in the order they were scheduled.
#[derive(Debug)]
pub struct ExpiryScheduler {
    clock: Arc<dyn Clock>,
    queue: Mutex<BinaryHeap<Reverse<Scheduled>>>,
    next_seq: AtomicU64,
    wake_tx: async_channel::Sender<()>,
    wake_rx: async_channel::Receiver<()>,
}

impl ExpiryScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (wake_tx, wake_rx) = async_channel::bounded(1);

        Self {
            clock,
            queue: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            wake_tx,
            wake_rx,
        }
    }

    fn queue(&self) -> MutexGuard<'_, BinaryHeap<Reverse<Scheduled>>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schedule_in(&self, delay: Duration, job: ExpiryJob) {
        let due = self.clock.elapsed() + delay;
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);

        tracing::debug!(job = job.name(), ride_id = %job.ride_id(), ?delay, "scheduling job");

        self.queue().push(Reverse(Scheduled { due, seq, job }));

        // a full channel already holds a pending wake-up
        let _ = self.wake_tx.try_send(());
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    pub fn next_due_in(&self) -> Option<Duration> {
        let now = self.clock.elapsed();

        self.queue()
            .peek()
            .map(|Reverse(next)| next.due.saturating_sub(now))
    }

    /// Removes and returns every job whose time has come, earliest first.
    pub fn take_due(&self) -> Vec<ExpiryJob> {
        let now = self.clock.elapsed();
        let mut queue = self.queue();
        let mut due = vec![];

        while matches!(queue.peek(), Some(Reverse(next)) if next.due <= now) {
            if let Some(Reverse(scheduled)) = queue.pop() {
                due.push(scheduled.job);
            }
        }

        due
    }

    /// Fires every due job one after another. Handler failures are logged
    /// and do not stop the remaining jobs from firing.
    pub async fn run_due(&self, handler: &dyn ExpiryHandler) -> usize {
        let jobs = self.take_due();
        let fired = jobs.len();

        for job in jobs {
            let (name, ride_id) = (job.name(), job.ride_id());

            if let Err(err) = handler.fire(job).await {
                tracing::warn!(job = name, %ride_id, error = %err, "expiry job failed");
            }
        }

        fired
    }

    /// Starts every due job on its own task so a slow job cannot hold up
    /// the timers of other rides.
    fn spawn_due(&self, handler: &Arc<dyn ExpiryHandler>) -> usize {
        let jobs = self.take_due();
        let fired = jobs.len();

        for job in jobs {
            let handler = handler.clone();

            tokio::spawn(async move {
                let (name, ride_id) = (job.name(), job.ride_id());

                if let Err(err) = handler.fire(job).await {
                    tracing::warn!(job = name, %ride_id, error = %err, "expiry job failed");
                }
            });
        }

        fired
    }

    /// Drives the queue until `shutdown` receives a message or its sender is
    /// dropped.
    pub async fn run(
        &self,
        handler: Arc<dyn ExpiryHandler>,
        tick: Duration,
        shutdown: async_channel::Receiver<()>,
    ) {
        tracing::info!(?tick, "expiry scheduler started");

        loop {
            self.spawn_due(&handler);

            let wait = self.next_due_in().map_or(tick, |due| due.min(tick));

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake_rx.recv() => {}
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!("expiry scheduler stopped");
    }
}

#[cfg(test)]
#[derive(Default)]
struct RecordingHandler {
    fired: Mutex<Vec<ExpiryJob>>,
    fail: bool,
    slow_matching: Option<Duration>,
}

#[cfg(test)]
#[async_trait]
impl ExpiryHandler for RecordingHandler {
    async fn fire(&self, job: ExpiryJob) -> Result<(), Error> {
        let matching = matches!(job, ExpiryJob::MatchingPass { .. });
        self.fired.lock().unwrap().push(job);

        if let (true, Some(stall)) = (matching, self.slow_matching) {
            tokio::time::sleep(stall).await;
        }

        if self.fail {
            return Err(Error::upstream("handler failure"));
        }

        Ok(())
    }
}

#[test]
fn jobs_fire_in_due_order() {
    use crate::clock::ManualClock;
    use chrono::Utc;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let scheduler = ExpiryScheduler::new(clock.clone());

    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    scheduler.schedule_in(Duration::from_secs(300), ExpiryJob::SearchTimeout { ride_id: a });
    scheduler.schedule_in(Duration::from_secs(120), ExpiryJob::MatchingPass { ride_id: b });
    scheduler.schedule_in(Duration::from_secs(120), ExpiryJob::SearchTimeout { ride_id: c });

    assert!(scheduler.take_due().is_empty());
    assert_eq!(scheduler.next_due_in(), Some(Duration::from_secs(120)));

    clock.advance(Duration::from_secs(120));
    assert_eq!(
        scheduler.take_due(),
        vec![
            ExpiryJob::MatchingPass { ride_id: b },
            ExpiryJob::SearchTimeout { ride_id: c },
        ]
    );

    clock.advance(Duration::from_secs(179));
    assert!(scheduler.take_due().is_empty());

    clock.advance(Duration::from_secs(1));
    assert_eq!(scheduler.take_due(), vec![ExpiryJob::SearchTimeout { ride_id: a }]);
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn failing_jobs_do_not_block_the_queue() {
    use crate::clock::ManualClock;
    use chrono::Utc;
    use tokio_test::block_on;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let scheduler = ExpiryScheduler::new(clock.clone());
    let handler = RecordingHandler {
        fail: true,
        ..Default::default()
    };

    scheduler.schedule_in(Duration::ZERO, ExpiryJob::SearchTimeout { ride_id: Uuid::new_v4() });
    scheduler.schedule_in(Duration::ZERO, ExpiryJob::SearchTimeout { ride_id: Uuid::new_v4() });

    assert_eq!(block_on(scheduler.run_due(&handler)), 2);
    assert_eq!(handler.fired.lock().unwrap().len(), 2);
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test]
async fn run_loop_fires_jobs_and_stops_on_shutdown() {
    use crate::clock::SystemClock;

    let scheduler = Arc::new(ExpiryScheduler::new(Arc::new(SystemClock::new())));
    let handler = Arc::new(RecordingHandler::default());
    let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);

    let runner = {
        let scheduler = scheduler.clone();
        let handler = handler.clone() as Arc<dyn ExpiryHandler>;
        tokio::spawn(async move {
            scheduler
                .run(handler, Duration::from_millis(10), shutdown_rx)
                .await
        })
    };

    let ride_id = Uuid::new_v4();
    scheduler.schedule_in(Duration::from_millis(20), ExpiryJob::SearchTimeout { ride_id });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(()).await.unwrap();
    runner.await.unwrap();

    assert_eq!(
        *handler.fired.lock().unwrap(),
        vec![ExpiryJob::SearchTimeout { ride_id }]
    );
}

#[tokio::test]
async fn slow_jobs_do_not_delay_other_rides() {
    use crate::clock::SystemClock;

    let scheduler = Arc::new(ExpiryScheduler::new(Arc::new(SystemClock::new())));
    let handler = Arc::new(RecordingHandler {
        slow_matching: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);

    let (stuck, waiting) = (Uuid::new_v4(), Uuid::new_v4());
    scheduler.schedule_in(Duration::ZERO, ExpiryJob::MatchingPass { ride_id: stuck });
    scheduler.schedule_in(
        Duration::from_millis(20),
        ExpiryJob::SearchTimeout { ride_id: waiting },
    );

    let runner = {
        let scheduler = scheduler.clone();
        let handler = handler.clone() as Arc<dyn ExpiryHandler>;
        tokio::spawn(async move {
            scheduler
                .run(handler, Duration::from_millis(10), shutdown_rx)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(()).await.unwrap();
    runner.await.unwrap();

    assert_eq!(
        *handler.fired.lock().unwrap(),
        vec![
            ExpiryJob::MatchingPass { ride_id: stuck },
            ExpiryJob::SearchTimeout { ride_id: waiting },
        ]
    );
}
