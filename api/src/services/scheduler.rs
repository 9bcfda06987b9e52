//! Fan-out of enrichment tasks across a page of events.
//!
//! Every strategy implements [`Executor`]: jobs are submitted one by one and
//! collected with a single deadline-bounded `await_all`. Results always come
//! back in submission order, whatever order the jobs finished in.
//!
//! - `Sequential` runs jobs one after another on the calling task.
//! - `Pool` spawns a fixed number of workers that pull from a shared queue.
//! - `Cooperative` multiplexes every job on the calling task without spawning.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{timeout_at, Instant};

use crate::services::client::ServiceClient;
use crate::services::enrichment::{
    enrich, EnrichmentError, EnrichmentOutcome, EventRecord, UserLocation,
};

/// Default number of workers for the `pool` strategy.
pub const DEFAULT_POOL_WORKERS: usize = 5;

/// One unit of work handed to an executor.
pub type EnrichmentJob = BoxFuture<'static, EnrichmentOutcome>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("worker pool needs at least one worker")]
    NoWorkers,

    #[error("enrichment worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Concurrency strategy for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Sequential,
    Pool { workers: usize },
    Cooperative,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Sequential => "sequential",
            Strategy::Pool { .. } => "pool",
            Strategy::Cooperative => "cooperative",
        }
    }

    /// Pool strategies inherit the given size unless one was set explicitly.
    pub fn with_default_workers(self, workers: usize) -> Self {
        match self {
            Strategy::Pool { workers: 0 } => Strategy::Pool { workers },
            other => other,
        }
    }

    fn executor(&self) -> Result<Box<dyn Executor>, SchedulerError> {
        Ok(match *self {
            Strategy::Sequential => Box::new(SequentialExecutor::default()),
            Strategy::Pool { workers } => Box::new(PoolExecutor::start(workers)?),
            Strategy::Cooperative => Box::new(CooperativeExecutor::default()),
        })
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Pool { workers } => write!(f, "pool({})", workers),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown strategy '{0}' (expected sequential, pool, pool:N or cooperative)")]
pub struct ParseStrategyError(String);

impl FromStr for Strategy {
    type Err = ParseStrategyError;

    /// Accepts `sequential`, `cooperative`, `pool` and `pool:N`.
    /// A bare `pool` parses as zero workers, meaning "use the configured size".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "sequential" => Ok(Strategy::Sequential),
            "cooperative" => Ok(Strategy::Cooperative),
            "pool" => Ok(Strategy::Pool { workers: 0 }),
            other => other
                .strip_prefix("pool:")
                .and_then(|n| n.parse().ok())
                .filter(|&workers: &usize| workers > 0)
                .map(|workers| Strategy::Pool { workers })
                .ok_or_else(|| ParseStrategyError(s.to_string())),
        }
    }
}

/// Slot index of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(usize);

/// A pluggable way of running enrichment jobs.
#[async_trait]
pub trait Executor: Send {
    /// Queue a job. Depending on the strategy it may start immediately.
    fn submit(&mut self, job: EnrichmentJob) -> TaskHandle;

    /// Wait for the given jobs, returning one outcome per handle in handle order.
    /// Jobs still unfinished at `deadline` are cancelled and reported as
    /// `DeadlineExceeded`.
    async fn await_all(
        &mut self,
        handles: &[TaskHandle],
        deadline: Instant,
    ) -> Result<Vec<EnrichmentOutcome>, SchedulerError>;
}

/// Pull outcomes for `handles` out of their slots; empty slots missed the deadline.
fn collect_slots(
    slots: &mut [Option<EnrichmentOutcome>],
    handles: &[TaskHandle],
) -> Vec<EnrichmentOutcome> {
    handles
        .iter()
        .map(|h| {
            slots
                .get_mut(h.0)
                .and_then(Option::take)
                .unwrap_or_else(|| Err(EnrichmentError::deadline_exceeded()))
        })
        .collect()
}

#[derive(Default)]
struct SequentialExecutor {
    jobs: Vec<Option<EnrichmentJob>>,
}

#[async_trait]
impl Executor for SequentialExecutor {
    fn submit(&mut self, job: EnrichmentJob) -> TaskHandle {
        self.jobs.push(Some(job));
        TaskHandle(self.jobs.len() - 1)
    }

    async fn await_all(
        &mut self,
        handles: &[TaskHandle],
        deadline: Instant,
    ) -> Result<Vec<EnrichmentOutcome>, SchedulerError> {
        let mut slots: Vec<Option<EnrichmentOutcome>> = self.jobs.iter().map(|_| None).collect();

        for handle in handles {
            let Some(job) = self.jobs.get_mut(handle.0).and_then(Option::take) else {
                continue;
            };
            if Instant::now() >= deadline {
                // Dropping the job means its calls are never issued.
                continue;
            }
            if let Ok(outcome) = timeout_at(deadline, job).await {
                slots[handle.0] = Some(outcome);
            }
        }

        Ok(collect_slots(&mut slots, handles))
    }
}

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<(usize, EnrichmentJob)>>>;

enum PoolEvent {
    Received(Option<(usize, EnrichmentOutcome)>),
    WorkerExited(Result<(), JoinError>),
}

struct PoolExecutor {
    queue: Option<mpsc::UnboundedSender<(usize, EnrichmentJob)>>,
    results: mpsc::UnboundedReceiver<(usize, EnrichmentOutcome)>,
    workers: JoinSet<()>,
    submitted: usize,
}

impl PoolExecutor {
    fn start(size: usize) -> Result<Self, SchedulerError> {
        if size == 0 {
            return Err(SchedulerError::NoWorkers);
        }

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let queue: JobQueue = Arc::new(Mutex::new(job_rx));

        let mut workers = JoinSet::new();
        for _ in 0..size {
            workers.spawn(run_worker(queue.clone(), result_tx.clone()));
        }

        Ok(Self {
            queue: Some(job_tx),
            results: result_rx,
            workers,
            submitted: 0,
        })
    }
}

async fn run_worker(queue: JobQueue, results: mpsc::UnboundedSender<(usize, EnrichmentOutcome)>) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some((index, job)) = next else {
            break;
        };
        let outcome = job.await;
        if results.send((index, outcome)).is_err() {
            break;
        }
    }
}

#[async_trait]
impl Executor for PoolExecutor {
    fn submit(&mut self, job: EnrichmentJob) -> TaskHandle {
        let index = self.submitted;
        self.submitted += 1;
        if let Some(queue) = &self.queue {
            // Receiver lives as long as any worker; a closed queue just leaves
            // the slot empty, which surfaces as a deadline miss.
            let _ = queue.send((index, job));
        }
        TaskHandle(index)
    }

    async fn await_all(
        &mut self,
        handles: &[TaskHandle],
        deadline: Instant,
    ) -> Result<Vec<EnrichmentOutcome>, SchedulerError> {
        // Close the queue so workers exit once it drains.
        self.queue.take();

        let mut slots: Vec<Option<EnrichmentOutcome>> = (0..self.submitted).map(|_| None).collect();
        let mut pending = self.submitted;
        let results = &mut self.results;
        let workers = &mut self.workers;

        while pending > 0 {
            let next = timeout_at(deadline, async {
                tokio::select! {
                    received = results.recv() => PoolEvent::Received(received),
                    Some(joined) = workers.join_next() => PoolEvent::WorkerExited(joined),
                }
            })
            .await;

            match next {
                Ok(PoolEvent::Received(Some((index, outcome)))) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(outcome);
                    }
                    pending -= 1;
                }
                Ok(PoolEvent::WorkerExited(Err(e))) if e.is_panic() => {
                    workers.abort_all();
                    return Err(SchedulerError::WorkerPanicked(e.to_string()));
                }
                Ok(PoolEvent::WorkerExited(_)) => {}
                // Every worker has exited, or the deadline fired.
                Ok(PoolEvent::Received(None)) | Err(_) => break,
            }
        }

        workers.abort_all();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    return Err(SchedulerError::WorkerPanicked(e.to_string()));
                }
            }
        }

        Ok(collect_slots(&mut slots, handles))
    }
}

#[derive(Default)]
struct CooperativeExecutor {
    tasks: FuturesUnordered<BoxFuture<'static, (usize, EnrichmentOutcome)>>,
    submitted: usize,
}

#[async_trait]
impl Executor for CooperativeExecutor {
    fn submit(&mut self, job: EnrichmentJob) -> TaskHandle {
        let index = self.submitted;
        self.submitted += 1;
        self.tasks.push(job.map(move |outcome| (index, outcome)).boxed());
        TaskHandle(index)
    }

    async fn await_all(
        &mut self,
        handles: &[TaskHandle],
        deadline: Instant,
    ) -> Result<Vec<EnrichmentOutcome>, SchedulerError> {
        let mut slots: Vec<Option<EnrichmentOutcome>> = (0..self.submitted).map(|_| None).collect();

        loop {
            match timeout_at(deadline, self.tasks.next()).await {
                Ok(Some((index, outcome))) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    // Drop whatever is still in flight.
                    self.tasks = FuturesUnordered::new();
                    break;
                }
            }
        }

        Ok(collect_slots(&mut slots, handles))
    }
}

/// Retries for transient failures, shared by every task in one batch.
#[derive(Debug, Clone)]
struct RetryBudget(Arc<AtomicU32>);

impl RetryBudget {
    fn new(retries: u32) -> Self {
        Self(Arc::new(AtomicU32::new(retries)))
    }

    fn try_acquire(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// Enriched page: one outcome per input event, in input order.
#[derive(Debug, Clone)]
pub struct FanOutResult {
    pub items: Vec<EnrichmentOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl FanOutResult {
    fn from_items(items: Vec<EnrichmentOutcome>, elapsed: Duration) -> Self {
        let succeeded = items.iter().filter(|item| item.is_ok()).count();
        let failed = items.len() - succeeded;
        Self {
            items,
            succeeded,
            failed,
            elapsed,
        }
    }
}

/// Runs enrichment for a page of events under a chosen strategy.
#[derive(Debug, Clone)]
pub struct FanOutScheduler {
    client: ServiceClient,
    retry_budget: u32,
}

impl FanOutScheduler {
    pub fn new(client: ServiceClient, retry_budget: u32) -> Self {
        Self {
            client,
            retry_budget,
        }
    }

    /// Enrich every event, returning within `deadline`.
    ///
    /// Per-event failures are recorded in their slot; only a scheduler fault
    /// fails the batch.
    pub async fn run(
        &self,
        events: &[EventRecord],
        user: UserLocation,
        strategy: Strategy,
        deadline: Duration,
    ) -> Result<FanOutResult, SchedulerError> {
        let started = Instant::now();
        if events.is_empty() {
            return Ok(FanOutResult::from_items(Vec::new(), started.elapsed()));
        }

        let budget = RetryBudget::new(self.retry_budget);
        let mut executor = strategy.executor()?;
        let handles: Vec<TaskHandle> = events
            .iter()
            .map(|event| executor.submit(self.job(event.clone(), user, budget.clone())))
            .collect();

        let items = executor.await_all(&handles, started + deadline).await?;
        let result = FanOutResult::from_items(items, started.elapsed());

        for (event, item) in events.iter().zip(&result.items) {
            if let Err(e) = item {
                tracing::warn!(
                    "Enrichment failed for event {} ({}): {}",
                    event.id,
                    event.name,
                    e
                );
            }
        }
        tracing::info!(
            strategy = %strategy,
            succeeded = result.succeeded,
            failed = result.failed,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Enriched {} events",
            events.len()
        );

        Ok(result)
    }

    fn job(&self, event: EventRecord, user: UserLocation, budget: RetryBudget) -> EnrichmentJob {
        let client = self.client.clone();
        async move {
            loop {
                match enrich(&client, &event, user).await {
                    Err(e) if e.is_transport() && budget.try_acquire() => {
                        tracing::debug!("Retrying enrichment for event {}: {}", event.id, e);
                    }
                    outcome => return outcome,
                }
            }
        }
        .boxed()
    }
}
