//! Background work
//!
//! API handlers enqueue a `Job` and return. The `Worker` drains the queue
//! with bounded concurrency; the `Sweeper` re-enqueues whatever the store
//! says is still open, so a dropped job or a restart loses nothing. A job
//! already running is not started a second time; claims in the state
//! machines cover duplicates across instances.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::{BridgeService, MintOutcome};
use crate::db::Store;
use crate::error::Result;
use crate::redemption::RedemptionService;
use crate::types::{BridgeStatus, RedemptionStatus};

/// Bridges that failed this many automatic attempts wait for an operator
const MAX_AUTO_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    ReserveBridge(Uuid),
    /// Scan the ledger for a payment the client never reported
    DetectPayment(Uuid),
    MintBridge(Uuid),
    ProcessRedemption(Uuid),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::ReserveBridge(_) => "reserve_bridge",
            Job::DetectPayment(_) => "detect_payment",
            Job::MintBridge(_) => "mint_bridge",
            Job::ProcessRedemption(_) => "process_redemption",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Job::ReserveBridge(id)
            | Job::DetectPayment(id)
            | Job::MintBridge(id)
            | Job::ProcessRedemption(id) => *id,
        }
    }
}

/// Sending half of the job queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

pub fn job_queue(capacity: usize) -> (JobQueue, mpsc::Receiver<Job>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (JobQueue { tx }, rx)
}

impl JobQueue {
    /// Enqueue without waiting. A full or closed queue drops the job; the
    /// sweeper picks the record up again from the store.
    pub fn enqueue(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(job = job.name(), id = %job.id(), "Job queue full, leaving it to the sweeper");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                debug!(job = job.name(), id = %job.id(), "Job queue closed");
                false
            }
        }
    }
}

/// Pause dispatching after a run of failed jobs.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before pausing
    pub threshold: u32,
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            pause_duration: Duration::from_secs(60),
        }
    }
}

/// Holds a job in the running set until dropped.
struct InFlight {
    running: Arc<Mutex<HashSet<Job>>>,
    job: Job,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.job);
    }
}

#[derive(Clone)]
pub struct Worker {
    bridges: Arc<BridgeService>,
    redemptions: Arc<RedemptionService>,
    queue: JobQueue,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashSet<Job>>>,
    consecutive_failures: Arc<AtomicU32>,
    circuit_breaker: CircuitBreakerConfig,
}

impl Worker {
    pub fn new(
        bridges: Arc<BridgeService>,
        redemptions: Arc<RedemptionService>,
        queue: JobQueue,
        concurrency: usize,
    ) -> Self {
        Self {
            bridges,
            redemptions,
            queue,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            running: Arc::new(Mutex::new(HashSet::new())),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Mark `job` as running, or `None` if the same job already is.
    fn begin(&self, job: Job) -> Option<InFlight> {
        let inserted = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job);
        inserted.then(|| InFlight {
            running: self.running.clone(),
            job,
        })
    }

    /// Run one job to the end of what it can do now.
    pub async fn execute(&self, job: Job) -> Result<()> {
        match job {
            Job::ReserveBridge(id) => self.bridges.reserve(id).await,
            Job::DetectPayment(id) => {
                if self.bridges.detect_payment(id).await?.is_some() {
                    self.queue.enqueue(Job::MintBridge(id));
                }
                Ok(())
            }
            Job::MintBridge(id) => match self.bridges.mint(id).await? {
                MintOutcome::Completed { position_id, .. } => {
                    debug!(bridge_id = %id, position_id = %position_id, "Mint job completed");
                    Ok(())
                }
                MintOutcome::AwaitingProof { voting_round } => {
                    debug!(bridge_id = %id, voting_round, "Mint job waiting for attestation round");
                    Ok(())
                }
                MintOutcome::Skipped { status } => {
                    debug!(bridge_id = %id, status = %status, "Mint job skipped");
                    Ok(())
                }
            },
            Job::ProcessRedemption(id) => {
                let status = self.redemptions.process(id).await?;
                debug!(redemption_id = %id, status = %status, "Redemption job finished");
                Ok(())
            }
        }
    }

    /// Drain `jobs` until shutdown. Errors are already persisted on the
    /// records, so they are only logged here.
    pub async fn run(self, mut jobs: mpsc::Receiver<Job>, mut shutdown: mpsc::Receiver<()>) {
        info!(
            concurrency = self.permits.available_permits(),
            "Worker started"
        );

        loop {
            let failures = self.consecutive_failures.load(Ordering::SeqCst);
            if failures >= self.circuit_breaker.threshold {
                error!(
                    failures,
                    pause_secs = self.circuit_breaker.pause_duration.as_secs(),
                    "Circuit breaker tripped, pausing job dispatch"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.circuit_breaker.pause_duration) => {}
                    _ = shutdown.recv() => break,
                }
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }

            let job = tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };

            let Some(in_flight) = self.begin(job) else {
                debug!(job = job.name(), id = %job.id(), "Job already running, dropping duplicate");
                continue;
            };

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            let worker = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let _in_flight = in_flight;
                match worker.execute(job).await {
                    Ok(()) => {
                        worker.consecutive_failures.store(0, Ordering::SeqCst);
                    }
                    Err(e) => {
                        // Validation and state conflicts are about the
                        // record, not the collaborators
                        if e.is_retryable() {
                            worker.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                        }
                        warn!(job = job.name(), id = %job.id(), error = %e, "Job failed");
                    }
                }
            });
        }

        info!("Worker stopped");
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub enqueued: usize,
    pub expired: u64,
    pub purged_nonces: u64,
}

/// Periodically turns open records back into jobs.
pub struct Sweeper {
    store: Arc<dyn Store>,
    bridges: Arc<BridgeService>,
    queue: JobQueue,
    interval: Duration,
    batch_size: i64,
}

impl Sweeper {
    pub fn new(store: Arc<dyn Store>, bridges: Arc<BridgeService>, queue: JobQueue, interval: Duration) -> Self {
        Self {
            store,
            bridges,
            queue,
            interval,
            batch_size: 200,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport {
            expired: self.bridges.cleanup_expired(now).await?,
            purged_nonces: self.store.purge_cancel_nonces(now).await?,
            ..Default::default()
        };

        let open_bridges = self
            .store
            .list_bridges(
                &[
                    BridgeStatus::Pending,
                    BridgeStatus::AwaitingPayment,
                    BridgeStatus::XrplConfirmed,
                ],
                None,
                self.batch_size,
            )
            .await?;
        for bridge in open_bridges {
            if bridge.retry_count >= MAX_AUTO_RETRIES {
                continue;
            }
            let job = match bridge.status {
                BridgeStatus::Pending => Job::ReserveBridge(bridge.id),
                BridgeStatus::AwaitingPayment => Job::DetectPayment(bridge.id),
                _ => Job::MintBridge(bridge.id),
            };
            if self.queue.enqueue(job) {
                report.enqueued += 1;
            }
        }

        let open_redemptions = self
            .store
            .list_redemptions(
                &[
                    RedemptionStatus::Pending,
                    RedemptionStatus::RedeemedFxrp,
                    RedemptionStatus::AwaitingProof,
                    RedemptionStatus::XrplPayout,
                    RedemptionStatus::XrplReceived,
                ],
                None,
                self.batch_size,
            )
            .await?;
        for r in open_redemptions {
            if r.backend_status.map_or(false, |s| s.needs_attention()) || r.retry_count >= MAX_AUTO_RETRIES {
                continue;
            }
            if self.queue.enqueue(Job::ProcessRedemption(r.id)) {
                report.enqueued += 1;
            }
        }

        Ok(report)
    }

    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.enqueued > 0 || report.expired > 0 => {
                            info!(
                                enqueued = report.enqueued,
                                expired = report.expired,
                                purged_nonces = report.purged_nonces,
                                "Sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping sweeper");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::CreateBridgeRequest;
    use crate::testing::{Harness, USER_ADDRESS};

    const TX: &str = "5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A";

    async fn created(h: &Harness) -> Uuid {
        h.bridges
            .create(&CreateBridgeRequest {
                wallet_address: USER_ADDRESS.into(),
                vault_id: "fxrp-core".into(),
                amount: "20".into(),
                position_id: None,
            })
            .await
            .unwrap()
            .bridge_id
    }

    #[tokio::test]
    async fn test_sweep_enqueues_open_records() {
        let h = Harness::new();
        let (queue, mut rx) = job_queue(16);
        let sweeper = Sweeper::new(h.store.clone(), h.bridges.clone(), queue, Duration::from_secs(1));

        let pending = created(&h).await;
        let confirmed = h.confirmed_bridge("20", TX).await;
        let (redemption, _) = h.pending_redemption(20).await;

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.enqueued, 3);

        let mut jobs = Vec::new();
        while let Ok(job) = rx.try_recv() {
            jobs.push(job);
        }
        assert!(jobs.contains(&Job::ReserveBridge(pending)));
        assert!(jobs.contains(&Job::MintBridge(confirmed)));
        assert!(jobs.contains(&Job::ProcessRedemption(redemption)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_job() {
        let (queue, _rx) = job_queue(1);
        assert!(queue.enqueue(Job::ReserveBridge(Uuid::new_v4())));
        assert!(!queue.enqueue(Job::ReserveBridge(Uuid::new_v4())));
    }

    #[tokio::test]
    async fn test_detect_payment_job_chains_mint() {
        let h = Harness::new();
        let (queue, mut rx) = job_queue(4);
        let worker = Worker::new(h.bridges.clone(), h.redemptions.clone(), queue, 2);
        let id = h.reserved_bridge("20").await;
        h.pay(id, TX).await;

        worker.execute(Job::DetectPayment(id)).await.unwrap();
        assert_eq!(h.bridges.get(id).await.unwrap().status, BridgeStatus::XrplConfirmed);
        assert_eq!(rx.try_recv().unwrap(), Job::MintBridge(id));

        worker.execute(Job::MintBridge(id)).await.unwrap();
        assert_eq!(h.bridges.get(id).await.unwrap().status, BridgeStatus::Completed);
    }

    #[tokio::test]
    async fn test_worker_loop_reserves_and_stops() {
        let h = Harness::new();
        let (queue, rx) = job_queue(4);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = Worker::new(h.bridges.clone(), h.redemptions.clone(), queue.clone(), 2);
        let handle = tokio::spawn(worker.run(rx, shutdown_rx));

        let id = created(&h).await;
        assert!(queue.enqueue(Job::ReserveBridge(id)));

        let mut status = BridgeStatus::Pending;
        for _ in 0..100 {
            status = h.bridges.get(id).await.unwrap().status;
            if status == BridgeStatus::AwaitingPayment {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, BridgeStatus::AwaitingPayment);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_running_job_is_not_started_twice() {
        let h = Harness::new();
        h.oracle.set_fetch_delay(Duration::from_millis(100));
        let id = h.confirmed_bridge("20", TX).await;
        h.oracle.clear_proofs();

        let (queue, rx) = job_queue(16);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = Worker::new(h.bridges.clone(), h.redemptions.clone(), queue.clone(), 4);
        let handle = tokio::spawn(worker.run(rx, shutdown_rx));
        let sweeper = Sweeper::new(h.store.clone(), h.bridges.clone(), queue, Duration::from_secs(15));

        // Two sweeps while the attestation round is still open
        assert_eq!(sweeper.sweep_once().await.unwrap().enqueued, 1);
        assert_eq!(sweeper.sweep_once().await.unwrap().enqueued, 1);
        tokio::time::sleep(Duration::from_millis(600)).await;

        // One request and one polling loop of two fetches
        assert_eq!(h.oracle.requests.load(Ordering::SeqCst), 1);
        assert_eq!(h.oracle.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(h.bridges.get(id).await.unwrap().status, BridgeStatus::XrplConfirmed);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_released_on_drop() {
        let h = Harness::new();
        let (queue, _rx) = job_queue(1);
        let worker = Worker::new(h.bridges.clone(), h.redemptions.clone(), queue, 1);
        let job = Job::MintBridge(Uuid::new_v4());

        let guard = worker.begin(job);
        assert!(guard.is_some());
        assert!(worker.begin(job).is_none());
        assert!(worker.begin(Job::ReserveBridge(job.id())).is_some());
        drop(guard);
        assert!(worker.begin(job).is_some());
    }
}
