//! Delivery Worker
//!
//! Transitions stage their [`TransitionEvent`] in the store's outbox inside
//! the same transaction. The worker sweeps the outbox, fans each event out
//! to the audit sink and the notifier, retries each leg independently with
//! capped exponential backoff and marks the leg delivered once it succeeds
//! (at-least-once). A restarted worker picks up whatever is still unmarked.
//!
//! Events whose outbox write failed travel over the in-process channel
//! instead and are delivered only while this process lives.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::audit::{AuditSink, Notifier, TransitionEvent};
use super::store::{DeliveryLeg, EventOutbox};

/// Outbox entries pulled per sweep
const OUTBOX_BATCH: usize = 200;

/// Floor for the outbox poll interval
const MIN_OUTBOX_POLL: Duration = Duration::from_millis(10);

/// Retry schedule for failed deliveries
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Delay before the first retry
    pub retry_initial: Duration,
    /// Upper bound on the delay between retries
    pub retry_max: Duration,
    /// How often the outbox is swept without a wake-up
    pub outbox_poll: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(60),
            outbox_poll: Duration::from_secs(5),
        }
    }
}

impl DeliveryConfig {
    /// Delay after `attempts` failed attempts
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.retry_initial
            .saturating_mul(1u32 << exp)
            .min(self.retry_max)
    }
}

/// What the coordinator hands the worker after a commit
#[derive(Debug)]
pub enum Published {
    /// The event is in the outbox; sweep it now
    Staged,
    /// The outbox write failed; deliver this copy directly
    Unstaged(TransitionEvent),
}

/// Publishing half, held by the coordinator
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<Published>,
}

impl EventDispatcher {
    /// Create a dispatcher and the receiving end for a [`DeliveryWorker`]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Published>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Nudge the worker after an event was committed to the outbox
    pub fn wake(&self) {
        if self.tx.send(Published::Staged).is_err() {
            warn!("Delivery worker is gone - event stays in the outbox");
        }
    }

    /// Queue an event that never reached the outbox; never fails the caller
    pub fn publish(&self, event: TransitionEvent) {
        let request_id = event.request_id;
        if self.tx.send(Published::Unstaged(event)).is_err() {
            error!(
                request_id = %request_id,
                "Delivery worker is gone - transition event dropped"
            );
        }
    }
}

struct PendingDelivery {
    leg: DeliveryLeg,
    event: Arc<TransitionEvent>,
    /// Came from the outbox and gets marked there once delivered
    staged: bool,
    attempts: u32,
    due: Instant,
}

/// Outcome of one delivery round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub failed: usize,
    /// Still queued for retry after this round
    pub pending: usize,
}

pub struct DeliveryWorker {
    rx: mpsc::UnboundedReceiver<Published>,
    outbox: Arc<dyn EventOutbox>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    config: DeliveryConfig,
    queue: VecDeque<PendingDelivery>,
    /// Outbox legs already queued, so sweeps don't queue them twice
    queued: HashSet<(ulid::Ulid, DeliveryLeg)>,
    closed: bool,
}

impl DeliveryWorker {
    pub fn new(
        rx: mpsc::UnboundedReceiver<Published>,
        outbox: Arc<dyn EventOutbox>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            rx,
            outbox,
            audit,
            notifier,
            config,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            closed: false,
        }
    }

    /// Deliveries waiting for a retry
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Run until every dispatcher is dropped and the queue is drained
    pub async fn run(mut self) {
        let poll = self.config.outbox_poll.max(MIN_OUTBOX_POLL);
        info!(
            retry_initial_ms = self.config.retry_initial.as_millis() as u64,
            retry_max_ms = self.config.retry_max.as_millis() as u64,
            outbox_poll_ms = poll.as_millis() as u64,
            "Starting delivery worker"
        );

        // First tick fires immediately and sweeps what a previous run left
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.closed && self.queue.is_empty() {
                break;
            }
            let next_due = self.queue.iter().map(|d| d.due).min();

            tokio::select! {
                received = self.rx.recv(), if !self.closed => match received {
                    Some(published) => self.accept(published),
                    None => self.closed = true,
                },
                _ = ticker.tick(), if !self.closed => {}
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {}
                else => break,
            }

            self.process_available().await;
        }

        info!("Delivery worker stopped");
    }

    /// Pull everything already published, sweep the outbox and attempt
    /// every due delivery once
    pub async fn process_available(&mut self) -> DeliveryStats {
        loop {
            match self.rx.try_recv() {
                Ok(published) => self.accept(published),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }

        self.sweep_outbox().await;

        let now = Instant::now();
        let mut stats = DeliveryStats::default();
        let mut retry = VecDeque::with_capacity(self.queue.len());

        while let Some(mut delivery) = self.queue.pop_front() {
            if delivery.due > now {
                retry.push_back(delivery);
                continue;
            }

            let result = match delivery.leg {
                DeliveryLeg::Audit => self.audit.record(&delivery.event).await,
                DeliveryLeg::Notify => self.notifier.notify(&delivery.event).await,
            };

            match result {
                Ok(()) => {
                    debug!(
                        request_id = %delivery.event.request_id,
                        leg = delivery.leg.as_str(),
                        "Delivered"
                    );
                    stats.delivered += 1;
                    if delivery.staged {
                        self.mark_delivered(&delivery).await;
                    }
                }
                Err(e) => {
                    delivery.attempts += 1;
                    let delay = self.config.backoff(delivery.attempts);
                    warn!(
                        request_id = %delivery.event.request_id,
                        leg = delivery.leg.as_str(),
                        attempts = delivery.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, will retry"
                    );
                    delivery.due = now + delay;
                    stats.failed += 1;
                    retry.push_back(delivery);
                }
            }
        }

        self.queue = retry;
        stats.pending = self.queue.len();
        stats
    }

    fn accept(&mut self, published: Published) {
        match published {
            // The sweep in this round picks it up
            Published::Staged => {}
            Published::Unstaged(event) => {
                let event = Arc::new(event);
                for leg in DeliveryLeg::ALL {
                    self.push(leg, Arc::clone(&event), false);
                }
            }
        }
    }

    async fn sweep_outbox(&mut self) {
        let entries = match self.outbox.undelivered(OUTBOX_BATCH).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Outbox sweep failed");
                return;
            }
        };

        for entry in entries {
            let event_id = entry.event.event_id;
            let legs: Vec<DeliveryLeg> = DeliveryLeg::ALL
                .into_iter()
                .filter(|&leg| !entry.is_delivered(leg))
                .collect();
            let event = Arc::new(entry.event);
            for leg in legs {
                if self.queued.insert((event_id, leg)) {
                    self.push(leg, Arc::clone(&event), true);
                }
            }
        }
    }

    fn push(&mut self, leg: DeliveryLeg, event: Arc<TransitionEvent>, staged: bool) {
        self.queue.push_back(PendingDelivery {
            leg,
            event,
            staged,
            attempts: 0,
            due: Instant::now(),
        });
    }

    async fn mark_delivered(&mut self, delivery: &PendingDelivery) {
        let event_id = delivery.event.event_id;
        self.queued.remove(&(event_id, delivery.leg));
        if let Err(e) = self.outbox.mark_delivered(event_id, delivery.leg).await {
            // Left unmarked, the next sweep sends it again
            warn!(
                request_id = %delivery.event.request_id,
                leg = delivery.leg.as_str(),
                error = %e,
                "Could not mark outbox entry delivered, will be sent again"
            );
        }
    }
}
