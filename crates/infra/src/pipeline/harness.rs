//! Consumer worker harness: the shared fetch / handle / ack-or-nak loop.
//!
//! Every pipeline stage is a [`MessageHandler`] bound to one durable cursor.
//! The harness owns the disposition of each delivery:
//!
//! - `Ok(())` acks.
//! - [`HandlerError::Malformed`] terminates the message (no redelivery).
//! - [`HandlerError::Precondition`] and [`HandlerError::Collaborator`] nak with
//!   backoff. Once a redelivery cap is configured and reached, the raw message
//!   is parked on `deadletter.<subject>` and the original is terminated.
//!
//! Messages on one cursor are handled one at a time, in delivery order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use applyflow_ai::GenerationError;
use applyflow_core::DomainError;
use applyflow_events::subject::dead_letter_subject;
use applyflow_events::{event_type, DeadLetter, DecodeError, Delivery, EventEnvelope, EventLog};

use crate::retry::RetryPolicy;
use crate::store::StoreError;

/// How long one fetch waits before the loop rechecks for shutdown.
const FETCH_WAIT: Duration = Duration::from_secs(1);

/// Pause after a failed fetch so a broken connection does not spin.
const FETCH_ERROR_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The payload can never be processed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Something this message depends on is not there yet.
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// A collaborator (generator, database) failed.
    #[error("collaborator failure: {0}")]
    Collaborator(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Malformed(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            HandlerError::Malformed(_) => "malformed",
            HandlerError::Precondition(_) => "precondition",
            HandlerError::Collaborator(_) => "collaborator",
        }
    }
}

impl From<DecodeError> for HandlerError {
    fn from(err: DecodeError) -> Self {
        HandlerError::Malformed(err.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(_) | StoreError::PromptNotFound(_) | StoreError::Precondition(_) => {
                HandlerError::Precondition(err.to_string())
            }
            StoreError::Invalid(_) | StoreError::Storage(_) => HandlerError::Collaborator(err.to_string()),
        }
    }
}

impl From<GenerationError> for HandlerError {
    fn from(err: GenerationError) -> Self {
        HandlerError::Collaborator(err.to_string())
    }
}

impl From<DomainError> for HandlerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Precondition(msg) => HandlerError::Precondition(msg),
            DomainError::NotFound(what) => HandlerError::Precondition(format!("{} not found", what)),
            other => HandlerError::Malformed(other.to_string()),
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        (**self).handle(delivery).await
    }
}

/// The durable cursor a worker reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerBinding {
    pub stream: String,
    pub durable: String,
}

impl ConsumerBinding {
    pub fn new(stream: impl Into<String>, durable: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            durable: durable.into(),
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub acked: u64,
    pub naked: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the in-progress message, if
    /// any, to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(worker = %self.name, error = %e, "worker task failed");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Spawn a task that drains `binding` through `handler` until shutdown.
    ///
    /// `policy` drives the nak delay; its `max_attempts` is the redelivery
    /// cap (`None` retries forever).
    pub fn spawn<H>(
        name: impl Into<String>,
        log: Arc<dyn EventLog>,
        binding: ConsumerBinding,
        handler: H,
        policy: RetryPolicy,
    ) -> WorkerHandle
    where
        H: MessageHandler + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let worker = Worker {
            name: name.clone(),
            log,
            binding,
            handler,
            policy,
            stats: stats.clone(),
        };
        let join = tokio::spawn(worker.run(shutdown_rx));

        WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

struct Worker<H> {
    name: String,
    log: Arc<dyn EventLog>,
    binding: ConsumerBinding,
    handler: H,
    policy: RetryPolicy,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<H: MessageHandler> Worker<H> {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.name, durable = %self.binding.durable, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let fetched = tokio::select! {
                _ = shutdown.changed() => break,
                fetched = self.log.fetch(&self.binding.stream, &self.binding.durable, FETCH_WAIT) => fetched,
            };
            match fetched {
                Ok(Some(delivery)) => self.dispatch(delivery).await,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker = %self.name, durable = %self.binding.durable, error = %e, "fetch failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(FETCH_ERROR_PAUSE) => {}
                    }
                }
            }
        }
        info!(worker = %self.name, "worker stopped");
    }

    fn record(&self, update: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    async fn dispatch(&self, delivery: Delivery) {
        self.record(|s| s.processed += 1);

        let outcome = self.handler.handle(&delivery).await;
        let result = match outcome {
            Ok(()) => {
                debug!(worker = %self.name, subject = %delivery.subject, message_id = %delivery.message_id, "ack");
                self.record(|s| s.acked += 1);
                self.log.ack(&delivery).await
            }
            Err(HandlerError::Malformed(reason)) => {
                warn!(
                    worker = %self.name,
                    subject = %delivery.subject,
                    message_id = %delivery.message_id,
                    reason = %reason,
                    "dropping malformed message"
                );
                self.record(|s| s.dropped += 1);
                self.log.term(&delivery).await
            }
            Err(err) if !self.policy.should_retry(delivery.delivery_count) => self.dead_letter(&delivery, &err).await,
            Err(err) => {
                let delay = self.policy.redelivery_delay(delivery.delivery_count, &delivery.message_id);
                warn!(
                    worker = %self.name,
                    subject = %delivery.subject,
                    message_id = %delivery.message_id,
                    delivery_count = delivery.delivery_count,
                    kind = err.kind(),
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "nak for redelivery"
                );
                self.record(|s| s.naked += 1);
                self.log.nak(&delivery, delay).await
            }
        };

        if let Err(e) = result {
            // The log redelivers after ack-wait anyway.
            error!(worker = %self.name, message_id = %delivery.message_id, error = %e, "disposition failed");
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, err: &HandlerError) -> Result<(), applyflow_events::LogError> {
        let parked = DeadLetter::new(
            delivery.subject.clone(),
            delivery.durable.clone(),
            delivery.delivery_count,
            err.to_string(),
            &delivery.payload,
        );
        let subject = dead_letter_subject(&delivery.subject);
        let published = match EventEnvelope::new(event_type::DEAD_LETTER, parked).to_bytes() {
            Ok(bytes) => self.log.publish(&subject, &bytes).await.map(|_| ()),
            Err(e) => Err(applyflow_events::LogError::Command(e.to_string())),
        };

        if let Err(e) = published {
            error!(
                worker = %self.name,
                subject = %subject,
                error = %e,
                "dead-letter publish failed, keeping message for redelivery"
            );
            self.record(|s| s.naked += 1);
            return self.log.nak(delivery, self.policy.max_delay).await;
        }

        error!(
            worker = %self.name,
            subject = %delivery.subject,
            message_id = %delivery.message_id,
            deliveries = delivery.delivery_count,
            error = %err,
            "redelivery cap reached, message dead-lettered"
        );
        self.record(|s| s.dead_lettered += 1);
        self.log.term(delivery).await
    }
}
