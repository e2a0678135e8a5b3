//! In-memory durable log for tests and local runs.
//!
//! Same delivery contract as the Redis Streams log: per-durable cursors,
//! in-flight tracking with ack-wait redelivery, nak with delay, retention by
//! age and count. State lives only as long as the value.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::log::{ConsumerConfig, Delivery, EventLog, LogError, StreamConfig};
use crate::subject::{subject_matches, validate_subject};

#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    state: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
}

#[derive(Debug)]
struct StreamState {
    config: StreamConfig,
    messages: BTreeMap<u64, StoredMessage>,
    next_seq: u64,
    consumers: HashMap<String, ConsumerState>,
}

#[derive(Debug)]
struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
    published_at: DateTime<Utc>,
    stored_at: Instant,
}

#[derive(Debug)]
struct ConsumerState {
    config: ConsumerConfig,
    /// Next sequence never handed out to this durable.
    cursor: u64,
    in_flight: BTreeMap<u64, InFlight>,
}

#[derive(Debug)]
struct InFlight {
    redeliver_at: Instant,
    deliveries: u32,
}

enum Next {
    Ready(Delivery),
    Idle { redelivery_due: Option<Instant> },
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StreamState>>, LogError> {
        self.state.lock().map_err(|_| LogError::Poisoned)
    }

    /// Messages currently retained by `stream` (test/inspection helper).
    pub fn retained(&self, stream: &str) -> Result<usize, LogError> {
        let mut streams = self.lock()?;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;
        state.apply_retention(Instant::now());
        Ok(state.messages.len())
    }

    /// Messages delivered to `durable` but not yet acked or terminated.
    pub fn in_flight(&self, stream: &str, durable: &str) -> Result<usize, LogError> {
        let streams = self.lock()?;
        let consumer = streams
            .get(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?
            .consumers
            .get(durable)
            .ok_or_else(|| LogError::ConsumerNotFound {
                stream: stream.to_string(),
                durable: durable.to_string(),
            })?;
        Ok(consumer.in_flight.len())
    }

    /// Payloads published on `subject` that are still retained, oldest first.
    pub fn published_on(&self, subject: &str) -> Result<Vec<Vec<u8>>, LogError> {
        let streams = self.lock()?;
        Ok(streams
            .values()
            .flat_map(|s| s.messages.values())
            .filter(|m| m.subject == subject)
            .map(|m| m.payload.clone())
            .collect())
    }

    fn next_delivery(&self, stream: &str, durable: &str, now: Instant) -> Result<Next, LogError> {
        let mut streams = self.lock()?;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;
        state.apply_retention(now);

        let StreamState {
            messages,
            next_seq,
            consumers,
            ..
        } = state;
        let consumer = consumers.get_mut(durable).ok_or_else(|| LogError::ConsumerNotFound {
            stream: stream.to_string(),
            durable: durable.to_string(),
        })?;
        let ack_wait = consumer.config.ack_wait;

        // Redeliveries first: abandoned or naked messages whose time has come.
        let due = consumer
            .in_flight
            .iter()
            .find(|(_, f)| f.redeliver_at <= now)
            .map(|(seq, _)| *seq);
        if let Some(seq) = due {
            if let (Some(flight), Some(message)) = (consumer.in_flight.get_mut(&seq), messages.get(&seq)) {
                flight.deliveries += 1;
                flight.redeliver_at = now + ack_wait;
                return Ok(Next::Ready(delivery(stream, durable, seq, message, flight.deliveries)));
            }
        }

        let filter = consumer.config.filter_subject.clone();
        let found = messages
            .range(consumer.cursor..)
            .find(|(_, m)| subject_matches(&filter, &m.subject))
            .map(|(seq, _)| *seq);
        match found {
            Some(seq) => {
                consumer.cursor = seq + 1;
                consumer.in_flight.insert(
                    seq,
                    InFlight {
                        redeliver_at: now + ack_wait,
                        deliveries: 1,
                    },
                );
                let message = &messages[&seq];
                Ok(Next::Ready(delivery(stream, durable, seq, message, 1)))
            }
            None => {
                consumer.cursor = *next_seq;
                Ok(Next::Idle {
                    redelivery_due: consumer.in_flight.values().map(|f| f.redeliver_at).min(),
                })
            }
        }
    }

    fn with_in_flight<F>(&self, d: &Delivery, f: F) -> Result<(), LogError>
    where
        F: FnOnce(&mut BTreeMap<u64, InFlight>, u64),
    {
        let seq: u64 = d
            .message_id
            .parse()
            .map_err(|_| LogError::UnknownMessage(d.message_id.clone()))?;
        let mut streams = self.lock()?;
        let consumer = streams
            .get_mut(&d.stream)
            .ok_or_else(|| LogError::StreamNotFound(d.stream.clone()))?
            .consumers
            .get_mut(&d.durable)
            .ok_or_else(|| LogError::ConsumerNotFound {
                stream: d.stream.clone(),
                durable: d.durable.clone(),
            })?;
        f(&mut consumer.in_flight, seq);
        Ok(())
    }
}

fn delivery(stream: &str, durable: &str, seq: u64, message: &StoredMessage, count: u32) -> Delivery {
    Delivery {
        stream: stream.to_string(),
        durable: durable.to_string(),
        subject: message.subject.clone(),
        message_id: seq.to_string(),
        payload: message.payload.clone(),
        delivery_count: count,
        published_at: message.published_at,
    }
}

impl StreamState {
    fn apply_retention(&mut self, now: Instant) {
        if let Some(max_age) = self.config.retention.max_age {
            while let Some(entry) = self.messages.first_entry() {
                if now.saturating_duration_since(entry.get().stored_at) < max_age {
                    break;
                }
                entry.remove();
            }
        }
        if let Some(max) = self.config.retention.max_messages {
            while self.messages.len() as u64 > max {
                self.messages.pop_first();
            }
        }
        let oldest = self.messages.keys().next().copied().unwrap_or(self.next_seq);
        for consumer in self.consumers.values_mut() {
            consumer.in_flight.retain(|seq, _| *seq >= oldest);
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<(), LogError> {
        config.validate()?;
        let mut streams = self.lock()?;
        for (name, other) in streams.iter() {
            if *name == config.name {
                continue;
            }
            if let Some(shared) = config.subjects.iter().find(|s| other.config.subjects.contains(*s)) {
                return Err(LogError::InvalidConfig(format!(
                    "subject {} already belongs to stream {}",
                    shared, name
                )));
            }
        }
        match streams.get_mut(&config.name) {
            Some(existing) => existing.config = config.clone(),
            None => {
                streams.insert(
                    config.name.clone(),
                    StreamState {
                        config: config.clone(),
                        messages: BTreeMap::new(),
                        next_seq: 1,
                        consumers: HashMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<(), LogError> {
        config.validate()?;
        let mut streams = self.lock()?;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;
        match state.consumers.get_mut(&config.durable_name) {
            Some(existing) => existing.config = config.clone(),
            None => {
                state.consumers.insert(
                    config.durable_name.clone(),
                    ConsumerState {
                        config: config.clone(),
                        cursor: 1,
                        in_flight: BTreeMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<String, LogError> {
        validate_subject(subject)?;
        let seq = {
            let mut streams = self.lock()?;
            let state = streams
                .values_mut()
                .find(|s| s.config.accepts(subject))
                .ok_or_else(|| LogError::NoStreamForSubject(subject.to_string()))?;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.messages.insert(
                seq,
                StoredMessage {
                    subject: subject.to_string(),
                    payload: payload.to_vec(),
                    published_at: Utc::now(),
                    stored_at: Instant::now(),
                },
            );
            state.apply_retention(Instant::now());
            seq
        };
        debug!(subject, seq, "message appended");
        self.notify.notify_waiters();
        Ok(seq.to_string())
    }

    async fn fetch(&self, stream: &str, durable: &str, max_wait: Duration) -> Result<Option<Delivery>, LogError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let wake_at = match self.next_delivery(stream, durable, now)? {
                Next::Ready(d) => return Ok(Some(d)),
                Next::Idle { redelivery_due } => match redelivery_due {
                    Some(due) => due.min(deadline),
                    None => deadline,
                },
            };
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), LogError> {
        self.with_in_flight(delivery, |in_flight, seq| {
            in_flight.remove(&seq);
        })
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<(), LogError> {
        self.with_in_flight(delivery, |in_flight, seq| {
            if let Some(flight) = in_flight.get_mut(&seq) {
                flight.redeliver_at = Instant::now() + delay;
            }
        })?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn term(&self, delivery: &Delivery) -> Result<(), LogError> {
        self.with_in_flight(delivery, |in_flight, seq| {
            in_flight.remove(&seq);
        })
    }
}
