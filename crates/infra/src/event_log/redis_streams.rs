//! Redis Streams-backed event log (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Subject key**: `applyflow:<stream>:<subject>`, one Redis stream per
//!   concrete subject. Retention is applied on publish (`MAXLEN`, `MINID`).
//! - **Durable consumer**: a consumer group on the subject key named after
//!   the durable. Groups on the same key fan out, consumers inside one group
//!   share its cursor.
//! - **Registry**: stream and consumer settings are kept in the hashes
//!   `applyflow:streams` and `applyflow:consumers:<stream>` so a process that
//!   only publishes can still route a subject.
//!
//! Redelivery rides on the pending entries list: an entry idle longer than
//! the consumer's ack-wait is reclaimed with `XAUTOCLAIM`. A nak rewinds the
//! entry's idle time so it becomes claimable after the requested delay. The
//! `XAUTOCLAIM` cursor is carried between polls per durable, so entries that
//! are not idle yet at the head of the pending list do not hide stale ones
//! behind them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::Value;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use applyflow_events::{
    subject::validate_subject, ConsumerConfig, Delivery, EventLog, LogError, RetentionPolicy, StreamConfig,
};

const KEY_PREFIX: &str = "applyflow";

/// Sleep between polls when a durable has nothing to deliver.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// `XAUTOCLAIM` round trips per fetch attempt before falling back to new
/// entries. Each one scans up to ten pending entries.
const CLAIM_SCANS: usize = 8;

const CURSOR_START: &str = "0-0";

#[derive(Debug, Serialize, Deserialize)]
struct StoredStream {
    subjects: Vec<String>,
    max_age_ms: Option<u64>,
    max_messages: Option<u64>,
}

impl StoredStream {
    fn from_config(config: &StreamConfig) -> Self {
        Self {
            subjects: config.subjects.clone(),
            max_age_ms: config.retention.max_age.map(|d| d.as_millis() as u64),
            max_messages: config.retention.max_messages,
        }
    }

    fn into_config(self, name: &str) -> StreamConfig {
        StreamConfig::new(
            name,
            self.subjects,
            RetentionPolicy {
                max_age: self.max_age_ms.map(Duration::from_millis),
                max_messages: self.max_messages,
            },
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredConsumer {
    filter_subject: String,
    ack_wait_ms: u64,
}

#[derive(Clone)]
pub struct RedisStreamsEventLog {
    conn: MultiplexedConnection,
    consumer_name: String,
    streams: Arc<Mutex<HashMap<String, StreamConfig>>>,
    consumers: Arc<Mutex<HashMap<(String, String), ConsumerConfig>>>,
    /// Next `XAUTOCLAIM` start per (subject key, durable).
    claim_cursors: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl std::fmt::Debug for RedisStreamsEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsEventLog")
            .field("consumer_name", &self.consumer_name)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsEventLog {
    /// Open a multiplexed connection to `redis_url`.
    ///
    /// Every instance reads as its own named consumer inside each group, so
    /// several processes sharing a durable split its messages.
    pub async fn connect(redis_url: &str) -> Result<Self, LogError> {
        let client = redis::Client::open(redis_url).map_err(|e| LogError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LogError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
            streams: Arc::new(Mutex::new(HashMap::new())),
            consumers: Arc::new(Mutex::new(HashMap::new())),
            claim_cursors: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn streams(&self) -> Result<MutexGuard<'_, HashMap<String, StreamConfig>>, LogError> {
        self.streams.lock().map_err(|_| LogError::Poisoned)
    }

    fn consumers(&self) -> Result<MutexGuard<'_, HashMap<(String, String), ConsumerConfig>>, LogError> {
        self.consumers.lock().map_err(|_| LogError::Poisoned)
    }

    fn claim_cursor(&self, key: &str, durable: &str) -> Result<String, LogError> {
        let cursors = self.claim_cursors.lock().map_err(|_| LogError::Poisoned)?;
        Ok(cursors
            .get(&(key.to_string(), durable.to_string()))
            .cloned()
            .unwrap_or_else(|| CURSOR_START.to_string()))
    }

    fn set_claim_cursor(&self, key: &str, durable: &str, cursor: String) -> Result<(), LogError> {
        self.claim_cursors
            .lock()
            .map_err(|_| LogError::Poisoned)?
            .insert((key.to_string(), durable.to_string()), cursor);
        Ok(())
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd, what: &str) -> Result<T, LogError> {
        let mut conn = self.conn.clone();
        cmd.query_async::<_, T>(&mut conn)
            .await
            .map_err(|e| LogError::Command(format!("{} failed: {}", what, e)))
    }

    /// Stream whose patterns accept `subject`, consulting Redis on a cache miss.
    async fn stream_for(&self, subject: &str) -> Result<StreamConfig, LogError> {
        if let Some(found) = self.streams()?.values().find(|s| s.accepts(subject)).cloned() {
            return Ok(found);
        }

        let stored: HashMap<String, String> = self
            .query(redis::cmd("HGETALL").arg(streams_registry_key()), "HGETALL")
            .await?;
        let mut cache = self.streams()?;
        for (name, raw) in stored {
            match serde_json::from_str::<StoredStream>(&raw) {
                Ok(stream) => {
                    cache.insert(name.clone(), stream.into_config(&name));
                }
                Err(e) => warn!(stream = %name, error = %e, "ignoring unreadable stream registration"),
            }
        }
        cache
            .values()
            .find(|s| s.accepts(subject))
            .cloned()
            .ok_or_else(|| LogError::NoStreamForSubject(subject.to_string()))
    }

    async fn consumer_for(&self, stream: &str, durable: &str) -> Result<ConsumerConfig, LogError> {
        let key = (stream.to_string(), durable.to_string());
        if let Some(found) = self.consumers()?.get(&key).cloned() {
            return Ok(found);
        }

        let raw: Option<String> = self
            .query(redis::cmd("HGET").arg(consumers_registry_key(stream)).arg(durable), "HGET")
            .await?;
        let stored: StoredConsumer = raw
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
            .ok_or_else(|| LogError::ConsumerNotFound {
                stream: stream.to_string(),
                durable: durable.to_string(),
            })?;
        let config = ConsumerConfig::new(durable, stored.filter_subject, Duration::from_millis(stored.ack_wait_ms));
        self.consumers()?.insert(key, config.clone());
        Ok(config)
    }

    /// Reclaim one entry whose idle time exceeds `ack_wait`, resuming the
    /// pending-list scan where the previous call stopped.
    async fn claim_stale(&self, key: &str, durable: &str, ack_wait: Duration) -> Result<Option<Entry>, LogError> {
        let mut cursor = self.claim_cursor(key, durable)?;
        for _ in 0..CLAIM_SCANS {
            let reply: Value = self
                .query(
                    redis::cmd("XAUTOCLAIM")
                        .arg(key)
                        .arg(durable)
                        .arg(&self.consumer_name)
                        .arg(ack_wait.as_millis() as u64)
                        .arg(&cursor)
                        .arg("COUNT")
                        .arg(1),
                    "XAUTOCLAIM",
                )
                .await?;
            let (next, claimed) = split_autoclaim(&reply);
            self.set_claim_cursor(key, durable, next.clone())?;

            match claimed {
                Some(mut entry) if entry.payload.is_some() => {
                    entry.delivery_count = self.delivery_count(key, durable, &entry.id).await?;
                    return Ok(Some(entry));
                }
                Some(entry) => {
                    // Trimmed by retention while pending; nothing left to deliver.
                    self.acknowledge(key, durable, &entry.id).await?;
                }
                None if next == CURSOR_START => return Ok(None),
                None => {}
            }
            cursor = next;
        }
        Ok(None)
    }

    async fn read_new(&self, key: &str, durable: &str) -> Result<Option<Entry>, LogError> {
        let reply: Value = self
            .query(
                redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(durable)
                    .arg(&self.consumer_name)
                    .arg("COUNT")
                    .arg(1)
                    .arg("STREAMS")
                    .arg(key)
                    .arg(">"),
                "XREADGROUP",
            )
            .await?;

        // Nil, or [[key, [[id, [field, value, ...]]]]]
        let Value::Bulk(streams) = reply else {
            return Ok(None);
        };
        let entry = streams.first().and_then(|stream| match stream {
            Value::Bulk(pair) => match pair.get(1) {
                Some(Value::Bulk(entries)) => entries.first().and_then(parse_entry),
                _ => None,
            },
            _ => None,
        });
        Ok(entry.filter(|e| e.payload.is_some()))
    }

    async fn delivery_count(&self, key: &str, durable: &str, id: &str) -> Result<u32, LogError> {
        let reply: Value = self
            .query(
                redis::cmd("XPENDING").arg(key).arg(durable).arg(id).arg(id).arg(1),
                "XPENDING",
            )
            .await?;
        // [[id, consumer, idle-ms, delivery-count]]
        let count = match reply {
            Value::Bulk(rows) => rows.first().and_then(|row| match row {
                Value::Bulk(fields) => match fields.get(3) {
                    Some(Value::Int(n)) => Some(*n as u32),
                    _ => None,
                },
                _ => None,
            }),
            _ => None,
        };
        Ok(count.unwrap_or(1))
    }

    async fn acknowledge(&self, key: &str, durable: &str, id: &str) -> Result<(), LogError> {
        let _: i64 = self
            .query(redis::cmd("XACK").arg(key).arg(durable).arg(id), "XACK")
            .await?;
        Ok(())
    }

    async fn trim(&self, key: &str, retention: &RetentionPolicy) -> Result<(), LogError> {
        if let Some(max_age) = retention.max_age {
            let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
            let _: i64 = self
                .query(
                    redis::cmd("XTRIM").arg(key).arg("MINID").arg(format!("{}-0", cutoff.max(0))),
                    "XTRIM",
                )
                .await?;
        }
        if let Some(max_messages) = retention.max_messages {
            let _: i64 = self
                .query(redis::cmd("XTRIM").arg(key).arg("MAXLEN").arg(max_messages), "XTRIM")
                .await?;
        }
        Ok(())
    }

    fn into_delivery(&self, stream: &str, durable: &str, subject: &str, entry: Entry) -> Delivery {
        Delivery {
            stream: stream.to_string(),
            durable: durable.to_string(),
            subject: subject.to_string(),
            published_at: published_at(&entry.id),
            message_id: entry.id,
            payload: entry.payload.unwrap_or_default(),
            delivery_count: entry.delivery_count,
        }
    }
}

#[async_trait]
impl EventLog for RedisStreamsEventLog {
    #[instrument(skip(self, config), fields(stream = %config.name), err)]
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<(), LogError> {
        config.validate()?;
        let stored = serde_json::to_string(&StoredStream::from_config(config))
            .map_err(|e| LogError::InvalidConfig(e.to_string()))?;
        let _: i64 = self
            .query(
                redis::cmd("HSET").arg(streams_registry_key()).arg(&config.name).arg(stored),
                "HSET",
            )
            .await?;
        self.streams()?.insert(config.name.clone(), config.clone());
        Ok(())
    }

    #[instrument(skip(self, config), fields(durable = %config.durable_name), err)]
    async fn ensure_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<(), LogError> {
        config.validate()?;
        // Each durable maps onto one subject key, so filters must be concrete.
        validate_subject(&config.filter_subject)?;

        let stream_config = self.stream_for(&config.filter_subject).await?;
        if stream_config.name != stream {
            return Err(LogError::InvalidConfig(format!(
                "subject {} belongs to stream {}, not {}",
                config.filter_subject, stream_config.name, stream
            )));
        }

        let key = subject_key(stream, &config.filter_subject);
        let created: Result<String, LogError> = self
            .query(
                redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(&key)
                    .arg(&config.durable_name)
                    .arg("0")
                    .arg("MKSTREAM"),
                "XGROUP CREATE",
            )
            .await;
        match created {
            Ok(_) => debug!(key = %key, "consumer group created"),
            Err(LogError::Command(msg)) if msg.contains("BUSYGROUP") => {}
            Err(e) => return Err(e),
        }

        let stored = serde_json::to_string(&StoredConsumer {
            filter_subject: config.filter_subject.clone(),
            ack_wait_ms: config.ack_wait.as_millis() as u64,
        })
        .map_err(|e| LogError::InvalidConfig(e.to_string()))?;
        let _: i64 = self
            .query(
                redis::cmd("HSET")
                    .arg(consumers_registry_key(stream))
                    .arg(&config.durable_name)
                    .arg(stored),
                "HSET",
            )
            .await?;

        self.consumers()?
            .insert((stream.to_string(), config.durable_name.clone()), config.clone());
        Ok(())
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()), err)]
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<String, LogError> {
        validate_subject(subject)?;
        let stream = self.stream_for(subject).await?;
        let key = subject_key(&stream.name, subject);

        let id: String = self
            .query(redis::cmd("XADD").arg(&key).arg("*").arg("payload").arg(payload), "XADD")
            .await?;
        self.trim(&key, &stream.retention).await?;
        Ok(id)
    }

    async fn fetch(&self, stream: &str, durable: &str, max_wait: Duration) -> Result<Option<Delivery>, LogError> {
        let consumer = self.consumer_for(stream, durable).await?;
        let key = subject_key(stream, &consumer.filter_subject);
        let deadline = Instant::now() + max_wait;

        loop {
            if let Some(entry) = self.claim_stale(&key, durable, consumer.ack_wait).await? {
                return Ok(Some(self.into_delivery(stream, durable, &consumer.filter_subject, entry)));
            }
            if let Some(entry) = self.read_new(&key, durable).await? {
                return Ok(Some(self.into_delivery(stream, durable, &consumer.filter_subject, entry)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), LogError> {
        let key = subject_key(&delivery.stream, &delivery.subject);
        self.acknowledge(&key, &delivery.durable, &delivery.message_id).await
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<(), LogError> {
        let consumer = self.consumer_for(&delivery.stream, &delivery.durable).await?;
        let key = subject_key(&delivery.stream, &delivery.subject);
        // Claimable once idle >= ack_wait, so start the clock at ack_wait - delay.
        let idle = consumer.ack_wait.saturating_sub(delay);
        let _: Value = self
            .query(
                redis::cmd("XCLAIM")
                    .arg(&key)
                    .arg(&delivery.durable)
                    .arg(&self.consumer_name)
                    .arg(0)
                    .arg(&delivery.message_id)
                    .arg("IDLE")
                    .arg(idle.as_millis() as u64)
                    .arg("JUSTID"),
                "XCLAIM",
            )
            .await?;
        Ok(())
    }

    async fn term(&self, delivery: &Delivery) -> Result<(), LogError> {
        let key = subject_key(&delivery.stream, &delivery.subject);
        self.acknowledge(&key, &delivery.durable, &delivery.message_id).await
    }
}

#[derive(Debug)]
struct Entry {
    id: String,
    payload: Option<Vec<u8>>,
    delivery_count: u32,
}

/// `[id, [field, value, ...]]`; fields are nil for entries trimmed away.
fn parse_entry(value: &Value) -> Option<Entry> {
    let Value::Bulk(parts) = value else {
        return None;
    };
    let id = match parts.first()? {
        Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        Value::Status(s) => s.clone(),
        _ => return None,
    };
    let payload = match parts.get(1) {
        Some(Value::Bulk(fields)) => fields.chunks(2).find_map(|chunk| match chunk {
            [Value::Data(name), Value::Data(value)] if name.as_slice() == b"payload" => Some(value.clone()),
            _ => None,
        }),
        _ => None,
    };
    Some(Entry {
        id,
        payload,
        delivery_count: 1,
    })
}

/// `[next-cursor, [[id, [field, value, ...]], ...], (deleted ids)]` into the
/// cursor to resume from and the first claimed entry.
fn split_autoclaim(reply: &Value) -> (String, Option<Entry>) {
    let Value::Bulk(parts) = reply else {
        return (CURSOR_START.to_string(), None);
    };
    let cursor = match parts.first() {
        Some(Value::Data(data)) => String::from_utf8_lossy(data).to_string(),
        Some(Value::Status(s)) => s.clone(),
        _ => CURSOR_START.to_string(),
    };
    let entry = match parts.get(1) {
        Some(Value::Bulk(entries)) => entries.first().and_then(parse_entry),
        _ => None,
    };
    (cursor, entry)
}

fn subject_key(stream: &str, subject: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, stream, subject)
}

fn streams_registry_key() -> String {
    format!("{}:streams", KEY_PREFIX)
}

fn consumers_registry_key(stream: &str) -> String {
    format!("{}:consumers:{}", KEY_PREFIX, stream)
}

/// Entry ids start with the millisecond timestamp Redis assigned on XADD.
fn published_at(id: &str) -> DateTime<Utc> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}
