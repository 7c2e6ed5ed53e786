//! Durable stream backing for the event bus.
//!
//! One named stream, one consumer group; every published event is one
//! entry. Consumers identify themselves with a per-process name and ack
//! entries after dispatch. Processed-event ids are remembered with a TTL so
//! redelivered entries are dropped instead of double-dispatched.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::TaskloomError;
use crate::events::Event;

/// TTL on the processed-event dedup set.
pub const DEDUP_TTL: Duration = Duration::from_secs(3600);

#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append an event to the stream; returns the entry id.
    async fn publish(&self, event: &Event) -> Result<String, TaskloomError>;

    /// Read up to `max` undelivered entries for this consumer. Returned
    /// events carry their entry id in `ack_id`.
    async fn consume(&self, max: usize) -> Result<Vec<Event>, TaskloomError>;

    /// Acknowledge an entry after dispatch completes.
    async fn ack(&self, ack_id: &str) -> Result<(), TaskloomError>;

    /// Test-and-set on the dedup set: returns true when the event id was
    /// already processed within the TTL, otherwise marks it and returns
    /// false.
    async fn already_processed(&self, event_id: &str) -> Result<bool, TaskloomError>;
}

/// Single-process broker with the same contract as the durable one; used in
/// tests and local runs.
pub struct MemoryBroker {
    entries: Mutex<VecDeque<(String, Event)>>,
    pending_ack: Mutex<HashMap<String, Event>>,
    processed: Mutex<HashMap<String, Instant>>,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            pending_ack: Mutex::new(HashMap::new()),
            processed: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn unacked(&self) -> usize {
        self.pending_ack.lock().expect("broker lock").len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn publish(&self, event: &Event) -> Result<String, TaskloomError> {
        let entry_id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries
            .lock()
            .expect("broker lock")
            .push_back((entry_id.clone(), event.clone()));
        Ok(entry_id)
    }

    async fn consume(&self, max: usize) -> Result<Vec<Event>, TaskloomError> {
        let mut entries = self.entries.lock().expect("broker lock");
        let mut pending = self.pending_ack.lock().expect("broker lock");
        let mut out = Vec::new();
        while out.len() < max {
            let Some((entry_id, mut event)) = entries.pop_front() else {
                break;
            };
            event.ack_id = Some(entry_id.clone());
            pending.insert(entry_id, event.clone());
            out.push(event);
        }
        Ok(out)
    }

    async fn ack(&self, ack_id: &str) -> Result<(), TaskloomError> {
        self.pending_ack.lock().expect("broker lock").remove(ack_id);
        Ok(())
    }

    async fn already_processed(&self, event_id: &str) -> Result<bool, TaskloomError> {
        let mut processed = self.processed.lock().expect("broker lock");
        processed.retain(|_, seen_at| seen_at.elapsed() < DEDUP_TTL);
        if processed.contains_key(event_id) {
            return Ok(true);
        }
        processed.insert(event_id.to_string(), Instant::now());
        Ok(false)
    }
}

#[cfg(feature = "redis-backend")]
pub use self::redis_backend::RedisBroker;

#[cfg(feature = "redis-backend")]
mod redis_backend {
    use redis::aio::ConnectionManager;

    use super::*;

    const STREAM_KEY: &str = "taskloom:events";
    const GROUP: &str = "taskloom";

    /// Redis Streams broker: XADD to publish, XREADGROUP to consume, XACK
    /// to acknowledge, `SET NX EX` under `processed:<event_id>` for dedup.
    pub struct RedisBroker {
        connection: ConnectionManager,
        consumer_name: String,
    }

    impl RedisBroker {
        pub async fn connect(url: &str) -> Result<Self, TaskloomError> {
            let client = redis::Client::open(url)
                .map_err(|err| TaskloomError::Bus(format!("redis client: {err}")))?;
            let mut connection = ConnectionManager::new(client)
                .await
                .map_err(|err| TaskloomError::Bus(format!("redis connect: {err}")))?;

            // Create the consumer group, tolerating an existing one.
            let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(STREAM_KEY)
                .arg(GROUP)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut connection)
                .await;
            if let Err(err) = created {
                if !err.to_string().contains("BUSYGROUP") {
                    return Err(TaskloomError::Bus(format!("consumer group: {err}")));
                }
            }

            Ok(Self {
                connection,
                consumer_name: format!(
                    "consumer-{}-{}",
                    std::process::id(),
                    &uuid::Uuid::new_v4().to_string()[..8]
                ),
            })
        }
    }

    #[async_trait]
    impl StreamBroker for RedisBroker {
        async fn publish(&self, event: &Event) -> Result<String, TaskloomError> {
            let body = serde_json::to_string(event)
                .map_err(|err| TaskloomError::Bus(format!("encode event: {err}")))?;
            let mut connection = self.connection.clone();
            let entry_id: String = redis::cmd("XADD")
                .arg(STREAM_KEY)
                .arg("*")
                .arg("event")
                .arg(body)
                .query_async(&mut connection)
                .await
                .map_err(|err| TaskloomError::Bus(format!("xadd: {err}")))?;
            Ok(entry_id)
        }

        async fn consume(&self, max: usize) -> Result<Vec<Event>, TaskloomError> {
            let mut connection = self.connection.clone();
            let reply: redis::Value = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(GROUP)
                .arg(&self.consumer_name)
                .arg("COUNT")
                .arg(max)
                .arg("BLOCK")
                .arg(1000)
                .arg("STREAMS")
                .arg(STREAM_KEY)
                .arg(">")
                .query_async(&mut connection)
                .await
                .map_err(|err| TaskloomError::Bus(format!("xreadgroup: {err}")))?;

            let mut events = Vec::new();
            // Reply shape: [[stream, [[entry_id, [field, value, ...]], ...]]]
            let redis::Value::Array(streams) = reply else {
                return Ok(events);
            };
            for stream in streams {
                let redis::Value::Array(parts) = stream else {
                    continue;
                };
                let Some(redis::Value::Array(entries)) = parts.into_iter().nth(1) else {
                    continue;
                };
                for entry in entries {
                    let redis::Value::Array(pair) = entry else {
                        continue;
                    };
                    let mut pair = pair.into_iter();
                    let Some(entry_id) = pair.next().and_then(as_string) else {
                        continue;
                    };
                    let Some(redis::Value::Array(fields)) = pair.next() else {
                        continue;
                    };
                    let mut fields = fields.into_iter();
                    while let (Some(key), Some(value)) = (fields.next(), fields.next()) {
                        if as_string(key).as_deref() == Some("event") {
                            if let Some(body) = as_string(value) {
                                match serde_json::from_str::<Event>(&body) {
                                    Ok(mut event) => {
                                        event.ack_id = Some(entry_id.clone());
                                        events.push(event);
                                    }
                                    Err(err) => {
                                        tracing::error!(error = %err, "bad stream entry");
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Ok(events)
        }

        async fn ack(&self, ack_id: &str) -> Result<(), TaskloomError> {
            let mut connection = self.connection.clone();
            let _: i64 = redis::cmd("XACK")
                .arg(STREAM_KEY)
                .arg(GROUP)
                .arg(ack_id)
                .query_async(&mut connection)
                .await
                .map_err(|err| TaskloomError::Bus(format!("xack: {err}")))?;
            Ok(())
        }

        async fn already_processed(&self, event_id: &str) -> Result<bool, TaskloomError> {
            let mut connection = self.connection.clone();
            let newly_set: Option<String> = redis::cmd("SET")
                .arg(format!("processed:{event_id}"))
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(DEDUP_TTL.as_secs())
                .query_async(&mut connection)
                .await
                .map_err(|err| TaskloomError::Bus(format!("dedup set: {err}")))?;
            Ok(newly_set.is_none())
        }
    }

    fn as_string(value: redis::Value) -> Option<String> {
        match value {
            redis::Value::BulkString(bytes) => String::from_utf8(bytes).ok(),
            redis::Value::SimpleString(s) => Some(s),
            _ => None,
        }
    }
}
