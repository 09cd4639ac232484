//! Redis queue semantics
//!
//! The broker topology is an (exchange, queue, routing key) triple configured
//! out of band. On Redis it maps to a handful of deterministic keys so that
//! producers, every pool member and operators always agree on them:
//!
//! - ready list `<exchange>:<routing_key>:<queue>`: producers `LPUSH`, consumers pop the tail
//! - in-flight list per consumer tag: `BRPOPLPUSH` moves a body here until it is settled
//! - dead-letter list for bodies that must not come back
//! - redelivery counter hash keyed by body
//!
//! A crashed consumer leaves its bodies in its in-flight list; [`RedisConsumer::recover`]
//! hands them back on the next start, which gives at-least-once delivery.

use crate::types::JobMessage;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl QueueTopology {
    pub fn ready_key(&self) -> String {
        format!("{}:{}:{}", self.exchange, self.routing_key, self.queue)
    }

    pub fn processing_key(&self, consumer_tag: &str) -> String {
        format!("{}:processing:{}", self.ready_key(), consumer_tag)
    }

    pub fn dead_letter_key(&self) -> String {
        format!("{}:dead", self.ready_key())
    }

    pub fn attempts_key(&self) -> String {
        format!("{}:attempts", self.ready_key())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("cannot connect to broker: {0}")]
    Connect(#[source] redis::RedisError),
    #[error("broker command failed: {0}")]
    Command(#[from] redis::RedisError),
    #[error("cannot encode job message: {0}")]
    Encode(#[from] serde_json::Error),
}

async fn connect(redis_url: &str) -> Result<ConnectionManager, QueueError> {
    let client = redis::Client::open(redis_url).map_err(QueueError::Connect)?;
    ConnectionManager::new(client)
        .await
        .map_err(QueueError::Connect)
}

/// Anything able to hand a job message to the workers
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError>;
}

/// Publishes onto the ready list of the configured topology
#[derive(Clone)]
pub struct RedisPublisher {
    conn: ConnectionManager,
    topology: QueueTopology,
}

impl RedisPublisher {
    pub async fn connect(redis_url: &str, topology: QueueTopology) -> Result<Self, QueueError> {
        let conn = connect(redis_url).await?;
        Ok(Self { conn, topology })
    }
}

#[async_trait]
impl JobPublisher for RedisPublisher {
    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError> {
        let body = message.to_json()?;
        let mut conn = self.conn.clone();
        let depth: i64 = conn.lpush(self.topology.ready_key(), &body).await?;

        tracing::info!(
            submission_id = message.submission_id,
            visibility = %message.visibility(),
            queue = %self.topology.ready_key(),
            bytes = body.len(),
            depth,
            "Published job message"
        );
        Ok(())
    }
}

/// Accepts every message and drops it.
/// For deployments without workers and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoidPublisher;

#[async_trait]
impl JobPublisher for VoidPublisher {
    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError> {
        tracing::debug!(
            submission_id = message.submission_id,
            visibility = %message.visibility(),
            "Dropped job message (void publisher)"
        );
        Ok(())
    }
}

/// One message pulled from the ready list and not yet settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub body: String,
}

impl Delivery {
    pub fn bytes(&self) -> &[u8] {
        self.body.as_bytes()
    }
}

/// What happened to a requeued delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    Requeued { attempt: u32 },
    DeadLettered { attempts: u32 },
}

/// Consumer side of a queue as seen by one pool member.
///
/// Every delivery returned by [`JobConsumer::next`] must be settled exactly
/// once with `ack`, `reject` or `requeue`.
#[async_trait]
pub trait JobConsumer: Send {
    fn tag(&self) -> &str;

    /// Return deliveries left in flight by a previous run of this consumer
    async fn recover(&mut self) -> Result<usize, QueueError>;

    /// Block up to `timeout` for the next delivery
    async fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Settle a delivery that was processed
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Park a delivery on the dead-letter list; it will not come back
    async fn reject(&mut self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hand a delivery back for another attempt
    async fn requeue(&mut self, delivery: &Delivery) -> Result<Redelivery, QueueError>;
}

/// Redis consumer, one per pool member
pub struct RedisConsumer {
    conn: ConnectionManager,
    topology: QueueTopology,
    tag: String,
    max_redeliveries: u32,
}

impl RedisConsumer {
    pub async fn connect(
        redis_url: &str,
        topology: QueueTopology,
        tag: impl Into<String>,
        max_redeliveries: u32,
    ) -> Result<Self, QueueError> {
        let conn = connect(redis_url).await?;
        Ok(Self {
            conn,
            topology,
            tag: tag.into(),
            max_redeliveries,
        })
    }

    fn processing_key(&self) -> String {
        self.topology.processing_key(&self.tag)
    }
}

#[async_trait]
impl JobConsumer for RedisConsumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn recover(&mut self) -> Result<usize, QueueError> {
        let processing = self.processing_key();
        let ready = self.topology.ready_key();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = self.conn.rpoplpush(&processing, &ready).await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!(tag = %self.tag, recovered, "Returned unfinished deliveries to the queue");
        }
        Ok(recovered)
    }

    async fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let body: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(self.topology.ready_key())
            .arg(self.processing_key())
            .arg(timeout.as_secs().max(1))
            .query_async(&mut self.conn)
            .await?;
        Ok(body.map(|body| Delivery { body }))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(), 1, &delivery.body)
            .ignore()
            .hdel(self.topology.attempts_key(), &delivery.body)
            .ignore()
            .query_async::<_, ()>(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(), 1, &delivery.body)
            .ignore()
            .lpush(self.topology.dead_letter_key(), &delivery.body)
            .ignore()
            .hdel(self.topology.attempts_key(), &delivery.body)
            .ignore()
            .query_async::<_, ()>(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Gives up after `max_redeliveries` and dead-letters the body instead
    async fn requeue(&mut self, delivery: &Delivery) -> Result<Redelivery, QueueError> {
        let attempts: u32 = self
            .conn
            .hincr(self.topology.attempts_key(), &delivery.body, 1)
            .await?;

        if attempts > self.max_redeliveries {
            self.reject(delivery).await?;
            return Ok(Redelivery::DeadLettered { attempts });
        }

        redis::pipe()
            .atomic()
            .lrem(self.processing_key(), 1, &delivery.body)
            .ignore()
            .lpush(self.topology.ready_key(), &delivery.body)
            .ignore()
            .query_async::<_, ()>(&mut self.conn)
            .await?;
        Ok(Redelivery::Requeued { attempt: attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SubmissionTarget, Visibility};

    fn topology() -> QueueTopology {
        QueueTopology {
            exchange: "infomark-worker-exchange".to_string(),
            queue: "infomark-worker-submissions".to_string(),
            routing_key: "submissions".to_string(),
        }
    }

    #[test]
    fn test_ready_key_deterministic() {
        assert_eq!(
            topology().ready_key(),
            "infomark-worker-exchange:submissions:infomark-worker-submissions"
        );
        assert_eq!(topology().ready_key(), topology().ready_key());
    }

    #[test]
    fn test_processing_key_is_per_consumer() {
        let t = topology();
        let a = t.processing_key("worker-0");
        let b = t.processing_key("worker-1");
        assert_ne!(a, b);
        assert!(a.starts_with(&t.ready_key()));
        assert!(a.ends_with(":processing:worker-0"));
    }

    #[test]
    fn test_auxiliary_keys_share_prefix() {
        let t = topology();
        assert_eq!(t.dead_letter_key(), format!("{}:dead", t.ready_key()));
        assert_eq!(t.attempts_key(), format!("{}:attempts", t.ready_key()));
    }

    #[tokio::test]
    async fn test_void_publisher_accepts_everything() {
        let target = SubmissionTarget {
            api_url: "http://api".to_string(),
            course_id: 1,
            task_id: 2,
            submission_id: 3,
            grade_id: 4,
        };
        let msg = JobMessage::for_submission(&target, Visibility::Public, "t", "img", &"0".repeat(64));
        let publisher: Box<dyn JobPublisher> = Box::new(VoidPublisher);
        assert!(publisher.publish(&msg).await.is_ok());
    }
}
