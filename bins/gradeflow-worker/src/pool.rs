//! Worker Pool
//!
//! `WORKER_INSTANCES` independent members, each with its own consumer tag
//! and broker connection. A member takes one delivery at a time, hands it
//! to the shared handler and settles it according to the outcome:
//!
//! | outcome   | broker action                         |
//! |-----------|---------------------------------------|
//! | Completed | ack                                   |
//! | Rejected  | dead-letter                           |
//! | Retry     | requeue (dead-letter once exhausted)  |
//!
//! Shutdown stops members from taking new deliveries; a delivery already
//! being handled is finished and settled first.

use gradeflow_common::config::{BrokerConfig, WorkerConfig};
use gradeflow_common::queue::RedisConsumer;
use gradeflow_common::{Delivery, JobConsumer, QueueError, Redelivery};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::handler::{HandleOutcome, SubmissionHandler};
use crate::metrics::WorkerMetrics;

/// Blocking pop timeout; bounds how long an idle member takes to notice shutdown
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

const BROKER_BACKOFF: Duration = Duration::from_secs(1);

/// In-flight list owner. Unique per process, or `recover` on restart steals
/// another process's deliveries.
pub fn consumer_tag(name: &str, index: usize) -> String {
    format!("{}-{}", name, index)
}

/// Open one consumer per configured instance. Any failure is fatal.
pub async fn connect_consumers(
    broker: &BrokerConfig,
    worker: &WorkerConfig,
) -> Result<Vec<Box<dyn JobConsumer>>, QueueError> {
    let mut consumers: Vec<Box<dyn JobConsumer>> = Vec::with_capacity(worker.instances);
    for index in 0..worker.instances {
        let consumer = RedisConsumer::connect(
            &broker.redis_url,
            broker.topology.clone(),
            consumer_tag(&worker.name, index),
            broker.max_redeliveries,
        )
        .await?;
        consumers.push(Box::new(consumer));
    }
    Ok(consumers)
}

pub struct WorkerPool {
    members: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn spawn(
        consumers: Vec<Box<dyn JobConsumer>>,
        handler: Arc<dyn SubmissionHandler>,
        metrics: WorkerMetrics,
    ) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let members = consumers
            .into_iter()
            .map(|consumer| {
                tokio::spawn(run_member(
                    consumer,
                    handler.clone(),
                    metrics.clone(),
                    signal.clone(),
                ))
            })
            .collect();
        Self { members, shutdown }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Stop taking deliveries and wait for in-flight ones to settle
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for member in self.members {
            if let Err(e) = member.await {
                tracing::error!(error = %e, "Pool member terminated abnormally");
            }
        }
    }
}

async fn run_member(
    mut consumer: Box<dyn JobConsumer>,
    handler: Arc<dyn SubmissionHandler>,
    metrics: WorkerMetrics,
    mut shutdown: watch::Receiver<bool>,
) {
    let tag = consumer.tag().to_string();

    if let Err(e) = consumer.recover().await {
        tracing::error!(tag = %tag, error = %e, "Failed to recover unfinished deliveries");
    }
    tracing::info!(tag = %tag, "Pool member listening");

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Dropping a pending pop is safe: a body the broker already moved
        // stays in this member's in-flight list and is recovered on restart.
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = consumer.next(POLL_TIMEOUT) => next,
        };

        match next {
            Ok(Some(delivery)) => {
                let outcome = handler.handle(delivery.bytes()).await;
                settle(consumer.as_mut(), &delivery, outcome, &metrics).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(tag = %tag, error = %e, "Broker error");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(BROKER_BACKOFF) => {}
                }
            }
        }
    }

    tracing::info!(tag = %tag, "Pool member stopped");
}

async fn settle(
    consumer: &mut dyn JobConsumer,
    delivery: &Delivery,
    outcome: HandleOutcome,
    metrics: &WorkerMetrics,
) {
    let tag = consumer.tag().to_string();
    let settled = match outcome {
        HandleOutcome::Completed => consumer.ack(delivery).await.map(|()| "ack"),
        HandleOutcome::Rejected(reason) => {
            tracing::warn!(tag = %tag, reason = %reason, "Dead-lettering delivery");
            consumer.reject(delivery).await.map(|()| "reject")
        }
        HandleOutcome::Retry(reason) => {
            consumer
                .requeue(delivery)
                .await
                .map(|redelivery| match redelivery {
                    Redelivery::Requeued { attempt } => {
                        tracing::warn!(tag = %tag, attempt, reason = %reason, "Requeued delivery");
                        "requeue"
                    }
                    Redelivery::DeadLettered { attempts } => {
                        tracing::error!(tag = %tag, attempts, reason = %reason, "Giving up on delivery");
                        "dead_letter"
                    }
                })
        }
    };

    match settled {
        Ok(label) => metrics.record_delivery(label),
        Err(e) => tracing::error!(tag = %tag, error = %e, "Failed to settle delivery"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Broker {
        ready: VecDeque<String>,
        acked: Vec<String>,
        dead: Vec<String>,
        attempts: HashMap<String, u32>,
    }

    struct MemoryConsumer {
        broker: Arc<Mutex<Broker>>,
        tag: String,
    }

    #[async_trait]
    impl JobConsumer for MemoryConsumer {
        fn tag(&self) -> &str {
            &self.tag
        }

        async fn recover(&mut self) -> Result<usize, QueueError> {
            Ok(0)
        }

        async fn next(&mut self, _timeout: Duration) -> Result<Option<Delivery>, QueueError> {
            let body = self.broker.lock().unwrap().ready.pop_front();
            if body.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(body.map(|body| Delivery { body }))
        }

        async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
            self.broker.lock().unwrap().acked.push(delivery.body.clone());
            Ok(())
        }

        async fn reject(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
            self.broker.lock().unwrap().dead.push(delivery.body.clone());
            Ok(())
        }

        async fn requeue(&mut self, delivery: &Delivery) -> Result<Redelivery, QueueError> {
            let mut broker = self.broker.lock().unwrap();
            let attempt = {
                let counter = broker.attempts.entry(delivery.body.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            broker.ready.push_back(delivery.body.clone());
            Ok(Redelivery::Requeued { attempt })
        }
    }

    /// Completes "ok-*", rejects "bad-*", retries "flaky-*" once
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl SubmissionHandler for RecordingHandler {
        async fn handle(&self, body: &[u8]) -> HandleOutcome {
            let body = String::from_utf8_lossy(body).to_string();
            let count = {
                let mut seen = self.seen.lock().unwrap();
                let count = seen.entry(body.clone()).or_insert(0);
                *count += 1;
                *count
            };
            tokio::time::sleep(Duration::from_millis(5)).await;

            if body.starts_with("bad") {
                HandleOutcome::Rejected("malformed".to_string())
            } else if body.starts_with("flaky") && count == 1 {
                HandleOutcome::Retry("api down".to_string())
            } else {
                HandleOutcome::Completed
            }
        }
    }

    fn consumers(broker: &Arc<Mutex<Broker>>, n: usize) -> Vec<Box<dyn JobConsumer>> {
        (0..n)
            .map(|i| {
                Box::new(MemoryConsumer {
                    broker: broker.clone(),
                    tag: consumer_tag("test", i),
                }) as Box<dyn JobConsumer>
            })
            .collect()
    }

    async fn wait_until(broker: &Arc<Mutex<Broker>>, settled: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let b = broker.lock().unwrap();
                if b.acked.len() + b.dead.len() >= settled {
                    return;
                }
            }
            assert!(Instant::now() < deadline, "deliveries were not settled in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_consumer_tag() {
        assert_eq!(consumer_tag("worker", 0), "worker-0");
        assert_eq!(consumer_tag("grader-a", 3), "grader-a-3");
    }

    #[tokio::test]
    async fn test_each_delivery_handled_once_across_members() {
        let broker = Arc::new(Mutex::new(Broker::default()));
        for i in 0..40 {
            broker.lock().unwrap().ready.push_back(format!("ok-{}", i));
        }
        let handler = Arc::new(RecordingHandler::default());
        let pool = WorkerPool::spawn(
            consumers(&broker, 4),
            handler.clone(),
            WorkerMetrics::new().unwrap(),
        );
        assert_eq!(pool.size(), 4);

        wait_until(&broker, 40).await;
        pool.shutdown().await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 40);
        assert!(seen.values().all(|count| *count == 1));
        assert_eq!(broker.lock().unwrap().acked.len(), 40);
    }

    #[tokio::test]
    async fn test_outcomes_map_to_broker_actions() {
        let broker = Arc::new(Mutex::new(Broker::default()));
        {
            let mut b = broker.lock().unwrap();
            b.ready.push_back("ok-1".to_string());
            b.ready.push_back("bad-1".to_string());
            b.ready.push_back("flaky-1".to_string());
        }
        let metrics = WorkerMetrics::new().unwrap();
        let pool = WorkerPool::spawn(
            consumers(&broker, 2),
            Arc::new(RecordingHandler::default()),
            metrics.clone(),
        );

        wait_until(&broker, 3).await;
        pool.shutdown().await;

        let b = broker.lock().unwrap();
        assert_eq!(b.dead, vec!["bad-1".to_string()]);
        assert!(b.acked.contains(&"ok-1".to_string()));
        assert!(b.acked.contains(&"flaky-1".to_string()));
        assert_eq!(b.attempts.get("flaky-1"), Some(&1));

        let text = metrics.render().unwrap();
        assert!(text.contains("gradeflow_deliveries_total{outcome=\"requeue\"} 1"));
        assert!(text.contains("gradeflow_deliveries_total{outcome=\"reject\"} 1"));
        assert!(text.contains("gradeflow_deliveries_total{outcome=\"ack\"} 2"));
    }

    #[tokio::test]
    async fn test_idle_pool_shuts_down_promptly() {
        let broker = Arc::new(Mutex::new(Broker::default()));
        let pool = WorkerPool::spawn(
            consumers(&broker, 3),
            Arc::new(RecordingHandler::default()),
            WorkerMetrics::new().unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        pool.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
