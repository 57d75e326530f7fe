//! In-memory durable log for tests and single-process runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Delivery, DurableLog, LogError, LogResult};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: Uuid,
    payload: Vec<u8>,
    deliveries: i32,
    visible_at: DateTime<Utc>,
    published_at: DateTime<Utc>,
}

/// Mutex-guarded per-subject queues with the same visibility semantics as
/// the Postgres log: claims are invisible until their deadline, acks remove
/// the message, naks requeue it with a delay.
#[derive(Clone, Default)]
pub struct MemoryLog {
    subjects: Arc<Mutex<HashMap<String, Vec<StoredMessage>>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages on `subject` that are not settled, claimed or not.
    pub fn outstanding(&self, subject: &str) -> usize {
        let subjects = self.subjects.lock().expect("log state poisoned");
        subjects.get(subject).map(Vec::len).unwrap_or(0)
    }

    fn chrono_duration(duration: Duration) -> chrono::Duration {
        chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(0))
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn publish(&self, subject: &str, payload: &[u8]) -> LogResult<()> {
        let now = Utc::now();
        let mut subjects = self.subjects.lock().expect("log state poisoned");
        subjects
            .entry(subject.to_string())
            .or_default()
            .push(StoredMessage {
                id: Uuid::new_v4(),
                payload: payload.to_vec(),
                deliveries: 0,
                visible_at: now,
                published_at: now,
            });
        Ok(())
    }

    async fn pull(
        &self,
        _consumer: &str,
        subjects: &[String],
        max: usize,
        visibility: Duration,
    ) -> LogResult<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let hidden_until = now + Self::chrono_duration(visibility);
        let mut state = self.subjects.lock().expect("log state poisoned");
        let mut claimed = Vec::new();

        for subject in subjects {
            if claimed.len() >= max {
                break;
            }
            let Some(queue) = state.get_mut(subject) else {
                continue;
            };
            for message in queue.iter_mut() {
                if claimed.len() >= max {
                    break;
                }
                if message.visible_at > now {
                    continue;
                }
                message.deliveries += 1;
                message.visible_at = hidden_until;
                claimed.push(Delivery {
                    message_id: message.id,
                    subject: subject.clone(),
                    payload: message.payload.clone(),
                    deliveries: message.deliveries,
                });
            }
        }

        Ok(claimed)
    }

    async fn ack(&self, delivery: &Delivery) -> LogResult<()> {
        let mut state = self.subjects.lock().expect("log state poisoned");
        let queue = state.get_mut(&delivery.subject).ok_or_else(|| {
            LogError::Message(format!("unknown subject '{}'", delivery.subject))
        })?;
        queue.retain(|message| message.id != delivery.message_id);
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> LogResult<()> {
        let visible_at = Utc::now() + Self::chrono_duration(delay);
        let mut state = self.subjects.lock().expect("log state poisoned");
        if let Some(queue) = state.get_mut(&delivery.subject) {
            if let Some(message) = queue
                .iter_mut()
                .find(|message| message.id == delivery.message_id)
            {
                message.visible_at = visible_at;
            }
        }
        Ok(())
    }

    async fn purge_older_than(&self, age: Duration) -> LogResult<u64> {
        let cutoff = Utc::now() - Self::chrono_duration(age);
        let mut removed = 0u64;
        let mut state = self.subjects.lock().expect("log state poisoned");
        for queue in state.values_mut() {
            let before = queue.len();
            queue.retain(|message| message.published_at >= cutoff);
            removed += (before - queue.len()) as u64;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_pull_ack_settles_message() {
        let log = MemoryLog::new();
        log.publish("results", b"one").await.expect("publish");

        let deliveries = log
            .pull("c1", &["results".to_string()], 10, Duration::from_secs(30))
            .await
            .expect("pull");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload, b"one");
        assert_eq!(deliveries[0].deliveries, 1);

        log.ack(&deliveries[0]).await.expect("ack");
        assert_eq!(log.outstanding("results"), 0);
    }

    #[tokio::test]
    async fn claimed_message_is_invisible_until_deadline() {
        let log = MemoryLog::new();
        log.publish("results", b"one").await.expect("publish");

        let first = log
            .pull("c1", &["results".to_string()], 10, Duration::from_secs(30))
            .await
            .expect("pull");
        assert_eq!(first.len(), 1);

        let second = log
            .pull("c2", &["results".to_string()], 10, Duration::from_secs(30))
            .await
            .expect("pull");
        assert!(second.is_empty(), "claimed message leaked to second pull");
    }

    #[tokio::test]
    async fn unacked_claim_is_redelivered_after_visibility() {
        let log = MemoryLog::new();
        log.publish("results", b"one").await.expect("publish");

        let first = log
            .pull("c1", &["results".to_string()], 10, Duration::ZERO)
            .await
            .expect("pull");
        assert_eq!(first.len(), 1);

        // zero visibility: immediately redeliverable
        let second = log
            .pull("c2", &["results".to_string()], 10, Duration::from_secs(30))
            .await
            .expect("pull");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].deliveries, 2);
    }

    #[tokio::test]
    async fn nak_requeues_with_delay() {
        let log = MemoryLog::new();
        log.publish("results", b"one").await.expect("publish");

        let first = log
            .pull("c1", &["results".to_string()], 10, Duration::from_secs(30))
            .await
            .expect("pull");
        log.nak(&first[0], Duration::ZERO).await.expect("nak");

        let second = log
            .pull("c1", &["results".to_string()], 10, Duration::from_secs(30))
            .await
            .expect("pull");
        assert_eq!(second.len(), 1, "naked message should be redeliverable");

        log.publish("results", b"two").await.expect("publish");
        let delayed = log
            .pull("c1", &["results".to_string()], 10, Duration::from_secs(30))
            .await
            .expect("pull");
        assert_eq!(delayed.len(), 1);
        log.nak(&delayed[0], Duration::from_secs(60))
            .await
            .expect("nak");
        let hidden = log
            .pull("c1", &["results".to_string()], 10, Duration::from_secs(30))
            .await
            .expect("pull");
        assert!(hidden.is_empty(), "delayed nak should stay invisible");
    }

    #[tokio::test]
    async fn pull_honors_subject_priority_order() {
        let log = MemoryLog::new();
        log.publish("tasks.Bronze", b"bronze").await.expect("publish");
        log.publish("tasks.Gold", b"gold").await.expect("publish");

        let subjects = vec![
            "tasks.Gold".to_string(),
            "tasks.Silver".to_string(),
            "tasks.Bronze".to_string(),
        ];
        let one = log
            .pull("w", &subjects, 1, Duration::from_secs(30))
            .await
            .expect("pull");
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].subject, "tasks.Gold");

        let two = log
            .pull("w", &subjects, 1, Duration::from_secs(30))
            .await
            .expect("pull");
        assert_eq!(two[0].subject, "tasks.Bronze");
    }

    #[tokio::test]
    async fn purge_drops_old_messages() {
        let log = MemoryLog::new();
        log.publish("results", b"one").await.expect("publish");
        let removed = log.purge_older_than(Duration::ZERO).await.expect("purge");
        assert_eq!(removed, 1);
        assert_eq!(log.outstanding("results"), 0);
    }
}
