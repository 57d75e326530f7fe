//! Durable log: subject-scoped, ack-based message bus with redelivery.
//!
//! The log is modeled as a work queue per subject. A `pull` claims messages
//! with a visibility deadline; an unacked claim reappears for the next pull
//! once the deadline elapses, so delivery is at-least-once and consumers must
//! be idempotent. Subjects are pulled in the order given, which is how task
//! tiers get their strict priority.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryLog;
pub use postgres::PostgresLog;

#[derive(Debug, Error)]
pub enum LogError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("{0}")]
    Message(String),
}

pub type LogResult<T> = Result<T, LogError>;

/// One claimed message. Holds everything needed to ack or nak it later.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: Uuid,
    pub subject: String,
    pub payload: Vec<u8>,
    /// How many times this message has been handed out, this claim included.
    pub deliveries: i32,
}

/// Append-only, per-subject queue with explicit acknowledgement.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append a message to `subject`.
    async fn publish(&self, subject: &str, payload: &[u8]) -> LogResult<()>;

    /// Claim up to `max` visible messages across `subjects`, honoring the
    /// subject order as priority. Claimed messages stay invisible for
    /// `visibility`, then are redelivered unless acked.
    async fn pull(
        &self,
        consumer: &str,
        subjects: &[String],
        max: usize,
        visibility: Duration,
    ) -> LogResult<Vec<Delivery>>;

    /// Settle a delivery; the message is never handed out again.
    async fn ack(&self, delivery: &Delivery) -> LogResult<()>;

    /// Return a delivery to the queue, visible again after `delay`.
    async fn nak(&self, delivery: &Delivery, delay: Duration) -> LogResult<()>;

    /// Drop settled messages and anything older than `age`. Returns how many
    /// rows were removed.
    async fn purge_older_than(&self, age: Duration) -> LogResult<u64>;
}
