//! AgentFlow - a distributed DAG workflow scheduler and worker substrate.
//!
//! Workflows are DAGs of typed nodes. The control-plane scheduler decomposes
//! a submitted run into per-node step records, dispatches ready steps onto
//! tiered task queues over a durable log, and folds worker results back into
//! run state. Workers lease steps, execute them through pluggable executors
//! with bounded retries, and persist outcomes atomically with result
//! publication. A monitor redrives steps whose lease or worker died.
//!
//! ## Components
//!
//! - [`ControlPlane`]: lifecycle object wiring the scheduler and monitor
//! - [`Scheduler`]: run state machine and dispatch
//! - [`Worker`]: pull-based executor loop
//! - [`Monitor`]: orphan detection and redrive
//!
//! ## Persistence
//!
//! - [`store`]: run store behind the [`RunStore`] trait (Postgres via sqlx,
//!   or in-memory)
//! - [`log`]: durable message bus behind the [`DurableLog`] trait, with the
//!   same two backends
//!
//! Delivery is at-least-once everywhere; every state transition is a
//! compare-and-set on the current status, which is what makes redelivery,
//! replica races, and crash recovery converge.

pub mod config;
pub mod control_plane;
pub mod dag;
pub mod error;
pub mod executor;
pub mod log;
pub mod messages;
pub mod monitor;
pub mod observability;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

// Configuration
pub use config::Config;

// Control plane
pub use control_plane::{ControlPlane, SubmitWorkflowRequest};

// Workflow model
pub use dag::{Dag, NodeDef, NodePolicy, NodeType, Tier};
pub use retry::BackoffPolicy;

// Errors
pub use error::{Error, Result};

// Execution
pub use executor::{ExecutionOutput, Executor, ExecutorError, ExecutorSet, FunctionExecutor};

// Messaging
pub use messages::{
    task_subjects, Heartbeat, ResultStatus, Signal, SignalAction, Task, TaskResult,
    SUBJECT_HEARTBEATS, SUBJECT_RESULTS, SUBJECT_SIGNALS,
};

// Persistence
pub use log::{Delivery, DurableLog, LogError, MemoryLog, PostgresLog};
pub use store::{
    MemoryStore, PostgresStore, RunId, RunMetadata, RunStatus, RunStore, SpecId, StepRun,
    StepRunId, StepStatus, StoreError, WorkflowRun, WorkflowSpec,
};

// Components
pub use monitor::{Monitor, MonitorConfig, MonitorService};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerService};
pub use worker::{Worker, WorkerConfig, WorkerHandle};
