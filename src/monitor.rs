//! Monitor: detects orphaned steps and redrives them.
//!
//! Every tick it ingests worker heartbeats, sweeps running steps whose lease
//! elapsed, sweeps steps held by workers that stopped heartbeating, and
//! enforces log retention. Each redrive is a single CAS, so monitor replicas
//! race safely: the loser observes zero affected rows and moves on. A step
//! redriven past the limit is failed in place, and the failure is published
//! on `results` so the scheduler settles the run like any other outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Result, STEP_ERROR_INPUT_UNAVAILABLE, STEP_ERROR_LEASE_EXPIRED};
use crate::log::DurableLog;
use crate::messages::{
    Heartbeat, ResultStatus, Task, TaskResult, SUBJECT_HEARTBEATS, SUBJECT_RESULTS,
};
use crate::scheduler::{build_inputs, compute_deadline, SchedulerConfig};
use crate::store::{RunStore, StepOutcome, StepRun, StepStatus};

const MONITOR_CONSUMER: &str = "monitor";

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub tick_interval: Duration,
    /// Redrives allowed before a step is failed with a lease-expiry error.
    pub max_redrives: i32,
    /// Worker heartbeat cadence; liveness window is three of these.
    pub heartbeat_interval: Duration,
    /// Max expired leases processed per tick.
    pub scan_limit: i64,
    /// Max age of log messages before the retention sweep removes them.
    pub retention: Duration,
    pub heartbeat_batch: usize,
    pub visibility: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            max_redrives: 5,
            heartbeat_interval: Duration::from_secs(30),
            scan_limit: 200,
            retention: Duration::from_secs(24 * 60 * 60),
            heartbeat_batch: 256,
            visibility: Duration::from_secs(30),
        }
    }
}

enum RedriveReason {
    LeaseExpired,
    WorkerDead(String),
}

pub struct Monitor {
    store: Arc<dyn RunStore>,
    log: Arc<dyn DurableLog>,
    config: MonitorConfig,
    scheduler_config: SchedulerConfig,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn RunStore>,
        log: Arc<dyn DurableLog>,
        config: MonitorConfig,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            log,
            config,
            scheduler_config,
        }
    }

    /// One full sweep: heartbeats, expired leases, dead workers, retention.
    pub async fn tick(&self) -> Result<()> {
        self.ingest_heartbeats().await?;

        let now = Utc::now();
        let expired = self
            .store
            .expired_leases(now, self.config.scan_limit)
            .await?;
        for step in expired {
            self.redrive(step, RedriveReason::LeaseExpired).await?;
        }

        let window = chrono::Duration::from_std(self.config.heartbeat_interval * 3)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let stale = self.store.stale_workers(now - window).await?;
        for worker_id in stale {
            let held = self.store.steps_running_on(&worker_id).await?;
            if !held.is_empty() {
                warn!(
                    worker_id = %worker_id,
                    steps = held.len(),
                    "worker heartbeat expired, redriving its leases"
                );
            }
            for step in held {
                self.redrive(step, RedriveReason::WorkerDead(worker_id.clone()))
                    .await?;
            }
        }

        let purged = self.log.purge_older_than(self.config.retention).await?;
        if purged > 0 {
            debug!(purged, "log retention sweep");
        }

        Ok(())
    }

    async fn ingest_heartbeats(&self) -> Result<()> {
        let deliveries = self
            .log
            .pull(
                MONITOR_CONSUMER,
                &[SUBJECT_HEARTBEATS.to_string()],
                self.config.heartbeat_batch,
                self.config.visibility,
            )
            .await?;

        for delivery in deliveries {
            match serde_json::from_slice::<Heartbeat>(&delivery.payload) {
                Ok(heartbeat) => {
                    self.store
                        .record_worker_heartbeat(
                            &heartbeat.worker_id,
                            &heartbeat.status,
                            heartbeat.timestamp,
                        )
                        .await?;
                }
                Err(err) => warn!(?err, "dropping undecodable heartbeat"),
            }
            self.log.ack(&delivery).await?;
        }

        Ok(())
    }

    async fn redrive(&self, step: StepRun, reason: RedriveReason) -> Result<()> {
        if step.attempt + 1 > self.config.max_redrives {
            return self.fail_exhausted(step).await;
        }

        let won = match &reason {
            RedriveReason::LeaseExpired => {
                self.store
                    .redrive_expired_step(step.id, Utc::now())
                    .await?
            }
            RedriveReason::WorkerDead(worker_id) => {
                self.store.redrive_worker_step(step.id, worker_id).await?
            }
        };
        let Some(attempt) = won else {
            // another replica already redrove it, or the worker finished
            return Ok(());
        };

        let run = self.store.get_run(step.run_id).await?;
        let spec = self.store.get_spec_by_id(run.workflow_spec_id).await?;
        let Some(node) = spec.dag.node(&step.node_id) else {
            warn!(
                step_id = %step.id,
                node = %step.node_id,
                "redriven step references a node missing from its spec"
            );
            return Ok(());
        };

        let steps = self.store.list_steps(run.id).await?;
        let outputs = self
            .store
            .dependency_outputs(run.id, &node.dependencies)
            .await?;
        let inputs = match build_inputs(&run, node, &outputs) {
            Ok(inputs) => inputs,
            Err(missing) => {
                return self
                    .fail_step(
                        &step,
                        attempt,
                        format!("{STEP_ERROR_INPUT_UNAVAILABLE}: output of '{missing}' is gone"),
                    )
                    .await;
            }
        };

        let outstanding = steps
            .iter()
            .filter(|step| !step.status.is_terminal())
            .count();
        let deadline_at = compute_deadline(&self.scheduler_config, &run, node, outstanding);
        let task = Task {
            id: step.id,
            run_id: run.id,
            node: node.clone(),
            inputs,
            attempt,
            deadline_at,
        };
        let subject = node.tier(&run.metadata.tags).subject();
        let payload = serde_json::to_vec(&task)?;
        self.log.publish(&subject, &payload).await?;

        metrics::counter!("agentflow_steps_redriven_total").increment(1);
        info!(
            step_id = %step.id,
            run_id = %run.id,
            node = %node.id,
            attempt,
            subject = %subject,
            "step redriven"
        );
        Ok(())
    }

    async fn fail_exhausted(&self, step: StepRun) -> Result<()> {
        let error = format!(
            "{STEP_ERROR_LEASE_EXPIRED}: lease expired {} times without completion",
            step.attempt
        );
        self.fail_step(&step, step.attempt + 1, error).await
    }

    /// Fail a step the monitor owns the verdict for, then publish the
    /// failure so the scheduler settles the run.
    async fn fail_step(&self, step: &StepRun, attempt: i32, error: String) -> Result<()> {
        let changed = self
            .store
            .finish_step(&StepOutcome {
                step_id: step.id,
                status: StepStatus::Failed,
                attempt,
                error: Some(error.clone()),
                cost_cents: 0,
                tokens_prompt: 0,
                tokens_completion: 0,
                output: None,
            })
            .await?;
        if !changed {
            return Ok(());
        }

        metrics::counter!("agentflow_steps_failed_by_monitor_total").increment(1);
        warn!(step_id = %step.id, run_id = %step.run_id, %error, "step failed by monitor");

        let result = TaskResult {
            task_id: step.id,
            status: ResultStatus::Failed,
            error,
            cost_cents: 0,
            tokens_prompt: 0,
            tokens_completion: 0,
            output: Value::Null,
        };
        let payload = serde_json::to_vec(&result)?;
        self.log.publish(SUBJECT_RESULTS, &payload).await?;
        Ok(())
    }
}

/// Background sweep loop running [`Monitor::tick`] until shutdown.
pub struct MonitorService {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MonitorService {
    pub fn start(monitor: Arc<Monitor>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(monitor.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("monitor service started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = monitor.tick().await {
                            metrics::counter!("agentflow_monitor_errors_total").increment(1);
                            error!(?err, "monitor tick failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_ok() && *shutdown_rx.borrow() {
                            info!("monitor service shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}
