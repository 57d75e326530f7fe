//! Control plane lifecycle object.
//!
//! Owns the shared store and log handles plus the scheduler and monitor
//! services, started together and torn down in reverse order. Public control
//! operations (submit, get, list, cancel, spec registration) live here; the
//! external HTTP layer is a thin translation onto them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::dag::Dag;
use crate::error::{Error, Result};
use crate::log::DurableLog;
use crate::messages::{Signal, SignalAction};
use crate::monitor::{Monitor, MonitorConfig, MonitorService};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerService};
use crate::store::{
    RunId, RunMetadata, RunStore, SpecId, WorkflowRun, WorkflowSpec,
};

/// Parameters accepted by [`ControlPlane::submit_workflow`].
#[derive(Debug, Clone, Default)]
pub struct SubmitWorkflowRequest {
    pub name: String,
    pub version: i32,
    pub inputs: Value,
    pub tags: BTreeMap<String, String>,
    pub budget_cents: i64,
    pub deadline_at: Option<DateTime<Utc>>,
}

struct Services {
    scheduler: SchedulerService,
    monitor: MonitorService,
}

pub struct ControlPlane {
    store: Arc<dyn RunStore>,
    log: Arc<dyn DurableLog>,
    scheduler: Arc<Scheduler>,
    monitor: Arc<Monitor>,
    // serializes start/stop against each other; never held across awaits
    running: RwLock<bool>,
    services: Mutex<Option<Services>>,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn RunStore>,
        log: Arc<dyn DurableLog>,
        scheduler_config: SchedulerConfig,
        monitor_config: MonitorConfig,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            log.clone(),
            scheduler_config.clone(),
        ));
        let monitor = Arc::new(Monitor::new(
            store.clone(),
            log.clone(),
            monitor_config,
            scheduler_config,
        ));
        Self {
            store,
            log,
            scheduler,
            monitor,
            running: RwLock::new(false),
            services: Mutex::new(None),
        }
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        self.store.clone()
    }

    pub fn log(&self) -> Arc<dyn DurableLog> {
        self.log.clone()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the scheduler and monitor loops.
    pub fn start(&self) -> anyhow::Result<()> {
        {
            let mut running = self.running.write().expect("running flag poisoned");
            if *running {
                anyhow::bail!("control plane already running");
            }
            *running = true;
        }

        let services = Services {
            scheduler: SchedulerService::start(self.scheduler.clone()),
            monitor: MonitorService::start(self.monitor.clone()),
        };
        *self.services.lock().expect("services poisoned") = Some(services);

        info!("control plane started");
        Ok(())
    }

    /// Stop the loops, monitor first, then scheduler.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        {
            let mut running = self.running.write().expect("running flag poisoned");
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        let services = self.services.lock().expect("services poisoned").take();
        if let Some(services) = services {
            services.monitor.shutdown().await;
            services.scheduler.shutdown().await;
        }

        info!("control plane shutdown complete");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        *self.running.read().expect("running flag poisoned")
    }

    // ------------------------------------------------------------------
    // Workflow specs
    // ------------------------------------------------------------------

    /// Validate and persist a new spec version.
    pub async fn register_workflow_spec(
        &self,
        name: &str,
        version: i32,
        dag: Dag,
        metadata: Value,
        org_id: Option<Uuid>,
    ) -> Result<WorkflowSpec> {
        dag.validate().map_err(|err| Error::InvalidSpec(err.0))?;

        let spec = WorkflowSpec {
            id: SpecId::new(),
            org_id,
            name: name.to_string(),
            version,
            dag,
            metadata,
            created_at: Utc::now(),
        };
        self.store.create_spec(&spec).await?;
        info!(spec = %spec.name, version = spec.version, "workflow spec registered");
        Ok(spec)
    }

    pub async fn get_workflow_spec(&self, name: &str, version: i32) -> Result<WorkflowSpec> {
        Ok(self.store.get_spec(name, version).await?)
    }

    pub async fn list_workflow_specs(&self) -> Result<Vec<WorkflowSpec>> {
        Ok(self.store.list_specs().await?)
    }

    // ------------------------------------------------------------------
    // Workflow runs
    // ------------------------------------------------------------------

    /// Create and admit a run of `(name, version)`.
    pub async fn submit_workflow(&self, req: SubmitWorkflowRequest) -> Result<WorkflowRun> {
        let spec = self.store.get_spec(&req.name, req.version).await?;
        let run = WorkflowRun::new(
            spec.id,
            RunMetadata {
                inputs: req.inputs,
                tags: req.tags,
                budget_cents: req.budget_cents,
                deadline_at: req.deadline_at,
            },
        );
        self.scheduler.submit_run(&run, &spec).await?;
        Ok(self.store.get_run(run.id).await?)
    }

    pub async fn get_workflow_run(&self, run_id: RunId) -> Result<WorkflowRun> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn list_workflow_runs(&self, limit: i64) -> Result<Vec<WorkflowRun>> {
        Ok(self.store.list_runs(limit).await?)
    }

    /// Cancel a run in `queued|running`; `AlreadyTerminal` otherwise.
    pub async fn cancel_workflow_run(&self, run_id: RunId) -> Result<()> {
        let changed = self
            .scheduler
            .on_signal(&Signal {
                run_id,
                action: SignalAction::Cancel,
            })
            .await?;
        if !changed {
            return Err(Error::AlreadyTerminal(format!("workflow run {run_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dag::{NodeDef, NodePolicy, NodeType};
    use crate::log::MemoryLog;
    use crate::store::{MemoryStore, RunStatus};

    fn control_plane() -> ControlPlane {
        ControlPlane::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLog::new()),
            SchedulerConfig::default(),
            MonitorConfig::default(),
        )
    }

    fn single_node_dag() -> Dag {
        Dag::new(vec![NodeDef {
            id: "a".to_string(),
            node_type: NodeType::Function,
            dependencies: vec![],
            policy: NodePolicy::default(),
            params: json!({"function": "noop"}),
            continue_on_failure: false,
        }])
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let cp = control_plane();
        cp.start().expect("start");
        assert!(cp.is_running());
        assert!(cp.start().is_err());
        cp.shutdown().await.expect("shutdown");
        assert!(!cp.is_running());
        // shutdown is idempotent
        cp.shutdown().await.expect("shutdown again");
    }

    #[tokio::test]
    async fn register_and_submit_roundtrip() {
        let cp = control_plane();
        cp.register_workflow_spec("wf", 1, single_node_dag(), json!({}), None)
            .await
            .expect("register");

        let run = cp
            .submit_workflow(SubmitWorkflowRequest {
                name: "wf".to_string(),
                version: 1,
                inputs: json!({"q": 42}),
                budget_cents: 1_000,
                ..SubmitWorkflowRequest::default()
            })
            .await
            .expect("submit");

        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.metadata.budget_cents, 1_000);
        let fetched = cp.get_workflow_run(run.id).await.expect("get");
        assert_eq!(fetched.id, run.id);
        assert_eq!(cp.list_workflow_runs(10).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_spec_version_is_rejected() {
        let cp = control_plane();
        cp.register_workflow_spec("wf", 1, single_node_dag(), json!({}), None)
            .await
            .expect("register");
        let err = cp
            .register_workflow_spec("wf", 1, single_node_dag(), json!({}), None)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn submit_unknown_spec_is_not_found() {
        let cp = control_plane();
        let err = cp
            .submit_workflow(SubmitWorkflowRequest {
                name: "ghost".to_string(),
                version: 1,
                ..SubmitWorkflowRequest::default()
            })
            .await
            .expect_err("missing spec");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_twice_reports_already_terminal() {
        let cp = control_plane();
        cp.register_workflow_spec("wf", 1, single_node_dag(), json!({}), None)
            .await
            .expect("register");
        let run = cp
            .submit_workflow(SubmitWorkflowRequest {
                name: "wf".to_string(),
                version: 1,
                ..SubmitWorkflowRequest::default()
            })
            .await
            .expect("submit");

        cp.cancel_workflow_run(run.id).await.expect("cancel");
        let err = cp
            .cancel_workflow_run(run.id)
            .await
            .expect_err("second cancel");
        assert!(matches!(err, Error::AlreadyTerminal(_)));

        let stored = cp.get_workflow_run(run.id).await.expect("get");
        assert_eq!(stored.status, RunStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_unknown_run_is_not_found() {
        let cp = control_plane();
        let err = cp
            .cancel_workflow_run(RunId::new())
            .await
            .expect_err("unknown run");
        assert!(matches!(err, Error::NotFound(_)));
    }
}
