//! Polling trigger lifecycle.
//!
//! A workflow with running runs has one recurring trigger per agent worker
//! in the external scheduler. Triggers are created when a run starts and
//! removed once the workflow's last running run ends.

use hive_core::events::{EngineEvent, EventType};
use hive_core::prompt::polling_prompt;
use hive_core::{Config, WorkflowSpec};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::{spawn_detached, EventBus, Subscription};
use crate::dispatch::{AgentTurn, DispatchError, ExternalDispatcher, Schedule, TriggerSpec};
use crate::storage::Storage;

/// Offset between the first fire of consecutive agents.
const AGENT_STAGGER_MS: u64 = 60_000;
/// Offset between the first fire of consecutive workers of one agent.
const WORKER_STAGGER_MS: u64 = 10_000;

/// Defaults applied when a workflow does not override them.
#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub prefix: String,
    pub every_ms: u64,
    pub polling_model: String,
    pub polling_timeout_sec: u64,
    /// Bound on each scheduler call.
    pub call_timeout: Duration,
}

impl TriggerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefix: config.trigger_prefix.clone(),
            every_ms: config.poll_every_ms,
            polling_model: config.polling_model.clone(),
            polling_timeout_sec: config.polling_timeout_sec,
            call_timeout: Duration::from_millis(config.dispatch_timeout_ms),
        }
    }
}

pub struct TriggerLifecycle {
    storage: Arc<Storage>,
    dispatcher: Arc<dyn ExternalDispatcher>,
    workflows_dir: PathBuf,
    settings: TriggerSettings,
}

impl std::fmt::Debug for TriggerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerLifecycle")
            .field("workflows_dir", &self.workflows_dir)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TriggerLifecycle {
    pub fn new(
        storage: Arc<Storage>,
        dispatcher: Arc<dyn ExternalDispatcher>,
        workflows_dir: PathBuf,
        settings: TriggerSettings,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            workflows_dir,
            settings,
        }
    }

    /// Name prefix shared by all of a workflow's triggers.
    pub fn workflow_prefix(&self, workflow_id: &str) -> String {
        format!("{}/{workflow_id}/", self.settings.prefix)
    }

    /// One trigger per agent worker, staggered so they do not fire together.
    pub fn trigger_specs(&self, spec: &WorkflowSpec) -> Vec<TriggerSpec> {
        let every_ms = spec
            .cron
            .as_ref()
            .and_then(|c| c.interval_ms)
            .unwrap_or(self.settings.every_ms);
        let workflow_model = spec.polling.as_ref().and_then(|p| p.model.as_deref());
        let timeout_seconds = spec
            .polling
            .as_ref()
            .and_then(|p| p.timeout_seconds)
            .unwrap_or(self.settings.polling_timeout_sec);

        let mut specs = Vec::new();
        for (agent_index, agent) in spec.agents.iter().enumerate() {
            let base = format!("{}{}", self.workflow_prefix(&spec.id), agent.id);
            let model = agent
                .polling_model
                .as_deref()
                .or(workflow_model)
                .unwrap_or(&self.settings.polling_model);
            let message = polling_prompt(&spec.id, &agent.id, agent.model.as_deref());

            for worker in 0..u64::from(agent.workers) {
                let name = if worker == 0 {
                    base.clone()
                } else {
                    format!("{base}#{}", worker + 1)
                };
                specs.push(TriggerSpec {
                    name,
                    schedule: Schedule {
                        every_ms,
                        anchor_ms: agent_index as u64 * AGENT_STAGGER_MS
                            + worker * WORKER_STAGGER_MS,
                    },
                    target_agent: spec.agent_identity(&agent.id),
                    payload: AgentTurn {
                        message: message.clone(),
                        model: model.to_string(),
                        timeout_seconds,
                    },
                });
            }
        }
        specs
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = crate::dispatch::Result<T>>,
    ) -> crate::dispatch::Result<T> {
        let limit = self.settings.call_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| DispatchError::Timeout(limit))?
    }

    /// Create the workflow's triggers unless some already exist. Returns the
    /// number created.
    pub async fn ensure_workflow_triggers(&self, spec: &WorkflowSpec) -> usize {
        let prefix = self.workflow_prefix(&spec.id);
        match self.bounded(self.dispatcher.list_triggers()).await {
            Ok(existing) if existing.iter().any(|t| t.name.starts_with(&prefix)) => {
                return 0;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(workflow = %spec.id, error = %e, "could not list triggers, creating anyway");
            }
        }

        let mut created = 0;
        for trigger in self.trigger_specs(spec) {
            match self.bounded(self.dispatcher.create_trigger(&trigger)).await {
                Ok(id) => {
                    created += 1;
                    info!(workflow = %spec.id, trigger = %trigger.name, id = ?id, "created polling trigger");
                }
                Err(e) => {
                    warn!(workflow = %spec.id, trigger = %trigger.name, error = %e, "failed to create polling trigger");
                }
            }
        }
        created
    }

    /// Remove the workflow's triggers if none of its runs are still
    /// running. Returns the number removed.
    pub async fn teardown_if_idle(&self, workflow_id: &str) -> usize {
        match self.storage.count_running_runs_for_workflow(workflow_id).await {
            Ok(0) => {}
            Ok(_) => return 0,
            Err(e) => {
                warn!(workflow = workflow_id, error = %e, "could not count running runs, keeping triggers");
                return 0;
            }
        }

        let triggers = match self.bounded(self.dispatcher.list_triggers()).await {
            Ok(triggers) => triggers,
            Err(e) => {
                warn!(workflow = workflow_id, error = %e, "could not list triggers for teardown");
                return 0;
            }
        };

        let prefix = self.workflow_prefix(workflow_id);
        let mut removed = 0;
        for trigger in triggers.iter().filter(|t| t.name.starts_with(&prefix)) {
            match self.bounded(self.dispatcher.delete_trigger(&trigger.id)).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(workflow = workflow_id, trigger = %trigger.name, error = %e, "failed to delete polling trigger");
                }
            }
        }
        if removed > 0 {
            info!(workflow = workflow_id, removed, "removed polling triggers");
        }
        removed
    }

    async fn on_run_started(&self, workflow_id: &str) {
        match WorkflowSpec::load(&self.workflows_dir.join(workflow_id)) {
            Ok(spec) => {
                self.ensure_workflow_triggers(&spec).await;
            }
            Err(e) => {
                warn!(workflow = workflow_id, error = %e, "cannot load workflow for trigger setup");
            }
        }
    }

    /// Set up triggers on `run.started` and tear down on run end.
    pub fn subscribe(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        let lifecycle = Arc::clone(self);
        bus.subscribe(move |event: &EngineEvent| -> eyre::Result<()> {
            let workflow_id = event.workflow_id.clone();
            let lifecycle = Arc::clone(&lifecycle);
            match event.event {
                EventType::RunStarted => spawn_detached(async move {
                    lifecycle.on_run_started(&workflow_id).await;
                }),
                kind if kind.is_run_end() => spawn_detached(async move {
                    lifecycle.teardown_if_idle(&workflow_id).await;
                }),
                _ => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WORKFLOW: &str = r#"
id: feature-dev
polling:
  model: fast
agents:
  - id: planner
  - id: developer
    workers: 3
    polling_model: cheap
steps:
  - id: plan
    agent: planner
    input: "Plan {{task}}"
  - id: implement
    agent: developer
    input: "Build {{task}}"
"#;

    async fn lifecycle() -> (TriggerLifecycle, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let settings = TriggerSettings::from_config(&Config::default());
        let dispatcher: Arc<dyn ExternalDispatcher> =
            Arc::new(crate::dispatch::BackendChain::new(Vec::new()));
        let lifecycle = TriggerLifecycle::new(
            Arc::new(storage),
            dispatcher,
            dir.path().to_path_buf(),
            settings,
        );
        (lifecycle, dir)
    }

    #[tokio::test]
    async fn specs_stagger_agents_and_workers() {
        let (lifecycle, _dir) = lifecycle().await;
        let spec = WorkflowSpec::parse(WORKFLOW).unwrap();
        let specs = lifecycle.trigger_specs(&spec);

        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "hive/feature-dev/planner",
                "hive/feature-dev/developer",
                "hive/feature-dev/developer#2",
                "hive/feature-dev/developer#3",
            ]
        );
        let anchors: Vec<u64> = specs.iter().map(|s| s.schedule.anchor_ms).collect();
        assert_eq!(anchors, vec![0, 60_000, 70_000, 80_000]);
        assert!(specs.iter().all(|s| s.schedule.every_ms == 300_000));
        assert_eq!(specs[1].target_agent, "feature-dev_developer");
        assert_eq!(specs[0].payload.timeout_seconds, 120);
    }

    #[tokio::test]
    async fn polling_model_precedence() {
        let (lifecycle, _dir) = lifecycle().await;
        let spec = WorkflowSpec::parse(WORKFLOW).unwrap();
        let specs = lifecycle.trigger_specs(&spec);
        assert_eq!(specs[0].payload.model, "fast");
        assert_eq!(specs[1].payload.model, "cheap");
        assert!(specs[0]
            .payload
            .message
            .contains("hivectl step peek \"feature-dev_planner\""));
    }

    #[tokio::test]
    async fn unavailable_scheduler_is_swallowed() {
        let (lifecycle, _dir) = lifecycle().await;
        let spec = WorkflowSpec::parse(WORKFLOW).unwrap();
        assert_eq!(lifecycle.ensure_workflow_triggers(&spec).await, 0);
        assert_eq!(lifecycle.teardown_if_idle("feature-dev").await, 0);
    }
}
