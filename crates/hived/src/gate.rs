//! Immediate handoff.
//!
//! When a step becomes pending, fire the owning agent's polling trigger now
//! instead of waiting for its next interval. Everything here is best effort:
//! failures are logged and the engine never waits on it.

use hive_core::events::{EngineEvent, EventType};
use hive_core::{Id, RunStatus, StepStatus};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::{spawn_detached, EventBus, Subscription};
use crate::dispatch::{DispatchError, ExternalDispatcher, TriggerInfo};
use crate::storage::{Storage, StorageError};

/// What [`DispatchGate::handle`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// Another handler for the same step is still running.
    InFlight,
    /// Step or run no longer eligible, or lookup failed.
    Ineligible,
    /// This `updated_at` was already dispatched.
    AlreadyKicked,
    /// No trigger matched, or none could be fired.
    NoTrigger { name: String },
    Kicked { trigger_id: String },
}

/// Per-process dedup state plus the dispatcher it guards.
pub struct DispatchGate {
    storage: Arc<Storage>,
    dispatcher: Arc<dyn ExternalDispatcher>,
    prefix: String,
    timeout: Duration,
    in_flight: Mutex<HashSet<Id>>,
    versions: Mutex<HashMap<Id, i64>>,
}

impl std::fmt::Debug for DispatchGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchGate")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Removes a step from the in-flight set when dropped.
struct InFlightGuard<'a> {
    gate: &'a DispatchGate,
    step_id: Id,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gate
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.step_id);
    }
}

impl DispatchGate {
    pub fn new(
        storage: Arc<Storage>,
        dispatcher: Arc<dyn ExternalDispatcher>,
        prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            prefix: prefix.into(),
            timeout,
            in_flight: Mutex::new(HashSet::new()),
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// React to `step.pending` events until [`Subscription::unsubscribe`]
    /// is called. Steps that finish are dropped from the version gate.
    pub fn subscribe(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        let gate = Arc::clone(self);
        bus.subscribe(move |event: &EngineEvent| -> eyre::Result<()> {
            let Some(step_id) = event.step_id.clone() else {
                return Ok(());
            };
            match event.event {
                EventType::StepPending => {}
                EventType::StepDone | EventType::StepFailed => {
                    gate.forget(&step_id);
                    return Ok(());
                }
                _ => return Ok(()),
            }
            let gate = Arc::clone(&gate);
            spawn_detached(async move {
                gate.handle(&step_id).await;
            })
        })
    }

    fn enter(&self, step_id: &Id) -> Option<InFlightGuard<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step_id.clone());
        inserted.then(|| InFlightGuard {
            gate: self,
            step_id: step_id.clone(),
        })
    }

    /// Record `updated_at_ms` for the step. True only the first time a
    /// given value is seen.
    pub fn should_kick(&self, step_id: &Id, updated_at_ms: i64) -> bool {
        let mut versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        if versions.get(step_id) == Some(&updated_at_ms) {
            return false;
        }
        versions.insert(step_id.clone(), updated_at_ms);
        true
    }

    /// Stop tracking a step that can no longer become pending.
    pub fn forget(&self, step_id: &Id) {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(step_id);
    }

    /// Number of steps the version gate currently remembers.
    pub fn tracked_versions(&self) -> usize {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = crate::dispatch::Result<T>>,
    ) -> crate::dispatch::Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| DispatchError::Timeout(self.timeout))?
    }

    /// Try to fire the trigger for a freshly pending step.
    pub async fn handle(&self, step_id: &Id) -> Handoff {
        let Some(_guard) = self.enter(step_id) else {
            debug!(step_id = %step_id, "handoff already in flight");
            return Handoff::InFlight;
        };

        let step = match self.storage.get_step(step_id).await {
            Ok(step) => step,
            Err(StorageError::StepNotFound(_)) => {
                self.forget(step_id);
                return Handoff::Ineligible;
            }
            Err(e) => {
                warn!(step_id = %step_id, error = %e, "handoff could not load step");
                return Handoff::Ineligible;
            }
        };
        let run = match self.storage.get_run(&step.run_id).await {
            Ok(run) => run,
            Err(e) => {
                warn!(step_id = %step_id, error = %e, "handoff could not load run");
                return Handoff::Ineligible;
            }
        };
        if step.status != StepStatus::Pending || run.status != RunStatus::Running {
            if matches!(step.status, StepStatus::Done | StepStatus::Failed) || run.status.is_terminal() {
                self.forget(step_id);
            }
            debug!(step_id = %step_id, status = step.status.as_str(), "step no longer eligible for handoff");
            return Handoff::Ineligible;
        }

        if !self.should_kick(step_id, step.updated_at.timestamp_millis()) {
            debug!(step_id = %step_id, "handoff already issued for this version");
            return Handoff::AlreadyKicked;
        }

        let name = trigger_name(&self.prefix, &run.workflow_id, &step.agent_id);
        let triggers = match self.bounded(self.dispatcher.list_triggers()).await {
            Ok(triggers) => triggers,
            Err(e) => {
                warn!(step_id = %step_id, trigger = %name, error = %e, "handoff could not list triggers");
                return Handoff::NoTrigger { name };
            }
        };

        for trigger in matching(&triggers, &name) {
            match self.bounded(self.dispatcher.run_trigger_now(&trigger.id)).await {
                Ok(()) => {
                    info!(step_id = %step_id, trigger = %trigger.name, "handoff fired trigger");
                    return Handoff::Kicked {
                        trigger_id: trigger.id.clone(),
                    };
                }
                Err(e) => {
                    warn!(step_id = %step_id, trigger = %trigger.name, error = %e, "handoff trigger failed");
                }
            }
        }

        debug!(step_id = %step_id, trigger = %name, "no trigger fired");
        Handoff::NoTrigger { name }
    }
}

/// `{prefix}/{workflow}/{role}` for an agent identity, ignoring any
/// `@run:` scope and the `{workflow}_` prefix.
pub fn trigger_name(prefix: &str, workflow_id: &str, agent_id: &str) -> String {
    let unscoped = agent_id.split_once("@run:").map_or(agent_id, |(agent, _)| agent);
    let role = unscoped
        .strip_prefix(workflow_id)
        .and_then(|rest| rest.strip_prefix('_'))
        .unwrap_or(unscoped);
    format!("{prefix}/{workflow_id}/{role}")
}

/// Triggers named exactly `name` or `name#N`.
fn matching<'a>(triggers: &'a [TriggerInfo], name: &'a str) -> impl Iterator<Item = &'a TriggerInfo> {
    triggers.iter().filter(move |t| {
        t.name == name
            || t.name
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('#'))
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, name: &str) -> TriggerInfo {
        TriggerInfo {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn trigger_name_strips_scope_and_workflow() {
        assert_eq!(
            trigger_name("hive", "feature-dev", "feature-dev_developer@run:run-1"),
            "hive/feature-dev/developer"
        );
        assert_eq!(
            trigger_name("hive", "feature-dev", "feature-dev_developer"),
            "hive/feature-dev/developer"
        );
        assert_eq!(trigger_name("hive", "wf", "other"), "hive/wf/other");
    }

    #[test]
    fn matching_accepts_worker_suffixes_only() {
        let triggers = vec![
            info("1", "hive/wf/dev"),
            info("2", "hive/wf/dev#2"),
            info("3", "hive/wf/developer"),
            info("4", "hive/wf/dev#x"),
            info("5", "hive/wf/dev#"),
        ];
        let ids: Vec<&str> = matching(&triggers, "hive/wf/dev")
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
