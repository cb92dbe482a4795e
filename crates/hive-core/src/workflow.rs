//! Workflow definitions (`workflow.yml`).
//!
//! Only the fields the engine and trigger lifecycle consume are modeled;
//! anything else in the file is ignored.

use crate::types::{LoopConfig, StepKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Upper bound on polling workers per agent role.
pub const MAX_WORKERS: u32 = 32;

/// Retry budget applied when a step does not set one.
pub const DEFAULT_MAX_RETRIES: i64 = 2;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to read workflow: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse workflow: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid workflow {workflow}: {reason}")]
    Invalid { workflow: String, reason: String },
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub polling: Option<PollingConfig>,
    #[serde(default)]
    pub cron: Option<CronConfig>,
    pub agents: Vec<WorkflowAgent>,
    pub steps: Vec<WorkflowStep>,
    /// Seed values merged into every run's context.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "timeoutSeconds")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default, alias = "intervalMs")]
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowAgent {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Number of polling triggers for this role.
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "pollingModel")]
    pub polling_model: Option<String>,
}

fn default_workers() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    /// Agent role id.
    pub agent: String,
    /// Input template with `{{key}}` tokens.
    pub input: String,
    #[serde(default)]
    pub expects: String,
    #[serde(default, rename = "type")]
    pub kind: StepKind,
    #[serde(default, rename = "loop")]
    pub loop_config: Option<LoopConfig>,
    #[serde(default, alias = "maxRetries")]
    pub max_retries: Option<i64>,
}

impl WorkflowStep {
    pub fn max_retries(&self) -> i64 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }
}

impl WorkflowSpec {
    /// Load `workflow.yml` from a workflow directory.
    pub fn load(workflow_dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(workflow_dir.join("workflow.yml"))?;
        Self::parse(&raw)
    }

    /// Parse and validate a workflow definition.
    pub fn parse(raw: &str) -> Result<Self> {
        let spec: Self = serde_yaml::from_str(raw)?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(self.invalid("missing id"));
        }
        if self.agents.is_empty() {
            return Err(self.invalid("missing agents list"));
        }
        if self.steps.is_empty() {
            return Err(self.invalid("missing steps list"));
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(self.invalid("missing agent id"));
            }
            if !agent_ids.insert(agent.id.as_str()) {
                return Err(self.invalid(format!("duplicate agent id \"{}\"", agent.id)));
            }
            if agent.workers == 0 || agent.workers > MAX_WORKERS {
                return Err(self.invalid(format!(
                    "agent \"{}\" workers must be between 1 and {MAX_WORKERS}",
                    agent.id
                )));
            }
        }

        let step_ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        if step_ids.len() != self.steps.len() {
            return Err(self.invalid("duplicate step id"));
        }
        for step in &self.steps {
            if !agent_ids.contains(step.agent.as_str()) {
                return Err(self.invalid(format!(
                    "step \"{}\" references unknown agent \"{}\"",
                    step.id, step.agent
                )));
            }
            if step.max_retries() < 0 {
                return Err(self.invalid(format!("step \"{}\" max_retries is negative", step.id)));
            }
            if step.kind == StepKind::Loop && step.loop_config.is_none() {
                return Err(self.invalid(format!("loop step \"{}\" missing loop config", step.id)));
            }
            if let Some(verify) = step.loop_config.as_ref().and_then(|l| l.verify_step.as_deref())
            {
                if !step_ids.contains(verify) {
                    return Err(self.invalid(format!(
                        "step \"{}\" verify_step \"{verify}\" is not a step",
                        step.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> WorkflowError {
        WorkflowError::Invalid {
            workflow: self.id.clone(),
            reason: reason.into(),
        }
    }

    /// Agent identity as stored on steps: `{workflow}_{role}`.
    pub fn agent_identity(&self, role: &str) -> String {
        format!("{}_{role}", self.id)
    }

    pub fn agent(&self, role: &str) -> Option<&WorkflowAgent> {
        self.agents.iter().find(|a| a.id == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEATURE_DEV: &str = r#"
id: feature-dev
polling:
  model: fast
  timeout_seconds: 90
agents:
  - id: planner
  - id: developer
    workers: 3
  - id: verifier
steps:
  - id: plan
    agent: planner
    input: "Plan {{task}}"
    expects: "STATUS: done"
  - id: implement
    agent: developer
    type: loop
    loop:
      over: stories
      completion: all_done
      verifyEach: true
      verifyStep: verify
    input: "Implement {{current_story}}"
  - id: verify
    agent: verifier
    input: "Verify {{current_story_title}}"
    max_retries: 4
context:
  repo: /src/app
"#;

    #[test]
    fn parses_feature_dev() {
        let spec = WorkflowSpec::parse(FEATURE_DEV).unwrap();
        assert_eq!(spec.id, "feature-dev");
        assert_eq!(spec.agents[1].workers, 3);
        assert_eq!(spec.agents[0].workers, 1);
        assert_eq!(spec.steps[1].kind, StepKind::Loop);
        let loop_config = spec.steps[1].loop_config.as_ref().unwrap();
        assert_eq!(loop_config.verify_gate(), Some("verify"));
        assert_eq!(spec.steps[0].max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(spec.steps[2].max_retries(), 4);
        assert_eq!(spec.context.get("repo").map(String::as_str), Some("/src/app"));
        assert_eq!(spec.agent_identity("developer"), "feature-dev_developer");
        assert_eq!(
            spec.polling.as_ref().and_then(|p| p.timeout_seconds),
            Some(90)
        );
    }

    #[test]
    fn rejects_unknown_agent() {
        let raw = "id: wf\nagents:\n  - id: a\nsteps:\n  - id: s\n    agent: b\n    input: x\n";
        let err = WorkflowSpec::parse(raw).unwrap_err();
        assert!(matches!(err, WorkflowError::Invalid { .. }));
    }

    #[test]
    fn rejects_too_many_workers() {
        let raw = "id: wf\nagents:\n  - id: a\n    workers: 33\nsteps:\n  - id: s\n    agent: a\n    input: x\n";
        assert!(WorkflowSpec::parse(raw).is_err());
    }

    #[test]
    fn rejects_dangling_verify_step() {
        let raw = "id: wf\nagents:\n  - id: a\nsteps:\n  - id: s\n    agent: a\n    input: x\n    type: loop\n    loop:\n      over: stories\n      verify_step: nope\n";
        assert!(WorkflowSpec::parse(raw).is_err());
    }

    #[test]
    fn load_reads_workflow_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("workflow.yml"), FEATURE_DEV).unwrap();
        let spec = WorkflowSpec::load(dir.path()).unwrap();
        assert_eq!(spec.steps.len(), 3);
    }
}
