//! Orchestration engine.
//!
//! Owns the run/step/story state machine. Every public operation runs in one
//! SQLite transaction behind `write_lock`; events are published on the bus
//! only after the transaction commits.

use chrono::{DateTime, Utc};
use hive_core::decode::{self, Context};
use hive_core::events::{EngineEvent, EventType};
use hive_core::output::{self, ParsedOutput, StoryInput};
use hive_core::workflow::{WorkflowSpec, DEFAULT_MAX_RETRIES};
use hive_core::{
    template, Id, LoopConfig, Run, RunStatus, Step, StepKind, StepStatus, Story, StoryStatus,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::storage::{Storage, StorageError, Tx};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid state transition for step {step_id}: {status} -> {action}")]
    InvalidTransition {
        step_id: String,
        status: String,
        action: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Outcome of [`Engine::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    NotFound,
    Found(ClaimedStep),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimedStep {
    pub step_id: Id,
    pub run_id: Id,
    /// Input template resolved against the run context.
    pub input: String,
    /// Story being worked, for loop steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_id: Option<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompleteResult {
    /// The next pipeline step was promoted to pending.
    pub advanced: bool,
    pub run_completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailResult {
    pub retrying: bool,
    pub run_failed: bool,
}

const CONTINUE: CompleteResult = CompleteResult {
    advanced: false,
    run_completed: false,
};

/// The orchestration engine.
pub struct Engine {
    storage: Arc<Storage>,
    bus: EventBus,
    /// Serializes writers so claim compare-and-set is never contended.
    write_lock: Mutex<()>,
    stale_after: chrono::Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(storage: Arc<Storage>, bus: EventBus, stale_after: chrono::Duration) -> Self {
        Self {
            storage,
            bus,
            write_lock: Mutex::new(()),
            stale_after,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Create a run for `spec`: first step pending, the rest waiting.
    pub async fn start_run(
        &self,
        spec: &WorkflowSpec,
        task: &str,
        notify_url: Option<String>,
    ) -> Result<Run> {
        let _guard = self.write_lock.lock().await;
        let mut txn = Txn::begin(&self.storage).await?;
        let now = txn.now;

        let mut context = Context::new();
        context.insert("task".to_string(), task.to_string());
        for (key, value) in &spec.context {
            context.insert(key.to_lowercase(), value.clone());
        }

        let run = Run {
            id: Id::new(),
            run_number: txn.tx.next_run_number().await?,
            workflow_id: spec.id.clone(),
            task: task.to_string(),
            status: RunStatus::Running,
            context_json: decode::encode_context(&context),
            notify_url,
            created_at: now,
            updated_at: now,
        };
        txn.tx.insert_run(&run).await?;
        txn.push(&run, EventType::RunStarted, None, None);

        for (index, ws) in spec.steps.iter().enumerate() {
            let status = if index == 0 {
                StepStatus::Pending
            } else {
                StepStatus::Waiting
            };
            let loop_config_json = ws
                .loop_config
                .as_ref()
                .and_then(|c| serde_json::to_string(c).ok());
            let step = Step {
                id: Id::new(),
                run_id: run.id.clone(),
                step_key: ws.id.clone(),
                agent_id: format!("{}@run:{}", spec.agent_identity(&ws.agent), run.id),
                step_index: index as i64,
                input_template: ws.input.clone(),
                expects: ws.expects.clone(),
                status,
                retry_count: 0,
                max_retries: ws.max_retries(),
                kind: ws.kind,
                loop_config_json,
                current_story_id: None,
                output: None,
                created_at: now,
                updated_at: now,
            };
            txn.tx.insert_step(&step).await?;
            if status == StepStatus::Pending {
                txn.push(&run, EventType::StepPending, Some(&step.id), None);
            }
        }

        txn.commit(&self.bus).await?;
        info!(run_id = %run.id, workflow = %run.workflow_id, run_number = run.run_number, "run started");
        Ok(run)
    }

    /// Whether a claimable step exists for `agent_id`. Read-only.
    pub async fn peek(&self, agent_id: &str) -> Result<bool> {
        Ok(self.storage.has_pending_step(agent_id).await?)
    }

    /// Reclaim stale work, then claim the oldest pending step for `agent_id`.
    pub async fn claim(&self, agent_id: &str) -> Result<Claim> {
        let _guard = self.write_lock.lock().await;
        let mut txn = Txn::begin(&self.storage).await?;

        self.reclaim_stale(&mut txn).await?;

        // A loop step with nothing left to iterate is finalized rather than
        // handed out, so keep selecting until a real claim or nothing.
        let claimed = loop {
            let Some(step) = txn.tx.next_pending_step(agent_id).await? else {
                break None;
            };
            if let Some(claimed) = self.claim_step(&mut txn, step).await? {
                break Some(claimed);
            }
        };

        txn.commit(&self.bus).await?;
        match claimed {
            Some(claimed) => {
                info!(step_id = %claimed.step_id, run_id = %claimed.run_id, agent = agent_id, "step claimed");
                Ok(Claim::Found(claimed))
            }
            None => {
                debug!(agent = agent_id, "no work");
                Ok(Claim::NotFound)
            }
        }
    }

    /// Record a step's output and advance the state machine.
    pub async fn complete(&self, step_id: &Id, raw_output: &str) -> Result<CompleteResult> {
        let _guard = self.write_lock.lock().await;
        let mut txn = Txn::begin(&self.storage).await?;

        let mut step = txn.tx.get_step(step_id).await?;
        let mut scope = RunScope::load(&mut txn.tx, &step.run_id).await?;
        if step.status != StepStatus::Running || scope.run.status != RunStatus::Running {
            return Err(invalid(&step, "done"));
        }
        // The story's report is already in; the verify step owns it now.
        if step.kind == StepKind::Loop && self.awaiting_verification(&mut txn.tx, &step).await? {
            return Err(invalid(&step, "done"));
        }

        let parsed = output::parse(raw_output);
        scope.merge(&parsed);
        step.output = Some(raw_output.to_string());
        if let Some(stories) = &parsed.stories {
            self.ingest_stories(&mut txn, &scope, stories).await?;
        }

        let result = if let Some((loop_step, config)) =
            self.verify_owner(&mut txn.tx, &step).await?
        {
            self.complete_verify(&mut txn, &mut scope, step, loop_step, &config, &parsed, raw_output)
                .await?
        } else if step.kind == StepKind::Loop {
            match decode::loop_config(step.loop_config_json.as_deref()) {
                Some(config) => {
                    self.complete_loop(&mut txn, &mut scope, step, &config, &parsed, raw_output)
                        .await?
                }
                None => {
                    warn!(step_id = %step.id, run_id = %scope.run.id, "undecodable loop config, completing run");
                    txn.set_step(&scope.run, &mut step, StepStatus::Done).await?;
                    txn.complete_run(&mut scope.run);
                    CompleteResult {
                        advanced: false,
                        run_completed: true,
                    }
                }
            }
        } else {
            txn.set_step(&scope.run, &mut step, StepStatus::Done).await?;
            self.advance_pipeline(&mut txn, &mut scope, &step).await?
        };

        scope.save(&mut txn).await?;
        txn.commit(&self.bus).await?;
        info!(step_id = %step_id, advanced = result.advanced, run_completed = result.run_completed, "step completed");
        Ok(result)
    }

    /// Record a failure; retry within budget, otherwise fail the run.
    pub async fn fail(&self, step_id: &Id, error: &str) -> Result<FailResult> {
        let _guard = self.write_lock.lock().await;
        let mut txn = Txn::begin(&self.storage).await?;

        let mut step = txn.tx.get_step(step_id).await?;
        let mut scope = RunScope::load(&mut txn.tx, &step.run_id).await?;
        if step.status != StepStatus::Running || scope.run.status != RunStatus::Running {
            return Err(invalid(&step, "failed"));
        }
        // The story's report is already in; the verify step owns it now.
        if step.kind == StepKind::Loop && self.awaiting_verification(&mut txn.tx, &step).await? {
            return Err(invalid(&step, "failed"));
        }
        step.output = Some(error.to_string());

        let story = match (step.kind, step.current_story_id.take()) {
            (StepKind::Loop, Some(story_id)) => Some(txn.tx.get_story(&story_id).await?),
            _ => None,
        };

        let exhausted = if let Some(mut story) = story {
            story.retry_count += 1;
            story.output = Some(error.to_string());
            step.retry_count = story.retry_count;
            let exhausted = story.retry_count > story.max_retries;
            let status = if exhausted {
                StoryStatus::Failed
            } else {
                StoryStatus::Pending
            };
            txn.set_story(&scope.run, &mut story, status).await?;
            exhausted
        } else {
            step.retry_count += 1;
            step.retry_count > step.max_retries
        };

        let result = if exhausted {
            txn.set_step(&scope.run, &mut step, StepStatus::Failed).await?;
            txn.fail_run(&mut scope.run, error);
            warn!(step_id = %step.id, run_id = %scope.run.id, retries = step.retry_count, "retry budget exhausted, run failed");
            FailResult {
                retrying: false,
                run_failed: true,
            }
        } else {
            txn.set_step(&scope.run, &mut step, StepStatus::Pending).await?;
            info!(step_id = %step.id, retry = step.retry_count, max = step.max_retries, "step will retry");
            FailResult {
                retrying: true,
                run_failed: false,
            }
        };

        scope.save(&mut txn).await?;
        txn.commit(&self.bus).await?;
        Ok(result)
    }

    // --- Claim internals ---

    /// Reset running steps of running runs that have gone stale.
    async fn reclaim_stale(&self, txn: &mut Txn) -> Result<()> {
        let cutoff = txn.now - self.stale_after;
        let stale = txn.tx.stale_running_steps(cutoff).await?;

        for mut step in stale {
            let mut scope = RunScope::load(&mut txn.tx, &step.run_id).await?;
            if scope.run.status != RunStatus::Running {
                // An earlier step of this run failed it during this sweep.
                continue;
            }

            if step.kind == StepKind::Loop && self.awaiting_verification(&mut txn.tx, &step).await? {
                continue;
            }

            if let Some(story_id) = step.current_story_id.take() {
                let mut story = txn.tx.get_story(&story_id).await?;
                story.retry_count += 1;
                if story.retry_count > story.max_retries {
                    txn.set_story(&scope.run, &mut story, StoryStatus::Failed).await?;
                    txn.set_step(&scope.run, &mut step, StepStatus::Failed).await?;
                    txn.fail_run(&mut scope.run, "story abandoned past retry budget");
                    scope.save(txn).await?;
                    warn!(step_id = %step.id, story_id = %story.id, "stale story out of retries, run failed");
                    continue;
                }
                txn.set_story(&scope.run, &mut story, StoryStatus::Pending).await?;
            }

            txn.push(&scope.run, EventType::StepReclaimed, Some(&step.id), None);
            txn.set_step(&scope.run, &mut step, StepStatus::Pending).await?;
            warn!(step_id = %step.id, run_id = %step.run_id, "reclaimed stale step");
        }
        Ok(())
    }

    /// A loop step whose verify step is pending or running is waiting on
    /// verification, not abandoned.
    async fn awaiting_verification(&self, tx: &mut Tx, step: &Step) -> Result<bool> {
        let Some(config) = decode::loop_config(step.loop_config_json.as_deref()) else {
            return Ok(false);
        };
        let Some(verify_key) = config.verify_gate() else {
            return Ok(false);
        };
        Ok(tx
            .step_by_key(&step.run_id, verify_key)
            .await?
            .is_some_and(|v| matches!(v.status, StepStatus::Pending | StepStatus::Running)))
    }

    /// Claim one pending step. Returns `None` if the step turned out to have
    /// nothing to hand out.
    async fn claim_step(&self, txn: &mut Txn, mut step: Step) -> Result<Option<ClaimedStep>> {
        if !txn.tx.claim_step(&step.id, txn.now).await? {
            return Ok(None);
        }
        step.status = StepStatus::Running;
        step.updated_at = txn.now;

        let mut scope = RunScope::load(&mut txn.tx, &step.run_id).await?;
        let mut story_id = None;

        let config = decode::loop_config(step.loop_config_json.as_deref());
        if let Some(config) = config.filter(|c| step.kind == StepKind::Loop && c.over == "stories")
        {
            let Some(mut story) = txn
                .tx
                .first_story_with_status(&step.run_id, StoryStatus::Pending)
                .await?
            else {
                info!(step_id = %step.id, "no pending stories, finishing loop");
                self.finish_loop(txn, &mut scope, step, &config).await?;
                scope.save(txn).await?;
                return Ok(None);
            };

            txn.set_story(&scope.run, &mut story, StoryStatus::Running).await?;
            step.current_story_id = Some(story.id.clone());
            txn.tx.save_step(&step).await?;
            self.expose_story(txn, &mut scope, &story).await?;
            story_id = Some(story.id);
        }

        txn.push(&scope.run, EventType::StepRunning, Some(&step.id), story_id.as_ref());
        let input = template::resolve(&step.input_template, &scope.ctx);
        scope.save(txn).await?;

        Ok(Some(ClaimedStep {
            step_id: step.id,
            run_id: step.run_id,
            input,
            story_id,
        }))
    }

    /// Write the current story into the run context so the loop step and
    /// its verify step can both template against it.
    async fn expose_story(&self, txn: &mut Txn, scope: &mut RunScope, story: &Story) -> Result<()> {
        let stories = txn.tx.list_stories(&story.run_id).await?;
        let done: Vec<String> = stories
            .iter()
            .filter(|s| s.status == StoryStatus::Done)
            .map(|s| format!("{}: {}", s.story_key, s.title))
            .collect();
        let remaining = stories
            .iter()
            .filter(|s| s.status == StoryStatus::Pending)
            .count();

        let criteria = decode::acceptance_criteria(Some(&story.acceptance_criteria_json));
        let mut current = format!("{}: {}", story.story_key, story.title);
        if !story.description.is_empty() {
            current.push_str("\n\n");
            current.push_str(&story.description);
        }
        if !criteria.is_empty() {
            current.push_str("\n\nAcceptance criteria:");
            for (n, item) in criteria.iter().enumerate() {
                current.push_str(&format!("\n{}. {item}", n + 1));
            }
        }

        scope.set("current_story", current);
        scope.set("current_story_id", story.story_key.clone());
        scope.set("current_story_title", story.title.clone());
        scope.set(
            "completed_stories",
            if done.is_empty() {
                "(none)".to_string()
            } else {
                done.join("\n")
            },
        );
        scope.set("stories_remaining", remaining.to_string());
        scope.set("progress", format!("{}/{}", done.len(), stories.len()));
        if !scope.ctx.contains_key("verify_feedback") {
            scope.set("verify_feedback", String::new());
        }
        Ok(())
    }

    // --- Completion internals ---

    /// The loop step whose verify-each gate names `step`, if any.
    async fn verify_owner(&self, tx: &mut Tx, step: &Step) -> Result<Option<(Step, LoopConfig)>> {
        let steps = tx.list_steps(&step.run_id).await?;
        Ok(steps.into_iter().find_map(|candidate| {
            if candidate.id == step.id || candidate.kind != StepKind::Loop {
                return None;
            }
            let config = decode::loop_config(candidate.loop_config_json.as_deref())?;
            (config.verify_gate() == Some(step.step_key.as_str())).then_some((candidate, config))
        }))
    }

    /// A loop step finished its current story.
    async fn complete_loop(
        &self,
        txn: &mut Txn,
        scope: &mut RunScope,
        mut step: Step,
        config: &LoopConfig,
        parsed: &ParsedOutput,
        raw_output: &str,
    ) -> Result<CompleteResult> {
        let Some(story_id) = step.current_story_id.clone() else {
            return self.continue_loop(txn, scope, step, config).await;
        };
        let mut story = txn.tx.get_story(&story_id).await?;
        story.output = Some(raw_output.to_string());

        if let Some(verify_key) = config.verify_gate() {
            if let Some(mut verify) = txn.tx.step_by_key(&step.run_id, verify_key).await? {
                // Provisionally done; the verify step decides.
                txn.set_story(&scope.run, &mut story, StoryStatus::Done).await?;
                step.updated_at = txn.now;
                txn.tx.save_step(&step).await?;
                verify.output = None;
                txn.set_step(&scope.run, &mut verify, StepStatus::Pending).await?;
                return Ok(CONTINUE);
            }
            warn!(step_id = %step.id, verify_step = verify_key, "verify step missing, loop self-reports");
        }

        if reports_done(parsed) {
            txn.set_story(&scope.run, &mut story, StoryStatus::Done).await?;
            step.current_story_id = None;
            self.continue_loop(txn, scope, step, config).await
        } else {
            let feedback = feedback(parsed, raw_output);
            self.retry_story(txn, scope, step, story, None, &feedback).await
        }
    }

    /// A verify step judged the loop step's current story.
    #[allow(clippy::too_many_arguments)]
    async fn complete_verify(
        &self,
        txn: &mut Txn,
        scope: &mut RunScope,
        mut verify: Step,
        mut loop_step: Step,
        config: &LoopConfig,
        parsed: &ParsedOutput,
        raw_output: &str,
    ) -> Result<CompleteResult> {
        let story = match loop_step.current_story_id.take() {
            Some(id) => Some(txn.tx.get_story(&id).await?),
            None => txn.tx.last_done_story(&loop_step.run_id).await?,
        };

        if reports_done(parsed) {
            scope.set("verify_feedback", String::new());
            if let Some(mut story) = story {
                if story.status != StoryStatus::Done {
                    txn.set_story(&scope.run, &mut story, StoryStatus::Done).await?;
                }
            }
            txn.set_step(&scope.run, &mut verify, StepStatus::Waiting).await?;
            return self.continue_loop(txn, scope, loop_step, config).await;
        }

        let feedback = feedback(parsed, raw_output);
        match story {
            Some(story) => {
                self.retry_story(txn, scope, loop_step, story, Some(verify), &feedback)
                    .await
            }
            None => {
                // Nothing to send back; record the feedback and let the loop
                // decide from its remaining stories.
                warn!(step_id = %verify.id, "verify retry with no story to retry");
                scope.set_feedback(&feedback);
                txn.set_step(&scope.run, &mut verify, StepStatus::Waiting).await?;
                self.continue_loop(txn, scope, loop_step, config).await
            }
        }
    }

    /// Send a story back for another attempt, or fail the run when its
    /// budget is spent.
    async fn retry_story(
        &self,
        txn: &mut Txn,
        scope: &mut RunScope,
        mut loop_step: Step,
        mut story: Story,
        verify: Option<Step>,
        feedback: &str,
    ) -> Result<CompleteResult> {
        story.retry_count += 1;
        loop_step.current_story_id = None;
        scope.set_feedback(feedback);

        if let Some(mut verify) = verify {
            txn.set_step(&scope.run, &mut verify, StepStatus::Waiting).await?;
        }

        if story.retry_count > story.max_retries {
            txn.set_story(&scope.run, &mut story, StoryStatus::Failed).await?;
            txn.set_step(&scope.run, &mut loop_step, StepStatus::Failed).await?;
            txn.fail_run(&mut scope.run, feedback);
            warn!(story_id = %story.id, retries = story.retry_count, "story out of retries, run failed");
            return Ok(CONTINUE);
        }

        txn.set_story(&scope.run, &mut story, StoryStatus::Pending).await?;
        txn.set_step(&scope.run, &mut loop_step, StepStatus::Pending).await?;
        info!(story_id = %story.id, retry = story.retry_count, "story sent back for retry");
        Ok(CONTINUE)
    }

    /// After a story is done: hand out the next one or finish the loop.
    async fn continue_loop(
        &self,
        txn: &mut Txn,
        scope: &mut RunScope,
        mut loop_step: Step,
        config: &LoopConfig,
    ) -> Result<CompleteResult> {
        loop_step.current_story_id = None;
        let next = txn
            .tx
            .first_story_with_status(&loop_step.run_id, StoryStatus::Pending)
            .await?;
        if next.is_some() {
            txn.set_step(&scope.run, &mut loop_step, StepStatus::Pending).await?;
            return Ok(CONTINUE);
        }
        self.finish_loop(txn, scope, loop_step, config).await
    }

    /// Mark a loop step (and its verify step) done, then advance the run.
    async fn finish_loop(
        &self,
        txn: &mut Txn,
        scope: &mut RunScope,
        mut loop_step: Step,
        config: &LoopConfig,
    ) -> Result<CompleteResult> {
        loop_step.current_story_id = None;
        txn.set_step(&scope.run, &mut loop_step, StepStatus::Done).await?;

        if let Some(verify_key) = config.verify_gate() {
            if let Some(mut verify) = txn.tx.step_by_key(&loop_step.run_id, verify_key).await? {
                if verify.status != StepStatus::Done {
                    txn.set_step(&scope.run, &mut verify, StepStatus::Done).await?;
                }
            }
        }

        info!(step_id = %loop_step.id, "loop finished");
        self.advance_pipeline(txn, scope, &loop_step).await
    }

    /// Promote the next waiting step after `after`, or complete the run.
    async fn advance_pipeline(
        &self,
        txn: &mut Txn,
        scope: &mut RunScope,
        after: &Step,
    ) -> Result<CompleteResult> {
        let next = txn
            .tx
            .list_steps(&after.run_id)
            .await?
            .into_iter()
            .filter(|s| s.step_index > after.step_index && s.status == StepStatus::Waiting)
            .min_by_key(|s| s.step_index);

        match next {
            Some(mut next) => {
                txn.set_step(&scope.run, &mut next, StepStatus::Pending).await?;
                Ok(CompleteResult {
                    advanced: true,
                    run_completed: false,
                })
            }
            None => {
                txn.complete_run(&mut scope.run);
                Ok(CompleteResult {
                    advanced: false,
                    run_completed: true,
                })
            }
        }
    }

    /// Insert stories from a `STORIES_JSON:` block unless the run has some.
    async fn ingest_stories(
        &self,
        txn: &mut Txn,
        scope: &RunScope,
        stories: &[StoryInput],
    ) -> Result<()> {
        let (existing, _) = txn.tx.story_counts(&scope.run.id).await?;
        if existing > 0 {
            debug!(run_id = %scope.run.id, "stories already present, ignoring new list");
            return Ok(());
        }

        let max_retries = txn
            .tx
            .list_steps(&scope.run.id)
            .await?
            .into_iter()
            .find(|s| s.kind == StepKind::Loop)
            .map_or(DEFAULT_MAX_RETRIES, |s| s.max_retries);

        for (index, input) in stories.iter().enumerate() {
            let story = Story {
                id: Id::new(),
                run_id: scope.run.id.clone(),
                story_index: index as i64,
                story_key: if input.id.is_empty() {
                    format!("S-{}", index + 1)
                } else {
                    input.id.clone()
                },
                title: input.title.clone(),
                description: input.description.clone(),
                acceptance_criteria_json: serde_json::to_string(&input.acceptance_criteria)
                    .unwrap_or_else(|_| "[]".to_string()),
                status: StoryStatus::Pending,
                output: None,
                retry_count: 0,
                max_retries,
                created_at: txn.now,
                updated_at: txn.now,
            };
            txn.tx.insert_story(&story).await?;
        }
        info!(run_id = %scope.run.id, count = stories.len(), "stories added");
        Ok(())
    }
}

fn invalid(step: &Step, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        step_id: step.id.to_string(),
        status: step.status.as_str().to_string(),
        action,
    }
}

fn reports_done(parsed: &ParsedOutput) -> bool {
    parsed
        .get("status")
        .is_some_and(|s| s.eq_ignore_ascii_case("done"))
}

fn feedback(parsed: &ParsedOutput, raw_output: &str) -> String {
    parsed
        .get("issues")
        .map_or_else(|| raw_output.trim().to_string(), str::to_string)
}

/// One engine transaction plus the events it will publish on commit.
struct Txn {
    tx: Tx,
    now: DateTime<Utc>,
    events: Vec<EngineEvent>,
}

impl Txn {
    async fn begin(storage: &Storage) -> Result<Self> {
        Ok(Self {
            tx: storage.begin().await?,
            now: Utc::now(),
            events: Vec::new(),
        })
    }

    /// Write the audit log, commit, then publish.
    async fn commit(mut self, bus: &EventBus) -> Result<()> {
        for event in &self.events {
            self.tx.insert_event(&event.to_record()).await?;
        }
        self.tx.commit().await?;
        for event in &self.events {
            bus.emit(event);
        }
        Ok(())
    }

    fn push(&mut self, run: &Run, kind: EventType, step_id: Option<&Id>, story_id: Option<&Id>) {
        let mut event = EngineEvent::new(kind, run.id.clone(), run.workflow_id.clone());
        event.ts = self.now;
        event.step_id = step_id.cloned();
        event.story_id = story_id.cloned();
        self.events.push(event);
    }

    async fn set_step(&mut self, run: &Run, step: &mut Step, status: StepStatus) -> Result<()> {
        step.status = status;
        step.updated_at = self.now;
        self.tx.save_step(step).await?;
        let kind = match status {
            StepStatus::Pending => Some(EventType::StepPending),
            StepStatus::Done => Some(EventType::StepDone),
            StepStatus::Failed => Some(EventType::StepFailed),
            StepStatus::Running | StepStatus::Waiting => None,
        };
        if let Some(kind) = kind {
            self.push(run, kind, Some(&step.id), step.current_story_id.as_ref());
        }
        Ok(())
    }

    async fn set_story(&mut self, run: &Run, story: &mut Story, status: StoryStatus) -> Result<()> {
        let kind = match (story.status, status) {
            (_, StoryStatus::Running) => EventType::StoryStarted,
            (_, StoryStatus::Done) => EventType::StoryDone,
            (_, StoryStatus::Failed) => EventType::StoryFailed,
            (_, StoryStatus::Pending) => EventType::StoryRetry,
        };
        story.status = status;
        story.updated_at = self.now;
        self.tx.save_story(story).await?;
        self.push(run, kind, None, Some(&story.id));
        Ok(())
    }

    fn complete_run(&mut self, run: &mut Run) {
        run.status = RunStatus::Completed;
        self.push(run, EventType::RunCompleted, None, None);
        info!(run_id = %run.id, "run completed");
    }

    fn fail_run(&mut self, run: &mut Run, reason: &str) {
        run.status = RunStatus::Failed;
        let mut event = EngineEvent::new(EventType::RunFailed, run.id.clone(), run.workflow_id.clone())
            .with_detail(reason);
        event.ts = self.now;
        self.events.push(event);
    }
}

/// A run loaded inside a transaction with its decoded context.
struct RunScope {
    run: Run,
    ctx: Context,
    dirty: bool,
}

impl RunScope {
    async fn load(tx: &mut Tx, run_id: &Id) -> Result<Self> {
        let run = tx.get_run(run_id).await?;
        let ctx = decode::context(Some(&run.context_json));
        Ok(Self {
            run,
            ctx,
            dirty: false,
        })
    }

    fn set(&mut self, key: &str, value: String) {
        self.ctx.insert(key.to_string(), value);
        self.dirty = true;
    }

    /// Merge parsed output; later keys overwrite earlier ones.
    fn merge(&mut self, parsed: &ParsedOutput) {
        for (key, value) in &parsed.values {
            self.ctx.insert(key.clone(), value.clone());
        }
        self.dirty = true;
    }

    fn set_feedback(&mut self, feedback: &str) {
        self.set("verify_feedback", feedback.to_string());
        self.set("test_feedback", feedback.to_string());
    }

    /// Persist status and, if touched, context.
    async fn save(&mut self, txn: &mut Txn) -> Result<()> {
        if self.dirty {
            self.run.context_json = decode::encode_context(&self.ctx);
        }
        self.run.updated_at = txn.now;
        txn.tx.save_run(&self.run).await?;
        Ok(())
    }
}
