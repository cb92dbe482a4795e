//! Lifecycle events emitted by the engine.
//!
//! Events are published on the in-process bus after the mutating transaction
//! commits, appended to the audit log, and optionally forwarded to a run's
//! notification URL.

use crate::types::{Event, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    /// A step became claimable.
    #[serde(rename = "step.pending")]
    StepPending,
    #[serde(rename = "step.running")]
    StepRunning,
    #[serde(rename = "step.done")]
    StepDone,
    #[serde(rename = "step.failed")]
    StepFailed,
    /// A stale running step was reset by the reclaim sweep.
    #[serde(rename = "step.reclaimed")]
    StepReclaimed,
    #[serde(rename = "story.started")]
    StoryStarted,
    #[serde(rename = "story.done")]
    StoryDone,
    #[serde(rename = "story.retry")]
    StoryRetry,
    #[serde(rename = "story.failed")]
    StoryFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::StepPending => "step.pending",
            Self::StepRunning => "step.running",
            Self::StepDone => "step.done",
            Self::StepFailed => "step.failed",
            Self::StepReclaimed => "step.reclaimed",
            Self::StoryStarted => "story.started",
            Self::StoryDone => "story.done",
            Self::StoryRetry => "story.retry",
            Self::StoryFailed => "story.failed",
        }
    }

    /// Whether this event ends a run.
    pub fn is_run_end(&self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunFailed)
    }
}

/// Envelope for every engine event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub ts: DateTime<Utc>,
    pub event: EventType,
    pub run_id: Id,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EngineEvent {
    pub fn new(event: EventType, run_id: Id, workflow_id: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            event,
            run_id,
            workflow_id: workflow_id.into(),
            step_id: None,
            story_id: None,
            detail: None,
        }
    }

    pub fn with_step(mut self, step_id: Id) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_story(mut self, story_id: Id) -> Self {
        self.story_id = Some(story_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Audit log row for this event.
    pub fn to_record(&self) -> Event {
        Event {
            id: Id::new(),
            run_id: self.run_id.clone(),
            step_id: self.step_id.clone(),
            story_id: self.story_id.clone(),
            event_type: self.event.as_str().to_string(),
            detail: self.detail.clone(),
            timestamp: self.ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_dotted() {
        assert_eq!(
            serde_json::to_string(&EventType::StepPending).unwrap(),
            "\"step.pending\""
        );
        assert_eq!(EventType::StoryRetry.as_str(), "story.retry");
    }

    #[test]
    fn envelope_skips_empty_fields() {
        let event = EngineEvent::new(EventType::RunStarted, Id::from_string("r1"), "feature-dev");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "run.started");
        assert_eq!(json["workflow_id"], "feature-dev");
        assert!(json.get("step_id").is_none());
    }

    #[test]
    fn record_carries_ids_and_type() {
        let event = EngineEvent::new(EventType::StoryRetry, Id::from_string("r1"), "wf")
            .with_step(Id::from_string("s1"))
            .with_story(Id::from_string("st1"))
            .with_detail("needs fixes");
        let record = event.to_record();
        assert_eq!(record.event_type, "story.retry");
        assert_eq!(record.run_id, Id::from_string("r1"));
        assert_eq!(record.story_id, Some(Id::from_string("st1")));
        assert_eq!(record.detail.as_deref(), Some("needs fixes"));
        assert_eq!(record.timestamp, event.ts);
    }

    #[test]
    fn builder_sets_optional_fields() {
        let event = EngineEvent::new(EventType::StepDone, Id::from_string("r1"), "wf")
            .with_step(Id::from_string("s1"))
            .with_detail("ok");
        assert_eq!(event.step_id, Some(Id::from_string("s1")));
        assert_eq!(event.detail.as_deref(), Some("ok"));
        assert!(event.story_id.is_none());
    }

    #[test]
    fn run_end_events() {
        assert!(EventType::RunCompleted.is_run_end());
        assert!(EventType::RunFailed.is_run_end());
        assert!(!EventType::StepPending.is_run_end());
    }
}
