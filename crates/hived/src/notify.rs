//! Run notifications.
//!
//! Runs started with a `notify_url` get every one of their events POSTed
//! there as JSON. Delivery is fire-and-forget.

use hive_core::events::EngineEvent;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bus::{spawn_detached, EventBus, Subscription};
use crate::storage::Storage;

pub struct Notifier {
    storage: Arc<Storage>,
    client: reqwest::Client,
    timeout: Duration,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(storage: Arc<Storage>, timeout: Duration) -> Self {
        Self {
            storage,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn subscribe(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        let notifier = Arc::clone(self);
        bus.subscribe(move |event: &EngineEvent| -> eyre::Result<()> {
            let notifier = Arc::clone(&notifier);
            let event = event.clone();
            spawn_detached(async move {
                notifier.deliver(&event).await;
            })
        })
    }

    /// POST `event` to its run's notify URL, if it has one. Returns whether a
    /// delivery was accepted.
    pub async fn deliver(&self, event: &EngineEvent) -> bool {
        let url = match self.storage.get_run(&event.run_id).await {
            Ok(run) => run.notify_url,
            Err(e) => {
                warn!(run_id = %event.run_id, error = %e, "notify could not load run");
                return false;
            }
        };
        let Some(url) = url.filter(|u| !u.trim().is_empty()) else {
            return false;
        };

        let result = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(event)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match result {
            Ok(_) => {
                debug!(run_id = %event.run_id, event = event.event.as_str(), "notification delivered");
                true
            }
            Err(e) => {
                warn!(run_id = %event.run_id, url = %url, error = %e, "notification failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hive_core::events::EventType;
    use hive_core::{Id, Run, RunStatus};
    use tempfile::TempDir;

    async fn storage_with_run(notify_url: Option<&str>) -> (Arc<Storage>, Run, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let now = Utc::now();
        let run = Run {
            id: Id::new(),
            run_number: 1,
            workflow_id: "wf".to_string(),
            task: "t".to_string(),
            status: RunStatus::Running,
            context_json: "{}".to_string(),
            notify_url: notify_url.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        let mut tx = storage.begin().await.unwrap();
        tx.insert_run(&run).await.unwrap();
        tx.commit().await.unwrap();
        (Arc::new(storage), run, dir)
    }

    #[tokio::test]
    async fn skips_runs_without_url() {
        let (storage, run, _dir) = storage_with_run(None).await;
        let notifier = Notifier::new(storage, Duration::from_millis(200));
        let event = EngineEvent::new(EventType::RunStarted, run.id, "wf");
        assert!(!notifier.deliver(&event).await);
    }

    #[tokio::test]
    async fn unreachable_url_fails_soft() {
        let (storage, run, _dir) = storage_with_run(Some("http://127.0.0.1:9/hook")).await;
        let notifier = Notifier::new(storage, Duration::from_millis(200));
        let event = EngineEvent::new(EventType::RunCompleted, run.id, "wf");
        assert!(!notifier.deliver(&event).await);
    }
}
