//! External scheduler access.
//!
//! The daemon never runs agents itself. It asks an external scheduler to
//! create, list, delete and fire recurring triggers. Three backends are
//! tried in order: the gateway's HTTP tool endpoint, the scheduler CLI, and
//! finally the scheduler's jobs file on disk.

use async_trait::async_trait;
use hive_core::Config;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(5);
const CLI_TIMEOUT: Duration = Duration::from_secs(3);
const SESSION_KEY: &str = "agent:main:main";

/// Error from a single backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend cannot serve this call; the next one may.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The backend was reached and refused.
    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no scheduler backend available ({0})")]
    Unavailable(String),
    #[error("scheduler rejected request via {backend}: {message}")]
    Rejected {
        backend: &'static str,
        message: String,
    },
    #[error("scheduler call timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// A trigger known to the external scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    pub id: String,
    pub name: String,
}

/// Recurring schedule with a first-fire offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub every_ms: u64,
    pub anchor_ms: u64,
}

/// Isolated agent turn fired by a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTurn {
    pub message: String,
    pub model: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSpec {
    pub name: String,
    pub schedule: Schedule,
    pub target_agent: String,
    pub payload: AgentTurn,
}

impl TriggerSpec {
    /// Job document in the scheduler's wire format.
    pub fn to_job(&self) -> Value {
        json!({
            "name": self.name,
            "schedule": {
                "kind": "every",
                "everyMs": self.schedule.every_ms,
                "anchorMs": self.schedule.anchor_ms,
            },
            "sessionTarget": "isolated",
            "agentId": self.target_agent,
            "payload": {
                "kind": "agentTurn",
                "message": self.payload.message,
                "model": self.payload.model,
                "timeoutSeconds": self.payload.timeout_seconds,
            },
            "delivery": { "mode": "none" },
            "enabled": true,
        })
    }
}

/// The external scheduler as the rest of the daemon sees it.
#[async_trait]
pub trait ExternalDispatcher: Send + Sync {
    async fn list_triggers(&self) -> Result<Vec<TriggerInfo>>;
    /// Returns the scheduler-assigned id when one is reported.
    async fn create_trigger(&self, spec: &TriggerSpec) -> Result<Option<String>>;
    async fn delete_trigger(&self, id: &str) -> Result<()>;
    async fn run_trigger_now(&self, id: &str) -> Result<()>;
}

/// One way of reaching the scheduler.
#[async_trait]
pub trait TriggerBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn list(&self) -> std::result::Result<Vec<TriggerInfo>, BackendError>;
    async fn create(&self, spec: &TriggerSpec) -> std::result::Result<Option<String>, BackendError>;
    async fn delete(&self, id: &str) -> std::result::Result<(), BackendError>;
    async fn run_now(&self, id: &str) -> std::result::Result<(), BackendError>;
}

/// Tries backends in order. Only [`BackendError::Unavailable`] falls
/// through; a rejection is final.
pub struct BackendChain {
    backends: Vec<Box<dyn TriggerBackend>>,
}

impl std::fmt::Debug for BackendChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("BackendChain").field("backends", &names).finish()
    }
}

impl BackendChain {
    pub fn new(backends: Vec<Box<dyn TriggerBackend>>) -> Self {
        Self { backends }
    }

    /// Gateway, then CLI, then jobs file, as configured.
    pub fn from_config(config: &Config) -> Self {
        Self::new(vec![
            Box::new(HttpGatewayBackend::new(
                config.gateway_url.clone(),
                config.gateway_token.clone(),
            )),
            Box::new(CliBackend::new(config.scheduler_cli_bin.clone())),
            Box::new(JobsFileBackend::new(config.scheduler_jobs_path.clone())),
        ])
    }
}

fn rejected(backend: &dyn TriggerBackend, message: String) -> DispatchError {
    DispatchError::Rejected {
        backend: backend.name(),
        message,
    }
}

fn skipped(backend: &dyn TriggerBackend, op: &str, reason: &str, tried: &mut Vec<String>) {
    debug!(backend = backend.name(), op, reason, "scheduler backend unavailable");
    tried.push(format!("{}: {reason}", backend.name()));
}

#[async_trait]
impl ExternalDispatcher for BackendChain {
    async fn list_triggers(&self) -> Result<Vec<TriggerInfo>> {
        let mut tried = Vec::new();
        for backend in &self.backends {
            match backend.list().await {
                Ok(triggers) => return Ok(triggers),
                Err(BackendError::Unavailable(reason)) => {
                    skipped(backend.as_ref(), "list", &reason, &mut tried);
                }
                Err(BackendError::Rejected(message)) => {
                    return Err(rejected(backend.as_ref(), message));
                }
            }
        }
        Err(DispatchError::Unavailable(tried.join("; ")))
    }

    async fn create_trigger(&self, spec: &TriggerSpec) -> Result<Option<String>> {
        let mut tried = Vec::new();
        for backend in &self.backends {
            match backend.create(spec).await {
                Ok(id) => return Ok(id),
                Err(BackendError::Unavailable(reason)) => {
                    skipped(backend.as_ref(), "create", &reason, &mut tried);
                }
                Err(BackendError::Rejected(message)) => {
                    return Err(rejected(backend.as_ref(), message));
                }
            }
        }
        Err(DispatchError::Unavailable(tried.join("; ")))
    }

    async fn delete_trigger(&self, id: &str) -> Result<()> {
        let mut tried = Vec::new();
        for backend in &self.backends {
            match backend.delete(id).await {
                Ok(()) => return Ok(()),
                Err(BackendError::Unavailable(reason)) => {
                    skipped(backend.as_ref(), "delete", &reason, &mut tried);
                }
                Err(BackendError::Rejected(message)) => {
                    return Err(rejected(backend.as_ref(), message));
                }
            }
        }
        Err(DispatchError::Unavailable(tried.join("; ")))
    }

    async fn run_trigger_now(&self, id: &str) -> Result<()> {
        let mut tried = Vec::new();
        for backend in &self.backends {
            match backend.run_now(id).await {
                Ok(()) => return Ok(()),
                Err(BackendError::Unavailable(reason)) => {
                    skipped(backend.as_ref(), "run", &reason, &mut tried);
                }
                Err(BackendError::Rejected(message)) => {
                    return Err(rejected(backend.as_ref(), message));
                }
            }
        }
        Err(DispatchError::Unavailable(tried.join("; ")))
    }
}

/// Pull `{id, name}` pairs out of a jobs array, skipping incomplete entries.
fn trigger_infos(jobs: &Value) -> Vec<TriggerInfo> {
    jobs.as_array()
        .map(|jobs| {
            jobs.iter()
                .filter_map(|job| {
                    let id = job.get("id")?.as_str()?;
                    let name = job.get("name")?.as_str()?;
                    (!id.is_empty() && !name.is_empty()).then(|| TriggerInfo {
                        id: id.to_string(),
                        name: name.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Jobs listed either as `{"jobs": [...]}` or a bare array.
fn jobs_in(doc: &Value) -> Vec<TriggerInfo> {
    match doc.get("jobs") {
        Some(jobs) => trigger_infos(jobs),
        None => trigger_infos(doc),
    }
}

// --- Gateway HTTP ---

/// Gateway `POST /tools/invoke` with the `cron` tool.
#[derive(Debug)]
pub struct HttpGatewayBackend {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpGatewayBackend {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn invoke(&self, args: Value) -> std::result::Result<Value, BackendError> {
        let body = json!({ "tool": "cron", "args": args, "sessionKey": SESSION_KEY });
        let mut request = self
            .client
            .post(format!("{}/tools/invoke", self.url))
            .timeout(GATEWAY_TIMEOUT)
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::Unavailable(
                "gateway has no tool endpoint".to_string(),
            ));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::Rejected(format!(
                "gateway returned {status}: {text}"
            )));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Rejected(format!("invalid gateway reply: {e}")))?;
        if reply.get("ok").and_then(Value::as_bool) != Some(true) {
            let message = reply
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(BackendError::Rejected(message.to_string()));
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// The list result nests the jobs document as text inside tool content.
fn gateway_jobs(result: &Value) -> Vec<TriggerInfo> {
    let from_content = result
        .pointer("/content/0/text")
        .and_then(Value::as_str)
        .and_then(|text| serde_json::from_str::<Value>(text).ok())
        .map(|doc| jobs_in(&doc))
        .unwrap_or_default();
    if from_content.is_empty() {
        jobs_in(result)
    } else {
        from_content
    }
}

#[async_trait]
impl TriggerBackend for HttpGatewayBackend {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn list(&self) -> std::result::Result<Vec<TriggerInfo>, BackendError> {
        let result = self.invoke(json!({ "action": "list" })).await?;
        Ok(gateway_jobs(&result))
    }

    async fn create(&self, spec: &TriggerSpec) -> std::result::Result<Option<String>, BackendError> {
        let result = self
            .invoke(json!({ "action": "add", "job": spec.to_job() }))
            .await?;
        Ok(result.get("id").and_then(Value::as_str).map(str::to_string))
    }

    async fn delete(&self, id: &str) -> std::result::Result<(), BackendError> {
        self.invoke(json!({ "action": "remove", "id": id })).await?;
        Ok(())
    }

    async fn run_now(&self, id: &str) -> std::result::Result<(), BackendError> {
        self.invoke(json!({ "action": "run", "id": id })).await?;
        Ok(())
    }
}

// --- Scheduler CLI ---

/// The scheduler's `cron` subcommands.
#[derive(Debug)]
pub struct CliBackend {
    bin: PathBuf,
}

impl CliBackend {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }

    async fn run(&self, args: &[String]) -> std::result::Result<String, BackendError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(CLI_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                BackendError::Unavailable(format!(
                    "{} timed out after {CLI_TIMEOUT:?}",
                    self.bin.display()
                ))
            })?
            .map_err(|e| {
                BackendError::Unavailable(format!("failed to run {}: {e}", self.bin.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Unavailable(format!(
                "{} exited with {}: {}",
                self.bin.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn cli_add_args(spec: &TriggerSpec) -> Vec<String> {
    vec![
        "cron".to_string(),
        "add".to_string(),
        "--json".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--every".to_string(),
        format!("{}ms", spec.schedule.every_ms),
        "--session".to_string(),
        "isolated".to_string(),
        "--message".to_string(),
        spec.payload.message.clone(),
        "--timeout".to_string(),
        spec.payload.timeout_seconds.to_string(),
    ]
}

#[async_trait]
impl TriggerBackend for CliBackend {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn list(&self) -> std::result::Result<Vec<TriggerInfo>, BackendError> {
        let args = ["cron", "list", "--json", "--all"].map(String::from);
        let stdout = self.run(&args).await?;
        let doc: Value = serde_json::from_str(&stdout)
            .map_err(|e| BackendError::Unavailable(format!("unreadable cron list output: {e}")))?;
        Ok(jobs_in(&doc))
    }

    async fn create(&self, spec: &TriggerSpec) -> std::result::Result<Option<String>, BackendError> {
        let stdout = self.run(&cli_add_args(spec)).await?;
        // Non-JSON output still means the job was added.
        let id = serde_json::from_str::<Value>(&stdout).ok().and_then(|doc| {
            doc.get("id")
                .or_else(|| doc.get("jobId"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Ok(id)
    }

    async fn delete(&self, id: &str) -> std::result::Result<(), BackendError> {
        let args = ["cron", "rm", id, "--json"].map(String::from);
        self.run(&args).await?;
        Ok(())
    }

    async fn run_now(&self, id: &str) -> std::result::Result<(), BackendError> {
        let args = ["cron", "run", id].map(String::from);
        self.run(&args).await?;
        Ok(())
    }
}

// --- Jobs file ---

/// Direct access to the scheduler's jobs file. Read-only except for
/// nudging a job's next fire time.
#[derive(Debug)]
pub struct JobsFileBackend {
    path: PathBuf,
}

impl JobsFileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read(&self) -> std::result::Result<Value, BackendError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            BackendError::Unavailable(format!("cannot read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BackendError::Unavailable(format!("cannot parse {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl TriggerBackend for JobsFileBackend {
    fn name(&self) -> &'static str {
        "jobs-file"
    }

    async fn list(&self) -> std::result::Result<Vec<TriggerInfo>, BackendError> {
        let doc = self.read().await?;
        Ok(doc.get("jobs").map(trigger_infos).unwrap_or_default())
    }

    async fn create(&self, _spec: &TriggerSpec) -> std::result::Result<Option<String>, BackendError> {
        Err(BackendError::Unavailable(
            "jobs file does not support creating triggers".to_string(),
        ))
    }

    async fn delete(&self, _id: &str) -> std::result::Result<(), BackendError> {
        Err(BackendError::Unavailable(
            "jobs file does not support deleting triggers".to_string(),
        ))
    }

    async fn run_now(&self, id: &str) -> std::result::Result<(), BackendError> {
        let mut doc = self.read().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();

        let job = doc
            .get_mut("jobs")
            .and_then(Value::as_array_mut)
            .and_then(|jobs| {
                jobs.iter_mut()
                    .find(|job| job.get("id").and_then(Value::as_str) == Some(id))
            })
            .and_then(Value::as_object_mut)
            .ok_or_else(|| BackendError::Rejected(format!("no job {id} in jobs file")))?;

        let state = job.entry("state").or_insert_with(|| json!({}));
        if !state.is_object() {
            *state = json!({});
        }
        if let Some(state) = state.as_object_mut() {
            state.insert("nextRunAtMs".to_string(), json!(now_ms));
        }
        job.insert("updatedAtMs".to_string(), json!(now_ms));

        let rendered = serde_json::to_string_pretty(&doc)
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        tokio::fs::write(&self.path, rendered).await.map_err(|e| {
            BackendError::Rejected(format!("cannot write {}: {e}", self.path.display()))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn spec() -> TriggerSpec {
        TriggerSpec {
            name: "hive/wf/dev".to_string(),
            schedule: Schedule {
                every_ms: 300_000,
                anchor_ms: 60_000,
            },
            target_agent: "wf_dev".to_string(),
            payload: AgentTurn {
                message: "poll".to_string(),
                model: "default".to_string(),
                timeout_seconds: 120,
            },
        }
    }

    /// Backend that records calls and answers with a fixed outcome.
    struct Scripted {
        name: &'static str,
        unavailable: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Scripted {
        fn outcome(&self) -> std::result::Result<(), BackendError> {
            self.calls.lock().unwrap().push(self.name);
            if self.unavailable {
                Err(BackendError::Unavailable("down".to_string()))
            } else {
                Err(BackendError::Rejected("no".to_string()))
            }
        }
    }

    #[async_trait]
    impl TriggerBackend for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn list(&self) -> std::result::Result<Vec<TriggerInfo>, BackendError> {
            self.outcome().map(|()| Vec::new())
        }
        async fn create(&self, _: &TriggerSpec) -> std::result::Result<Option<String>, BackendError> {
            self.outcome().map(|()| None)
        }
        async fn delete(&self, _: &str) -> std::result::Result<(), BackendError> {
            self.outcome()
        }
        async fn run_now(&self, _: &str) -> std::result::Result<(), BackendError> {
            self.outcome()
        }
    }

    fn write_jobs(dir: &TempDir, doc: &Value) -> PathBuf {
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, doc.to_string()).unwrap();
        path
    }

    #[test]
    fn job_document_shape() {
        let job = spec().to_job();
        assert_eq!(job["schedule"]["kind"], "every");
        assert_eq!(job["schedule"]["anchorMs"], 60_000);
        assert_eq!(job["sessionTarget"], "isolated");
        assert_eq!(job["agentId"], "wf_dev");
        assert_eq!(job["payload"]["kind"], "agentTurn");
        assert_eq!(job["payload"]["timeoutSeconds"], 120);
        assert_eq!(job["delivery"]["mode"], "none");
    }

    #[test]
    fn gateway_jobs_prefers_text_content() {
        let result = json!({
            "content": [{ "type": "text", "text": "{\"jobs\":[{\"id\":\"1\",\"name\":\"a\"}]}" }],
            "jobs": [{ "id": "2", "name": "b" }],
        });
        assert_eq!(gateway_jobs(&result)[0].id, "1");

        let result = json!({ "jobs": [{ "id": "2", "name": "b" }, { "id": "", "name": "c" }] });
        assert_eq!(
            gateway_jobs(&result),
            vec![TriggerInfo {
                id: "2".to_string(),
                name: "b".to_string()
            }]
        );
    }

    #[test]
    fn cli_add_args_carry_schedule() {
        let args = cli_add_args(&spec());
        assert!(args.windows(2).any(|w| w[0] == "--every" && w[1] == "300000ms"));
        assert!(args.windows(2).any(|w| w[0] == "--name" && w[1] == "hive/wf/dev"));
    }

    #[tokio::test]
    async fn chain_falls_through_only_when_unavailable() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = BackendChain::new(vec![
            Box::new(Scripted {
                name: "first",
                unavailable: true,
                calls: Arc::clone(&calls),
            }),
            Box::new(Scripted {
                name: "second",
                unavailable: false,
                calls: Arc::clone(&calls),
            }),
            Box::new(Scripted {
                name: "third",
                unavailable: true,
                calls: Arc::clone(&calls),
            }),
        ]);

        let result = chain.run_trigger_now("x").await;
        assert!(matches!(
            result,
            Err(DispatchError::Rejected {
                backend: "second",
                ..
            })
        ));
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn chain_reports_unavailable_when_exhausted() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = BackendChain::new(vec![Box::new(Scripted {
            name: "only",
            unavailable: true,
            calls,
        })]);
        assert!(matches!(
            chain.list_triggers().await,
            Err(DispatchError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn jobs_file_lists_complete_entries() {
        let dir = TempDir::new().unwrap();
        let path = write_jobs(
            &dir,
            &json!({ "jobs": [{ "id": "j1", "name": "hive/wf/dev" }, { "name": "no-id" }] }),
        );
        let backend = JobsFileBackend::new(path);
        let jobs = backend.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "hive/wf/dev");
    }

    #[tokio::test]
    async fn jobs_file_run_now_nudges_next_run() {
        let dir = TempDir::new().unwrap();
        let path = write_jobs(
            &dir,
            &json!({ "version": 1, "jobs": [{ "id": "j1", "name": "a", "state": { "lastRunAtMs": 5 } }] }),
        );
        let backend = JobsFileBackend::new(path.clone());
        backend.run_now("j1").await.unwrap();

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let job = &doc["jobs"][0];
        assert!(job["state"]["nextRunAtMs"].as_i64().unwrap() > 0);
        assert_eq!(job["state"]["lastRunAtMs"], 5);
        assert!(job["updatedAtMs"].is_i64());
        assert_eq!(doc["version"], 1);

        assert!(matches!(
            backend.run_now("missing").await,
            Err(BackendError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn jobs_file_cannot_create_or_delete() {
        let backend = JobsFileBackend::new(PathBuf::from("/nonexistent/jobs.json"));
        assert!(matches!(
            backend.create(&spec()).await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(matches!(
            backend.delete("j1").await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(matches!(
            backend.list().await,
            Err(BackendError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn cli_missing_binary_is_unavailable() {
        let backend = CliBackend::new(PathBuf::from("/nonexistent/hive-scheduler-bin"));
        assert!(matches!(
            backend.list().await,
            Err(BackendError::Unavailable(_))
        ));
    }
}
