//! HTTP client for the hived daemon.

use hive_core::types::{Event, Run, Step, Story};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: hived\n  → or set HIVE_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("daemon not ready after {timeout_ms}ms at {addr}\n  → ensure hived is running")]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for starting a run (POST /runs).
#[derive(Debug, Serialize)]
pub struct CreateRunRequest {
    pub workflow: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct ListRunsResponse {
    runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
struct ListStepsResponse {
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct ListStoriesResponse {
    stories: Vec<Story>,
}

#[derive(Debug, Deserialize)]
struct ListEventsResponse {
    events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
struct PeekResponse {
    has_work: bool,
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    found: bool,
    #[serde(default)]
    step_id: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    story_id: Option<String>,
}

/// A claimed step as handed to the worker session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimedStep {
    pub step_id: String,
    pub run_id: String,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
}

impl ClaimResponse {
    fn into_step(self) -> Result<Option<ClaimedStep>, ClientError> {
        if !self.found {
            return Ok(None);
        }
        match (self.step_id, self.run_id) {
            (Some(step_id), Some(run_id)) => Ok(Some(ClaimedStep {
                step_id,
                run_id,
                input: self.input.unwrap_or_default(),
                story_id: self.story_id,
            })),
            _ => Err(ClientError::InvalidResponse(
                "claim reported found without step_id/run_id".to_string(),
            )),
        }
    }
}

/// Outcome of POST /steps/{id}/complete.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CompleteResult {
    pub advanced: bool,
    pub run_completed: bool,
}

/// Outcome of POST /steps/{id}/fail.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FailResult {
    pub retrying: bool,
    pub run_failed: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for hived.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Probe /health. Err only when the daemon cannot be reached.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            if let Ok(true) = self.check_health().await {
                return Ok(());
            }
            let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            if elapsed >= timeout_ms {
                return Err(ClientError::DaemonNotReady {
                    addr: self.base_url.clone(),
                    timeout_ms,
                });
            }

            eprintln!(
                "waiting for daemon at {} (retrying in {}ms)",
                self.base_url, backoff_ms
            );
            let sleep_ms = backoff_ms.min(timeout_ms.saturating_sub(elapsed));
            tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
            backoff_ms = backoff_ms.saturating_mul(2);
        }
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    /// Map a non-success response to an error, keeping the daemon's message.
    async fn handle_error(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| "unknown error".to_string(), |e| e.error);

        match status {
            404 => ClientError::NotFound(message),
            400 | 409 => ClientError::InvalidOperation(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).headers(Self::headers()).send().await?;
        Self::decode(response).await
    }

    async fn post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .headers(Self::headers())
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// POST /runs
    pub async fn create_run(&self, req: &CreateRunRequest) -> Result<Run, ClientError> {
        let body: RunResponse = self.post("/runs", req).await?;
        Ok(body.run)
    }

    /// GET /runs?workflow=...
    pub async fn list_runs(&self, workflow: Option<&str>) -> Result<Vec<Run>, ClientError> {
        let path = match workflow {
            Some(wf) => format!("/runs?workflow={}", urlencoding::encode(wf)),
            None => "/runs".to_string(),
        };
        let body: ListRunsResponse = self.get(&path).await?;
        Ok(body.runs)
    }

    /// GET /runs/{id}
    pub async fn get_run(&self, run_id: &str) -> Result<Run, ClientError> {
        let body: RunResponse = self
            .get(&format!("/runs/{}", urlencoding::encode(run_id)))
            .await?;
        Ok(body.run)
    }

    /// GET /runs/{id}/steps
    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>, ClientError> {
        let body: ListStepsResponse = self
            .get(&format!("/runs/{}/steps", urlencoding::encode(run_id)))
            .await?;
        Ok(body.steps)
    }

    /// GET /runs/{id}/stories
    pub async fn list_stories(&self, run_id: &str) -> Result<Vec<Story>, ClientError> {
        let body: ListStoriesResponse = self
            .get(&format!("/runs/{}/stories", urlencoding::encode(run_id)))
            .await?;
        Ok(body.stories)
    }

    /// GET /runs/{id}/events
    pub async fn list_events(&self, run_id: &str) -> Result<Vec<Event>, ClientError> {
        let body: ListEventsResponse = self
            .get(&format!("/runs/{}/events", urlencoding::encode(run_id)))
            .await?;
        Ok(body.events)
    }

    /// GET /steps/peek?agent_id=...
    pub async fn peek(&self, agent_id: &str) -> Result<bool, ClientError> {
        let body: PeekResponse = self
            .get(&format!(
                "/steps/peek?agent_id={}",
                urlencoding::encode(agent_id)
            ))
            .await?;
        Ok(body.has_work)
    }

    /// POST /steps/claim
    pub async fn claim(&self, agent_id: &str) -> Result<Option<ClaimedStep>, ClientError> {
        let body: ClaimResponse = self
            .post("/steps/claim", &serde_json::json!({ "agent_id": agent_id }))
            .await?;
        body.into_step()
    }

    /// POST /steps/{id}/complete
    pub async fn complete(&self, step_id: &str, output: &str) -> Result<CompleteResult, ClientError> {
        self.post(
            &format!("/steps/{}/complete", urlencoding::encode(step_id)),
            &serde_json::json!({ "output": output }),
        )
        .await
    }

    /// POST /steps/{id}/fail
    pub async fn fail(&self, step_id: &str, error: &str) -> Result<FailResult, ClientError> {
        self.post(
            &format!("/steps/{}/fail", urlencoding::encode(step_id)),
            &serde_json::json!({ "error": error }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_response(raw: &str) -> ClaimResponse {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn claim_not_found_has_no_step() {
        let step = claim_response(r#"{"found": false}"#).into_step().unwrap();
        assert!(step.is_none());
    }

    #[test]
    fn claim_found_keeps_story() {
        let step = claim_response(
            r#"{"found": true, "step_id": "s1", "run_id": "r1", "input": "do it", "story_id": "st1"}"#,
        )
        .into_step()
        .unwrap()
        .unwrap();
        assert_eq!(step.step_id, "s1");
        assert_eq!(step.story_id.as_deref(), Some("st1"));
        assert_eq!(
            serde_json::to_value(&step).unwrap(),
            serde_json::json!({"step_id": "s1", "run_id": "r1", "input": "do it", "story_id": "st1"})
        );
    }

    #[test]
    fn claimed_step_omits_missing_story() {
        let step = claim_response(r#"{"found": true, "step_id": "s1", "run_id": "r1", "input": "x"}"#)
            .into_step()
            .unwrap()
            .unwrap();
        let json = serde_json::to_string(&step).unwrap();
        assert!(!json.contains("story_id"));
    }

    #[test]
    fn claim_found_without_ids_is_invalid() {
        let result = claim_response(r#"{"found": true}"#).into_step();
        assert!(matches!(result, Err(ClientError::InvalidResponse(_))));
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://127.0.0.1:7800/");
        assert_eq!(client.base_url, "http://127.0.0.1:7800");
    }

    #[tokio::test]
    async fn unreachable_daemon_is_connection_failure() {
        let client = Client::new("http://127.0.0.1:9");
        let err = client.peek("wf_agent").await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionFailed { .. }));
    }
}
