use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// How long the availability probe waits before declaring the server down.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything needed for one completion round trip.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub timeout: Duration,
}

/// Why a completion attempt failed.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("cannot connect to Ollama at {0}. Make sure Ollama is running with: ollama serve")]
    Connection(String),
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Ollama returned status {0}")]
    BadStatus(StatusCode),
    #[error("unexpected response from Ollama: {0}")]
    Unexpected(String),
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<ModelEntry>,
}

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    probe_timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one non-streaming completion request and return the model's reply.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let url = format!("{}/api/generate", self.base_url);
        debug!(model = %request.model, "requesting completion");

        let body = GenerateRequest {
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|err| self.classify(err, request.timeout))?;

        if !response.status().is_success() {
            return Err(CompletionError::BadStatus(response.status()));
        }

        let completion: GenerateResponse = response
            .json()
            .await
            .map_err(|err| self.classify(err, request.timeout))?;

        Ok(completion.response)
    }

    /// Names of the models the server has pulled, in server order.
    pub async fn list_models(&self) -> Result<Vec<String>, CompletionError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|err| self.classify(err, self.probe_timeout))?;

        if !response.status().is_success() {
            return Err(CompletionError::BadStatus(response.status()));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|err| self.classify(err, self.probe_timeout))?;

        Ok(tags.models.into_iter().map(|model| model.name).collect())
    }

    /// Ask whether the server is reachable at all.
    ///
    /// Advisory only: the answer feeds the status indicator and never
    /// decides whether a completion gets attempted.
    pub async fn check_availability(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);

        match self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(%err, "availability probe failed");
                false
            }
        }
    }

    fn classify(&self, err: reqwest::Error, timeout: Duration) -> CompletionError {
        if err.is_timeout() {
            CompletionError::Timeout(timeout)
        } else if err.is_connect() {
            CompletionError::Connection(self.base_url.clone())
        } else {
            CompletionError::Unexpected(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_silent_stub, spawn_stub, unreachable_url};

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            model: "llama3.1:8b".to_string(),
            prompt: prompt.to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn complete_sends_a_single_generate_request() {
        let body = r#"{"model":"llama3.1:8b","response":"4","done":true}"#;
        let (url, stub) = spawn_stub("200 OK", body).await;
        let client = OllamaClient::new(&url);

        let answer = client.complete(&request("What is 2+2?")).await.unwrap();
        assert_eq!(answer, "4");

        let raw = stub.await.unwrap();
        let (head, sent_body) = raw.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("POST /api/generate HTTP/1.1"));

        let sent: serde_json::Value = serde_json::from_str(sent_body).unwrap();
        assert_eq!(sent["model"], "llama3.1:8b");
        assert_eq!(sent["prompt"], "What is 2+2?");
        assert_eq!(sent["stream"], false);
    }

    #[tokio::test]
    async fn complete_reports_server_errors_as_bad_status() {
        let (url, _stub) = spawn_stub("500 Internal Server Error", r#"{"error":"boom"}"#).await;
        let client = OllamaClient::new(&url);

        let err = client.complete(&request("hi")).await.unwrap_err();
        match err {
            CompletionError::BadStatus(status) => assert_eq!(status.as_u16(), 500),
            other => panic!("expected BadStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_maps_refused_connections() {
        let url = unreachable_url().await;
        let client = OllamaClient::new(&url);

        let err = client.complete(&request("hi")).await.unwrap_err();
        assert!(matches!(err, CompletionError::Connection(_)));
        assert!(err.to_string().contains("ollama serve"));
    }

    #[tokio::test]
    async fn complete_times_out_when_the_server_stalls() {
        let (url, _stub) = spawn_silent_stub().await;
        let client = OllamaClient::new(&url);

        let slow = CompletionRequest {
            timeout: Duration::from_millis(200),
            ..request("hi")
        };
        let err = client.complete(&slow).await.unwrap_err();
        match err {
            CompletionError::Timeout(elapsed) => assert_eq!(elapsed, Duration::from_millis(200)),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_rejects_bodies_without_a_response_field() {
        let (url, _stub) = spawn_stub("200 OK", r#"{"done":true}"#).await;
        let client = OllamaClient::new(&url);

        let err = client.complete(&request("hi")).await.unwrap_err();
        assert!(matches!(err, CompletionError::Unexpected(_)));
    }

    #[tokio::test]
    async fn list_models_returns_names_in_server_order() {
        let body = r#"{"models":[{"name":"llama3.1:8b"},{"name":"mistral:7b"}]}"#;
        let (url, stub) = spawn_stub("200 OK", body).await;
        let client = OllamaClient::new(&url);

        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["llama3.1:8b", "mistral:7b"]);

        let raw = stub.await.unwrap();
        assert!(raw.starts_with("GET /api/tags HTTP/1.1"));
    }

    #[tokio::test]
    async fn availability_probe_succeeds_against_a_healthy_server() {
        let (url, _stub) = spawn_stub("200 OK", r#"{"models":[]}"#).await;
        let client = OllamaClient::new(&url);
        assert!(client.check_availability().await);
    }

    #[tokio::test]
    async fn availability_probe_fails_fast_when_nothing_listens() {
        let url = unreachable_url().await;
        let client = OllamaClient::new(&url);
        assert!(!client.check_availability().await);
    }

    #[tokio::test]
    async fn availability_probe_gives_up_on_a_stalled_server() {
        let (url, _stub) = spawn_silent_stub().await;
        let client = OllamaClient::new(&url).with_probe_timeout(Duration::from_millis(200));
        assert!(!client.check_availability().await);
    }

    #[test]
    fn base_url_loses_its_trailing_slash() {
        let client = OllamaClient::new("http://localhost:11434/");
        assert_eq!(client.base_url(), "http://localhost:11434");
    }

    #[test]
    fn error_messages_read_well() {
        let err = CompletionError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "request timed out after 30s");

        let err = CompletionError::Connection("http://localhost:11434".to_string());
        assert_eq!(
            err.to_string(),
            "cannot connect to Ollama at http://localhost:11434. \
             Make sure Ollama is running with: ollama serve"
        );
    }
}
