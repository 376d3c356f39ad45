//! Inference provider boundary.
//!
//! ## Components
//! - [`InferenceProvider`]: the contract the Infer stage calls.
//! - [`MockProvider`]: deterministic output, no network.
//! - [`RealProvider`]: blocking HTTP client against a model server.
//! - [`build_provider`]: picks one variant once, at process start.
//!
//! The workflow never branches on which variant it holds; the output records
//! `run_mode` and `used_fallback` instead.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

use clinflow_core::CaseId;

const MOCK_NOTES_PREVIEW: usize = 80;

/// Which provider variant produced an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    Mock,
    Real,
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::Mock => "mock",
            ProviderMode::Real => "real",
        }
    }
}

impl core::fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ProviderMode {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(ProviderMode::Mock),
            "real" | "medgemma" => Ok(ProviderMode::Real),
            other => Err(ProviderError::Config(format!("unknown provider mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub case_id: CaseId,
    pub notes: String,
    /// Exact context string produced by retrieval.
    pub context: String,
    pub tensor_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub summary: String,
    pub findings: Vec<String>,
    pub confidence: f64,
    pub used_fallback: bool,
    pub run_mode: ProviderMode,
    pub model_source: String,
    pub generated_token_count: u32,
}

impl InferenceOutput {
    pub fn findings_text(&self) -> String {
        self.findings.join("\n")
    }
}

/// Result of a reachability check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingStatus {
    pub mode: ProviderMode,
    pub reachable: bool,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("provider timed out: {0}")]
    Timeout(String),

    #[error("provider out of memory: {0}")]
    OutOfMemory(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("provider configuration error: {0}")]
    Config(String),
}

pub trait InferenceProvider: Send + Sync + 'static {
    fn mode(&self) -> ProviderMode;

    fn ping(&self) -> PingStatus;

    fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutput, ProviderError>;
}

/// Deterministic provider for development and tests.
#[derive(Debug, Clone, Default)]
pub struct MockProvider;

impl MockProvider {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceProvider for MockProvider {
    fn mode(&self) -> ProviderMode {
        ProviderMode::Mock
    }

    fn ping(&self) -> PingStatus {
        PingStatus {
            mode: ProviderMode::Mock,
            reachable: true,
            metadata: json!({ "model_source": "mock" }),
        }
    }

    fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutput, ProviderError> {
        let notes = request.notes.trim();
        let preview = if notes.chars().count() <= MOCK_NOTES_PREVIEW {
            notes.to_string()
        } else {
            let head: String = notes.chars().take(MOCK_NOTES_PREVIEW - 3).collect();
            format!("{head}...")
        };
        let summary = format!("Mock inference: {preview}");

        Ok(InferenceOutput {
            generated_token_count: summary.split_whitespace().count() as u32,
            summary,
            findings: vec![
                "Lesion change is stable compared with prior imaging; continue follow-up."
                    .to_string(),
                "No obvious new high-risk signs.".to_string(),
            ],
            confidence: 0.72,
            used_fallback: false,
            run_mode: ProviderMode::Mock,
            model_source: "mock".to_string(),
        })
    }
}

/// Settings for [`build_provider`].
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    pub mode: ProviderMode,
    pub base_url: String,
    pub timeout: Duration,
    /// Answer with the mock result when the real provider is unreachable.
    pub fallback_to_mock: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Mock,
            base_url: "http://127.0.0.1:9000".to_string(),
            timeout: Duration::from_secs(30),
            fallback_to_mock: false,
        }
    }
}

/// HTTP client for a model server exposing `GET /health` and `POST /infer`.
///
/// Uses the blocking client; must not be called from inside an async runtime.
#[derive(Debug, Clone)]
pub struct RealProvider {
    client: Client,
    base_url: String,
    fallback: Option<MockProvider>,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    summary: Option<JsonValue>,
    findings: Option<JsonValue>,
    confidence: Option<f64>,
    model_source: Option<String>,
    generated_token_count: Option<u32>,
}

impl RealProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fallback: None,
        })
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback = enabled.then(MockProvider::new);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn call(&self, request: &InferenceRequest) -> Result<InferenceOutput, ProviderError> {
        let response = self
            .client
            .post(format!("{}/infer", self.base_url))
            .json(&json!({
                "case_id": request.case_id.to_string(),
                "notes": request.notes,
                "context": request.context,
                "tensor_ref": request.tensor_ref,
            }))
            .send()
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(map_status_error(status, &body));
        }
        parse_infer_body(&body)
    }
}

impl InferenceProvider for RealProvider {
    fn mode(&self) -> ProviderMode {
        ProviderMode::Real
    }

    fn ping(&self) -> PingStatus {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send() {
            Ok(resp) => {
                let status = resp.status();
                let raw = resp
                    .text()
                    .ok()
                    .filter(|b| !b.is_empty())
                    .map(|b| serde_json::from_str(&b).unwrap_or(JsonValue::String(b)))
                    .unwrap_or(JsonValue::Null);
                PingStatus {
                    mode: ProviderMode::Real,
                    reachable: status.is_success(),
                    metadata: json!({ "status": status.as_u16(), "raw": raw }),
                }
            }
            Err(err) => PingStatus {
                mode: ProviderMode::Real,
                reachable: false,
                metadata: json!({ "error": err.to_string() }),
            },
        }
    }

    fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutput, ProviderError> {
        match (self.call(request), &self.fallback) {
            (Err(ProviderError::Unreachable(reason)), Some(mock)) => {
                tracing::warn!(
                    case_id = %request.case_id,
                    reason = %reason,
                    "inference provider unreachable; answering with mock fallback"
                );
                let mut output = mock.infer(request)?;
                output.used_fallback = true;
                Ok(output)
            }
            (result, _) => result,
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_decode() {
        ProviderError::MalformedResponse(err.to_string())
    } else {
        ProviderError::Unreachable(err.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status == StatusCode::INSUFFICIENT_STORAGE
        || body.to_ascii_lowercase().contains("out of memory")
    {
        ProviderError::OutOfMemory(detail)
    } else if status == StatusCode::GATEWAY_TIMEOUT || status == StatusCode::REQUEST_TIMEOUT {
        ProviderError::Timeout(detail)
    } else if status.is_server_error() {
        ProviderError::Unreachable(detail)
    } else {
        ProviderError::MalformedResponse(detail)
    }
}

fn parse_infer_body(body: &str) -> Result<InferenceOutput, ProviderError> {
    let parsed: InferResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::MalformedResponse(format!("invalid json: {e}")))?;

    let summary = match parsed.summary {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => s,
        _ => return Err(ProviderError::MalformedResponse("missing summary".to_string())),
    };
    let findings = match parsed.findings {
        Some(JsonValue::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                JsonValue::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        None => Vec::new(),
        Some(_) => {
            return Err(ProviderError::MalformedResponse(
                "findings is not a list".to_string(),
            ));
        }
    };

    Ok(InferenceOutput {
        generated_token_count: parsed
            .generated_token_count
            .unwrap_or_else(|| summary.split_whitespace().count() as u32),
        summary,
        findings,
        confidence: parsed.confidence.unwrap_or(0.0),
        used_fallback: false,
        run_mode: ProviderMode::Real,
        model_source: parsed.model_source.unwrap_or_else(|| "remote".to_string()),
    })
}

/// Choose the provider variant for this process.
pub fn build_provider(config: &InferenceConfig) -> Result<Arc<dyn InferenceProvider>, ProviderError> {
    let provider: Arc<dyn InferenceProvider> = match config.mode {
        ProviderMode::Mock => Arc::new(MockProvider::new()),
        ProviderMode::Real => Arc::new(
            RealProvider::new(config.base_url.clone(), config.timeout)?
                .with_fallback(config.fallback_to_mock),
        ),
    };
    tracing::info!(
        mode = %provider.mode(),
        fallback = config.fallback_to_mock,
        "inference provider selected"
    );
    Ok(provider)
}
