//! Configuration loading and representation.
//!
//! Every setting comes from a `CLINFLOW_*` environment variable; unset
//! variables take the defaults below, malformed ones are an error.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clinflow_core::Stage;
use clinflow_providers::retrieval::MAX_TOP_K;
use clinflow_providers::{InferenceConfig, InferenceProvider, ProviderMode, Retriever};

use crate::jobs::{RetryController, StagePolicies};
use crate::stages::StageSet;
use crate::workers::WorkerPoolConfig;

pub const ENV_PREFIX: &str = "CLINFLOW_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Postgres connection string; in-memory store when unset.
    pub database_url: Option<String>,
    /// JSON array of knowledge documents served by the retriever.
    pub knowledge_path: Option<PathBuf>,
    pub workers: usize,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub retrieval_top_k: usize,
    pub retrieval_min_score: f64,
    pub retry: StagePolicies,
    pub inference: InferenceConfig,
    pub model_version: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            knowledge_path: None,
            workers: 2,
            poll_interval: Duration::from_millis(200),
            lease_ttl: Duration::from_secs(300),
            retrieval_top_k: 3,
            retrieval_min_score: 1.0,
            retry: StagePolicies::with_delays(Duration::from_millis(500), Duration::from_millis(30_000)),
            inference: InferenceConfig::default(),
            model_version: "medgemma-4b-it".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();

        let base_delay = env.millis("RETRY_BASE_DELAY_MS")?.unwrap_or(defaults.retry.infer.base_delay);
        let max_delay = env.millis("RETRY_MAX_DELAY_MS")?.unwrap_or(defaults.retry.infer.max_delay);
        let mut retry = StagePolicies::with_delays(base_delay, max_delay);
        for stage in Stage::ALL {
            let var = format!("RETRY_{}_MAX", stage.as_str().to_ascii_uppercase());
            if let Some(max) = env.parse::<u32>(&var)? {
                retry.for_stage_mut(stage).max_retries = max;
            }
        }

        let inference = InferenceConfig {
            mode: env
                .parse::<ProviderMode>("INFERENCE_PROVIDER")?
                .unwrap_or(defaults.inference.mode),
            base_url: env
                .string("INFERENCE_BASE_URL")
                .unwrap_or(defaults.inference.base_url),
            timeout: env
                .secs("INFERENCE_TIMEOUT_SECS")?
                .unwrap_or(defaults.inference.timeout),
            fallback_to_mock: env
                .parse::<bool>("INFERENCE_FALLBACK")?
                .unwrap_or(defaults.inference.fallback_to_mock),
        };

        let config = Self {
            database_url: env.string("DATABASE_URL"),
            knowledge_path: env.string("KNOWLEDGE_PATH").map(PathBuf::from),
            workers: env.parse("WORKERS")?.unwrap_or(defaults.workers),
            poll_interval: env.millis("POLL_INTERVAL_MS")?.unwrap_or(defaults.poll_interval),
            lease_ttl: env.secs("LEASE_TTL_SECS")?.unwrap_or(defaults.lease_ttl),
            retrieval_top_k: env.parse("RETRIEVAL_TOP_K")?.unwrap_or(defaults.retrieval_top_k),
            retrieval_min_score: env
                .parse("RETRIEVAL_MIN_SCORE")?
                .unwrap_or(defaults.retrieval_min_score),
            retry,
            inference,
            model_version: env.string("MODEL_VERSION").unwrap_or(defaults.model_version),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Inconsistent("at least one worker is required".into()));
        }
        if !(1..=MAX_TOP_K).contains(&self.retrieval_top_k) {
            return Err(ConfigError::Inconsistent(format!(
                "retrieval top_k must be 1..={MAX_TOP_K}, got {}",
                self.retrieval_top_k
            )));
        }
        if !self.retrieval_min_score.is_finite() || self.retrieval_min_score < 0.0 {
            return Err(ConfigError::Inconsistent(format!(
                "retrieval min score must be a non-negative number, got {}",
                self.retrieval_min_score
            )));
        }
        if self.retry.infer.base_delay > self.retry.infer.max_delay {
            return Err(ConfigError::Inconsistent(
                "retry base delay exceeds the maximum delay".into(),
            ));
        }
        if self.lease_ttl <= self.inference.timeout {
            return Err(ConfigError::Inconsistent(format!(
                "lease TTL ({}s) must exceed the inference timeout ({}s)",
                self.lease_ttl.as_secs(),
                self.inference.timeout.as_secs()
            )));
        }
        if self.model_version.trim().is_empty() {
            return Err(ConfigError::Inconsistent("model version must not be empty".into()));
        }
        Ok(())
    }

    pub fn retry_controller(&self) -> RetryController {
        RetryController::new(self.retry)
    }

    pub fn stage_set(&self, retriever: Arc<dyn Retriever>, provider: Arc<dyn InferenceProvider>) -> StageSet {
        StageSet::new(retriever, provider, self.retrieval_top_k, self.retrieval_min_score)
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_workers(self.workers)
            .with_poll_interval(self.poll_interval)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value of `CLINFLOW_<name>`.
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    var: format!("{ENV_PREFIX}{name}"),
                    value: value.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }
}
