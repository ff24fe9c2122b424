// SPDX-License-Identifier: MIT

//! Runtime settings read from the environment (and `.env` via dotenv)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backend::error::CasefileError;
use crate::backend::model::GenerationConfig;
use crate::backend::retry::RetryPolicy;
use crate::casefile::workflow::graph::{FailurePolicy, SchedulerConfig};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-large";

#[derive(Debug, Clone)]
pub struct Settings {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub temperature: f32,
    pub index_dir: PathBuf,
    /// `None` keeps checkpoints in memory
    pub checkpoint_dir: Option<PathBuf>,
    /// `None` uses the built-in pipeline
    pub pipeline_path: Option<PathBuf>,
    pub retry_max_attempts: u32,
    pub retry_max_wait: Duration,
    pub wave_timeout: Option<Duration>,
    /// `None` disables session eviction
    pub session_ttl: Option<Duration>,
    pub failure_policy: FailurePolicy,
    pub kanoon_token: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, CasefileError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CasefileError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: get("CASEFILE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            embedding_model: get("CASEFILE_EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            temperature: parse(&get, "CASEFILE_TEMPERATURE", 0.1)?,
            index_dir: get("CASEFILE_INDEX_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("indices")),
            checkpoint_dir: get("CASEFILE_CHECKPOINT_DIR").map(PathBuf::from),
            pipeline_path: get("CASEFILE_PIPELINE").map(PathBuf::from),
            retry_max_attempts: parse(&get, "CASEFILE_RETRY_MAX_ATTEMPTS", 6)?,
            retry_max_wait: Duration::from_secs(parse(&get, "CASEFILE_RETRY_MAX_WAIT_SECS", 60)?),
            wave_timeout: optional_secs(parse(&get, "CASEFILE_WAVE_TIMEOUT_SECS", 900)?),
            session_ttl: optional_secs(parse::<u64, _>(&get, "CASEFILE_SESSION_TTL_HOURS", 24)? * 3600),
            failure_policy: parse(&get, "CASEFILE_FAILURE_POLICY", FailurePolicy::BestEffort)?,
            kanoon_token: get("INDIAN_KANOON_API_TOKEN"),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts, self.retry_max_wait)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            failure_policy: self.failure_policy,
            wave_timeout: self.wave_timeout,
        }
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: Some(self.temperature),
            ..Default::default()
        }
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, CasefileError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CasefileError::config(format!("{}={}: {}", key, raw, e))),
    }
}

/// Zero disables
fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
