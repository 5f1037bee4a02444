//! Client configuration and its sources (defaults, JSON, `key=value` pairs, environment).

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VqError};

/// Tunables shared by every table and query opened through one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Max rows per streamed batch requested from the engine.
    pub batch_size_rows: usize,
    /// Limit applied to freshly created vector and hybrid queries.
    pub default_vector_limit: usize,
    /// Probe count applied to freshly created vector queries.
    pub default_nprobes: usize,
    /// Refine factor applied to freshly created vector queries.
    pub default_refine_factor: Option<u32>,
    /// Reciprocal-rank-fusion constant used by the default reranker.
    pub rrf_k: f32,
    /// Reserved for remote transports.
    pub read_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 1024,
            default_vector_limit: 10,
            default_nprobes: 20,
            default_refine_factor: None,
            rrf_k: 60.0,
            read_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document; absent keys keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(raw)
            .map_err(|e| VqError::InvalidConfig(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `VQ_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = ClientConfig::default();
        if let Some(v) = env_parse::<usize>("VQ_BATCH_SIZE_ROWS")? {
            config.batch_size_rows = v;
        }
        if let Some(v) = env_parse::<usize>("VQ_DEFAULT_VECTOR_LIMIT")? {
            config.default_vector_limit = v;
        }
        if let Some(v) = env_parse::<usize>("VQ_DEFAULT_NPROBES")? {
            config.default_nprobes = v;
        }
        if let Some(v) = env_parse::<f32>("VQ_RRF_K")? {
            config.rrf_k = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Applies `key=value` pairs separated by `,` or `;`.
    pub fn apply_kv(&mut self, kv: &str) -> Result<()> {
        for pair in kv
            .split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let Some((k, v)) = pair.split_once('=') else {
                return Err(VqError::InvalidConfig(format!(
                    "invalid config pair '{pair}', expected key=value"
                )));
            };
            let key = k.trim().to_ascii_lowercase();
            let value = v.trim();
            match key.as_str() {
                "batch_size_rows" => self.batch_size_rows = parse_value(&key, value)?,
                "default_vector_limit" => self.default_vector_limit = parse_value(&key, value)?,
                "default_nprobes" => self.default_nprobes = parse_value(&key, value)?,
                "default_refine_factor" => {
                    self.default_refine_factor = match value.to_ascii_lowercase().as_str() {
                        "" | "none" => None,
                        _ => Some(parse_value(&key, value)?),
                    }
                }
                "rrf_k" => self.rrf_k = parse_value(&key, value)?,
                "read_timeout_ms" => self.read_timeout_ms = parse_value(&key, value)?,
                other => {
                    return Err(VqError::InvalidConfig(format!(
                        "unknown config key '{other}'"
                    )));
                }
            }
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size_rows == 0 {
            return Err(VqError::InvalidConfig(
                "batch_size_rows must be > 0".to_string(),
            ));
        }
        if !(self.rrf_k.is_finite() && self.rrf_k > 0.0) {
            return Err(VqError::InvalidConfig(format!(
                "rrf_k must be a positive number, got {}",
                self.rrf_k
            )));
        }
        Ok(())
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| VqError::InvalidConfig(format!("invalid {key} '{value}': {e}")))
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => parse_value(key, raw.trim()).map(Some),
        Err(_) => Ok(None),
    }
}
