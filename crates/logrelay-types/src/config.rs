//! Configuration for the pipeline and its sink
//!
//! Loaded from an optional TOML file; the CLI overrides individual fields.

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::OrphanPolicy;

/// Default cap on lines per record; records are unbounded unless configured
pub const DEFAULT_MAX_LINES: usize = 0;

const DEFAULT_START_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}";
const DEFAULT_EXTRACT_PATTERN: &str = r"(?s)^(?P<message>(?P<time>\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?).*)$";
const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("extract pattern is missing the named group `{0}`")]
    MissingGroup(&'static str),

    #[error("invalid duration `{0}`")]
    Duration(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Top-level config file layout
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub pipeline: PipelineConfig,
    pub sink: SinkConfig,
}

impl FileConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// Multi-line stage settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Matches the first line of a record
    pub start_pattern: String,

    /// Inactivity timeout after the last appended line
    #[serde(deserialize_with = "de_duration")]
    pub max_wait_time: Duration,

    /// Applied to the reassembled record; needs `time` and `message` groups
    pub extract_pattern: String,

    /// chrono format used when the `time` capture is not RFC 3339
    pub time_format: String,

    /// Flush once a record holds this many lines (0 = no limit)
    pub max_lines: usize,

    pub orphan_policy: OrphanPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            start_pattern: DEFAULT_START_PATTERN.to_string(),
            max_wait_time: Duration::from_secs(3),
            extract_pattern: DEFAULT_EXTRACT_PATTERN.to_string(),
            time_format: DEFAULT_TIME_FORMAT.to_string(),
            max_lines: DEFAULT_MAX_LINES,
            orphan_policy: OrphanPolicy::Wrap,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Stdout,
    Loki,
}

/// Where structured records go
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,

    /// Push endpoint, required for `loki`
    pub url: Option<String>,

    /// Sent as `X-Scope-OrgID` when set
    pub tenant_id: Option<String>,

    /// Records per push request
    pub batch_size: usize,

    /// Longest a partial batch may wait before it is pushed
    #[serde(deserialize_with = "de_duration")]
    pub batch_wait: Duration,

    /// Static stream labels
    pub labels: BTreeMap<String, String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Stdout,
            url: None,
            tenant_id: None,
            batch_size: 100,
            batch_wait: Duration::from_secs(1),
            labels: BTreeMap::new(),
        }
    }
}

/// Parse durations like `250ms`, `3s`, `1m30s` or `2h`; a bare number means seconds
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ConfigError::Duration(input.to_string()));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(ConfigError::Duration(input.to_string()));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| ConfigError::Duration(input.to_string()))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let step = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => return Err(ConfigError::Duration(input.to_string())),
        };
        total += step;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration("s3").is_err());
    }

    #[test]
    fn test_file_config_from_toml() {
        let config = FileConfig::from_toml_str(
            r#"
            [pipeline]
            start_pattern = '^\d{4}'
            max_wait_time = "500ms"
            orphan_policy = "discard"

            [sink]
            kind = "loki"
            url = "http://loki:3100/loki/api/v1/push"
            batch_wait = 2

            [sink.labels]
            job = "app"
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.start_pattern, r"^\d{4}");
        assert_eq!(config.pipeline.max_wait_time, Duration::from_millis(500));
        assert_eq!(config.pipeline.orphan_policy, OrphanPolicy::Discard);
        assert_eq!(config.pipeline.max_lines, DEFAULT_MAX_LINES);
        assert_eq!(config.sink.kind, SinkKind::Loki);
        assert_eq!(config.sink.batch_wait, Duration::from_secs(2));
        assert_eq!(config.sink.batch_size, 100);
        assert_eq!(config.sink.labels.get("job").map(String::as_str), Some("app"));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FileConfig::from_toml_str("").unwrap();
        assert_eq!(config.pipeline.max_wait_time, Duration::from_secs(3));
        assert_eq!(config.sink.kind, SinkKind::Stdout);
    }
}
