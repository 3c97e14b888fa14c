//! Shared types for logrelay
//!
//! This crate contains data structures used by both the readiness gate and
//! the log pipeline, plus the configuration they are built from.

mod config;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

pub use config::{
    parse_duration, ConfigError, FileConfig, PipelineConfig, SinkConfig, SinkKind,
    DEFAULT_MAX_LINES,
};

// ============================================================================
// Readiness Gate Types
// ============================================================================

/// How the gate checks that an endpoint is up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    /// Open a TCP connection and close it again
    Tcp,
    /// Issue `GET <path>` and expect a 2xx answer
    Http { path: String },
}

impl ProbeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Http { .. } => "http",
        }
    }
}

/// Credential flavours, each read from its own environment namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    /// `<PREFIX>_USER` and `<PREFIX>_PASSWORD`
    Basic,
    /// `<PREFIX>_TOKEN`
    Bearer,
}

/// Pointer to a credential living in the environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialRef {
    pub kind: CredentialKind,
    pub prefix: String,
}

impl CredentialRef {
    pub fn new(kind: CredentialKind, prefix: impl Into<String>) -> Self {
        Self {
            kind,
            prefix: prefix.into(),
        }
    }

    /// Resolve against the process environment
    pub fn resolve(&self) -> Result<Credential, ConfigError> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve with a custom lookup (used by tests and embedders)
    pub fn resolve_with<F>(&self, lookup: F) -> Result<Credential, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let key = format!("{}_{}", self.prefix, suffix);
            lookup(&key).ok_or(ConfigError::MissingEnv(key))
        };

        match self.kind {
            CredentialKind::Basic => Ok(Credential::Basic {
                username: var("USER")?,
                password: var("PASSWORD")?,
            }),
            CredentialKind::Bearer => Ok(Credential::Bearer { token: var("TOKEN")? }),
        }
    }
}

/// A resolved credential
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Self::Bearer { .. } => f.debug_struct("Bearer").field("token", &"***").finish(),
        }
    }
}

/// A dependency the gate waits for
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub probe: ProbeKind,
    pub credential: Option<Credential>,
}

impl Endpoint {
    pub fn new(host: String, port: u16, probe: ProbeKind) -> Self {
        Self {
            host,
            port,
            probe,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// `host:port`, as used for socket addresses
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.probe {
            ProbeKind::Tcp => write!(f, "tcp://{}", self.authority()),
            ProbeKind::Http { path } => write!(f, "http://{}{}", self.authority(), path),
        }
    }
}

/// Why a probe failed, used to pick a backoff
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Connection refused, DNS failure, reset
    Connect,
    /// The attempt did not finish in time
    Timeout,
    /// Endpoint answered but rejected our credential
    Auth,
    /// Endpoint answered with something unexpected
    Protocol,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::Protocol => "protocol",
        }
    }
}

/// Result of one probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Success,
    Failure { class: FailureClass, message: String },
}

/// One tick of the gate loop
#[derive(Clone, Debug)]
pub struct PollAttempt {
    /// 1-based attempt number
    pub attempt: u32,

    /// Wall-clock time the probe finished
    pub at: DateTime<Utc>,

    pub outcome: PollOutcome,
}

impl PollAttempt {
    pub fn is_success(&self) -> bool {
        self.outcome == PollOutcome::Success
    }
}

// ============================================================================
// Log Pipeline Types
// ============================================================================

/// A single line as received from the upstream log source
#[derive(Clone, Debug)]
pub struct RawLine {
    pub text: String,

    /// When the line reached the pipeline
    pub received_at: Instant,
}

impl RawLine {
    /// Stamp a line with the current instant
    pub fn new(text: impl Into<String>) -> Self {
        Self::at(text, Instant::now())
    }

    pub fn at(text: impl Into<String>, received_at: Instant) -> Self {
        Self {
            text: text.into(),
            received_at,
        }
    }
}

/// A reassembled, field-extracted log record
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StructuredRecord {
    /// Parsed `time` capture, if the record matched and the value parsed
    pub time: Option<DateTime<Utc>>,

    /// `message` capture, or the full reassembled text when extraction failed
    pub message: String,

    /// Number of raw lines folded into this record
    pub line_count: usize,

    /// Any other named captures of the extract pattern
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl StructuredRecord {
    /// Record produced when the extract pattern did not match
    pub fn degraded(message: String, line_count: usize) -> Self {
        Self {
            time: None,
            message,
            line_count,
            labels: BTreeMap::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.time.is_none()
    }
}

/// What to do with a continuation line that arrives while no record is open
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Start a new record with it so nothing is lost
    #[default]
    Wrap,
    /// Drop it
    Discard,
}
