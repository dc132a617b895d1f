use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::WekeoError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    #[default]
    Basic,
    Bearer,
    Raw,
}

/// Access token issued by the broker. Read-only for the whole session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    scheme: AuthScheme,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into().trim().to_string(),
            scheme: AuthScheme::Basic,
        }
    }

    pub fn with_scheme(mut self, scheme: AuthScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn header_value(&self) -> String {
        match self.scheme {
            AuthScheme::Basic => format!("Basic {}", self.token),
            AuthScheme::Bearer => format!("Bearer {}", self.token),
            AuthScheme::Raw => self.token.clone(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("scheme", &self.scheme)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct JobHandle(String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobHandle {
    type Err = WekeoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|ch| !ch.is_whitespace() && ch != '/' && ch != '?' && ch != '#');
        if !is_valid {
            return Err(WekeoError::InvalidJobHandle(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for JobHandle {
    type Error = WekeoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Status string reported by the broker for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Unknown(String),
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            other => JobStatus::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Unknown(raw) => write!(f, "unknown ({raw})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TerminalStatus {
    pub fn is_success(self) -> bool {
        matches!(self, TerminalStatus::Completed)
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalStatus::Completed => write!(f, "completed"),
            TerminalStatus::Failed => write!(f, "failed"),
            TerminalStatus::Cancelled => write!(f, "cancelled"),
            TerminalStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultManifest {
    entries: Vec<ManifestEntry>,
}

impl ResultManifest {
    /// Builds a manifest; at least one entry is required.
    pub fn new(entries: Vec<ManifestEntry>) -> Result<Self, WekeoError> {
        if entries.is_empty() {
            return Err(WekeoError::Manifest("manifest has no entries".to_string()));
        }
        Ok(Self { entries })
    }

    pub fn primary(&self) -> &ManifestEntry {
        &self.entries[0]
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MaterializeMode {
    InMemory,
    ToFile,
    Archive,
}

impl fmt::Display for MaterializeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializeMode::InMemory => write!(f, "in-memory"),
            MaterializeMode::ToFile => write!(f, "to-file"),
            MaterializeMode::Archive => write!(f, "archive"),
        }
    }
}
