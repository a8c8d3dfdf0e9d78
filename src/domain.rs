use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::DetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(u64);

impl TrialId {
    pub fn new(value: u64) -> Result<Self, DetError> {
        if value == 0 {
            return Err(DetError::InvalidTrialId(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TrialId {
    type Err = DetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed = value
            .trim()
            .parse::<u64>()
            .map_err(|_| DetError::InvalidTrialId(value.to_string()))?;
        Self::new(parsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(u64);

impl ExperimentId {
    pub fn new(value: u64) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity levels in ascending order, matching the master's `LOG_LEVEL_*` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
#[value(rename_all = "UPPER")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    pub fn api_name(self) -> String {
        format!("LOG_LEVEL_{}", self.as_str())
    }

    /// Every level at or above `self`, as the master expects them in a `levels` filter.
    pub fn at_or_above(self) -> Vec<LogLevel> {
        Self::ALL.into_iter().filter(|level| *level >= self).collect()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = DetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let name = normalized.trim_start_matches("LOG_LEVEL_");
        match name {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            _ => Err(DetError::InvalidLogLevel(value.to_string())),
        }
    }
}

/// Strips the `LOG_LEVEL_` prefix the v1 API puts on level names.
pub fn display_level(raw: &str) -> &str {
    raw.strip_prefix("LOG_LEVEL_").unwrap_or(raw)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "TrialLogRecord")]
pub struct TrialLogLine {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdtype: Option<String>,
}

impl TrialLogLine {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: None,
            level: None,
            agent_id: None,
            container_id: None,
            rank_id: None,
            source: None,
            stdtype: None,
        }
    }
}

/// Wire shape of a trial log entry. Newer masters send `log` next to (or
/// instead of) `message`; `message` wins when both are present.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrialLogRecord {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    log: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    container_id: Option<String>,
    #[serde(default)]
    rank_id: Option<i64>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    stdtype: Option<String>,
}

impl TryFrom<TrialLogRecord> for TrialLogLine {
    type Error = DetError;

    fn try_from(record: TrialLogRecord) -> Result<Self, Self::Error> {
        let message = record.message.or(record.log).ok_or_else(|| {
            DetError::Decode("trial log entry has neither `message` nor `log`".to_string())
        })?;
        Ok(Self {
            message,
            timestamp: record.timestamp,
            level: record.level,
            agent_id: record.agent_id,
            container_id: record.container_id,
            rank_id: record.rank_id,
            source: record.source,
            stdtype: record.stdtype,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterLogLine {
    #[serde(alias = "time")]
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

impl fmt::Display for MasterLogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: {}",
            self.timestamp,
            display_level(&self.level),
            self.message
        )
    }
}

/// An RFC 3339 timestamp kept in the form the user typed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc3339(String);

impl Rfc3339 {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Rfc3339 {
    type Err = DetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        DateTime::parse_from_rfc3339(trimmed)
            .map_err(|_| DetError::InvalidTimestamp(value.to_string()))?;
        Ok(Self(trimmed.to_string()))
    }
}
