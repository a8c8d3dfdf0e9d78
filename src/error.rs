use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DetError {
    #[error("invalid trial id: {0}")]
    InvalidTrialId(String),

    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("invalid timestamp (expected RFC 3339): {0}")]
    InvalidTimestamp(String),

    #[error("invalid master address: {0}")]
    InvalidMaster(String),

    #[error("invalid log query: {0}")]
    InvalidQuery(String),

    #[error("not logged in to {0}")]
    #[diagnostic(help("set DET_USER_TOKEN or log in so that ~/.determined/auth.json holds a token"))]
    NotLoggedIn(String),

    #[error("failed to read auth file at {0}")]
    AuthFileRead(PathBuf),

    #[error("failed to parse auth file: {0}")]
    AuthFileParse(String),

    #[error("master request failed: {0}")]
    MasterHttp(String),

    #[error("master returned status {status}: {message}")]
    MasterStatus { status: u16, message: String },

    #[error("master stream error: {0}")]
    MasterStream(String),

    #[error("failed to decode master response: {0}")]
    Decode(String),

    #[error("trial response has no experiment id")]
    MissingExperimentId,

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("output error: {0}")]
    Output(String),
}

impl DetError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DetError::MasterStatus { status: 404, .. })
    }
}
