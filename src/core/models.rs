use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a job writes an archive or restores from one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Import,
    Export,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Percent {
    Indeterminate,
    Value(u8),
}

impl Percent {
    /// Clamps to 100.
    pub fn of(value: u32) -> Self {
        Self::Value(value.min(100) as u8)
    }

    pub fn value(&self) -> Option<u8> {
        match self {
            Self::Indeterminate => None,
            Self::Value(v) => Some(*v),
        }
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indeterminate => f.write_str("--%"),
            Self::Value(v) => write!(f, "{}%", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    pub percent: Percent,
    pub message: String,
}

impl ProgressReport {
    pub fn new(percent: u32, message: impl Into<String>) -> Self {
        Self {
            percent: Percent::of(percent),
            message: message.into(),
        }
    }

    pub fn indeterminate(message: impl Into<String>) -> Self {
        Self {
            percent: Percent::Indeterminate,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Io,
    Format,
    Cancelled,
}

/// Terminal result of a job. Produced exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobOutcome {
    Success {
        warnings: Option<String>,
    },
    Failure {
        kind: FailureKind,
        message: Option<String>,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Message sent from the worker thread to whoever drives the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Progress(ProgressReport),
    Finished(JobOutcome),
}
