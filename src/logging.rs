//! Tracing setup for the CLI and job-scoped log helpers.
//!
//! Progress goes to stdout, so every log layer writes to stderr. Everything a
//! job logs happens inside its [`job_span`], which carries the job id and
//! direction into text and JSON output alike.

use tracing::{Level, Span, info_span};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::Direction;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    pub json: bool,
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is unset. The archive and SQLite crates
    /// stay at `warn` even in verbose mode.
    pub fn default_filter(&self) -> String {
        let level = if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        format!(
            "warn,{}={}",
            env!("CARGO_CRATE_NAME"),
            level.as_str().to_lowercase()
        )
    }
}

/// Install the global subscriber. Call once, after the configuration is
/// loaded.
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_names(true),
            )
            .init();
    }
}

/// Span wrapping one job run on its worker thread.
pub fn job_span(id: Uuid, direction: Direction) -> Span {
    info_span!("job", job_id = %id, %direction)
}

/// Decides which entries of a long export or import get a debug line: the
/// first, the last, and one per `1/steps` of the total in between.
#[derive(Debug, Clone)]
pub struct EntryLogThrottle {
    total: usize,
    stride: usize,
    next: usize,
}

impl EntryLogThrottle {
    pub fn new(total: usize, steps: usize) -> Self {
        Self {
            total,
            stride: (total / steps.max(1)).max(1),
            next: 0,
        }
    }

    /// `index` is zero-based and must not go backwards.
    pub fn should_log(&mut self, index: usize) -> bool {
        if index + 1 == self.total {
            return true;
        }
        if index < self.next {
            return false;
        }
        self.next = (index / self.stride + 1) * self.stride;
        true
    }
}
