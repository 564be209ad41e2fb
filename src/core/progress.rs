//! UI-agnostic model of a backup/restore screen.
//!
//! The controller folds job events into this model; a host view only has to
//! render it. Nothing here is persisted.

use serde::Serialize;

use super::models::{Direction, JobOutcome, Percent, ProgressReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Running,
    Succeeded,
    Failed,
    Aborting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressModel {
    pub direction: Direction,
    /// Banner above the progress bar, hidden when `None`.
    pub hint: Option<String>,
    pub percent: Percent,
    pub show_percentage: bool,
    pub message: String,
    pub phase: Phase,
}

impl ProgressModel {
    pub fn new(direction: Direction) -> Self {
        let activity = match direction {
            Direction::Import => "Importing data",
            Direction::Export => "Exporting data",
        };

        Self {
            direction,
            hint: Some(format!(
                "{}. Do not exit until the operation completes.",
                activity
            )),
            percent: Percent::Indeterminate,
            show_percentage: true,
            message: String::new(),
            phase: Phase::Running,
        }
    }

    /// Apply a progress report. A report of 0% is shown as indeterminate.
    pub fn apply_progress(&mut self, report: &ProgressReport) {
        self.percent = match report.percent {
            Percent::Value(0) => Percent::Indeterminate,
            other => other,
        };
        self.message = report.message.clone();
    }

    pub fn apply_outcome(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Success { .. } => {
                self.phase = Phase::Succeeded;
                self.hint = None;
                self.percent = Percent::Value(100);
                self.message = match self.direction {
                    Direction::Import => "Import complete".to_string(),
                    Direction::Export => "Export complete".to_string(),
                };
            }
            JobOutcome::Failure { message, .. } => {
                self.phase = Phase::Failed;
                self.hint = Some(
                    match self.direction {
                        Direction::Import => "Import failed",
                        Direction::Export => "Export failed",
                    }
                    .to_string(),
                );
                self.message = message.clone().unwrap_or_default();
                self.show_percentage = false;
            }
        }
    }

    pub fn start_abort(&mut self) {
        self.phase = Phase::Aborting;
        self.hint = None;
        self.percent = Percent::Indeterminate;
        self.message = match self.direction {
            Direction::Import => "Aborting import".to_string(),
            Direction::Export => "Aborting export".to_string(),
        };
    }
}

/// Text for the restart prompt shown after a successful import.
pub fn restart_message(warnings: Option<&str>) -> String {
    let mut message = format!(
        "The restored data is in place. Restart {} so every component picks it up.",
        env!("CARGO_PKG_NAME")
    );
    if let Some(warnings) = warnings {
        message.push_str("\n\n");
        message.push_str(warnings);
    }
    message
}
