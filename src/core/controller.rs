//! Drives one backup or restore from start to a terminal state.
//!
//! ```text
//! Idle -> Running -> Completed
//!            \-> Aborting -> Aborted
//! ```
//!
//! The controller runs on an async task and never blocks it: the job runs on
//! its own worker thread, gate revocation goes through `spawn_blocking`, and
//! the bounded wait after an abort is a separate supervisory task.

use anyhow::{Context, Result, bail};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::control::Revocation;
use super::export::{self, ExportOperation};
use super::import::ImportOperation;
use super::job::{ArchiveOperation, ChannelCallback, JobHandle, JobLauncher, ZipBackupJob};
use super::models::{Direction, FailureKind, JobEvent, JobOutcome};
use super::progress::{ProgressModel, restart_message};
use crate::context::AppContext;

/// The host UI. Calls happen on the controller's task, one at a time.
pub trait ProgressView: Send {
    fn render(&mut self, model: &ProgressModel);

    /// Ask whether the running job should really be aborted.
    fn confirm_abort(&mut self, direction: Direction) -> bool;

    /// The application must be restarted to pick up restored state.
    fn prompt_restart(&mut self, message: &str);

    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    Completed(JobOutcome),
    Aborting,
    Aborted {
        /// Whether the worker thread exited before the abort timeout.
        worker_stopped: bool,
        /// The job had already published its output when the abort arrived.
        output_kept: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    /// Back navigation or close while the screen is up.
    RequestExit,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub direction: Direction,
    /// Archive to write for an export, archive to read for an import.
    pub target: PathBuf,
}

pub struct BackupRestoreController<V: ProgressView> {
    ctx: AppContext,
    view: V,
    launcher: JobLauncher,
    state: ControllerState,
    model: Option<ProgressModel>,
}

impl<V: ProgressView> BackupRestoreController<V> {
    pub fn new(ctx: AppContext, view: V) -> Self {
        Self {
            ctx,
            view,
            launcher: JobLauncher::new(),
            state: ControllerState::Idle,
            model: None,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn model(&self) -> Option<&ProgressModel> {
        self.model.as_ref()
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn operation_for(&self, request: &JobRequest) -> Box<dyn ArchiveOperation> {
        match request.direction {
            Direction::Export => Box::new(ExportOperation::new(
                self.ctx.store.clone(),
                request.target.clone(),
                self.ctx.config.compression,
            )),
            Direction::Import => Box::new(ImportOperation::new(
                self.ctx.store.clone(),
                request.target.clone(),
            )),
        }
    }

    /// Run the requested job until it completes or is aborted.
    pub async fn run(
        &mut self,
        request: JobRequest,
        commands: mpsc::Receiver<UserCommand>,
    ) -> Result<ControllerState> {
        let operation = self.operation_for(&request);
        self.run_operation(operation, commands).await
    }

    pub async fn run_operation(
        &mut self,
        operation: Box<dyn ArchiveOperation>,
        mut commands: mpsc::Receiver<UserCommand>,
    ) -> Result<ControllerState> {
        if self.state != ControllerState::Idle {
            bail!("Controller has already run a job");
        }

        let direction = operation.direction();
        let (tx, mut events) = mpsc::channel(self.ctx.config.event_channel_capacity);
        let job = ZipBackupJob::new(operation, Box::new(ChannelCallback::new(tx)));
        let mut handle = self
            .launcher
            .launch(job)
            .context("Failed to spawn backup worker thread")?;

        info!(job_id = %handle.id(), %direction, path = %handle.target().display(), "Running job");
        self.state = ControllerState::Running;
        self.update_model(|_| {}, ProgressModel::new(direction));

        let mut commands_open = true;
        loop {
            tokio::select! {
                biased;

                event = events.recv() => match event {
                    Some(JobEvent::Progress(report)) => {
                        self.update_model(|m| m.apply_progress(&report), ProgressModel::new(direction));
                    }
                    Some(JobEvent::Finished(outcome)) => {
                        self.complete(&mut handle, outcome).await;
                        break;
                    }
                    None => {
                        let outcome = JobOutcome::Failure {
                            kind: FailureKind::Io,
                            message: Some("Worker stopped without reporting a result".to_string()),
                        };
                        self.complete(&mut handle, outcome).await;
                        break;
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(UserCommand::RequestExit) => {
                        if self.view.confirm_abort(direction) {
                            self.abort(&mut handle, &mut events).await;
                            break;
                        }
                        debug!("Abort declined");
                    }
                    None => commands_open = false,
                },
            }
        }

        Ok(self.state.clone())
    }

    fn update_model(&mut self, change: impl FnOnce(&mut ProgressModel), initial: ProgressModel) {
        let model = self.model.get_or_insert(initial);
        change(model);
        self.view.render(model);
    }

    async fn complete(&mut self, handle: &mut JobHandle, outcome: JobOutcome) {
        let direction = handle.direction();
        self.update_model(|m| m.apply_outcome(&outcome), ProgressModel::new(direction));

        match &outcome {
            JobOutcome::Failure { message, .. } => {
                warn!(job_id = %handle.id(), %direction, error = ?message, "Job failed");
                if direction == Direction::Export {
                    remove_partial_output(handle.target());
                }
            }
            JobOutcome::Success { warnings } => {
                info!(job_id = %handle.id(), %direction, warnings = warnings.is_some(), "Job succeeded");
            }
        }

        if !handle.wait_for_exit(self.ctx.config.abort_timeout()).await {
            warn!(job_id = %handle.id(), "Worker thread did not exit after reporting its result");
        }

        let restart = match (&outcome, direction) {
            (JobOutcome::Success { warnings }, Direction::Import) => {
                Some(restart_message(warnings.as_deref()))
            }
            _ => None,
        };

        self.state = ControllerState::Completed(outcome);

        match restart {
            Some(message) => self.view.prompt_restart(&message),
            None => self.view.close(),
        }
    }

    async fn abort(&mut self, handle: &mut JobHandle, events: &mut mpsc::Receiver<JobEvent>) {
        let direction = handle.direction();
        info!(job_id = %handle.id(), %direction, "Aborting");

        self.state = ControllerState::Aborting;
        self.update_model(|m| m.start_abort(), ProgressModel::new(direction));

        let revocation = handle.revoke().await;
        let mut supervisor = handle.supervise(self.ctx.config.abort_timeout());

        // Keep draining so a worker blocked on a full channel can reach its
        // next checkpoint.
        let mut events_open = true;
        let worker_stopped = loop {
            tokio::select! {
                stopped = &mut supervisor => break stopped.unwrap_or(false),
                event = events.recv(), if events_open => match event {
                    Some(event) => debug!(?event, "Discarding event from aborted job"),
                    None => events_open = false,
                },
            }
        };

        let output_kept = revocation == Revocation::AlreadyCommitted;
        if output_kept {
            info!(job_id = %handle.id(), "Job published its output before the abort took effect");
        } else if direction == Direction::Export {
            remove_partial_output(handle.target());
        }

        info!(job_id = %handle.id(), %direction, worker_stopped, "Aborted");
        self.state = ControllerState::Aborted {
            worker_stopped,
            output_kept,
        };

        // Restored state is already live; running components must be restarted.
        if output_kept && direction == Direction::Import {
            self.view.prompt_restart(&restart_message(None));
        } else {
            self.view.close();
        }
    }
}

fn remove_partial_output(target: &Path) {
    let partial = export::partial_path(target);
    match fs::remove_file(&partial) {
        Ok(()) => info!(path = %partial.display(), "Deleted incomplete export"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %partial.display(), error = %e, "Failed to delete incomplete export"),
    }
}
