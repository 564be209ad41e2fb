//! Backup jobs, the callback contract they report through, and the launcher
//! that runs each job on its own worker thread.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::control::{JobControl, Revocation};
use super::error::BackupError;
use super::models::{Direction, FailureKind, JobEvent, JobOutcome, ProgressReport};
use crate::logging;

/// Receives the notifications of one job run.
pub trait BackupCallback: Send {
    fn on_progress(&mut self, report: ProgressReport);

    fn on_success(&mut self, warnings: Option<String>);

    fn on_failure(&mut self, kind: FailureKind, message: Option<String>);
}

/// Forwards job notifications as [`JobEvent`]s over a bounded channel.
///
/// Sends block the worker when the consumer falls behind. A dropped receiver
/// is not an error; the job keeps running and its events are discarded.
pub struct ChannelCallback {
    tx: mpsc::Sender<JobEvent>,
}

impl ChannelCallback {
    pub fn new(tx: mpsc::Sender<JobEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: JobEvent) {
        if self.tx.blocking_send(event).is_err() {
            debug!("Job event receiver dropped");
        }
    }
}

impl BackupCallback for ChannelCallback {
    fn on_progress(&mut self, report: ProgressReport) {
        self.send(JobEvent::Progress(report));
    }

    fn on_success(&mut self, warnings: Option<String>) {
        self.send(JobEvent::Finished(JobOutcome::Success { warnings }));
    }

    fn on_failure(&mut self, kind: FailureKind, message: Option<String>) {
        self.send(JobEvent::Finished(JobOutcome::Failure { kind, message }));
    }
}

/// Wraps a callback so that it sees exactly one terminal notification and no
/// progress after it.
struct Reporter {
    callback: Box<dyn BackupCallback>,
    finished: bool,
}

impl Reporter {
    fn new(callback: Box<dyn BackupCallback>) -> Self {
        Self {
            callback,
            finished: false,
        }
    }

    fn progress(&mut self, report: ProgressReport) {
        if self.finished {
            warn!(message = %report.message, "Dropping progress reported after job finished");
            return;
        }
        self.callback.on_progress(report);
    }

    fn success(&mut self, warnings: Option<String>) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }
        self.callback.on_success(warnings);
    }

    fn failure(&mut self, kind: FailureKind, message: String) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }
        self.callback.on_failure(kind, Some(message));
    }
}

pub type ProgressFn<'a> = dyn FnMut(ProgressReport) + 'a;

/// The archive work a job performs.
///
/// Implementations run on the worker thread, call `control.checkpoint()`
/// between units of work, publish their output only through
/// `control.commit`, and remove their own partial artefacts on failure.
pub trait ArchiveOperation: Send {
    fn direction(&self) -> Direction;

    fn target(&self) -> &Path;

    /// Returns the warnings to attach to a successful outcome.
    fn execute(
        &mut self,
        control: &JobControl,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Option<String>, BackupError>;
}

/// One export or import, run once.
pub struct ZipBackupJob {
    id: Uuid,
    control: JobControl,
    operation: Box<dyn ArchiveOperation>,
    callback: Box<dyn BackupCallback>,
}

impl ZipBackupJob {
    pub fn new(operation: Box<dyn ArchiveOperation>, callback: Box<dyn BackupCallback>) -> Self {
        Self {
            id: Uuid::now_v7(),
            control: JobControl::new(),
            operation,
            callback,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.operation.direction()
    }

    pub fn target(&self) -> &Path {
        self.operation.target()
    }

    pub fn control(&self) -> JobControl {
        self.control.clone()
    }

    /// Request cancellation. Idempotent, non-blocking, callable from any
    /// thread through a [`JobControl`] clone.
    pub fn abort(&self) {
        self.control.abort();
    }

    /// Execute the job on the calling thread. Never panics; the outcome is
    /// delivered to the callback exactly once.
    pub fn run(self) {
        let Self {
            id,
            control,
            mut operation,
            callback,
        } = self;
        let direction = operation.direction();
        let span = logging::job_span(id, direction);
        let _enter = span.enter();
        let mut reporter = Reporter::new(callback);

        if control.is_aborted() {
            info!("Job aborted before it started");
            let err = BackupError::Cancelled;
            reporter.failure(err.kind(), err.to_string());
            return;
        }

        info!(path = %operation.target().display(), "Job started");

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            operation.execute(&control, &mut |report| reporter.progress(report))
        }));

        match result {
            Ok(Ok(warnings)) => {
                info!(warnings = warnings.is_some(), "Job complete");
                reporter.success(warnings);
            }
            Ok(Err(err)) => {
                match err.kind() {
                    FailureKind::Cancelled => info!("Job aborted"),
                    _ => error!(error = %err, "Job failed"),
                }
                reporter.failure(err.kind(), err.to_string());
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(panic = %message, "Job panicked");
                reporter.failure(FailureKind::Io, format!("Internal error: {}", message));
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Starts jobs on dedicated worker threads.
#[derive(Debug, Default, Clone)]
pub struct JobLauncher;

impl JobLauncher {
    pub fn new() -> Self {
        Self
    }

    pub fn launch(&self, job: ZipBackupJob) -> std::io::Result<JobHandle> {
        let (exit_tx, exit_rx) = oneshot::channel();
        let id = job.id();
        let handle = JobHandle {
            id,
            direction: job.direction(),
            target: job.target().to_path_buf(),
            control: job.control(),
            exited: Some(exit_rx),
        };

        let short_id = id.simple().to_string();
        thread::Builder::new()
            .name(format!("backup-restore-{}", &short_id[short_id.len() - 8..]))
            .spawn(move || {
                let _signal = ExitSignal(Some(exit_tx));
                job.run();
            })?;

        debug!(job_id = %id, "Worker thread spawned");
        Ok(handle)
    }
}

/// Fires when the worker thread is done with the job, however it ends.
struct ExitSignal(Option<oneshot::Sender<()>>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// What the UI side holds for a running job.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    direction: Direction,
    target: PathBuf,
    control: JobControl,
    exited: Option<oneshot::Receiver<()>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Cancel and close the commit gate, off the async executor.
    pub async fn revoke(&self) -> Revocation {
        let control = self.control.clone();
        match tokio::task::spawn_blocking(move || control.revoke()).await {
            Ok(revocation) => revocation,
            Err(e) => {
                error!(job_id = %self.id, error = %e, "Revocation task failed");
                // The token is cancelled either way; report the conservative answer.
                if self.control.is_committed() {
                    Revocation::AlreadyCommitted
                } else {
                    Revocation::Revoked
                }
            }
        }
    }

    /// Spawn the supervisory task: it resolves to `true` once the worker
    /// thread exits, or to `false` if it is still running after `timeout`.
    pub fn supervise(&mut self, timeout: Duration) -> tokio::task::JoinHandle<bool> {
        let exited = self.exited.take();
        let id = self.id;

        tokio::spawn(async move {
            let Some(exited) = exited else {
                return true;
            };
            match tokio::time::timeout(timeout, exited).await {
                Ok(_) => true,
                Err(_) => {
                    warn!(job_id = %id, timeout_secs = timeout.as_secs_f64(), "Worker still running after abort timeout");
                    false
                }
            }
        })
    }

    /// Wait for the worker thread to exit. Returns `false` if it was still
    /// running when `timeout` expired.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let Some(exited) = self.exited.as_mut() else {
            return true;
        };

        match tokio::time::timeout(timeout, exited).await {
            Ok(_) => {
                self.exited = None;
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Progress(ProgressReport),
        Success(Option<String>),
        Failure(FailureKind, Option<String>),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Call>>>);

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().clone()
        }
    }

    impl BackupCallback for Recorder {
        fn on_progress(&mut self, report: ProgressReport) {
            self.0.lock().unwrap().push(Call::Progress(report));
        }

        fn on_success(&mut self, warnings: Option<String>) {
            self.0.lock().unwrap().push(Call::Success(warnings));
        }

        fn on_failure(&mut self, kind: FailureKind, message: Option<String>) {
            self.0.lock().unwrap().push(Call::Failure(kind, message));
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        CheckCancel,
    }

    struct Scripted {
        behaviour: Behaviour,
        target: PathBuf,
        executed: Arc<Mutex<bool>>,
    }

    impl Scripted {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                target: PathBuf::from("/tmp/scripted.zip"),
                executed: Arc::default(),
            }
        }
    }

    impl ArchiveOperation for Scripted {
        fn direction(&self) -> Direction {
            Direction::Export
        }

        fn target(&self) -> &Path {
            &self.target
        }

        fn execute(
            &mut self,
            control: &JobControl,
            progress: &mut ProgressFn<'_>,
        ) -> Result<Option<String>, BackupError> {
            *self.executed.lock().unwrap() = true;
            progress(ProgressReport::new(50, "halfway"));
            match self.behaviour {
                Behaviour::Succeed => {
                    progress(ProgressReport::new(100, "done"));
                    Ok(None)
                }
                Behaviour::Fail => Err(BackupError::format("broken")),
                Behaviour::Panic => panic!("exploded"),
                Behaviour::CheckCancel => {
                    control.abort();
                    control.checkpoint()?;
                    Ok(None)
                }
            }
        }
    }

    fn run(behaviour: Behaviour) -> Vec<Call> {
        let recorder = Recorder::default();
        ZipBackupJob::new(Box::new(Scripted::new(behaviour)), Box::new(recorder.clone())).run();
        recorder.calls()
    }

    #[test]
    fn success_is_reported_once_after_final_progress() {
        let calls = run(Behaviour::Succeed);
        assert_eq!(
            calls,
            vec![
                Call::Progress(ProgressReport::new(50, "halfway")),
                Call::Progress(ProgressReport::new(100, "done")),
                Call::Success(None),
            ]
        );
    }

    #[test]
    fn errors_become_one_failure() {
        let calls = run(Behaviour::Fail);
        assert_eq!(calls.len(), 2);
        match &calls[1] {
            Call::Failure(FailureKind::Format, Some(message)) => {
                assert!(message.contains("broken"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn panics_are_contained() {
        let calls = run(Behaviour::Panic);
        match calls.last() {
            Some(Call::Failure(FailureKind::Io, Some(message))) => {
                assert!(message.contains("exploded"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cancellation_is_a_failure() {
        let calls = run(Behaviour::CheckCancel);
        assert!(matches!(
            calls.last(),
            Some(Call::Failure(FailureKind::Cancelled, Some(_)))
        ));
        assert!(!calls.iter().any(|c| matches!(c, Call::Success(_))));
    }

    #[test]
    fn abort_before_run_skips_the_operation() {
        let recorder = Recorder::default();
        let operation = Scripted::new(Behaviour::Succeed);
        let executed = operation.executed.clone();
        let job = ZipBackupJob::new(Box::new(operation), Box::new(recorder.clone()));

        job.abort();
        job.abort();
        job.run();

        assert!(!*executed.lock().unwrap());
        assert_eq!(
            recorder.calls(),
            vec![Call::Failure(
                FailureKind::Cancelled,
                Some("Operation was aborted".to_string())
            )]
        );
    }

    #[test]
    fn reporter_ignores_anything_after_terminal() {
        let recorder = Recorder::default();
        let mut reporter = Reporter::new(Box::new(recorder.clone()));

        reporter.success(None);
        reporter.progress(ProgressReport::new(10, "late"));
        reporter.failure(FailureKind::Io, "late".to_string());
        reporter.success(Some("again".to_string()));

        assert_eq!(recorder.calls(), vec![Call::Success(None)]);
    }

    #[tokio::test]
    async fn launched_job_reports_through_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let job = ZipBackupJob::new(
            Box::new(Scripted::new(Behaviour::Succeed)),
            Box::new(ChannelCallback::new(tx)),
        );

        let mut handle = JobLauncher::new().launch(job).unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert!(handle.wait_for_exit(Duration::from_secs(5)).await);
        assert_eq!(
            events.last(),
            Some(&JobEvent::Finished(JobOutcome::Success { warnings: None }))
        );
        assert_eq!(handle.revoke().await, Revocation::Revoked);
    }
}
