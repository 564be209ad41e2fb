use bkzip::config::AppConfig;
use bkzip::context::AppContext;
use bkzip::core::export::partial_path;
use bkzip::core::{
    ArchiveOperation, BackupError, BackupRestoreController, ControllerState, Direction,
    JobControl, JobOutcome, JobRequest, Percent, Phase, ProgressFn, ProgressModel, ProgressReport,
    ProgressView, UserCommand,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_rusqlite::rusqlite::Connection;

#[derive(Default)]
struct RecordingView {
    renders: Vec<ProgressModel>,
    confirm_answer: bool,
    confirms: usize,
    restart_prompts: Vec<String>,
    closes: usize,
}

impl RecordingView {
    fn confirming(answer: bool) -> Self {
        Self {
            confirm_answer: answer,
            ..Self::default()
        }
    }
}

impl ProgressView for RecordingView {
    fn render(&mut self, model: &ProgressModel) {
        self.renders.push(model.clone());
    }

    fn confirm_abort(&mut self, _direction: Direction) -> bool {
        self.confirms += 1;
        self.confirm_answer
    }

    fn prompt_restart(&mut self, message: &str) {
        self.restart_prompts.push(message.to_string());
    }

    fn close(&mut self) {
        self.closes += 1;
    }
}

/// Export-shaped operation that takes `steps` ticks of 10ms, leaves its
/// partial file behind when cancelled and publishes through the gate.
struct SlowExport {
    target: PathBuf,
    steps: u32,
}

impl ArchiveOperation for SlowExport {
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
        let partial = partial_path(&self.target);
        fs::write(&partial, b"partial").map_err(|e| BackupError::io("write partial", e))?;

        for step in 0..self.steps {
            control.checkpoint()?;
            progress(ProgressReport::new(step * 100 / self.steps, "Working"));
            thread::sleep(Duration::from_millis(10));
        }

        control.commit(|| {
            fs::rename(&partial, &self.target).map_err(|e| BackupError::io("rename", e))
        })?;
        progress(ProgressReport::new(100, "Export complete"));
        Ok(None)
    }
}

/// Ignores cancellation entirely and tries to publish late.
struct StubbornExport {
    target: PathBuf,
    stall: Duration,
}

impl ArchiveOperation for StubbornExport {
    fn direction(&self) -> Direction {
        Direction::Export
    }

    fn target(&self) -> &Path {
        &self.target
    }

    fn execute(
        &mut self,
        control: &JobControl,
        _progress: &mut ProgressFn<'_>,
    ) -> Result<Option<String>, BackupError> {
        thread::sleep(self.stall);
        control.commit(|| {
            fs::write(&self.target, b"late").map_err(|e| BackupError::io("write target", e))
        })?;
        Ok(None)
    }
}

/// Publishes restored state right away, then lingers before returning.
struct EarlyCommitImport {
    source: PathBuf,
    live_marker: PathBuf,
    linger: Duration,
}

impl ArchiveOperation for EarlyCommitImport {
    fn direction(&self) -> Direction {
        Direction::Import
    }

    fn target(&self) -> &Path {
        &self.source
    }

    fn execute(
        &mut self,
        control: &JobControl,
        _progress: &mut ProgressFn<'_>,
    ) -> Result<Option<String>, BackupError> {
        control.commit(|| {
            fs::write(&self.live_marker, b"restored").map_err(|e| BackupError::io("install", e))
        })?;
        thread::sleep(self.linger);
        Ok(None)
    }
}

fn context(data_dir: &Path, abort_timeout_secs: u64) -> AppContext {
    AppContext::new(AppConfig {
        data_dir: data_dir.to_path_buf(),
        abort_timeout_secs,
        ..AppConfig::default()
    })
}

fn seed_database(ctx: &AppContext) {
    fs::create_dir_all(ctx.store.root()).unwrap();
    let conn = Connection::open(ctx.store.database_path()).unwrap();
    conn.execute_batch(
        "CREATE TABLE devices (identifier TEXT PRIMARY KEY);
         INSERT INTO devices VALUES ('band-1');",
    )
    .unwrap();
}

fn exit_after(delay: Duration) -> (mpsc::Receiver<UserCommand>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(4);
    let sender = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(UserCommand::RequestExit).await;
        // Hold the sender so the controller keeps listening.
        tokio::time::sleep(Duration::from_secs(10)).await;
    });
    (rx, sender)
}

#[tokio::test]
async fn export_completes_and_closes_view() {
    let temp = tempdir().unwrap();
    let ctx = context(&temp.path().join("data"), 5);
    seed_database(&ctx);
    let target = temp.path().join("backup.zip");

    let mut controller = BackupRestoreController::new(ctx, RecordingView::default());
    let (_tx, rx) = mpsc::channel(1);
    let state = controller
        .run(
            JobRequest {
                direction: Direction::Export,
                target: target.clone(),
            },
            rx,
        )
        .await
        .unwrap();

    assert_eq!(
        state,
        ControllerState::Completed(JobOutcome::Success { warnings: None })
    );
    assert!(target.exists());

    let view = controller.view();
    assert_eq!(view.closes, 1);
    assert!(view.restart_prompts.is_empty());

    let last = view.renders.last().unwrap();
    assert_eq!(last.phase, Phase::Succeeded);
    assert_eq!(last.percent, Percent::Value(100));
    assert_eq!(last.hint, None);
}

#[tokio::test]
async fn successful_import_prompts_restart_once() {
    let temp = tempdir().unwrap();
    let source = context(&temp.path().join("source"), 5);
    seed_database(&source);
    let archive = temp.path().join("backup.zip");

    let mut exporter = BackupRestoreController::new(source, RecordingView::default());
    let (_tx, rx) = mpsc::channel(1);
    exporter
        .run(
            JobRequest {
                direction: Direction::Export,
                target: archive.clone(),
            },
            rx,
        )
        .await
        .unwrap();

    let dest = context(&temp.path().join("dest"), 5);
    let dest_db = dest.store.database_path();
    let mut importer = BackupRestoreController::new(dest, RecordingView::default());
    let (_tx, rx) = mpsc::channel(1);
    let state = importer
        .run(
            JobRequest {
                direction: Direction::Import,
                target: archive,
            },
            rx,
        )
        .await
        .unwrap();

    assert_eq!(
        state,
        ControllerState::Completed(JobOutcome::Success { warnings: None })
    );
    assert!(dest_db.exists());

    let view = importer.view();
    assert_eq!(view.restart_prompts.len(), 1);
    assert!(view.restart_prompts[0].contains("Restart"));
    assert_eq!(view.closes, 0);
}

#[tokio::test]
async fn failed_export_leaves_no_output() {
    let temp = tempdir().unwrap();
    let ctx = context(&temp.path().join("data"), 5);
    fs::create_dir_all(ctx.store.root()).unwrap();
    let target = temp.path().join("backup.zip");

    let mut controller = BackupRestoreController::new(ctx, RecordingView::default());
    let (_tx, rx) = mpsc::channel(1);
    let state = controller
        .run(
            JobRequest {
                direction: Direction::Export,
                target: target.clone(),
            },
            rx,
        )
        .await
        .unwrap();

    match state {
        ControllerState::Completed(JobOutcome::Failure { message, .. }) => {
            assert!(!message.unwrap_or_default().is_empty())
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!target.exists());
    assert!(!partial_path(&target).exists());

    let last = controller.view().renders.last().unwrap();
    assert_eq!(last.phase, Phase::Failed);
    assert_eq!(last.hint.as_deref(), Some("Export failed"));
    assert!(!last.show_percentage);
}

#[tokio::test]
async fn abort_during_export_removes_partial_output() {
    let temp = tempdir().unwrap();
    let ctx = context(temp.path(), 5);
    let target = temp.path().join("backup.zip");

    let mut controller = BackupRestoreController::new(ctx, RecordingView::confirming(true));
    let (rx, sender) = exit_after(Duration::from_millis(100));
    let state = controller
        .run_operation(
            Box::new(SlowExport {
                target: target.clone(),
                steps: 1_000,
            }),
            rx,
        )
        .await
        .unwrap();
    sender.abort();

    assert_eq!(
        state,
        ControllerState::Aborted {
            worker_stopped: true,
            output_kept: false
        }
    );
    assert!(!target.exists());
    assert!(!partial_path(&target).exists());

    let view = controller.view();
    assert_eq!(view.confirms, 1);
    assert_eq!(view.closes, 1);
    assert!(view.renders.iter().any(|m| m.phase == Phase::Aborting));
    assert!(!view.renders.iter().any(|m| m.phase == Phase::Succeeded));
}

#[tokio::test]
async fn unresponsive_worker_is_abandoned_and_cannot_publish() {
    let temp = tempdir().unwrap();
    let ctx = context(temp.path(), 1);
    let target = temp.path().join("backup.zip");

    let mut controller = BackupRestoreController::new(ctx, RecordingView::confirming(true));
    let (rx, sender) = exit_after(Duration::from_millis(50));
    let state = controller
        .run_operation(
            Box::new(StubbornExport {
                target: target.clone(),
                stall: Duration::from_millis(2_500),
            }),
            rx,
        )
        .await
        .unwrap();
    sender.abort();

    assert_eq!(
        state,
        ControllerState::Aborted {
            worker_stopped: false,
            output_kept: false
        }
    );

    // Give the abandoned worker time to reach its commit attempt.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!target.exists());
}

#[tokio::test]
async fn abort_after_import_installed_still_prompts_restart() {
    let temp = tempdir().unwrap();
    let ctx = context(temp.path(), 5);
    let live_marker = temp.path().join("database.sqlite");

    let mut controller = BackupRestoreController::new(ctx, RecordingView::confirming(true));
    let (rx, sender) = exit_after(Duration::from_millis(100));
    let state = controller
        .run_operation(
            Box::new(EarlyCommitImport {
                source: temp.path().join("backup.zip"),
                live_marker: live_marker.clone(),
                linger: Duration::from_millis(400),
            }),
            rx,
        )
        .await
        .unwrap();
    sender.abort();

    assert_eq!(
        state,
        ControllerState::Aborted {
            worker_stopped: true,
            output_kept: true
        }
    );
    assert!(live_marker.exists());

    let view = controller.view();
    assert_eq!(view.restart_prompts.len(), 1);
    assert_eq!(view.closes, 0);
}

#[tokio::test]
async fn declined_exit_keeps_the_job_running() {
    let temp = tempdir().unwrap();
    let ctx = context(temp.path(), 5);
    let target = temp.path().join("backup.zip");

    let mut controller = BackupRestoreController::new(ctx, RecordingView::confirming(false));
    let (rx, sender) = exit_after(Duration::from_millis(50));
    let state = controller
        .run_operation(
            Box::new(SlowExport {
                target: target.clone(),
                steps: 30,
            }),
            rx,
        )
        .await
        .unwrap();
    sender.abort();

    assert_eq!(
        state,
        ControllerState::Completed(JobOutcome::Success { warnings: None })
    );
    assert!(target.exists());
    assert_eq!(controller.view().confirms, 1);
}

#[tokio::test]
async fn controller_runs_a_single_job() {
    let temp = tempdir().unwrap();
    let ctx = context(temp.path(), 5);
    let target = temp.path().join("backup.zip");

    let mut controller = BackupRestoreController::new(ctx, RecordingView::default());
    let (_tx, rx) = mpsc::channel(1);
    controller
        .run_operation(
            Box::new(SlowExport {
                target: target.clone(),
                steps: 1,
            }),
            rx,
        )
        .await
        .unwrap();

    let (_tx, rx) = mpsc::channel(1);
    let second = controller
        .run_operation(Box::new(SlowExport { target, steps: 1 }), rx)
        .await;
    assert!(second.is_err());
}

#[tokio::test]
async fn real_export_aborted_after_100ms() {
    let temp = tempdir().unwrap();
    let ctx = context(&temp.path().join("data"), 10);
    seed_database(&ctx);
    let files = ctx.store.files_dir();
    fs::create_dir_all(&files).unwrap();
    for i in 0..64 {
        fs::write(files.join(format!("blob-{:02}.bin", i)), vec![i as u8; 1 << 20]).unwrap();
    }
    let target = temp.path().join("backup.zip");

    let mut controller = BackupRestoreController::new(ctx, RecordingView::confirming(true));
    let (rx, sender) = exit_after(Duration::from_millis(100));
    let state = tokio::time::timeout(
        Duration::from_secs(30),
        controller.run(
            JobRequest {
                direction: Direction::Export,
                target: target.clone(),
            },
            rx,
        ),
    )
    .await
    .expect("controller did not settle")
    .unwrap();
    sender.abort();

    match state {
        ControllerState::Aborted {
            worker_stopped,
            output_kept,
        } => {
            assert!(worker_stopped);
            assert_eq!(target.exists(), output_kept);
        }
        ControllerState::Completed(JobOutcome::Success { .. }) => {
            eprintln!("NOTE: export finished before the abort request arrived");
            assert!(target.exists());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!partial_path(&target).exists());
}
