pub mod archive;
pub mod control;
pub mod controller;
pub mod error;
pub mod export;
pub mod import;
pub mod job;
pub mod models;
pub mod progress;
pub mod store;

pub use control::{JobControl, Revocation};
pub use controller::{
    BackupRestoreController, ControllerState, JobRequest, ProgressView, UserCommand,
};
pub use error::BackupError;
pub use export::ExportOperation;
pub use import::ImportOperation;
pub use job::{
    ArchiveOperation, BackupCallback, ChannelCallback, JobHandle, JobLauncher, ProgressFn,
    ZipBackupJob,
};
pub use models::{Direction, FailureKind, JobEvent, JobOutcome, Percent, ProgressReport};
pub use progress::{Phase, ProgressModel};
pub use store::DataStore;
