//! Restoring application state from a backup archive.
//!
//! Everything is extracted into a staging directory next to the live state
//! and checked there. Live state is only touched in the final install step,
//! which runs under the commit gate and rolls back if any move fails.

use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, info_span, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use super::archive::{
    self, BackupMetadata, DATABASE_ENTRY, GLOBAL_PREFERENCES_ENTRY, MAX_PREFERENCES_SIZE,
};
use super::control::JobControl;
use super::error::{BackupError, io_err};
use super::job::{ArchiveOperation, ProgressFn};
use super::models::{Direction, ProgressReport};
use super::store::{self, DataStore, STAGING_PREFIX};
use crate::logging::EntryLogThrottle;

/// SQLite files that belong to the live database and must not survive a
/// swap of the main file.
const DATABASE_SIDECARS: [&str; 3] = ["-wal", "-shm", "-journal"];

pub struct ImportOperation {
    store: DataStore,
    source: PathBuf,
}

impl ImportOperation {
    pub fn new(store: DataStore, source: PathBuf) -> Self {
        Self { store, source }
    }

    fn open_source(&self) -> Result<File, BackupError> {
        File::open(&self.source)
            .map_err(io_err(format!("Failed to open {}", self.source.display())))
    }
}

impl ArchiveOperation for ImportOperation {
    fn direction(&self) -> Direction {
        Direction::Import
    }

    fn target(&self) -> &Path {
        &self.source
    }

    fn execute(
        &mut self,
        control: &JobControl,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Option<String>, BackupError> {
        let span = info_span!("import", source = %self.source.display());
        let _enter = span.enter();

        progress(ProgressReport::indeterminate("Loading backup"));
        let file = self.open_source()?;

        control.checkpoint()?;
        progress(ProgressReport::new(10, "Validating backup"));
        let (mut zip, metadata) = archive::open_backup(file)?;
        debug!(
            backup_version = metadata.backup_version,
            backup_date = %metadata.backup_date,
            app_version = %metadata.app_version,
            "Valid backup archive"
        );

        control.checkpoint()?;
        fs::create_dir_all(self.store.root()).map_err(io_err(format!(
            "Failed to create {}",
            self.store.root().display()
        )))?;
        let swept = self.store.sweep_stale_staging();
        if swept > 0 {
            info!(count = swept, "Removed stale staging directories");
        }

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(self.store.root())
            .map_err(io_err("Failed to create staging directory"))?;
        let staged = DataStore::new(staging.path().join("state"));

        let external_files: Vec<(String, PathBuf)> = zip
            .file_names()
            .filter_map(|name| {
                archive::external_file_of_entry(name)
                    .map(|relative| (name.to_string(), PathBuf::from(relative)))
            })
            .collect();
        debug!(count = external_files.len(), "Got external files");

        let failed_files =
            restore_external_files(&mut zip, &metadata, &external_files, &staged, control, progress)?;

        control.checkpoint()?;
        progress(ProgressReport::new(75, "Importing database"));
        let digest = extract_entry(&mut zip, DATABASE_ENTRY, &staged.database_path(), control)?;
        if metadata.verify(DATABASE_ENTRY, &digest) == Some(false) {
            return Err(BackupError::format("Database checksum does not match"));
        }
        let devices = DataStore::inspect_database(&staged.database_path())?;

        control.checkpoint()?;
        progress(ProgressReport::new(85, "Importing preferences"));
        staged.ensure_layout()?;
        match read_entry(&mut zip, GLOBAL_PREFERENCES_ENTRY, &metadata, MAX_PREFERENCES_SIZE)? {
            Some(content) => {
                write_preferences(&staged.global_preferences_path(), &content, GLOBAL_PREFERENCES_ENTRY)?
            }
            None => warn!("Archive has no global preferences, keeping current ones"),
        }

        let device_entries: Vec<(String, String)> = zip
            .file_names()
            .filter_map(|name| {
                archive::device_of_entry(name).map(|device| (name.to_string(), device.to_string()))
            })
            .collect();
        for (entry, device) in &device_entries {
            control.checkpoint()?;
            if !devices.contains(device) {
                warn!(device = %device, "Skipping preferences of a device missing from the restored database");
                continue;
            }
            if let Some(content) = read_entry(&mut zip, entry, &metadata, MAX_PREFERENCES_SIZE)? {
                debug!(device = %device, "Importing device preferences");
                write_preferences(&staged.device_preferences_path(device), &content, entry)?;
            }
        }

        control.checkpoint()?;
        let rollback_dir = staging.path().join("previous");
        control.commit(|| install(&staged, &self.store, &rollback_dir))?;

        progress(ProgressReport::new(100, "Import complete"));
        info!(failed_files = failed_files.len(), "Import complete");

        if failed_files.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!(
            "{} file(s) could not be restored:\n- {}",
            failed_files.len(),
            failed_files.join("\n- ")
        )))
    }
}

/// Extract external files into staging. Per-file problems are collected and
/// returned; cancellation and archive I/O errors abort the import.
fn restore_external_files<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    metadata: &BackupMetadata,
    files: &[(String, PathBuf)],
    staged: &DataStore,
    control: &JobControl,
    progress: &mut ProgressFn<'_>,
) -> Result<Vec<String>, BackupError> {
    let files_dir = staged.files_dir();
    let mut failed = Vec::new();
    let total = files.len();
    let mut throttle = EntryLogThrottle::new(total, 20);

    for (i, (name, relative)) in files.iter().enumerate() {
        control.checkpoint()?;

        if throttle.should_log(i) {
            debug!(file = %name, index = i + 1, total, "Restoring file");
        }

        let dest = files_dir.join(relative);
        match extract_entry(zip, name, &dest, control) {
            Ok(digest) if metadata.verify(name, &digest) == Some(false) => {
                warn!(file = %name, "Checksum mismatch, skipping file");
                let _ = fs::remove_file(&dest);
                failed.push(name.clone());
            }
            Ok(_) => {}
            Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
            Err(e) => {
                error!(file = %name, error = %e, "Failed to restore file");
                let _ = fs::remove_file(&dest);
                failed.push(name.clone());
            }
        }

        let percent = (10.0 + 65.0 * (i as f64 / total as f64)) as u32;
        progress(ProgressReport::new(
            percent,
            format!("Importing files ({} of {})", i + 1, total),
        ));
    }

    Ok(failed)
}

fn extract_entry<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    name: &str,
    dest: &Path,
    control: &JobControl,
) -> Result<blake3::Hash, BackupError> {
    let mut entry = zip.by_name(name)?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(io_err(format!("Failed to create {}", parent.display())))?;
    }
    let mut out =
        File::create(dest).map_err(io_err(format!("Failed to create {}", dest.display())))?;

    let (_, digest) = archive::copy_with_checkpoints(&mut entry, &mut out, control, name)?;
    out.sync_all()
        .map_err(io_err(format!("Failed to sync {}", dest.display())))?;
    Ok(digest)
}

/// Read a small entry fully, verifying its checksum. Missing entries are
/// `None`; entries larger than `limit` bytes are a format error.
fn read_entry<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    name: &str,
    metadata: &BackupMetadata,
    limit: u64,
) -> Result<Option<Vec<u8>>, BackupError> {
    let entry = match zip.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let too_large = || BackupError::format(format!("{} exceeds {} bytes", name, limit));
    if entry.size() > limit {
        return Err(too_large());
    }

    // The declared size can lie; never buffer more than the limit.
    let mut content = Vec::new();
    entry
        .take(limit + 1)
        .read_to_end(&mut content)
        .map_err(io_err(format!("Failed to read {}", name)))?;
    if content.len() as u64 > limit {
        return Err(too_large());
    }

    if metadata.verify(name, &blake3::hash(&content)) == Some(false) {
        return Err(BackupError::format(format!("Checksum mismatch for {}", name)));
    }
    Ok(Some(content))
}

fn write_preferences(dest: &Path, content: &[u8], entry: &str) -> Result<(), BackupError> {
    store::parse_preferences(content)
        .map_err(|e| BackupError::format(format!("{} is not valid: {}", entry, e)))?;
    fs::write(dest, content).map_err(io_err(format!("Failed to write {}", dest.display())))
}

/// One path in the live state that the install step replaces or retires.
struct Move {
    staged: Option<PathBuf>,
    live: PathBuf,
}

/// What was done to one live path, for rollback.
struct Installed {
    live: PathBuf,
    previous: Option<PathBuf>,
}

/// Move the staged state over the live state. Replaced live files are parked
/// in `rollback_dir`; if any move fails, everything done so far is undone.
fn install(staged: &DataStore, live: &DataStore, rollback_dir: &Path) -> Result<(), BackupError> {
    let moves = plan_install(staged, live)?;

    live.ensure_layout()?;
    fs::create_dir_all(rollback_dir)
        .map_err(io_err(format!("Failed to create {}", rollback_dir.display())))?;

    let mut done: Vec<Installed> = Vec::with_capacity(moves.len());
    for (index, step) in moves.into_iter().enumerate() {
        match install_one(&step, &rollback_dir.join(index.to_string())) {
            Ok(previous) => done.push(Installed {
                live: step.live,
                previous,
            }),
            Err(e) => {
                error!(path = %step.live.display(), error = %e, "Install failed, rolling back");
                rollback(done);
                return Err(e);
            }
        }
    }

    info!("Restored state installed");
    Ok(())
}

fn plan_install(staged: &DataStore, live: &DataStore) -> Result<Vec<Move>, BackupError> {
    let mut moves = vec![Move {
        staged: Some(staged.database_path()),
        live: live.database_path(),
    }];

    let live_db = live.database_path().into_os_string();
    for suffix in DATABASE_SIDECARS {
        let mut sidecar = live_db.clone();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if sidecar.exists() {
            moves.push(Move {
                staged: None,
                live: sidecar,
            });
        }
    }

    for (relative, _) in store::list_files(&staged.preferences_dir())? {
        moves.push(Move {
            staged: Some(staged.preferences_dir().join(&relative)),
            live: live.preferences_dir().join(&relative),
        });
    }

    for (relative, _) in store::list_files(&staged.files_dir())? {
        moves.push(Move {
            staged: Some(staged.files_dir().join(&relative)),
            live: live.files_dir().join(&relative),
        });
    }

    Ok(moves)
}

fn install_one(step: &Move, park_at: &Path) -> Result<Option<PathBuf>, BackupError> {
    let previous = if step.live.exists() {
        fs::rename(&step.live, park_at)
            .map_err(io_err(format!("Failed to move aside {}", step.live.display())))?;
        Some(park_at.to_path_buf())
    } else {
        None
    };

    let Some(staged) = &step.staged else {
        return Ok(previous);
    };

    let result = step
        .live
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|_| fs::rename(staged, &step.live));

    if let Err(e) = result {
        if let Some(previous) = &previous {
            if let Err(restore) = fs::rename(previous, &step.live) {
                error!(path = %step.live.display(), error = %restore, "Failed to restore previous file");
            }
        }
        return Err(BackupError::io(
            format!("Failed to install {}", step.live.display()),
            e,
        ));
    }

    Ok(previous)
}

fn rollback(done: Vec<Installed>) {
    for installed in done.into_iter().rev() {
        let result = match &installed.previous {
            Some(previous) => fs::rename(previous, &installed.live),
            None => fs::remove_file(&installed.live),
        };
        if let Err(e) = result {
            error!(path = %installed.live.display(), error = %e, "Rollback step failed");
        }
    }
}
