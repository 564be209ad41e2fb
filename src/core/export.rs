use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn};
use zip::ZipWriter;
use zip::write::FileOptions;

use super::archive::{
    self, BackupMetadata, DATABASE_ENTRY, GLOBAL_PREFERENCES_ENTRY, METADATA_ENTRY,
};
use super::control::JobControl;
use super::error::{BackupError, io_err};
use super::job::{ArchiveOperation, ProgressFn};
use super::models::{Direction, ProgressReport};
use super::store::{self, DataStore};
use crate::config::Compression;
use crate::logging::EntryLogThrottle;

/// Sibling file the archive is written to before it is renamed onto the
/// target.
pub fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backup.zip".to_string());
    target.with_file_name(format!(".{}.partial", name))
}

/// Writes the application's state into a ZIP archive.
pub struct ExportOperation {
    store: DataStore,
    target: PathBuf,
    compression: Compression,
}

impl ExportOperation {
    pub fn new(store: DataStore, target: PathBuf, compression: Compression) -> Self {
        Self {
            store,
            target,
            compression,
        }
    }

    fn write_archive(
        &self,
        zip: &mut ZipWriter<BufWriter<File>>,
        control: &JobControl,
        progress: &mut ProgressFn<'_>,
    ) -> Result<(), BackupError> {
        let options = FileOptions::default().compression_method(self.compression.method());
        let mut checksums = BTreeMap::new();

        control.checkpoint()?;
        progress(ProgressReport::new(0, "Exporting preferences"));
        self.export_preferences(zip, options, &mut checksums)?;

        control.checkpoint()?;
        progress(ProgressReport::new(10, "Exporting database"));
        self.export_database(zip, options, control, &mut checksums)?;

        control.checkpoint()?;
        progress(ProgressReport::new(25, "Exporting files"));

        let files_dir = self.store.files_dir();
        let files = store::list_files(&files_dir)?;
        debug!(count = files.len(), dir = %files_dir.display(), "Got files to export");

        let total = files.len();
        let mut throttle = EntryLogThrottle::new(total, 20);
        for (i, (relative, size)) in files.iter().enumerate() {
            control.checkpoint()?;

            let name = archive::entry_name_for(relative);
            if throttle.should_log(i) {
                debug!(file = %name, index = i + 1, total, "Exporting file");
            }

            let mut source = File::open(files_dir.join(relative))
                .map_err(io_err(format!("Failed to open {}", relative.display())))?;
            zip.start_file(
                name.as_str(),
                options.large_file(*size >= u64::from(u32::MAX)),
            )?;
            let (_, digest) =
                archive::copy_with_checkpoints(&mut source, zip, control, &name)?;
            checksums.insert(name, digest.to_hex().to_string());

            let percent = (50.0 + 49.0 * (i as f64 / total as f64)).min(99.0) as u32;
            progress(ProgressReport::new(
                percent,
                format!("Exporting files ({} of {})", i + 1, total),
            ));
        }

        control.checkpoint()?;
        progress(ProgressReport::new(99, "Finishing"));

        let metadata = BackupMetadata::new(checksums);
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| BackupError::io("Failed to encode metadata", e.into()))?;
        zip.start_file(METADATA_ENTRY, options)?;
        zip.write_all(&json)
            .map_err(io_err("Failed to write metadata"))?;

        Ok(())
    }

    fn export_preferences(
        &self,
        zip: &mut ZipWriter<BufWriter<File>>,
        options: FileOptions,
        checksums: &mut BTreeMap<String, String>,
    ) -> Result<(), BackupError> {
        let global = DataStore::read_preferences(&self.store.global_preferences_path())?;
        write_entry(zip, options, GLOBAL_PREFERENCES_ENTRY, &global, checksums)?;

        for device in self.store.active_devices()? {
            let path = self.store.device_preferences_path(&device);
            if !path.exists() {
                continue;
            }
            debug!(device = %device, "Exporting device preferences");
            let prefs = DataStore::read_preferences(&path)?;
            write_entry(
                zip,
                options,
                &archive::device_preferences_entry(&device),
                &prefs,
                checksums,
            )?;
        }
        Ok(())
    }

    fn export_database(
        &self,
        zip: &mut ZipWriter<BufWriter<File>>,
        options: FileOptions,
        control: &JobControl,
        checksums: &mut BTreeMap<String, String>,
    ) -> Result<(), BackupError> {
        let scratch = tempfile::tempdir().map_err(io_err("Failed to create scratch directory"))?;
        let snapshot = scratch.path().join("snapshot.db");
        self.store.snapshot_database(&snapshot)?;

        let mut source =
            File::open(&snapshot).map_err(io_err("Failed to open database snapshot"))?;
        zip.start_file(DATABASE_ENTRY, options.large_file(true))?;
        let (size, digest) =
            archive::copy_with_checkpoints(&mut source, zip, control, DATABASE_ENTRY)?;
        checksums.insert(DATABASE_ENTRY.to_string(), digest.to_hex().to_string());

        debug!(bytes = size, "Database exported");
        Ok(())
    }
}

impl ArchiveOperation for ExportOperation {
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
        let span = info_span!("export", path = %self.target.display());
        let _enter = span.enter();

        let (partial, file) = PartialFile::create(partial_path(&self.target))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));

        self.write_archive(&mut zip, control, progress)?;

        let writer = zip.finish()?;
        let file = writer
            .into_inner()
            .map_err(|e| BackupError::io("Failed to flush archive", e.into_error()))?;
        file.sync_all().map_err(io_err("Failed to sync archive"))?;
        drop(file);

        control.commit(|| partial.persist(&self.target))?;

        progress(ProgressReport::new(100, "Export complete"));
        info!("Export complete");
        Ok(None)
    }
}

/// The archive being written. Removed on drop unless persisted.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn create(path: PathBuf) -> Result<(Self, File), BackupError> {
        let file =
            File::create(&path).map_err(io_err(format!("Failed to create {}", path.display())))?;
        Ok((Self { path, armed: true }, file))
    }

    fn persist(mut self, target: &Path) -> Result<(), BackupError> {
        fs::rename(&self.path, target)
            .map_err(io_err(format!("Failed to move archive to {}", target.display())))?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial archive"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove partial archive"),
        }
    }
}

fn write_entry(
    zip: &mut ZipWriter<BufWriter<File>>,
    options: FileOptions,
    name: &str,
    content: &[u8],
    checksums: &mut BTreeMap<String, String>,
) -> Result<(), BackupError> {
    zip.start_file(name, options)?;
    zip.write_all(content)
        .map_err(io_err(format!("Failed to write {}", name)))?;
    checksums.insert(name.to_string(), blake3::hash(content).to_hex().to_string());
    Ok(())
}
