//! Layout of a backup archive and the helpers shared by export and import.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::{Component, Path};
use std::sync::LazyLock;
use zip::ZipArchive;

use super::control::JobControl;
use super::error::{BackupError, io_err};

/// Highest archive layout version this build understands.
pub const BACKUP_VERSION: u32 = 1;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const DATABASE_ENTRY: &str = "database/app.db";
pub const GLOBAL_PREFERENCES_ENTRY: &str = "preferences/global.json";
pub const FILES_PREFIX: &str = "files/";

/// Entry count guard against zip bombs.
pub const MAX_ENTRIES: usize = 100_000;

/// Largest preferences entry read into memory.
pub const MAX_PREFERENCES_SIZE: u64 = 4 * 1024 * 1024;

/// Chunk size between two cancellation checks while streaming entry data.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

static DEVICE_PREFERENCES_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^preferences/device_(.+)\.json$").expect("device preferences pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub app_id: String,
    pub app_version: String,
    pub backup_version: u32,
    pub backup_date: DateTime<Utc>,
    /// BLAKE3 hex digest per entry name. Absent in archives made by tools
    /// that do not record checksums.
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

impl BackupMetadata {
    pub fn new(checksums: BTreeMap<String, String>) -> Self {
        Self {
            app_id: env!("CARGO_PKG_NAME").to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            backup_version: BACKUP_VERSION,
            backup_date: Utc::now(),
            checksums,
        }
    }

    /// `Some(true)` on match, `Some(false)` on mismatch, `None` when the
    /// archive carries no checksum for the entry.
    pub fn verify(&self, entry: &str, digest: &blake3::Hash) -> Option<bool> {
        self.checksums
            .get(entry)
            .map(|expected| expected.eq_ignore_ascii_case(&digest.to_hex()))
    }
}

pub fn device_preferences_entry(identifier: &str) -> String {
    format!("preferences/device_{}.json", identifier)
}

/// Device identifier of a `preferences/device_<id>.json` entry.
pub fn device_of_entry(name: &str) -> Option<&str> {
    DEVICE_PREFERENCES_ENTRY
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Relative path below the files directory for a `files/...` entry.
/// Log files are not restored.
pub fn external_file_of_entry(name: &str) -> Option<&str> {
    let relative = name.strip_prefix(FILES_PREFIX)?;
    if relative.is_empty() || name.ends_with('/') {
        return None;
    }
    if relative.ends_with(".log") || relative.ends_with(".log.zip") {
        return None;
    }
    Some(relative)
}

/// Entry names must stay inside the directory they are extracted to.
pub fn is_enclosed(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Archive entry name for a path relative to the files directory.
pub fn entry_name_for(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("{}{}", FILES_PREFIX, parts.join("/"))
}

/// Stream `reader` into `writer`, checking for cancellation before every
/// chunk, and return the BLAKE3 digest of everything copied.
pub fn copy_with_checkpoints(
    reader: &mut impl Read,
    writer: &mut impl Write,
    control: &JobControl,
    what: &str,
) -> Result<(u64, blake3::Hash), BackupError> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut hasher = blake3::Hasher::new();
    let mut copied: u64 = 0;

    loop {
        control.checkpoint()?;

        let read = reader
            .read(&mut buffer)
            .map_err(io_err(format!("Failed to read {}", what)))?;
        if read == 0 {
            break;
        }

        writer
            .write_all(&buffer[..read])
            .map_err(io_err(format!("Failed to write {}", what)))?;
        hasher.update(&buffer[..read]);
        copied += read as u64;
    }

    Ok((copied, hasher.finalize()))
}

/// Open a ZIP archive and check that it looks like one of our backups.
pub fn open_backup<R: Read + Seek>(
    reader: R,
) -> Result<(ZipArchive<R>, BackupMetadata), BackupError> {
    let mut archive = ZipArchive::new(reader)
        .map_err(|e| BackupError::format(format!("Not a ZIP archive: {}", e)))?;

    if archive.len() > MAX_ENTRIES {
        return Err(BackupError::format(format!(
            "Archive has too many entries ({} > {})",
            archive.len(),
            MAX_ENTRIES
        )));
    }

    if let Some(name) = archive.file_names().find(|name| !is_enclosed(name)) {
        return Err(BackupError::format(format!(
            "Archive entry escapes its directory: {}",
            name
        )));
    }

    let metadata = read_metadata(&mut archive)?;
    if metadata.backup_version > BACKUP_VERSION {
        return Err(BackupError::format(format!(
            "Unsupported backup version {}",
            metadata.backup_version
        )));
    }

    if archive.by_name(DATABASE_ENTRY).is_err() {
        return Err(BackupError::format("Archive has no database"));
    }

    Ok((archive, metadata))
}

pub fn open_backup_file(path: &Path) -> Result<(ZipArchive<File>, BackupMetadata), BackupError> {
    let file = File::open(path).map_err(io_err(format!("Failed to open {}", path.display())))?;
    open_backup(file)
}

fn read_metadata<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<BackupMetadata, BackupError> {
    let entry = archive
        .by_name(METADATA_ENTRY)
        .map_err(|_| BackupError::format("Archive has no metadata"))?;

    serde_json::from_reader(entry)
        .map_err(|e| BackupError::format(format!("Archive metadata is invalid: {}", e)))
}
