//! Access to the application's persisted state: the SQLite database, the JSON
//! preference files and the external files directory, all below one data
//! directory.

use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio_rusqlite::rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, warn};

use super::error::{BackupError, io_err};

const DATABASE_FILE: &str = "database.sqlite";
const PREFERENCES_DIR: &str = "preferences";
const GLOBAL_PREFERENCES_FILE: &str = "global.json";
const FILES_DIR: &str = "files";

/// Prefix of import staging directories created inside the data directory.
pub const STAGING_PREFIX: &str = ".restore-";

pub type Preferences = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct DataStore {
    root: PathBuf,
}

impl DataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn preferences_dir(&self) -> PathBuf {
        self.root.join(PREFERENCES_DIR)
    }

    pub fn global_preferences_path(&self) -> PathBuf {
        self.preferences_dir().join(GLOBAL_PREFERENCES_FILE)
    }

    pub fn device_preferences_path(&self, identifier: &str) -> PathBuf {
        self.preferences_dir()
            .join(device_preferences_file_name(identifier))
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join(FILES_DIR)
    }

    /// Identifiers of the devices known to the live database.
    pub fn active_devices(&self) -> Result<Vec<String>, BackupError> {
        let path = self.database_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        list_devices(&conn)
    }

    /// Write a transactionally consistent copy of the live database to `dest`,
    /// which must not exist yet.
    pub fn snapshot_database(&self, dest: &Path) -> Result<(), BackupError> {
        let path = self.database_path();
        if !path.exists() {
            return Err(BackupError::io(
                format!("Database not found at {}", path.display()),
                ErrorKind::NotFound.into(),
            ));
        }

        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        let dest = dest.to_string_lossy().into_owned();
        conn.execute("VACUUM INTO ?1", params![dest])?;
        debug!(dest = %dest, "Database snapshot written");
        Ok(())
    }

    /// Integrity check a database that is about to replace the live one and
    /// return the devices it contains.
    pub fn inspect_database(path: &Path) -> Result<Vec<String>, BackupError> {
        let corrupt = |e: tokio_rusqlite::rusqlite::Error| {
            BackupError::format(format!("Database in archive is not usable: {}", e))
        };

        let conn =
            Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(corrupt)?;

        let verdict: String = conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .map_err(corrupt)?;
        if verdict != "ok" {
            return Err(BackupError::format(format!(
                "Database in archive failed integrity check: {}",
                verdict
            )));
        }

        list_devices(&conn).map_err(|e| match e {
            BackupError::Database(e) => corrupt(e),
            other => other,
        })
    }

    /// Read a preferences file as stored, after checking that it parses. A
    /// missing file reads as an empty object.
    pub fn read_preferences(path: &Path) -> Result<Vec<u8>, BackupError> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(b"{}".to_vec()),
            Err(e) => {
                return Err(BackupError::io(
                    format!("Failed to read {}", path.display()),
                    e,
                ));
            }
        };

        parse_preferences(&content).map_err(|e| {
            BackupError::io(
                format!("Preferences file {} is not valid", path.display()),
                std::io::Error::new(ErrorKind::InvalidData, e),
            )
        })?;
        Ok(content)
    }

    /// Remove staging directories left behind by restores whose worker was
    /// still running when it was abandoned.
    pub fn sweep_stale_staging(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    path = %entry.path().display(),
                    error = %e,
                    "Failed to remove stale staging directory"
                ),
            }
        }
        removed
    }

    pub fn ensure_layout(&self) -> Result<(), BackupError> {
        for dir in [self.preferences_dir(), self.files_dir()] {
            fs::create_dir_all(&dir)
                .map_err(io_err(format!("Failed to create {}", dir.display())))?;
        }
        Ok(())
    }
}

/// Identifiers end up in file names, so path separators and dot names are
/// refused.
pub fn is_valid_device_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier != "."
        && identifier != ".."
        && !identifier.contains(['/', '\\', '\0'])
}

pub fn device_preferences_file_name(identifier: &str) -> String {
    format!("device_{}.json", identifier)
}

/// Preferences are a JSON object; anything else is rejected.
pub fn parse_preferences(content: &[u8]) -> Result<Preferences, String> {
    match serde_json::from_slice::<Value>(content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// All regular files below `dir` as (relative path, size), sorted. Symlinks
/// and special files are skipped. A missing directory has no files.
pub fn list_files(dir: &Path) -> Result<Vec<(PathBuf, u64)>, BackupError> {
    let mut files = Vec::new();
    if dir.is_dir() {
        collect_files(dir, dir, &mut files)?;
    } else {
        debug!(dir = %dir.display(), "Files directory does not exist");
    }
    files.sort();
    Ok(files)
}

fn collect_files(
    base: &Path,
    current: &Path,
    files: &mut Vec<(PathBuf, u64)>,
) -> Result<(), BackupError> {
    let entries =
        fs::read_dir(current).map_err(io_err(format!("Failed to read {}", current.display())))?;

    for entry in entries {
        let entry = entry.map_err(io_err(format!("Failed to read {}", current.display())))?;
        let path = entry.path();
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            collect_files(base, &path, files)?;
        } else if metadata.is_file() {
            if let Ok(relative) = path.strip_prefix(base) {
                files.push((relative.to_path_buf(), metadata.len()));
            }
        }
    }
    Ok(())
}

fn list_devices(conn: &Connection) -> Result<Vec<String>, BackupError> {
    let has_table: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'devices')",
        [],
        |row| row.get(0),
    )?;
    if !has_table {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare("SELECT identifier FROM devices ORDER BY identifier")?;
    let devices = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(devices
        .into_iter()
        .filter(|id| {
            let valid = is_valid_device_identifier(id);
            if !valid {
                warn!(device = %id, "Ignoring device with an unusable identifier");
            }
            valid
        })
        .collect())
}
