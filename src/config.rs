use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "bkzip.toml";
const ENV_PREFIX: &str = "BKZIP_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Stored,
    Deflated,
}

impl Compression {
    pub fn method(self) -> zip::CompressionMethod {
        match self {
            Self::Stored => zip::CompressionMethod::Stored,
            Self::Deflated => zip::CompressionMethod::Deflated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root of the application's persisted state.
    pub data_dir: PathBuf,
    /// How long an abort waits for the worker thread before giving up.
    pub abort_timeout_secs: u64,
    pub event_channel_capacity: usize,
    pub compression: Compression,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            abort_timeout_secs: 60,
            event_channel_capacity: 64,
            compression: Compression::Deflated,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `BKZIP_*` environment variables and CLI
    /// overrides, in increasing order of precedence.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", file.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_secs(self.abort_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        data_dir: Option<PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        abort_timeout_secs: Option<u64>,
    }

    #[test]
    fn defaults_apply_without_file() {
        let temp = tempdir().unwrap();
        let config =
            AppConfig::new(Some(&temp.path().join("missing.toml")), None::<&Overrides>).unwrap();

        assert_eq!(config.abort_timeout_secs, 60);
        assert_eq!(config.compression, Compression::Deflated);
        assert_eq!(config.abort_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn file_values_are_overridden_by_cli() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("bkzip.toml");
        std::fs::write(
            &file,
            "data_dir = \"/srv/app\"\nabort_timeout_secs = 5\ncompression = \"stored\"\n",
        )
        .unwrap();

        let overrides = Overrides {
            data_dir: None,
            abort_timeout_secs: Some(2),
        };
        let config = AppConfig::new(Some(&file), Some(&overrides)).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/app"));
        assert_eq!(config.abort_timeout_secs, 2);
        assert_eq!(config.compression, Compression::Stored);
    }

    #[test]
    fn zero_channel_capacity_is_rejected() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("bkzip.toml");
        std::fs::write(&file, "event_channel_capacity = 0\n").unwrap();

        assert!(AppConfig::new(Some(&file), None::<&Overrides>).is_err());
    }
}
