mod file_config;

pub use file_config::FileConfig;

use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub anchor_url: Option<String>,
    pub anchor_timeout_sec: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding registry.db and charts.db.
    pub db_dir: PathBuf,
    /// Report archive directory; only the ingest stage requires it.
    pub archive_dir: Option<PathBuf>,
    /// Anchoring service URL; notifications are skipped when unset.
    pub anchor_url: Option<String>,
    pub anchor_timeout_sec: u64,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file
    /// config. TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let archive_dir = file
            .archive_dir
            .map(PathBuf::from)
            .or_else(|| cli.archive_dir.clone());
        if let Some(dir) = &archive_dir {
            if !dir.is_dir() {
                bail!("Archive directory does not exist: {:?}", dir);
            }
        }

        let anchor_url = file.anchor_url.or_else(|| cli.anchor_url.clone());
        let anchor_timeout_sec = file.anchor_timeout_sec.unwrap_or(cli.anchor_timeout_sec);

        Ok(Self {
            db_dir,
            archive_dir,
            anchor_url,
            anchor_timeout_sec,
        })
    }

    pub fn registry_db_path(&self) -> PathBuf {
        self.db_dir.join("registry.db")
    }

    pub fn charts_db_path(&self) -> PathBuf {
        self.db_dir.join("charts.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn cli_with_db_dir(dir: &TempDir) -> CliConfig {
        CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            anchor_timeout_sec: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_dir();
        let archive = make_temp_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            archive_dir: Some(archive.path().to_path_buf()),
            anchor_url: Some("http://anchor:9000".to_string()),
            anchor_timeout_sec: 20,
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.archive_dir.as_deref(), Some(archive.path()));
        assert_eq!(config.anchor_url.as_deref(), Some("http://anchor:9000"));
        assert_eq!(config.anchor_timeout_sec, 20);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_dir();
        let toml_db_dir = make_temp_dir();
        let cli = cli_with_db_dir(&temp_dir);

        let file_config = FileConfig {
            db_dir: Some(toml_db_dir.path().to_string_lossy().to_string()),
            anchor_url: Some("http://from-toml:9000".to_string()),
            anchor_timeout_sec: Some(5),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();
        assert_eq!(config.db_dir, toml_db_dir.path());
        assert_eq!(config.anchor_url.as_deref(), Some("http://from-toml:9000"));
        assert_eq!(config.anchor_timeout_sec, 5);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_nonexistent_archive_dir_error() {
        let temp_dir = make_temp_dir();
        let mut cli = cli_with_db_dir(&temp_dir);
        cli.archive_dir = Some(PathBuf::from("/nonexistent/archive"));
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Archive directory"));
    }

    #[test]
    fn test_db_path_helpers() {
        let temp_dir = make_temp_dir();
        let config = AppConfig::resolve(&cli_with_db_dir(&temp_dir), None).unwrap();
        assert_eq!(config.registry_db_path(), temp_dir.path().join("registry.db"));
        assert_eq!(config.charts_db_path(), temp_dir.path().join("charts.db"));
    }
}
