//! Configuration file handling.
//!
//! A single JSON document supplies search roots, emulator patterns and the
//! directories the engine works in. Every field has a default, so an empty
//! object is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::path::{canonicalize, CanonicalPath};
use crate::planner::PlannerOptions;
use crate::scanner::{EmulatorPattern, ScanOptions};

/// Directory name used under the platform data directory
pub const APP_DIR: &str = "emumigrate";

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

fn default_target_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("Emulation")
}

fn default_backup_root() -> PathBuf {
    default_data_dir().join("backups")
}

fn default_state_dir() -> PathBuf {
    default_data_dir().join("state")
}

fn default_search_roots() -> Vec<PathBuf> {
    dirs::home_dir().into_iter().collect()
}

fn default_max_scan_depth() -> usize {
    ScanOptions::default().max_depth
}

fn default_scan_workers() -> usize {
    ScanOptions::default().workers
}

/// Migration configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directories scanned for legacy installations
    pub search_roots: Vec<PathBuf>,
    /// Emulator families to recognize
    pub emulators: Vec<EmulatorPattern>,
    /// Consolidated location the plans point into
    pub target_root: PathBuf,
    /// Where snapshots and execution records are kept
    pub backup_root: PathBuf,
    /// Lock files and elevation handoffs
    pub state_dir: PathBuf,
    pub max_scan_depth: usize,
    pub scan_workers: usize,
    /// Extra locations writable without elevation (home and temp are implied)
    pub writable_roots: Vec<PathBuf>,
    /// Locale override for the "everyone" principal; detected when unset
    pub locale: Option<String>,
    /// Seconds to wait for an elevation answer; unset waits forever
    pub consent_timeout_secs: Option<u64>,
    /// Also copy detected config files into the target root
    pub migrate_config_files: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            search_roots: default_search_roots(),
            emulators: EmulatorPattern::builtin(),
            target_root: default_target_root(),
            backup_root: default_backup_root(),
            state_dir: default_state_dir(),
            max_scan_depth: default_max_scan_depth(),
            scan_workers: default_scan_workers(),
            writable_roots: Vec::new(),
            locale: None,
            consent_timeout_secs: None,
            migrate_config_files: false,
        }
    }
}

impl MigrationConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create configuration directory {:?}", parent)
                })?;
            }
        }
        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.search_roots.is_empty() {
            anyhow::bail!("At least one search root must be specified");
        }
        if self.emulators.is_empty() {
            anyhow::bail!("At least one emulator pattern must be specified");
        }

        for emulator in &self.emulators {
            if emulator.name.trim().is_empty() {
                anyhow::bail!("Emulator patterns must have a name");
            }
            if emulator.file_patterns.is_empty() {
                anyhow::bail!("Emulator '{}' has no file patterns", emulator.name);
            }
            for pattern in emulator.file_patterns.iter().chain(&emulator.config_files) {
                glob::Pattern::new(pattern).with_context(|| {
                    format!("Emulator '{}' has an invalid pattern '{}'", emulator.name, pattern)
                })?;
            }
        }

        if self.max_scan_depth == 0 {
            anyhow::bail!("max_scan_depth must be at least 1");
        }
        if self.scan_workers == 0 || self.scan_workers > 64 {
            anyhow::bail!("scan_workers must be between 1 and 64");
        }
        if self.consent_timeout_secs == Some(0) {
            anyhow::bail!("consent_timeout_secs must be positive when set");
        }

        let target = self.target_root()?;
        let backups = self.backup_root()?;
        if backups.starts_with(&target) {
            anyhow::bail!("backup_root must not be inside target_root");
        }
        self.search_roots()?;
        self.state_dir()?;
        self.writable_roots()?;

        Ok(())
    }

    pub fn target_root(&self) -> Result<CanonicalPath> {
        canonicalize(self.target_root.as_path()).context("Invalid target_root")
    }

    pub fn backup_root(&self) -> Result<CanonicalPath> {
        canonicalize(self.backup_root.as_path()).context("Invalid backup_root")
    }

    pub fn state_dir(&self) -> Result<CanonicalPath> {
        canonicalize(self.state_dir.as_path()).context("Invalid state_dir")
    }

    pub fn search_roots(&self) -> Result<Vec<CanonicalPath>> {
        self.search_roots
            .iter()
            .map(|p| canonicalize(p.as_path()).with_context(|| format!("Invalid search root {:?}", p)))
            .collect()
    }

    pub fn writable_roots(&self) -> Result<Vec<CanonicalPath>> {
        self.writable_roots
            .iter()
            .map(|p| canonicalize(p.as_path()).with_context(|| format!("Invalid writable root {:?}", p)))
            .collect()
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            max_depth: self.max_scan_depth,
            workers: self.scan_workers,
        }
    }

    pub fn planner_options(&self) -> PlannerOptions {
        PlannerOptions {
            migrate_config_files: self.migrate_config_files,
        }
    }

    pub fn consent_timeout(&self) -> Option<Duration> {
        self.consent_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dir: &Path) -> MigrationConfig {
        MigrationConfig {
            search_roots: vec![dir.join("legacy")],
            target_root: dir.join("Emulation"),
            backup_root: dir.join("data/backups"),
            state_dir: dir.join("data/state"),
            ..MigrationConfig::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample(dir.path());
        config.validate().unwrap();
        assert_eq!(config.emulators.len(), EmulatorPattern::builtin().len());
        assert_eq!(config.scan_options(), ScanOptions::default());
        assert!(!config.planner_options().migrate_config_files);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/emumigrate.json");
        let mut config = sample(dir.path());
        config.locale = Some("pt_BR".to_string());
        config.consent_timeout_secs = Some(30);

        config.save_to_file(&path).unwrap();
        let loaded = MigrationConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.consent_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{ "search_roots": ["/games"], "migrate_config_files": true }"#).unwrap();

        let loaded = MigrationConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.search_roots, vec![PathBuf::from("/games")]);
        assert!(loaded.migrate_config_files);
        assert_eq!(loaded.max_scan_depth, ScanOptions::default().max_depth);
        assert!(!loaded.emulators.is_empty());
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ search_roots: ").unwrap();
        let err = MigrationConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = sample(dir.path());
        config.scan_workers = 0;
        assert!(config.validate().is_err());

        let mut config = sample(dir.path());
        config.backup_root = config.target_root.join("backups");
        assert!(config.validate().is_err());

        let mut config = sample(dir.path());
        config.emulators[0].file_patterns = vec!["[".to_string()];
        assert!(config.validate().is_err());

        let mut config = sample(dir.path());
        config.search_roots.clear();
        assert!(config.validate().is_err());
    }
}
