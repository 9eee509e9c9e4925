//! Legacy Scanner
//!
//! Walks configured search roots looking for emulator footprints and reports
//! every directory that looks like a pre-existing installation.
//!
//! # Behaviour
//!
//! - A file whose name matches one of a family's `file_patterns` marks its
//!   parent directory as an installation root
//! - Within one search root there is one record per matched directory; when
//!   several families match the same directory the record lists all of them
//! - Records from different search roots are never merged
//! - Unreadable subtrees and missing roots become [`ScanWarning`]s; a scan
//!   never fails because of them
//!
//! The scanner is read-only. Roots are scanned in parallel on a bounded
//! `rayon` pool and results are collected through an append-only `Mutex`.

use crate::error::{MigrationError, Result};
use crate::model::LegacyInstallation;
use crate::path::{canonicalize, CanonicalPath};
use chrono::Utc;
use glob::{MatchOptions, Pattern};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use walkdir::WalkDir;

/// Default scan depth below each search root
pub const DEFAULT_MAX_DEPTH: usize = 4;

/// Default number of parallel scan workers
pub const DEFAULT_WORKERS: usize = 4;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn default_rom_dirs() -> Vec<String> {
    vec!["roms".to_string()]
}

fn default_save_dirs() -> Vec<String> {
    vec!["saves".to_string(), "states".to_string()]
}

fn default_config_dirs() -> Vec<String> {
    vec!["config".to_string()]
}

fn default_config_files() -> Vec<String> {
    ["*.cfg", "*.ini", "*.json", "*.xml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Footprint of one emulator family. Plain data, usually from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorPattern {
    /// Family name, e.g. "RetroArch"
    pub name: String,
    /// Filename globs (`*` and `?`, case-insensitive) that identify the family
    pub file_patterns: Vec<String>,
    #[serde(default = "default_rom_dirs")]
    pub rom_dirs: Vec<String>,
    #[serde(default = "default_save_dirs")]
    pub save_dirs: Vec<String>,
    #[serde(default = "default_config_dirs")]
    pub config_dirs: Vec<String>,
    /// Config file globs looked up next to the matched footprint
    #[serde(default = "default_config_files")]
    pub config_files: Vec<String>,
}

impl EmulatorPattern {
    /// Pattern with default directory and config-file names
    pub fn new(name: impl Into<String>, file_patterns: &[&str]) -> Self {
        Self {
            name: name.into(),
            file_patterns: file_patterns.iter().map(|s| s.to_string()).collect(),
            rom_dirs: default_rom_dirs(),
            save_dirs: default_save_dirs(),
            config_dirs: default_config_dirs(),
            config_files: default_config_files(),
        }
    }

    /// Built-in families shipped with the default configuration
    pub fn builtin() -> Vec<Self> {
        vec![
            Self::new(
                "RetroArch",
                &["retroarch.exe", "retroarch", "retroarch.cfg"],
            ),
            Self::new("EmuDeck", &["emudeck.sh", "EmuDeck.AppImage", "settings.sh"]),
            Self::new(
                "EmulationStation-DE",
                &["es-de.exe", "ES-DE.AppImage", "es_settings.xml"],
            ),
        ]
    }

    fn compile(&self) -> Result<CompiledPattern> {
        let compile_all = |globs: &[String]| -> Result<Vec<Pattern>> {
            globs
                .iter()
                .map(|g| {
                    Pattern::new(g).map_err(|e| {
                        MigrationError::config(format!(
                            "invalid pattern '{}' for {}: {}",
                            g, self.name, e
                        ))
                    })
                })
                .collect()
        };
        Ok(CompiledPattern {
            name: self.name.clone(),
            footprints: compile_all(&self.file_patterns)?,
            config_files: compile_all(&self.config_files)?,
            rom_dirs: self.rom_dirs.clone(),
            save_dirs: self.save_dirs.clone(),
            config_dirs: self.config_dirs.clone(),
        })
    }
}

struct CompiledPattern {
    name: String,
    footprints: Vec<Pattern>,
    config_files: Vec<Pattern>,
    rom_dirs: Vec<String>,
    save_dirs: Vec<String>,
    config_dirs: Vec<String>,
}

impl CompiledPattern {
    fn matches_footprint(&self, file_name: &str) -> bool {
        self.footprints
            .iter()
            .any(|p| p.matches_with(file_name, MATCH_OPTIONS))
    }

    fn matches_config_file(&self, file_name: &str) -> bool {
        self.config_files
            .iter()
            .any(|p| p.matches_with(file_name, MATCH_OPTIONS))
    }
}

/// Scan tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Directory levels to descend below each root
    pub max_depth: usize,
    /// Upper bound on parallel workers
    pub workers: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Non-fatal problem met while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub message: String,
}

/// Outcome of a scan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub installations: Vec<LegacyInstallation>,
    pub warnings: Vec<ScanWarning>,
}

/// Detects legacy installations under search roots.
#[derive(Debug, Clone, Default)]
pub struct LegacyScanner {
    options: ScanOptions,
}

#[derive(Default)]
struct Collected {
    installations: Vec<LegacyInstallation>,
    warnings: Vec<ScanWarning>,
}

impl LegacyScanner {
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// Scan `roots` for installations matching `patterns`.
    ///
    /// # Errors
    ///
    /// Only invalid glob patterns or a failure to start the worker pool are
    /// errors. Filesystem problems are reported as warnings.
    pub fn scan(
        &self,
        roots: &[CanonicalPath],
        patterns: &[EmulatorPattern],
    ) -> Result<ScanReport> {
        let compiled = patterns
            .iter()
            .map(EmulatorPattern::compile)
            .collect::<Result<Vec<_>>>()?;

        let workers = self.options.workers.clamp(1, roots.len().max(1));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("emumigrate-scan-{}", i))
            .build()
            .map_err(|e| MigrationError::config(format!("failed to start scan workers: {}", e)))?;

        tracing::info!(
            "Scanning {} root(s) for {} emulator families with {} worker(s)",
            roots.len(),
            compiled.len(),
            workers
        );

        let collected = Mutex::new(Collected::default());
        pool.install(|| {
            roots.par_iter().for_each(|root| {
                let (found, warnings) = self.scan_root(root, &compiled);
                // A poisoned lock only means another worker panicked mid-push
                let mut guard = collected.lock().unwrap_or_else(|e| e.into_inner());
                guard.installations.extend(found);
                guard.warnings.extend(warnings);
            });
        });

        let mut collected = collected.into_inner().unwrap_or_else(|e| e.into_inner());
        collected
            .installations
            .sort_by(|a, b| a.root_path.cmp(&b.root_path));
        collected.warnings.sort_by(|a, b| a.path.cmp(&b.path));

        for warning in &collected.warnings {
            tracing::warn!("Scan warning at {}: {}", warning.path.display(), warning.message);
        }
        tracing::info!(
            "Scan found {} installation(s), {} warning(s)",
            collected.installations.len(),
            collected.warnings.len()
        );

        Ok(ScanReport {
            installations: collected.installations,
            warnings: collected.warnings,
        })
    }

    fn scan_root(
        &self,
        root: &CanonicalPath,
        patterns: &[CompiledPattern],
    ) -> (Vec<LegacyInstallation>, Vec<ScanWarning>) {
        let mut warnings = Vec::new();

        if !root.is_dir() {
            warnings.push(ScanWarning {
                path: root.as_path().to_path_buf(),
                message: "search root is missing or not a directory".to_string(),
            });
            return (Vec::new(), warnings);
        }

        // matched directory -> family indices
        let mut matches: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();

        let walker = WalkDir::new(root.as_path())
            .max_depth(self.options.max_depth)
            .follow_links(false);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_else(|| root.as_path().to_path_buf());
                    warnings.push(ScanWarning {
                        path,
                        message: format!("skipped unreadable entry: {}", e),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };
            let Some(parent) = entry.path().parent() else {
                continue;
            };

            for (idx, pattern) in patterns.iter().enumerate() {
                if pattern.matches_footprint(file_name) {
                    let families = matches.entry(parent.to_path_buf()).or_default();
                    if !families.contains(&idx) {
                        families.push(idx);
                    }
                }
            }
        }

        let installations = matches
            .into_iter()
            .filter_map(|(dir, families)| {
                match self.describe_installation(&dir, &families, patterns, &mut warnings) {
                    Ok(installation) => Some(installation),
                    Err(e) => {
                        warnings.push(ScanWarning {
                            path: dir,
                            message: format!("could not inspect installation: {}", e),
                        });
                        None
                    }
                }
            })
            .collect();

        (installations, warnings)
    }

    fn describe_installation(
        &self,
        dir: &std::path::Path,
        families: &[usize],
        patterns: &[CompiledPattern],
        warnings: &mut Vec<ScanWarning>,
    ) -> Result<LegacyInstallation> {
        let root_path = canonicalize(dir)?;
        let matched: Vec<&CompiledPattern> = families.iter().map(|&i| &patterns[i]).collect();

        let mut rom_dirs = Vec::new();
        let mut save_dirs = Vec::new();
        let mut config_dirs = Vec::new();
        let mut config_files = Vec::new();

        for pattern in &matched {
            collect_subdirs(&root_path, &pattern.rom_dirs, &mut rom_dirs);
            collect_subdirs(&root_path, &pattern.save_dirs, &mut save_dirs);
            collect_subdirs(&root_path, &pattern.config_dirs, &mut config_dirs);
        }

        for entry in std::fs::read_dir(root_path.as_path())
            .map_err(|e| MigrationError::from_io(root_path.as_path(), e))?
        {
            // One bad entry costs that entry, not the installation
            let file_type = entry.and_then(|entry| entry.file_type().map(|t| (entry, t)));
            let entry = match file_type {
                Ok((entry, file_type)) if file_type.is_file() => entry,
                Ok(_) => continue,
                Err(e) => {
                    warnings.push(ScanWarning {
                        path: root_path.as_path().to_path_buf(),
                        message: format!("skipped unreadable entry: {}", e),
                    });
                    continue;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if matched.iter().any(|p| p.matches_config_file(name)) {
                config_files.push(root_path.join(name));
            }
        }
        config_files.sort();

        let families: Vec<String> = matched.iter().map(|p| p.name.clone()).collect();
        tracing::debug!("Installation at {} ({})", root_path, families.join(", "));

        Ok(LegacyInstallation {
            id: LegacyInstallation::id_for(&root_path),
            display_name: families.join(" + "),
            families,
            detected_config_files: config_files,
            detected_rom_dirs: rom_dirs,
            detected_save_dirs: save_dirs,
            detected_config_dirs: config_dirs,
            root_path,
            discovered_at: Utc::now(),
        })
    }
}

/// Push each named subdirectory of `root` that exists, without duplicates
fn collect_subdirs(root: &CanonicalPath, names: &[String], out: &mut Vec<CanonicalPath>) {
    for name in names {
        let candidate = root.join(name);
        if candidate.is_dir() && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn root_of(dir: &tempfile::TempDir) -> CanonicalPath {
        canonicalize(dir.path()).unwrap()
    }

    #[test]
    fn test_detects_retroarch_layout() {
        let dir = tempfile::tempdir().unwrap();
        let ra = dir.path().join("RetroArch");
        fs::create_dir_all(ra.join("roms")).unwrap();
        fs::create_dir_all(ra.join("saves")).unwrap();
        fs::write(ra.join("RetroArch.exe"), b"bin").unwrap();
        fs::write(ra.join("retroarch.cfg"), b"video_driver = gl").unwrap();

        let report = LegacyScanner::default()
            .scan(&[root_of(&dir)], &EmulatorPattern::builtin())
            .unwrap();

        assert_eq!(report.installations.len(), 1);
        let inst = &report.installations[0];
        assert_eq!(inst.families, vec!["RetroArch".to_string()]);
        assert_eq!(inst.detected_rom_dirs.len(), 1);
        assert_eq!(inst.detected_save_dirs.len(), 1);
        assert_eq!(inst.detected_config_files.len(), 1);
        assert_eq!(inst.id, LegacyInstallation::id_for(&inst.root_path));
    }

    #[test]
    fn test_multiple_families_share_one_record() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("roms")).unwrap();
        fs::write(dir.path().join("retroarch.cfg"), b"").unwrap();
        fs::write(dir.path().join("es_settings.xml"), b"").unwrap();

        let report = LegacyScanner::default()
            .scan(&[root_of(&dir)], &EmulatorPattern::builtin())
            .unwrap();

        assert_eq!(report.installations.len(), 1);
        assert_eq!(report.installations[0].families.len(), 2);
    }

    #[test]
    fn test_roots_are_not_merged() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("retroarch"), b"").unwrap();
        fs::write(b.path().join("retroarch"), b"").unwrap();

        let report = LegacyScanner::default()
            .scan(&[root_of(&a), root_of(&b)], &EmulatorPattern::builtin())
            .unwrap();

        assert_eq!(report.installations.len(), 2);
        assert!(report.installations[0].root_path < report.installations[1].root_path);
    }

    #[test]
    fn test_missing_root_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let missing = canonicalize(dir.path().join("nope")).unwrap();

        let report = LegacyScanner::default()
            .scan(&[missing], &EmulatorPattern::builtin())
            .unwrap();

        assert!(report.installations.is_empty());
        assert_eq!(report.warnings.len(), 1);
    }

    #[cfg(unix)]
    fn chmod(path: &std::path::Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_subtree_is_skipped_with_warning() {
        // Permission bits do not stop root
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir_all(locked.join("Dolphin")).unwrap();
        fs::write(locked.join("Dolphin/Dolphin.exe"), b"bin").unwrap();
        let ra = dir.path().join("RetroArch");
        fs::create_dir_all(&ra).unwrap();
        fs::write(ra.join("retroarch.cfg"), b"").unwrap();
        chmod(&locked, 0o000);

        let report = LegacyScanner::default().scan(&[root_of(&dir)], &EmulatorPattern::builtin());
        chmod(&locked, 0o755);
        let report = report.unwrap();

        assert_eq!(report.installations.len(), 1);
        assert_eq!(report.installations[0].families, vec!["RetroArch".to_string()]);
        assert!(
            report.warnings.iter().any(|w| w.path.ends_with("locked")),
            "{:?}",
            report.warnings
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_partly_inaccessible_installation_is_still_reported() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let ra = dir.path().join("RetroArch");
        fs::create_dir_all(ra.join("roms")).unwrap();
        fs::write(ra.join("retroarch.cfg"), b"").unwrap();
        // Listable but not searchable: names are readable, metadata is not
        chmod(&ra, 0o444);

        let report = LegacyScanner::default().scan(&[root_of(&dir)], &EmulatorPattern::builtin());
        chmod(&ra, 0o755);
        let report = report.unwrap();

        assert_eq!(report.installations.len(), 1);
        let inst = &report.installations[0];
        assert_eq!(inst.detected_config_files.len(), 1);
        assert!(inst.detected_rom_dirs.is_empty());
    }

    #[test]
    fn test_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c/d/e");
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("retroarch"), b"").unwrap();

        let shallow = LegacyScanner::new(ScanOptions {
            max_depth: 2,
            workers: 1,
        });
        let report = shallow
            .scan(&[root_of(&dir)], &EmulatorPattern::builtin())
            .unwrap();
        assert!(report.installations.is_empty());

        let report = LegacyScanner::new(ScanOptions {
            max_depth: 8,
            workers: 1,
        })
        .scan(&[root_of(&dir)], &EmulatorPattern::builtin())
        .unwrap();
        assert_eq!(report.installations.len(), 1);
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bad = EmulatorPattern::new("Broken", &["[unterminated"]);
        assert!(LegacyScanner::default().scan(&[root_of(&dir)], &[bad]).is_err());
    }
}
