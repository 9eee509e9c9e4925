//! Host access-control adapter.
//!
//! Grants read/write on a migrated subtree to the localized "everyone"
//! principal and records enough state to undo the grant.
//!
//! - **Windows**: `icacls <path> /grant <principal>:(OI)(CI)F /T`, with
//!   `/save` before the grant and `/restore` for undo
//! - **Unix**: recursive mode update adding read/write for "other"
//!   (directories also get search), capturing the previous modes first
//!
//! Both adapters follow a symlinked slot into the tree it points at.

use crate::error::{MigrationError, Result};
use crate::path::CanonicalPath;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;

/// Permissions captured before a grant, sufficient to undo it.
///
/// Stored in history records so a completed migration can be reverted later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionSnapshot {
    /// Unix modes per path, in walk order
    Modes(Vec<(PathBuf, u32)>),
    /// ACL file written by `icacls /save`, restorable against `parent`
    AclFile { parent: PathBuf, acl_file: PathBuf },
}

/// Applies and reverts "everyone can read/write" grants.
pub trait PermissionGrantor: Send + Sync {
    /// Record the current permissions of `path` and everything below it
    fn capture(&self, path: &CanonicalPath) -> Result<PermissionSnapshot>;

    /// Grant read/write on `path` (recursively) to `principal`
    fn grant(&self, path: &CanonicalPath, principal: &str) -> Result<()>;

    /// Put back what `capture` recorded
    fn restore(&self, snapshot: &PermissionSnapshot) -> Result<()>;

    /// `Some(granted)` if checkable without elevation, `None` otherwise
    fn verify(&self, path: &CanonicalPath, principal: &str) -> Option<bool>;
}

/// Grantor for the host platform
pub fn platform_grantor(work_dir: PathBuf) -> Box<dyn PermissionGrantor> {
    #[cfg(windows)]
    {
        Box::new(IcaclsGrantor::new(work_dir))
    }
    #[cfg(not(windows))]
    {
        let _ = work_dir;
        Box::new(UnixModeGrantor)
    }
}

// ============================================================================
// Command contracts
// ============================================================================

/// Typed command-line contract for an external tool.
///
/// The struct is the single source of truth for the flags it produces, so a
/// misspelled flag is a compile error instead of a runtime failure.
pub trait CommandArgs {
    /// Program to run, resolved through `PATH`
    fn program(&self) -> &'static str;

    /// Arguments exactly as the program expects them
    fn to_cli_args(&self) -> Vec<String>;
}

/// Invocations of `icacls` used by the Windows grantor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcaclsCommand {
    Grant { path: PathBuf, principal: String },
    Save { path: PathBuf, acl_file: PathBuf },
    Restore { parent: PathBuf, acl_file: PathBuf },
    Show { path: PathBuf },
}

impl CommandArgs for IcaclsCommand {
    fn program(&self) -> &'static str {
        "icacls"
    }

    fn to_cli_args(&self) -> Vec<String> {
        match self {
            Self::Grant { path, principal } => vec![
                path.display().to_string(),
                "/grant".to_string(),
                format!("{}:(OI)(CI)F", principal),
                "/T".to_string(),
            ],
            Self::Save { path, acl_file } => vec![
                path.display().to_string(),
                "/save".to_string(),
                acl_file.display().to_string(),
                "/T".to_string(),
                "/C".to_string(),
            ],
            Self::Restore { parent, acl_file } => vec![
                parent.display().to_string(),
                "/restore".to_string(),
                acl_file.display().to_string(),
                "/C".to_string(),
            ],
            Self::Show { path } => vec![path.display().to_string()],
        }
    }
}

/// Run a command contract, returning stdout on success
pub fn run_command(args: &dyn CommandArgs) -> Result<String> {
    let cli_args = args.to_cli_args();
    tracing::debug!("Running {} {:?}", args.program(), cli_args);

    let output = Command::new(args.program())
        .args(&cli_args)
        .output()
        .map_err(|e| MigrationError::from_io(PathBuf::from(args.program()), e))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let message = if stderr.is_empty() { stdout } else { stderr };
        let lowered = message.to_lowercase();
        if lowered.contains("access is denied") || lowered.contains("acesso negado") {
            Err(MigrationError::permission_denied(
                PathBuf::from(args.program()),
                message,
            ))
        } else {
            Err(MigrationError::Io(std::io::Error::other(format!(
                "{} exited with {}: {}",
                args.program(),
                output.status,
                message
            ))))
        }
    }
}

// ============================================================================
// Windows
// ============================================================================

/// `icacls`-based grantor
#[derive(Debug, Clone)]
pub struct IcaclsGrantor {
    work_dir: PathBuf,
}

impl IcaclsGrantor {
    /// Saved ACL files are written below `work_dir`
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }
}

impl PermissionGrantor for IcaclsGrantor {
    fn capture(&self, path: &CanonicalPath) -> Result<PermissionSnapshot> {
        let parent = path.parent().ok_or_else(|| {
            MigrationError::permission_denied(path.as_path(), "cannot capture ACLs of a root")
        })?;
        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| MigrationError::from_io(&self.work_dir, e))?;
        let acl_file = self
            .work_dir
            .join(format!("acl-{}.txt", uuid::Uuid::new_v4()));

        run_command(&IcaclsCommand::Save {
            path: path.as_path().to_path_buf(),
            acl_file: acl_file.clone(),
        })?;
        Ok(PermissionSnapshot::AclFile {
            parent: parent.into_path_buf(),
            acl_file,
        })
    }

    fn grant(&self, path: &CanonicalPath, principal: &str) -> Result<()> {
        run_command(&IcaclsCommand::Grant {
            path: path.as_path().to_path_buf(),
            principal: principal.to_string(),
        })
        .map(|_| ())
    }

    fn restore(&self, snapshot: &PermissionSnapshot) -> Result<()> {
        match snapshot {
            PermissionSnapshot::AclFile { parent, acl_file } => {
                run_command(&IcaclsCommand::Restore {
                    parent: parent.clone(),
                    acl_file: acl_file.clone(),
                })?;
                let _ = std::fs::remove_file(acl_file);
                Ok(())
            }
            PermissionSnapshot::Modes(_) => Err(MigrationError::config(
                "mode snapshot cannot be restored with icacls",
            )),
        }
    }

    fn verify(&self, path: &CanonicalPath, principal: &str) -> Option<bool> {
        let listing = run_command(&IcaclsCommand::Show {
            path: path.as_path().to_path_buf(),
        })
        .ok()?;
        let needle = format!("{}:", principal.to_lowercase());
        Some(listing.to_lowercase().contains(&needle))
    }
}

// ============================================================================
// Unix
// ============================================================================

/// Mode-bit grantor: "everyone" is the "other" class
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixModeGrantor;

#[cfg(unix)]
const OTHER_RW: u32 = 0o006;
#[cfg(unix)]
const OTHER_RWX: u32 = 0o007;

#[cfg(unix)]
impl UnixModeGrantor {
    fn walk(path: &CanonicalPath) -> impl Iterator<Item = walkdir::DirEntry> {
        walkdir::WalkDir::new(path.as_path())
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping entry during permission walk: {}", e);
                    None
                }
            })
    }
}

#[cfg(unix)]
impl PermissionGrantor for UnixModeGrantor {
    fn capture(&self, path: &CanonicalPath) -> Result<PermissionSnapshot> {
        use std::os::unix::fs::PermissionsExt;

        let mut modes = Vec::new();
        for entry in Self::walk(path) {
            let meta = std::fs::metadata(entry.path())
                .map_err(|e| MigrationError::from_io(entry.path(), e))?;
            modes.push((entry.path().to_path_buf(), meta.permissions().mode() & 0o7777));
        }
        Ok(PermissionSnapshot::Modes(modes))
    }

    fn grant(&self, path: &CanonicalPath, principal: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        tracing::debug!("Granting o+rw on {} for '{}'", path, principal);
        for entry in Self::walk(path) {
            let meta = std::fs::metadata(entry.path())
                .map_err(|e| MigrationError::from_io(entry.path(), e))?;
            let extra = if meta.is_dir() { OTHER_RWX } else { OTHER_RW };
            let mode = meta.permissions().mode() & 0o7777;
            if mode & extra != extra {
                std::fs::set_permissions(
                    entry.path(),
                    std::fs::Permissions::from_mode(mode | extra),
                )
                .map_err(|e| MigrationError::from_io(entry.path(), e))?;
            }
        }
        Ok(())
    }

    fn restore(&self, snapshot: &PermissionSnapshot) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let PermissionSnapshot::Modes(modes) = snapshot else {
            return Err(MigrationError::config(
                "ACL snapshot cannot be restored with mode bits",
            ));
        };
        for (path, mode) in modes {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(*mode))
                .map_err(|e| MigrationError::from_io(path, e))?;
        }
        Ok(())
    }

    fn verify(&self, path: &CanonicalPath, _principal: &str) -> Option<bool> {
        use std::os::unix::fs::PermissionsExt;

        let meta = std::fs::metadata(path.as_path()).ok()?;
        let extra = if meta.is_dir() { OTHER_RWX } else { OTHER_RW };
        Some(meta.permissions().mode() & extra == extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::canonicalize;

    #[test]
    fn test_icacls_grant_args() {
        let cmd = IcaclsCommand::Grant {
            path: PathBuf::from("/srv/emulation/roms"),
            principal: "Todos".to_string(),
        };
        assert_eq!(cmd.program(), "icacls");
        assert_eq!(
            cmd.to_cli_args(),
            vec!["/srv/emulation/roms", "/grant", "Todos:(OI)(CI)F", "/T"]
        );
    }

    #[test]
    fn test_icacls_save_restore_args() {
        let save = IcaclsCommand::Save {
            path: PathBuf::from("/srv/roms"),
            acl_file: PathBuf::from("/state/acl.txt"),
        };
        assert_eq!(
            save.to_cli_args(),
            vec!["/srv/roms", "/save", "/state/acl.txt", "/T", "/C"]
        );

        let restore = IcaclsCommand::Restore {
            parent: PathBuf::from("/srv"),
            acl_file: PathBuf::from("/state/acl.txt"),
        };
        assert_eq!(
            restore.to_cli_args(),
            vec!["/srv", "/restore", "/state/acl.txt", "/C"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_grant_and_restore() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let root = canonicalize(dir.path().join("roms")).unwrap();
        std::fs::create_dir(&root).unwrap();
        let file = root.join("game.sfc");
        std::fs::write(&file, b"rom").unwrap();
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600)).unwrap();

        let grantor = UnixModeGrantor;
        let snapshot = grantor.capture(&root).unwrap();
        assert_eq!(grantor.verify(&root, "Everyone"), Some(false));

        grantor.grant(&root, "Everyone").unwrap();
        assert_eq!(grantor.verify(&root, "Everyone"), Some(true));
        let mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o606);

        grantor.restore(&snapshot).unwrap();
        let mode = std::fs::metadata(&root).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        let mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_grant_follows_symlinked_slot() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let legacy = canonicalize(dir.path().join("legacy")).unwrap();
        std::fs::create_dir(&legacy).unwrap();
        std::fs::set_permissions(&legacy, std::fs::Permissions::from_mode(0o700)).unwrap();
        let slot = canonicalize(dir.path().join("slot")).unwrap();
        slot.symlink_to(&legacy).unwrap();

        UnixModeGrantor.grant(&slot, "Everyone").unwrap();
        let mode = std::fs::metadata(&legacy).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o707);
    }
}
