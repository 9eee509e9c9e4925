//! Migration Planner
//!
//! Translates a detected [`LegacyInstallation`] (or a user-specified
//! source/target pair) into an ordered, immutable [`MigrationPlan`].
//!
//! # Plan shape
//!
//! | Input                       | Steps generated |
//! |-----------------------------|-----------------|
//! | Installation                | [CreateDirectory(root)] → per dir: [CreateDirectory(slot)] → CreateSymlink → GrantPermission |
//! | Transfer, `Link`            | [CreateDirectory(parent)] → CreateSymlink → GrantPermission |
//! | Transfer, `Move`            | [CreateDirectory(parent)] → MoveFile |
//! | Transfer, `Copy`            | [CreateDirectory(parent)] → CopyFile |
//!
//! A *slot* is `target_root/<directory name>`. When absent it is created as a
//! placeholder which the symlink then replaces (the backup manager moves the
//! placeholder aside first), so every subtree is created, linked and granted
//! in that order.
//!
//! # Design
//!
//! - **Pure logic**: only reads the filesystem to decide what is already there
//! - **All or nothing**: any planning error aborts, no partial plan is returned
//! - **Derived elevation**: each step is checked against the [`WritableScope`]

use crate::error::{MigrationError, Result};
use crate::model::{LegacyInstallation, MigrationPlan, MigrationStep, StepAction};
use crate::path::{canonicalize, CanonicalPath};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use strum::{Display, EnumString};

/// Directory under the target root that receives copied config files
pub const IMPORTED_CONFIG_DIR: &str = "imported-config";

// ============================================================================
// Writable scope
// ============================================================================

/// Locations the current process can write without elevation.
#[derive(Debug, Clone, Default)]
pub struct WritableScope {
    roots: Vec<CanonicalPath>,
}

impl WritableScope {
    /// Scope with no writable locations; every target needs elevation
    pub fn empty() -> Self {
        Self::default()
    }

    /// Home and temp directories of the current process, plus `extra`
    pub fn for_current_process(extra: &[CanonicalPath]) -> Self {
        let mut roots = Vec::new();
        if let Some(home) = dirs::home_dir().and_then(|h| canonicalize(h).ok()) {
            roots.push(home);
        }
        if let Ok(temp) = canonicalize(std::env::temp_dir()) {
            roots.push(temp);
        }
        roots.extend(extra.iter().cloned());
        Self { roots }
    }

    /// Scope made of exactly `roots`
    pub fn from_roots(roots: impl IntoIterator<Item = CanonicalPath>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }

    /// True if `path` lies within a writable root
    pub fn contains(&self, path: &CanonicalPath) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }

    pub fn roots(&self) -> &[CanonicalPath] {
        &self.roots
    }
}

// ============================================================================
// Planner
// ============================================================================

/// How a user-specified pair is transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransferMode {
    /// Replace the target with a symlink to the source
    Link,
    /// Move the source file to the target
    Move,
    /// Copy the source file to the target
    Copy,
}

/// Planner behaviour switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlannerOptions {
    /// Also copy detected config files into `target_root/imported-config/<family>/`
    pub migrate_config_files: bool,
}

/// Builds migration plans.
#[derive(Debug, Clone)]
pub struct MigrationPlanner {
    scope: WritableScope,
    options: PlannerOptions,
    symlinks_need_elevation: bool,
}

/// What currently occupies a slot
enum SlotState {
    Absent,
    AlreadyLinked,
    Replaceable,
}

impl MigrationPlanner {
    /// Planner for the current host; symlinks need elevation on Windows only
    pub fn new(scope: WritableScope, options: PlannerOptions) -> Self {
        Self {
            scope,
            options,
            symlinks_need_elevation: cfg!(windows),
        }
    }

    /// Override whether symlink creation needs elevation on this host
    pub fn with_symlink_elevation(mut self, required: bool) -> Self {
        self.symlinks_need_elevation = required;
        self
    }

    fn needs_elevation(&self, step: &MigrationStep) -> bool {
        !self.scope.contains(step.target_path())
            || (step.action() == StepAction::CreateSymlink && self.symlinks_need_elevation)
    }

    fn finish(&self, step: MigrationStep) -> MigrationStep {
        let elevated = self.needs_elevation(&step);
        step.with_elevation(elevated)
    }

    /// Plan the consolidation of `installation` into `target_root`.
    ///
    /// # Errors
    ///
    /// - `EmptyPlan` if the installation has nothing to migrate
    /// - `TargetConflict` if `target_root` is not a directory, two directories
    ///   map to the same slot, or a slot holds data that must not be replaced
    pub fn plan(
        &self,
        installation: &LegacyInstallation,
        target_root: &CanonicalPath,
    ) -> Result<MigrationPlan> {
        check_target_root(target_root)?;

        let config_files: &[CanonicalPath] = if self.options.migrate_config_files {
            &installation.detected_config_files
        } else {
            &[]
        };
        if installation.migratable_dirs().next().is_none() && config_files.is_empty() {
            return Err(MigrationError::EmptyPlan(format!(
                "{} at {} has no ROM, save or config directories",
                installation.display_name, installation.root_path
            )));
        }

        let mut steps = Vec::new();
        if !target_root.exists() {
            steps.push(MigrationStep::create_directory(target_root.clone()));
        }

        let mut slots = HashSet::new();
        for dir in installation.migratable_dirs() {
            let name = dir.file_name().ok_or_else(|| {
                MigrationError::target_conflict(dir.as_path(), "directory has no name")
            })?;
            let slot = target_root.join(name);
            if !slots.insert(slot.clone()) {
                return Err(MigrationError::target_conflict(
                    slot.as_path(),
                    "two legacy directories map to the same slot",
                ));
            }
            self.push_link_steps(dir, &slot, &mut steps)?;
        }

        if !config_files.is_empty() {
            let family = installation
                .families
                .first()
                .map(String::as_str)
                .unwrap_or("unknown");
            let dest_dir = target_root.join(IMPORTED_CONFIG_DIR).join(family);
            if !dest_dir.exists() {
                steps.push(MigrationStep::create_directory(dest_dir.clone()));
            }
            for file in config_files {
                let Some(name) = file.file_name() else {
                    continue;
                };
                steps.push(MigrationStep::copy_file(file.clone(), dest_dir.join(name)));
            }
        }

        let steps = steps.into_iter().map(|s| self.finish(s)).collect();
        let plan = MigrationPlan::new(
            format!(
                "Migrate {} from {} into {}",
                installation.display_name, installation.root_path, target_root
            ),
            target_root.clone(),
            steps,
        )?;
        tracing::info!(
            "Planned {} step(s) for {} (elevation required: {})",
            plan.total_steps(),
            installation.display_name,
            plan.requires_elevation()
        );
        Ok(plan)
    }

    /// Plan a single user-specified transfer from `source` to `target`.
    ///
    /// # Errors
    ///
    /// - `EmptyPlan` if `source` does not exist
    /// - `TargetConflict` if `Move`/`Copy` is asked for a directory, or the
    ///   target is occupied by data the mode must not replace
    pub fn plan_transfer(
        &self,
        source: &CanonicalPath,
        target: &CanonicalPath,
        mode: TransferMode,
    ) -> Result<MigrationPlan> {
        if !source.exists() {
            return Err(MigrationError::EmptyPlan(format!("source {} does not exist", source)));
        }
        if source == target {
            return Err(MigrationError::target_conflict(
                target.as_path(),
                "source and target are the same path",
            ));
        }
        let parent = target.parent().ok_or_else(|| {
            MigrationError::target_conflict(target.as_path(), "target has no parent directory")
        })?;
        check_target_root(&parent)?;

        let mut steps = Vec::new();
        if !parent.exists() {
            steps.push(MigrationStep::create_directory(parent.clone()));
        }

        match mode {
            TransferMode::Link => {
                slot_state(source, target)?;
                steps.push(MigrationStep::create_symlink(source.clone(), target.clone()));
                steps.push(MigrationStep::grant_permission(target.clone()));
            }
            TransferMode::Move | TransferMode::Copy => {
                if source.is_dir() {
                    return Err(MigrationError::target_conflict(
                        source.as_path(),
                        "move and copy transfers operate on files; use link mode for directories",
                    ));
                }
                if target.is_dir() {
                    return Err(MigrationError::target_conflict(
                        target.as_path(),
                        "target is a directory",
                    ));
                }
                if mode == TransferMode::Move {
                    if target.is_occupied() {
                        return Err(MigrationError::target_conflict(
                            target.as_path(),
                            "move target already exists",
                        ));
                    }
                    steps.push(MigrationStep::move_file(source.clone(), target.clone()));
                } else {
                    steps.push(MigrationStep::copy_file(source.clone(), target.clone()));
                }
            }
        }

        let steps = steps.into_iter().map(|s| self.finish(s)).collect();
        MigrationPlan::new(
            format!("{} {} to {}", mode, source, target),
            parent,
            steps,
        )
    }

    fn push_link_steps(
        &self,
        source: &CanonicalPath,
        slot: &CanonicalPath,
        steps: &mut Vec<MigrationStep>,
    ) -> Result<()> {
        match slot_state(source, slot)? {
            SlotState::Absent => {
                steps.push(MigrationStep::create_directory(slot.clone()));
            }
            SlotState::AlreadyLinked => {
                tracing::debug!("{} already links to {}", slot, source);
            }
            SlotState::Replaceable => {}
        }
        steps.push(MigrationStep::create_symlink(source.clone(), slot.clone()));
        steps.push(MigrationStep::grant_permission(slot.clone()));
        Ok(())
    }
}

fn check_target_root(root: &CanonicalPath) -> Result<()> {
    if root.is_occupied() && !root.is_dir() {
        return Err(MigrationError::target_conflict(
            root.as_path(),
            "target root exists and is not a directory",
        ));
    }
    Ok(())
}

/// Classify what occupies `slot` before linking it to `source`
fn slot_state(source: &CanonicalPath, slot: &CanonicalPath) -> Result<SlotState> {
    if slot == source {
        return Err(MigrationError::target_conflict(
            slot.as_path(),
            "legacy directory already sits at the target location",
        ));
    }
    if !slot.is_occupied() {
        return Ok(SlotState::Absent);
    }
    if slot.links_to(source) {
        return Ok(SlotState::AlreadyLinked);
    }
    if slot.is_symlink() {
        return Ok(SlotState::Replaceable);
    }
    if slot.is_dir() {
        let mut entries = std::fs::read_dir(slot.as_path())
            .map_err(|e| MigrationError::from_io(slot.as_path(), e))?;
        if entries.next().is_none() {
            return Ok(SlotState::Replaceable);
        }
        return Err(MigrationError::target_conflict(
            slot.as_path(),
            "slot is a non-empty directory",
        ));
    }
    Err(MigrationError::target_conflict(
        slot.as_path(),
        "slot is occupied by a file",
    ))
}
