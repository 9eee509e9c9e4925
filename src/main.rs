//! emumigrate - main entry point
//!
//! Thin presentation layer over [`MigrationSession`]: parses arguments,
//! wires Ctrl+C to cancellation and prints structured results.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use emumigrate::cli::{Cli, Commands};
use emumigrate::config::MigrationConfig;
use emumigrate::elevation::{CommandRelauncher, ConsentPrompt, FixedConsent, StdinConsentPrompt};
use emumigrate::engine::{CancellationToken, RevertReport};
use emumigrate::error::{ErrorKind, MigrationError};
use emumigrate::model::{ExecutionResult, LegacyInstallation, MigrationPlan};
use emumigrate::path::canonicalize;
use emumigrate::session::{MigrationSession, RunOutcome};

/// Initialize tracing; `RUST_LOG` overrides the default `info` level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse_args();
    debug!("CLI arguments parsed: {:?}", cli);

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            if let Some(hint) = e.downcast_ref::<MigrationError>().and_then(hint_for) {
                eprintln!("✗ {}\n  {}", e, hint);
            } else {
                eprintln!("✗ {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::ValidateConfig {
            path,
            write_default,
        } => validate_config(path.as_deref().or(cli.config.as_deref()), *write_default),
        Commands::Scan { roots, json } => {
            let mut config = MigrationConfig::load_or_default(cli.config.as_deref())?;
            if !roots.is_empty() {
                config.search_roots = roots.clone();
            }
            let session = build_session(cli, &config, false)?;
            let report = session.scan()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for installation in &report.installations {
                    print_installation(installation);
                }
                for warning in &report.warnings {
                    println!("! {}: {}", warning.path.display(), warning.message);
                }
                println!(
                    "{} installation(s), {} warning(s)",
                    report.installations.len(),
                    report.warnings.len()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan { only, json } => {
            let config = MigrationConfig::load_or_default(cli.config.as_deref())?;
            let session = build_session(cli, &config, false)?;
            for plan in plan_installations(&session, only.as_deref())? {
                if *json {
                    println!("{}", serde_json::to_string_pretty(&plan)?);
                } else {
                    print_preview(&plan);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate { only, yes } => {
            let config = MigrationConfig::load_or_default(cli.config.as_deref())?;
            let mut session = build_session(cli, &config, *yes)?;
            let plans = plan_installations(&session, only.as_deref())?;
            if plans.is_empty() {
                println!("Nothing to migrate");
                return Ok(ExitCode::SUCCESS);
            }

            let cancel = cancellation_on_ctrlc();
            let mut all_ok = true;
            for plan in &plans {
                if cli.dry_run {
                    print_preview(plan);
                    continue;
                }
                all_ok &= execute_plan(&mut session, plan, &cancel)?;
                if cancel.is_cancelled() {
                    warn!("Cancelled; remaining plans skipped");
                    break;
                }
            }
            Ok(exit_code(all_ok))
        }
        Commands::Link {
            source,
            target,
            mode,
            yes,
        } => {
            let config = MigrationConfig::load_or_default(cli.config.as_deref())?;
            let mut session = build_session(cli, &config, *yes)?;
            let source = canonicalize(source.as_str()).context("Invalid source path")?;
            let target = canonicalize(target.as_str()).context("Invalid target path")?;
            let plan = session.plan_transfer(&source, &target, *mode)?;
            if cli.dry_run {
                print_preview(&plan);
                return Ok(ExitCode::SUCCESS);
            }
            let cancel = cancellation_on_ctrlc();
            Ok(exit_code(execute_plan(&mut session, &plan, &cancel)?))
        }
        Commands::Resume {
            handoff,
            elevated_relaunch,
        } => {
            let config = MigrationConfig::load_or_default(cli.config.as_deref())?;
            let mut session = build_session(cli, &config, false)?;
            if *elevated_relaunch {
                session = session.mark_elevated_relaunch();
            }
            let cancel = cancellation_on_ctrlc();
            let result = session.resume(handoff, &cancel)?;
            print_result(&result);
            Ok(exit_code(result.is_success()))
        }
        Commands::History { limit } => {
            let config = MigrationConfig::load_or_default(cli.config.as_deref())?;
            let session = build_session(cli, &config, false)?;
            let entries = session.history()?;
            if entries.is_empty() {
                println!("No migrations recorded");
            }
            for entry in entries.iter().take(limit.unwrap_or(usize::MAX)) {
                println!("{}", entry.summary_line());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { plan_id, json } => {
            let config = MigrationConfig::load_or_default(cli.config.as_deref())?;
            let session = build_session(cli, &config, false)?;
            let Some(entry) = session.status(*plan_id) else {
                println!("No execution of plan {} is recorded", plan_id);
                return Ok(ExitCode::FAILURE);
            };
            if *json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("{}", entry.summary_line());
                print_result(&entry.result);
                for backup in &entry.result.backups {
                    println!("  backup {} -> {}", backup.original_path, backup.backup_path);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rollback { plan_id } => {
            let config = MigrationConfig::load_or_default(cli.config.as_deref())?;
            let session = build_session(cli, &config, false)?;
            if cli.dry_run {
                match session.status(*plan_id) {
                    Some(entry) => print_preview(&entry.plan),
                    None => println!("No execution of plan {} is recorded", plan_id),
                }
                return Ok(ExitCode::SUCCESS);
            }
            let report = session.rollback(*plan_id)?;
            print_revert(&report);
            Ok(exit_code(report.is_complete()))
        }
    }
}

fn build_session(cli: &Cli, config: &MigrationConfig, assume_yes: bool) -> Result<MigrationSession> {
    let prompt: Arc<dyn ConsentPrompt> = if assume_yes {
        Arc::new(FixedConsent(true))
    } else {
        Arc::new(StdinConsentPrompt)
    };
    let relauncher = CommandRelauncher::current(cli.forwarded_args())?;
    MigrationSession::from_config(config, prompt, Box::new(relauncher))
        .context("Failed to set up migration session")
}

fn validate_config(path: Option<&Path>, write_default: bool) -> Result<ExitCode> {
    let path: PathBuf = path
        .map(Path::to_path_buf)
        .context("No configuration file given (pass a path or --config)")?;

    if write_default {
        MigrationConfig::default().save_to_file(&path)?;
        println!("✓ Default configuration written to {:?}", path);
        return Ok(ExitCode::SUCCESS);
    }

    info!("Validating configuration file: {:?}", path);
    let config = MigrationConfig::load_from_file(&path)?;
    config.validate()?;
    println!("✓ Configuration file is valid: {:?}", path);
    Ok(ExitCode::SUCCESS)
}

/// Scan, then plan every installation matching `only`
fn plan_installations(session: &MigrationSession, only: Option<&str>) -> Result<Vec<MigrationPlan>> {
    let report = session.scan()?;
    for warning in &report.warnings {
        warn!("{}: {}", warning.path.display(), warning.message);
    }

    let mut plans = Vec::new();
    for installation in report.installations.iter().filter(|i| matches_filter(i, only)) {
        match session.plan(installation) {
            Ok(plan) => plans.push(plan),
            Err(e) => {
                eprintln!("✗ Cannot plan {}: {}", installation.display_name, e);
                if let Some(hint) = hint_for(&e) {
                    eprintln!("  {}", hint);
                }
            }
        }
    }
    Ok(plans)
}

fn matches_filter(installation: &LegacyInstallation, only: Option<&str>) -> bool {
    let Some(needle) = only else {
        return true;
    };
    let needle = needle.to_lowercase();
    installation.display_name.to_lowercase().contains(&needle)
        || installation
            .root_path
            .to_string()
            .to_lowercase()
            .contains(&needle)
}

/// Run one plan and report; returns true on success
fn execute_plan(
    session: &mut MigrationSession,
    plan: &MigrationPlan,
    cancel: &CancellationToken,
) -> Result<bool> {
    print_preview(plan);
    let outcome = match session.run(plan, cancel) {
        Ok(outcome) => outcome,
        Err(e) => {
            // Lock and disk-space refusals happen before anything is touched
            eprintln!("✗ {} not started: {}", plan.id(), e);
            if let Some(hint) = hint_for(&e) {
                eprintln!("  {}", hint);
            }
            return Ok(false);
        }
    };

    match &outcome {
        RunOutcome::Denied { reason } => {
            eprintln!("✗ Elevation denied: {}", reason);
            eprintln!("  Nothing was changed. Re-run from an administrator shell to apply this plan.");
            return Ok(false);
        }
        RunOutcome::ExecutedElevated {
            exit_code,
            result: None,
        } => {
            eprintln!(
                "✗ Elevated process exited ({:?}) without reporting a result",
                exit_code
            );
            return Ok(false);
        }
        _ => {}
    }

    let Some(result) = outcome.result() else {
        return Ok(false);
    };
    print_result(result);
    if result.is_success() {
        let validation = session.validate_completed(plan, result);
        for issue in &validation.issues {
            eprintln!("✗ Step {}: {}", issue.step_index + 1, issue.message);
        }
        for warning in &validation.warnings {
            println!("! {}", warning);
        }
        return Ok(validation.is_valid());
    }
    Ok(false)
}

fn cancellation_on_ctrlc() -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("Cancelling after the current step...");
        handler_token.cancel();
    }) {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }
    token
}

/// Actionable advice; by kind, so refusals reported by an elevated child match too
fn hint_for(err: &MigrationError) -> Option<&'static str> {
    match err.kind() {
        ErrorKind::DiskSpaceInsufficient => {
            Some("Free up space or point backup_root at another drive; nothing was changed.")
        }
        ErrorKind::MigrationInProgress => {
            Some("Another migration is running against this target; wait for it to finish.")
        }
        ErrorKind::PermissionDenied | ErrorKind::SymlinkUnsupported => {
            Some("Re-run with administrator rights, or enable Developer Mode for symlinks on Windows.")
        }
        ErrorKind::TargetConflict => {
            Some("Move the existing data aside or choose another target_root.")
        }
        ErrorKind::NotRevertible => Some("Check the plan id with `emumigrate history`."),
        _ => None,
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn print_installation(installation: &LegacyInstallation) {
    println!("{}  {}", installation.display_name, installation.root_path);
    println!(
        "  {} ROM dir(s), {} save dir(s), {} config dir(s), {} config file(s)",
        installation.detected_rom_dirs.len(),
        installation.detected_save_dirs.len(),
        installation.detected_config_dirs.len(),
        installation.detected_config_files.len()
    );
}

fn print_preview(plan: &MigrationPlan) {
    let preview = plan.preview();
    println!("{}", plan.summary());
    println!(
        "  Risk: {}  Elevation: {}",
        preview.risk_level,
        if preview.requires_elevation { "required" } else { "not required" }
    );
    for warning in &preview.warnings {
        println!("  ! {}", warning);
    }
}

fn print_revert(report: &RevertReport) {
    println!(
        "Plan {}: {} step(s) reverted",
        report.plan_id,
        report.reverted_steps.len()
    );
    for warning in &report.warnings {
        eprintln!("! {}", warning);
    }
}

fn print_result(result: &ExecutionResult) {
    println!(
        "Plan {}: {} ({} step(s) succeeded, {} backup(s))",
        result.plan_id,
        result.status(),
        result.succeeded_steps.len(),
        result.backups.len()
    );
    if let Some(failure) = &result.failed_step {
        eprintln!(
            "✗ Step {} failed ({}): {}",
            failure.index + 1,
            failure.kind,
            failure.message
        );
        if result.rollback_performed {
            eprintln!("  All changes were rolled back.");
        }
    }
    for warning in &result.warnings {
        println!("! {}", warning);
    }
}
