use crate::planner::TransferMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// emumigrate - consolidate legacy emulator installations
#[derive(Parser, Debug)]
#[command(name = "emumigrate")]
#[command(about = "Discovers legacy emulator installations and migrates them into a unified, symlinked layout")]
#[command(version)]
pub struct Cli {
    /// Configuration file (JSON); built-in defaults when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Dry-run mode: print the plan preview instead of executing it.
    ///
    /// Scanning and planning still run so the preview is realistic; nothing
    /// on disk is changed.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan search roots for legacy installations
    Scan {
        /// Search root (repeatable); overrides the configured roots
        #[arg(short, long = "root")]
        roots: Vec<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Scan and print a plan for every installation found
    Plan {
        /// Only installations whose name or root contains this text
        #[arg(long)]
        only: Option<String>,
        /// Print plans as JSON
        #[arg(long)]
        json: bool,
    },
    /// Scan, plan and execute migrations
    Migrate {
        /// Only installations whose name or root contains this text
        #[arg(long)]
        only: Option<String>,
        /// Do not ask before relaunching with administrator rights
        #[arg(short, long)]
        yes: bool,
    },
    /// Transfer one user-specified path
    Link {
        /// Existing file or directory
        #[arg(short, long)]
        source: String,
        /// Where it should appear
        #[arg(short, long)]
        target: String,
        /// link, move or copy
        #[arg(short, long, default_value = "link")]
        mode: TransferMode,
        /// Do not ask before relaunching with administrator rights
        #[arg(short, long)]
        yes: bool,
    },
    /// Execute a plan handed over by an unelevated process
    Resume {
        /// Handoff file written by the parent process
        #[arg(long)]
        handoff: PathBuf,
        /// Set by the relaunch itself; prevents elevation loops
        #[arg(long)]
        elevated_relaunch: bool,
    },
    /// List past executions, newest first
    History {
        /// Show at most this many entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show the latest recorded execution of one plan
    Status {
        /// Plan id, as printed by `history`
        plan_id: Uuid,
        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Undo a completed migration from its history record
    Rollback {
        /// Plan id, as printed by `history`
        plan_id: Uuid,
    },
    /// Validate a configuration file
    ValidateConfig {
        /// File to validate; defaults to --config
        path: Option<PathBuf>,
        /// Write the default configuration to PATH instead
        #[arg(long)]
        write_default: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Global arguments the elevated relaunch must see again
    pub fn forwarded_args(&self) -> Vec<String> {
        match &self.config {
            Some(path) => vec!["--config".to_string(), path.display().to_string()],
            None => Vec::new(),
        }
    }
}
