//! Consent and relaunch collaborators.
//!
//! Both are traits so the elevator can be driven without a terminal or a
//! real `sudo`/UAC prompt.

use crate::error::{MigrationError, Result};
use crate::permissions::CommandArgs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Environment marker carried by the elevated relaunch
pub const ELEVATION_MARKER_ENV: &str = "EMUMIGRATE_ELEVATION_ATTEMPTED";

/// What the user is asked to approve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRequest {
    pub plan_id: Uuid,
    pub description: String,
    pub reason: String,
    pub elevated_steps: usize,
}

/// Asks the user whether to elevate.
pub trait ConsentPrompt: Send + Sync {
    /// `true` to proceed; anything else is a decline
    fn confirm(&self, request: &ConsentRequest) -> bool;
}

/// Terminal prompt on stderr/stdin
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinConsentPrompt;

impl ConsentPrompt for StdinConsentPrompt {
    fn confirm(&self, request: &ConsentRequest) -> bool {
        let mut stderr = io::stderr();
        let _ = writeln!(
            stderr,
            "Plan '{}' needs administrator rights for {} step(s): {}",
            request.description, request.elevated_steps, request.reason
        );
        let _ = write!(stderr, "Relaunch elevated? [y/N] ");
        let _ = stderr.flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

/// Fixed answer, for `--yes` and non-interactive use
#[derive(Debug, Clone, Copy)]
pub struct FixedConsent(pub bool);

impl ConsentPrompt for FixedConsent {
    fn confirm(&self, _request: &ConsentRequest) -> bool {
        self.0
    }
}

/// Ask `prompt`, treating no answer within `timeout` as a decline.
///
/// The prompt runs on its own thread; on timeout that thread is abandoned.
pub fn ask_with_timeout(
    prompt: Arc<dyn ConsentPrompt>,
    request: &ConsentRequest,
    timeout: Option<Duration>,
) -> bool {
    let Some(timeout) = timeout else {
        return prompt.confirm(request);
    };

    let (tx, rx) = mpsc::channel();
    let owned = request.clone();
    thread::spawn(move || {
        let _ = tx.send(prompt.confirm(&owned));
    });

    match rx.recv_timeout(timeout) {
        Ok(answer) => answer,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!("No answer to elevation prompt within {:?}", timeout);
            false
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => false,
    }
}

/// Starts an elevated copy of the process pointed at a handoff file.
pub trait Relauncher: Send + Sync {
    /// Run the elevated child to completion; returns its exit code if known
    fn relaunch(&self, handoff: &Path) -> Result<Option<i32>>;
}

/// Elevated `resume` invocation for the host platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelaunchCommand {
    /// `sudo env MARKER=1 <exe> [args] resume --handoff <file> --elevated-relaunch`
    Sudo {
        exe: PathBuf,
        forwarded: Vec<String>,
        handoff: PathBuf,
    },
    /// `powershell Start-Process <exe> -Verb RunAs -Wait`
    RunAs {
        exe: PathBuf,
        forwarded: Vec<String>,
        handoff: PathBuf,
    },
}

impl RelaunchCommand {
    /// Command for the current platform
    pub fn for_platform(exe: PathBuf, forwarded: Vec<String>, handoff: PathBuf) -> Self {
        if cfg!(windows) {
            Self::RunAs {
                exe,
                forwarded,
                handoff,
            }
        } else {
            Self::Sudo {
                exe,
                forwarded,
                handoff,
            }
        }
    }

    fn resume_args(forwarded: &[String], handoff: &Path) -> Vec<String> {
        let mut args = forwarded.to_vec();
        args.extend([
            "resume".to_string(),
            "--handoff".to_string(),
            handoff.display().to_string(),
            "--elevated-relaunch".to_string(),
        ]);
        args
    }
}

impl CommandArgs for RelaunchCommand {
    fn program(&self) -> &'static str {
        match self {
            Self::Sudo { .. } => "sudo",
            Self::RunAs { .. } => "powershell",
        }
    }

    fn to_cli_args(&self) -> Vec<String> {
        match self {
            Self::Sudo {
                exe,
                forwarded,
                handoff,
            } => {
                let mut args = vec![
                    "env".to_string(),
                    format!("{}=1", ELEVATION_MARKER_ENV),
                    exe.display().to_string(),
                ];
                args.extend(Self::resume_args(forwarded, handoff));
                args
            }
            Self::RunAs {
                exe,
                forwarded,
                handoff,
            } => {
                let quoted: Vec<String> = Self::resume_args(forwarded, handoff)
                    .iter()
                    .map(|a| format!("'{}'", a.replace('\'', "''")))
                    .collect();
                let script = format!(
                    "$p = Start-Process -FilePath '{}' -ArgumentList {} -Verb RunAs -Wait -PassThru; exit $p.ExitCode",
                    exe.display().to_string().replace('\'', "''"),
                    quoted.join(",")
                );
                vec![
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-Command".to_string(),
                    script,
                ]
            }
        }
    }
}

/// Relaunches the current executable through `sudo` or UAC
#[derive(Debug, Clone)]
pub struct CommandRelauncher {
    exe: PathBuf,
    forwarded: Vec<String>,
}

impl CommandRelauncher {
    /// `forwarded` are global arguments (such as `--config`) the child needs
    pub fn new(exe: PathBuf, forwarded: Vec<String>) -> Self {
        Self { exe, forwarded }
    }

    /// Relauncher for the running binary
    pub fn current(forwarded: Vec<String>) -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| MigrationError::elevation(format!("cannot locate own executable: {}", e)))?;
        Ok(Self::new(exe, forwarded))
    }
}

impl Relauncher for CommandRelauncher {
    fn relaunch(&self, handoff: &Path) -> Result<Option<i32>> {
        let command =
            RelaunchCommand::for_platform(self.exe.clone(), self.forwarded.clone(), handoff.to_path_buf());
        let args = command.to_cli_args();
        tracing::info!("Relaunching elevated: {} {:?}", command.program(), args);

        let status = Command::new(command.program())
            .args(&args)
            .env(ELEVATION_MARKER_ENV, "1")
            .status()
            .map_err(|e| {
                MigrationError::elevation(format!("could not start {}: {}", command.program(), e))
            })?;
        Ok(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> ConsentRequest {
        ConsentRequest {
            plan_id: Uuid::nil(),
            description: "test".to_string(),
            reason: "symlinks".to_string(),
            elevated_steps: 2,
        }
    }

    struct SlowPrompt;

    impl ConsentPrompt for SlowPrompt {
        fn confirm(&self, _request: &ConsentRequest) -> bool {
            thread::sleep(Duration::from_millis(500));
            true
        }
    }

    struct CountingPrompt(AtomicUsize);

    impl ConsentPrompt for CountingPrompt {
        fn confirm(&self, _request: &ConsentRequest) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_timeout_counts_as_decline() {
        let answer = ask_with_timeout(
            Arc::new(SlowPrompt),
            &request(),
            Some(Duration::from_millis(20)),
        );
        assert!(!answer);
    }

    #[test]
    fn test_answer_within_timeout() {
        let prompt = Arc::new(CountingPrompt(AtomicUsize::new(0)));
        assert!(ask_with_timeout(
            prompt.clone(),
            &request(),
            Some(Duration::from_secs(5))
        ));
        assert!(ask_with_timeout(prompt.clone(), &request(), None));
        assert_eq!(prompt.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sudo_args_carry_marker_and_flag() {
        let cmd = RelaunchCommand::Sudo {
            exe: PathBuf::from("/usr/bin/emumigrate"),
            forwarded: vec!["--config".to_string(), "/etc/emu.json".to_string()],
            handoff: PathBuf::from("/var/state/handoff/x.json"),
        };
        assert_eq!(cmd.program(), "sudo");
        assert_eq!(
            cmd.to_cli_args(),
            vec![
                "env",
                "EMUMIGRATE_ELEVATION_ATTEMPTED=1",
                "/usr/bin/emumigrate",
                "--config",
                "/etc/emu.json",
                "resume",
                "--handoff",
                "/var/state/handoff/x.json",
                "--elevated-relaunch",
            ]
        );
    }

    #[test]
    fn test_runas_quotes_arguments() {
        let cmd = RelaunchCommand::RunAs {
            exe: PathBuf::from(r"C:\Tools\emumigrate.exe"),
            forwarded: vec![],
            handoff: PathBuf::from(r"C:\Users\o'neil\handoff\x.json"),
        };
        let args = cmd.to_cli_args();
        assert_eq!(cmd.program(), "powershell");
        assert!(args[3].contains("-Verb RunAs -Wait"));
        assert!(args[3].contains("'--elevated-relaunch'"));
        assert!(args[3].contains("o''neil"));
    }
}
