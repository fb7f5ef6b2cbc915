//! Remote command execution over one persistent SSH control connection.

use crate::config::RemoteConfig;
use crate::error::{PipelineError, Result};
use crate::utils::{output_lines, run_command, shell_quote};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Exit status ssh uses for its own failures (as opposed to the remote command's).
const SSH_CONNECTION_ERROR: i32 = 255;

/// Output of one remote command, split into lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CommandOutput {
    /// True when the command wrote anything to stderr.
    pub fn has_errors(&self) -> bool {
        self.stderr.iter().any(|l| !l.trim().is_empty())
    }
}

/// Access to the remote host.
///
/// Implementations do not retry and have no timeout. A failing remote command
/// still returns `Ok` with whatever it printed; only losing the connection
/// itself is an error.
pub trait Remote {
    /// Run a shell command on the remote host.
    fn execute(&self, command: &str) -> Result<CommandOutput>;

    /// Copy a local file to a path on the remote host.
    fn transfer(&self, local_path: &Path, remote_path: &str) -> Result<()>;
}

/// Run a listing command and return its non-empty stdout lines.
///
/// Any stderr output makes the whole listing untrustworthy, so it becomes
/// `ListingFailed` instead of a partial result.
pub fn listing(remote: &dyn Remote, command: &str) -> Result<Vec<String>> {
    let output = remote.execute(command)?;
    if output.has_errors() {
        return Err(PipelineError::ListingFailed {
            command: command.to_string(),
            detail: output.stderr.join("; "),
        });
    }
    Ok(output
        .stdout
        .into_iter()
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.trim().is_empty())
        .collect())
}

/// `Remote` backed by an OpenSSH control master.
///
/// The master is opened once in `connect` and every later command reuses its
/// socket, so the controller holds exactly one logical connection. It is
/// closed when the value is dropped.
#[derive(Debug)]
pub struct SshRemote {
    config: RemoteConfig,
    control_path: PathBuf,
}

impl SshRemote {
    /// Open the control master connection.
    pub fn connect(config: RemoteConfig) -> Result<Self> {
        let control_path =
            std::env::temp_dir().join(format!("shepherd-{}.sock", std::process::id()));
        let remote = Self {
            config,
            control_path,
        };

        let mut args = remote.base_args();
        args.extend([
            "-M".to_string(),
            "-f".to_string(),
            "-N".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-p".to_string(),
            remote.config.port.to_string(),
            remote.config.user_at_host(),
        ]);

        let result = run_command("ssh", &args)?;
        if result.return_code != 0 {
            return Err(PipelineError::ConnectionLost {
                host: remote.config.host.clone(),
                detail: result.stderr.trim().to_string(),
            });
        }

        info!(
            "Connected to {} (control socket {})",
            remote.config.user_at_host(),
            remote.control_path.display()
        );
        Ok(remote)
    }

    /// Options shared by every ssh and scp invocation.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(ref key) = self.config.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.push("-p".to_string());
        args.push(self.config.port.to_string());
        args.push(self.config.user_at_host());
        args.push("--".to_string());
        // One argument, so the remote shell handles pipes and globs.
        args.push(command.to_string());
        args
    }

    fn scp_args(&self, local_path: &Path, remote_path: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.push("-P".to_string());
        args.push(self.config.port.to_string());
        args.push(local_path.display().to_string());
        args.push(format!(
            "{}:{}",
            self.config.user_at_host(),
            shell_quote(remote_path)
        ));
        args
    }
}

impl Remote for SshRemote {
    fn execute(&self, command: &str) -> Result<CommandOutput> {
        debug!("ssh exec: {}", command);
        let result = run_command("ssh", &self.ssh_args(command))?;

        if result.return_code == SSH_CONNECTION_ERROR {
            return Err(PipelineError::ConnectionLost {
                host: self.config.host.clone(),
                detail: result.stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: output_lines(&result.stdout),
            stderr: output_lines(&result.stderr),
        })
    }

    fn transfer(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        debug!("scp {} -> {}", local_path.display(), remote_path);
        let result = run_command("scp", &self.scp_args(local_path, remote_path))?;

        if result.return_code != 0 {
            return Err(PipelineError::TransferFailed {
                local: local_path.display().to_string(),
                remote: remote_path.to_string(),
                detail: result.stderr.trim().to_string(),
            });
        }
        info!("Sent {} to server as {}", local_path.display(), remote_path);
        Ok(())
    }
}

impl Drop for SshRemote {
    fn drop(&mut self) {
        let mut args = self.base_args();
        args.extend([
            "-O".to_string(),
            "exit".to_string(),
            self.config.user_at_host(),
        ]);
        if let Err(e) = run_command("ssh", &args) {
            warn!("Failed to close control connection: {}", e);
        }
    }
}
