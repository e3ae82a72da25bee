// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`GuestShell`] over the system OpenSSH client.

use super::CommandOutput;
use super::GuestShell;
use super::RemoteError;
use super::RunOptions;
use crate::CommandError;
use crate::HostOutput;
use crate::run_host_cmd;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

/// ssh reports its own failures (as opposed to the remote command's) with
/// this exit status.
const SSH_ERROR_STATUS: i32 = 255;

/// How to reach the guest over SSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    /// Guest address or host name.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user. Must have passwordless sudo for privileged commands.
    pub user: String,
    /// Private key to authenticate with; the ssh agent/default keys otherwise.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Seconds to wait for the TCP connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Seconds to allow for a single file copy.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_transfer_timeout() -> u64 {
    600
}

impl SshConfig {
    /// A config with default port and timeouts.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            identity_file: None,
            connect_timeout_secs: default_connect_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}

/// Runs guest commands with `ssh` and copies files with `scp`.
pub struct SshShell {
    config: SshConfig,
}

impl SshShell {
    /// Creates a shell for the given guest.
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// The connection settings.
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn base_command(&self, program: &str, port_flag: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg(port_flag)
            .arg(self.config.port.to_string());
        if let Some(key) = &self.config.identity_file {
            cmd.arg("-i").arg(key);
        }
        cmd
    }

    fn login(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host)
    }

    /// `user@host:path` for scp, bracketing IPv6 literals.
    fn scp_target(&self, path: &str) -> String {
        if self.config.host.contains(':') {
            format!("{}@[{}]:{}", self.config.user, self.config.host, path)
        } else {
            format!("{}:{}", self.login(), path)
        }
    }

    /// Maps an ssh/scp exit status of 255 to the transport failure ssh
    /// reported, if any.
    fn transport_error(&self, output: &HostOutput) -> Option<RemoteError> {
        if output.status.code() != Some(SSH_ERROR_STATUS) {
            return None;
        }
        classify_transport_failure(&self.config.host, &output.stderr)
    }

    fn transfer(&self, path: &str, from: &str, to: &str) -> Result<(), RemoteError> {
        let mut cmd = self.base_command("scp", "-P");
        cmd.arg("-q").arg(from).arg(to);
        let timeout = Duration::from_secs(self.config.transfer_timeout_secs);
        let output = run_host_cmd(cmd, Some(timeout)).map_err(map_command_error)?;
        if output.status.success() {
            return Ok(());
        }
        Err(self
            .transport_error(&output)
            .unwrap_or_else(|| RemoteError::Transfer {
                path: path.to_owned(),
                message: output.stderr.trim().to_owned(),
            }))
    }
}

/// Wraps `command` so that it runs as root through a non-interactive sudo.
pub(crate) fn sudo_wrap(command: &str) -> String {
    format!("sudo -n bash -c {}", shell_words::quote(command))
}

fn is_connection_failure(stderr: &str) -> bool {
    [
        "Connection refused",
        "Connection timed out",
        "Connection reset",
        "Connection closed",
        "No route to host",
        "Network is unreachable",
        "Could not resolve hostname",
        "lost connection",
    ]
    .iter()
    .any(|m| stderr.contains(m))
}

/// Rejected credentials or host keys; retrying will not help.
fn is_auth_failure(stderr: &str) -> bool {
    [
        "Permission denied",
        "Host key verification failed",
        "Too many authentication failures",
    ]
    .iter()
    .any(|m| stderr.contains(m))
}

fn classify_transport_failure(host: &str, stderr: &str) -> Option<RemoteError> {
    let message = stderr.trim().to_owned();
    let host = host.to_owned();
    if is_auth_failure(stderr) {
        Some(RemoteError::Auth { host, message })
    } else if is_connection_failure(stderr) {
        Some(RemoteError::Connect { host, message })
    } else {
        None
    }
}

fn map_command_error(err: CommandError) -> RemoteError {
    match err {
        CommandError::Launch(err) => RemoteError::Io(err),
        CommandError::Timeout(timeout) => RemoteError::Timeout(timeout),
        CommandError::Command(status, stderr) => RemoteError::CommandFailed {
            command: String::new(),
            status: status.code().unwrap_or(-1),
            stderr,
        },
    }
}

impl GuestShell for SshShell {
    fn run(&self, command: &str, options: &RunOptions) -> Result<CommandOutput, RemoteError> {
        let remote = if options.sudo {
            sudo_wrap(command)
        } else {
            command.to_owned()
        };
        let mut cmd = self.base_command("ssh", "-p");
        cmd.arg(self.login()).arg("--").arg(&remote);

        let output = run_host_cmd(cmd, options.timeout).map_err(map_command_error)?;
        let status = output.status.code().unwrap_or(-1);
        // A remote command may legitimately exit with 255 too, so only treat
        // it as a transport failure when ssh says so.
        if let Some(err) = self.transport_error(&output) {
            return Err(err);
        }

        let output = CommandOutput {
            status,
            stdout: output.stdout.trim_end().to_owned(),
            stderr: output.stderr,
        };
        tracing::debug!(command = remote, status, "guest command finished");
        if !output.success() && !options.allow_failure {
            return Err(RemoteError::CommandFailed {
                command: command.to_owned(),
                status,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    fn upload(&self, local: &Path, remote_dir: &str) -> Result<(), RemoteError> {
        let path = local.display().to_string();
        let dir = if remote_dir.ends_with('/') {
            remote_dir.to_owned()
        } else {
            format!("{remote_dir}/")
        };
        tracing::info!(file = path, remote_dir, "uploading to guest");
        self.transfer(&path, &path, &self.scp_target(&dir))
    }

    fn download(&self, remote_path: &str, local_dir: &Path) -> Result<PathBuf, RemoteError> {
        let file_name = remote_path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RemoteError::Transfer {
                path: remote_path.to_owned(),
                message: "not a file path".into(),
            })?;
        fs_err::create_dir_all(local_dir)?;
        let local = local_dir.join(file_name);
        tracing::info!(file = remote_path, local = %local.display(), "downloading from guest");
        self.transfer(
            remote_path,
            &self.scp_target(remote_path),
            &local.display().to_string(),
        )?;
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn base_command_carries_port_and_key() {
        let mut config = SshConfig::new("10.0.0.5", "lisa");
        config.port = 2222;
        config.identity_file = Some("/keys/id_rsa".into());
        let shell = SshShell::new(config);
        let a = args(&shell.base_command("ssh", "-p"));
        assert!(a.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(a.windows(2).any(|w| w == ["-i", "/keys/id_rsa"]));
        assert!(a.contains(&"ConnectTimeout=10".to_owned()));
        assert!(a.contains(&"BatchMode=yes".to_owned()));
    }

    #[test]
    fn scp_targets() {
        let v4 = SshShell::new(SshConfig::new("10.0.0.5", "lisa"));
        assert_eq!(v4.scp_target("/tmp/x"), "lisa@10.0.0.5:/tmp/x");
        let v6 = SshShell::new(SshConfig::new("fe80::1", "lisa"));
        assert_eq!(v6.scp_target("x"), "lisa@[fe80::1]:x");
    }

    #[test]
    fn sudo_wrap_quotes_the_command() {
        assert_eq!(
            sudo_wrap("echo 'hi' > /tmp/x"),
            r#"sudo -n bash -c 'echo '\''hi'\'' > /tmp/x'"#
        );
    }

    #[test]
    fn connection_failures_are_recognized() {
        assert!(is_connection_failure(
            "ssh: connect to host 10.0.0.5 port 22: Connection refused\n"
        ));
        assert!(!is_connection_failure("bash: foo: command not found"));
    }

    #[test]
    fn auth_failures_are_terminal() {
        let err = classify_transport_failure(
            "10.0.0.5",
            "lisa@10.0.0.5: Permission denied (publickey,password).\n",
        )
        .unwrap();
        assert!(matches!(&err, RemoteError::Auth { host, .. } if host == "10.0.0.5"));
        assert!(!err.is_transient());

        let err = classify_transport_failure("vm", "Host key verification failed.\n").unwrap();
        assert!(!err.is_transient());

        let err = classify_transport_failure(
            "vm",
            "ssh: connect to host vm port 22: Connection timed out\n",
        )
        .unwrap();
        assert!(matches!(err, RemoteError::Connect { .. }));
        assert!(err.is_transient());

        assert!(classify_transport_failure("vm", "exit 255 from the script").is_none());
    }

    #[test]
    fn config_defaults_from_yaml() {
        let config: SshConfig = serde_yaml::from_str("host: vm\nuser: root\n").unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.connect_timeout_secs, 10);
        assert!(config.identity_file.is_none());
    }
}
