//! OpenSSH-backed switch sessions.
//!
//! Each [`SshSession`] is one OpenSSH ControlMaster process holding a single
//! authenticated connection, with a control socket in a private temporary
//! directory. Commands are multiplexed over that socket, so the switch sees one
//! login per reconciliation no matter how many commands it runs.
//!
//! Password authentication goes through `sshpass -e` (the password travels in
//! the environment, never on the command line). Without a password the master
//! runs in `BatchMode` and relies on the identity file or agent.
//!
//! The master is spawned with `kill_on_drop`, and the socket directory is
//! removed when the session drops, so an aborted run cannot leak either.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::cli::{self, CliDialect};
use super::{DeviceError, DeviceOperation, SwitchConnector, SwitchSession};
use crate::types::{InterfaceName, VlanId};

const SSH_PROGRAM: &str = "ssh";
const SSHPASS_PROGRAM: &str = "sshpass";

/// Exit status ssh uses for its own failures (as opposed to the remote command's).
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Interval between control-socket readiness checks while opening.
const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where and how to log in.
#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// Options shared by the master and every multiplexed client.
    fn common_args(&self, socket: &Path) -> Vec<String> {
        vec![
            "-S".to_string(),
            socket.display().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ]
    }

    /// A client command multiplexed over the master at `socket`.
    fn client_command(&self, socket: &Path) -> Command {
        let mut cmd = Command::new(SSH_PROGRAM);
        cmd.args(self.common_args(socket));
        cmd.args(["-o", "BatchMode=yes"]);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Builds the ControlMaster command for `socket`.
    fn master_command(&self, socket: &Path) -> Command {
        let mut cmd = match &self.password {
            Some(password) => {
                let mut cmd = Command::new(SSHPASS_PROGRAM);
                cmd.env("SSHPASS", password);
                cmd.arg("-e").arg(SSH_PROGRAM);
                cmd
            }
            None => Command::new(SSH_PROGRAM),
        };

        cmd.args(["-M", "-N", "-o", "ControlPersist=no", "-o", "ServerAliveInterval=10"]);
        cmd.args(self.common_args(socket));
        if self.password.is_some() {
            cmd.args([
                "-o",
                "PreferredAuthentications=password,keyboard-interactive",
                "-o",
                "NumberOfPasswordPrompts=1",
            ]);
        } else {
            cmd.args(["-o", "BatchMode=yes"]);
        }
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(self.destination());

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Whether the master behind `socket` is up and authenticated.
    async fn control_check(&self, socket: &Path) -> bool {
        let mut cmd = self.client_command(socket);
        cmd.args(["-O", "check"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        matches!(cmd.status().await, Ok(status) if status.success())
    }
}

impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Classifies why the master exited before the socket came up.
fn classify_master_failure(stderr: &str) -> DeviceError {
    let detail = stderr.trim();
    let detail = if detail.is_empty() {
        "ssh exited before the connection was established"
    } else {
        detail
    };

    let auth_markers = [
        "Permission denied",
        "Authentication failed",
        "Host key verification failed",
        "Too many authentication failures",
    ];
    if auth_markers.iter().any(|m| detail.contains(m)) {
        DeviceError::authentication(DeviceOperation::Open, detail)
    } else {
        DeviceError::connection(DeviceOperation::Open, detail)
    }
}

/// Opens [`SshSession`]s to one switch.
#[derive(Debug, Clone)]
pub struct SshConnector {
    target: Arc<SshTarget>,
    dialect: CliDialect,
}

impl SshConnector {
    pub fn new(target: SshTarget, dialect: CliDialect) -> Self {
        SshConnector {
            target: Arc::new(target),
            dialect,
        }
    }
}

impl SwitchConnector for SshConnector {
    type Session = SshSession;

    async fn open(&self) -> Result<SshSession, DeviceError> {
        let control_dir = tempfile::Builder::new()
            .prefix("switchport-ssh-")
            .tempdir()
            .map_err(|e| {
                DeviceError::connection(
                    DeviceOperation::Open,
                    format!("cannot create control socket directory: {}", e),
                )
            })?;
        let socket = control_dir.path().join("control");

        let mut master = self.target.master_command(&socket).spawn().map_err(|e| {
            DeviceError::connection(DeviceOperation::Open, format!("cannot spawn ssh: {}", e))
        })?;

        // Bounded by the caller's operation timeout; dropping `master` kills it.
        loop {
            match master.try_wait() {
                Ok(Some(_)) => {
                    let output = master.wait_with_output().await.map_err(|e| {
                        DeviceError::connection(DeviceOperation::Open, e.to_string())
                    })?;
                    return Err(classify_master_failure(&String::from_utf8_lossy(
                        &output.stderr,
                    )));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(DeviceError::connection(DeviceOperation::Open, e.to_string()));
                }
            }

            if self.target.control_check(&socket).await {
                break;
            }
            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }

        info!(host = %self.target.host, port = self.target.port, "Connected to switch");
        Ok(SshSession {
            target: Arc::clone(&self.target),
            dialect: self.dialect.clone(),
            socket,
            master: Mutex::new(master),
            _control_dir: control_dir,
        })
    }
}

/// One multiplexed SSH connection to the switch.
pub struct SshSession {
    target: Arc<SshTarget>,
    dialect: CliDialect,
    socket: PathBuf,
    master: Mutex<Child>,
    // Removed on drop, after the master is gone.
    _control_dir: TempDir,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.target.host)
            .field("socket", &self.socket)
            .finish()
    }
}

impl SshSession {
    /// Runs one exec-mode command and returns its stdout.
    async fn exec(&self, operation: DeviceOperation, command: &str) -> Result<String, DeviceError> {
        debug!(%operation, command, "Running switch command");
        let output = self
            .target
            .client_command(&self.socket)
            .arg(self.target.destination())
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeviceError::connection(operation, e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.code() == Some(SSH_TRANSPORT_FAILURE) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeviceError::connection(operation, stderr.trim().to_string()));
        }
        Ok(stdout)
    }

    /// Feeds a configuration script to the switch CLI and checks the reply.
    async fn run_script(
        &self,
        operation: DeviceOperation,
        script: Vec<String>,
    ) -> Result<(), DeviceError> {
        debug!(%operation, lines = script.len(), "Sending configuration script");
        let mut child = self
            .target
            .client_command(&self.socket)
            .arg("-T")
            .arg(self.target.destination())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DeviceError::connection(operation, e.to_string()))?;

        let mut input = script.join("\n");
        input.push_str("\nexit\n");
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| DeviceError::connection(operation, e.to_string()))?;
            // Closing stdin ends the CLI session once the script has run.
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DeviceError::connection(operation, e.to_string()))?;

        if output.status.code() == Some(SSH_TRANSPORT_FAILURE) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeviceError::connection(operation, stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match cli::find_error(&stdout) {
            Some(line) => Err(DeviceError::command(operation, line)),
            None => Ok(()),
        }
    }
}

impl SwitchSession for SshSession {
    async fn vlan_exists(&self, vlan: VlanId) -> Result<bool, DeviceError> {
        let op = DeviceOperation::VlanExists;
        let output = self.exec(op, &self.dialect.show_vlan(vlan)).await?;
        cli::parse_vlan_exists(&output, vlan).map_err(|msg| DeviceError::command(op, msg))
    }

    async fn create_vlan(&self, vlan: VlanId, name: &str) -> Result<(), DeviceError> {
        self.run_script(
            DeviceOperation::CreateVlan,
            self.dialect.create_vlan_script(vlan, name),
        )
        .await
    }

    async fn set_interface_vlan(
        &self,
        interface: &InterfaceName,
        vlan: VlanId,
    ) -> Result<(), DeviceError> {
        self.run_script(
            DeviceOperation::SetInterfaceVlan,
            self.dialect.set_interface_vlan_script(interface, vlan),
        )
        .await
    }

    async fn set_interface_admin_up(&self, interface: &InterfaceName) -> Result<(), DeviceError> {
        self.run_script(
            DeviceOperation::SetInterfaceAdminUp,
            self.dialect.set_interface_admin_up_script(interface),
        )
        .await
    }

    async fn read_interface_vlan(&self, interface: &InterfaceName) -> Result<VlanId, DeviceError> {
        let op = DeviceOperation::ReadInterfaceVlan;
        let output = self.exec(op, &self.dialect.show_switchport(interface)).await?;
        cli::parse_access_vlan(&output).map_err(|msg| DeviceError::command(op, msg))
    }

    async fn close(self) {
        let exited = self
            .target
            .client_command(&self.socket)
            .args(["-O", "exit"])
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success());

        let mut master = self.master.into_inner().unwrap_or_else(|e| e.into_inner());
        if !exited {
            warn!(host = %self.target.host, "ssh master did not exit cleanly, killing it");
            if let Err(e) = master.kill().await {
                warn!(error = %e, "Failed to kill ssh master");
            }
        } else if let Err(e) = master.wait().await {
            warn!(error = %e, "Failed to reap ssh master");
        }
        debug!(host = %self.target.host, "Disconnected from switch");
    }
}
