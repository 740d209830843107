//! SSH multiplexing.
//!
//! One ControlMaster connection per `(user, host)` pair, shared by every
//! remote command, scp, and tar stream of an operation. The control socket
//! lives under `/tmp` and the master is closed when the pool goes away.

use crate::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-command deadline for remote invocations.
pub const SSH_COMMAND_TIMEOUT: Duration = Duration::from_secs(180);

/// A multiplexed SSH connection to one `user@host`.
#[derive(Debug)]
pub struct SshSession {
    user: String,
    host: String,
    control_path: PathBuf,
}

impl SshSession {
    /// Open the master connection (no-op if one is already persisted).
    pub fn open(user: &str, host: &str) -> Result<Self> {
        let control_path =
            PathBuf::from(format!("/tmp/nel-ssh-{}-{}.sock", user, host.replace(':', "_")));
        let session = Self {
            user: user.to_string(),
            host: host.to_string(),
            control_path,
        };
        let status = Command::new("ssh")
            .args(session.control_args())
            .args(["-o", "ControlPersist=yes", "-fN", &session.target()])
            .stdin(Stdio::null())
            .status()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::SshUnavailable
                } else {
                    Error::Io(e)
                }
            })?;
        if !status.success() {
            return Err(Error::SshFailed(format!(
                "could not open master connection to {}",
                session.target()
            )));
        }
        debug!(target = %session.target(), "opened ssh master");
        Ok(session)
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn control_args(&self) -> [String; 4] {
        [
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ]
    }

    /// Run one remote command through the master, with a deadline.
    pub fn run(&self, command: &str) -> Result<String> {
        self.run_with_timeout(command, SSH_COMMAND_TIMEOUT)
    }

    pub fn run_with_timeout(&self, command: &str, timeout: Duration) -> Result<String> {
        let mut child = Command::new("ssh")
            .args(self.control_args())
            .arg(self.target())
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::SshUnavailable
                } else {
                    Error::Io(e)
                }
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait()? {
                Some(_) => break,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    return Err(Error::SshFailed(format!(
                        "remote command timed out after {}s: {}",
                        timeout.as_secs(),
                        command
                    )));
                }
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(Error::SshFailed(format!(
                "'{}' on {}: {}",
                command,
                self.target(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Copy one remote file to a local path over the master connection.
    pub fn scp_from(&self, remote_path: &str, local_path: &std::path::Path) -> Result<()> {
        let output = Command::new("scp")
            .args(self.control_args())
            .arg(format!("{}:{}", self.target(), remote_path))
            .arg(local_path)
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::SshFailed(format!(
                "scp {} failed: {}",
                remote_path,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Copy one local file to a remote path over the master connection.
    pub fn scp_to(&self, local_path: &std::path::Path, remote_path: &str) -> Result<()> {
        let output = Command::new("scp")
            .args(self.control_args())
            .arg(local_path)
            .arg(format!("{}:{}", self.target(), remote_path))
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::SshFailed(format!(
                "scp to {} failed: {}",
                remote_path,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Stream a remote directory as a compressed tar into `local_dest`,
    /// applying exclusion patterns server-side. One round trip, nested
    /// structure preserved.
    pub fn stream_tar(
        &self,
        remote_dir: &str,
        exclude_args: &[String],
        local_dest: &std::path::Path,
    ) -> Result<()> {
        std::fs::create_dir_all(local_dest)?;
        let (parent, leaf) = split_remote_dir(remote_dir);
        let remote_cmd = format!(
            "tar -czf - {} -C '{}' '{}'",
            exclude_args.join(" "),
            parent,
            leaf
        );

        let mut remote = Command::new("ssh")
            .args(self.control_args())
            .arg(self.target())
            .arg("--")
            .arg(&remote_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut local = Command::new("tar")
            .args(["-xzf", "-", "--strip-components=1", "-C"])
            .arg(local_dest)
            .stdin(Stdio::from(remote.stdout.take().expect("piped stdout")))
            .spawn()?;

        let local_status = local.wait()?;
        let remote_output = remote.wait_with_output()?;
        if !remote_output.status.success() {
            return Err(Error::SshFailed(format!(
                "remote tar of {} failed: {}",
                remote_dir,
                String::from_utf8_lossy(&remote_output.stderr).trim()
            )));
        }
        if !local_status.success() {
            return Err(Error::SshFailed(format!(
                "local tar extraction into {} failed",
                local_dest.display()
            )));
        }
        Ok(())
    }

    /// Tear down the master connection.
    pub fn close(&self) {
        let result = Command::new("ssh")
            .args(self.control_args())
            .args(["-O", "exit", &self.target()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            warn!(target = %self.target(), error = %e, "failed to close ssh master");
        }
    }
}

/// Split `/a/b/c` into (`/a/b`, `c`) for `tar -C`.
fn split_remote_dir(remote_dir: &str) -> (String, String) {
    let trimmed = remote_dir.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, leaf)) if !parent.is_empty() => (parent.to_string(), leaf.to_string()),
        _ => ("/".to_string(), trimmed.trim_start_matches('/').to_string()),
    }
}

/// Pool of SSH masters, one per `(user, host)` pair.
#[derive(Debug, Default)]
pub struct SshPool {
    sessions: HashMap<(String, String), SshSession>,
}

impl SshPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session for `(user, host)`, opening the master on first use.
    pub fn get_or_open(&mut self, user: &str, host: &str) -> Result<&SshSession> {
        let key = (user.to_string(), host.to_string());
        if !self.sessions.contains_key(&key) {
            let session = SshSession::open(user, host)?;
            self.sessions.insert(key.clone(), session);
        }
        Ok(&self.sessions[&key])
    }

    pub fn close_all(&mut self) {
        for session in self.sessions.values() {
            session.close();
        }
        self.sessions.clear();
    }
}

impl Drop for SshPool {
    fn drop(&mut self) {
        self.close_all();
    }
}
