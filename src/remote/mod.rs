//! Remote command execution and file transfer for one machine
//!
//! [`RemoteSession`] builds every operation (file reads and writes, copies,
//! removal, fact gathering) on a single primitive: run a shell command on
//! the node, optionally streaming bytes to its stdin. The [`Transport`] trait
//! is that primitive; [`ssh::SshTransport`] is the real one.

pub mod ssh;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, trace};

use crate::{Error, Result};

pub use ssh::SshTransport;

/// Bytes fed to a remote command's stdin
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stdin {
    /// In-memory payload
    Bytes(Vec<u8>),
    /// Local file streamed as-is
    File(PathBuf),
}

/// Result of one remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Exit status, `None` when the channel closed without reporting one
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    /// Exit status zero
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// stdout and stderr joined, trimmed, for diagnostics
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Runs shell commands on a remote machine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` through the remote shell
    async fn exec(&self, command: &str, stdin: Option<Stdin>) -> Result<CommandOutput>;

    /// Tell the remote end the session is over; errors are logged, not returned
    async fn close(&self);
}

/// Facts gathered from a node before bootstrapping it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemFacts {
    /// Online CPU count
    pub cpus: u32,
    /// Total memory in bytes
    pub memory_bytes: u64,
    /// Reported hostname
    pub hostname: String,
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// A command channel to one machine
#[derive(Clone)]
pub struct RemoteSession {
    host: String,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl RemoteSession {
    /// Wrap a transport for `host`
    pub fn new(host: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            host: host.into(),
            transport,
        }
    }

    /// End the session
    pub async fn close(&self) {
        debug!(host = %self.host, "closing session");
        self.transport.close().await;
    }

    /// Run a command and return its raw output, whatever the exit status
    pub async fn execute(&self, command: &str) -> Result<CommandOutput> {
        trace!(host = %self.host, command = %command, "exec");
        self.transport.exec(command, None).await
    }

    /// Run a command, failing on a non-zero exit; returns stdout
    pub async fn run(&self, command: &str) -> Result<String> {
        self.run_with_stdin(command, None).await
    }

    async fn run_with_stdin(&self, command: &str, stdin: Option<Stdin>) -> Result<String> {
        trace!(host = %self.host, command = %command, "run");
        let output = self.transport.exec(command, stdin).await?;
        if !output.success() {
            return Err(Error::RemoteCommand {
                host: self.host.clone(),
                command: command.to_string(),
                exit_status: output.exit_status,
                output: output.combined(),
            });
        }
        Ok(output.stdout)
    }

    /// True if anything exists at `path`
    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self
            .execute(&format!("test -e {}", shell_quote(path)))
            .await?
            .success())
    }

    /// True if `path` is a directory
    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self
            .execute(&format!("test -d {}", shell_quote(path)))
            .await?
            .success())
    }

    /// Read a remote file as text
    pub async fn read_file(&self, path: &str) -> Result<String> {
        self.run(&format!("cat {}", shell_quote(path))).await
    }

    /// Write `contents` to a remote file, creating its parent directory
    pub async fn write_file(&self, path: &str, contents: &[u8], overwrite: bool) -> Result<()> {
        self.guard_target(path, overwrite).await?;
        debug!(host = %self.host, path = %path, bytes = contents.len(), "writing remote file");
        self.run_with_stdin(
            &upload_command(path, None),
            Some(Stdin::Bytes(contents.to_vec())),
        )
        .await?;
        Ok(())
    }

    /// Copy a local file or directory tree to `remote`
    ///
    /// File permission bits are preserved. A directory is copied so that
    /// `remote` becomes the directory itself, not its parent.
    pub async fn copy(&self, local: &Path, remote: &str, overwrite: bool) -> Result<()> {
        let meta = tokio::fs::metadata(local).await?;
        if meta.is_dir() {
            self.copy_dir(local, remote, overwrite).await
        } else {
            if self.is_dir(remote).await? {
                return Err(Error::internal_with_context(
                    "copy",
                    format!(
                        "cannot copy file {} over directory {}:{}",
                        local.display(),
                        self.host,
                        remote
                    ),
                ));
            }
            self.guard_target(remote, overwrite).await?;
            self.upload_file(local, remote, file_mode(&meta)).await
        }
    }

    async fn copy_dir(&self, local: &Path, remote: &str, overwrite: bool) -> Result<()> {
        self.guard_target(remote, overwrite).await?;
        debug!(host = %self.host, local = %local.display(), remote = %remote, "copying directory");

        let mut pending = vec![(local.to_path_buf(), remote.to_string())];
        while let Some((local_dir, remote_dir)) = pending.pop() {
            self.run(&format!("mkdir -p {}", shell_quote(&remote_dir)))
                .await?;
            let mut entries = tokio::fs::read_dir(&local_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let remote_path = format!(
                    "{}/{}",
                    remote_dir.trim_end_matches('/'),
                    entry.file_name().to_string_lossy()
                );
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push((entry.path(), remote_path));
                } else {
                    self.upload_file(&entry.path(), &remote_path, file_mode(&meta))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str, mode: u32) -> Result<()> {
        debug!(host = %self.host, local = %local.display(), remote = %remote, "uploading file");
        self.run_with_stdin(
            &upload_command(remote, Some(mode)),
            Some(Stdin::File(local.to_path_buf())),
        )
        .await?;
        Ok(())
    }

    async fn guard_target(&self, path: &str, overwrite: bool) -> Result<()> {
        if !overwrite && self.exists(path).await? {
            return Err(Error::FileExists {
                host: self.host.clone(),
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a file or directory tree; missing paths are fine
    pub async fn remove(&self, path: &str) -> Result<()> {
        debug!(host = %self.host, path = %path, "removing remote path");
        self.run(&format!("rm -rf {}", shell_quote(path))).await?;
        Ok(())
    }

    /// Gather CPU count, memory and hostname
    pub async fn system_facts(&self) -> Result<SystemFacts> {
        let cpus = self.run("nproc").await?;
        let cpus = cpus.trim().parse().map_err(|e| {
            Error::internal_with_context("system_facts", format!("bad nproc output '{}': {}", cpus.trim(), e))
        })?;
        let meminfo = self.run("cat /proc/meminfo").await?;
        let memory_bytes = parse_mem_total(&meminfo).ok_or_else(|| {
            Error::internal_with_context("system_facts", "MemTotal missing from /proc/meminfo")
        })?;
        let hostname = self.run("hostname").await?.trim().to_string();
        Ok(SystemFacts {
            cpus,
            memory_bytes,
            hostname,
        })
    }
}

fn upload_command(path: &str, mode: Option<u32>) -> String {
    let parent = Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());
    let mut cmd = format!(
        "mkdir -p {} && cat > {}",
        shell_quote(&parent),
        shell_quote(path)
    );
    if let Some(mode) = mode {
        cmd.push_str(&format!(" && chmod {:o} {}", mode, shell_quote(path)));
    }
    cmd
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib * 1024)
    })
}
