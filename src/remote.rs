//! Blocking command execution where the scheduler lives
//!
//! Everything that talks to Slurm goes through `RemoteShell`, so the poller and limiter can be
//! driven by a fake in tests and by ssh-style transports elsewhere. `LocalShell` runs commands on
//! this machine, which is all a login node needs.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info};

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub trait RemoteShell {
    /// Run `cmd` in the remote root and wait for it, whatever the exit code
    fn block_call(&self, cmd: &str) -> Result<CommandOutput>;

    /// Directory the job directories are relative to
    fn remote_root(&self) -> &Path;

    /// Write `contents` to `name` inside the remote root
    fn upload(&self, name: &str, contents: &str) -> Result<PathBuf>;

    /// Like `block_call`, but a non-zero exit is an error
    fn block_checkcall(&self, cmd: &str) -> Result<CommandOutput> {
        let output = self.block_call(cmd)?;
        if output.success() {
            Ok(output)
        } else {
            Err(DispatchError::command_failed(cmd, output.code, output.stderr))
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalShell {
    remote_root: PathBuf,
}

impl LocalShell {
    pub fn new(remote_root: impl Into<PathBuf>) -> LocalShell {
        LocalShell { remote_root: remote_root.into() }
    }
}

impl RemoteShell for LocalShell {
    fn block_call(&self, cmd: &str) -> Result<CommandOutput> {
        let mut sh = Command::new("/bin/sh");
        let command = sh.arg("-c").arg(cmd).current_dir(&self.remote_root);
        debug!("{:?}", &command);
        let output = command.output()?;

        Ok(CommandOutput {
            // killed by a signal
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn remote_root(&self) -> &Path {
        &self.remote_root
    }

    fn upload(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.remote_root.join(name);
        info!("Writing {}", path.display());
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(contents.as_bytes())?;
        Ok(path)
    }
}
