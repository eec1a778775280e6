//! Job descriptions handed over by the orchestrator
//!
//! A job is a list of working directories, a list of commands, and an `args` grid giving the
//! argument string for every (command, directory) pair.

use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobDescription {
    pub job_dirs: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub cmd: Vec<String>,
    /// `args[command][directory]`, empty strings when absent
    #[serde(default)]
    pub args: Option<Vec<Vec<String>>>,
}

impl JobDescription {
    pub fn new(job_dirs: Vec<String>, cmd: Vec<String>) -> JobDescription {
        JobDescription { job_dirs, cmd, args: None }
    }

    pub fn with_args(mut self, args: Vec<Vec<String>>) -> JobDescription {
        self.args = Some(args);
        self
    }

    pub fn read(path: &Path) -> Result<JobDescription> {
        info!("Reading job description at {}", path.display());
        let json = fs::read_to_string(path).map_err(|err| {
            warn!("Can't read job description at path {}: {}", path.display(), err);
            DispatchError::Io(err)
        })?;
        let job: JobDescription = serde_json::from_str(&json)?;
        Ok(job)
    }

    /// Argument for command `cmd_idx` in directory `dir_idx`
    pub fn arg(&self, cmd_idx: usize, dir_idx: usize) -> &str {
        self.args
            .as_ref()
            .and_then(|rows| rows.get(cmd_idx))
            .and_then(|row| row.get(dir_idx))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// `args`, when given, must be `len(cmd) x len(job_dirs)`
    pub fn validate(&self) -> Result<()> {
        let Some(rows) = &self.args else {
            return Ok(());
        };
        if rows.len() != self.cmd.len() {
            return Err(DispatchError::InvalidJob(format!(
                "{} argument rows for {} commands",
                rows.len(),
                self.cmd.len()
            )));
        }
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != self.job_dirs.len() {
                return Err(DispatchError::InvalidJob(format!(
                    "command {idx} has {} arguments for {} job directories",
                    row.len(),
                    self.job_dirs.len()
                )));
            }
        }
        Ok(())
    }
}

/// A single command may be given as a bare string
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(cmd) => vec![cmd],
        OneOrMany::Many(cmds) => cmds,
    })
}
