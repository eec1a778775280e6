use log::info;

use crate::error::{DispatchError, Result};
use crate::remote::RemoteShell;

/// Name the job script is written under in the remote root
pub const SCRIPT_NAME: &str = "job.sh";

/// Write `script` to the remote root and hand it to sbatch, returning the slurm job id
pub fn submit<S: RemoteShell>(shell: &S, script: &str) -> Result<String> {
    let path = shell.upload(SCRIPT_NAME, script)?;
    info!("Running sbatch on {}", path.display());
    let output = shell.block_checkcall(&format!("sbatch --parsable {SCRIPT_NAME}"))?;
    let job_id = parse_job_id(&output.stdout)?;
    info!("SLURM job id: {job_id}");
    Ok(job_id)
}

/// `sbatch --parsable` prints `jobid[;cluster]`
pub fn parse_job_id(stdout: &str) -> Result<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.split(';').next())
        .map(str::trim)
        .filter(|id| !id.is_empty() && !id.contains(char::is_whitespace))
        .map(str::to_string)
        .ok_or_else(|| DispatchError::Submission(stdout.to_string()))
}
