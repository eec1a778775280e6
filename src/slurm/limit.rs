use log::info;

use crate::error::Result;
use crate::remote::RemoteShell;

/// Whether `user` may submit another job with at most `task_max` in the queue
///
/// `task_max <= 0` turns the limit off. This is a point-in-time check, another submitter can
/// still race past it.
pub fn check_sub_limit<S: RemoteShell>(shell: &S, task_max: i64, user: &str) -> Result<bool> {
    if task_max <= 0 {
        return Ok(true);
    }
    let output = shell.block_checkcall(&format!("squeue -u {user} -h"))?;
    let queued = output.stdout.lines().filter(|l| !l.trim().is_empty()).count();
    info!("{user} has {queued} jobs queued, limit is {task_max}");
    Ok((queued as i64) < task_max)
}
