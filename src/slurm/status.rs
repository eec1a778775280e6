use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{DispatchError, Result};
use crate::remote::RemoteShell;
use crate::sentinel::MarkerStore;

/// squeue's complaint about a job id it no longer tracks
pub const INVALID_JOB_ID: &str = "Invalid job id specified";

/// Canonical job status, recomputed on every poll
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Running,
    /// Transient, `check_status` never returns it
    Completing,
    Finished,
    Terminated,
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Terminated)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completing => write!(f, "completing"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Terminated => write!(f, "terminated"),
            JobStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// What a squeue state code says on its own, before the markers are consulted
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlurmState {
    Waiting,
    Running,
    Completing,
    /// The job is gone one way or another; only `tag_finished` tells success from failure
    Ended,
    Other,
}

pub fn classify(code: &str) -> SlurmState {
    match code {
        "PD" | "CF" | "S" => SlurmState::Waiting,
        "R" => SlurmState::Running,
        "CG" => SlurmState::Completing,
        "C" | "E" | "K" | "BF" | "CA" | "CD" | "F" | "NF" | "PR" | "SE" | "ST" | "TO" => SlurmState::Ended,
        _ => SlurmState::Other,
    }
}

/// State code from `squeue --job` output
///
/// Only the last non-blank job line counts. The code is read from the `ST` column, located in the
/// header row when squeue prints one. Columns are counted from the left since
/// `NODELIST(REASON)` can contain spaces.
pub fn status_code(stdout: &str) -> Option<&str> {
    let is_header = |line: &str| line.split_whitespace().next() == Some("JOBID");
    let column = stdout
        .lines()
        .find(|l| is_header(l))
        .and_then(|header| header.split_whitespace().position(|field| field == "ST"))
        .unwrap_or(DEFAULT_STATE_COLUMN);

    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty() && !is_header(l))?;
    line.split_whitespace().nth(column)
}

/// `ST` position in the default `JOBID PARTITION NAME USER ST TIME NODES NODELIST(REASON)` layout
const DEFAULT_STATE_COLUMN: usize = 4;

/// How long to keep re-polling a job that sits in `completing`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub delay: Duration,
    /// Each wait is the previous one times this factor, 1 keeps the delay fixed
    pub backoff: u32,
    pub max_delay: Duration,
    /// Queries allowed to come back `completing` before giving up with `unknown`.
    /// `None` polls until the job leaves the state.
    pub max_attempts: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            delay: Duration::from_secs(5),
            backoff: 1,
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl PollPolicy {
    /// Wait before the query following attempt `attempt` (0 based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1).saturating_pow(attempt);
        self.delay.saturating_mul(factor).min(self.max_delay.max(self.delay))
    }
}

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<T: Sleeper + ?Sized> Sleeper for &T {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Asks Slurm about a job and settles its canonical status
///
/// Polls block the calling thread. Nothing here takes a lock, callers shouldn't poll the same job
/// from two threads at once.
pub struct StatusPoller<'a, S, M, Z = ThreadSleeper> {
    shell: &'a S,
    markers: &'a M,
    policy: PollPolicy,
    sleeper: Z,
}

impl<'a, S: RemoteShell, M: MarkerStore> StatusPoller<'a, S, M> {
    pub fn new(shell: &'a S, markers: &'a M) -> Self {
        StatusPoller {
            shell,
            markers,
            policy: PollPolicy::default(),
            sleeper: ThreadSleeper,
        }
    }
}

impl<'a, S: RemoteShell, M: MarkerStore, Z: Sleeper> StatusPoller<'a, S, M, Z> {
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper<Y: Sleeper>(self, sleeper: Y) -> StatusPoller<'a, S, M, Y> {
        StatusPoller {
            shell: self.shell,
            markers: self.markers,
            policy: self.policy,
            sleeper,
        }
    }

    /// Current status of `job_id`, never `completing`
    ///
    /// A missing (or empty) job id means the job was never submitted, so it's `terminated`.
    /// Query failures other than an unknown job id are returned as errors.
    pub fn check_status(&self, job_id: Option<&str>) -> Result<JobStatus> {
        let Some(job_id) = job_id.map(str::trim).filter(|id| !id.is_empty()) else {
            info!("No job id on record, treating job as terminated");
            return Ok(JobStatus::Terminated);
        };

        let mut attempt = 0;
        loop {
            let status = self.check_status_inner(job_id)?;
            if status != JobStatus::Completing {
                return Ok(status);
            }

            attempt += 1;
            if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                warn!("Job {job_id} still completing after {attempt} checks, giving up");
                return Ok(JobStatus::Unknown);
            }
            let wait = self.policy.delay_for(attempt - 1);
            info!("Job {job_id} is completing, checking again in {wait:?}");
            self.sleeper.sleep(wait);
        }
    }

    fn check_status_inner(&self, job_id: &str) -> Result<JobStatus> {
        let cmd = format!("squeue --job {job_id}");
        debug!("Running {cmd}");
        let output = self.shell.block_call(&cmd)?;

        if !output.success() {
            if output.stderr.contains(INVALID_JOB_ID) {
                info!("Job {job_id} is no longer known to slurm, checking finish tag");
                return self.resolve_ended();
            }
            return Err(DispatchError::command_failed(cmd, output.code, output.stderr));
        }

        let Some(code) = status_code(&output.stdout) else {
            warn!("Can't find a state code for job {job_id} in squeue output {:?}", output.stdout);
            return Ok(JobStatus::Unknown);
        };
        debug!("Job {job_id} has slurm state {code}");

        Ok(match classify(code) {
            SlurmState::Waiting => JobStatus::Waiting,
            SlurmState::Running => JobStatus::Running,
            SlurmState::Completing => JobStatus::Completing,
            SlurmState::Ended => self.resolve_ended()?,
            SlurmState::Other => {
                warn!("Unrecognised slurm state {code} for job {job_id}");
                JobStatus::Unknown
            }
        })
    }

    /// A storage error is returned rather than read as "no marker"
    fn resolve_ended(&self) -> Result<JobStatus> {
        Ok(if self.markers.job_finished(self.shell.remote_root())? {
            JobStatus::Finished
        } else {
            JobStatus::Terminated
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io;
    use std::path::Path;

    use super::*;
    use crate::remote::fake::FakeShell;
    use crate::sentinel::finish_tag_path;

    const HEADER: &str = "             JOBID PARTITION     NAME     USER ST       TIME  NODES NODELIST(REASON)\n";

    fn squeue(code: &str) -> String {
        format!("{HEADER}            123456    normal   job.sh    alice {code}       0:42      1 node01\n")
    }

    struct Markers {
        finished: bool,
    }

    impl MarkerStore for Markers {
        fn exists(&self, path: &Path) -> io::Result<bool> {
            Ok(self.finished && path == finish_tag_path(Path::new("/remote")))
        }
    }

    /// Shared storage that can't be read
    struct BrokenMarkers;

    impl MarkerStore for BrokenMarkers {
        fn exists(&self, _path: &Path) -> io::Result<bool> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "stale file handle"))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        waits: RefCell<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.waits.borrow_mut().push(duration);
        }
    }

    fn status_for(code: &str, finished: bool) -> JobStatus {
        let shell = FakeShell::new("/remote").reply(0, &squeue(code), "");
        let markers = Markers { finished };
        StatusPoller::new(&shell, &markers)
            .with_sleeper(RecordingSleeper::default())
            .check_status(Some("123456"))
            .unwrap()
    }

    #[test]
    fn test_status_code_parsing() {
        assert_eq!(status_code(&squeue("PD")), Some("PD"));
        assert_eq!(status_code(&format!("{}\n\n  \n", squeue("R"))), Some("R"));
        assert_eq!(status_code(""), None);
        assert_eq!(status_code("a b c"), None);
        assert_eq!(status_code(HEADER), None);
        assert_eq!(status_code(&format!("{HEADER}\n")), None);
    }

    #[test]
    fn test_status_code_with_spaces_in_reason() {
        let pending = format!(
            "{HEADER}            123456    normal   job.sh    alice PD       0:00      2 (ReqNodeNotAvail, UnavailableNodes:n[01-02])\n"
        );
        assert_eq!(status_code(&pending), Some("PD"));

        let shell = FakeShell::new("/remote").reply(0, &pending, "");
        let markers = Markers { finished: false };
        let status = StatusPoller::new(&shell, &markers).check_status(Some("123456")).unwrap();
        assert_eq!(status, JobStatus::Waiting);
    }

    #[test]
    fn test_status_column_found_from_header() {
        let custom = "JOBID ST NAME\n  99 R my job\n";
        assert_eq!(status_code(custom), Some("R"));
        // no header: default column layout
        assert_eq!(status_code("  99 normal job.sh alice CG 1:00 1 node01\n"), Some("CG"));
    }

    #[test]
    fn test_unreadable_marker_is_an_error() {
        let shell = FakeShell::new("/remote").reply(0, &squeue("CD"), "");
        let err = StatusPoller::new(&shell, &BrokenMarkers).check_status(Some("5")).unwrap_err();
        assert!(matches!(err, DispatchError::Io(_)));

        let shell = FakeShell::new("/remote").reply(1, "", INVALID_JOB_ID);
        assert!(StatusPoller::new(&shell, &BrokenMarkers).check_status(Some("5")).is_err());
    }

    #[test]
    fn test_waiting_codes() {
        for code in ["PD", "CF", "S"] {
            assert_eq!(status_for(code, false), JobStatus::Waiting, "{code}");
        }
    }

    #[test]
    fn test_running_code() {
        assert_eq!(status_for("R", false), JobStatus::Running);
        assert_eq!(status_for("R", true), JobStatus::Running);
    }

    #[test]
    fn test_ended_codes_follow_finish_tag() {
        for code in ["C", "E", "K", "BF", "CA", "CD", "F", "NF", "PR", "SE", "ST", "TO"] {
            assert_eq!(status_for(code, true), JobStatus::Finished, "{code}");
            assert_eq!(status_for(code, false), JobStatus::Terminated, "{code}");
        }
    }

    #[test]
    fn test_unrecognised_code_is_unknown() {
        assert_eq!(status_for("XX", false), JobStatus::Unknown);
        assert_eq!(status_for("OOM", true), JobStatus::Unknown);
    }

    #[test]
    fn test_header_only_output_is_unknown() {
        let shell = FakeShell::new("/remote").reply(0, HEADER, "");
        let markers = Markers { finished: false };
        let status = StatusPoller::new(&shell, &markers).check_status(Some("1")).unwrap();
        assert_eq!(status, JobStatus::Unknown);
    }

    #[test]
    fn test_missing_job_id_is_terminated() {
        let shell = FakeShell::new("/remote");
        let markers = Markers { finished: true };
        let poller = StatusPoller::new(&shell, &markers);

        assert_eq!(poller.check_status(None).unwrap(), JobStatus::Terminated);
        assert_eq!(poller.check_status(Some("")).unwrap(), JobStatus::Terminated);
        assert_eq!(poller.check_status(Some("  ")).unwrap(), JobStatus::Terminated);
        assert!(shell.calls.borrow().is_empty());
    }

    #[test]
    fn test_invalid_job_id_follows_finish_tag() {
        let stderr = "slurm_load_jobs error: Invalid job id specified\n";
        for (finished, expected) in [(true, JobStatus::Finished), (false, JobStatus::Terminated)] {
            let shell = FakeShell::new("/remote").reply(1, "", stderr);
            let markers = Markers { finished };
            let status = StatusPoller::new(&shell, &markers).check_status(Some("42")).unwrap();
            assert_eq!(status, expected);
            assert_eq!(*shell.calls.borrow(), vec!["squeue --job 42"]);
        }
    }

    #[test]
    fn test_other_query_failure_is_an_error() {
        let shell = FakeShell::new("/remote").reply(1, "", "slurm_load_jobs error: Unable to contact slurm controller\n");
        let markers = Markers { finished: true };
        let err = StatusPoller::new(&shell, &markers).check_status(Some("42")).unwrap_err();

        match err {
            DispatchError::CommandFailed { command, code, stderr } => {
                assert_eq!(command, "squeue --job 42");
                assert_eq!(code, 1);
                assert!(stderr.contains("Unable to contact slurm controller"));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_completing_is_retried() {
        let shell = FakeShell::new("/remote")
            .reply(0, &squeue("CG"), "")
            .reply(0, &squeue("CG"), "")
            .reply(0, &squeue("R"), "");
        let markers = Markers { finished: false };
        let sleeper = RecordingSleeper::default();

        let status = StatusPoller::new(&shell, &markers)
            .with_sleeper(&sleeper)
            .check_status(Some("7"))
            .unwrap();

        assert_eq!(status, JobStatus::Running);
        assert_eq!(shell.calls.borrow().len(), 3);
        assert_eq!(*sleeper.waits.borrow(), vec![Duration::from_secs(5); 2]);
    }

    #[test]
    fn test_completing_then_gone() {
        let shell = FakeShell::new("/remote")
            .reply(0, &squeue("CG"), "")
            .reply(1, "", "Invalid job id specified");
        let markers = Markers { finished: true };

        let status = StatusPoller::new(&shell, &markers)
            .with_sleeper(RecordingSleeper::default())
            .check_status(Some("7"))
            .unwrap();
        assert_eq!(status, JobStatus::Finished);
    }

    #[test]
    fn test_completing_gives_up_after_max_attempts() {
        let shell = FakeShell::new("/remote")
            .reply(0, &squeue("CG"), "")
            .reply(0, &squeue("CG"), "")
            .reply(0, &squeue("CG"), "");
        let markers = Markers { finished: false };
        let sleeper = RecordingSleeper::default();
        let policy = PollPolicy {
            delay: Duration::from_secs(1),
            backoff: 2,
            max_delay: Duration::from_secs(60),
            max_attempts: Some(3),
        };

        let status = StatusPoller::new(&shell, &markers)
            .with_policy(policy)
            .with_sleeper(&sleeper)
            .check_status(Some("7"))
            .unwrap();

        assert_eq!(status, JobStatus::Unknown);
        assert_eq!(shell.calls.borrow().len(), 3);
        assert_eq!(*sleeper.waits.borrow(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = PollPolicy {
            delay: Duration::from_secs(5),
            backoff: 3,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(15));
        assert_eq!(policy.delay_for(2), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));

        let fixed = PollPolicy::default();
        assert_eq!(fixed.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Terminated.is_terminal());
        assert!(!JobStatus::Unknown.is_terminal());
        assert_eq!(JobStatus::Waiting.to_string(), "waiting");
    }
}
