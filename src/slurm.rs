//! Render Slurm job scripts, submit them, and follow the jobs through squeue

/// Turn a job description and its resources into an sbatch script
pub mod script;

/// Map squeue state codes onto canonical job states
pub mod status;

/// Queue occupancy check before submitting more work
pub mod limit;

/// Hand rendered scripts to sbatch
pub mod submit;

pub use limit::check_sub_limit;
pub use script::ScriptBuilder;
pub use status::{JobStatus, PollPolicy, StatusPoller};
pub use submit::submit;
