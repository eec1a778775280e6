//! Slurm job scripts from declarative job descriptions, and job status that survives the
//! scheduler forgetting about a job.

pub mod error;
/// Job directories, commands and their arguments
pub mod request;
/// Resource requests with defaults filled in
pub mod resources;
pub mod remote;
/// Marker files the job script leaves behind
pub mod sentinel;
pub mod slurm;

pub use error::{DispatchError, Result};
pub use request::JobDescription;
pub use resources::ResourceSpec;
