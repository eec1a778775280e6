use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use slurmbatch::remote::LocalShell;
use slurmbatch::sentinel::LocalMarkers;
use slurmbatch::slurm::{check_sub_limit, submit, PollPolicy, ScriptBuilder, StatusPoller};
use slurmbatch::{JobDescription, ResourceSpec};

#[derive(Parser)]
#[command(version, about = "Render, submit and follow Slurm batch jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print (or write) the sbatch script for a job
    Render {
        #[command(flatten)]
        script: ScriptArgs,
        /// Write the script here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write job.sh into the remote root and submit it
    Submit {
        #[command(flatten)]
        script: ScriptArgs,
        /// Refuse to submit while this many jobs are queued, 0 disables the check
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        task_max: i64,
        #[arg(long, env = "USER")]
        user: String,
    },
    /// Print the canonical status of a submitted job
    Status {
        /// Slurm job id, leave out for a job that never got one
        #[arg(long)]
        job_id: Option<String>,
        #[arg(long)]
        remote_root: PathBuf,
        /// Wait between checks while the job is completing
        #[arg(long, default_value_t = 5)]
        delay_secs: u64,
        /// Stop waiting on a completing job after this many checks
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Check whether another job may be queued
    Limit {
        #[arg(long, allow_negative_numbers = true)]
        task_max: i64,
        #[arg(long, env = "USER")]
        user: String,
    },
}

#[derive(Args)]
struct ScriptArgs {
    /// JSON job description: job_dirs, cmd, args
    #[arg(long)]
    job: PathBuf,
    /// JSON resources, anything left out gets its default
    #[arg(long)]
    resources: Option<PathBuf>,
    /// Directory the job directories are relative to
    #[arg(long)]
    remote_root: PathBuf,
    #[arg(long, default_value = "log")]
    outlog: String,
    #[arg(long, default_value = "err")]
    errlog: String,
}

impl ScriptArgs {
    fn render(&self) -> Result<String> {
        let job = JobDescription::read(&self.job)
            .with_context(|| format!("Can't load job description {}", self.job.display()))?;
        job.validate()?;
        let res = read_resources(self.resources.as_deref())?;

        let script = ScriptBuilder::new(self.remote_root.display().to_string())
            .outlog(&self.outlog)
            .errlog(&self.errlog)
            .sub_script(&job, &res)?;
        Ok(script)
    }
}

fn read_resources(path: Option<&Path>) -> Result<ResourceSpec> {
    let res = match path {
        Some(path) => {
            info!("Reading resources at {}", path.display());
            let json = fs::read_to_string(path)
                .with_context(|| format!("Can't read resources {}", path.display()))?;
            ResourceSpec::from_json(&json)?
        }
        None => ResourceSpec::from_value(None)?,
    };
    res.validate()?;
    Ok(res)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Render { script, out } => {
            let text = script.render()?;
            match out {
                Some(path) => {
                    info!("Writing job script to {}", path.display());
                    fs::write(&path, text).with_context(|| format!("Can't write {}", path.display()))?;
                }
                None => print!("{text}"),
            }
        }
        Commands::Submit { script, task_max, user } => {
            let text = script.render()?;
            let shell = LocalShell::new(&script.remote_root);
            if !check_sub_limit(&shell, task_max, &user)? {
                bail!("{user} already has {task_max} or more jobs queued");
            }
            let job_id = submit(&shell, &text)?;
            println!("{job_id}");
        }
        Commands::Status { job_id, remote_root, delay_secs, max_attempts } => {
            let shell = LocalShell::new(remote_root);
            let policy = PollPolicy {
                delay: Duration::from_secs(delay_secs),
                max_attempts,
                ..PollPolicy::default()
            };
            let status = StatusPoller::new(&shell, &LocalMarkers)
                .with_policy(policy)
                .check_status(job_id.as_deref())?;
            println!("{status}");
        }
        Commands::Limit { task_max, user } => {
            let shell = LocalShell::new(".");
            let allowed = check_sub_limit(&shell, task_max, &user)?;
            println!("{allowed}");
        }
    }

    Ok(())
}
