use std::fmt;

use serde::Serialize;
use tinytemplate::TinyTemplate;

use crate::error::Result;
use crate::request::JobDescription;
use crate::resources::ResourceSpec;
use crate::sentinel::{command_tag, FINISH_TAG};

/// Parallel launcher prefixed to commands when `with_mpi` is set
pub const MPI_LAUNCHER: &str = "srun";

/// Recovery wrapper used when `cvasp` is set, relative to the job directory
pub const CVASP_WRAPPER: &str = "python ../cvasp.py";

/// One `#SBATCH` option
///
/// The order `directives()` returns them in is the order they're written, some sites read
/// options positionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Nodes(u32),
    TasksPerNode(u32),
    CpusPerTask(u32),
    Time(String),
    MemGb(i64),
    Account(String),
    Partition(String),
    Qos(String),
    Gpus(u32),
    Constraint(String),
    License(String),
    Exclude(Vec<String>),
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Directive::Nodes(n) => write!(f, "#SBATCH -N {n}"),
            Directive::TasksPerNode(n) => write!(f, "#SBATCH --ntasks-per-node {n}"),
            Directive::CpusPerTask(n) => write!(f, "#SBATCH --cpus-per-task {n}"),
            Directive::Time(t) => write!(f, "#SBATCH -t {t}"),
            Directive::MemGb(gb) => write!(f, "#SBATCH --mem {gb}G"),
            Directive::Account(a) => write!(f, "#SBATCH --account {a}"),
            Directive::Partition(p) => write!(f, "#SBATCH --partition {p}"),
            Directive::Qos(q) => write!(f, "#SBATCH --qos {q}"),
            Directive::Gpus(n) => write!(f, "#SBATCH --gres=gpu:{n}"),
            Directive::Constraint(c) => write!(f, "#SBATCH -C {c}"),
            Directive::License(l) => write!(f, "#SBATCH -L {l}"),
            Directive::Exclude(nodes) => write!(f, "#SBATCH --exclude {}", nodes.join(",")),
        }
    }
}

/// A single line of the script header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Shebang,
    Directive(Directive),
    ModuleUnload(String),
    ModuleLoad(String),
    Source(String),
    Export(String, String),
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Line::Shebang => write!(f, "#!/bin/bash -l"),
            Line::Directive(d) => write!(f, "{d}"),
            Line::ModuleUnload(m) => write!(f, "module unload {m}"),
            Line::ModuleLoad(m) => write!(f, "module load {m}"),
            Line::Source(s) => write!(f, "source {s}"),
            Line::Export(k, v) => write!(f, "export {k}={v}"),
        }
    }
}

/// Scheduler options for `res`, leaving out everything that is unset
pub fn directives(res: &ResourceSpec) -> Vec<Directive> {
    let mut out = vec![Directive::Nodes(res.numb_node), Directive::TasksPerNode(res.task_per_node)];
    if res.cpus_per_task > 0 {
        out.push(Directive::CpusPerTask(res.cpus_per_task));
    }
    out.push(Directive::Time(res.time_limit.clone()));
    if res.mem_limit > 0 {
        out.push(Directive::MemGb(res.mem_limit));
    }
    if !res.account.is_empty() {
        out.push(Directive::Account(res.account.clone()));
    }
    if !res.partition.is_empty() {
        out.push(Directive::Partition(res.partition.clone()));
    }
    if !res.qos.is_empty() {
        out.push(Directive::Qos(res.qos.clone()));
    }
    if res.numb_gpu > 0 {
        out.push(Directive::Gpus(res.numb_gpu));
    }
    out.extend(res.constraint_list.iter().cloned().map(Directive::Constraint));
    out.extend(res.license_list.iter().cloned().map(Directive::License));
    if !res.exclude_list.is_empty() {
        out.push(Directive::Exclude(res.exclude_list.clone()));
    }
    out
}

/// Header lines grouped into blank-line separated sections. Empty sections are dropped.
pub fn header(res: &ResourceSpec) -> Vec<Vec<Line>> {
    let mut batch = vec![Line::Shebang];
    batch.extend(directives(res).into_iter().map(Line::Directive));

    let modules: Vec<Line> = res
        .module_unload_list
        .iter()
        .cloned()
        .map(Line::ModuleUnload)
        .chain(res.module_list.iter().cloned().map(Line::ModuleLoad))
        .collect();
    let sources: Vec<Line> = res.source_list.iter().cloned().map(Line::Source).collect();
    let exports: Vec<Line> = res
        .envs
        .iter()
        .flatten()
        .map(|(k, v)| Line::Export(k.clone(), v.clone()))
        .collect();

    [batch, modules, sources, exports]
        .into_iter()
        .filter(|section: &Vec<Line>| !section.is_empty())
        .collect()
}

/// The shell line that runs `cmd` with `arg`, output sent to `outlog` / `errlog`
///
/// Any redirection already in `cmd` is cut off at the first `1>`.
pub fn command_line(res: &ResourceSpec, cmd: &str, arg: &str, outlog: &str, errlog: &str) -> String {
    let exe = cmd.split_once("1>").map_or(cmd, |(head, _)| head).trim();
    let launched = if res.with_mpi {
        format!("{MPI_LAUNCHER} {exe}")
    } else {
        exe.to_string()
    };
    let wrapped = if res.cvasp {
        format!("{CVASP_WRAPPER} \"{launched}\" {}", res.fp_max_errors)
    } else {
        launched
    };

    let mut parts = vec![wrapped];
    if !arg.is_empty() {
        parts.push(arg.to_string());
    }
    parts.push(format!("1> {outlog} 2> {errlog}"));
    parts.join(" ")
}

/// Rendering context for one guarded command block
#[derive(Serialize)]
struct CommandContext<'a> {
    dir: &'a str,
    tag: &'a str,
    command: &'a str,
    check_exit: bool,
    root: &'a str,
}

/// Renders sbatch scripts for a job
///
/// Rendering is pure: the same job and resources always give the same text, and nothing is
/// written anywhere.
#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    remote_root: String,
    outlog: String,
    errlog: String,
}

impl ScriptBuilder {
    pub fn new(remote_root: impl Into<String>) -> ScriptBuilder {
        ScriptBuilder {
            remote_root: remote_root.into(),
            outlog: "log".to_string(),
            errlog: "err".to_string(),
        }
    }

    pub fn outlog(mut self, name: impl Into<String>) -> ScriptBuilder {
        self.outlog = name.into();
        self
    }

    pub fn errlog(mut self, name: impl Into<String>) -> ScriptBuilder {
        self.errlog = name.into();
        self
    }

    pub fn sub_script(&self, job: &JobDescription, res: &ResourceSpec) -> Result<String> {
        /// included command block template
        static COMMAND: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/templates/command.txt"));
        let mut tt = TinyTemplate::new();
        // shell text, not HTML
        tt.set_default_formatter(&tinytemplate::format_unescaped);
        tt.add_template("command", COMMAND)?;

        let mut script = String::new();
        for section in header(res) {
            for line in section {
                script.push_str(&line.to_string());
                script.push('\n');
            }
            script.push('\n');
        }

        for (idx, cmd) in job.cmd.iter().enumerate() {
            let tag = command_tag(idx);
            for (dir_idx, dir) in job.job_dirs.iter().enumerate() {
                let command = command_line(res, cmd, job.arg(idx, dir_idx), &self.outlog, &self.errlog);
                let context = CommandContext {
                    dir,
                    tag: &tag,
                    command: &command,
                    check_exit: !res.allow_failure,
                    root: &self.remote_root,
                };
                script.push_str(&tt.render("command", &context)?);
            }
        }

        script.push_str(&format!("\ntouch {FINISH_TAG}\n"));
        Ok(script)
    }
}
