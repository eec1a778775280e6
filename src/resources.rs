//! Resource requests and environment setup for a batch job
//!
//! A `ResourceSpec` is always total: JSON input only has to name the options it wants to change,
//! everything else is filled from the defaults below. Keys we don't recognise are kept in `extra`
//! so newer configuration files still load.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceSpec {
    pub numb_node: u32,
    pub task_per_node: u32,
    /// 0 disables the `--cpus-per-task` directive
    pub cpus_per_task: u32,
    pub numb_gpu: u32,
    /// Wall time, `H:MM:SS`
    pub time_limit: String,
    /// Memory in GB, anything <= 0 leaves the directive out
    pub mem_limit: i64,
    pub partition: String,
    pub account: String,
    pub qos: String,
    pub constraint_list: Vec<String>,
    pub license_list: Vec<String>,
    pub exclude_list: Vec<String>,
    pub module_unload_list: Vec<String>,
    pub module_list: Vec<String>,
    pub source_list: Vec<String>,
    /// Exported in the order given, later values may refer to earlier ones
    pub envs: Option<IndexMap<String, String>>,
    pub with_mpi: bool,
    /// Only meaningful for other batch systems, Slurm ignores it
    pub cuda_multi_tasks: bool,
    pub allow_failure: bool,
    /// Wrap every command in the cvasp recovery script
    pub cvasp: bool,
    /// Retry budget handed to the cvasp wrapper
    pub fp_max_errors: u32,
    /// Unrecognised options, passed through untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        ResourceSpec {
            numb_node: 1,
            task_per_node: 1,
            cpus_per_task: 1,
            numb_gpu: 0,
            time_limit: "1:0:0".to_string(),
            mem_limit: -1,
            partition: String::new(),
            account: String::new(),
            qos: String::new(),
            constraint_list: Vec::new(),
            license_list: Vec::new(),
            exclude_list: Vec::new(),
            module_unload_list: Vec::new(),
            module_list: Vec::new(),
            source_list: Vec::new(),
            envs: None,
            with_mpi: false,
            cuda_multi_tasks: false,
            allow_failure: false,
            cvasp: false,
            fp_max_errors: 3,
            extra: BTreeMap::new(),
        }
    }
}

impl ResourceSpec {
    pub fn builder() -> ResourceSpecBuilder {
        ResourceSpecBuilder::default()
    }

    /// Complete a possibly partial JSON mapping. `None` and `null` both give the defaults.
    ///
    /// Explicit values always win; the input is consumed, never patched in place.
    pub fn from_value(value: Option<Value>) -> Result<ResourceSpec> {
        let spec: ResourceSpec = match value {
            None | Some(Value::Null) => ResourceSpec::default(),
            Some(v) => serde_json::from_value(v)?,
        };
        for key in spec.extra.keys() {
            warn!("Unrecognised resource option {key}, passing it through");
        }
        Ok(spec)
    }

    pub fn from_json(json: &str) -> Result<ResourceSpec> {
        let value: Value = serde_json::from_str(json)?;
        ResourceSpec::from_value(Some(value))
    }

    pub fn validate(&self) -> Result<()> {
        if self.numb_node < 1 {
            return Err(DispatchError::InvalidResources("numb_node must be at least 1".to_string()));
        }
        if self.task_per_node < 1 {
            return Err(DispatchError::InvalidResources("task_per_node must be at least 1".to_string()));
        }
        if !is_wall_time(&self.time_limit) {
            return Err(DispatchError::InvalidResources(format!(
                "time_limit {:?} is not of the form H:MM:SS",
                self.time_limit
            )));
        }
        Ok(())
    }
}

/// Accepts `H:M:S` with an optional `D-` prefix, the way sbatch reads `-t`
fn is_wall_time(s: &str) -> bool {
    let hms = match s.split_once('-') {
        Some((days, rest)) if is_number(days) => rest,
        Some(_) => return false,
        None => s,
    };
    let parts: Vec<&str> = hms.split(':').collect();
    parts.len() == 3 && parts.iter().all(|p| is_number(p))
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Typed construction of a `ResourceSpec`, validated once in `build()`
#[derive(Debug, Default)]
pub struct ResourceSpecBuilder {
    spec: ResourceSpec,
}

impl ResourceSpecBuilder {
    pub fn numb_node(mut self, n: u32) -> Self {
        self.spec.numb_node = n;
        self
    }

    pub fn task_per_node(mut self, n: u32) -> Self {
        self.spec.task_per_node = n;
        self
    }

    pub fn cpus_per_task(mut self, n: u32) -> Self {
        self.spec.cpus_per_task = n;
        self
    }

    pub fn numb_gpu(mut self, n: u32) -> Self {
        self.spec.numb_gpu = n;
        self
    }

    pub fn time_limit(mut self, t: impl Into<String>) -> Self {
        self.spec.time_limit = t.into();
        self
    }

    pub fn mem_limit(mut self, gb: i64) -> Self {
        self.spec.mem_limit = gb;
        self
    }

    pub fn partition(mut self, p: impl Into<String>) -> Self {
        self.spec.partition = p.into();
        self
    }

    pub fn account(mut self, a: impl Into<String>) -> Self {
        self.spec.account = a.into();
        self
    }

    pub fn qos(mut self, q: impl Into<String>) -> Self {
        self.spec.qos = q.into();
        self
    }

    pub fn constraint(mut self, c: impl Into<String>) -> Self {
        self.spec.constraint_list.push(c.into());
        self
    }

    pub fn license(mut self, l: impl Into<String>) -> Self {
        self.spec.license_list.push(l.into());
        self
    }

    pub fn exclude(mut self, node: impl Into<String>) -> Self {
        self.spec.exclude_list.push(node.into());
        self
    }

    pub fn module_unload(mut self, m: impl Into<String>) -> Self {
        self.spec.module_unload_list.push(m.into());
        self
    }

    pub fn module(mut self, m: impl Into<String>) -> Self {
        self.spec.module_list.push(m.into());
        self
    }

    pub fn source(mut self, s: impl Into<String>) -> Self {
        self.spec.source_list.push(s.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec
            .envs
            .get_or_insert_with(IndexMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_mpi(mut self, on: bool) -> Self {
        self.spec.with_mpi = on;
        self
    }

    pub fn cuda_multi_tasks(mut self, on: bool) -> Self {
        self.spec.cuda_multi_tasks = on;
        self
    }

    pub fn allow_failure(mut self, on: bool) -> Self {
        self.spec.allow_failure = on;
        self
    }

    pub fn cvasp(mut self, on: bool) -> Self {
        self.spec.cvasp = on;
        self
    }

    pub fn fp_max_errors(mut self, n: u32) -> Self {
        self.spec.fp_max_errors = n;
        self
    }

    pub fn build(self) -> Result<ResourceSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}
