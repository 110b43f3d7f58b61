//! HPC job-array emission.
//!
//! Renders a single array-job submission script from the dataset's text
//! template (`code/hpc/job_script_template.<ext>`), then hands it to a
//! [`JobScheduler`] adapter for submission. Tokens starting with
//! `NIPOPPY_` are reserved and set by the emitter; all other tokens
//! originate from the pipeline HPC block or the adapter registry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::NipoppyError;
use crate::layout::{Layout, ensure_dir};
use crate::runner::Reporter;
use crate::subst::{self, SubstEnv};

/// Prefix of tokens owned by the emitter.
pub const RESERVED_TOKEN_PREFIX: &str = "NIPOPPY_";

/// Basename (sans extension) of the job script template.
pub const TEMPLATE_STEM: &str = "job_script_template";

/// Job-wide parameters from a pipeline step's HPC block. Unrecognized
/// keys pass through as extra template tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HpcConfig {
    #[serde(rename = "TIME", default)]
    pub time: Option<String>,
    #[serde(rename = "MEMORY", default)]
    pub memory: Option<String>,
    #[serde(rename = "CORES", default)]
    pub cores: Option<String>,
    #[serde(rename = "ACCOUNT", default)]
    pub account: Option<String>,
    #[serde(rename = "PARTITION", default)]
    pub partition: Option<String>,
    #[serde(rename = "ARRAY_CONCURRENCY_LIMIT", default)]
    pub array_concurrency_limit: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl HpcConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read HPC config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            NipoppyError::config(format!("malformed HPC config {}: {e}", path.display()))
        })?;
        for key in config.extra.keys() {
            if key.starts_with(RESERVED_TOKEN_PREFIX) {
                return Err(NipoppyError::config(format!(
                    "HPC config {} sets reserved token {key:?}",
                    path.display()
                ))
                .into());
            }
        }
        Ok(config)
    }
}

/// An abstract job scheduler: knows its array-index variable and how to
/// submit a script, returning an opaque submission id.
pub trait JobScheduler {
    fn kind(&self) -> &str;
    fn array_index_var(&self) -> &str;
    fn submit(&self, script: &Path) -> Result<String>;
}

/// Slurm-like scheduler (`sbatch`).
pub struct SlurmScheduler;

impl JobScheduler for SlurmScheduler {
    fn kind(&self) -> &str {
        "slurm"
    }

    fn array_index_var(&self) -> &str {
        "SLURM_ARRAY_TASK_ID"
    }

    fn submit(&self, script: &Path) -> Result<String> {
        submit_via(Command::new("sbatch").arg(script), "sbatch")
    }
}

/// SGE-like scheduler (`qsub`).
pub struct SgeScheduler;

impl JobScheduler for SgeScheduler {
    fn kind(&self) -> &str {
        "sge"
    }

    fn array_index_var(&self) -> &str {
        "SGE_TASK_ID"
    }

    fn submit(&self, script: &Path) -> Result<String> {
        submit_via(Command::new("qsub").arg(script), "qsub")
    }
}

fn submit_via(command: &mut Command, program: &str) -> Result<String> {
    let output = command
        .output()
        .with_context(|| format!("failed to run {program}"))?;
    if !output.status.success() {
        return Err(NipoppyError::persistence(format!(
            "{program} failed with status {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
        .into());
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    // The submission id is the last whitespace-separated token of the
    // scheduler's acknowledgment line ("Submitted batch job 12345").
    let id = stdout
        .split_whitespace()
        .last()
        .unwrap_or_default()
        .to_string();
    Ok(id)
}

/// Adapter registry, selected by the `HPC` kind. Additional adapters can
/// be registered by embedders.
pub struct SchedulerRegistry {
    adapters: Vec<Box<dyn JobScheduler>>,
}

impl SchedulerRegistry {
    /// The default adapters: Slurm-like and SGE-like.
    pub fn with_defaults() -> Self {
        Self {
            adapters: vec![Box::new(SlurmScheduler), Box::new(SgeScheduler)],
        }
    }

    pub fn register(&mut self, adapter: Box<dyn JobScheduler>) {
        self.adapters.push(adapter);
    }

    pub fn get(&self, kind: &str) -> Result<&dyn JobScheduler> {
        self.adapters
            .iter()
            .rev()
            .find(|a| a.kind() == kind)
            .map(|a| a.as_ref())
            .ok_or_else(|| {
                NipoppyError::config(format!("no job scheduler registered for kind {kind:?}"))
                    .into()
            })
    }
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Render the job-array script over the fixed `NIPOPPY_*` variable set
/// plus the HPC block's extra tokens.
pub fn render_script(
    template: &str,
    job_name: &str,
    commands: &[String],
    hpc: &HpcConfig,
    preamble: &[String],
    log_dir: &Path,
    array_index_var: &str,
) -> Result<String> {
    if commands.is_empty() {
        return Err(NipoppyError::planning("no commands to submit").into());
    }

    let mut env = SubstEnv::new();
    for (key, value) in &hpc.extra {
        env.insert(key.clone(), value.clone());
    }
    env.insert("NIPOPPY_JOB_NAME", job_name);
    env.insert("NIPOPPY_ARRAY_RANGE", format!("1-{}", commands.len()));
    env.insert("NIPOPPY_ARRAY_INDEX_VAR", array_index_var);
    env.insert("NIPOPPY_PREAMBLE", preamble.join("\n"));
    env.insert("NIPOPPY_LOG_DIR", log_dir.to_string_lossy());
    env.insert("NIPOPPY_TIME", hpc.time.clone().unwrap_or_default());
    env.insert("NIPOPPY_MEMORY", hpc.memory.clone().unwrap_or_default());
    env.insert("NIPOPPY_CORES", hpc.cores.clone().unwrap_or_default());
    env.insert("NIPOPPY_ACCOUNT", hpc.account.clone().unwrap_or_default());
    env.insert("NIPOPPY_PARTITION", hpc.partition.clone().unwrap_or_default());
    env.insert(
        "NIPOPPY_ARRAY_CONCURRENCY_LIMIT",
        hpc.array_concurrency_limit.clone().unwrap_or_default(),
    );

    let quoted: Vec<String> = commands
        .iter()
        .map(|c| format!("\"{}\"", c.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    env.insert("NIPOPPY_COMMANDS", quoted.join("\n"));

    let rendered = subst::resolve_str(template, &env);
    let leftover: Vec<String> = subst::referenced_tokens(&rendered)
        .into_iter()
        .filter(|t| t.starts_with(RESERVED_TOKEN_PREFIX))
        .collect();
    if !leftover.is_empty() {
        return Err(NipoppyError::config(format!(
            "job script template references unknown reserved tokens {leftover:?}"
        ))
        .into());
    }
    Ok(rendered)
}

/// Locate the dataset's job script template.
pub fn find_template(layout: &Layout) -> Result<PathBuf> {
    let dir = layout.require_dir("hpc")?;
    let entries = fs::read_dir(&dir)
        .with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        if path.is_file()
            && path
                .file_stem()
                .is_some_and(|stem| stem.to_string_lossy() == TEMPLATE_STEM)
        {
            return Ok(path);
        }
    }
    Err(NipoppyError::config(format!(
        "no {TEMPLATE_STEM}.* found in {}",
        dir.display()
    ))
    .into())
}

#[derive(Debug, Clone)]
pub struct HpcSubmission {
    pub job_id: String,
    /// Present only when the script was kept on disk.
    pub script_path: Option<PathBuf>,
}

/// Render, write, and submit one job-array script. On successful
/// submission the script is deleted unless `keep_workdir` is set.
#[allow(clippy::too_many_arguments)]
pub fn submit_array(
    layout: &Layout,
    registry: &SchedulerRegistry,
    kind: &str,
    job_name: &str,
    commands: &[String],
    hpc: &HpcConfig,
    preamble: &[String],
    keep_workdir: bool,
    reporter: &mut dyn Reporter,
) -> Result<HpcSubmission> {
    let adapter = registry.get(kind)?;
    let template_path = find_template(layout)?;
    let template = fs::read_to_string(&template_path)
        .with_context(|| format!("failed to read {}", template_path.display()))?;

    let log_dir = layout.path("logs")?.join("hpc");
    ensure_dir(&log_dir)?;

    let script = render_script(
        &template,
        job_name,
        commands,
        hpc,
        preamble,
        &log_dir,
        adapter.array_index_var(),
    )?;

    let script_dir = layout.dpath_work()?.join("hpc");
    ensure_dir(&script_dir)?;
    let script_path = script_dir.join(format!("{job_name}.sh"));
    fs::write(&script_path, &script)
        .with_context(|| format!("failed to write {}", script_path.display()))?;

    reporter.info(&format!(
        "submitting {} commands via {} ({})",
        commands.len(),
        adapter.kind(),
        script_path.display()
    ));
    let job_id = adapter.submit(&script_path)?;

    let script_path = if keep_workdir {
        Some(script_path)
    } else {
        let _ = fs::remove_file(&script_path);
        None
    };

    Ok(HpcSubmission {
        job_id,
        script_path,
    })
}

/// A reasonable Slurm-flavored starting template, written at dataset init.
pub const DEFAULT_JOB_SCRIPT_TEMPLATE: &str = r#"#!/bin/bash
#SBATCH --job-name=[[NIPOPPY_JOB_NAME]]
#SBATCH --array=[[NIPOPPY_ARRAY_RANGE]]
#SBATCH --time=[[NIPOPPY_TIME]]
#SBATCH --mem=[[NIPOPPY_MEMORY]]
#SBATCH --cpus-per-task=[[NIPOPPY_CORES]]
#SBATCH --account=[[NIPOPPY_ACCOUNT]]
#SBATCH --partition=[[NIPOPPY_PARTITION]]
#SBATCH --output=[[NIPOPPY_LOG_DIR]]/%x-%A_%a.out

[[NIPOPPY_PREAMBLE]]

COMMANDS=(
[[NIPOPPY_COMMANDS]]
)

eval "${COMMANDS[$(([[NIPOPPY_ARRAY_INDEX_VAR]]-1))]}"
"#;
