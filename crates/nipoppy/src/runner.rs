//! Per-unit execution.
//!
//! For each work unit the runner assembles the substitution environment,
//! creates the unit work directory, optionally materializes a per-unit
//! BIDS file index, builds the command through the invocation builder,
//! and executes it synchronously with stdout/stderr captured to a
//! per-unit log file. Units fail independently: a non-zero exit is the
//! unit's outcome, not an error, and the loop continues. Cancellation is
//! observed between units and while waiting on the child.
//!
//! With an HPC kind selected, the resolved commands are handed to the
//! job-array emitter instead of being executed locally.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use globset::{GlobBuilder, GlobSetBuilder};

use crate::catalog::{PipelineBundle, PipelineCatalog, PipelineStep};
use crate::config::GlobalConfig;
use crate::curation;
use crate::error::NipoppyError;
use crate::hpc::{self, HpcConfig, SchedulerRegistry};
use crate::layout::{Layout, ensure_dir};
use crate::process::{CancelToken, run_shell};
use crate::subst::{self, SubstEnv};
use crate::types::{
    Action, UnitOutcome, WorkPlan, WorkUnit, bids_participant_id, bids_session_id,
};

/// Human-facing progress sink. The core never prints; the CLI (or an
/// embedder) decides how messages reach the operator.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A reporter that drops everything. Useful for tests and embedders.
#[derive(Debug, Default)]
pub struct SilentReporter;

impl Reporter for SilentReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Print the fully resolved command for every unit without executing.
    pub simulate: bool,
    /// Keep the HPC submission script after a successful submit.
    pub keep_workdir: bool,
    /// Dispatch to this job scheduler kind instead of running locally.
    pub hpc: Option<String>,
}

/// What happened to one unit.
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub unit: WorkUnit,
    pub outcome: Option<UnitOutcome>,
    pub error: Option<String>,
}

impl UnitResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.outcome.as_ref().is_none_or(|o| o.success())
    }
}

/// Summary of one run over a plan.
#[derive(Debug)]
pub struct RunReport {
    pub action: Action,
    pub plan_id: String,
    pub results: Vec<UnitResult>,
    pub cancelled: bool,
    /// Present when the plan was dispatched to an HPC scheduler.
    pub hpc_job_id: Option<String>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        !self.cancelled && self.results.iter().all(UnitResult::succeeded)
    }
}

/// Build the per-unit substitution environment. Precedence, lowest
/// first: dataset built-ins and layout paths, dataset-wide substitutions,
/// pipeline variables, per-unit built-ins.
pub fn unit_env(
    layout: &Layout,
    config: &GlobalConfig,
    bundle: &PipelineBundle,
    _step: &PipelineStep,
    participant_id: &str,
    session_id: &str,
    bids_db: Option<&Path>,
) -> Result<SubstEnv> {
    let mut env = SubstEnv::new();

    env.insert("DPATH_ROOT", layout.root().to_string_lossy());
    env.insert("DPATH_BIDS", layout.dpath_bids()?.to_string_lossy());
    env.insert(
        "DPATH_PIPELINE",
        layout
            .dpath_pipeline(&bundle.name, &bundle.version)?
            .to_string_lossy(),
    );
    env.insert(
        "DPATH_PIPELINE_OUTPUT",
        layout
            .dpath_pipeline_output(&bundle.name, &bundle.version)?
            .to_string_lossy(),
    );
    env.insert(
        "DPATH_PIPELINE_WORK",
        layout
            .dpath_pipeline_work(&bundle.name, &bundle.version)?
            .to_string_lossy(),
    );
    env.insert(
        "DPATH_PIPELINE_IDP",
        layout
            .dpath_pipeline_idp(&bundle.name, &bundle.version)?
            .to_string_lossy(),
    );

    let container_config = bundle
        .container_config
        .as_ref()
        .unwrap_or(&config.container_config);
    env.insert("CONTAINER_COMMAND", container_config.command_prefix());
    if let Some(fpath) = &bundle.container_fpath {
        let mut container_env = SubstEnv::new();
        container_env.insert("PIPELINE_NAME", bundle.name.as_str());
        container_env.insert("PIPELINE_VERSION", bundle.version.as_str());
        let resolved = subst::resolve_str(fpath, &container_env);
        let path = PathBuf::from(&resolved);
        let absolute = if path.is_absolute() {
            path
        } else {
            layout.root().join(path)
        };
        env.insert("FPATH_CONTAINER", absolute.to_string_lossy());
    }

    env.extend(
        config
            .substitutions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    env.extend(config.pipeline_variables.resolved(
        bundle.pipeline_type,
        &bundle.name,
        &bundle.version,
    )?);

    env.insert("PARTICIPANT_ID", participant_id);
    env.insert("SESSION_ID", session_id);
    env.insert("BIDS_PARTICIPANT_ID", bids_participant_id(participant_id));
    env.insert("BIDS_SESSION_ID", bids_session_id(session_id));
    if let Some(bids_db) = bids_db {
        env.insert("DPATH_BIDS_DB", bids_db.to_string_lossy());
    }

    Ok(env)
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

fn unit_slug(unit: &WorkUnit, stamp: &str) -> String {
    match &unit.pipeline {
        Some(p) => format!(
            "{}-{}-{}-{}-{}-{stamp}",
            p.name, p.version, p.step, unit.participant_id, unit.session_id
        ),
        None => format!("{}-{}-{stamp}", unit.participant_id, unit.session_id),
    }
}

/// Materialize the per-unit index of BIDS files, honoring the bundle's
/// ignore patterns. The index directory is exposed as `DPATH_BIDS_DB`;
/// its contents are opaque to the pipelines.
fn materialize_bids_index(
    layout: &Layout,
    step: &PipelineStep,
    work_dir: &Path,
) -> Result<PathBuf> {
    let bids_root = layout.dpath_bids()?;
    let db_dir = work_dir.join("bids_db");
    ensure_dir(&db_dir)?;

    let mut ignore = GlobSetBuilder::new();
    for pattern in &step.ignore_patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|e| {
                NipoppyError::config(format!("invalid ignore pattern {pattern:?}: {e}"))
            })?;
        ignore.add(glob);
    }
    let ignore = ignore
        .build()
        .map_err(|e| NipoppyError::config(format!("invalid ignore patterns: {e}")))?;

    let mut files = Vec::new();
    collect_files(&bids_root, &bids_root, &mut files)?;
    files.retain(|f| !ignore.is_match(f));
    files.sort();

    fs::write(db_dir.join("index.txt"), files.join("\n") + "\n")
        .with_context(|| format!("failed to write BIDS index in {}", db_dir.display()))?;
    Ok(db_dir)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let entries = fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            out.push(
                path.strip_prefix(root)
                    .expect("walked path is below root")
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
            );
        }
    }
    Ok(())
}

struct MaterializedUnit {
    command: String,
    work_dir: PathBuf,
    log_path: PathBuf,
}

fn materialize_unit(
    layout: &Layout,
    config: &GlobalConfig,
    catalog: &PipelineCatalog,
    action: Action,
    unit: &WorkUnit,
    create_dirs: bool,
) -> Result<MaterializedUnit> {
    let pipeline = unit
        .pipeline
        .as_ref()
        .expect("pipeline units only");
    let bundle = catalog.get(pipeline.pipeline_type, &pipeline.name, &pipeline.version)?;
    let step = bundle.step(Some(&pipeline.step))?;

    let stamp = timestamp();
    let slug = unit_slug(unit, &stamp);
    let work_dir = layout
        .dpath_pipeline_work(&pipeline.name, &pipeline.version)?
        .join(&slug);
    let log_path = layout.dpath_logs(action)?.join(format!("{slug}.log"));

    let bids_db = if create_dirs && step.generate_bids_db {
        ensure_dir(&work_dir)?;
        Some(materialize_bids_index(layout, step, &work_dir)?)
    } else {
        None
    };
    if create_dirs {
        ensure_dir(&work_dir)?;
        if let Some(parent) = log_path.parent() {
            ensure_dir(parent)?;
        }
    }

    let env = unit_env(
        layout,
        config,
        bundle,
        step,
        &unit.participant_id,
        &unit.session_id,
        bids_db.as_deref(),
    )?;
    let command = crate::descriptor::build_command(&step.descriptor, &step.invocation, &env)?;

    Ok(MaterializedUnit {
        command,
        work_dir,
        log_path,
    })
}

/// The resolved commands for every unit of a plan, without executing
/// anything. With `materialize`, per-unit work directories and BIDS
/// indexes are created (the HPC path needs them to exist before the
/// array job starts); without it the resolution is purely read-only.
pub fn resolve_commands(
    layout: &Layout,
    config: &GlobalConfig,
    catalog: &PipelineCatalog,
    plan: &WorkPlan,
    materialize: bool,
) -> Result<Vec<String>> {
    plan.units
        .iter()
        .map(|unit| {
            materialize_unit(layout, config, catalog, plan.action, unit, materialize)
                .map(|m| m.command)
        })
        .collect()
}

/// Execute a plan: locally unit-by-unit, or as one HPC job array.
#[allow(clippy::too_many_arguments)]
pub fn run_plan(
    layout: &Layout,
    config: &GlobalConfig,
    catalog: &PipelineCatalog,
    registry: &SchedulerRegistry,
    plan: &WorkPlan,
    opts: &RunOptions,
    reporter: &mut dyn Reporter,
    cancel: &CancelToken,
) -> Result<RunReport> {
    let mut report = RunReport {
        action: plan.action,
        plan_id: plan.plan_id.clone(),
        results: Vec::new(),
        cancelled: false,
        hpc_job_id: None,
    };

    if plan.units.is_empty() {
        reporter.info(&format!("{}: no outstanding work units", plan.action));
        return Ok(report);
    }

    if let Some(kind) = &opts.hpc {
        if plan.action == Action::Reorg {
            return Err(NipoppyError::config(
                "reorg runs in-process and cannot be dispatched to an HPC scheduler",
            )
            .into());
        }
        let commands = resolve_commands(layout, config, catalog, plan, true)?;
        // Job-wide parameters come from the selected step's HPC block.
        let first_pipeline = plan.units[0].pipeline.as_ref().expect("pipeline units");
        let bundle = catalog.get(
            first_pipeline.pipeline_type,
            &first_pipeline.name,
            &first_pipeline.version,
        )?;
        let step = bundle.step(Some(&first_pipeline.step))?;
        let hpc_config = step.hpc.clone().unwrap_or_else(HpcConfig::default);

        let job_name = format!("nipoppy-{}-{}", plan.action, timestamp());
        let submission = hpc::submit_array(
            layout,
            registry,
            kind,
            &job_name,
            &commands,
            &hpc_config,
            &config.hpc_preamble,
            opts.keep_workdir,
            reporter,
        )?;
        reporter.info(&format!("submitted job array {}", submission.job_id));
        report.hpc_job_id = Some(submission.job_id);
        return Ok(report);
    }

    for unit in &plan.units {
        if cancel.is_cancelled() {
            reporter.warn("cancellation requested; stopping before the next unit");
            report.cancelled = true;
            break;
        }
        let result = match &unit.pipeline {
            Some(_) => run_pipeline_unit(layout, config, catalog, plan.action, unit, opts, reporter, cancel),
            None => run_reorg_unit(layout, config, unit, opts, reporter),
        };
        match result {
            Ok(Some(unit_result)) => {
                if let Some(outcome) = &unit_result.outcome
                    && !outcome.success()
                {
                    reporter.warn(&format!(
                        "{}: exit code {} (log: {})",
                        unit.key(),
                        outcome.exit_code,
                        outcome.log_path.display()
                    ));
                }
                report.results.push(unit_result);
            }
            Ok(None) => {
                // Unit was interrupted mid-flight.
                report.cancelled = true;
                break;
            }
            Err(err) => {
                // Per-unit runtime errors are outcomes, not run failures.
                reporter.error(&format!("{}: {err:#}", unit.key()));
                report.results.push(UnitResult {
                    unit: unit.clone(),
                    outcome: None,
                    error: Some(format!("{err:#}")),
                });
            }
        }
    }

    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn run_pipeline_unit(
    layout: &Layout,
    config: &GlobalConfig,
    catalog: &PipelineCatalog,
    action: Action,
    unit: &WorkUnit,
    opts: &RunOptions,
    reporter: &mut dyn Reporter,
    cancel: &CancelToken,
) -> Result<Option<UnitResult>> {
    if opts.simulate {
        let materialized = materialize_unit(layout, config, catalog, action, unit, false)?;
        reporter.info(&format!("{}: {}", unit.key(), materialized.command));
        return Ok(Some(UnitResult {
            unit: unit.clone(),
            outcome: None,
            error: None,
        }));
    }

    let materialized = materialize_unit(layout, config, catalog, action, unit, true)?;
    reporter.info(&format!("{}: running", unit.key()));

    // Container runtime environment variables travel via the process
    // environment, not the command line.
    let pipeline = unit.pipeline.as_ref().expect("pipeline units only");
    let bundle = catalog.get(pipeline.pipeline_type, &pipeline.name, &pipeline.version)?;
    let env_vars = &bundle
        .container_config
        .as_ref()
        .unwrap_or(&config.container_config)
        .env_vars;

    let output = run_shell(&materialized.command, &materialized.work_dir, env_vars, cancel)?;

    let mut log = String::new();
    log.push_str(&format!("command: {}\n\n", materialized.command));
    log.push_str("=== stdout ===\n");
    log.push_str(&output.stdout);
    log.push_str("\n=== stderr ===\n");
    log.push_str(&output.stderr);
    fs::write(&materialized.log_path, log)
        .with_context(|| format!("failed to write {}", materialized.log_path.display()))?;

    if output.cancelled {
        // The unit working directory is not worth keeping for a unit that
        // was killed mid-flight; its log remains.
        let _ = fs::remove_dir_all(&materialized.work_dir);
        return Ok(None);
    }

    Ok(Some(UnitResult {
        unit: unit.clone(),
        outcome: Some(UnitOutcome {
            exit_code: output.exit_code,
            log_path: materialized.log_path,
        }),
        error: None,
    }))
}

fn run_reorg_unit(
    layout: &Layout,
    config: &GlobalConfig,
    unit: &WorkUnit,
    opts: &RunOptions,
    reporter: &mut dyn Reporter,
) -> Result<Option<UnitResult>> {
    if opts.simulate {
        reporter.info(&format!(
            "{}: reorganize DICOM files into the post-reorg tree",
            unit.key()
        ));
        return Ok(Some(UnitResult {
            unit: unit.clone(),
            outcome: None,
            error: None,
        }));
    }

    let stamp = timestamp();
    let log_path = layout
        .dpath_logs(Action::Reorg)?
        .join(format!("{}.log", unit_slug(unit, &stamp)));
    if let Some(parent) = log_path.parent() {
        ensure_dir(parent)?;
    }

    let copied = curation::reorg_unit(layout, config, &unit.participant_id, &unit.session_id)?;
    fs::write(
        &log_path,
        format!(
            "reorganized {copied} files for {} {}\n",
            unit.participant_id, unit.session_id
        ),
    )
    .with_context(|| format!("failed to write {}", log_path.display()))?;

    Ok(Some(UnitResult {
        unit: unit.clone(),
        outcome: Some(UnitOutcome {
            exit_code: 0,
            log_path,
        }),
        error: None,
    }))
}
