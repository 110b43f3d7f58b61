//! Output-tree tracking: glob expectation lists → status atoms.
//!
//! A tracker configuration is a list of glob path patterns (plus an
//! optional participant/session directory template) evaluated against the
//! pipeline output root for each (participant, session). The verdict is
//! derived purely from filesystem observations — exit codes are never
//! consulted — and merged into the processing status table in a single
//! atomic write per tracker run, so re-runs are idempotent.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use globset::GlobBuilder;
use serde::{Deserialize, Serialize};

use crate::catalog::PipelineCatalog;
use crate::config::GlobalConfig;
use crate::error::NipoppyError;
use crate::layout::Layout;
use crate::runner::{Reporter, unit_env};
use crate::subst::{self, SubstEnv};
use crate::tables::{TableDiff, TableKind, TableStore, processing_table};
use crate::types::{ProcStatus, ProcessingRow, WorkPlan};

/// Bounds the participant/session existence check when a pipeline lays
/// its outputs out in the usual BIDS-derivative shape.
pub const DEFAULT_PARTICIPANT_SESSION_DIR: &str = "[[BIDS_PARTICIPANT_ID]]/[[BIDS_SESSION_ID]]";

/// Per-step tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Glob patterns relative to the pipeline output root. A pattern is
    /// satisfied when at least one file matches.
    #[serde(rename = "PATHS")]
    pub paths: Vec<String>,
    /// Template for the participant/session directory whose existence
    /// separates FAIL from UNAVAILABLE.
    #[serde(rename = "PARTICIPANT_SESSION_DIR", default)]
    pub participant_session_dir: Option<String>,
}

impl TrackerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read tracker config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            NipoppyError::config(format!(
                "malformed tracker config {}: {e}",
                path.display()
            ))
        })?;
        if config.paths.is_empty() {
            return Err(NipoppyError::config(format!(
                "tracker config {} declares no paths",
                path.display()
            ))
            .into());
        }
        Ok(config)
    }
}

/// Evaluate one unit against the pipeline output root.
///
/// - `SUCCESS` if every configured glob has at least one match;
/// - `FAIL` if at least one glob has no match but the participant/session
///   directory exists;
/// - `UNAVAILABLE` if the participant/session directory does not exist.
pub fn evaluate(
    output_root: &Path,
    tracker: &TrackerConfig,
    env: &SubstEnv,
) -> Result<ProcStatus> {
    let dir_template = tracker
        .participant_session_dir
        .as_deref()
        .unwrap_or(DEFAULT_PARTICIPANT_SESSION_DIR);
    let participant_session_dir = output_root.join(subst::resolve_str(dir_template, env));
    if !participant_session_dir.is_dir() {
        return Ok(ProcStatus::Unavailable);
    }

    let files = collect_relative_files(output_root)?;
    for pattern in &tracker.paths {
        let resolved = subst::resolve_str(pattern, env);
        let glob = GlobBuilder::new(&resolved)
            .literal_separator(true)
            .build()
            .map_err(|e| {
                NipoppyError::config(format!("invalid tracker glob {resolved:?}: {e}"))
            })?
            .compile_matcher();
        if !files.iter().any(|f| glob.is_match(f)) {
            return Ok(ProcStatus::Fail);
        }
    }
    Ok(ProcStatus::Success)
}

/// All file paths below `root`, relative, with `/` separators.
fn collect_relative_files(root: &Path) -> Result<Vec<String>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else {
                let relative = path
                    .strip_prefix(root)
                    .expect("walked path is below root")
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(relative);
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    if root.is_dir() {
        walk(root, root, &mut out)?;
    }
    out.sort();
    Ok(out)
}

/// Re-evaluate every unit in a track-processing plan and merge the
/// verdicts into the processing status table.
pub fn track_plan(
    layout: &Layout,
    config: &GlobalConfig,
    catalog: &PipelineCatalog,
    plan: &WorkPlan,
    reporter: &mut dyn Reporter,
) -> Result<TableDiff> {
    let mut rows: Vec<ProcessingRow> = Vec::new();

    for unit in &plan.units {
        let pipeline = unit
            .pipeline
            .as_ref()
            .ok_or_else(|| NipoppyError::planning(format!(
                "unit {} has no pipeline to track",
                unit.key()
            )))?;
        let bundle = catalog.get(pipeline.pipeline_type, &pipeline.name, &pipeline.version)?;
        let step = bundle.step(Some(&pipeline.step))?;
        if !step.update_status {
            reporter.info(&format!(
                "{}: step {} does not update the processing status; skipped",
                unit.key(),
                step.name
            ));
            continue;
        }
        let tracker = step.tracker.as_ref().ok_or_else(|| {
            NipoppyError::config(format!(
                "pipeline {} {} step {} has no tracker configured",
                pipeline.name, pipeline.version, step.name
            ))
        })?;

        let env = unit_env(
            layout,
            config,
            bundle,
            step,
            &unit.participant_id,
            &unit.session_id,
            None,
        )?;
        let output_root = layout.dpath_pipeline_output(&pipeline.name, &pipeline.version)?;
        let status = match evaluate(&output_root, tracker, &env) {
            Ok(status) => status,
            // A missing or unreadable output root is an observation, not
            // an operation failure.
            Err(_) => ProcStatus::Unavailable,
        };
        reporter.info(&format!("{}: {status}", unit.key()));
        rows.push(ProcessingRow::new(
            &unit.participant_id,
            &unit.session_id,
            pipeline,
            status,
        ));
    }

    let store = TableStore::new(layout);
    let changes = store.upsert(TableKind::ProcessingStatus, &processing_table(&rows))?;
    reporter.info(&format!("processing status: {}", changes.summary()));
    Ok(changes)
}
