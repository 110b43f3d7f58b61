//! Dataset layout resolution.
//!
//! Maps semantic names (`manifest`, `bids`, `pipeline_store`, ...) to
//! filesystem paths below the dataset root, using a layout descriptor
//! loaded at dataset init (a compiled-in default is used when no
//! descriptor file is present). Every other component resolves paths
//! through this module only.
//!
//! Directories are created lazily by writers. Reads that hit a missing
//! dataset-level directory surface [`NipoppyError::NotInitialized`],
//! which callers keep distinct from an initialized-but-empty dataset.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::NipoppyError;
use crate::subst::{self, SubstEnv};
use crate::types::{Action, PipelineType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    #[default]
    Dir,
    File,
}

/// One semantic name in the layout descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutEntry {
    /// Path relative to the dataset root. May contain `[[...]]` template
    /// variables resolved at lookup time.
    pub path: String,
    /// Human description, shown when the directory is missing.
    pub description: String,
    #[serde(default)]
    pub kind: EntryKind,
}

/// The full semantic-name table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub entries: BTreeMap<String, LayoutEntry>,
}

fn entry(path: &str, description: &str, kind: EntryKind) -> LayoutEntry {
    LayoutEntry {
        path: path.to_string(),
        description: description.to_string(),
        kind,
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        use EntryKind::{Dir, File};
        let mut entries = BTreeMap::new();
        entries.insert(
            "manifest".to_string(),
            entry("manifest.tsv", "ground-truth participant/visit manifest", File),
        );
        entries.insert(
            "curation_status".to_string(),
            entry(
                "sourcedata/imaging/curation_status.tsv",
                "curation status table",
                File,
            ),
        );
        entries.insert(
            "processing_status".to_string(),
            entry(
                "derivatives/processing_status.tsv",
                "processing status table",
                File,
            ),
        );
        entries.insert(
            "downloads".to_string(),
            entry(
                "sourcedata/imaging/downloads",
                "raw imaging downloads",
                Dir,
            ),
        );
        entries.insert(
            "pre_reorg".to_string(),
            entry(
                "sourcedata/imaging/pre_reorg",
                "DICOM files before reorganization",
                Dir,
            ),
        );
        entries.insert(
            "post_reorg".to_string(),
            entry(
                "sourcedata/imaging/post_reorg",
                "DICOM files after reorganization",
                Dir,
            ),
        );
        entries.insert(
            "bids".to_string(),
            entry("bids", "BIDS-converted imaging data", Dir),
        );
        entries.insert(
            "pipeline_store".to_string(),
            entry("pipelines", "installed pipeline bundles", Dir),
        );
        entries.insert(
            "derivatives".to_string(),
            entry("derivatives", "pipeline output areas", Dir),
        );
        entries.insert(
            "pipeline_dir".to_string(),
            entry(
                "derivatives/[[PIPELINE_NAME]]/[[PIPELINE_VERSION]]",
                "per-pipeline derivatives area",
                Dir,
            ),
        );
        entries.insert(
            "pipeline_output".to_string(),
            entry(
                "derivatives/[[PIPELINE_NAME]]/[[PIPELINE_VERSION]]/output",
                "pipeline output tree",
                Dir,
            ),
        );
        entries.insert(
            "pipeline_work".to_string(),
            entry(
                "derivatives/[[PIPELINE_NAME]]/[[PIPELINE_VERSION]]/work",
                "pipeline scratch area",
                Dir,
            ),
        );
        entries.insert(
            "pipeline_idp".to_string(),
            entry(
                "derivatives/[[PIPELINE_NAME]]/[[PIPELINE_VERSION]]/idp",
                "extracted imaging-derived phenotypes",
                Dir,
            ),
        );
        entries.insert(
            "containers".to_string(),
            entry("containers", "container image files", Dir),
        );
        entries.insert("logs".to_string(), entry("logs", "per-action log files", Dir));
        entries.insert(
            "work".to_string(),
            entry("work", "plans, unit work directories and HPC scripts", Dir),
        );
        entries.insert(
            "hpc".to_string(),
            entry("code/hpc", "HPC job script templates", Dir),
        );
        entries.insert(
            "global_config".to_string(),
            entry("global_config.json", "dataset-wide configuration", File),
        );
        entries.insert(
            "lock".to_string(),
            entry(".nipoppy/lock", "dataset write lock", File),
        );
        Self { entries }
    }
}

impl LayoutConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read layout descriptor {}", path.display()))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            NipoppyError::config(format!(
                "malformed layout descriptor {}: {e}",
                path.display()
            ))
        })?;
        Ok(config)
    }
}

/// A dataset root bound to a layout descriptor.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    config: LayoutConfig,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: LayoutConfig::default(),
        }
    }

    pub fn with_config(root: impl Into<PathBuf>, config: LayoutConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a semantic name to an absolute path.
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        self.path_with(name, &SubstEnv::new())
    }

    /// Resolve a semantic name, substituting template variables in the
    /// descriptor path. Unresolved template variables are rejected.
    pub fn path_with(&self, name: &str, env: &SubstEnv) -> Result<PathBuf> {
        let entry = self.config.entries.get(name).ok_or_else(|| {
            NipoppyError::config(format!("unknown layout name {name:?}"))
        })?;
        let resolved = subst::resolve_str(&entry.path, env);
        let leftover = subst::referenced_tokens(&resolved);
        if !leftover.is_empty() {
            return Err(NipoppyError::config(format!(
                "layout name {name:?} requires template variables {leftover:?}"
            ))
            .into());
        }
        Ok(self.root.join(resolved))
    }

    /// Resolve a semantic name and require the directory to exist.
    pub fn require_dir(&self, name: &str) -> Result<PathBuf> {
        let path = self.path(name)?;
        if !path.is_dir() {
            let description = self
                .config
                .entries
                .get(name)
                .map(|e| e.description.clone())
                .unwrap_or_default();
            return Err(NipoppyError::not_initialized(format!(
                "{} ({description}) does not exist; run init first",
                path.display()
            ))
            .into());
        }
        Ok(path)
    }

    pub fn manifest_path(&self) -> Result<PathBuf> {
        self.path("manifest")
    }

    pub fn curation_status_path(&self) -> Result<PathBuf> {
        self.path("curation_status")
    }

    pub fn processing_status_path(&self) -> Result<PathBuf> {
        self.path("processing_status")
    }

    pub fn global_config_path(&self) -> Result<PathBuf> {
        self.path("global_config")
    }

    pub fn dpath_bids(&self) -> Result<PathBuf> {
        self.path("bids")
    }

    pub fn dpath_pre_reorg(&self) -> Result<PathBuf> {
        self.path("pre_reorg")
    }

    pub fn dpath_post_reorg(&self) -> Result<PathBuf> {
        self.path("post_reorg")
    }

    pub fn dpath_pipeline_store(&self) -> Result<PathBuf> {
        self.path("pipeline_store")
    }

    pub fn dpath_containers(&self) -> Result<PathBuf> {
        self.path("containers")
    }

    pub fn dpath_work(&self) -> Result<PathBuf> {
        self.path("work")
    }

    pub fn dpath_hpc(&self) -> Result<PathBuf> {
        self.path("hpc")
    }

    /// Log directory for one action, e.g. `logs/process/`.
    pub fn dpath_logs(&self, action: Action) -> Result<PathBuf> {
        Ok(self.path("logs")?.join(action.as_str()))
    }

    fn pipeline_env(name: &str, version: &str) -> SubstEnv {
        let mut env = SubstEnv::new();
        env.insert("PIPELINE_NAME", name);
        env.insert("PIPELINE_VERSION", version);
        env
    }

    pub fn dpath_pipeline(&self, name: &str, version: &str) -> Result<PathBuf> {
        self.path_with("pipeline_dir", &Self::pipeline_env(name, version))
    }

    pub fn dpath_pipeline_output(&self, name: &str, version: &str) -> Result<PathBuf> {
        self.path_with("pipeline_output", &Self::pipeline_env(name, version))
    }

    pub fn dpath_pipeline_work(&self, name: &str, version: &str) -> Result<PathBuf> {
        self.path_with("pipeline_work", &Self::pipeline_env(name, version))
    }

    pub fn dpath_pipeline_idp(&self, name: &str, version: &str) -> Result<PathBuf> {
        self.path_with("pipeline_idp", &Self::pipeline_env(name, version))
    }

    /// Bundle directory for one installed pipeline.
    pub fn dpath_pipeline_bundle(
        &self,
        pipeline_type: PipelineType,
        name: &str,
        version: &str,
    ) -> Result<PathBuf> {
        Ok(self
            .dpath_pipeline_store()?
            .join(pipeline_type.as_str())
            .join(name)
            .join(version))
    }

    /// Non-templated directory entries that do not exist yet, with their
    /// semantic names and descriptions. Consumed by the status summary.
    pub fn missing_directories(&self) -> Vec<(String, String, PathBuf)> {
        let mut missing = Vec::new();
        for (name, entry) in &self.config.entries {
            if entry.kind != EntryKind::Dir || entry.path.contains("[[") {
                continue;
            }
            let path = self.root.join(&entry.path);
            if !path.is_dir() {
                missing.push((name.clone(), entry.description.clone(), path));
            }
        }
        missing
    }

    /// Create every non-templated directory entry. Used at dataset init;
    /// all other directory creation happens lazily on first write.
    pub fn create_all(&self) -> Result<()> {
        for entry in self.config.entries.values() {
            if entry.kind != EntryKind::Dir || entry.path.contains("[[") {
                continue;
            }
            ensure_dir(&self.root.join(&entry.path))?;
        }
        Ok(())
    }
}

/// Create a directory (and parents), mapping failure to a persistence error.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        NipoppyError::persistence(format!("failed to create {}: {e}", path.display()))
    })?;
    Ok(())
}
