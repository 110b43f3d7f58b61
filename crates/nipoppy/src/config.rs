//! Dataset-wide configuration (`global_config.json`).
//!
//! The on-disk format uses upper-case keys; fields map to snake-case Rust
//! names via serde renames. Pipeline variables start out `null` when a
//! bundle is installed and must be populated by the user before the
//! pipeline can run — a `null` variable that a pipeline references is a
//! configuration error at the operation boundary, never a per-unit one.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::NipoppyError;
use crate::types::PipelineType;

/// Container runtime invocation prefix. The core only ever concatenates
/// these into the `CONTAINER_COMMAND` substitution variable; runtime
/// discovery and invocation syntax beyond that are the runtime's business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "COMMAND", default = "default_container_command")]
    pub command: String,
    #[serde(rename = "ARGS", default)]
    pub args: Vec<String>,
    #[serde(rename = "ENV_VARS", default)]
    pub env_vars: BTreeMap<String, String>,
}

fn default_container_command() -> String {
    "apptainer".to_string()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            command: default_container_command(),
            args: vec!["run".to_string()],
            env_vars: BTreeMap::new(),
        }
    }
}

impl ContainerConfig {
    /// The full command prefix, e.g. `apptainer run --cleanenv`.
    pub fn command_prefix(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Pipeline-specific variables, grouped by variant, name and version.
/// Values are `null` until the user populates them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineVariables {
    #[serde(rename = "BIDSIFICATION", default)]
    pub bidsification: VariableMap,
    #[serde(rename = "PROCESSING", default)]
    pub processing: VariableMap,
    #[serde(rename = "EXTRACTION", default)]
    pub extraction: VariableMap,
}

pub type VariableMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, Option<String>>>>;

impl PipelineVariables {
    fn map_for(&self, pipeline_type: PipelineType) -> &VariableMap {
        match pipeline_type {
            PipelineType::Bidsification => &self.bidsification,
            PipelineType::Processing => &self.processing,
            PipelineType::Extraction => &self.extraction,
        }
    }

    /// Variable names declared for one pipeline, populated or not.
    pub fn declared(
        &self,
        pipeline_type: PipelineType,
        name: &str,
        version: &str,
    ) -> Vec<String> {
        self.map_for(pipeline_type)
            .get(name)
            .and_then(|versions| versions.get(version))
            .map(|vars| vars.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolved (non-null) variables for one pipeline. A declared-but-null
    /// variable is a configuration error naming the offender.
    pub fn resolved(
        &self,
        pipeline_type: PipelineType,
        name: &str,
        version: &str,
    ) -> Result<BTreeMap<String, String>> {
        let Some(vars) = self
            .map_for(pipeline_type)
            .get(name)
            .and_then(|versions| versions.get(version))
        else {
            return Ok(BTreeMap::new());
        };
        let mut resolved = BTreeMap::new();
        for (var, value) in vars {
            match value {
                Some(v) => {
                    resolved.insert(var.clone(), v.clone());
                }
                None => {
                    return Err(NipoppyError::config(format!(
                        "pipeline variable {var} for {pipeline_type} pipeline \
                         {name} {version} is not set in the global configuration"
                    ))
                    .into());
                }
            }
        }
        Ok(resolved)
    }
}

/// The dataset-wide configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(rename = "DATASET_NAME")]
    pub dataset_name: String,

    /// Ordered visit labels; the manifest's `visit_id` values.
    #[serde(rename = "VISITS")]
    pub visits: Vec<String>,

    /// Ordered imaging session labels; defaults to the visit labels.
    #[serde(rename = "SESSIONS", default)]
    pub sessions: Vec<String>,

    /// Pre-reorg directory shape: `<participant>/<session>` when true,
    /// `<session>/<participant>` when false. Ignored when a map file is
    /// set — the map file wins.
    #[serde(rename = "DICOM_DIR_PARTICIPANT_FIRST", default = "default_true")]
    pub dicom_dir_participant_first: bool,

    /// Optional two-column relation file (participant_id → DICOM dir)
    /// overriding the participant-first/session-first convention.
    #[serde(rename = "DICOM_DIR_MAP_FILE", default)]
    pub dicom_dir_map_file: Option<PathBuf>,

    #[serde(rename = "CONTAINER_CONFIG", default)]
    pub container_config: ContainerConfig,

    /// Dataset-wide substitution variables, merged into every environment.
    #[serde(rename = "SUBSTITUTIONS", default)]
    pub substitutions: BTreeMap<String, String>,

    #[serde(rename = "PIPELINE_VARIABLES", default)]
    pub pipeline_variables: PipelineVariables,

    /// Shell lines prepended to every HPC job script.
    #[serde(rename = "HPC_PREAMBLE", default)]
    pub hpc_preamble: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl GlobalConfig {
    pub fn new(dataset_name: impl Into<String>, visits: Vec<String>) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            sessions: visits.clone(),
            visits,
            dicom_dir_participant_first: true,
            dicom_dir_map_file: None,
            container_config: ContainerConfig::default(),
            substitutions: BTreeMap::new(),
            pipeline_variables: PipelineVariables::default(),
            hpc_preamble: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| {
            format!("failed to read global configuration {}", path.display())
        })?;
        let mut config: Self = serde_json::from_str(&content).map_err(|e| {
            NipoppyError::config(format!(
                "malformed global configuration {}: {e}",
                path.display()
            ))
        })?;
        if config.sessions.is_empty() {
            config.sessions = config.visits.clone();
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config dir {}", parent.display())
            })?;
        }
        let json =
            serde_json::to_string_pretty(self).context("failed to serialize global configuration")?;
        fs::write(path, json + "\n")
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::error::{NipoppyError, error_kind};

    fn sample_json() -> &'static str {
        r#"{
            "DATASET_NAME": "demo",
            "VISITS": ["BL", "M12"],
            "SESSIONS": ["BL"],
            "DICOM_DIR_PARTICIPANT_FIRST": false,
            "CONTAINER_CONFIG": {"COMMAND": "apptainer", "ARGS": ["run", "--cleanenv"]},
            "SUBSTITUTIONS": {"TEMPLATEFLOW_HOME": "/opt/templateflow"},
            "PIPELINE_VARIABLES": {
                "PROCESSING": {
                    "fmriprep": {"24.1.1": {"FS_LICENSE": "/opt/fs/license.txt", "UNSET": null}}
                }
            },
            "HPC_PREAMBLE": ["source env.sh"]
        }"#
    }

    #[test]
    fn load_parses_upper_case_keys() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("global_config.json");
        fs::write(&path, sample_json()).expect("write");

        let config = GlobalConfig::load(&path).expect("load");
        assert_eq!(config.dataset_name, "demo");
        assert_eq!(config.visits, vec!["BL", "M12"]);
        assert_eq!(config.sessions, vec!["BL"]);
        assert!(!config.dicom_dir_participant_first);
        assert_eq!(
            config.container_config.command_prefix(),
            "apptainer run --cleanenv"
        );
        assert_eq!(config.hpc_preamble, vec!["source env.sh"]);
    }

    #[test]
    fn sessions_default_to_visits() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("global_config.json");
        fs::write(
            &path,
            r#"{"DATASET_NAME": "demo", "VISITS": ["BL"]}"#,
        )
        .expect("write");
        let config = GlobalConfig::load(&path).expect("load");
        assert_eq!(config.sessions, vec!["BL"]);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("global_config.json");
        fs::write(&path, "{not json").expect("write");
        let err = GlobalConfig::load(&path).expect_err("must fail");
        assert!(matches!(error_kind(&err), Some(NipoppyError::Config(_))));
    }

    #[test]
    fn null_pipeline_variable_is_fatal_and_named() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("global_config.json");
        fs::write(&path, sample_json()).expect("write");
        let config = GlobalConfig::load(&path).expect("load");

        let err = config
            .pipeline_variables
            .resolved(PipelineType::Processing, "fmriprep", "24.1.1")
            .expect_err("null variable");
        assert!(matches!(error_kind(&err), Some(NipoppyError::Config(_))));
        assert!(err.to_string().contains("UNSET"));
    }

    #[test]
    fn undeclared_pipeline_resolves_to_empty() {
        let config = GlobalConfig::new("demo", vec!["BL".to_string()]);
        let vars = config
            .pipeline_variables
            .resolved(PipelineType::Processing, "mriqc", "23.1.0")
            .expect("empty");
        assert!(vars.is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("global_config.json");
        let config = GlobalConfig::new("demo", vec!["BL".to_string()]);
        config.save(&path).expect("save");
        let loaded = GlobalConfig::load(&path).expect("load");
        assert_eq!(loaded.dataset_name, "demo");
        assert_eq!(loaded.sessions, vec!["BL"]);
    }
}
