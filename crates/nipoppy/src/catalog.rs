//! Pipeline bundle discovery and validation.
//!
//! Installed bundles live under `pipelines/<type>/<name>/<version>/`.
//! The catalog parses each bundle's config, loads and validates every
//! referenced ancillary file (descriptor, invocation, tracker, ignore
//! list, HPC block) once, and keeps the results in an arena keyed by
//! (type, name, version). Components hold keys into the arena, never
//! owning pointers.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::{ContainerConfig, GlobalConfig};
use crate::descriptor::{Descriptor, Invocation, load_invocation, validate_invocation};
use crate::error::NipoppyError;
use crate::hpc::HpcConfig;
use crate::layout::Layout;
use crate::subst::{self, BUILTIN_TOKENS};
use crate::tracker::TrackerConfig;
use crate::types::{PipelineRef, PipelineSelector, PipelineType};

pub const BUNDLE_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_STEP_NAME: &str = "default";

/// Container image reference in a bundle config. The path may contain
/// `[[PIPELINE_NAME]]` / `[[PIPELINE_VERSION]]` tokens and is resolved
/// relative to the dataset root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(rename = "FPATH")]
    pub fpath: String,
    #[serde(rename = "URI", default)]
    pub uri: Option<String>,
}

/// An upstream processing dependency declared by an extraction bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcDependency {
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "VERSION")]
    pub version: String,
    #[serde(rename = "STEP", default)]
    pub step: Option<String>,
}

/// One step entry in a bundle config, referencing its ancillary files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(rename = "NAME", default = "default_step_name")]
    pub name: String,
    #[serde(rename = "DESCRIPTOR_FILE")]
    pub descriptor_file: PathBuf,
    #[serde(rename = "INVOCATION_FILE")]
    pub invocation_file: PathBuf,
    #[serde(rename = "TRACKER_CONFIG_FILE", default)]
    pub tracker_config_file: Option<PathBuf>,
    #[serde(rename = "PYBIDS_IGNORE_FILE", default)]
    pub pybids_ignore_file: Option<PathBuf>,
    #[serde(rename = "HPC_CONFIG_FILE", default)]
    pub hpc_config_file: Option<PathBuf>,
    #[serde(rename = "GENERATE_PYBIDS_DATABASE", default)]
    pub generate_pybids_database: Option<bool>,
    #[serde(rename = "UPDATE_STATUS", default)]
    pub update_status: Option<bool>,
}

fn default_step_name() -> String {
    DEFAULT_STEP_NAME.to_string()
}

/// The bundle config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "VERSION")]
    pub version: String,
    #[serde(rename = "CONTAINER_INFO", default)]
    pub container_info: Option<ContainerInfo>,
    #[serde(rename = "CONTAINER_CONFIG", default)]
    pub container_config: Option<ContainerConfig>,
    #[serde(rename = "STEPS")]
    pub steps: Vec<StepConfig>,
    #[serde(rename = "PROC_DEPENDENCIES", default)]
    pub proc_dependencies: Vec<ProcDependency>,
}

/// One fully loaded step: descriptor, bindings, and optional extras.
#[derive(Debug, Clone)]
pub struct PipelineStep {
    pub name: String,
    pub descriptor: Descriptor,
    pub invocation: Invocation,
    pub tracker: Option<TrackerConfig>,
    pub ignore_patterns: Vec<String>,
    pub hpc: Option<HpcConfig>,
    pub generate_bids_db: bool,
    pub update_status: bool,
}

/// One installed bundle, fully validated at load time.
#[derive(Debug, Clone)]
pub struct PipelineBundle {
    pub pipeline_type: PipelineType,
    pub name: String,
    pub version: String,
    pub dir: PathBuf,
    pub container_fpath: Option<String>,
    pub container_uri: Option<String>,
    pub container_config: Option<ContainerConfig>,
    pub steps: Vec<PipelineStep>,
    pub proc_dependencies: Vec<ProcDependency>,
}

impl PipelineBundle {
    /// The named step, or the first step when no name is given.
    pub fn step(&self, name: Option<&str>) -> Result<&PipelineStep> {
        match name {
            None => self.steps.first().ok_or_else(|| {
                NipoppyError::config(format!(
                    "pipeline {} {} declares no steps",
                    self.name, self.version
                ))
                .into()
            }),
            Some(name) => self.steps.iter().find(|s| s.name == name).ok_or_else(|| {
                NipoppyError::config(format!(
                    "pipeline {} {} has no step named {name:?}",
                    self.name, self.version
                ))
                .into()
            }),
        }
    }

    pub fn pipeline_ref(&self, step: &PipelineStep) -> PipelineRef {
        PipelineRef {
            pipeline_type: self.pipeline_type,
            name: self.name.clone(),
            version: self.version.clone(),
            step: step.name.clone(),
        }
    }
}

type BundleKey = (PipelineType, String, String);

/// The bundle arena.
#[derive(Debug, Default)]
pub struct PipelineCatalog {
    bundles: BTreeMap<BundleKey, PipelineBundle>,
}

impl PipelineCatalog {
    /// Enumerate and validate every installed bundle.
    pub fn discover(layout: &Layout, config: &GlobalConfig) -> Result<Self> {
        let store = layout.require_dir("pipeline_store")?;
        let mut bundles = BTreeMap::new();

        for pipeline_type in PipelineType::ALL {
            let type_dir = store.join(pipeline_type.as_str());
            if !type_dir.is_dir() {
                continue;
            }
            for name in sorted_subdirs(&type_dir)? {
                for version in sorted_subdirs(&type_dir.join(&name))? {
                    let dir = type_dir.join(&name).join(&version);
                    let bundle = load_bundle(config, pipeline_type, &dir, &name, &version)
                        .with_context(|| {
                            format!("loading pipeline bundle {}", dir.display())
                        })?;
                    bundles.insert(
                        (pipeline_type, name.clone(), version.clone()),
                        bundle,
                    );
                }
            }
        }

        Ok(Self { bundles })
    }

    pub fn get(
        &self,
        pipeline_type: PipelineType,
        name: &str,
        version: &str,
    ) -> Result<&PipelineBundle> {
        self.bundles
            .get(&(pipeline_type, name.to_string(), version.to_string()))
            .ok_or_else(|| {
                NipoppyError::config(format!(
                    "{pipeline_type} pipeline bundle {name} {version} not found"
                ))
                .into()
            })
    }

    /// All bundles, optionally filtered by variant and name.
    pub fn list(
        &self,
        pipeline_type: Option<PipelineType>,
        name: Option<&str>,
    ) -> Vec<&PipelineBundle> {
        self.bundles
            .values()
            .filter(|b| pipeline_type.is_none_or(|t| b.pipeline_type == t))
            .filter(|b| name.is_none_or(|n| b.name == n))
            .collect()
    }

    /// The highest installed version of a pipeline, numeric-aware.
    pub fn latest_version(&self, pipeline_type: PipelineType, name: &str) -> Option<&str> {
        self.bundles
            .values()
            .filter(|b| b.pipeline_type == pipeline_type && b.name == name)
            .map(|b| b.version.as_str())
            .max_by(|a, b| compare_versions(a, b))
    }

    /// Resolve a selector: the named version (or the latest installed)
    /// and the named step (or the bundle's first).
    pub fn resolve(
        &self,
        pipeline_type: PipelineType,
        selector: &PipelineSelector,
    ) -> Result<(&PipelineBundle, &PipelineStep)> {
        let version = match &selector.version {
            Some(version) => version.clone(),
            None => self
                .latest_version(pipeline_type, &selector.name)
                .ok_or_else(|| {
                    NipoppyError::config(format!(
                        "no {pipeline_type} pipeline bundle named {} is installed",
                        selector.name
                    ))
                })?
                .to_string(),
        };
        let bundle = self.get(pipeline_type, &selector.name, &version)?;
        let step = bundle.step(selector.step.as_deref())?;
        Ok((bundle, step))
    }
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn load_bundle(
    config: &GlobalConfig,
    pipeline_type: PipelineType,
    dir: &Path,
    name: &str,
    version: &str,
) -> Result<PipelineBundle> {
    let config_path = dir.join(BUNDLE_CONFIG_FILE);
    if !config_path.is_file() {
        return Err(NipoppyError::config(format!(
            "bundle config {} is missing",
            config_path.display()
        ))
        .into());
    }
    let content = fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let bundle_config: BundleConfig = serde_json::from_str(&content).map_err(|e| {
        NipoppyError::config(format!(
            "malformed bundle config {}: {e}",
            config_path.display()
        ))
    })?;

    if bundle_config.name != name || bundle_config.version != version {
        return Err(NipoppyError::config(format!(
            "bundle config {} declares {} {} but is installed as {name} {version}",
            config_path.display(),
            bundle_config.name,
            bundle_config.version
        ))
        .into());
    }
    if bundle_config.steps.is_empty() {
        return Err(NipoppyError::config(format!(
            "bundle config {} declares no steps",
            config_path.display()
        ))
        .into());
    }
    if pipeline_type != PipelineType::Extraction && !bundle_config.proc_dependencies.is_empty() {
        return Err(NipoppyError::config(format!(
            "bundle config {} declares PROC_DEPENDENCIES but is not an extraction pipeline",
            config_path.display()
        ))
        .into());
    }

    // Tokens an invocation may reference: built-ins, dataset-wide
    // substitutions, and this bundle's declared pipeline variables.
    let mut allowed: Vec<String> = BUILTIN_TOKENS.iter().map(|t| t.to_string()).collect();
    allowed.extend(config.substitutions.keys().cloned());
    allowed.extend(
        config
            .pipeline_variables
            .declared(pipeline_type, name, version),
    );

    let mut steps = Vec::with_capacity(bundle_config.steps.len());
    for step_config in &bundle_config.steps {
        steps.push(load_step(
            pipeline_type,
            dir,
            name,
            version,
            step_config,
            &allowed,
        )?);
    }

    if let Some(info) = &bundle_config.container_info {
        check_tokens(
            &info.fpath,
            &["PIPELINE_NAME".to_string(), "PIPELINE_VERSION".to_string()],
            &format!("container path of bundle {name} {version}"),
        )?;
    }

    Ok(PipelineBundle {
        pipeline_type,
        name: name.to_string(),
        version: version.to_string(),
        dir: dir.to_path_buf(),
        container_fpath: bundle_config.container_info.as_ref().map(|i| i.fpath.clone()),
        container_uri: bundle_config
            .container_info
            .as_ref()
            .and_then(|i| i.uri.clone()),
        container_config: bundle_config.container_config,
        steps,
        proc_dependencies: bundle_config.proc_dependencies,
    })
}

fn load_step(
    pipeline_type: PipelineType,
    dir: &Path,
    name: &str,
    version: &str,
    step_config: &StepConfig,
    allowed_tokens: &[String],
) -> Result<PipelineStep> {
    let resolve = |file: &PathBuf| -> Result<PathBuf> {
        let path = dir.join(file);
        if !path.is_file() {
            return Err(NipoppyError::config(format!(
                "bundle {name} {version} step {} references missing file {}",
                step_config.name,
                path.display()
            ))
            .into());
        }
        Ok(path)
    };

    let descriptor = Descriptor::load(&resolve(&step_config.descriptor_file)?)?;
    let invocation = load_invocation(&resolve(&step_config.invocation_file)?)?;
    validate_invocation(&descriptor, &invocation).with_context(|| {
        format!(
            "invocation of bundle {name} {version} step {}",
            step_config.name
        )
    })?;

    // Every token an invocation references must be resolvable at unit time.
    let invocation_value = serde_json::to_value(&invocation).expect("map serializes");
    for token in subst::referenced_tokens_in_value(&invocation_value) {
        if !allowed_tokens.contains(&token) {
            return Err(NipoppyError::config(format!(
                "invocation of bundle {name} {version} step {} references unknown \
                 pipeline variable [[{token}]]",
                step_config.name
            ))
            .into());
        }
    }

    let tracker = match &step_config.tracker_config_file {
        Some(file) => {
            if pipeline_type != PipelineType::Processing {
                return Err(NipoppyError::config(format!(
                    "bundle {name} {version} step {} declares a tracker but is not a \
                     processing pipeline",
                    step_config.name
                ))
                .into());
            }
            Some(TrackerConfig::load(&resolve(file)?)?)
        }
        None => None,
    };

    let ignore_patterns = match &step_config.pybids_ignore_file {
        Some(file) => {
            let path = resolve(file)?;
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<Vec<String>>(&content).map_err(|e| {
                NipoppyError::config(format!(
                    "malformed ignore list {}: {e}",
                    path.display()
                ))
            })?
        }
        None => Vec::new(),
    };

    let hpc = match &step_config.hpc_config_file {
        Some(file) => Some(HpcConfig::load(&resolve(file)?)?),
        None => None,
    };

    Ok(PipelineStep {
        name: step_config.name.clone(),
        descriptor,
        invocation,
        tracker,
        ignore_patterns,
        hpc,
        generate_bids_db: step_config
            .generate_pybids_database
            .unwrap_or(pipeline_type == PipelineType::Processing),
        update_status: step_config.update_status.unwrap_or(true),
    })
}

fn check_tokens(input: &str, extra_allowed: &[String], what: &str) -> Result<()> {
    for token in subst::referenced_tokens(input) {
        let builtin = BUILTIN_TOKENS.contains(&token.as_str());
        if !builtin && !extra_allowed.contains(&token) {
            return Err(NipoppyError::config(format!(
                "{what} references unknown variable [[{token}]]"
            ))
            .into());
        }
    }
    Ok(())
}

/// Numeric-aware version comparison: dot/non-digit separated segments
/// compare numerically where both sides are numeric, lexically otherwise.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(|c: char| !c.is_ascii_alphanumeric())
            .map(str::to_string)
            .collect()
    };
    let (a_parts, b_parts) = (split(a), split(b));
    for (x, y) in a_parts.iter().zip(b_parts.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(xn), Ok(yn)) => xn.cmp(&yn),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a_parts.len().cmp(&b_parts.len())
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::error::{NipoppyError, error_kind};

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, content).expect("write");
    }

    fn descriptor_json() -> &'static str {
        r#"{
            "name": "mriqc",
            "tool-version": "23.1.0",
            "command-line": "[CMD] [BIDS_DIR] [OUT_DIR]",
            "inputs": [
                {"id": "command", "type": "String", "value-key": "[CMD]"},
                {"id": "bids_dir", "type": "File", "value-key": "[BIDS_DIR]"},
                {"id": "out_dir", "type": "File", "value-key": "[OUT_DIR]"}
            ]
        }"#
    }

    fn invocation_json() -> &'static str {
        r#"{
            "command": "[[CONTAINER_COMMAND]] [[FPATH_CONTAINER]] mriqc",
            "bids_dir": "[[DPATH_BIDS]]",
            "out_dir": "[[DPATH_PIPELINE_OUTPUT]]"
        }"#
    }

    fn install_bundle(root: &Path, pipeline_type: &str, name: &str, version: &str) {
        let dir = root
            .join("pipelines")
            .join(pipeline_type)
            .join(name)
            .join(version);
        write_file(&dir.join("descriptor.json"), descriptor_json());
        write_file(&dir.join("invocation.json"), invocation_json());
        write_file(
            &dir.join("tracker.json"),
            r#"{"PATHS": ["[[BIDS_PARTICIPANT_ID]]/[[BIDS_SESSION_ID]]/**/*.json"]}"#,
        );
        let tracker_line = if pipeline_type == "processing" {
            r#""TRACKER_CONFIG_FILE": "tracker.json","#
        } else {
            ""
        };
        write_file(
            &dir.join(BUNDLE_CONFIG_FILE),
            &format!(
                r#"{{
                    "NAME": "{name}",
                    "VERSION": "{version}",
                    "CONTAINER_INFO": {{
                        "FPATH": "containers/[[PIPELINE_NAME]]_[[PIPELINE_VERSION]].sif",
                        "URI": "docker://example/{name}:{version}"
                    }},
                    "STEPS": [{{
                        {tracker_line}
                        "DESCRIPTOR_FILE": "descriptor.json",
                        "INVOCATION_FILE": "invocation.json"
                    }}]
                }}"#
            ),
        );
    }

    fn dataset() -> (TempDir, Layout, GlobalConfig) {
        let td = tempdir().expect("tempdir");
        let layout = Layout::new(td.path());
        layout.create_all().expect("create layout");
        let config = GlobalConfig::new("demo", vec!["BL".to_string()]);
        (td, layout, config)
    }

    #[test]
    fn discover_finds_installed_bundles() {
        let (td, layout, config) = dataset();
        install_bundle(td.path(), "processing", "mriqc", "23.1.0");
        install_bundle(td.path(), "processing", "mriqc", "24.0.0");
        install_bundle(td.path(), "bidsification", "dcm2bids", "3.1.0");

        let catalog = PipelineCatalog::discover(&layout, &config).expect("discover");
        assert_eq!(catalog.list(None, None).len(), 3);
        assert_eq!(catalog.list(Some(PipelineType::Processing), None).len(), 2);
        assert_eq!(
            catalog.list(Some(PipelineType::Processing), Some("mriqc")).len(),
            2
        );

        let bundle = catalog
            .get(PipelineType::Processing, "mriqc", "23.1.0")
            .expect("bundle");
        assert_eq!(bundle.steps.len(), 1);
        assert_eq!(bundle.steps[0].name, DEFAULT_STEP_NAME);
        assert!(bundle.steps[0].tracker.is_some());
        assert!(bundle.steps[0].generate_bids_db);
    }

    #[test]
    fn latest_version_is_numeric_aware() {
        let (td, layout, config) = dataset();
        install_bundle(td.path(), "processing", "mriqc", "9.1.0");
        install_bundle(td.path(), "processing", "mriqc", "23.1.0");

        let catalog = PipelineCatalog::discover(&layout, &config).expect("discover");
        assert_eq!(
            catalog.latest_version(PipelineType::Processing, "mriqc"),
            Some("23.1.0")
        );
    }

    #[test]
    fn resolve_defaults_to_latest_version_and_first_step() {
        let (td, layout, config) = dataset();
        install_bundle(td.path(), "processing", "mriqc", "23.1.0");
        install_bundle(td.path(), "processing", "mriqc", "24.0.0");

        let catalog = PipelineCatalog::discover(&layout, &config).expect("discover");
        let (bundle, step) = catalog
            .resolve(PipelineType::Processing, &PipelineSelector::new("mriqc"))
            .expect("resolve");
        assert_eq!(bundle.version, "24.0.0");
        assert_eq!(step.name, DEFAULT_STEP_NAME);
    }

    #[test]
    fn missing_bundle_is_a_config_error() {
        let (_td, layout, config) = dataset();
        let catalog = PipelineCatalog::discover(&layout, &config).expect("discover");
        let err = catalog
            .get(PipelineType::Processing, "mriqc", "23.1.0")
            .expect_err("missing");
        assert!(matches!(error_kind(&err), Some(NipoppyError::Config(_))));
    }

    #[test]
    fn missing_referenced_file_is_a_config_error() {
        let (td, layout, config) = dataset();
        install_bundle(td.path(), "processing", "mriqc", "23.1.0");
        fs::remove_file(
            td.path()
                .join("pipelines/processing/mriqc/23.1.0/invocation.json"),
        )
        .expect("remove");

        let err = PipelineCatalog::discover(&layout, &config).expect_err("missing file");
        assert!(matches!(error_kind(&err), Some(NipoppyError::Config(_))));
        assert!(err.to_string().contains("invocation.json"));
    }

    #[test]
    fn unknown_invocation_token_is_rejected() {
        let (td, layout, config) = dataset();
        install_bundle(td.path(), "processing", "mriqc", "23.1.0");
        write_file(
            &td.path()
                .join("pipelines/processing/mriqc/23.1.0/invocation.json"),
            r#"{
                "command": "mriqc",
                "bids_dir": "[[DPATH_BIDS]]",
                "out_dir": "[[NOT_A_VARIABLE]]"
            }"#,
        );

        let err = PipelineCatalog::discover(&layout, &config).expect_err("unknown token");
        assert!(err.to_string().contains("NOT_A_VARIABLE"));
    }

    #[test]
    fn declared_pipeline_variable_tokens_are_accepted() {
        let (td, layout, mut config) = dataset();
        install_bundle(td.path(), "processing", "fmriprep", "24.1.1");
        write_file(
            &td.path()
                .join("pipelines/processing/fmriprep/24.1.1/invocation.json"),
            r#"{
                "command": "fmriprep",
                "bids_dir": "[[DPATH_BIDS]]",
                "out_dir": "[[FS_LICENSE]]"
            }"#,
        );
        config
            .pipeline_variables
            .processing
            .entry("fmriprep".to_string())
            .or_default()
            .entry("24.1.1".to_string())
            .or_default()
            .insert("FS_LICENSE".to_string(), None);

        PipelineCatalog::discover(&layout, &config).expect("declared variable accepted");
    }

    #[test]
    fn tracker_on_non_processing_bundle_is_rejected() {
        let (td, layout, config) = dataset();
        install_bundle(td.path(), "bidsification", "dcm2bids", "3.1.0");
        let dir = td.path().join("pipelines/bidsification/dcm2bids/3.1.0");
        write_file(
            &dir.join(BUNDLE_CONFIG_FILE),
            r#"{
                "NAME": "dcm2bids",
                "VERSION": "3.1.0",
                "STEPS": [{
                    "DESCRIPTOR_FILE": "descriptor.json",
                    "INVOCATION_FILE": "invocation.json",
                    "TRACKER_CONFIG_FILE": "tracker.json"
                }]
            }"#,
        );

        let err = PipelineCatalog::discover(&layout, &config).expect_err("tracker misuse");
        assert!(err.to_string().contains("not a processing pipeline"));
    }

    #[test]
    fn mismatched_install_location_is_rejected() {
        let (td, layout, config) = dataset();
        install_bundle(td.path(), "processing", "mriqc", "23.1.0");
        // Installed under 23.1.0 but claiming 99.0.0.
        let dir = td.path().join("pipelines/processing/mriqc/23.1.0");
        let content = fs::read_to_string(dir.join(BUNDLE_CONFIG_FILE)).expect("read");
        write_file(
            &dir.join(BUNDLE_CONFIG_FILE),
            &content.replace("\"VERSION\": \"23.1.0\"", "\"VERSION\": \"99.0.0\""),
        );

        let err = PipelineCatalog::discover(&layout, &config).expect_err("mismatch");
        assert!(err.to_string().contains("installed as"));
    }

    #[test]
    fn uninitialized_pipeline_store_is_distinguishable() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::new(td.path());
        let config = GlobalConfig::new("demo", vec!["BL".to_string()]);
        let err = PipelineCatalog::discover(&layout, &config).expect_err("no store");
        assert!(matches!(
            error_kind(&err),
            Some(NipoppyError::NotInitialized(_))
        ));
    }

    #[test]
    fn version_comparison_orders_numerically() {
        assert_eq!(compare_versions("9.1.0", "23.1.0"), Ordering::Less);
        assert_eq!(compare_versions("23.1.0", "23.1.0"), Ordering::Equal);
        assert_eq!(compare_versions("24.0.0", "23.1.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0rc1", "1.0.0"), Ordering::Greater);
    }
}
