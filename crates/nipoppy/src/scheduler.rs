//! Work-unit enumeration.
//!
//! One entry point per action: given the manifest, the curation status
//! and (for processing/extraction/tracking) the processing status, yield
//! the outstanding (participant, session, pipeline, version, step) units
//! in a deterministic order — manifest row order, then session order as
//! it first appears in the manifest. The resulting plan carries a SHA-256
//! identifier so re-plans over unchanged state are recognizable, and can
//! be rendered as a table for external parallelizers (write-list mode).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::catalog::PipelineCatalog;
use crate::error::NipoppyError;
use crate::layout::{Layout, ensure_dir};
use crate::tables::{
    TableKind, TableStore, TsvTable, atomic_write, curation_rows, manifest_rows, processing_rows,
};
use crate::types::{
    Action, CurationRow, PipelineSelector, ProcStatus, ProcessingRow, WorkPlan, WorkUnit,
    CURRENT_PLAN_VERSION,
};

/// Participant/session restriction applied before enumeration.
#[derive(Debug, Clone, Default)]
pub struct UnitFilter {
    pub participant_id: Option<String>,
    pub session_id: Option<String>,
}

impl UnitFilter {
    pub fn none() -> Self {
        Self::default()
    }

    fn matches(&self, participant_id: &str, session_id: &str) -> bool {
        self.participant_id
            .as_deref()
            .is_none_or(|p| p == participant_id)
            && self.session_id.as_deref().is_none_or(|s| s == session_id)
    }
}

/// Enumerate the outstanding work units for one action.
pub fn build_plan(
    layout: &Layout,
    catalog: &PipelineCatalog,
    action: Action,
    selector: Option<&PipelineSelector>,
    filter: &UnitFilter,
) -> Result<WorkPlan> {
    if action == Action::TrackCuration {
        return Err(NipoppyError::planning(
            "track-curation walks the filesystem and does not enumerate work units",
        )
        .into());
    }

    let store = TableStore::new(layout);
    let manifest = manifest_rows(&store.load(TableKind::Manifest)?)?;
    let curation = curation_rows(&store.load(TableKind::CurationStatus)?)?;
    let curation_by_key: BTreeMap<(String, String), &CurationRow> = curation
        .iter()
        .map(|row| ((row.participant_id.clone(), row.session_id.clone()), row))
        .collect();

    // Deterministic pair order: manifest row order, then session order as
    // it first appears; a (participant, session) pair yields once.
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    for row in &manifest {
        if !row.has_session() {
            continue;
        }
        let pair = (row.participant_id.clone(), row.session_id.clone());
        if filter.matches(&pair.0, &pair.1) && seen.insert(pair.clone()) {
            pairs.push(pair);
        }
    }

    let curation_for = |pair: &(String, String)| curation_by_key.get(pair).copied();

    let units: Vec<WorkUnit> = match action {
        Action::Reorg => pairs
            .iter()
            .filter(|pair| {
                curation_for(pair)
                    .is_some_and(|row| row.in_pre_reorg && !row.in_post_reorg)
            })
            .map(|(participant_id, session_id)| WorkUnit {
                participant_id: participant_id.clone(),
                session_id: session_id.clone(),
                pipeline: None,
            })
            .collect(),

        Action::Bidsify | Action::Process | Action::TrackProcessing | Action::Extract => {
            let pipeline_type = action.pipeline_type().expect("pipeline action");
            let selector = selector.ok_or_else(|| {
                NipoppyError::planning(format!("action {action} requires a pipeline selector"))
            })?;
            let (bundle, step) = catalog.resolve(pipeline_type, selector)?;
            let pipeline = bundle.pipeline_ref(step);

            let processing = match action {
                Action::Bidsify => Vec::new(),
                _ => processing_rows(&store.load(TableKind::ProcessingStatus)?)?,
            };

            let keep = |pair: &(String, String)| -> bool {
                match action {
                    Action::Bidsify => curation_for(pair)
                        .is_some_and(|row| row.in_post_reorg && !row.in_bids),
                    Action::Process => {
                        curation_for(pair).is_some_and(|row| row.in_bids)
                            && !has_success(&processing, pair, &pipeline)
                    }
                    Action::TrackProcessing => {
                        curation_for(pair).is_some_and(|row| row.in_bids)
                    }
                    Action::Extract => bundle
                        .proc_dependencies
                        .iter()
                        .all(|dep| {
                            processing.iter().any(|row| {
                                row.participant_id == pair.0
                                    && row.session_id == pair.1
                                    && row.pipeline_name == dep.name
                                    && row.pipeline_version == dep.version
                                    && dep
                                        .step
                                        .as_deref()
                                        .is_none_or(|s| s == row.pipeline_step)
                                    && row.status == ProcStatus::Success
                            })
                        }),
                    _ => unreachable!("non-pipeline actions handled above"),
                }
            };

            pairs
                .iter()
                .filter(|pair| keep(pair))
                .map(|(participant_id, session_id)| WorkUnit {
                    participant_id: participant_id.clone(),
                    session_id: session_id.clone(),
                    pipeline: Some(pipeline.clone()),
                })
                .collect()
        }

        Action::TrackCuration => unreachable!("rejected above"),
    };

    let plan_id = compute_plan_id(action, &units);
    Ok(WorkPlan {
        plan_version: CURRENT_PLAN_VERSION.to_string(),
        plan_id,
        created_at: Utc::now(),
        action,
        units,
    })
}

fn has_success(
    processing: &[ProcessingRow],
    pair: &(String, String),
    pipeline: &crate::types::PipelineRef,
) -> bool {
    processing.iter().any(|row| {
        row.participant_id == pair.0
            && row.session_id == pair.1
            && row.pipeline_name == pipeline.name
            && row.pipeline_version == pipeline.version
            && row.pipeline_step == pipeline.step
            && row.status == ProcStatus::Success
    })
}

fn compute_plan_id(action: Action, units: &[WorkUnit]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.as_str().as_bytes());
    hasher.update(b"\n");
    for unit in units {
        hasher.update(unit.key().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Render a plan as a table for external parallelizers.
pub fn plan_table(plan: &WorkPlan) -> TsvTable {
    let columns = [
        "participant_id",
        "session_id",
        "pipeline_name",
        "pipeline_version",
        "pipeline_step",
    ];
    TsvTable {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows: plan
            .units
            .iter()
            .map(|unit| {
                let (name, version, step) = match &unit.pipeline {
                    Some(p) => (p.name.clone(), p.version.clone(), p.step.clone()),
                    None => (String::new(), String::new(), String::new()),
                };
                vec![
                    unit.participant_id.clone(),
                    unit.session_id.clone(),
                    name,
                    version,
                    step,
                ]
            })
            .collect(),
    }
}

/// Persist the plan table under the work area (write-list mode).
pub fn write_plan(layout: &Layout, plan: &WorkPlan) -> Result<PathBuf> {
    let dir = layout.dpath_work()?.join("plans");
    ensure_dir(&dir)?;
    let path = dir.join(format!("{}-{}.tsv", plan.action, &plan.plan_id[..12]));
    let content = plan_table(plan).render()?;
    atomic_write(&path, content.as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::config::GlobalConfig;
    use crate::error::{NipoppyError, error_kind};
    use crate::tables::{curation_table, processing_table};
    use crate::types::{PipelineRef, PipelineType};

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, content).expect("write");
    }

    fn install_minimal_bundle(root: &Path, pipeline_type: &str, name: &str, version: &str) {
        let dir = root
            .join("pipelines")
            .join(pipeline_type)
            .join(name)
            .join(version);
        write_file(
            &dir.join("descriptor.json"),
            r#"{
                "name": "tool",
                "tool-version": "1.0",
                "command-line": "[CMD]",
                "inputs": [{"id": "command", "type": "String", "value-key": "[CMD]"}]
            }"#,
        );
        write_file(&dir.join("invocation.json"), r#"{"command": "echo unit"}"#);
        write_file(
            &dir.join("config.json"),
            &format!(
                r#"{{
                    "NAME": "{name}",
                    "VERSION": "{version}",
                    "STEPS": [{{
                        "DESCRIPTOR_FILE": "descriptor.json",
                        "INVOCATION_FILE": "invocation.json"
                    }}]
                }}"#
            ),
        );
    }

    fn curation_row(
        participant_id: &str,
        session_id: &str,
        in_pre: bool,
        in_post: bool,
        in_bids: bool,
    ) -> CurationRow {
        CurationRow {
            participant_id: participant_id.to_string(),
            session_id: session_id.to_string(),
            in_manifest: true,
            participant_dicom_dir: None,
            in_pre_reorg: in_pre,
            in_post_reorg: in_post,
            in_bids,
        }
    }

    struct Fixture {
        _td: TempDir,
        layout: Layout,
        catalog: PipelineCatalog,
    }

    fn fixture(manifest: &str, curation: &[CurationRow]) -> Fixture {
        let td = tempdir().expect("tempdir");
        let layout = Layout::new(td.path());
        layout.create_all().expect("create layout");
        write_file(&td.path().join("manifest.tsv"), manifest);
        install_minimal_bundle(td.path(), "processing", "mriqc", "23.1.0");
        install_minimal_bundle(td.path(), "bidsification", "dcm2bids", "3.1.0");
        install_minimal_bundle(td.path(), "extraction", "idp", "1.0.0");

        let store = TableStore::new(&layout);
        store
            .save(TableKind::CurationStatus, &curation_table(curation))
            .expect("save curation");

        let config = GlobalConfig::new("demo", vec!["BL".to_string()]);
        let catalog = PipelineCatalog::discover(&layout, &config).expect("discover");
        Fixture {
            _td: td,
            layout,
            catalog,
        }
    }

    const MANIFEST: &str = "participant_id\tvisit_id\tsession_id\tdatatype\n\
                            P01\tBL\tBL\t['anat']\n\
                            P01\tM12\t\t[]\n\
                            P02\tBL\tBL\t['anat']\n\
                            P03\tBL\tBL\t['anat']\n";

    fn mriqc_ref() -> PipelineRef {
        PipelineRef {
            pipeline_type: PipelineType::Processing,
            name: "mriqc".to_string(),
            version: "23.1.0".to_string(),
            step: "default".to_string(),
        }
    }

    fn selector() -> PipelineSelector {
        PipelineSelector {
            name: "mriqc".to_string(),
            version: Some("23.1.0".to_string()),
            step: None,
        }
    }

    #[test]
    fn reorg_yields_pre_but_not_post() {
        let fx = fixture(
            MANIFEST,
            &[
                curation_row("P01", "BL", true, false, false),
                curation_row("P02", "BL", true, true, false),
                curation_row("P03", "BL", false, false, false),
            ],
        );
        let plan = build_plan(
            &fx.layout,
            &fx.catalog,
            Action::Reorg,
            None,
            &UnitFilter::none(),
        )
        .expect("plan");
        let keys: Vec<String> = plan.units.iter().map(|u| u.key()).collect();
        assert_eq!(keys, vec!["P01/BL"]);
    }

    #[test]
    fn bidsify_yields_post_but_not_bids() {
        let fx = fixture(
            MANIFEST,
            &[
                curation_row("P01", "BL", true, true, true),
                curation_row("P02", "BL", true, true, false),
            ],
        );
        let plan = build_plan(
            &fx.layout,
            &fx.catalog,
            Action::Bidsify,
            Some(&PipelineSelector::new("dcm2bids")),
            &UnitFilter::none(),
        )
        .expect("plan");
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].participant_id, "P02");
        let pipeline = plan.units[0].pipeline.as_ref().expect("pipeline");
        assert_eq!(pipeline.name, "dcm2bids");
        assert_eq!(pipeline.version, "3.1.0");
        assert_eq!(pipeline.step, "default");
    }

    #[test]
    fn process_skips_units_with_success_but_not_fail() {
        let fx = fixture(
            MANIFEST,
            &[
                curation_row("P01", "BL", true, true, true),
                curation_row("P02", "BL", true, true, true),
                curation_row("P03", "BL", true, true, true),
            ],
        );
        let store = TableStore::new(&fx.layout);
        store
            .save(
                TableKind::ProcessingStatus,
                &processing_table(&[
                    ProcessingRow::new("P01", "BL", &mriqc_ref(), ProcStatus::Success),
                    ProcessingRow::new("P02", "BL", &mriqc_ref(), ProcStatus::Fail),
                ]),
            )
            .expect("save");

        let plan = build_plan(
            &fx.layout,
            &fx.catalog,
            Action::Process,
            Some(&selector()),
            &UnitFilter::none(),
        )
        .expect("plan");
        let participants: Vec<&str> = plan
            .units
            .iter()
            .map(|u| u.participant_id.as_str())
            .collect();
        assert_eq!(participants, vec!["P02", "P03"]);
    }

    #[test]
    fn track_processing_yields_all_bids_units() {
        let fx = fixture(
            MANIFEST,
            &[
                curation_row("P01", "BL", true, true, true),
                curation_row("P02", "BL", true, true, false),
            ],
        );
        let store = TableStore::new(&fx.layout);
        store
            .save(
                TableKind::ProcessingStatus,
                &processing_table(&[ProcessingRow::new(
                    "P01",
                    "BL",
                    &mriqc_ref(),
                    ProcStatus::Success,
                )]),
            )
            .expect("save");

        let plan = build_plan(
            &fx.layout,
            &fx.catalog,
            Action::TrackProcessing,
            Some(&selector()),
            &UnitFilter::none(),
        )
        .expect("plan");
        // Prior SUCCESS does not exclude: the tracker re-evaluates.
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].participant_id, "P01");
    }

    #[test]
    fn extract_requires_success_in_all_declared_dependencies() {
        let fx = fixture(
            MANIFEST,
            &[
                curation_row("P01", "BL", true, true, true),
                curation_row("P02", "BL", true, true, true),
            ],
        );
        // Declare a processing dependency for the extraction bundle.
        let dir = fx.layout.root().join("pipelines/extraction/idp/1.0.0");
        write_file(
            &dir.join("config.json"),
            r#"{
                "NAME": "idp",
                "VERSION": "1.0.0",
                "STEPS": [{
                    "DESCRIPTOR_FILE": "descriptor.json",
                    "INVOCATION_FILE": "invocation.json"
                }],
                "PROC_DEPENDENCIES": [{"NAME": "mriqc", "VERSION": "23.1.0"}]
            }"#,
        );
        let config = GlobalConfig::new("demo", vec!["BL".to_string()]);
        let catalog = PipelineCatalog::discover(&fx.layout, &config).expect("discover");

        let store = TableStore::new(&fx.layout);
        store
            .save(
                TableKind::ProcessingStatus,
                &processing_table(&[
                    ProcessingRow::new("P01", "BL", &mriqc_ref(), ProcStatus::Success),
                    ProcessingRow::new("P02", "BL", &mriqc_ref(), ProcStatus::Fail),
                ]),
            )
            .expect("save");

        let plan = build_plan(
            &fx.layout,
            &catalog,
            Action::Extract,
            Some(&PipelineSelector::new("idp")),
            &UnitFilter::none(),
        )
        .expect("plan");
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].participant_id, "P01");
    }

    #[test]
    fn filters_restrict_before_enumeration() {
        let fx = fixture(
            MANIFEST,
            &[
                curation_row("P01", "BL", true, false, false),
                curation_row("P02", "BL", true, false, false),
            ],
        );
        let filter = UnitFilter {
            participant_id: Some("P02".to_string()),
            session_id: None,
        };
        let plan = build_plan(&fx.layout, &fx.catalog, Action::Reorg, None, &filter)
            .expect("plan");
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].participant_id, "P02");
    }

    #[test]
    fn ordering_follows_the_manifest_and_plans_are_reproducible() {
        let manifest = "participant_id\tvisit_id\tsession_id\tdatatype\n\
                        P03\tBL\tBL\t[]\n\
                        P01\tBL\tBL\t[]\n\
                        P02\tBL\tBL\t[]\n";
        let fx = fixture(
            manifest,
            &[
                curation_row("P01", "BL", true, false, false),
                curation_row("P02", "BL", true, false, false),
                curation_row("P03", "BL", true, false, false),
            ],
        );
        let plan_a = build_plan(
            &fx.layout,
            &fx.catalog,
            Action::Reorg,
            None,
            &UnitFilter::none(),
        )
        .expect("plan");
        let plan_b = build_plan(
            &fx.layout,
            &fx.catalog,
            Action::Reorg,
            None,
            &UnitFilter::none(),
        )
        .expect("plan");

        let participants: Vec<&str> = plan_a
            .units
            .iter()
            .map(|u| u.participant_id.as_str())
            .collect();
        assert_eq!(participants, vec!["P03", "P01", "P02"]);
        assert_eq!(plan_a.plan_id, plan_b.plan_id);
    }

    #[test]
    fn missing_selector_for_pipeline_action_is_a_planning_error() {
        let fx = fixture(MANIFEST, &[curation_row("P01", "BL", true, true, true)]);
        let err = build_plan(
            &fx.layout,
            &fx.catalog,
            Action::Process,
            None,
            &UnitFilter::none(),
        )
        .expect_err("no selector");
        assert!(matches!(error_kind(&err), Some(NipoppyError::Planning(_))));
    }

    #[test]
    fn missing_manifest_fails_enumeration() {
        let fx = fixture(MANIFEST, &[]);
        fs::remove_file(fx.layout.root().join("manifest.tsv")).expect("remove");
        let err = build_plan(
            &fx.layout,
            &fx.catalog,
            Action::Reorg,
            None,
            &UnitFilter::none(),
        )
        .expect_err("no manifest");
        assert!(matches!(error_kind(&err), Some(NipoppyError::Planning(_))));
    }

    #[test]
    fn write_plan_emits_the_unit_table() {
        let fx = fixture(
            MANIFEST,
            &[
                curation_row("P01", "BL", true, true, true),
                curation_row("P02", "BL", true, true, true),
            ],
        );
        let plan = build_plan(
            &fx.layout,
            &fx.catalog,
            Action::Process,
            Some(&selector()),
            &UnitFilter::none(),
        )
        .expect("plan");
        let path = write_plan(&fx.layout, &plan).expect("write");
        let content = fs::read_to_string(&path).expect("read");
        assert!(content.starts_with(
            "participant_id\tsession_id\tpipeline_name\tpipeline_version\tpipeline_step\n"
        ));
        assert!(content.contains("P01\tBL\tmriqc\t23.1.0\tdefault"));
        assert!(content.contains("P02\tBL\tmriqc\t23.1.0\tdefault"));
    }
}
