use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NipoppyError;

/// The BIDS prefix carried by participant directories and filenames.
pub const BIDS_PARTICIPANT_PREFIX: &str = "sub-";
/// The BIDS prefix carried by session directories and filenames.
pub const BIDS_SESSION_PREFIX: &str = "ses-";

/// The three closed pipeline variants. Each has a fixed capability set:
/// only processing pipelines carry trackers and BIDS indexes, only
/// extraction pipelines declare upstream processing dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    Bidsification,
    Processing,
    Extraction,
}

impl PipelineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bidsification => "bidsification",
            Self::Processing => "processing",
            Self::Extraction => "extraction",
        }
    }

    pub const ALL: [PipelineType; 3] = [
        Self::Bidsification,
        Self::Processing,
        Self::Extraction,
    ];
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion status of one (participant, session, pipeline, version, step)
/// unit, as derived from filesystem observations by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcStatus {
    Success,
    Fail,
    Unavailable,
    Incomplete,
}

impl ProcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::Unavailable => "UNAVAILABLE",
            Self::Incomplete => "INCOMPLETE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAIL" => Ok(Self::Fail),
            "UNAVAILABLE" => Ok(Self::Unavailable),
            "INCOMPLETE" => Ok(Self::Incomplete),
            other => Err(NipoppyError::planning(format!(
                "unrecognized processing status {other:?}"
            ))
            .into()),
        }
    }
}

impl fmt::Display for ProcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The actions the scheduler can plan for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Reorg,
    Bidsify,
    Process,
    Extract,
    TrackCuration,
    TrackProcessing,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reorg => "reorg",
            Self::Bidsify => "bidsify",
            Self::Process => "process",
            Self::Extract => "extract",
            Self::TrackCuration => "track-curation",
            Self::TrackProcessing => "track-processing",
        }
    }

    /// The pipeline variant this action selects from, if any.
    pub fn pipeline_type(&self) -> Option<PipelineType> {
        match self {
            Self::Reorg | Self::TrackCuration => None,
            Self::Bidsify => Some(PipelineType::Bidsification),
            Self::Process | Self::TrackProcessing => Some(PipelineType::Processing),
            Self::Extract => Some(PipelineType::Extraction),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller-side pipeline choice. Version and step fall back to the
/// catalog's latest version and the bundle's first step when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSelector {
    pub name: String,
    pub version: Option<String>,
    pub step: Option<String>,
}

impl PipelineSelector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            step: None,
        }
    }
}

/// A fully resolved pipeline reference carried by a work unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRef {
    pub pipeline_type: PipelineType,
    pub name: String,
    pub version: String,
    pub step: String,
}

/// One manifest row. Authored externally; read-only to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub participant_id: String,
    pub visit_id: String,
    /// Empty for visits without an imaging session.
    pub session_id: String,
    pub datatype: Vec<String>,
}

impl ManifestRow {
    /// Whether this visit has an imaging session at all.
    pub fn has_session(&self) -> bool {
        !self.session_id.is_empty()
    }
}

/// One curation status row, keyed on (participant_id, session_id).
/// Fully regenerable from the manifest and the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurationRow {
    pub participant_id: String,
    pub session_id: String,
    pub in_manifest: bool,
    pub participant_dicom_dir: Option<String>,
    pub in_pre_reorg: bool,
    pub in_post_reorg: bool,
    pub in_bids: bool,
}

/// One processing status row, keyed on
/// (participant_id, session_id, pipeline_name, pipeline_version, pipeline_step).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRow {
    pub participant_id: String,
    pub bids_participant_id: String,
    pub session_id: String,
    pub bids_session_id: String,
    pub pipeline_name: String,
    pub pipeline_version: String,
    pub pipeline_step: String,
    pub status: ProcStatus,
}

impl ProcessingRow {
    pub fn new(
        participant_id: &str,
        session_id: &str,
        pipeline: &PipelineRef,
        status: ProcStatus,
    ) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            bids_participant_id: bids_participant_id(participant_id),
            session_id: session_id.to_string(),
            bids_session_id: bids_session_id(session_id),
            pipeline_name: pipeline.name.clone(),
            pipeline_version: pipeline.version.clone(),
            pipeline_step: pipeline.step.clone(),
            status,
        }
    }
}

/// A single schedulable execution. Ephemeral: constructed by the scheduler,
/// materialized (work directory, log file, resolved command) by the runner,
/// discarded after the runner returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub participant_id: String,
    pub session_id: String,
    /// `None` for reorg units, which run the built-in DICOM reorganization
    /// rather than a catalog pipeline.
    pub pipeline: Option<PipelineRef>,
}

impl WorkUnit {
    /// Stable textual key used for plan hashing and display.
    pub fn key(&self) -> String {
        match &self.pipeline {
            Some(p) => format!(
                "{}/{}/{}/{}/{}",
                self.participant_id, self.session_id, p.name, p.version, p.step
            ),
            None => format!("{}/{}", self.participant_id, self.session_id),
        }
    }
}

/// Current plan schema version.
pub const CURRENT_PLAN_VERSION: &str = "nipoppy.plan.v1";

/// An ordered, deterministic set of outstanding work units for one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPlan {
    pub plan_version: String,
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub action: Action,
    pub units: Vec<WorkUnit>,
}

/// The outcome of one locally executed unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub exit_code: i32,
    pub log_path: std::path::PathBuf,
}

impl UnitOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Prefix the participant id for filesystem and substitution use.
pub fn bids_participant_id(participant_id: &str) -> String {
    format!("{BIDS_PARTICIPANT_PREFIX}{participant_id}")
}

/// Prefix the session id for filesystem and substitution use.
pub fn bids_session_id(session_id: &str) -> String {
    format!("{BIDS_SESSION_PREFIX}{session_id}")
}

/// Participant ids are non-empty, alphanumeric, and carried without the
/// `sub-` prefix in the tables.
pub fn validate_participant_id(participant_id: &str) -> Result<()> {
    if participant_id.is_empty() {
        return Err(NipoppyError::planning("participant_id must not be empty").into());
    }
    if participant_id.starts_with(BIDS_PARTICIPANT_PREFIX) {
        return Err(NipoppyError::planning(format!(
            "participant_id {participant_id:?} must not carry the {BIDS_PARTICIPANT_PREFIX:?} prefix"
        ))
        .into());
    }
    if !participant_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(NipoppyError::planning(format!(
            "participant_id {participant_id:?} must be alphanumeric"
        ))
        .into());
    }
    Ok(())
}

/// Session ids are empty, or alphanumeric without the `ses-` prefix.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() {
        return Ok(());
    }
    if session_id.starts_with(BIDS_SESSION_PREFIX) {
        return Err(NipoppyError::planning(format!(
            "session_id {session_id:?} must not carry the {BIDS_SESSION_PREFIX:?} prefix"
        ))
        .into());
    }
    if !session_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(NipoppyError::planning(format!(
            "session_id {session_id:?} must be alphanumeric"
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_status_roundtrips_through_text() {
        for status in [
            ProcStatus::Success,
            ProcStatus::Fail,
            ProcStatus::Unavailable,
            ProcStatus::Incomplete,
        ] {
            let parsed = ProcStatus::parse(status.as_str()).expect("parse");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn proc_status_serializes_screaming() {
        let json = serde_json::to_string(&ProcStatus::Unavailable).expect("serialize");
        assert_eq!(json, "\"UNAVAILABLE\"");
    }

    #[test]
    fn bids_prefixing_is_plain_concatenation() {
        assert_eq!(bids_participant_id("P01"), "sub-P01");
        assert_eq!(bids_session_id("BL"), "ses-BL");
    }

    #[test]
    fn participant_id_rejects_prefix_and_non_alphanumerics() {
        assert!(validate_participant_id("P01").is_ok());
        assert!(validate_participant_id("").is_err());
        assert!(validate_participant_id("sub-P01").is_err());
        assert!(validate_participant_id("P_01").is_err());
    }

    #[test]
    fn session_id_allows_empty_but_rejects_prefix() {
        assert!(validate_session_id("").is_ok());
        assert!(validate_session_id("BL").is_ok());
        assert!(validate_session_id("ses-BL").is_err());
        assert!(validate_session_id("BL 2").is_err());
    }

    #[test]
    fn work_unit_key_includes_pipeline_coordinates() {
        let unit = WorkUnit {
            participant_id: "P01".to_string(),
            session_id: "BL".to_string(),
            pipeline: Some(PipelineRef {
                pipeline_type: PipelineType::Processing,
                name: "mriqc".to_string(),
                version: "23.1.0".to_string(),
                step: "default".to_string(),
            }),
        };
        assert_eq!(unit.key(), "P01/BL/mriqc/23.1.0/default");
    }

    #[test]
    fn action_maps_to_pipeline_variant() {
        assert_eq!(Action::Bidsify.pipeline_type(), Some(PipelineType::Bidsification));
        assert_eq!(Action::Process.pipeline_type(), Some(PipelineType::Processing));
        assert_eq!(Action::Extract.pipeline_type(), Some(PipelineType::Extraction));
        assert_eq!(Action::Reorg.pipeline_type(), None);
    }
}
