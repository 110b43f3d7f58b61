//! Curation: reconciling the three imaging-stage directories with the
//! manifest.
//!
//! The walker scans pre-reorg (participant-first, session-first, or via a
//! two-column relation file), post-reorg (`sub-<p>/ses-<s>`) and BIDS
//! (`sub-<p>/ses-<s>`), and sets the three stage booleans for every
//! manifest (participant, session). The curation status table is fully
//! regenerable; when not regenerating, rows for pairs no longer in the
//! manifest are preserved so updates stay progressive.
//!
//! DICOM reorganization for a single unit also lives here: it copies the
//! unit's pre-reorg files into the post-reorg tree.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::GlobalConfig;
use crate::error::NipoppyError;
use crate::layout::{Layout, ensure_dir};
use crate::runner::Reporter;
use crate::tables::{
    TableDiff, TableKind, TableStore, curation_table, diff, manifest_rows,
};
use crate::types::{
    CurationRow, bids_participant_id, bids_session_id, BIDS_PARTICIPANT_PREFIX,
    BIDS_SESSION_PREFIX,
};

/// Participant counts per imaging stage, for the status summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurationSummary {
    pub manifest_sessions: usize,
    pub in_pre_reorg: usize,
    pub in_post_reorg: usize,
    pub in_bids: usize,
}

/// Load the optional two-column relation file mapping participant ids to
/// their DICOM directory under pre-reorg.
pub fn load_dicom_dir_map(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read DICOM dir map {}", path.display()))?;
    let mut lines = content.lines();
    let header = lines
        .next()
        .ok_or_else(|| NipoppyError::config("DICOM dir map is empty"))?;
    if header.split('\t').count() != 2 {
        return Err(NipoppyError::config(format!(
            "DICOM dir map {} must have exactly two tab-separated columns",
            path.display()
        ))
        .into());
    }

    let mut map = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let mut cells = line.split('\t');
        let (Some(participant_id), Some(dicom_dir), None) =
            (cells.next(), cells.next(), cells.next())
        else {
            return Err(NipoppyError::config(format!(
                "malformed DICOM dir map row {line:?}"
            ))
            .into());
        };
        map.insert(participant_id.to_string(), dicom_dir.to_string());
    }
    Ok(map)
}

/// The DICOM directory for one (participant, session), relative to the
/// pre-reorg root. The relation file wins over the directory convention.
fn dicom_dir_relative(
    config: &GlobalConfig,
    map: &BTreeMap<String, String>,
    participant_id: &str,
    session_id: &str,
) -> String {
    if let Some(mapped) = map.get(participant_id) {
        return format!("{mapped}/{session_id}");
    }
    if config.dicom_dir_participant_first {
        format!("{participant_id}/{session_id}")
    } else {
        format!("{session_id}/{participant_id}")
    }
}

fn dir_has_entries(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// A `sub-`/`ses-`-prefixed directory name under pre-reorg means the tree
/// was already (partially) reorganized by hand; surfaced as a user error.
fn check_pre_reorg_names(pre_reorg: &Path) -> Result<()> {
    let entries = fs::read_dir(pre_reorg)
        .with_context(|| format!("failed to read {}", pre_reorg.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", pre_reorg.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(BIDS_PARTICIPANT_PREFIX) || name.starts_with(BIDS_SESSION_PREFIX) {
            return Err(NipoppyError::planning(format!(
                "pre-reorg entry {name:?} carries a BIDS prefix; raw DICOM directories \
                 must use bare participant/session ids"
            ))
            .into());
        }
    }
    Ok(())
}

/// Walk the three imaging-stage roots and update the curation status
/// table. With `regenerate`, prior contents are discarded; otherwise rows
/// for pairs not in the manifest are preserved.
pub fn update_curation_status(
    layout: &Layout,
    config: &GlobalConfig,
    regenerate: bool,
    reporter: &mut dyn Reporter,
) -> Result<TableDiff> {
    let store = TableStore::new(layout);
    let manifest = manifest_rows(&store.load(TableKind::Manifest)?)?;

    let pre_reorg = layout.require_dir("pre_reorg")?;
    let post_reorg = layout.require_dir("post_reorg")?;
    let bids = layout.require_dir("bids")?;

    check_pre_reorg_names(&pre_reorg)?;

    let map = match &config.dicom_dir_map_file {
        Some(file) => {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                layout.root().join(file)
            };
            load_dicom_dir_map(&path)?
        }
        None => BTreeMap::new(),
    };

    let mut rows = Vec::new();
    for row in &manifest {
        if !row.has_session() {
            continue;
        }
        let dicom_dir =
            dicom_dir_relative(config, &map, &row.participant_id, &row.session_id);
        let bids_subject_session = PathBuf::from(bids_participant_id(&row.participant_id))
            .join(bids_session_id(&row.session_id));

        rows.push(CurationRow {
            participant_id: row.participant_id.clone(),
            session_id: row.session_id.clone(),
            in_manifest: true,
            in_pre_reorg: dir_has_entries(&pre_reorg.join(&dicom_dir)),
            in_post_reorg: dir_has_entries(&post_reorg.join(&bids_subject_session)),
            in_bids: dir_has_entries(&bids.join(&bids_subject_session)),
            participant_dicom_dir: Some(dicom_dir),
        });
    }

    let new = curation_table(&rows);
    let changes = if regenerate {
        let base = store.load(TableKind::CurationStatus)?;
        let changes = diff(TableKind::CurationStatus, &base, &new)?;
        store.save(TableKind::CurationStatus, &new)?;
        changes
    } else {
        store.upsert(TableKind::CurationStatus, &new)?
    };

    reporter.info(&format!("curation status: {}", changes.summary()));
    Ok(changes)
}

/// Copy the pre-reorg DICOM files of one (participant, session) into the
/// post-reorg tree, preserving relative structure. Returns the file count.
pub fn reorg_unit(
    layout: &Layout,
    config: &GlobalConfig,
    participant_id: &str,
    session_id: &str,
) -> Result<usize> {
    let pre_reorg = layout.require_dir("pre_reorg")?;

    let map = match &config.dicom_dir_map_file {
        Some(file) => {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                layout.root().join(file)
            };
            load_dicom_dir_map(&path)?
        }
        None => BTreeMap::new(),
    };

    let source = pre_reorg.join(dicom_dir_relative(config, &map, participant_id, session_id));
    if !source.is_dir() {
        anyhow::bail!(
            "no pre-reorg DICOM directory at {} for {participant_id} {session_id}",
            source.display()
        );
    }

    let dest = layout
        .dpath_post_reorg()?
        .join(bids_participant_id(participant_id))
        .join(bids_session_id(session_id));
    ensure_dir(&dest)?;

    copy_tree(&source, &dest)
}

fn copy_tree(source: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    let entries =
        fs::read_dir(source).with_context(|| format!("failed to read {}", source.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", source.display()))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            ensure_dir(&to)?;
            copied += copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Per-stage participant counts from the manifest and curation table.
pub fn summary(layout: &Layout) -> Result<CurationSummary> {
    let store = TableStore::new(layout);
    let manifest = manifest_rows(&store.load(TableKind::Manifest)?)?;
    let curation = crate::tables::curation_rows(&store.load(TableKind::CurationStatus)?)?;

    Ok(CurationSummary {
        manifest_sessions: manifest.iter().filter(|r| r.has_session()).count(),
        in_pre_reorg: curation.iter().filter(|r| r.in_pre_reorg).count(),
        in_post_reorg: curation.iter().filter(|r| r.in_post_reorg).count(),
        in_bids: curation.iter().filter(|r| r.in_bids).count(),
    })
}
