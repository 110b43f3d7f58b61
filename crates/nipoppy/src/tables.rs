//! The tabular store: the three canonical tab-separated state tables.
//!
//! Each table kind has a fixed column contract. The store preserves row
//! order across round-trips, merges rows by composite key on upsert
//! (leaving all other rows byte-identical), and replaces files atomically
//! (write-to-temp + rename + parent fsync) so a concurrent reader sees
//! either the old or the new full file, never a partial one. Writers hold
//! the advisory dataset lock for the duration of a write; an upsert holds
//! it from the base-table load through the final write so a concurrent
//! writer cannot slip in between.
//!
//! Cell codec: booleans render `True`/`False` (`true`/`false` accepted on
//! load), list-valued cells render as their literal textual representation
//! (`['anat', 'dwi']`, empty list `[]`), null/empty cells render as the
//! empty string.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::NipoppyError;
use crate::layout::Layout;
use crate::lock::DatasetLock;
use crate::types::{
    CurationRow, ManifestRow, ProcStatus, ProcessingRow, validate_participant_id,
    validate_session_id,
};

/// The three canonical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Manifest,
    CurationStatus,
    ProcessingStatus,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manifest => "manifest",
            Self::CurationStatus => "curation_status",
            Self::ProcessingStatus => "processing_status",
        }
    }

    /// Fixed column order for this kind.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Self::Manifest => &["participant_id", "visit_id", "session_id", "datatype"],
            Self::CurationStatus => &[
                "participant_id",
                "session_id",
                "in_manifest",
                "participant_dicom_dir",
                "in_pre_reorg",
                "in_post_reorg",
                "in_bids",
            ],
            Self::ProcessingStatus => &[
                "participant_id",
                "bids_participant_id",
                "session_id",
                "bids_session_id",
                "pipeline_name",
                "pipeline_version",
                "pipeline_step",
                "status",
            ],
        }
    }

    /// Composite key columns for this kind.
    pub fn key_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Manifest => &["participant_id", "visit_id"],
            Self::CurationStatus => &["participant_id", "session_id"],
            Self::ProcessingStatus => &[
                "participant_id",
                "session_id",
                "pipeline_name",
                "pipeline_version",
                "pipeline_step",
            ],
        }
    }

    pub fn path(&self, layout: &Layout) -> Result<PathBuf> {
        match self {
            Self::Manifest => layout.manifest_path(),
            Self::CurationStatus => layout.curation_status_path(),
            Self::ProcessingStatus => layout.processing_status_path(),
        }
    }
}

/// An in-memory tab-separated table: a header and raw string cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsvTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TsvTable {
    /// An empty table with the column contract of `kind`.
    pub fn empty(kind: TableKind) -> Self {
        Self {
            columns: kind.columns().iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Parse the serialized form: a header row plus zero or more data rows.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let header = lines
            .next()
            .ok_or_else(|| NipoppyError::config("table is missing its header row"))?;
        let columns: Vec<String> = header.split('\t').map(str::to_string).collect();

        let mut rows = Vec::new();
        for (lineno, line) in lines.enumerate() {
            if line.is_empty() {
                continue;
            }
            let cells: Vec<String> = line.split('\t').map(str::to_string).collect();
            if cells.len() != columns.len() {
                return Err(NipoppyError::config(format!(
                    "row {} has {} cells, expected {}",
                    lineno + 2,
                    cells.len(),
                    columns.len()
                ))
                .into());
            }
            rows.push(cells);
        }
        Ok(Self { columns, rows })
    }

    /// Render the serialized form. Cells must not contain tabs or newlines.
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        out.push_str(&self.columns.join("\t"));
        out.push('\n');
        for row in &self.rows {
            for cell in row {
                if cell.contains('\t') || cell.contains('\n') {
                    return Err(NipoppyError::config(format!(
                        "cell {cell:?} contains a tab or newline and cannot be serialized"
                    ))
                    .into());
                }
            }
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        Ok(out)
    }

    /// Check the fixed column contract. A missing required column is a
    /// schema mismatch naming the offender.
    pub fn validate_schema(&self, kind: TableKind) -> Result<()> {
        for required in kind.columns() {
            if self.column_index(required).is_none() {
                return Err(NipoppyError::config(format!(
                    "{} table is missing required column {required:?}",
                    kind.as_str()
                ))
                .into());
            }
        }
        if self.columns.len() != kind.columns().len() {
            let extra: Vec<&String> = self
                .columns
                .iter()
                .filter(|c| !kind.columns().contains(&c.as_str()))
                .collect();
            return Err(NipoppyError::config(format!(
                "{} table has unexpected columns {extra:?}",
                kind.as_str()
            ))
            .into());
        }
        Ok(())
    }

    fn key_indices(&self, kind: TableKind) -> Vec<usize> {
        kind.key_columns()
            .iter()
            .filter_map(|c| self.column_index(c))
            .collect()
    }

    fn key_of(row: &[String], indices: &[usize]) -> Vec<String> {
        indices.iter().map(|&i| row[i].clone()).collect()
    }

    /// Reject duplicate composite keys, surfacing the offending row.
    pub fn check_unique_keys(&self, kind: TableKind) -> Result<()> {
        let indices = self.key_indices(kind);
        let mut seen = BTreeSet::new();
        for row in &self.rows {
            let key = Self::key_of(row, &indices);
            if !seen.insert(key.clone()) {
                return Err(NipoppyError::planning(format!(
                    "duplicate {} key {key:?} in row {row:?}",
                    kind.as_str()
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Result of a merge or comparison between two tables of the same kind.
#[derive(Debug, Clone, Default)]
pub struct TableDiff {
    pub added: Vec<Vec<String>>,
    pub updated: Vec<Vec<String>>,
    pub removed: Vec<Vec<String>>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} added, {} updated, {} removed",
            self.added.len(),
            self.updated.len(),
            self.removed.len()
        )
    }
}

/// Merge `incoming` rows into `base` by the kind's composite key: rows
/// matching an existing key replace it in place, new keys append at the
/// end in input order. All non-matching rows are left untouched.
pub fn merge(kind: TableKind, base: &TsvTable, incoming: &TsvTable) -> Result<TsvTable> {
    base.validate_schema(kind)?;
    incoming.validate_schema(kind)?;
    incoming.check_unique_keys(kind)?;

    let indices = base.key_indices(kind);
    let mut merged = base.clone();
    for row in &incoming.rows {
        let key = TsvTable::key_of(row, &indices);
        match merged
            .rows
            .iter()
            .position(|r| TsvTable::key_of(r, &indices) == key)
        {
            Some(pos) => merged.rows[pos] = row.clone(),
            None => merged.rows.push(row.clone()),
        }
    }
    Ok(merged)
}

/// Compare two tables of the same kind by composite key.
pub fn diff(kind: TableKind, base: &TsvTable, new: &TsvTable) -> Result<TableDiff> {
    base.validate_schema(kind)?;
    new.validate_schema(kind)?;

    let base_idx = base.key_indices(kind);
    let new_idx = new.key_indices(kind);

    let mut out = TableDiff::default();
    for row in &new.rows {
        let key = TsvTable::key_of(row, &new_idx);
        match base
            .rows
            .iter()
            .find(|r| TsvTable::key_of(r, &base_idx) == key)
        {
            None => out.added.push(row.clone()),
            Some(old) if old != row => out.updated.push(row.clone()),
            Some(_) => {}
        }
    }
    for row in &base.rows {
        let key = TsvTable::key_of(row, &base_idx);
        if !new
            .rows
            .iter()
            .any(|r| TsvTable::key_of(r, &new_idx) == key)
        {
            out.removed.push(row.clone());
        }
    }
    Ok(out)
}

/// The store: exclusive write access to the three canonical tables.
#[derive(Debug)]
pub struct TableStore<'a> {
    layout: &'a Layout,
}

impl<'a> TableStore<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }

    /// Load a table. A missing status table in an initialized dataset is
    /// an empty table (no-data); a missing parent directory is a
    /// not-initialized error; a missing manifest is a planning error.
    pub fn load(&self, kind: TableKind) -> Result<TsvTable> {
        let path = kind.path(self.layout)?;
        if !path.exists() {
            if let Some(parent) = path.parent()
                && !parent.is_dir()
            {
                return Err(NipoppyError::not_initialized(format!(
                    "{} does not exist; run init first",
                    parent.display()
                ))
                .into());
            }
            if kind == TableKind::Manifest {
                return Err(NipoppyError::planning(format!(
                    "manifest not found at {}",
                    path.display()
                ))
                .into());
            }
            return Ok(TsvTable::empty(kind));
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let table = TsvTable::parse(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        table.validate_schema(kind)?;
        table.check_unique_keys(kind)?;
        Ok(table)
    }

    /// Save a table atomically under the dataset lock. On any failure the
    /// canonical file is left unchanged.
    pub fn save(&self, kind: TableKind, table: &TsvTable) -> Result<()> {
        let _guard = DatasetLock::hold(self.layout)?;
        self.write_table(kind, table)
    }

    /// Merge rows into the stored table by composite key and save. Returns
    /// what changed relative to the stored table. The dataset lock is held
    /// across the whole load-merge-write sequence, so concurrent writers
    /// with disjoint participant/session filters cannot clobber each
    /// other's freshly merged rows.
    pub fn upsert(&self, kind: TableKind, incoming: &TsvTable) -> Result<TableDiff> {
        let _guard = DatasetLock::hold(self.layout)?;
        let base = self.load(kind)?;
        let merged = merge(kind, &base, incoming)?;
        let changes = diff(kind, &base, &merged)?;
        self.write_table(kind, &merged)?;
        Ok(changes)
    }

    fn write_table(&self, kind: TableKind, table: &TsvTable) -> Result<()> {
        table.validate_schema(kind)?;
        table.check_unique_keys(kind)?;
        let content = table.render()?;

        let path = kind.path(self.layout)?;
        if let Some(parent) = path.parent() {
            crate::layout::ensure_dir(parent)?;
        }
        atomic_write(&path, content.as_bytes())
    }
}

/// Best-effort fsync of the parent directory after a rename, ensuring the
/// directory entry update is durable on crash.  Errors are silently ignored
/// because not all platforms support opening a directory for sync.
pub(crate) fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    fsync_parent_dir(path);

    Ok(())
}

// Cell codecs.

pub fn render_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

pub fn parse_bool(cell: &str) -> Result<bool> {
    match cell {
        "True" | "true" => Ok(true),
        "False" | "false" => Ok(false),
        other => {
            Err(NipoppyError::config(format!("invalid boolean cell {other:?}")).into())
        }
    }
}

/// Render a list cell as its literal textual representation.
pub fn render_list(items: &[String]) -> String {
    if items.is_empty() {
        return "[]".to_string();
    }
    let quoted: Vec<String> = items.iter().map(|item| format!("'{item}'")).collect();
    format!("[{}]", quoted.join(", "))
}

pub fn parse_list(cell: &str) -> Result<Vec<String>> {
    let cell = cell.trim();
    if cell.is_empty() || cell == "[]" {
        return Ok(Vec::new());
    }
    let inner = cell
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| NipoppyError::config(format!("invalid list cell {cell:?}")))?;
    let mut items = Vec::new();
    for part in inner.split(',') {
        let part = part.trim();
        let item = part
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .or_else(|| part.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
            .unwrap_or(part);
        if !item.is_empty() {
            items.push(item.to_string());
        }
    }
    Ok(items)
}

// Typed row conversions.

/// Decode and validate manifest rows: id policy plus
/// (participant_id, visit_id) uniqueness.
pub fn manifest_rows(table: &TsvTable) -> Result<Vec<ManifestRow>> {
    table.validate_schema(TableKind::Manifest)?;
    table.check_unique_keys(TableKind::Manifest)?;

    let participant = table.column_index("participant_id").expect("checked");
    let visit = table.column_index("visit_id").expect("checked");
    let session = table.column_index("session_id").expect("checked");
    let datatype = table.column_index("datatype").expect("checked");

    let mut rows = Vec::with_capacity(table.rows.len());
    for cells in &table.rows {
        let row = ManifestRow {
            participant_id: cells[participant].clone(),
            visit_id: cells[visit].clone(),
            session_id: cells[session].clone(),
            datatype: parse_list(&cells[datatype])?,
        };
        validate_participant_id(&row.participant_id)
            .with_context(|| format!("in manifest row {cells:?}"))?;
        validate_session_id(&row.session_id)
            .with_context(|| format!("in manifest row {cells:?}"))?;
        if row.visit_id.is_empty() {
            return Err(NipoppyError::planning(format!(
                "visit_id must not be empty in manifest row {cells:?}"
            ))
            .into());
        }
        rows.push(row);
    }
    Ok(rows)
}

pub fn curation_rows(table: &TsvTable) -> Result<Vec<CurationRow>> {
    table.validate_schema(TableKind::CurationStatus)?;

    let idx = |name: &str| table.column_index(name).expect("checked");
    let (participant, session) = (idx("participant_id"), idx("session_id"));
    let in_manifest = idx("in_manifest");
    let dicom_dir = idx("participant_dicom_dir");
    let (pre, post, bids) = (idx("in_pre_reorg"), idx("in_post_reorg"), idx("in_bids"));

    let mut rows = Vec::with_capacity(table.rows.len());
    for cells in &table.rows {
        rows.push(CurationRow {
            participant_id: cells[participant].clone(),
            session_id: cells[session].clone(),
            in_manifest: parse_bool(&cells[in_manifest])?,
            participant_dicom_dir: if cells[dicom_dir].is_empty() {
                None
            } else {
                Some(cells[dicom_dir].clone())
            },
            in_pre_reorg: parse_bool(&cells[pre])?,
            in_post_reorg: parse_bool(&cells[post])?,
            in_bids: parse_bool(&cells[bids])?,
        });
    }
    Ok(rows)
}

pub fn processing_rows(table: &TsvTable) -> Result<Vec<ProcessingRow>> {
    table.validate_schema(TableKind::ProcessingStatus)?;

    let idx = |name: &str| table.column_index(name).expect("checked");
    let mut rows = Vec::with_capacity(table.rows.len());
    for cells in &table.rows {
        rows.push(ProcessingRow {
            participant_id: cells[idx("participant_id")].clone(),
            bids_participant_id: cells[idx("bids_participant_id")].clone(),
            session_id: cells[idx("session_id")].clone(),
            bids_session_id: cells[idx("bids_session_id")].clone(),
            pipeline_name: cells[idx("pipeline_name")].clone(),
            pipeline_version: cells[idx("pipeline_version")].clone(),
            pipeline_step: cells[idx("pipeline_step")].clone(),
            status: ProcStatus::parse(&cells[idx("status")])?,
        });
    }
    Ok(rows)
}

pub fn curation_row_cells(row: &CurationRow) -> Vec<String> {
    vec![
        row.participant_id.clone(),
        row.session_id.clone(),
        render_bool(row.in_manifest).to_string(),
        row.participant_dicom_dir.clone().unwrap_or_default(),
        render_bool(row.in_pre_reorg).to_string(),
        render_bool(row.in_post_reorg).to_string(),
        render_bool(row.in_bids).to_string(),
    ]
}

pub fn processing_row_cells(row: &ProcessingRow) -> Vec<String> {
    vec![
        row.participant_id.clone(),
        row.bids_participant_id.clone(),
        row.session_id.clone(),
        row.bids_session_id.clone(),
        row.pipeline_name.clone(),
        row.pipeline_version.clone(),
        row.pipeline_step.clone(),
        row.status.as_str().to_string(),
    ]
}

pub fn curation_table(rows: &[CurationRow]) -> TsvTable {
    TsvTable {
        columns: TableKind::CurationStatus
            .columns()
            .iter()
            .map(|c| c.to_string())
            .collect(),
        rows: rows.iter().map(curation_row_cells).collect(),
    }
}

pub fn processing_table(rows: &[ProcessingRow]) -> TsvTable {
    TsvTable {
        columns: TableKind::ProcessingStatus
            .columns()
            .iter()
            .map(|c| c.to_string())
            .collect(),
        rows: rows.iter().map(processing_row_cells).collect(),
    }
}
