//! # Nipoppy
//!
//! A per-subject neuroimaging workflow orchestrator.
//!
//! Nipoppy operates over a dataset whose ground truth is a manifest of
//! participants, visits, sessions and expected datatypes, and applies
//! container-wrapped external pipelines (DICOM reorganization, BIDS
//! conversion, processing, extraction) to each (participant, session)
//! pair, tracking progress in two persistent tab-separated state tables.
//!
//! ## Pipeline
//!
//! The core flow is **curate → plan → run → track**:
//!
//! 1. [`curation::update_curation_status`] reconciles the pre-reorg,
//!    post-reorg and BIDS trees with the manifest.
//! 2. [`scheduler::build_plan`] joins the manifest with the two status
//!    tables and yields the outstanding work units in a deterministic
//!    order.
//! 3. [`runner::run_plan`] materializes each unit (environment, work
//!    directory, resolved command) and executes it locally — or hands the
//!    command list to [`hpc`] for job-array submission.
//! 4. [`tracker::track_plan`] re-scans pipeline output trees against
//!    glob expectation lists and merges the verdicts back into the
//!    processing status table.
//!
//! ## Key Types
//!
//! - `ManifestRow` / `CurationRow` / `ProcessingRow` — the three table
//!   row contracts
//! - `WorkUnit` / `WorkPlan` — a schedulable execution and an ordered,
//!   SHA-256-identified set of them
//! - `PipelineBundle` — one installed pipeline with its descriptor,
//!   invocation, tracker and HPC configurations
//! - `ProcStatus` — the `SUCCESS`/`FAIL`/`UNAVAILABLE`/`INCOMPLETE`
//!   status atom
//! - `NipoppyError` — the closed set of fatal error kinds
//!
//! ## Modules
//!
//! - [`layout`] — semantic-name to path resolution under the dataset root
//! - [`tables`] — the tabular store: TSV codec, upsert, diff, atomic writes
//! - [`subst`] — `[[NAME]]` template token resolution
//! - [`config`] — dataset-wide configuration (`global_config.json`)
//! - [`catalog`] — pipeline bundle discovery and validation
//! - [`descriptor`] — command-line descriptors and the invocation builder
//! - [`scheduler`] — outstanding-work enumeration and write-list plans
//! - [`runner`] — per-unit execution with logs and cancellation
//! - [`hpc`] — job-array script rendering and scheduler adapters
//! - [`tracker`] — glob-based output tracking
//! - [`curation`] — imaging-stage reconciliation and DICOM reorg
//! - [`lock`] — the advisory dataset lock
//! - [`process`] — shell execution with capture and cancellation
//! - [`types`] — shared domain types
//! - [`error`] — typed error kinds
//!
//! ## CLI Usage
//!
//! For command-line usage, see the `nipoppy-cli` crate.

/// Pipeline bundle discovery and validation.
pub mod catalog;

/// Dataset-wide configuration (`global_config.json`).
pub mod config;

/// Imaging-stage reconciliation and DICOM reorganization.
pub mod curation;

/// Command-line descriptors and the invocation builder.
pub mod descriptor;

/// Typed error kinds with fixed propagation policies.
pub mod error;

/// Job-array script rendering and scheduler adapters.
pub mod hpc;

/// Semantic-name to path resolution under the dataset root.
pub mod layout;

/// Advisory dataset lock for table writers.
pub mod lock;

/// Shell execution with capture and cancellation.
pub mod process;

/// Per-unit execution with logs and cancellation.
pub mod runner;

/// Outstanding-work enumeration and write-list plans.
pub mod scheduler;

/// `[[NAME]]` template token resolution.
pub mod subst;

/// The tabular store: TSV codec, upsert, diff, atomic writes.
pub mod tables;

/// Glob-based output tracking.
pub mod tracker;

/// Shared domain types.
pub mod types;
