//! End-to-end tests for the `nipoppy` binary: init → curate → process →
//! track, against a real dataset tree with an echo-backed pipeline.

use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

fn nipoppy(dataset: &Path) -> Command {
    let mut cmd = Command::cargo_bin("nipoppy").expect("binary");
    cmd.arg("--dataset").arg(dataset);
    cmd
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, content).expect("write");
}

/// An echo-backed processing pipeline with a tracker expecting one JSON
/// report under the subject/session tree and one HTML report at the
/// output root.
fn install_echo_pipeline(root: &Path) {
    let dir = root.join("pipelines/processing/mriqc/23.1.0");
    write_file(
        &dir.join("descriptor.json"),
        r#"{
            "name": "mriqc",
            "tool-version": "23.1.0",
            "command-line": "[CMD] [IN] [OUT]",
            "inputs": [
                {"id": "command", "type": "String", "value-key": "[CMD]"},
                {"id": "input", "type": "String", "value-key": "[IN]"},
                {"id": "output", "type": "String", "value-key": "[OUT]"}
            ]
        }"#,
    );
    write_file(
        &dir.join("invocation.json"),
        r#"{
            "command": "echo",
            "input": "[[DPATH_BIDS]]",
            "output": "[[DPATH_PIPELINE_OUTPUT]]"
        }"#,
    );
    write_file(
        &dir.join("tracker.json"),
        r#"{
            "PATHS": [
                "[[BIDS_PARTICIPANT_ID]]/[[BIDS_SESSION_ID]]/anat/[[BIDS_PARTICIPANT_ID]]_[[BIDS_SESSION_ID]]_*_T1w.json",
                "[[BIDS_PARTICIPANT_ID]]_[[BIDS_SESSION_ID]]_*_T1w.html"
            ]
        }"#,
    );
    write_file(
        &dir.join("config.json"),
        r#"{
            "NAME": "mriqc",
            "VERSION": "23.1.0",
            "STEPS": [{
                "DESCRIPTOR_FILE": "descriptor.json",
                "INVOCATION_FILE": "invocation.json",
                "TRACKER_CONFIG_FILE": "tracker.json",
                "GENERATE_PYBIDS_DATABASE": false
            }]
        }"#,
    );
}

fn init_dataset() -> TempDir {
    let td = TempDir::new().expect("tempdir");
    nipoppy(td.path())
        .args(["init", "--dataset-name", "demo"])
        .assert()
        .success();
    write_file(
        &td.path().join("manifest.tsv"),
        "participant_id\tvisit_id\tsession_id\tdatatype\n\
         P01\tBL\tBL\t['anat']\n\
         P02\tBL\tBL\t['anat']\n",
    );
    install_echo_pipeline(td.path());
    td
}

fn fake_bids(root: &Path, participant: &str) {
    write_file(
        &root.join(format!(
            "bids/sub-{participant}/ses-BL/anat/sub-{participant}_ses-BL_T1w.nii.gz"
        )),
        "nifti",
    );
}

fn fake_outputs(root: &Path, participant: &str) {
    let output = root.join("derivatives/mriqc/23.1.0/output");
    write_file(
        &output.join(format!(
            "sub-{participant}/ses-BL/anat/sub-{participant}_ses-BL_acq-sag_T1w.json"
        )),
        "{}",
    );
    write_file(
        &output.join(format!("sub-{participant}_ses-BL_acq-sag_T1w.html")),
        "<html/>",
    );
}

#[test]
fn init_creates_the_skeleton() {
    let td = TempDir::new().expect("tempdir");
    nipoppy(td.path()).arg("init").assert().success();

    assert!(td.path().join("global_config.json").is_file());
    assert!(td.path().join("manifest.tsv").is_file());
    assert!(td.path().join("sourcedata/imaging/pre_reorg").is_dir());
    assert!(td.path().join("bids").is_dir());
    assert!(td.path().join("code/hpc/job_script_template.sh").is_file());
}

#[test]
fn status_reports_empty_dataset_counts() {
    let td = init_dataset();
    nipoppy(td.path())
        .arg("track-curation")
        .assert()
        .success();

    nipoppy(td.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("manifest sessions: 2"))
        .stdout(predicate::str::contains("in bids:           0"));
}

#[test]
fn curation_tracks_bids_arrivals() {
    let td = init_dataset();
    fake_bids(td.path(), "P01");
    nipoppy(td.path())
        .arg("track-curation")
        .assert()
        .success();

    let table = fs::read_to_string(
        td.path().join("sourcedata/imaging/curation_status.tsv"),
    )
    .expect("read");
    assert!(table.contains("P01\tBL\tTrue\tP01/BL\tFalse\tFalse\tTrue"));
    assert!(table.contains("P02\tBL\tTrue\tP02/BL\tFalse\tFalse\tFalse"));
}

#[test]
fn process_simulate_prints_the_resolved_command() {
    let td = init_dataset();
    fake_bids(td.path(), "P01");
    nipoppy(td.path())
        .arg("track-curation")
        .assert()
        .success();

    nipoppy(td.path())
        .args(["process", "--pipeline", "mriqc", "--simulate"])
        .assert()
        .success()
        .stderr(predicate::str::contains("echo"))
        .stderr(predicate::str::contains("derivatives/mriqc/23.1.0/output"));
}

#[test]
fn process_runs_one_unit_per_bids_session() {
    let td = init_dataset();
    fake_bids(td.path(), "P01");
    nipoppy(td.path())
        .arg("track-curation")
        .assert()
        .success();

    nipoppy(td.path())
        .args(["process", "--pipeline", "mriqc"])
        .assert()
        .success()
        .stderr(predicate::str::contains("1 outstanding unit(s)"));

    let logs = td.path().join("logs/process");
    let count = fs::read_dir(&logs).expect("logs dir").count();
    assert_eq!(count, 1);
}

#[test]
fn tracking_assigns_success_then_fail_on_partial_output() {
    let td = init_dataset();
    fake_bids(td.path(), "P01");
    fake_bids(td.path(), "P02");
    fake_outputs(td.path(), "P01");
    fake_outputs(td.path(), "P02");
    nipoppy(td.path())
        .arg("track-curation")
        .assert()
        .success();

    nipoppy(td.path())
        .args(["track-processing", "--pipeline", "mriqc"])
        .assert()
        .success();

    let status_path = td.path().join("derivatives/processing_status.tsv");
    let before = fs::read_to_string(&status_path).expect("read");
    assert!(before.contains("P01\tsub-P01\tBL\tses-BL\tmriqc\t23.1.0\tdefault\tSUCCESS"));
    assert!(before.contains("P02\tsub-P02\tBL\tses-BL\tmriqc\t23.1.0\tdefault\tSUCCESS"));

    // Drop P01's HTML report and re-track: exactly one row changes.
    fs::remove_file(
        td.path()
            .join("derivatives/mriqc/23.1.0/output/sub-P01_ses-BL_acq-sag_T1w.html"),
    )
    .expect("remove");
    nipoppy(td.path())
        .args(["track-processing", "--pipeline", "mriqc"])
        .assert()
        .success();

    let after = fs::read_to_string(&status_path).expect("read");
    assert!(after.contains("P01\tsub-P01\tBL\tses-BL\tmriqc\t23.1.0\tdefault\tFAIL"));
    let before_p02: Vec<&str> = before.lines().filter(|l| l.starts_with("P02")).collect();
    let after_p02: Vec<&str> = after.lines().filter(|l| l.starts_with("P02")).collect();
    assert_eq!(before_p02, after_p02);

    // Tracked successes no longer count as outstanding process work.
    nipoppy(td.path())
        .args(["process", "--pipeline", "mriqc", "--simulate"])
        .assert()
        .success()
        .stderr(predicate::str::contains("1 outstanding unit(s)"));
}

#[test]
fn write_list_emits_the_plan_table() {
    let td = init_dataset();
    fake_bids(td.path(), "P01");
    nipoppy(td.path())
        .arg("track-curation")
        .assert()
        .success();

    nipoppy(td.path())
        .args(["process", "--pipeline", "mriqc", "--write-list"])
        .assert()
        .success()
        .stderr(predicate::str::contains("plan written to"));

    let plans = td.path().join("work/plans");
    let entries: Vec<_> = fs::read_dir(&plans).expect("plans dir").collect();
    assert_eq!(entries.len(), 1);
    let content =
        fs::read_to_string(entries[0].as_ref().expect("entry").path()).expect("read");
    assert!(content.contains("P01\tBL\tmriqc\t23.1.0\tdefault"));
}

#[test]
fn failing_units_produce_a_nonzero_exit() {
    let td = init_dataset();
    fake_bids(td.path(), "P01");
    write_file(
        &td.path()
            .join("pipelines/processing/mriqc/23.1.0/invocation.json"),
        r#"{"command": "false", "input": "[[DPATH_BIDS]]", "output": "x"}"#,
    );
    nipoppy(td.path())
        .arg("track-curation")
        .assert()
        .success();

    nipoppy(td.path())
        .args(["process", "--pipeline", "mriqc"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("1 unit(s) failed"));
}

#[test]
fn duplicate_manifest_keys_fail_enumeration() {
    let td = init_dataset();
    write_file(
        &td.path().join("manifest.tsv"),
        "participant_id\tvisit_id\tsession_id\tdatatype\n\
         P01\tBL\tBL\t[]\n\
         P01\tBL\tBL\t[]\n",
    );
    nipoppy(td.path())
        .arg("track-curation")
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate"));
}

#[test]
fn participant_filter_restricts_the_plan() {
    let td = init_dataset();
    fake_bids(td.path(), "P01");
    fake_bids(td.path(), "P02");
    nipoppy(td.path())
        .arg("track-curation")
        .assert()
        .success();

    nipoppy(td.path())
        .args([
            "process",
            "--pipeline",
            "mriqc",
            "--participant-id",
            "P02",
            "--simulate",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("1 outstanding unit(s)"));
}
