use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use nipoppy::catalog::PipelineCatalog;
use nipoppy::config::GlobalConfig;
use nipoppy::curation;
use nipoppy::hpc::{DEFAULT_JOB_SCRIPT_TEMPLATE, SchedulerRegistry, TEMPLATE_STEM};
use nipoppy::layout::Layout;
use nipoppy::process::CancelToken;
use nipoppy::runner::{self, Reporter, RunOptions};
use nipoppy::scheduler::{self, UnitFilter};
use nipoppy::tables::{TableKind, TableStore, processing_rows};
use nipoppy::tracker;
use nipoppy::types::{Action, PipelineSelector, ProcStatus};

#[derive(Parser, Debug)]
#[command(name = "nipoppy", version)]
#[command(about = "Manifest-driven orchestration of containerized neuroimaging pipelines")]
struct Cli {
    /// Dataset root directory.
    #[arg(long, global = true, default_value = ".")]
    dataset: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Restrict to one participant id (without the sub- prefix).
    #[arg(long)]
    participant_id: Option<String>,

    /// Restrict to one session id (without the ses- prefix).
    #[arg(long)]
    session_id: Option<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> UnitFilter {
        UnitFilter {
            participant_id: self.participant_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct SelectorArgs {
    /// Pipeline name.
    #[arg(long)]
    pipeline: String,

    /// Pipeline version (default: latest installed).
    #[arg(long)]
    pipeline_version: Option<String>,

    /// Pipeline step (default: the bundle's first step).
    #[arg(long)]
    pipeline_step: Option<String>,
}

impl SelectorArgs {
    fn to_selector(&self) -> PipelineSelector {
        PipelineSelector {
            name: self.pipeline.clone(),
            version: self.pipeline_version.clone(),
            step: self.pipeline_step.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    filter: FilterArgs,

    /// Print the resolved command for every unit without executing.
    #[arg(long)]
    simulate: bool,

    /// Submit the units as a job array via this scheduler kind
    /// (slurm, sge, or a registered kind) instead of running locally.
    #[arg(long)]
    hpc: Option<String>,

    /// Keep the HPC submission script after a successful submit.
    #[arg(long)]
    keep_workdir: bool,

    /// Write the plan as a table instead of executing it.
    #[arg(long)]
    write_list: bool,
}

impl RunArgs {
    fn to_options(&self) -> RunOptions {
        RunOptions {
            simulate: self.simulate,
            keep_workdir: self.keep_workdir,
            hpc: self.hpc.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the dataset directory skeleton, a starter global
    /// configuration and the default HPC job script template.
    Init {
        /// Dataset name recorded in the global configuration.
        #[arg(long, default_value = "my-dataset")]
        dataset_name: String,
    },
    /// Summarize dataset state: per-stage counts and pipeline successes.
    Status,
    /// Reorganize raw DICOM files into the post-reorg tree.
    Reorg {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Convert post-reorg DICOM files to BIDS with a bidsification pipeline.
    Bidsify {
        #[command(flatten)]
        selector: SelectorArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run a processing pipeline on BIDS data.
    Process {
        #[command(flatten)]
        selector: SelectorArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run an extraction pipeline on processed derivatives.
    Extract {
        #[command(flatten)]
        selector: SelectorArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Rebuild the curation status table from the filesystem.
    TrackCuration {
        /// Discard prior contents instead of updating progressively.
        #[arg(long)]
        regenerate: bool,
    },
    /// Re-evaluate pipeline outputs and update the processing status table.
    TrackProcessing {
        #[command(flatten)]
        selector: SelectorArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("[error] {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every yielded unit succeeded.
fn run() -> Result<bool> {
    let cli = Cli::parse();
    let layout = Layout::new(&cli.dataset);
    let mut reporter = CliReporter;

    match cli.cmd {
        Commands::Init { dataset_name } => {
            init_dataset(&layout, &dataset_name)?;
            reporter.info(&format!("initialized dataset at {}", cli.dataset.display()));
            Ok(true)
        }

        Commands::Status => {
            print_status(&layout)?;
            Ok(true)
        }

        Commands::TrackCuration { regenerate } => {
            let config = load_config(&layout)?;
            curation::update_curation_status(&layout, &config, regenerate, &mut reporter)?;
            Ok(true)
        }

        Commands::TrackProcessing { selector, filter } => {
            let config = load_config(&layout)?;
            let catalog = PipelineCatalog::discover(&layout, &config)?;
            let plan = scheduler::build_plan(
                &layout,
                &catalog,
                Action::TrackProcessing,
                Some(&selector.to_selector()),
                &filter.to_filter(),
            )?;
            tracker::track_plan(&layout, &config, &catalog, &plan, &mut reporter)?;
            Ok(true)
        }

        Commands::Reorg { run } => {
            execute(&layout, Action::Reorg, None, &run, &mut reporter)
        }
        Commands::Bidsify { selector, run } => execute(
            &layout,
            Action::Bidsify,
            Some(selector.to_selector()),
            &run,
            &mut reporter,
        ),
        Commands::Process { selector, run } => execute(
            &layout,
            Action::Process,
            Some(selector.to_selector()),
            &run,
            &mut reporter,
        ),
        Commands::Extract { selector, run } => execute(
            &layout,
            Action::Extract,
            Some(selector.to_selector()),
            &run,
            &mut reporter,
        ),
    }
}

fn load_config(layout: &Layout) -> Result<GlobalConfig> {
    GlobalConfig::load(&layout.global_config_path()?)
}

fn execute(
    layout: &Layout,
    action: Action,
    selector: Option<PipelineSelector>,
    run: &RunArgs,
    reporter: &mut CliReporter,
) -> Result<bool> {
    let config = load_config(layout)?;
    let catalog = PipelineCatalog::discover(layout, &config)?;
    let plan = scheduler::build_plan(
        layout,
        &catalog,
        action,
        selector.as_ref(),
        &run.filter.to_filter(),
    )?;
    reporter.info(&format!(
        "{action}: {} outstanding unit(s) (plan {})",
        plan.units.len(),
        &plan.plan_id[..12]
    ));

    if run.write_list {
        let path = scheduler::write_plan(layout, &plan)?;
        reporter.info(&format!("plan written to {}", path.display()));
        return Ok(true);
    }

    let registry = SchedulerRegistry::with_defaults();
    let report = runner::run_plan(
        layout,
        &config,
        &catalog,
        &registry,
        &plan,
        &run.to_options(),
        reporter,
        &CancelToken::new(),
    )?;

    let failed = report
        .results
        .iter()
        .filter(|r| !r.succeeded())
        .count();
    if failed > 0 {
        reporter.warn(&format!("{failed} unit(s) failed"));
    }
    if report.cancelled {
        reporter.warn("run cancelled");
    }
    Ok(report.all_succeeded())
}

fn init_dataset(layout: &Layout, dataset_name: &str) -> Result<()> {
    layout.create_all()?;

    let config_path = layout.global_config_path()?;
    if !config_path.exists() {
        let config = GlobalConfig::new(dataset_name, vec!["BL".to_string()]);
        config.save(&config_path)?;
    }

    let manifest_path = layout.manifest_path()?;
    if !manifest_path.exists() {
        fs::write(
            &manifest_path,
            "participant_id\tvisit_id\tsession_id\tdatatype\n",
        )
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;
    }

    let template_path = layout.dpath_hpc()?.join(format!("{TEMPLATE_STEM}.sh"));
    if !template_path.exists() {
        fs::write(&template_path, DEFAULT_JOB_SCRIPT_TEMPLATE)
            .with_context(|| format!("failed to write {}", template_path.display()))?;
    }

    Ok(())
}

fn print_status(layout: &Layout) -> Result<()> {
    let missing = layout.missing_directories();
    if !missing.is_empty() {
        println!("missing directories:");
        for (name, description, path) in &missing {
            println!("  {name}: {} ({description})", path.display());
        }
        return Ok(());
    }

    let config = load_config(layout)?;
    println!("dataset: {}", config.dataset_name);

    let counts = curation::summary(layout)?;
    println!("manifest sessions: {}", counts.manifest_sessions);
    println!("in pre_reorg:      {}", counts.in_pre_reorg);
    println!("in post_reorg:     {}", counts.in_post_reorg);
    println!("in bids:           {}", counts.in_bids);

    let store = TableStore::new(layout);
    let processing = processing_rows(&store.load(TableKind::ProcessingStatus)?)?;
    if !processing.is_empty() {
        let mut successes: BTreeMap<String, usize> = BTreeMap::new();
        for row in &processing {
            if row.status == ProcStatus::Success {
                let key = format!(
                    "{} {} {}",
                    row.pipeline_name, row.pipeline_version, row.pipeline_step
                );
                *successes.entry(key).or_default() += 1;
            }
        }
        println!("pipeline successes:");
        for (pipeline, count) in &successes {
            println!("  {pipeline}: {count}");
        }
    }

    Ok(())
}
