//! # skimmer
//!
//! Skimming a full Run 2 dataset list means hundreds of grid tasks, thousands of
//! subtasks and a lot of babysitting.
//!
//! The skimmer does the babysitting. It builds one grid request per dataset,
//! submits them, watches them until every subtask is finished (resubmitting the
//! ones that fail along the way), writes out where the output landed, and merges
//! the output into one file per dataset.
//!
//! The per-event work is done by the MINIAOD skimming analyzer of the physics
//! framework; the skimmer only configures and drives it.
//!
//! ## Installation
//!
//! From within the repository run
//!
//! ```bash
//! cargo install --path .
//! ```
//!
//! The grid client (`crab`), the discovery client (`dasgoclient`), the merge tool
//! (`hadd`) and the HTCondor tools must be on your path, with a valid grid proxy.
//!
//! ## Use
//!
//! ```txt
//! skimmer --config/-c /path/to/some/config.yml <command>
//! ```
//!
//! | Command    | What it does |
//! |------------|--------------|
//! | `new`      | Write a template configuration file |
//! | `submit`   | Submit one grid task per dataset in the dataset lists |
//! | `monitor`  | Poll all tasks until finished, resubmitting failures and writing manifests |
//! | `merge`    | Merge the files of a manifest, directly or as an HTCondor DAG |
//! | `datalist` | Look up the MINIAOD dataset of every used background process |
//! | `nano`     | Submit or merge batch skims of NANOAOD datasets |
//! | `params`   | Print the analyzer parameters for an output file |
//!
//! Verbosity of the monitor and merge logs is set with `SKIMMER_LOG` (default `info`).
//!
//! ### Configuration
//!
//! Configurations are YAML; `new` writes a template with every key. The most important ones:
//!
//! ```yaml
//! work_dir: /path/to/some/work/dir/
//! xsec_path: /path/to/some/data/xsec.yaml
//! era_path: /path/to/some/data/eras.yaml
//! era: "2017"
//! dataset_lists:
//! - /path/to/some/filelists/filelist_bkg_2017_MINI.txt
//! storage_site: T2_DE_DESY
//! memory_mb: 2500
//! runtime_min: 1440
//! poll_interval_secs: 60
//! max_resubmits: 10
//! manifest_dir: /path/to/some/work/dir/manifests/
//! merge_chunk_size: 50
//! ```
//!
//! Some important notes:
//!
//! - Missing keys take their template value.
//! - Resubmissions of subtasks that ran out of wall time get 260 more minutes, those
//!   that ran out of memory get 500 MB more, always counted from `runtime_min`/`memory_mb`.
//! - A job is given up after `max_resubmits` resubmissions. Set it to `null` to retry forever.
//! - The output of datasets matching a key of `manifest_splits` is spread over that many manifests.
//!
//! ### Lookup tables
//!
//! The cross section table maps process name fragments to a cross section, either
//! bare or as `{xsec: 300.9, isUsed: true}`. Names are matched by substring; the
//! last matching key wins and unknown processes get a cross section of 1.
//!
//! The era table maps an era to its global tags and inputs:
//!
//! ```yaml
//! "2017":
//!   data_tag: 102X_dataRun2_v12
//!   mc_tag: 102X_mc2017_realistic_v7
//!   prefiring_era: 2017BtoF
//!   egamma_era: 2017-Nov17ReReco
//!   lumi_json: /path/to/some/Cert_294927-306462_13TeV_EOY2017ReReco_Collisions17_JSON.txt
//!   wildcards: ["RunIIFall17MiniAODv2*"]
//! ```
//!
//! ### Output
//!
//! - `<work_dir>/Skim/<name>/crabConfig_<name>.py`: the generated grid configuration
//! - `<manifest_dir>/<name>.txt`: one xrootd URL per output file of a finished task
//! - `<work_dir>/merged/<manifest>.root`: the merge of a manifest
//!
mod collector;
mod config;
mod dataset;
mod discovery;
mod grid;
mod job;
mod manifest;
mod merge;
mod nano;
mod params;
mod poller;
mod submit;
mod tables;

use clap::{Arg, ArgAction, ArgMatches, Command};
use collector::OutputCollector;
use color_eyre::eyre::{eyre, Result};
use config::Config;
use discovery::{create_data_list, DasClient};
use env_logger::Env;
use grid::CrabCli;
use manifest::{write_dataset_manifest, OutputManifest};
use merge::{MergeDriver, MergePlan, Strategy};
use nano::ProcessSelection;
use poller::Monitor;
use std::path::{Path, PathBuf};
use submit::{build_descriptors, submit_all};
use tables::{EraTable, XsecTable};

const BANNER_END: &str = "-------------------------------------------------------------";

/// Submit a grid task for every dataset that does not have one yet.
fn submit_command(config: &Config, dry_run: bool) -> Result<()> {
    let jobs = build_descriptors(config)?;
    println!("Built {} job(s) from {} dataset list(s)", jobs.len(), config.dataset_lists.len());
    if dry_run {
        for job in &jobs {
            println!("# {} -> {}", job.dataset(), job.request_name());
            println!(
                "# {} splitting, {} unit(s) per job, {} DBS, work dir {}",
                job.splitting(),
                job.units_per_job(),
                job.input_dbs(),
                job.work_dir().display()
            );
            if !job.systematics().is_empty() {
                println!("# Systematics: {}", job.systematics().join(", "));
            }
            println!("{}", job.render_crab_config());
        }
        return Ok(());
    }
    let client = CrabCli::new(&config.grid_executable);
    let summary = submit_all(&client, &jobs);
    println!(
        "Submitted: {}, already submitted: {}, failed: {}",
        summary.submitted.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
    Ok(())
}

/// Watch every task until it is finished or given up.
fn monitor_command(config: &Config) -> Result<()> {
    let jobs = build_descriptors(config)?;
    let client = CrabCli::new(&config.grid_executable);
    let collector = OutputCollector::new(&client, config);
    let mut monitor = Monitor::new(
        &client,
        collector,
        jobs,
        config.poll_interval(),
        config.max_resubmits,
    );
    println!("Monitoring {} job(s)...", monitor.active());
    let summary = monitor.run()?;
    println!(
        "Finished: {}, abandoned: {} after {} poll(s)",
        summary.finished.len(),
        summary.abandoned.len(),
        summary.rounds
    );
    for name in &summary.abandoned {
        println!("Abandoned: {name}");
    }
    Ok(())
}

fn merge_command(config: &Config, args: &ArgMatches) -> Result<()> {
    let driver = MergeDriver::new(&config.merge_executable);
    let strategy = if args.get_flag("dag") {
        Strategy::Dag {
            submit: args.get_flag("submit-dag"),
        }
    } else {
        Strategy::Direct {
            parallel: config.merge_parallel,
        }
    };
    let out_dir = config.work_dir.join("merged");
    let chunk_size = args
        .get_one::<usize>("chunk-size")
        .copied()
        .unwrap_or(config.merge_chunk_size);

    for manifest_path in args.get_many::<PathBuf>("manifest").into_iter().flatten() {
        let manifest = OutputManifest::read(manifest_path)?;
        if manifest.is_empty() {
            println!("Manifest {} lists no files, skipping", manifest_path.display());
            continue;
        }
        let stem = manifest_path
            .file_stem()
            .ok_or_else(|| eyre!("Manifest {} has no file name", manifest_path.display()))?
            .to_string_lossy()
            .into_owned();
        let plan = MergePlan::new(manifest.files(), &out_dir.join(format!("{stem}.root")), chunk_size)?;
        println!(
            "Merging {} file(s) into {} in {} chunk(s)...",
            manifest.len(),
            plan.output().display(),
            plan.chunks().len()
        );
        driver.run(&plan, strategy, &out_dir.join("dag").join(&stem))?;
    }
    Ok(())
}

fn datalist_command(config: &Config, args: &ArgMatches) -> Result<()> {
    let out_dir = args
        .get_one::<PathBuf>("out-dir")
        .ok_or_else(|| eyre!("An output directory is required"))?;
    std::fs::create_dir_all(out_dir)?;

    let xsec = XsecTable::load(&config.xsec_path)?;
    if xsec.is_empty() {
        return Err(eyre!("Cross section table {} is empty", config.xsec_path.display()));
    }
    println!("Loaded {} process(es) from {}", xsec.len(), config.xsec_path.display());
    let wildcards: Vec<String> = match args.get_many::<String>("wildcard") {
        Some(cards) => cards.cloned().collect(),
        None => EraTable::load(&config.era_path)?
            .get(&config.era)?
            .wildcards
            .clone(),
    };
    if wildcards.is_empty() {
        return Err(eyre!("No wildcards given and none configured for era {}", config.era));
    }

    let discovery = DasClient::new(&config.discovery_executable);
    let datasets = create_data_list(&discovery, &xsec, &wildcards)?;
    let path = out_dir.join("filelist_bkg_MINI.yaml");
    write_dataset_manifest(&path, &wildcards, &datasets)?;
    println!("Wrote {} dataset(s) to {}", datasets.len(), path.display());
    Ok(())
}

fn nano_command(config: &Config, args: &ArgMatches) -> Result<()> {
    let skim_dir = config.work_dir.join(
        args.get_one::<String>("skim-dir")
            .map(String::as_str)
            .unwrap_or("Skim"),
    );
    let channels: Vec<String> = args
        .get_many::<String>("channel")
        .into_iter()
        .flatten()
        .cloned()
        .collect();
    params::validate_channels(&channels)?;

    if args.get_flag("submit") {
        let selection = ProcessSelection::parse(
            args.get_one::<String>("process")
                .map(String::as_str)
                .unwrap_or("all"),
        )?;
        let xsec = XsecTable::load(&config.xsec_path)?;
        let discovery = DasClient::new(&config.discovery_executable);
        let jobs = nano::build_job_table(&discovery, &selection.lists(config), &xsec)?;
        let sub_path = nano::submit(&jobs, &channels, &skim_dir, &config.nano_executable)?;
        println!("Submitted {} batch job(s) from {}", jobs.len(), sub_path.display());
    }

    if args.get_flag("merge") {
        let driver = MergeDriver::new(&config.merge_executable);
        nano::merge_outputs(&skim_dir, &driver, config.merge_chunk_size, config.merge_parallel)?;
        println!("Merged outputs in {}", skim_dir.display());
    }
    Ok(())
}

fn params_command(config: &Config, args: &ArgMatches) -> Result<()> {
    let outname = args
        .get_one::<String>("outname")
        .ok_or_else(|| eyre!("An output name is required"))?;
    let era = args
        .get_one::<String>("era")
        .cloned()
        .unwrap_or_else(|| config.era.clone());
    let channels: Vec<String> = args
        .get_many::<String>("channel")
        .into_iter()
        .flatten()
        .cloned()
        .collect();
    let xsec = XsecTable::load(&config.xsec_path)?;
    let eras = EraTable::load(&config.era_path)?;
    let parameters = params::resolve(outname, &era, &channels, &xsec, &eras)?;
    print!("{}", serde_yaml::to_string(&parameters)?);
    Ok(())
}

fn channel_arg(default: &'static [&'static str]) -> Arg {
    Arg::new("channel")
        .long("channel")
        .num_args(1..)
        .default_values(default.iter().copied())
        .help("Final states of interest")
}

/// Program entry point. Handles the CLI.
fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init_from_env(Env::default().filter_or("SKIMMER_LOG", "info"));

    let cli = Command::new("skimmer")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("Path to a configuration file (YAML)"),
        )
        .subcommand(Command::new("new").about("Create a new template config file"))
        .subcommand(
            Command::new("submit")
                .about("Submit a grid task for every dataset")
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Print the grid configurations instead of submitting"),
                ),
        )
        .subcommand(Command::new("monitor").about("Watch the grid tasks until they are done"))
        .subcommand(
            Command::new("merge")
                .about("Merge the files listed in manifests")
                .arg(
                    Arg::new("manifest")
                        .required(true)
                        .num_args(1..)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Manifest file(s) to merge"),
                )
                .arg(
                    Arg::new("chunk-size")
                        .long("chunk-size")
                        .value_parser(clap::value_parser!(usize))
                        .help("Files per intermediate merge (default from config)"),
                )
                .arg(
                    Arg::new("dag")
                        .long("dag")
                        .action(ArgAction::SetTrue)
                        .help("Write an HTCondor DAG instead of merging here"),
                )
                .arg(
                    Arg::new("submit-dag")
                        .long("submit-dag")
                        .action(ArgAction::SetTrue)
                        .requires("dag")
                        .help("Submit the DAG after writing it"),
                ),
        )
        .subcommand(
            Command::new("datalist")
                .about("Find the MINIAOD dataset of every used background process")
                .arg(
                    Arg::new("out-dir")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Directory for the dataset list"),
                )
                .arg(
                    Arg::new("wildcard")
                        .long("wildcard")
                        .num_args(1..)
                        .help("Campaign wildcards, tried in order (default from era table)"),
                ),
        )
        .subcommand(
            Command::new("nano")
                .about("Batch skims of NANOAOD datasets")
                .arg(
                    Arg::new("submit")
                        .long("submit")
                        .action(ArgAction::SetTrue)
                        .help("Submit all the jobs"),
                )
                .arg(
                    Arg::new("merge")
                        .long("merge")
                        .action(ArgAction::SetTrue)
                        .help("Merge output together"),
                )
                .arg(channel_arg(&["mu4j", "e4j"]))
                .arg(
                    Arg::new("process")
                        .long("process")
                        .default_value("all")
                        .help("Type of process to be skimmed (all, data, bkg)"),
                )
                .arg(
                    Arg::new("skim-dir")
                        .long("skim-dir")
                        .default_value("Skim")
                        .help("Skim directory inside the work dir"),
                ),
        )
        .subcommand(
            Command::new("params")
                .about("Print the analyzer parameters for an output file")
                .arg(
                    Arg::new("outname")
                        .long("outname")
                        .required(true)
                        .help("Name of the skim output file"),
                )
                .arg(
                    Arg::new("era")
                        .long("era")
                        .help("Data-taking era (default from config)"),
                )
                .arg(channel_arg(&params::SKIM_CHANNELS)),
        )
        .get_matches();

    println!("------------------------- Skimmer ---------------------------");
    let config_path: &Path = cli
        .get_one::<PathBuf>("config")
        .ok_or_else(|| eyre!("A configuration file is required"))?;

    // Handle the new subcommand
    if let Some(("new", _)) = cli.subcommand() {
        println!(
            "Making a template configuration file at {}...",
            config_path.display()
        );
        Config::default().save(config_path)?;
        println!("Done.");
        println!("{BANNER_END}");
        return Ok(());
    }

    let config = Config::load(config_path)?;
    println!(
        "Successfully loaded configuration from {}",
        config_path.display()
    );

    let result = match cli.subcommand() {
        Some(("submit", args)) => submit_command(&config, args.get_flag("dry-run")),
        Some(("monitor", _)) => monitor_command(&config),
        Some(("merge", args)) => merge_command(&config, args),
        Some(("datalist", args)) => datalist_command(&config, args),
        Some(("nano", args)) => nano_command(&config, args),
        Some(("params", args)) => params_command(&config, args),
        _ => Err(eyre!("Unknown command")),
    };
    if result.is_ok() {
        println!("Complete.");
    }
    println!("{BANNER_END}");

    result
}
