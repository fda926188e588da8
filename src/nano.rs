//! Batch (HTCondor) skimming of NANOAOD datasets, one batch job per input file.
use color_eyre::eyre::{eyre, Result, WrapErr};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::config::{Config, GLOBAL_REDIRECTOR};
use super::dataset::{derive_job_name, read_dataset_list};
use super::discovery::DatasetDiscovery;
use super::merge::{MergeDriver, MergePlan};
use super::tables::{is_data, XsecTable};

/// Directories in a skim dir that do not belong to a process
const BOOKKEEPING: [&str; 4] = ["condor.sub", "log", "err", "out"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSelection {
    All,
    Data,
    Bkg,
}

impl ProcessSelection {
    pub fn parse(selection: &str) -> Result<Self> {
        match selection {
            "all" => Ok(Self::All),
            "data" => Ok(Self::Data),
            "bkg" => Ok(Self::Bkg),
            other => Err(eyre!("Unknown process selection {other}! Use all, data or bkg")),
        }
    }

    pub fn lists(&self, config: &Config) -> Vec<PathBuf> {
        match self {
            Self::All => config
                .nano_lists
                .bkg
                .iter()
                .chain(config.nano_lists.data.iter())
                .cloned()
                .collect(),
            Self::Data => config.nano_lists.data.clone(),
            Self::Bkg => config.nano_lists.bkg.clone(),
        }
    }
}

/// One row of the condor queue table
#[derive(Debug, Clone, PartialEq)]
pub struct BatchJob {
    pub file: String,
    pub is_data: bool,
    pub xsec: f64,
    pub name: String,
    pub index: usize,
}

/// One job per file of every dataset in the given lists.
pub fn build_job_table<D: DatasetDiscovery>(
    discovery: &D,
    lists: &[PathBuf],
    xsec: &XsecTable,
) -> Result<Vec<BatchJob>> {
    let mut jobs = Vec::new();
    for list in lists {
        for dataset in read_dataset_list(list)? {
            let name = derive_job_name(&dataset)?;
            let dataset_xsec = xsec.lookup(&name);
            let data = is_data(&name);
            let files = discovery.files(&dataset)?;
            info!("{name}: {} file(s)", files.len());
            jobs.extend(files.iter().enumerate().map(|(index, file)| BatchJob {
                file: format!("{GLOBAL_REDIRECTOR}{file}"),
                is_data: data,
                xsec: dataset_xsec,
                name: name.clone(),
                index,
            }));
        }
    }
    Ok(jobs)
}

/// Python-style booleans, which the skim script expects
fn py_bool(flag: bool) -> &'static str {
    if flag {
        "True"
    } else {
        "False"
    }
}

pub fn render_submit_file(
    jobs: &[BatchJob],
    channels: &[String],
    skim_dir: &Path,
    executable: &Path,
) -> String {
    let skim_dir = skim_dir.display();
    let mut lines = vec![
        String::from("universe = vanilla"),
        format!("executable = {}", executable.display()),
        format!(
            "arguments = $(fileName) $(isData) '{}' $(xSec) $(outName) $(job) $(skimDir)",
            channels.join(" ")
        ),
        format!("log = {skim_dir}/log/$(outName)_$(job).log"),
        format!("error = {skim_dir}/err/$(outName)_$(job).err"),
        String::from("getenv = True"),
        format!("output = {skim_dir}/out/$(outName)_$(job).out"),
        String::from("queue fileName isData xSec outName job skimDir from ("),
    ];
    lines.extend(jobs.iter().map(|job| {
        format!(
            "{} {} {} {} {} {skim_dir}",
            job.file,
            py_bool(job.is_data),
            job.xsec,
            job.name,
            job.index
        )
    }));
    lines.push(String::from(")"));
    lines.join("\n")
}

/// Write `condor.sub` into the skim dir and hand it to the scheduler.
pub fn submit(jobs: &[BatchJob], channels: &[String], skim_dir: &Path, executable: &Path) -> Result<PathBuf> {
    for d in ["out", "log", "err"] {
        fs::create_dir_all(skim_dir.join(d))?;
    }
    let sub_path = skim_dir.join("condor.sub");
    fs::write(&sub_path, render_submit_file(jobs, channels, skim_dir, executable))?;

    let status = Command::new("condor_submit")
        .arg(&sub_path)
        .status()
        .wrap_err("Could not launch condor_submit")?;
    if !status.success() {
        return Err(eyre!("condor_submit {} failed ({status})", sub_path.display()));
    }
    Ok(sub_path)
}

/// Process directories of a skim dir, sorted
pub fn process_dirs(skim_dir: &Path) -> Result<Vec<String>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(skim_dir)
        .wrap_err_with(|| format!("Could not read skim dir {}", skim_dir.display()))?
    {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !BOOKKEEPING.contains(&name.as_str()) {
            dirs.push(name);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Merge `<process>/output/*` into `<process>/merged/<process>.root` for every process.
pub fn merge_outputs(skim_dir: &Path, driver: &MergeDriver, chunk_size: usize, parallel: usize) -> Result<()> {
    for process in process_dirs(skim_dir)? {
        let output_dir = skim_dir.join(&process).join("output");
        if !output_dir.is_dir() {
            continue;
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&output_dir)? {
            files.push(entry?.path().display().to_string());
        }
        if files.is_empty() {
            continue;
        }
        files.sort();
        let merged = skim_dir
            .join(&process)
            .join("merged")
            .join(format!("{process}.root"));
        let plan = MergePlan::new(&files, &merged, chunk_size)?;
        driver.run_direct(&plan, parallel)?;
    }
    Ok(())
}
