//! The grid submission client and the status documents it returns.
use color_eyre::eyre::{eyre, Result, WrapErr};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use super::job::{JobDescriptor, Resources};

/// Task status reported when the submission itself did not go through
pub const SUBMIT_FAILED: &str = "SUBMITFAILED";
/// Database states in which failed subtasks may be resubmitted
pub const RESUBMITTABLE_DB_STATES: [&str; 2] = ["SUBMITTED", "RESUBMITFAILED"];

/// State of a single subtask.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SubtaskInfo {
    #[serde(rename = "State")]
    pub state: String,
    /// Exit code first, followed by free-form details
    #[serde(rename = "Error", default)]
    pub error: Option<Vec<serde_json::Value>>,
}

impl SubtaskInfo {
    pub fn exit_code(&self) -> Option<i64> {
        self.error.as_ref()?.first()?.as_i64()
    }
}

/// One poll of a grid task.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StatusReport {
    pub status: String,
    #[serde(rename = "dbStatus", default)]
    pub db_status: String,
    #[serde(rename = "jobsPerStatus", default)]
    pub jobs_per_status: FxHashMap<String, u32>,
    #[serde(default)]
    pub jobs: BTreeMap<String, SubtaskInfo>,
}

impl StatusReport {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).wrap_err("Could not parse grid status report")
    }

    pub fn count(&self, state: &str) -> u32 {
        self.jobs_per_status.get(state).copied().unwrap_or(0)
    }

    pub fn submit_failed(&self) -> bool {
        self.status == SUBMIT_FAILED
    }

    pub fn resubmittable(&self) -> bool {
        RESUBMITTABLE_DB_STATES.contains(&self.db_status.as_str())
    }

    /// All subtasks report finished. A task without subtasks is never finished.
    pub fn all_finished(&self) -> bool {
        !self.jobs.is_empty() && self.count("finished") as usize == self.jobs.len()
    }

    pub fn exit_codes(&self) -> Vec<i64> {
        self.jobs.values().filter_map(SubtaskInfo::exit_code).collect()
    }

    /// Subtask ids in numeric order
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.keys().cloned().collect();
        ids.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), id.clone()));
        ids
    }
}

/// Operations the skimmer needs from the grid submission service.
pub trait GridClient: Sync {
    fn submit(&self, job: &JobDescriptor) -> Result<()>;
    fn status(&self, grid_dir: &Path) -> Result<StatusReport>;
    fn resubmit(&self, grid_dir: &Path, limits: Resources) -> Result<()>;
    /// Locations of the output files of the given subtasks
    fn get_output(&self, grid_dir: &Path, job_ids: &[String]) -> Result<Vec<String>>;
}

/// Drives the `crab` command line client.
#[derive(Debug, Clone)]
pub struct CrabCli {
    executable: String,
}

impl CrabCli {
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.executable)
            .args(args)
            .output()
            .wrap_err_with(|| format!("Could not launch {}", self.executable))?;
        if !output.status.success() {
            return Err(eyre!(
                "{} {} failed ({}): {}",
                self.executable,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl GridClient for CrabCli {
    fn submit(&self, job: &JobDescriptor) -> Result<()> {
        let config_path = job.write_crab_config()?;
        self.run(&[
            String::from("submit"),
            String::from("--config"),
            config_path.display().to_string(),
        ])?;
        Ok(())
    }

    fn status(&self, grid_dir: &Path) -> Result<StatusReport> {
        let stdout = self.run(&[
            String::from("status"),
            String::from("--dir"),
            grid_dir.display().to_string(),
            String::from("--json"),
        ])?;
        let json = stdout
            .lines()
            .find(|line| line.trim_start().starts_with('{'))
            .ok_or_else(|| eyre!("No status document for {}", grid_dir.display()))?;
        StatusReport::from_json(json)
    }

    fn resubmit(&self, grid_dir: &Path, limits: Resources) -> Result<()> {
        self.run(&[
            String::from("resubmit"),
            String::from("--dir"),
            grid_dir.display().to_string(),
            format!("--maxmemory={}", limits.memory_mb),
            format!("--maxjobruntime={}", limits.runtime_min),
        ])?;
        Ok(())
    }

    fn get_output(&self, grid_dir: &Path, job_ids: &[String]) -> Result<Vec<String>> {
        let stdout = self.run(&[
            String::from("getoutput"),
            String::from("--dir"),
            grid_dir.display().to_string(),
            String::from("--dump"),
            format!("--jobids={}", job_ids.join(",")),
        ])?;
        Ok(parse_dump(&stdout))
    }
}

/// Pull the file locations out of a `getoutput --dump` listing. Logical file
/// names are preferred, physical names are the fallback.
pub fn parse_dump(stdout: &str) -> Vec<String> {
    let collect = |tag: &str| -> Vec<String> {
        stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix(tag))
            .map(|location| location.trim().to_string())
            .filter(|location| !location.is_empty())
            .collect()
    };
    let lfns = collect("LFN:");
    if lfns.is_empty() {
        collect("PFN:")
    } else {
        lfns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = r#"{
        "status": "SUBMITTED",
        "dbStatus": "SUBMITTED",
        "jobsPerStatus": {"finished": 2, "failed": 1},
        "jobs": {
            "1": {"State": "finished"},
            "10": {"State": "failed", "Error": [50664, "Job exceeded maximum wall clock time"]},
            "2": {"State": "finished"}
        }
    }"#;

    #[test]
    fn parses_status_document() {
        let report = StatusReport::from_json(STATUS).unwrap();
        assert_eq!(report.count("finished"), 2);
        assert_eq!(report.count("running"), 0);
        assert!(report.resubmittable());
        assert!(!report.submit_failed());
        assert!(!report.all_finished());
        assert_eq!(report.exit_codes(), vec![50664]);
        assert_eq!(report.job_ids(), vec!["1", "2", "10"]);
    }

    #[test]
    fn empty_task_is_not_finished() {
        let report = StatusReport::from_json(r#"{"status": "NEW"}"#).unwrap();
        assert!(!report.all_finished());
        assert!(report.job_ids().is_empty());
    }

    #[test]
    fn dump_prefers_logical_names() {
        let stdout = "LFN: /store/user/a/1.root\nPFN: srm://x/1.root\nLFN: /store/user/a/2.root\n";
        assert_eq!(
            parse_dump(stdout),
            vec!["/store/user/a/1.root", "/store/user/a/2.root"]
        );

        let stdout = "PFN: srm://x/1.root\n";
        assert_eq!(parse_dump(stdout), vec!["srm://x/1.root"]);
    }
}
