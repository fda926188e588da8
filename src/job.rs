use color_eyre::eyre::Result;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use super::config::Config;
use super::dataset::derive_job_name;
use super::tables::is_signal;

/// Prefix of every grid request name
pub const REQUEST_PREFIX: &str = "MiniSkim";

/// Resource limits requested from the grid for every subtask of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub memory_mb: u32,
    pub runtime_min: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Splitting {
    EventAwareLumiBased,
    FileBased,
}

impl fmt::Display for Splitting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventAwareLumiBased => write!(f, "EventAwareLumiBased"),
            Self::FileBased => write!(f, "FileBased"),
        }
    }
}

/// Where the grid looks the dataset up. Privately produced signal lives in phys03.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputDbs {
    Global,
    Phys03,
}

impl fmt::Display for InputDbs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Phys03 => write!(f, "phys03"),
        }
    }
}

/// Everything needed to submit the skim of one dataset. Built once per dataset
/// and never changed afterwards; resubmissions derive new limits from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDescriptor {
    dataset: String,
    name: String,
    request_name: String,
    work_dir: PathBuf,
    grid_dir: PathBuf,
    systematics: Vec<String>,
    resources: Resources,
    splitting: Splitting,
    units_per_job: u32,
    input_dbs: InputDbs,
    storage_site: String,
    out_lfn_dir_base: String,
    vo_group: String,
    pset_name: String,
}

impl JobDescriptor {
    pub fn build(dataset: &str, config: &Config) -> Result<Self> {
        let name = derive_job_name(dataset)?;
        let request_name = format!("{REQUEST_PREFIX}_{name}");
        let work_dir = config.skim_dir().join(&name);
        let grid_dir = work_dir.join(format!("crab_{request_name}"));
        let signal = is_signal(&name);

        Ok(Self {
            dataset: dataset.to_string(),
            name,
            request_name,
            work_dir,
            grid_dir,
            systematics: config.systematics.clone(),
            resources: config.base_resources(),
            splitting: if signal {
                Splitting::FileBased
            } else {
                Splitting::EventAwareLumiBased
            },
            units_per_job: if signal { 1 } else { 250_000 },
            input_dbs: if signal {
                InputDbs::Phys03
            } else {
                InputDbs::Global
            },
            storage_site: config.storage_site.clone(),
            out_lfn_dir_base: config.out_lfn_dir_base.clone(),
            vo_group: config.vo_group.clone(),
            pset_name: config.pset_name.clone(),
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_name(&self) -> &str {
        &self.request_name
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The grid client's bookkeeping directory for this request
    pub fn grid_dir(&self) -> &Path {
        &self.grid_dir
    }

    pub fn results_dir(&self) -> PathBuf {
        self.grid_dir.join("results")
    }

    /// Systematic variations of the skim. The analyzer configuration only takes
    /// `channel`, `filename` and `outname`, so these never reach `pyCfgParams`.
    pub fn systematics(&self) -> &[String] {
        &self.systematics
    }

    pub fn resources(&self) -> Resources {
        self.resources
    }

    pub fn splitting(&self) -> Splitting {
        self.splitting
    }

    pub fn units_per_job(&self) -> u32 {
        self.units_per_job
    }

    pub fn input_dbs(&self) -> InputDbs {
        self.input_dbs
    }

    pub fn output_file(&self) -> String {
        format!("{}.root", self.name)
    }

    pub fn crab_config_path(&self) -> PathBuf {
        self.work_dir.join(format!("crabConfig_{}.py", self.name))
    }

    /// Render the grid client configuration for this job
    pub fn render_crab_config(&self) -> String {

        let lines = [
            String::from("from CRABClient.UserUtilities import config"),
            String::new(),
            String::from("config = config()"),
            String::new(),
            format!("config.General.requestName = \"{}\"", self.request_name),
            format!("config.General.workArea = \"{}\"", self.work_dir.display()),
            String::from("config.General.transferOutputs = True"),
            String::from("config.General.transferLogs = False"),
            String::new(),
            String::from("config.JobType.pluginName = \"Analysis\""),
            format!("config.JobType.psetName = \"{}\"", self.pset_name),
            format!(
                "config.JobType.pyCfgParams = [\"outname={}\"]",
                self.output_file()
            ),
            format!("config.JobType.outputFiles = [\"{}\"]", self.output_file()),
            format!("config.JobType.maxMemoryMB = {}", self.resources.memory_mb),
            format!(
                "config.JobType.maxJobRuntimeMin = {}",
                self.resources.runtime_min
            ),
            String::new(),
            format!("config.Data.inputDataset = \"{}\"", self.dataset),
            format!("config.Data.inputDBS = \"{}\"", self.input_dbs),
            format!("config.Data.splitting = \"{}\"", self.splitting),
            format!("config.Data.unitsPerJob = {}", self.units_per_job),
            format!("config.Data.outLFNDirBase = \"{}\"", self.out_lfn_dir_base),
            String::new(),
            format!("config.Site.storageSite = \"{}\"", self.storage_site),
            format!("config.User.voGroup = \"{}\"", self.vo_group),
        ];
        let mut rendered = lines.join("\n");
        rendered.push('\n');
        rendered
    }

    /// Write the grid client configuration into the work dir, returning its path
    pub fn write_crab_config(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.work_dir)?;
        let path = self.crab_config_path();
        std::fs::write(&path, self.render_crab_config())?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            work_dir: PathBuf::from("/work"),
            systematics: vec![String::from("JEC"), String::from("JER")],
            ..Default::default()
        }
    }

    #[test]
    fn background_descriptor() {
        let job = JobDescriptor::build(
            "/TTToSemiLeptonic_TuneCP5_13TeV-powheg-pythia8/RunIIFall17MiniAODv2-v1/MINIAODSIM",
            &config(),
        )
        .unwrap();
        let name = "TTToSemiLeptonic_TuneCP5_13TeV-powheg-pythia8";
        assert_eq!(job.name(), name);
        assert_eq!(job.request_name(), format!("MiniSkim_{name}"));
        assert_eq!(job.work_dir(), Path::new("/work/Skim").join(name));
        assert_eq!(
            job.grid_dir(),
            Path::new("/work/Skim")
                .join(name)
                .join(format!("crab_MiniSkim_{name}"))
        );
        assert_eq!(job.splitting(), Splitting::EventAwareLumiBased);
        assert_eq!(job.units_per_job(), 250_000);
        assert_eq!(job.input_dbs(), InputDbs::Global);
        assert_eq!(job.systematics().len(), 2);
    }

    #[test]
    fn signal_descriptor() {
        let job = JobDescriptor::build(
            "/HPlusAndH_ToWHH_ToL4B_200_100/dbrunner-MiniAOD/USER",
            &config(),
        )
        .unwrap();
        assert_eq!(job.splitting(), Splitting::FileBased);
        assert_eq!(job.units_per_job(), 1);
        assert_eq!(job.input_dbs(), InputDbs::Phys03);
    }

    #[test]
    fn crab_config_contains_limits_and_dataset() {
        let job =
            JobDescriptor::build("/SingleMuon/Run2017B-31Mar2018-v1/MINIAOD", &config()).unwrap();
        let rendered = job.render_crab_config();
        assert!(rendered
            .contains("config.General.requestName = \"MiniSkim_SingleMuon_Run2017B-31Mar2018-v1\""));
        assert!(rendered.contains("config.JobType.maxMemoryMB = 2500"));
        assert!(rendered.contains("config.JobType.maxJobRuntimeMin = 1440"));
        assert!(rendered.contains(
            "config.JobType.pyCfgParams = [\"outname=SingleMuon_Run2017B-31Mar2018-v1.root\"]\n"
        ));
        assert!(!rendered.contains("systematics"));
        assert!(rendered.contains("config.Data.inputDBS = \"global\""));
        assert!(rendered.contains("config.Data.splitting = \"EventAwareLumiBased\""));
        assert!(rendered.ends_with('\n'));
    }
}
