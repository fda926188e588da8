//! Building job descriptors from the dataset lists and submitting them.
use color_eyre::eyre::{eyre, Result};
use log::{error, info};
use std::thread;

use super::config::Config;
use super::dataset::read_dataset_list;
use super::grid::GridClient;
use super::job::JobDescriptor;

/// One descriptor per dataset over all configured lists, in list order.
pub fn build_descriptors(config: &Config) -> Result<Vec<JobDescriptor>> {
    let mut jobs = Vec::new();
    for list in &config.dataset_lists {
        for dataset in read_dataset_list(list)? {
            jobs.push(JobDescriptor::build(&dataset, config)?);
        }
    }
    Ok(jobs)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubmitSummary {
    pub submitted: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// Submit every job that has no grid directory yet, each from its own thread,
/// and wait for all of them. Failures are logged and left to the monitor.
pub fn submit_all<G: GridClient>(client: &G, jobs: &[JobDescriptor]) -> SubmitSummary {
    let mut summary = SubmitSummary::default();
    let pending: Vec<&JobDescriptor> = jobs
        .iter()
        .filter(|job| {
            let exists = job.grid_dir().exists();
            if exists {
                info!("{} already submitted, skipping", job.name());
                summary.skipped.push(job.name().to_string());
            }
            !exists
        })
        .collect();

    let results: Vec<(String, Result<()>)> = thread::scope(|scope| {
        let handles: Vec<_> = pending
            .iter()
            .map(|job| {
                (
                    job.name().to_string(),
                    scope.spawn(move || client.submit(job)),
                )
            })
            .collect();
        handles
            .into_iter()
            .map(|(name, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(eyre!("Submission thread panicked")));
                (name, result)
            })
            .collect()
    });

    for (name, result) in results {
        match result {
            Ok(()) => summary.submitted.push(name),
            Err(e) => {
                error!("Submission of {name} failed: {e:?}");
                summary.failed.push(name);
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::StatusReport;
    use crate::job::Resources;
    use std::env;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingGrid {
        submitted: Mutex<Vec<String>>,
    }

    impl GridClient for RecordingGrid {
        fn submit(&self, job: &JobDescriptor) -> Result<()> {
            if job.name().starts_with("MET") {
                return Err(eyre!("proxy expired"));
            }
            self.submitted.lock().unwrap().push(job.name().to_string());
            Ok(())
        }

        fn status(&self, _grid_dir: &Path) -> Result<StatusReport> {
            Err(eyre!("not used"))
        }

        fn resubmit(&self, _grid_dir: &Path, _limits: Resources) -> Result<()> {
            Ok(())
        }

        fn get_output(&self, _grid_dir: &Path, _job_ids: &[String]) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    #[test]
    fn fans_out_and_skips_existing() {
        let dir = env::temp_dir().join("skimmer_test_submit_all");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let list = dir.join("filelist.txt");
        fs::write(
            &list,
            "/DYJetsToLL_M-50/Fall17-v1/MINIAODSIM\n/WW_TuneCP5/Fall17-v1/MINIAODSIM\n/MET/Run2017B-31Mar2018-v1/MINIAOD\n/WZ_TuneCP5/Fall17-v1/MINIAODSIM\n",
        )
        .unwrap();
        let config = Config {
            work_dir: dir.clone(),
            dataset_lists: vec![list],
            ..Default::default()
        };
        let jobs = build_descriptors(&config).unwrap();
        assert_eq!(jobs.len(), 4);
        fs::create_dir_all(jobs[3].grid_dir()).unwrap();

        let grid = RecordingGrid::default();
        let summary = submit_all(&grid, &jobs);
        let mut submitted = summary.submitted.clone();
        submitted.sort();
        assert_eq!(submitted, vec!["DYJetsToLL_M-50", "WW_TuneCP5"]);
        assert_eq!(summary.failed, vec!["MET_Run2017B-31Mar2018-v1"]);
        assert_eq!(summary.skipped, vec!["WZ_TuneCP5"]);
        assert_eq!(grid.submitted.lock().unwrap().len(), 2);

        let _ = fs::remove_dir_all(&dir);
    }
}
