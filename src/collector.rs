//! Retrieval of output locations for finished grid tasks.
use color_eyre::eyre::{eyre, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::config::Config;
use super::grid::{GridClient, StatusReport};
use super::job::JobDescriptor;
use super::manifest::OutputManifest;

/// Turn a location reported by the grid into something the merge tool can open.
/// Logical file names get the site prefix; URLs and local paths pass through.
pub fn to_url(location: &str, prefix: &str) -> String {
    if location.starts_with("/store/") {
        format!("{prefix}{location}")
    } else {
        location.to_string()
    }
}

#[derive(Debug)]
pub struct OutputCollector<'a, G: GridClient> {
    client: &'a G,
    batch_size: usize,
    retries: Option<u32>,
    retry_wait: Duration,
    prefix: String,
    manifest_dir: PathBuf,
    splits: BTreeMap<String, usize>,
}

impl<'a, G: GridClient> OutputCollector<'a, G> {
    pub fn new(client: &'a G, config: &Config) -> Self {
        Self {
            client,
            batch_size: config.output_batch_size.max(1),
            retries: config.output_retries,
            retry_wait: config.poll_interval(),
            prefix: config.site_prefix().to_string(),
            manifest_dir: config.manifest_dir.clone(),
            splits: config.manifest_splits.clone(),
        }
    }

    #[cfg(test)]
    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    /// Number of manifests the output of `name` is spread over
    pub fn parts_for(&self, name: &str) -> usize {
        self.splits
            .iter()
            .find(|(key, _)| name.contains(key.as_str()))
            .map(|(_, parts)| (*parts).max(1))
            .unwrap_or(1)
    }

    /// Manifest path(s) for a job, in write order
    pub fn manifest_paths(&self, name: &str) -> Vec<PathBuf> {
        match self.parts_for(name) {
            1 => vec![self.manifest_dir.join(format!("{name}.txt"))],
            parts => (0..parts)
                .map(|idx| self.manifest_dir.join(format!("{name}_{idx}.txt")))
                .collect(),
        }
    }

    /// Gather the output locations of a finished job and write its manifest(s).
    pub fn collect(&self, job: &JobDescriptor, report: &StatusReport) -> Result<Vec<PathBuf>> {
        if !report.all_finished() {
            return Err(eyre!(
                "Refusing to write the manifest of {}: {} of {} subtasks finished",
                job.name(),
                report.count("finished"),
                report.jobs.len()
            ));
        }

        let job_ids = report.job_ids();
        let locations = match self.local_results(job, job_ids.len())? {
            Some(local) => {
                info!("Output of {} already retrieved, skipping", job.name());
                local
            }
            None => {
                let mut locations = Vec::with_capacity(job_ids.len());
                for batch in job_ids.chunks(self.batch_size) {
                    locations.extend(self.fetch_batch(job.grid_dir(), batch)?);
                }
                locations
            }
        };

        let manifest = OutputManifest::new(
            locations
                .iter()
                .map(|location| to_url(location, &self.prefix))
                .collect(),
        );
        let paths = self.manifest_paths(job.name());
        for (part, path) in manifest.split(paths.len()).iter().zip(&paths) {
            part.write(path)?;
            debug!("Wrote {} locations to {}", part.len(), path.display());
        }
        Ok(paths)
    }

    /// Files already in the results dir, if there is one per subtask.
    fn local_results(&self, job: &JobDescriptor, expected: usize) -> Result<Option<Vec<String>>> {
        let results_dir = job.results_dir();
        if !results_dir.exists() {
            return Ok(None);
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&results_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path().display().to_string());
            }
        }
        if files.len() == expected {
            files.sort();
            Ok(Some(files))
        } else {
            Ok(None)
        }
    }

    fn fetch_batch(&self, grid_dir: &Path, batch: &[String]) -> Result<Vec<String>> {
        let mut attempt = 0;
        loop {
            match self.client.get_output(grid_dir, batch) {
                Ok(locations) => return Ok(locations),
                Err(e) => {
                    attempt += 1;
                    if self.retries.is_some_and(|max| attempt > max) {
                        return Err(e.wrap_err(format!(
                            "Output retrieval for {} failed {attempt} times",
                            grid_dir.display()
                        )));
                    }
                    warn!(
                        "Output retrieval for {} failed (attempt {attempt}), retrying: {e}",
                        grid_dir.display()
                    );
                    std::thread::sleep(self.retry_wait);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::job::Resources;
    use std::env;
    use std::fs;
    use std::sync::Mutex;

    /// Grid client serving canned output listings
    #[derive(Debug, Default)]
    pub struct FakeOutputs {
        pub failures_left: Mutex<u32>,
        pub requests: Mutex<Vec<Vec<String>>>,
    }

    impl GridClient for FakeOutputs {
        fn submit(&self, _job: &JobDescriptor) -> Result<()> {
            Ok(())
        }

        fn status(&self, _grid_dir: &Path) -> Result<StatusReport> {
            Err(eyre!("not used"))
        }

        fn resubmit(&self, _grid_dir: &Path, _limits: Resources) -> Result<()> {
            Ok(())
        }

        fn get_output(&self, _grid_dir: &Path, job_ids: &[String]) -> Result<Vec<String>> {
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(eyre!("transient"));
            }
            self.requests.lock().unwrap().push(job_ids.to_vec());
            Ok(job_ids
                .iter()
                .map(|id| format!("/store/user/skim/out_{id}.root"))
                .collect())
        }
    }

    pub fn finished_report(n_jobs: usize) -> StatusReport {
        let jobs: String = (1..=n_jobs)
            .map(|id| format!("\"{id}\": {{\"State\": \"finished\"}}"))
            .collect::<Vec<_>>()
            .join(",");
        StatusReport::from_json(&format!(
            "{{\"status\": \"COMPLETED\", \"dbStatus\": \"SUBMITTED\", \"jobsPerStatus\": {{\"finished\": {n_jobs}}}, \"jobs\": {{{jobs}}}}}"
        ))
        .unwrap()
    }

    fn config(dir: &Path) -> Config {
        Config {
            work_dir: dir.to_path_buf(),
            manifest_dir: dir.join("manifests"),
            output_batch_size: 4,
            ..Default::default()
        }
    }

    #[test]
    fn url_rewriting() {
        let prefix = "root://dcache-cms-xrootd.desy.de/";
        assert_eq!(
            to_url("/store/user/skim/a.root", prefix),
            "root://dcache-cms-xrootd.desy.de//store/user/skim/a.root"
        );
        assert_eq!(to_url("root://x//store/a.root", prefix), "root://x//store/a.root");
        assert_eq!(to_url("/local/results/a.root", prefix), "/local/results/a.root");
    }

    #[test]
    fn collects_in_batches_with_retries() {
        let dir = env::temp_dir().join("skimmer_test_collect_batches");
        let _ = fs::remove_dir_all(&dir);
        let config = config(&dir);
        let client = FakeOutputs {
            failures_left: Mutex::new(2),
            ..Default::default()
        };
        let collector = OutputCollector::new(&client, &config).with_retry_wait(Duration::ZERO);
        let job = JobDescriptor::build("/DYJetsToLL_M-50/Fall17-v1/MINIAODSIM", &config).unwrap();

        let paths = collector.collect(&job, &finished_report(10)).unwrap();
        assert_eq!(paths, vec![dir.join("manifests").join("DYJetsToLL_M-50.txt")]);

        let requests = client.requests.lock().unwrap();
        let sizes: Vec<usize> = requests.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let manifest = OutputManifest::read(&paths[0]).unwrap();
        assert_eq!(manifest.len(), 10);
        assert!(manifest.files()[0].starts_with("root://dcache-cms-xrootd.desy.de//store/"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn retry_ceiling_gives_up() {
        let dir = env::temp_dir().join("skimmer_test_collect_ceiling");
        let _ = fs::remove_dir_all(&dir);
        let config = Config {
            output_retries: Some(1),
            ..config(&dir)
        };
        let client = FakeOutputs {
            failures_left: Mutex::new(5),
            ..Default::default()
        };
        let collector = OutputCollector::new(&client, &config).with_retry_wait(Duration::ZERO);
        let job = JobDescriptor::build("/DYJetsToLL_M-50/Fall17-v1/MINIAODSIM", &config).unwrap();
        assert!(collector.collect(&job, &finished_report(3)).is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn named_dataset_is_split_over_three_manifests() {
        let dir = env::temp_dir().join("skimmer_test_collect_split");
        let _ = fs::remove_dir_all(&dir);
        let config = config(&dir);
        let client = FakeOutputs::default();
        let collector = OutputCollector::new(&client, &config);
        let job = JobDescriptor::build(
            "/TTToSemiLeptonic_TuneCP5_13TeV-powheg-pythia8/Fall17-v1/MINIAODSIM",
            &config,
        )
        .unwrap();

        let paths = collector.collect(&job, &finished_report(7)).unwrap();
        assert_eq!(paths.len(), 3);
        let sizes: Vec<usize> = paths
            .iter()
            .map(|path| OutputManifest::read(path).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![3, 2, 2]);
        assert!(paths[2].ends_with("TTToSemiLeptonic_TuneCP5_13TeV-powheg-pythia8_2.txt"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unfinished_jobs_get_no_manifest() {
        let dir = env::temp_dir().join("skimmer_test_collect_unfinished");
        let _ = fs::remove_dir_all(&dir);
        let config = config(&dir);
        let client = FakeOutputs::default();
        let collector = OutputCollector::new(&client, &config);
        let job = JobDescriptor::build("/DYJetsToLL_M-50/Fall17-v1/MINIAODSIM", &config).unwrap();
        let mut report = finished_report(2);
        report.jobs_per_status.insert(String::from("finished"), 1);

        assert!(collector.collect(&job, &report).is_err());
        assert!(!dir.join("manifests").exists());
    }

    #[test]
    fn local_results_skip_retrieval() {
        let dir = env::temp_dir().join("skimmer_test_collect_local");
        let _ = fs::remove_dir_all(&dir);
        let config = config(&dir);
        let client = FakeOutputs::default();
        let collector = OutputCollector::new(&client, &config);
        let job = JobDescriptor::build("/DYJetsToLL_M-50/Fall17-v1/MINIAODSIM", &config).unwrap();
        fs::create_dir_all(job.results_dir()).unwrap();
        for id in 1..=2 {
            fs::write(job.results_dir().join(format!("DYJetsToLL_M-50_{id}.root")), b"").unwrap();
        }

        let paths = collector.collect(&job, &finished_report(2)).unwrap();
        assert!(client.requests.lock().unwrap().is_empty());
        let manifest = OutputManifest::read(&paths[0]).unwrap();
        assert!(manifest.files()[0].ends_with("DYJetsToLL_M-50_1.root"));

        let _ = fs::remove_dir_all(&dir);
    }
}
