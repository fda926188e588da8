//! Dataset discovery: wildcard searches for dataset names and file listings.
use color_eyre::eyre::{eyre, Result, WrapErr};
use log::{debug, warn};
use std::process::Command;

use super::tables::XsecTable;

pub trait DatasetDiscovery {
    /// Dataset names matching a wildcard pattern
    fn datasets(&self, pattern: &str) -> Result<Vec<String>>;
    /// Logical file names of a dataset
    fn files(&self, dataset: &str) -> Result<Vec<String>>;
}

/// Drives the `dasgoclient` command line client.
#[derive(Debug, Clone)]
pub struct DasClient {
    executable: String,
}

impl DasClient {
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
        }
    }

    fn query(&self, query: &str) -> Result<Vec<String>> {
        let output = Command::new(&self.executable)
            .arg("-query")
            .arg(query)
            .output()
            .wrap_err_with(|| format!("Could not launch {}", self.executable))?;
        if !output.status.success() {
            return Err(eyre!(
                "Query '{query}' failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    /// Privately produced datasets are registered in phys03
    fn instance(dataset: &str) -> &'static str {
        if dataset.ends_with("/USER") {
            " instance=prod/phys03"
        } else {
            ""
        }
    }
}

impl DatasetDiscovery for DasClient {
    fn datasets(&self, pattern: &str) -> Result<Vec<String>> {
        self.query(&format!("dataset={pattern}"))
    }

    fn files(&self, dataset: &str) -> Result<Vec<String>> {
        self.query(&format!("file dataset={dataset}{}", Self::instance(dataset)))
    }
}

/// Find the MINIAOD dataset of a process. Wildcards are tried in order; the
/// shortest name matching the first productive wildcard is taken.
pub fn find_dataset<D: DatasetDiscovery>(
    discovery: &D,
    process: &str,
    wildcards: &[String],
) -> Result<Option<String>> {
    for card in wildcards {
        let pattern = format!("/{process}*/{card}/MINIAOD*");
        let mut found = discovery.datasets(&pattern)?;
        debug!("{pattern}: {} match(es)", found.len());
        found.sort_by_key(String::len);
        if let Some(first) = found.into_iter().next() {
            return Ok(Some(first));
        }
    }
    Ok(None)
}

/// Sorted dataset list for every used background process. Processes without
/// a match are recorded as `Not found: <process>`.
pub fn create_data_list<D: DatasetDiscovery>(
    discovery: &D,
    table: &XsecTable,
    wildcards: &[String],
) -> Result<Vec<String>> {
    let mut datasets = Vec::new();
    for process in table.used_processes() {
        match find_dataset(discovery, process, wildcards)? {
            Some(dataset) => datasets.push(dataset),
            None => {
                warn!("No dataset found for {process}");
                datasets.push(format!("Not found: {process}"));
            }
        }
    }
    datasets.sort();
    Ok(datasets)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Discovery service answering from fixed tables
    #[derive(Debug, Default)]
    pub struct FakeDiscovery {
        pub datasets: BTreeMap<String, Vec<String>>,
        pub files: BTreeMap<String, Vec<String>>,
    }

    impl DatasetDiscovery for FakeDiscovery {
        fn datasets(&self, pattern: &str) -> Result<Vec<String>> {
            Ok(self.datasets.get(pattern).cloned().unwrap_or_default())
        }

        fn files(&self, dataset: &str) -> Result<Vec<String>> {
            self.files
                .get(dataset)
                .cloned()
                .ok_or_else(|| eyre!("unknown dataset {dataset}"))
        }
    }

    fn discovery() -> FakeDiscovery {
        FakeDiscovery {
            datasets: BTreeMap::from([
                (
                    String::from("/TTToSemiLeptonic*/RunIIFall17MiniAODv2*/MINIAOD*"),
                    vec![
                        String::from("/TTToSemiLeptonic_TuneCP5_PSweights/RunIIFall17MiniAODv2-v1/MINIAODSIM"),
                        String::from("/TTToSemiLeptonic_TuneCP5/RunIIFall17MiniAODv2-v1/MINIAODSIM"),
                    ],
                ),
                (
                    String::from("/DYJetsToLL*/RunIIFall17MiniAOD-*/MINIAOD*"),
                    vec![String::from("/DYJetsToLL_M-50/RunIIFall17MiniAOD-v1/MINIAODSIM")],
                ),
            ]),
            files: BTreeMap::new(),
        }
    }

    #[test]
    fn shortest_match_of_first_productive_wildcard() {
        let wildcards = vec![
            String::from("RunIIFall17MiniAODv2*"),
            String::from("RunIIFall17MiniAOD-*"),
        ];
        assert_eq!(
            find_dataset(&discovery(), "TTToSemiLeptonic", &wildcards).unwrap(),
            Some(String::from("/TTToSemiLeptonic_TuneCP5/RunIIFall17MiniAODv2-v1/MINIAODSIM"))
        );
        assert_eq!(
            find_dataset(&discovery(), "DYJetsToLL", &wildcards).unwrap(),
            Some(String::from("/DYJetsToLL_M-50/RunIIFall17MiniAOD-v1/MINIAODSIM"))
        );
        assert_eq!(find_dataset(&discovery(), "WW", &wildcards).unwrap(), None);
    }

    #[test]
    fn data_list_marks_missing_processes() {
        let table = XsecTable::from_yaml(
            "TTToSemiLeptonic: {xsec: 300.9, isUsed: true}\nWW: {xsec: 75.8, isUsed: true}\nHPlusAndH: {xsec: 1.0, isUsed: true}\nQCD: {xsec: 1.0, isUsed: false}\n",
        )
        .unwrap();
        let list = create_data_list(&discovery(), &table, &[String::from("RunIIFall17MiniAODv2*")])
            .unwrap();
        assert_eq!(
            list,
            vec![
                "/TTToSemiLeptonic_TuneCP5/RunIIFall17MiniAODv2-v1/MINIAODSIM",
                "Not found: WW"
            ]
        );
    }

    #[test]
    fn private_datasets_query_phys03() {
        assert_eq!(DasClient::instance("/HPlus/dbrunner-MiniAOD/USER"), " instance=prod/phys03");
        assert_eq!(DasClient::instance("/MET/Run2017B-v1/MINIAOD"), "");
    }
}
