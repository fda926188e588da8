use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::job::Resources;

/// Redirector used when the storage site has no dedicated xrootd door.
pub const GLOBAL_REDIRECTOR: &str = "root://cms-xrd-global.cern.ch/";

/// Lists of dataset names for the batch (NANO) skims, split by process type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NanoLists {
    pub data: Vec<PathBuf>,
    pub bkg: Vec<PathBuf>,
}

/// Structure representing the application configuration. Contains pathing and
/// policy information for the skims.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub work_dir: PathBuf,
    pub xsec_path: PathBuf,
    pub era_path: PathBuf,
    pub era: String,
    pub dataset_lists: Vec<PathBuf>,
    pub nano_lists: NanoLists,
    pub nano_executable: PathBuf,
    pub pset_name: String,
    pub storage_site: String,
    pub out_lfn_dir_base: String,
    pub vo_group: String,
    pub memory_mb: u32,
    pub runtime_min: u32,
    pub systematics: Vec<String>,
    pub poll_interval_secs: u64,
    pub max_resubmits: Option<u32>,
    pub output_batch_size: usize,
    pub output_retries: Option<u32>,
    pub manifest_dir: PathBuf,
    pub manifest_splits: BTreeMap<String, usize>,
    pub site_prefixes: BTreeMap<String, String>,
    pub merge_chunk_size: usize,
    pub merge_parallel: usize,
    pub merge_executable: String,
    pub grid_executable: String,
    pub discovery_executable: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/path/to/some/work/dir/"),
            xsec_path: PathBuf::from("/path/to/some/data/xsec.yaml"),
            era_path: PathBuf::from("/path/to/some/data/eras.yaml"),
            era: String::from("2017"),
            dataset_lists: vec![
                PathBuf::from("/path/to/some/filelists/filelist_bkg_2017_MINI.txt"),
                PathBuf::from("/path/to/some/filelists/filelist_data_2017_MINI.txt"),
                PathBuf::from("/path/to/some/filelists/filelist_signal_2017_MINI.txt"),
            ],
            nano_lists: NanoLists {
                data: vec![PathBuf::from(
                    "/path/to/some/filelists/filelist_data_2017_NANO.txt",
                )],
                bkg: vec![PathBuf::from(
                    "/path/to/some/filelists/filelist_bkg_2017_NANO.txt",
                )],
            },
            nano_executable: PathBuf::from("/path/to/some/batch/produceSkim.sh"),
            pset_name: String::from("ChargedSkimming/Skimming/python/miniskimmer.py"),
            storage_site: String::from("T2_DE_DESY"),
            out_lfn_dir_base: String::from("/store/user/someone/skim"),
            vo_group: String::from("dcms"),
            memory_mb: 2500,
            runtime_min: 1440,
            systematics: vec![],
            poll_interval_secs: 60,
            max_resubmits: Some(10),
            output_batch_size: 500,
            output_retries: None,
            manifest_dir: PathBuf::from("/path/to/some/work/dir/manifests/"),
            manifest_splits: BTreeMap::from([(String::from("TTToSemiLeptonic"), 3)]),
            site_prefixes: BTreeMap::from([(
                String::from("T2_DE_DESY"),
                String::from("root://dcache-cms-xrootd.desy.de/"),
            )]),
            merge_chunk_size: 50,
            merge_parallel: 4,
            merge_executable: String::from("hadd"),
            grid_executable: String::from("crab"),
            discovery_executable: String::from("dasgoclient"),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml_str = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read config file {}", path.display()))?;
        serde_yaml::from_str::<Self>(&yaml_str)
            .wrap_err_with(|| format!("Could not parse config file {}", path.display()))
    }

    /// Write the configuration to a YAML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        let yaml_str = serde_yaml::to_string(self)?;
        file.write_all(yaml_str.as_bytes())?;
        Ok(())
    }

    /// Directory holding one work area per MINI skim
    pub fn skim_dir(&self) -> PathBuf {
        self.work_dir.join("Skim")
    }

    pub fn base_resources(&self) -> Resources {
        Resources {
            memory_mb: self.memory_mb,
            runtime_min: self.runtime_min,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// The xrootd prefix used to turn logical file names at the storage site into URLs
    pub fn site_prefix(&self) -> &str {
        self.site_prefixes
            .get(&self.storage_site)
            .map(|prefix| prefix.as_str())
            .unwrap_or(GLOBAL_REDIRECTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    #[test]
    fn template_survives_save_and_load() {
        let dir = env::temp_dir().join("skimmer_test_config_template");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let path = dir.join("config.yml");
        Config::default().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, Config::default());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: Config =
            serde_yaml::from_str("work_dir: /data/skims\nstorage_site: T2_CH_CERN\n").unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/data/skims"));
        assert_eq!(config.skim_dir(), PathBuf::from("/data/skims/Skim"));
        assert_eq!(config.output_batch_size, 500);
        assert_eq!(config.site_prefix(), GLOBAL_REDIRECTOR);
    }

    #[test]
    fn storage_site_selects_prefix() {
        let config = Config::default();
        assert_eq!(config.site_prefix(), "root://dcache-cms-xrootd.desy.de/");
        assert_eq!(config.base_resources().memory_mb, 2500);
        assert_eq!(config.base_resources().runtime_min, 1440);
    }
}
