//! Static lookup tables: cross sections and per-era calibration tags.
use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name fragments marking collision data
const DATA_MARKERS: [&str; 4] = ["Electron", "Muon", "MET", "JetHT"];
/// Name fragment marking the charged Higgs signal samples
const SIGNAL_MARKER: &str = "HPlus";

pub fn is_data(name: &str) -> bool {
    DATA_MARKERS.iter().any(|marker| name.contains(marker))
}

pub fn is_signal(name: &str) -> bool {
    name.contains(SIGNAL_MARKER)
}

/// A cross section entry is either a bare number or a detailed record.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum XsecEntry {
    Value(f64),
    Detailed {
        xsec: f64,
        #[serde(rename = "isUsed", default)]
        is_used: bool,
    },
}

impl XsecEntry {
    pub fn xsec(&self) -> f64 {
        match self {
            Self::Value(xsec) => *xsec,
            Self::Detailed { xsec, .. } => *xsec,
        }
    }

    /// Bare values carry no flag and are always considered in use.
    pub fn is_used(&self) -> bool {
        match self {
            Self::Value(_) => true,
            Self::Detailed { is_used, .. } => *is_used,
        }
    }
}

/// Cross sections keyed by process name fragment, in file order.
#[derive(Debug, Clone, Default)]
pub struct XsecTable {
    entries: Vec<(String, XsecEntry)>,
}

impl XsecTable {
    pub fn load(path: &Path) -> Result<Self> {
        let yaml_str = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read cross section table {}", path.display()))?;
        Self::from_yaml(&yaml_str)
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        let mapping: serde_yaml::Mapping = serde_yaml::from_str(yaml_str)?;
        let mut entries = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let key = key
                .as_str()
                .ok_or_else(|| eyre!("Cross section keys must be strings, found {key:?}"))?
                .to_string();
            let entry: XsecEntry = serde_yaml::from_value(value)
                .wrap_err_with(|| format!("Invalid cross section entry for {key}"))?;
            entries.push((key, entry));
        }
        Ok(Self { entries })
    }

    /// Cross section of the first process key found in `name`, scanning the
    /// table back to front so the last matching key wins. Unknown names get 1.
    pub fn lookup(&self, name: &str) -> f64 {
        self.entries
            .iter()
            .rev()
            .find(|(key, _)| name.contains(key.as_str()))
            .map(|(_, entry)| entry.xsec())
            .unwrap_or(1.)
    }

    /// Background processes flagged for use, in file order.
    pub fn used_processes(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(key, entry)| entry.is_used() && !is_signal(key))
            .map(|(key, _)| key.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Calibration tags and inputs of a single data-taking era.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EraTags {
    pub data_tag: String,
    pub mc_tag: String,
    pub prefiring_era: String,
    pub egamma_era: String,
    #[serde(default)]
    pub lumi_json: Option<PathBuf>,
    #[serde(default)]
    pub wildcards: Vec<String>,
}

impl EraTags {
    pub fn global_tag(&self, is_data: bool) -> &str {
        if is_data {
            &self.data_tag
        } else {
            &self.mc_tag
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EraTable {
    eras: BTreeMap<String, EraTags>,
}

impl EraTable {
    pub fn load(path: &Path) -> Result<Self> {
        let yaml_str = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read era table {}", path.display()))?;
        Self::from_yaml(&yaml_str)
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        Ok(Self {
            eras: serde_yaml::from_str(yaml_str)?,
        })
    }

    pub fn get(&self, era: &str) -> Result<&EraTags> {
        self.eras.get(era).ok_or_else(|| {
            eyre!(
                "Unknown era {era}! Known eras: {}",
                self.eras.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XSEC: &str = r#"
TTTo: 687.1
TTToSemiLeptonic:
  xsec: 300.9
  isUsed: true
WJetsToLNu:
  xsec: 52940.0
  isUsed: false
HPlusAndH:
  xsec: 1.0
  isUsed: true
DYJetsToLL:
  xsec: 5343.0
  isUsed: true
"#;

    const ERAS: &str = r#"
"2017":
  data_tag: 102X_dataRun2_v12
  mc_tag: 102X_mc2017_realistic_v7
  prefiring_era: 2017BtoF
  egamma_era: 2017-Nov17ReReco
  wildcards: [RunIIFall17MiniAODv2*]
"#;

    #[test]
    fn lookup_takes_last_matching_key() {
        let table = XsecTable::from_yaml(XSEC).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.lookup("TTToSemiLeptonic_TuneCP5"), 300.9);
        assert_eq!(table.lookup("TTTo2L2Nu_TuneCP5"), 687.1);
        assert_eq!(table.lookup("QCD_HT100to200"), 1.);
    }

    #[test]
    fn used_processes_skip_signal_and_unused() {
        let table = XsecTable::from_yaml(XSEC).unwrap();
        assert_eq!(
            table.used_processes(),
            vec!["TTTo", "TTToSemiLeptonic", "DYJetsToLL"]
        );
    }

    #[test]
    fn data_and_signal_markers() {
        assert!(is_data("SingleMuon_Run2017B-31Mar2018-v1"));
        assert!(is_data("JetHT_Run2017C"));
        assert!(!is_data("TTToSemiLeptonic_TuneCP5"));
        assert!(is_signal("HPlusAndH_ToWHH_ToL4B_200_100"));
    }

    #[test]
    fn era_tags_by_data_flag() {
        let eras = EraTable::from_yaml(ERAS).unwrap();
        let tags = eras.get("2017").unwrap();
        assert_eq!(tags.global_tag(true), "102X_dataRun2_v12");
        assert_eq!(tags.global_tag(false), "102X_mc2017_realistic_v7");
        assert_eq!(tags.lumi_json, None);
        assert!(eras.get("2042").is_err());
    }
}
