//! Output manifests (one file location per line) and YAML dataset manifests.
use color_eyre::eyre::{Result, WrapErr};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Split `items` into `parts` contiguous pieces whose sizes differ by at most
/// one, earlier pieces taking the remainder. Every item lands in exactly one
/// piece. Asking for more pieces than items yields empty trailing pieces.
pub fn partition<T: Clone>(items: &[T], parts: usize) -> Vec<Vec<T>> {
    let parts = parts.max(1);
    let base = items.len() / parts;
    let remainder = items.len() % parts;
    let mut pieces = Vec::with_capacity(parts);
    let mut start = 0;
    for idx in 0..parts {
        let size = base + usize::from(idx < remainder);
        pieces.push(items[start..start + size].to_vec());
        start += size;
    }
    pieces
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputManifest {
    files: Vec<String>,
}

impl OutputManifest {
    pub fn new(files: Vec<String>) -> Self {
        Self { files }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read manifest {}", path.display()))?;
        Ok(Self {
            files: contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)
            .wrap_err_with(|| format!("Could not create manifest {}", path.display()))?;
        for location in &self.files {
            writeln!(file, "{location}")?;
        }
        Ok(())
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Split into `parts` manifests of near-equal size
    pub fn split(&self, parts: usize) -> Vec<OutputManifest> {
        partition(&self.files, parts)
            .into_iter()
            .map(OutputManifest::new)
            .collect()
    }
}

/// Write a YAML list of dataset names, headed by a comment naming the wildcards used.
pub fn write_dataset_manifest(path: &Path, wildcards: &[String], datasets: &[String]) -> Result<()> {
    let mut file = File::create(path)
        .wrap_err_with(|| format!("Could not create dataset manifest {}", path.display()))?;
    writeln!(
        file,
        "## Created by skimmer datalist with the following wildcards: {}\n",
        wildcards.join(", ")
    )?;
    file.write_all(serde_yaml::to_string(datasets)?.as_bytes())?;
    Ok(())
}

pub fn read_dataset_manifest(path: &Path) -> Result<Vec<String>> {
    let yaml_str = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Could not read dataset manifest {}", path.display()))?;
    Ok(serde_yaml::from_str(&yaml_str)?)
}
