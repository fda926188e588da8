//! Dataset lists and the short job names derived from dataset paths.
use color_eyre::eyre::{eyre, Result, WrapErr};
use std::path::Path;

use super::manifest::read_dataset_manifest;

/// Entries of a generated dataset manifest marking processes without a dataset
const NOT_FOUND: &str = "Not found:";

/// Derive the short job name of a dataset path `/primary/processed/tier`.
///
/// - Simulation (`SIM` anywhere in the path) and signal (`HPlus`) datasets are
///   named after their primary dataset, with `_ext` appended for extension
///   samples (`ext` anywhere in the path).
/// - Everything else is collision data, where the primary dataset alone is
///   ambiguous across run periods, so the processed dataset is appended: `primary_processed`.
///
/// The name only depends on the path, so repeated runs agree on it.
pub fn derive_job_name(dataset: &str) -> Result<String> {
    let parts: Vec<&str> = dataset.split('/').collect();
    let primary = parts
        .get(1)
        .filter(|part| !part.is_empty())
        .ok_or_else(|| eyre!("Dataset {dataset} has no primary dataset component"))?;

    if dataset.contains("SIM") || dataset.contains("HPlus") {
        if dataset.contains("ext") {
            Ok(format!("{primary}_ext"))
        } else {
            Ok(primary.to_string())
        }
    } else {
        let processed = parts
            .get(2)
            .filter(|part| !part.is_empty())
            .ok_or_else(|| eyre!("Dataset {dataset} has no processed dataset component"))?;
        Ok(format!("{primary}_{processed}"))
    }
}

/// Read a dataset list: one dataset per line, blank lines ignored. YAML lists
/// written by `datalist` are read as well, minus their `Not found` entries.
pub fn read_dataset_list(path: &Path) -> Result<Vec<String>> {
    if matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    ) {
        return Ok(read_dataset_manifest(path)?
            .into_iter()
            .filter(|dataset| !dataset.starts_with(NOT_FOUND))
            .collect());
    }
    let contents = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Could not read dataset list {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}
