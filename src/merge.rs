//! Merging manifests into single files with an external merge executable,
//! either directly or as an HTCondor DAG.
use color_eyre::eyre::{eyre, Result, WrapErr};
use human_bytes::human_bytes;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use super::manifest::partition;

/// Number of chunks for `n_files` files merged `chunk_size` at a time
pub fn chunk_count(n_files: usize, chunk_size: usize) -> usize {
    (n_files / chunk_size.max(1)).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Run the merges here, at most `parallel` at once
    Direct { parallel: usize },
    /// Write a three-stage DAG, submitting it if asked
    Dag { submit: bool },
}

/// The chunks of one merge and where their intermediate results go.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    output: PathBuf,
    chunks: Vec<Vec<String>>,
    temporaries: Vec<PathBuf>,
}

impl MergePlan {
    pub fn new(files: &[String], output: &Path, chunk_size: usize) -> Result<Self> {
        if files.is_empty() {
            return Err(eyre!("Nothing to merge into {}", output.display()));
        }
        let chunks = partition(files, chunk_count(files.len(), chunk_size));
        let temporaries = if chunks.len() == 1 {
            vec![]
        } else {
            let stem = output
                .file_stem()
                .ok_or_else(|| eyre!("Merge output {} has no file name", output.display()))?
                .to_string_lossy()
                .into_owned();
            (0..chunks.len())
                .map(|idx| output.with_file_name(format!("{stem}_tmp{idx}.root")))
                .collect()
        };
        Ok(Self {
            output: output.to_path_buf(),
            chunks,
            temporaries,
        })
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn chunks(&self) -> &[Vec<String>] {
        &self.chunks
    }

    pub fn temporaries(&self) -> &[PathBuf] {
        &self.temporaries
    }

    /// Target of chunk `idx`: its temporary, or the output when there is one chunk
    fn chunk_target(&self, idx: usize) -> &Path {
        self.temporaries
            .get(idx)
            .map(PathBuf::as_path)
            .unwrap_or(&self.output)
    }

    fn remove_temporaries(&self) {
        for tmp in self.temporaries.iter().filter(|tmp| tmp.exists()) {
            if let Err(e) = fs::remove_file(tmp) {
                warn!("Could not remove {}: {e}", tmp.display());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeDriver {
    executable: String,
}

impl MergeDriver {
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
        }
    }

    fn merge_args(target: &Path, inputs: &[String]) -> Vec<String> {
        let mut args = vec![String::from("-f"), target.display().to_string()];
        args.extend(inputs.iter().cloned());
        args
    }

    fn spawn(&self, target: &Path, inputs: &[String]) -> Result<Child> {
        debug!("Merging {} files into {}", inputs.len(), target.display());
        Command::new(&self.executable)
            .args(Self::merge_args(target, inputs))
            .spawn()
            .wrap_err_with(|| format!("Could not launch {}", self.executable))
    }

    fn wait(&self, mut child: Child, target: &Path) -> Result<()> {
        let status = child.wait()?;
        if !status.success() {
            return Err(eyre!(
                "{} failed to produce {} ({status})",
                self.executable,
                target.display()
            ));
        }
        Ok(())
    }

    /// Merge every chunk, `parallel` processes at a time, then merge the
    /// temporaries into the output and delete them. Every process of a wave is
    /// waited for, even after one of them failed; on failure the temporaries
    /// are removed and the first error is returned.
    pub fn run_direct(&self, plan: &MergePlan, parallel: usize) -> Result<()> {
        if let Some(parent) = plan.output().parent() {
            fs::create_dir_all(parent)?;
        }
        let progress = ProgressBar::new(plan.chunks().len() as u64)
            .with_style(ProgressStyle::with_template(
                "{msg}: {bar:40.cyan/blue} [{pos}/{len} chunks] (Elapsed: {elapsed})",
            )?)
            .with_message("Merging");

        let indices: Vec<usize> = (0..plan.chunks().len()).collect();
        for wave in indices.chunks(parallel.max(1)) {
            let mut failure = None;
            let mut children = Vec::with_capacity(wave.len());
            for &idx in wave {
                let target = plan.chunk_target(idx);
                match self.spawn(target, &plan.chunks()[idx]) {
                    Ok(child) => children.push((child, target)),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            for (child, target) in children {
                match self.wait(child, target) {
                    Ok(()) => progress.inc(1),
                    Err(e) if failure.is_none() => failure = Some(e),
                    Err(e) => warn!("{e}"),
                }
            }
            if let Some(e) = failure {
                progress.abandon();
                plan.remove_temporaries();
                return Err(e);
            }
        }
        progress.finish();

        if !plan.temporaries().is_empty() {
            let inputs: Vec<String> = plan
                .temporaries()
                .iter()
                .map(|tmp| tmp.display().to_string())
                .collect();
            let merged = self
                .spawn(plan.output(), &inputs)
                .and_then(|child| self.wait(child, plan.output()));
            plan.remove_temporaries();
            merged?;
        }

        let size = plan.output().metadata().map(|m| m.len()).unwrap_or(0);
        info!(
            "Merged {} files into {} ({})",
            plan.chunks().iter().map(Vec::len).sum::<usize>(),
            plan.output().display(),
            human_bytes(size as f64)
        );
        Ok(())
    }

    /// Write the submit files and DAG for a merge into `dag_dir`. Returns the DAG path.
    pub fn write_dag(&self, plan: &MergePlan, dag_dir: &Path) -> Result<PathBuf> {
        for d in ["log", "out", "err"] {
            fs::create_dir_all(dag_dir.join(d))?;
        }

        let mut dag = Vec::new();
        let mut chunk_nodes = Vec::with_capacity(plan.chunks.len());
        for (idx, chunk) in plan.chunks.iter().enumerate() {
            let node = format!("chunk{idx}");
            let sub = dag_dir.join(format!("merge_chunk_{idx}.sub"));
            fs::write(
                &sub,
                render_submit(
                    &self.executable,
                    &Self::merge_args(plan.chunk_target(idx), chunk),
                    &node,
                    dag_dir,
                ),
            )?;
            dag.push(format!("JOB {node} {}", sub.display()));
            chunk_nodes.push(node);
        }

        if !plan.temporaries.is_empty() {
            let inputs: Vec<String> = plan
                .temporaries
                .iter()
                .map(|tmp| tmp.display().to_string())
                .collect();
            let final_sub = dag_dir.join("merge_final.sub");
            fs::write(
                &final_sub,
                render_submit(
                    &self.executable,
                    &Self::merge_args(&plan.output, &inputs),
                    "final",
                    dag_dir,
                ),
            )?;
            let cleanup_sub = dag_dir.join("merge_cleanup.sub");
            fs::write(
                &cleanup_sub,
                render_submit("/bin/rm", &inputs, "cleanup", dag_dir),
            )?;
            dag.push(format!("JOB final {}", final_sub.display()));
            dag.push(format!("JOB cleanup {}", cleanup_sub.display()));
            dag.push(format!("PARENT {} CHILD final", chunk_nodes.join(" ")));
            dag.push(String::from("PARENT final CHILD cleanup"));
        }

        let dag_path = dag_dir.join("merge.dag");
        fs::write(&dag_path, dag.join("\n") + "\n")?;
        Ok(dag_path)
    }

    pub fn submit_dag(&self, dag_path: &Path) -> Result<()> {
        let status = Command::new("condor_submit_dag")
            .arg(dag_path)
            .status()
            .wrap_err("Could not launch condor_submit_dag")?;
        if !status.success() {
            return Err(eyre!(
                "condor_submit_dag {} failed ({status})",
                dag_path.display()
            ));
        }
        Ok(())
    }

    pub fn run(&self, plan: &MergePlan, strategy: Strategy, dag_dir: &Path) -> Result<()> {
        match strategy {
            Strategy::Direct { parallel } => self.run_direct(plan, parallel),
            Strategy::Dag { submit } => {
                let dag_path = self.write_dag(plan, dag_dir)?;
                println!("Wrote merge DAG to {}", dag_path.display());
                if submit {
                    self.submit_dag(&dag_path)?;
                }
                Ok(())
            }
        }
    }
}

fn render_submit(executable: &str, args: &[String], node: &str, dag_dir: &Path) -> String {
    [
        String::from("universe = vanilla"),
        format!("executable = {executable}"),
        format!("arguments = \"{}\"", args.join(" ")),
        String::from("getenv = True"),
        format!("log = {}/log/{node}.log", dag_dir.display()),
        format!("output = {}/out/{node}.out", dag_dir.display()),
        format!("error = {}/err/{node}.err", dag_dir.display()),
        String::from("queue"),
    ]
    .join("\n")
        + "\n"
}
