//! Local Staging Store
//!
//! On-disk intermediate format for dry-run export and import. The
//! directory layout is the wire format:
//!
//! ```text
//! <save_dir>/<project>/tags.csv                     project tags
//! <save_dir>/<project>/<run_id>/params.json         {key: value}
//! <save_dir>/<project>/<run_id>/tags.csv            key,value rows (written last)
//! <save_dir>/<project>/<run_id>/metrics/<name>      step,value,timestamp rows
//! <save_dir>/<project>/<run_id>/system_metrics/<name>
//! ```
//!
//! Metric names containing `/` map to nested files under `metrics/`.
//!
//! Writes are not crash-atomic per run. A run directory missing any of
//! the four entries above is treated as not exported: readers skip it
//! and a resumed export writes it again.
//!
//! Any future layout change must add a version marker file rather than
//! alter this layout in place.

mod csv;
mod reader;

pub use reader::StagedRuns;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::experiment::tags::{
    DUAL_WRITING_TAG, MIGRATION_COMPLETE_TAG, RUN_BOOKKEEPING_TAGS, RUN_GROUP_TAG,
    SOURCE_RUN_ID_TAG, SOURCE_RUN_NAME_TAG, SOURCE_STATUS_TAG, TRUE_VALUE,
};
use crate::experiment::{MetricPoint, RunDescriptor};
use crate::{Error, Result};

/// Run parameters file.
pub const PARAMS_FILE: &str = "params.json";
/// Run (and project) tags file.
pub const TAGS_FILE: &str = "tags.csv";
/// Experiment metrics directory.
pub const METRICS_DIR: &str = "metrics";
/// System metrics directory.
pub const SYSTEM_METRICS_DIR: &str = "system_metrics";

const TAGS_TMP_FILE: &str = ".tags.csv.tmp";

/// Directory-tree store of staged runs, rooted at the dry-run save dir.
#[derive(Debug, Clone)]
pub struct StagingStore {
    root: PathBuf,
}

impl StagingStore {
    /// Open a store rooted at an existing directory.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `root` is not an existing directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "staging directory {} does not exist, please create it first",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one project's runs.
    #[must_use]
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(project)
    }

    /// Whether the project directory exists.
    #[must_use]
    pub fn has_project(&self, project: &str) -> bool {
        self.project_dir(project).is_dir()
    }

    /// Directory holding one run.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedRun` if `run_id` is not a single plain path component
    pub fn run_dir(&self, project: &str, run_id: &str) -> Result<PathBuf> {
        if !is_plain_component(run_id) {
            return Err(Error::MalformedRun(format!(
                "run id `{run_id}` cannot be used as a staging directory name"
            )));
        }
        Ok(self.project_dir(project).join(run_id))
    }

    /// Create the project directory and (over)write its tags.
    ///
    /// # Errors
    ///
    /// Returns error if the directory or file cannot be written
    pub fn init_project(&self, project: &str, tags: &BTreeMap<String, String>) -> Result<PathBuf> {
        let dir = self.project_dir(project);
        fs::create_dir_all(&dir)?;
        let mut out = String::new();
        for (key, value) in tags {
            csv::write_record(&mut out, &[key.as_str(), value.as_str()]);
        }
        fs::write(dir.join(TAGS_FILE), out)?;
        Ok(dir)
    }

    /// Project-level tags; empty when none were written.
    ///
    /// # Errors
    ///
    /// Returns error if the tags file exists but cannot be parsed
    pub fn project_tags(&self, project: &str) -> Result<BTreeMap<String, String>> {
        let path = self.project_dir(project).join(TAGS_FILE);
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        read_tags(&path)
    }

    /// Write one run, replacing any previous copy.
    ///
    /// `tags.csv` is written last and moved into place with a rename, so
    /// its presence marks a fully exported run.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedRun` for unusable run ids or metric names,
    /// or an IO error; a failed write leaves an incomplete directory.
    pub fn write(&self, project: &str, run: &RunDescriptor) -> Result<PathBuf> {
        let run_dir = self.run_dir(project, run.run_id())?;
        validate_series_names(run.metrics())?;
        validate_series_names(run.system_metrics())?;

        if run_dir.exists() {
            debug!(path = %run_dir.display(), "replacing previously staged run");
            fs::remove_dir_all(&run_dir)?;
        }
        fs::create_dir_all(&run_dir)?;

        write_series_dir(&run_dir.join(METRICS_DIR), run.metrics())?;
        write_series_dir(&run_dir.join(SYSTEM_METRICS_DIR), run.system_metrics())?;
        fs::write(run_dir.join(PARAMS_FILE), serde_json::to_vec(run.params())?)?;

        let tmp = run_dir.join(TAGS_TMP_FILE);
        fs::write(&tmp, encode_run_tags(run))?;
        fs::rename(&tmp, run_dir.join(TAGS_FILE))?;
        Ok(run_dir)
    }

    /// Remove a staged run directory. No-op if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be removed
    pub fn remove(&self, project: &str, run_id: &str) -> Result<()> {
        let dir = self.run_dir(project, run_id)?;
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Ids of fully exported runs, sorted.
    ///
    /// # Errors
    ///
    /// Returns error if the project directory cannot be listed
    pub fn exported_run_ids(&self, project: &str) -> Result<Vec<String>> {
        Ok(self
            .run_dirs(project)?
            .into_iter()
            .filter(|(_, dir)| check_run_dir(dir).is_ok())
            .map(|(run_id, _)| run_id)
            .collect())
    }

    /// Ids of runs whose directories are incomplete, sorted.
    ///
    /// # Errors
    ///
    /// Returns error if the project directory cannot be listed
    pub fn incomplete_run_ids(&self, project: &str) -> Result<Vec<String>> {
        Ok(self
            .run_dirs(project)?
            .into_iter()
            .filter(|(_, dir)| check_run_dir(dir).is_err())
            .map(|(run_id, _)| run_id)
            .collect())
    }

    /// Delete every incomplete run directory, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns error if a directory cannot be listed or removed
    pub fn prune_incomplete(&self, project: &str) -> Result<usize> {
        let incomplete = self.incomplete_run_ids(project)?;
        for run_id in &incomplete {
            info!(project, run_id = %run_id, "removing incomplete staged run");
            self.remove(project, run_id)?;
        }
        Ok(incomplete.len())
    }

    /// `(run_id, dir)` for every run directory in the project, sorted by id.
    fn run_dirs(&self, project: &str) -> Result<Vec<(String, PathBuf)>> {
        let dir = self.project_dir(project);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(run_id) => runs.push((run_id, entry.path())),
                Err(name) => warn!(?name, "ignoring staged run directory with non UTF-8 name"),
            }
        }
        runs.sort();
        Ok(runs)
    }
}

/// Check that a run directory has all four expected entries.
///
/// # Errors
///
/// Returns `Error::StagingCorruption` naming the first missing entry
pub fn check_run_dir(run_dir: &Path) -> Result<()> {
    let expected = [
        (PARAMS_FILE, false),
        (METRICS_DIR, true),
        (SYSTEM_METRICS_DIR, true),
        (TAGS_FILE, false),
    ];
    for (entry, is_dir) in expected {
        let path = run_dir.join(entry);
        let present = if is_dir { path.is_dir() } else { path.is_file() };
        if !present {
            return Err(Error::StagingCorruption {
                path: run_dir.to_path_buf(),
                reason: format!("missing {entry}"),
            });
        }
    }
    Ok(())
}

fn is_plain_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

fn validate_series_names(series: &BTreeMap<String, Vec<MetricPoint>>) -> Result<()> {
    for name in series.keys() {
        if name.is_empty() || !name.split('/').all(is_plain_component) {
            return Err(Error::MalformedRun(format!(
                "metric name `{name}` cannot be staged as a file path"
            )));
        }
        // `a` and `a/b` cannot both exist: one is a file, the other needs a directory.
        let mut prefix = name.as_str();
        while let Some((parent, _)) = prefix.rsplit_once('/') {
            if series.contains_key(parent) {
                return Err(Error::MalformedRun(format!(
                    "metric names `{parent}` and `{name}` collide in the staging layout"
                )));
            }
            prefix = parent;
        }
    }
    Ok(())
}

fn write_series_dir(dir: &Path, series: &BTreeMap<String, Vec<MetricPoint>>) -> Result<()> {
    fs::create_dir_all(dir)?;
    for (name, points) in series {
        let path = name.split('/').fold(dir.to_path_buf(), |path, part| path.join(part));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = String::with_capacity(points.len() * 24);
        for point in points {
            // Writing into a String cannot fail.
            let _ = writeln!(out, "{},{},{}", point.step(), point.value(), point.timestamp());
        }
        fs::write(path, out)?;
    }
    Ok(())
}

fn encode_run_tags(run: &RunDescriptor) -> String {
    let mut out = String::new();
    for (key, value) in run.tags() {
        if !RUN_BOOKKEEPING_TAGS.contains(&key.as_str()) {
            csv::write_record(&mut out, &[key.as_str(), value.as_str()]);
        }
    }
    csv::write_record(&mut out, &[SOURCE_RUN_ID_TAG, run.run_id()]);
    csv::write_record(&mut out, &[SOURCE_RUN_NAME_TAG, run.name()]);
    csv::write_record(&mut out, &[SOURCE_STATUS_TAG, run.status().as_str()]);
    if let Some(group) = run.group() {
        csv::write_record(&mut out, &[RUN_GROUP_TAG, group]);
    }
    if run.is_dual_writing() {
        csv::write_record(&mut out, &[DUAL_WRITING_TAG, TRUE_VALUE]);
    }
    csv::write_record(&mut out, &[MIGRATION_COMPLETE_TAG, TRUE_VALUE]);
    out
}

fn read_tags(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = fs::read_to_string(path)?;
    let records = csv::parse_records(&text).map_err(|reason| Error::StagingCorruption {
        path: path.to_path_buf(),
        reason,
    })?;
    records
        .into_iter()
        .map(|record| match <[String; 2]>::try_from(record) {
            Ok([key, value]) => Ok((key, value)),
            Err(record) => Err(Error::StagingCorruption {
                path: path.to_path_buf(),
                reason: format!("expected key,value but found {} fields", record.len()),
            }),
        })
        .collect()
}

fn read_series_dir(dir: &Path) -> Result<BTreeMap<String, Vec<MetricPoint>>> {
    let corrupt = |reason: String| Error::StagingCorruption {
        path: dir.to_path_buf(),
        reason,
    };

    let mut series = BTreeMap::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| corrupt(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| corrupt(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| corrupt(format!("non UTF-8 metric file {}", relative.display())))?
            .join("/");

        let text = fs::read_to_string(entry.path())?;
        let points = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_point(line).ok_or_else(|| corrupt(format!("bad row `{line}` in {name}"))))
            .collect::<Result<Vec<_>>>()?;
        series.insert(name, points);
    }
    Ok(series)
}

fn parse_point(line: &str) -> Option<MetricPoint> {
    let mut fields = line.split(',');
    let step = fields.next()?.trim().parse().ok()?;
    let value = fields.next()?.trim().parse().ok()?;
    let timestamp = fields.next()?.trim().parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(MetricPoint::new(step, value, timestamp))
}
