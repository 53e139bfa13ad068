use crate::ledger::{BibTimeLedger, CsvFileSink, DEFAULT_LEDGER_FILE};
use crate::pipeline::calibration::Calibration;
use crate::pipeline::types::Direction;
use crate::timing::{TimeMapping, Timestamp};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_FILE: &str = "run.json";

/// Everything needed to read times off a finished raster, persisted as `run.json`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunMetadata {
    pub original_name: String,
    pub created_at: DateTime<Utc>,
    pub start_time: Timestamp,
    pub fps: f64,
    pub direction: Direction,
    pub raster_width: usize,
    pub raster_height: usize,
    pub raster_file: String,
    pub ledger_file: String,
    pub calibration: Calibration,
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub output_dir: PathBuf,
    pub metadata: RunMetadata,
}

/// Resolves `<output_root>/<video stem>` without touching the file system.
///
/// Fails when the directory already exists and `overwrite` is not set.
pub fn run_dir(output_root: &Path, video_path: &Path, overwrite: bool) -> Result<PathBuf> {
    let stem = video_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid video name: {:?}", video_path))?;

    let output_dir = output_root.join(stem);
    if output_dir.exists() {
        if !overwrite {
            bail!("Output directory already exists for: {}", stem);
        }
        tracing::warn!("Reusing existing output directory {:?}", output_dir);
    }
    Ok(output_dir)
}

/// Creates `<output_root>/<video stem>` for a new run.
pub fn create_run(output_root: &Path, video_path: &Path, overwrite: bool) -> Result<PathBuf> {
    let output_dir = run_dir(output_root, video_path, overwrite)?;
    fs::create_dir_all(&output_dir)?;
    Ok(output_dir)
}

impl RunContext {
    pub fn new(output_dir: PathBuf, metadata: RunMetadata) -> Self {
        Self {
            output_dir,
            metadata,
        }
    }

    pub fn load(output_dir: &Path) -> Result<Self> {
        let path = output_dir.join(RUN_FILE);
        let content =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let metadata: RunMetadata = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(Self::new(output_dir.to_path_buf(), metadata))
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.metadata)?;
        fs::write(self.output_dir.join(RUN_FILE), content)?;
        Ok(())
    }

    pub fn time_mapping(&self) -> Result<TimeMapping> {
        Ok(TimeMapping::new(
            self.metadata.start_time,
            self.metadata.fps,
            self.metadata.direction,
            self.metadata.raster_width,
        )?)
    }

    pub fn raster_path(&self) -> PathBuf {
        self.output_dir.join(&self.metadata.raster_file)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.output_dir.join(&self.metadata.ledger_file)
    }

    /// Removes a ledger left by an earlier run in this directory; its times
    /// belong to a raster that is being replaced.
    pub fn discard_stale_ledger(&self) -> Result<bool> {
        let path = self.ledger_path();
        if !path.exists() {
            return Ok(false);
        }
        tracing::warn!("Removing ledger from previous run {:?}", path);
        fs::remove_file(&path).with_context(|| format!("Failed to remove {:?}", path))?;
        Ok(true)
    }

    pub fn open_ledger(&self) -> Result<BibTimeLedger<CsvFileSink>> {
        Ok(BibTimeLedger::open(CsvFileSink::new(self.ledger_path()))?)
    }
}

pub fn list_runs(output_root: &Path) -> Result<Vec<RunContext>> {
    let mut runs = Vec::new();

    if !output_root.exists() {
        return Ok(runs);
    }

    for entry in fs::read_dir(output_root)? {
        let path = entry?.path();
        if path.is_dir() && path.join(RUN_FILE).exists() {
            match RunContext::load(&path) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!("Skipping {:?}: {:#}", path, e),
            }
        }
    }
    runs.sort_by(|a, b| a.output_dir.cmp(&b.output_dir));

    Ok(runs)
}

/// Default ledger file name for new runs.
pub fn default_ledger_file() -> String {
    DEFAULT_LEDGER_FILE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn metadata() -> RunMetadata {
        RunMetadata {
            original_name: "heat1.mp4".to_string(),
            created_at: Utc::now(),
            start_time: NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            fps: 30.0,
            direction: Direction::Forward,
            raster_width: 100,
            raster_height: 20,
            raster_file: "results.png".to_string(),
            ledger_file: default_ledger_file(),
            calibration: Calibration::new(40, 20),
        }
    }

    #[test]
    fn test_create_run_refuses_existing_dir() {
        let root = tempfile::tempdir().unwrap();
        let video = Path::new("/videos/heat1.mp4");
        let dir = create_run(root.path(), video, false).unwrap();
        assert_eq!(dir, root.path().join("heat1"));
        assert!(dir.is_dir());

        assert!(create_run(root.path(), video, false).is_err());
        assert_eq!(create_run(root.path(), video, true).unwrap(), dir);
    }

    #[test]
    fn test_save_load_and_time_mapping() {
        let root = tempfile::tempdir().unwrap();
        let dir = create_run(root.path(), Path::new("heat1.mp4"), false).unwrap();
        RunContext::new(dir.clone(), metadata()).save().unwrap();

        let run = RunContext::load(&dir).unwrap();
        assert_eq!(run.metadata.raster_width, 100);
        assert_eq!(run.metadata.calibration, Calibration::new(40, 20));
        assert_eq!(run.ledger_path(), dir.join("results.csv"));
        assert_eq!(run.time_mapping().unwrap().format_column(0), "10:00:03.333333");

        let runs = list_runs(root.path()).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].metadata.original_name, "heat1.mp4");
    }

    #[test]
    fn test_ledger_lives_in_run_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = create_run(root.path(), Path::new("heat2.mov"), false).unwrap();
        let run = RunContext::new(dir, metadata());
        let mut ledger = run.open_ledger().unwrap();
        ledger.add("12", "10:00:01.000000").unwrap();
        assert_eq!(run.open_ledger().unwrap().len(), 1);
    }

    #[test]
    fn test_run_dir_has_no_side_effects() {
        let root = tempfile::tempdir().unwrap();
        let dir = run_dir(root.path(), Path::new("heat3.mp4"), false).unwrap();
        assert_eq!(dir, root.path().join("heat3"));
        assert!(!dir.exists());
        // Checking again still succeeds because nothing was created.
        assert!(run_dir(root.path(), Path::new("heat3.mp4"), false).is_ok());
    }

    #[test]
    fn test_overwrite_discards_previous_ledger() {
        let root = tempfile::tempdir().unwrap();
        let dir = create_run(root.path(), Path::new("heat4.mp4"), false).unwrap();
        let first = RunContext::new(dir.clone(), metadata());
        first.open_ledger().unwrap().add("5", "10:00:02.000000").unwrap();
        assert!(first.ledger_path().exists());

        let dir = create_run(root.path(), Path::new("heat4.mp4"), true).unwrap();
        let second = RunContext::new(dir, metadata());
        assert!(second.discard_stale_ledger().unwrap());
        assert!(second.open_ledger().unwrap().is_empty());
        assert!(!second.discard_stale_ledger().unwrap());
    }

    #[test]
    fn test_list_runs_on_missing_root() {
        let root = tempfile::tempdir().unwrap();
        assert!(list_runs(&root.path().join("nope")).unwrap().is_empty());
    }
}
