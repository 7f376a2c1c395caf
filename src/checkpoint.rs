//! Checkpoint records, file naming, and lookup.
//!
//! A checkpoint is three sibling files: the record itself (CBOR), a model
//! tensor archive, and (for training checkpoints) an optimizer tensor
//! archive, the latter two named by appending extensions to the record's
//! path. Rollout storage is transient per stage and is never persisted.
use crate::error::CheckpointError;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Counters and seeds persisted alongside the model and optimizer state.
///
/// The engine exclusively owns every field; loading a checkpoint restores
/// the exact stage index and step accounting, so a resumed run continues
/// mid-curriculum with the correct remaining budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub total_updates: i64,
    pub total_steps: i64,
    /// Index of the pipeline stage being trained when saved.
    pub pipeline_stage: usize,
    pub rollout_count: i64,
    pub backprop_count: i64,
    /// Task steps taken within the current stage.
    pub step_count: i64,
    /// Start timestamp of the run this checkpoint belongs to; names the
    /// per-run checkpoint and log directories.
    pub local_start_time: String,
    /// The trainer seed in effect after this save's seed rotation.
    pub trainer_seed: Option<u64>,
    /// Worker seeds derived from `trainer_seed`; re-derived and verified
    /// on load.
    pub worker_seeds: Option<Vec<u64>>,
    /// Step count the learning-rate scheduler had reached, restored
    /// separately from the optimizer state.
    pub scheduler_steps: Option<i64>,
}

impl Checkpoint {
    /// Write the record to `path` as CBOR.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let file = File::create(path)?;
        serde_cbor::to_writer(file, self)?;
        Ok(())
    }

    /// Read a record written by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let file = File::open(path)?;
        let this = serde_cbor::from_reader(file)?;
        Ok(this)
    }
}

/// The checkpoint file name for the given run coordinates.
pub fn checkpoint_file_name(
    tag: &str,
    start_time: &str,
    stage: usize,
    total_steps: i64,
    seed: Option<u64>,
) -> String {
    format!(
        "exp_{}__time_{}__stage_{:02}__steps_{:012}__seed_{}.ckpt",
        tag,
        start_time,
        stage,
        total_steps,
        seed.map_or_else(|| "none".to_owned(), |seed| seed.to_string()),
    )
}

/// Path of the model tensor archive saved beside a checkpoint record.
pub fn model_path(checkpoint: &Path) -> PathBuf {
    append_extension(checkpoint, "model.ot")
}

/// Path of the optimizer tensor archive saved beside a checkpoint record.
pub fn optimizer_path(checkpoint: &Path) -> PathBuf {
    append_extension(checkpoint, "optim.ot")
}

fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Locate a checkpoint by file name under the output tree.
///
/// The per-run directory encoded in the name's `time_` segment is tried
/// first; failing that, the whole output tree is searched recursively.
///
/// # Errors
/// [`CheckpointError::NotFound`] if no file with that name exists, or
/// [`CheckpointError::Ambiguous`] if the search finds more than one.
pub fn find_checkpoint(output_dir: &Path, file_name: &str) -> Result<PathBuf, CheckpointError> {
    if let Some(start_time) = file_name
        .split("__")
        .find_map(|segment| segment.strip_prefix("time_"))
    {
        let expected = output_dir
            .join("checkpoints")
            .join(start_time)
            .join(file_name);
        if expected.is_file() {
            return Ok(expected);
        }
    }

    let mut candidates = Vec::new();
    collect_matching(output_dir, file_name, &mut candidates)?;
    match candidates.len() {
        0 => Err(CheckpointError::NotFound {
            name: file_name.to_owned(),
            root: output_dir.to_owned(),
        }),
        1 => Ok(candidates.pop().expect("one candidate")),
        _ => Err(CheckpointError::Ambiguous {
            name: file_name.to_owned(),
            candidates,
        }),
    }
}

fn collect_matching(
    dir: &Path,
    file_name: &str,
    out: &mut Vec<PathBuf>,
) -> Result<(), std::io::Error> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_matching(&path, file_name, out)?;
        } else if entry.file_name().to_string_lossy() == file_name {
            out.push(path);
        }
    }
    Ok(())
}

/// The checkpoint records in a per-run directory, sorted by name (and so
/// by stage and step count), keeping every `skip_checkpoints + 1`-th file.
///
/// The final checkpoint is always retained, whether or not the stride
/// lands on it.
pub fn checkpoint_files_in(
    dir: &Path,
    skip_checkpoints: usize,
) -> Result<Vec<PathBuf>, CheckpointError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().map_or(false, |extension| extension == "ckpt")
                && path
                    .file_name()
                    .map_or(false, |name| name.to_string_lossy().starts_with("exp_"))
        })
        .collect();
    files.sort();

    let stride = skip_checkpoints + 1;
    let mut picked: Vec<PathBuf> = files.iter().step_by(stride).cloned().collect();
    if let Some(last) = files.last() {
        if picked.last() != Some(last) {
            picked.push(last.clone());
        }
    }
    Ok(picked)
}
