//! Durable JSON file discipline shared by the meta and snapshot stores:
//! write to a sibling temp file, then rename into place.

use std::path::Path;

use postpilot_core::{Result, SchedulerError};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SchedulerError::PersistenceError(format!("no parent dir: {path:?}")))?;
    std::fs::create_dir_all(parent)?;

    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn read<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
