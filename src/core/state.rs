//! Lock files: one per stack under the state directory.

use super::types::StateLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "state.lock.yaml";

/// Lock file path for a stack within the state directory.
pub fn lock_file_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join(LOCK_FILE)
}

/// Load a stack's lock. Returns None if the stack was never deployed.
pub fn load_lock(state_dir: &Path, stack: &str) -> Result<Option<StateLock>, String> {
    let path = lock_file_path(state_dir, stack);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let lock: StateLock = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid lock file {}: {}", path.display(), e))?;
    Ok(Some(lock))
}

/// Save a lock atomically (write to temp, then rename).
pub fn save_lock(state_dir: &Path, lock: &StateLock) -> Result<(), String> {
    let path = lock_file_path(state_dir, &lock.stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }

    let yaml = serde_yaml_ng::to_string(lock).map_err(|e| format!("serialize error: {}", e))?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| {
        format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;

    Ok(())
}

/// Empty lock for a stack.
pub fn new_lock(stack: &str, region: &str) -> StateLock {
    use crate::tripwire::eventlog::now_iso8601;
    StateLock {
        schema: "1.0".to_string(),
        stack: stack.to_string(),
        region: region.to_string(),
        generated_at: now_iso8601(),
        generator: format!("wipercheck-infra {}", env!("CARGO_PKG_VERSION")),
        blake3_version: "1.8".to_string(),
        template_hash: String::new(),
        template_path: None,
        stack_status: None,
        resources: indexmap::IndexMap::new(),
    }
}

/// Delete a stack's lock. The event log next to it is kept.
pub fn remove_lock(state_dir: &Path, stack: &str) -> Result<bool, String> {
    let path = lock_file_path(state_dir, stack);
    if !path.exists() {
        return Ok(false);
    }
    std::fs::remove_file(&path)
        .map_err(|e| format!("cannot remove {}: {}", path.display(), e))?;
    Ok(true)
}

/// Stacks with a lock file, sorted by name.
pub fn list_locked_stacks(state_dir: &Path) -> Result<Vec<String>, String> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(state_dir)
        .map_err(|e| format!("cannot read {}: {}", state_dir.display(), e))?;

    let mut stacks = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| format!("cannot read {}: {}", state_dir.display(), e))?;
        if !entry.path().join(LOCK_FILE).is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            stacks.push(name.to_string());
        }
    }
    stacks.sort();
    Ok(stacks)
}

/// Load the locks of several stacks, skipping stacks without one.
pub fn load_locks(
    state_dir: &Path,
    stacks: &[String],
) -> Result<HashMap<String, StateLock>, String> {
    let mut locks = HashMap::new();
    for stack in stacks {
        if let Some(lock) = load_lock(state_dir, stack)? {
            locks.insert(stack.clone(), lock);
        }
    }
    Ok(locks)
}
