//! Drift detection: compare the template artifact a lock was deployed from
//! with what is on disk now.
//!
//! Live provider state is never queried. A stack drifts when the artifact
//! recorded in its lock is missing or no longer hashes to the recorded
//! template hash, which means the deployed template can no longer be
//! reproduced from the working tree.

use crate::core::types::StateLock;
use crate::tripwire::hasher;
use std::path::Path;

/// A single drift finding.
#[derive(Debug, Clone)]
pub struct DriftFinding {
    pub stack: String,
    pub artifact: String,
    pub expected_hash: String,
    pub actual_hash: String,
    pub detail: String,
}

/// Check one template artifact against its recorded hash.
pub fn check_artifact_drift(stack: &str, path: &str, expected_hash: &str) -> Option<DriftFinding> {
    let file_path = Path::new(path);
    let finding = |actual_hash: String, detail: String| DriftFinding {
        stack: stack.to_string(),
        artifact: path.to_string(),
        expected_hash: expected_hash.to_string(),
        actual_hash,
        detail,
    };

    if !file_path.is_file() {
        return Some(finding(
            "MISSING".to_string(),
            format!("{} does not exist", path),
        ));
    }

    match hasher::hash_file(file_path) {
        Ok(actual) if actual == expected_hash => None,
        Ok(actual) => Some(finding(actual, format!("{} changed since deploy", path))),
        Err(e) => Some(finding(format!("ERROR:{}", e), e)),
    }
}

/// Check a stack's lock. Locks without a recorded artifact cannot drift.
pub fn detect_drift(lock: &StateLock) -> Option<DriftFinding> {
    let path = lock.template_path.as_deref()?;
    // A failed deploy clears the hash; there is nothing to compare against
    if !hasher::is_hash(&lock.template_hash) {
        return None;
    }
    check_artifact_drift(&lock.stack, path, &lock.template_hash)
}

/// Check every lock, in the given order.
pub fn detect_all<'a, I>(locks: I) -> Vec<DriftFinding>
where
    I: IntoIterator<Item = &'a StateLock>,
{
    locks.into_iter().filter_map(detect_drift).collect()
}
