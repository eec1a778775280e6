//! Marker files recording durable job progress
//!
//! The generated script writes `tag_<i>_finished` into a job directory once command `i` succeeds
//! there, and `tag_finished` into the remote root after every command has run. Markers are only
//! ever created. A rerun of the script skips any command whose marker is already present, and the
//! status poller trusts `tag_finished` over whatever the scheduler says about a dead job.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

/// Whole-job completion marker, written in the remote root
pub const FINISH_TAG: &str = "tag_finished";

/// Per-command marker name for command index `idx`
pub fn command_tag(idx: usize) -> String {
    format!("tag_{idx}_finished")
}

/// Read-only view of the storage the markers live on
///
/// A marker that can't be checked is an error, never an absent marker.
pub trait MarkerStore {
    fn exists(&self, path: &Path) -> io::Result<bool>;

    fn job_finished(&self, remote_root: &Path) -> io::Result<bool> {
        self.exists(&finish_tag_path(remote_root))
    }
}

pub fn finish_tag_path(remote_root: &Path) -> PathBuf {
    remote_root.join(FINISH_TAG)
}

/// Markers on a locally mounted (or shared) filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMarkers;

impl MarkerStore for LocalMarkers {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        let found = match fs::metadata(path) {
            Ok(meta) => meta.is_file(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => return Err(err),
        };
        debug!("Marker {} present: {found}", path.display());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_names() {
        assert_eq!(command_tag(0), "tag_0_finished");
        assert_eq!(command_tag(12), "tag_12_finished");
        assert_eq!(FINISH_TAG, "tag_finished");
    }

    #[test]
    fn test_local_markers() {
        let root = tempfile::tempdir().unwrap();
        assert!(!LocalMarkers.job_finished(root.path()).unwrap());

        fs::write(root.path().join(FINISH_TAG), "").unwrap();
        assert!(LocalMarkers.job_finished(root.path()).unwrap());
    }

    #[test]
    fn test_directory_is_not_a_marker() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join(FINISH_TAG)).unwrap();
        assert!(!LocalMarkers.job_finished(root.path()).unwrap());
    }

    #[test]
    fn test_unreadable_root_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        // a plain file where the remote root should be a directory
        let not_a_dir = root.path().join("plain");
        fs::write(&not_a_dir, "").unwrap();
        assert!(LocalMarkers.job_finished(&not_a_dir).is_err());
    }
}
