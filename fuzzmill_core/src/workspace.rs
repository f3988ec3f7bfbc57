use crate::corpus::{CorpusError, recreate_directory};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// File name of the merge control file inside its private directory.
const MERGE_CONTROL_FILE_NAME: &str = "MCF";

/// Root under which a session creates its per-phase directories.
///
/// Every directory handed out is recreated empty, so a phase never observes
/// files left behind by an earlier run. A workspace belongs to one session.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create_temp_fuzzing_dir(&self, name: &str) -> Result<PathBuf, CorpusError> {
        let dir = self.root.join(name);
        recreate_directory(&dir)?;
        Ok(dir)
    }

    /// A uniquely named scratch directory, removed when dropped.
    pub fn scratch_dir(&self, prefix: &str) -> Result<TempDir, CorpusError> {
        std::fs::create_dir_all(&self.root)?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.root)
            .map_err(|e| CorpusError::Io(format!("Failed to create {prefix} dir: {e}")))
    }

    pub fn merge_control_file(&self) -> Result<MergeControlFile, CorpusError> {
        let dir = self.scratch_dir("mcf_tmp_dir")?;
        let path = dir.path().join(MERGE_CONTROL_FILE_NAME);
        Ok(MergeControlFile { path, _dir: dir })
    }
}

/// Incremental merge state shared by the two steps of one two-step merge.
///
/// The path lives in a directory unique to this value; dropping the value
/// deletes it, so no later merge can pick up a stale control file.
#[derive(Debug)]
pub struct MergeControlFile {
    path: PathBuf,
    _dir: TempDir,
}

impl MergeControlFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn temp_fuzzing_dir_is_recreated_empty() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path());
        let dir = workspace.create_temp_fuzzing_dir("new").unwrap();
        fs::write(dir.join("unit"), b"x").unwrap();
        let again = workspace.create_temp_fuzzing_dir("new").unwrap();
        assert_eq!(dir, again);
        assert_eq!(fs::read_dir(&again).unwrap().count(), 0);
    }

    #[test]
    fn merge_control_files_are_unique_and_removed_on_drop() {
        let root = tempdir().unwrap();
        let workspace = Workspace::new(root.path().join("nested"));
        let first = workspace.merge_control_file().unwrap();
        let second = workspace.merge_control_file().unwrap();
        assert_ne!(first.path(), second.path());

        fs::write(first.path(), b"state").unwrap();
        let first_path = first.path().to_path_buf();
        drop(first);
        assert!(!first_path.exists());
        assert!(!first_path.parent().unwrap().exists());
    }
}
