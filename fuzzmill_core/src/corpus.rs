use rand::seq::IndexedRandom;
use rand_core::RngCore;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix of the seed corpus directory shipped next to a target.
pub const SEED_CORPUS_DIR_SUFFIX: &str = "_seed_corpus";

/// Defines errors that can arise during corpus directory operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading, copying or moving test cases.
    /// Contains a string describing the failed operation and the underlying error.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// A path that must be a directory exists but is something else.
    #[error("Corpus path {0:?} is not a directory")]
    NotADirectory(PathBuf),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// Removes `dir` if it exists and creates it again, empty.
pub fn recreate_directory(dir: &Path) -> Result<(), CorpusError> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .map_err(|e| CorpusError::Io(format!("Failed to remove {:?}: {}", dir, e)))?;
    }
    fs::create_dir_all(dir)
        .map_err(|e| CorpusError::Io(format!("Failed to create {:?}: {}", dir, e)))
}

/// Lists the test cases directly inside `dir`, sorted by path.
///
/// Hidden files are skipped, subdirectories are not traversed, and a missing
/// directory is treated as an empty corpus.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, CorpusError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    if !dir.is_dir() {
        return Err(CorpusError::NotADirectory(dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .map_err(|e| CorpusError::Io(format!("Failed to read directory {:?}: {}", dir, e)))?
    {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if path.is_file() && !hidden {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn directory_file_count(dir: &Path) -> Result<usize, CorpusError> {
    Ok(list_files(dir)?.len())
}

/// Copies `count` randomly chosen test cases from `source_dir` into `dest_dir`,
/// keeping their file names. Returns how many files were copied.
pub fn copy_from_corpus(
    dest_dir: &Path,
    source_dir: &Path,
    count: usize,
    rng: &mut dyn RngCore,
) -> Result<usize, CorpusError> {
    let files = list_files(source_dir)?;
    let mut copied = 0;
    for source in files.choose_multiple(rng, count) {
        let Some(name) = source.file_name() else {
            continue;
        };
        fs::copy(source, dest_dir.join(name)).map_err(|e| {
            CorpusError::Io(format!("Failed to copy {:?} to {:?}: {}", source, dest_dir, e))
        })?;
        copied += 1;
    }
    Ok(copied)
}

/// Content-derived name for a test case, so identical units collapse to one file.
pub fn unit_file_name(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Moves merged units into `corpus_dir` under the names libFuzzer gave them.
///
/// A unit is left behind when the corpus already holds a file of that name or
/// a file with the same contents, since a merge into an empty output also
/// re-emits the existing corpus units that carry coverage.
/// Returns the number of units moved.
pub fn move_mergeable_units(merge_dir: &Path, corpus_dir: &Path) -> Result<usize, CorpusError> {
    let mut known_contents = HashSet::new();
    for existing in list_files(corpus_dir)? {
        let data = fs::read(&existing)
            .map_err(|e| CorpusError::Io(format!("Failed to read unit {:?}: {}", existing, e)))?;
        known_contents.insert(unit_file_name(&data));
    }

    let mut moved = 0;
    for unit in list_files(merge_dir)? {
        let Some(name) = unit.file_name() else {
            continue;
        };
        let destination = corpus_dir.join(name);
        if destination.exists() {
            continue;
        }
        let data = fs::read(&unit)
            .map_err(|e| CorpusError::Io(format!("Failed to read unit {:?}: {}", unit, e)))?;
        if !known_contents.insert(unit_file_name(&data)) {
            continue;
        }
        // rename fails across filesystems; the merge dir usually lives in a temp mount.
        if fs::rename(&unit, &destination).is_err() {
            fs::write(&destination, &data).map_err(|e| {
                CorpusError::Io(format!("Failed to write unit {:?}: {}", destination, e))
            })?;
            let _ = fs::remove_file(&unit);
        }
        moved += 1;
    }
    Ok(moved)
}

/// Materializes a target's seed corpus into its working corpus.
pub trait SeedCorpus: Send + Sync {
    /// Copies the target's seeds into `corpus_dir` when it makes sense to.
    ///
    /// # Returns
    /// An error if seeds exist but could not be copied. A missing seed corpus
    /// is not an error.
    fn unpack_if_needed(&self, target_path: &Path, corpus_dir: &Path) -> anyhow::Result<()>;
}

/// Seeds shipped as a `<target>_seed_corpus/` directory next to the target.
/// The seeds are only copied into an empty corpus.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectorySeedCorpus;

impl DirectorySeedCorpus {
    pub fn seed_corpus_path(target_path: &Path) -> PathBuf {
        let mut path = target_path.as_os_str().to_owned();
        path.push(SEED_CORPUS_DIR_SUFFIX);
        PathBuf::from(path)
    }
}

impl SeedCorpus for DirectorySeedCorpus {
    fn unpack_if_needed(&self, target_path: &Path, corpus_dir: &Path) -> anyhow::Result<()> {
        let seed_dir = Self::seed_corpus_path(target_path);
        if !seed_dir.is_dir() {
            return Ok(());
        }
        if directory_file_count(corpus_dir)? > 0 {
            return Ok(());
        }
        fs::create_dir_all(corpus_dir)?;
        let mut unpacked = 0;
        for seed in list_files(&seed_dir)? {
            let data = fs::read(&seed)?;
            fs::write(corpus_dir.join(unit_file_name(&data)), &data)?;
            unpacked += 1;
        }
        tracing::info!(seed_dir = %seed_dir.display(), unpacked, "unpacked seed corpus");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use tempfile::tempdir;

    fn write_units(dir: &Path, units: &[(&str, &[u8])]) {
        fs::create_dir_all(dir).unwrap();
        for (name, data) in units {
            fs::write(dir.join(name), data).unwrap();
        }
    }

    #[test]
    fn recreate_directory_empties_existing_dir() {
        let base = tempdir().unwrap();
        let dir = base.path().join("new");
        write_units(&dir, &[("a", b"1")]);
        recreate_directory(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(directory_file_count(&dir).unwrap(), 0);
    }

    #[test]
    fn list_files_skips_hidden_files_and_subdirs() {
        let base = tempdir().unwrap();
        write_units(base.path(), &[("a", b"1"), (".hidden", b"2")]);
        fs::create_dir(base.path().join("sub")).unwrap();
        let files = list_files(base.path()).unwrap();
        assert_eq!(files, vec![base.path().join("a")]);
        assert_eq!(directory_file_count(&base.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn list_files_rejects_regular_file() {
        let base = tempdir().unwrap();
        let file = base.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            list_files(&file),
            Err(CorpusError::NotADirectory(_))
        ));
    }

    #[test]
    fn copy_from_corpus_copies_requested_count() {
        let base = tempdir().unwrap();
        let source = base.path().join("corpus");
        let dest = base.path().join("subset");
        write_units(
            &source,
            &[("a", b"1"), ("b", b"2"), ("c", b"3"), ("d", b"4")],
        );
        fs::create_dir(&dest).unwrap();
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        assert_eq!(copy_from_corpus(&dest, &source, 2, &mut rng).unwrap(), 2);
        assert_eq!(directory_file_count(&dest).unwrap(), 2);
        assert_eq!(directory_file_count(&source).unwrap(), 4);
    }

    #[test]
    fn move_mergeable_units_keeps_names_and_skips_existing_units() {
        let base = tempdir().unwrap();
        let merge = base.path().join("merge");
        let corpus = base.path().join("corpus");
        // libFuzzer names units by the SHA-1 of their contents.
        let old = "c00dbbc9dadfbe1e232e93a729dd4752fade0abf";
        let new = "22af645d1859cb5ca6da0c484f1f37ea98db8cc1";
        write_units(&corpus, &[(old, b"old")]);
        write_units(&merge, &[(old, b"old"), (new, b"new")]);

        let moved = move_mergeable_units(&merge, &corpus).unwrap();
        assert_eq!(moved, 1);
        assert_eq!(
            list_files(&corpus).unwrap(),
            vec![corpus.join(new), corpus.join(old)]
        );
    }

    #[test]
    fn move_mergeable_units_skips_known_contents_under_other_names() {
        let base = tempdir().unwrap();
        let merge = base.path().join("merge");
        let corpus = base.path().join("corpus");
        write_units(&corpus, &[("seed-1", b"old")]);
        write_units(&merge, &[("x", b"old"), ("y", b"new"), ("z", b"new")]);

        let moved = move_mergeable_units(&merge, &corpus).unwrap();
        assert_eq!(moved, 1);
        assert_eq!(directory_file_count(&corpus).unwrap(), 2);
        assert!(corpus.join("y").exists());
    }

    #[test]
    fn seed_corpus_only_fills_empty_corpus() {
        let base = tempdir().unwrap();
        let target = base.path().join("fuzzer");
        write_units(
            &DirectorySeedCorpus::seed_corpus_path(&target),
            &[("s1", b"seed1"), ("s2", b"seed2")],
        );
        let corpus = base.path().join("corpus");
        DirectorySeedCorpus
            .unpack_if_needed(&target, &corpus)
            .unwrap();
        assert_eq!(directory_file_count(&corpus).unwrap(), 2);

        let full = base.path().join("full");
        write_units(&full, &[("existing", b"e")]);
        DirectorySeedCorpus.unpack_if_needed(&target, &full).unwrap();
        assert_eq!(directory_file_count(&full).unwrap(), 1);
    }
}
