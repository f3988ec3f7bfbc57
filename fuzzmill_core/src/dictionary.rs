use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Suffix of the conventional per-target dictionary file.
pub const DICTIONARY_FILE_EXTENSION: &str = ".dict";

/// `name="value"` or `"value"`, optionally followed by whitespace.
static DICTIONARY_ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:[A-Za-z0-9_]+\s*=\s*)?"(?:[^"\\]|\\.)*"\s*$"#).expect("valid dictionary regex")
});

/// Locates and repairs libFuzzer dictionaries.
pub trait DictionaryManager: Send + Sync {
    /// Conventional dictionary location for a target, whether or not it exists.
    fn default_dictionary_path(&self, target_path: &Path) -> PathBuf;

    /// Best-effort in-place fix of malformed dictionary entries.
    fn correct_if_needed(&self, dictionary_path: &Path) -> anyhow::Result<()>;
}

/// Dictionaries stored as `<target>.dict` next to the target binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDictionaryManager;

impl DictionaryManager for FileDictionaryManager {
    fn default_dictionary_path(&self, target_path: &Path) -> PathBuf {
        let mut path = target_path.as_os_str().to_owned();
        path.push(DICTIONARY_FILE_EXTENSION);
        PathBuf::from(path)
    }

    fn correct_if_needed(&self, dictionary_path: &Path) -> anyhow::Result<()> {
        if !dictionary_path.is_file() {
            return Ok(());
        }
        let content = fs::read_to_string(dictionary_path).map_err(|e| {
            anyhow::anyhow!("Failed to read dictionary {:?}: {}", dictionary_path, e)
        })?;

        let mut changed = false;
        let mut fixed = String::with_capacity(content.len());
        for line in content.lines() {
            let corrected = correct_line(line);
            if corrected != line {
                changed = true;
            }
            fixed.push_str(&corrected);
            fixed.push('\n');
        }

        if changed {
            fs::write(dictionary_path, fixed).map_err(|e| {
                anyhow::anyhow!("Failed to rewrite dictionary {:?}: {}", dictionary_path, e)
            })?;
        }
        Ok(())
    }
}

fn correct_line(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || DICTIONARY_ENTRY_RE.is_match(trimmed) {
        return line.to_string();
    }
    let escaped = trimmed.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
