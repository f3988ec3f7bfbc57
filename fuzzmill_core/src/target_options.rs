//! Per-target `.options` files.
//!
//! ```text
//! [libfuzzer]
//! max_len = 1024
//! dict = png.dict
//!
//! [env]
//! ASAN_OPTIONS = detect_leaks=0
//! ```

use crate::args::{DICT_FLAGNAME, FuzzerArguments};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const OPTIONS_FILE_EXTENSION: &str = ".options";

const LIBFUZZER_SECTION: &str = "libfuzzer";
const ENV_SECTION: &str = "env";

/// Arguments and environment a target ships with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOptions {
    pub arguments: FuzzerArguments,
    pub extra_env: BTreeMap<String, String>,
}

impl TargetOptions {
    pub fn options_path(target_path: &Path) -> PathBuf {
        let mut path = target_path.as_os_str().to_owned();
        path.push(OPTIONS_FILE_EXTENSION);
        PathBuf::from(path)
    }

    /// Loads `<target>.options`. A missing file yields empty options.
    pub fn load_for_target(target_path: &Path) -> Result<Self, anyhow::Error> {
        let path = Self::options_path(target_path);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read options file at {:?}: {}", path, e))?;
        let base_dir = target_path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, base_dir)
            .map_err(|e| anyhow::anyhow!("Failed to parse options file {:?}: {}", path, e))
    }

    /// Relative `dict` paths are resolved against `base_dir`.
    pub fn parse(content: &str, base_dir: &Path) -> Result<Self, anyhow::Error> {
        let mut options = Self::default();
        let mut section: Option<String> = None;

        for (index, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = Some(name.trim().to_ascii_lowercase());
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| anyhow::anyhow!("line {}: expected `key = value`", index + 1))?;
            if key.is_empty() {
                return Err(anyhow::anyhow!("line {}: empty key", index + 1));
            }

            match section.as_deref() {
                Some(LIBFUZZER_SECTION) => {
                    if key == DICT_FLAGNAME {
                        let dict_path = base_dir.join(value);
                        options
                            .arguments
                            .set(key, dict_path.to_string_lossy().into_owned());
                    } else {
                        options.arguments.set(key, value);
                    }
                }
                Some(ENV_SECTION) => {
                    options.extra_env.insert(key.to_string(), value.to_string());
                }
                // Sections for other engines are not ours to interpret.
                Some(_) => {}
                None => {
                    return Err(anyhow::anyhow!(
                        "line {}: entry outside of any section",
                        index + 1
                    ));
                }
            }
        }
        Ok(options)
    }
}
