//! libFuzzer command-line argument handling.
//!
//! Flags have the form `-name=value`. Anything else (corpus directories,
//! testcase paths, flags without `=`) is kept verbatim as a positional extra.

pub const DICT_FLAGNAME: &str = "dict";
pub const TIMEOUT_FLAGNAME: &str = "timeout";
pub const RUNS_FLAGNAME: &str = "runs";
pub const MAX_LEN_FLAGNAME: &str = "max_len";
pub const MAX_TOTAL_TIME_FLAGNAME: &str = "max_total_time";
pub const VALUE_PROFILE_FLAGNAME: &str = "use_value_profile";
pub const ARTIFACT_PREFIX_FLAGNAME: &str = "artifact_prefix";
pub const EXACT_ARTIFACT_PATH_FLAGNAME: &str = "exact_artifact_path";
pub const MERGE_FLAGNAME: &str = "merge";
pub const MERGE_CONTROL_FILE_FLAGNAME: &str = "merge_control_file";
pub const MINIMIZE_CRASH_FLAGNAME: &str = "minimize_crash";
pub const CLEANSE_CRASH_FLAGNAME: &str = "cleanse_crash";

/// Flags that only make sense inside the fuzzing loop.
const FUZZING_ONLY_FLAGNAMES: &[&str] = &[
    DICT_FLAGNAME,
    "fork",
    MAX_TOTAL_TIME_FLAGNAME,
    RUNS_FLAGNAME,
    "data_flow_trace",
    "focus_function",
    "collect_data_flow",
    "jobs",
    "workers",
];

/// Additionally removed before a merge; merge runs get their own budget.
const MERGE_EXCLUDED_FLAGNAMES: &[&str] = &[TIMEOUT_FLAGNAME];

/// An ordered set of `-name=value` flags plus positional extras.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuzzerArguments {
    flags: Vec<(String, String)>,
    extra: Vec<String>,
}

impl FuzzerArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_list<S: AsRef<str>>(arguments: &[S]) -> Self {
        let mut parsed = Self::new();
        for argument in arguments {
            let argument = argument.as_ref();
            match parse_flag(argument) {
                Some((name, value)) => parsed.set(name, value),
                None => parsed.extra.push(argument.to_string()),
            }
        }
        parsed
    }

    pub fn to_list(&self) -> Vec<String> {
        self.flags
            .iter()
            .map(|(name, value)| format!("-{name}={value}"))
            .chain(self.extra.iter().cloned())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|(flag, _)| flag == name)
            .map(|(_, value)| value.as_str())
    }

    /// Returns `None` when the flag is absent or its value is not an integer.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|value| value.trim().parse().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets a flag, replacing its value in place if it already exists.
    pub fn set(&mut self, name: impl Into<String>, value: impl ToString) {
        let name = name.into();
        let value = value.to_string();
        match self.flags.iter_mut().find(|(flag, _)| *flag == name) {
            Some(existing) => existing.1 = value,
            None => self.flags.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.flags.iter().position(|(flag, _)| flag == name)?;
        Some(self.flags.remove(index).1)
    }

    /// Merges another argument list into this one. Later flags win.
    pub fn extend<S: AsRef<str>>(&mut self, arguments: &[S]) {
        let other = Self::from_list(arguments);
        for (name, value) in other.flags {
            self.set(name, value);
        }
        self.extra.extend(other.extra);
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.extra.is_empty()
    }
}

fn parse_flag(argument: &str) -> Option<(&str, &str)> {
    let body = argument.strip_prefix('-')?;
    let (name, value) = body.split_once('=')?;
    if name.is_empty() || name.starts_with('-') {
        return None;
    }
    Some((name, value))
}

/// Removes fuzzing-only flags, leaving a neutral baseline suitable for
/// replaying or merging.
pub fn strip_fuzzing_arguments<S: AsRef<str>>(arguments: &[S], is_merge: bool) -> Vec<String> {
    let mut parsed = FuzzerArguments::from_list(arguments);
    for name in FUZZING_ONLY_FLAGNAMES {
        parsed.remove(name);
    }
    if is_merge {
        for name in MERGE_EXCLUDED_FLAGNAMES {
            parsed.remove(name);
        }
    }
    parsed.to_list()
}

/// Raises an existing `-timeout` flag to at least `limit_secs`.
pub fn fix_timeout_argument_for_reproduction<S: AsRef<str>>(
    arguments: &[S],
    limit_secs: u64,
) -> Vec<String> {
    let mut parsed = FuzzerArguments::from_list(arguments);
    if let Some(current) = parsed.get_int(TIMEOUT_FLAGNAME) {
        let limit = i64::try_from(limit_secs).unwrap_or(i64::MAX);
        parsed.set(TIMEOUT_FLAGNAME, current.max(limit));
    }
    parsed.to_list()
}
