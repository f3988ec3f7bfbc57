//! Statistics parsed from libFuzzer's textual output.

use crate::args::{DICT_FLAGNAME, FuzzerArguments};
use crate::strategy::AppliedStrategy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

/// A single numeric statistic. `Missing` serializes as `null` and is used for
/// values the run did not report, e.g. a timeout limit that was never set.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(untagged)]
pub enum StatValue {
    Int(i64),
    Float(f64),
    Missing,
}

impl StatValue {
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            StatValue::Int(v) => Some(v),
            StatValue::Float(v) => Some(v as i64),
            StatValue::Missing => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            StatValue::Int(v) => Some(v as f64),
            StatValue::Float(v) => Some(v),
            StatValue::Missing => None,
        }
    }
}

impl From<i64> for StatValue {
    fn from(v: i64) -> Self {
        StatValue::Int(v)
    }
}

impl From<f64> for StatValue {
    fn from(v: f64) -> Self {
        StatValue::Float(v)
    }
}

impl From<Option<i64>> for StatValue {
    fn from(v: Option<i64>) -> Self {
        v.map_or(StatValue::Missing, StatValue::Int)
    }
}

pub type Stats = BTreeMap<String, StatValue>;

pub const EDGE_COVERAGE: &str = "edge_coverage";
pub const FEATURE_COVERAGE: &str = "feature_coverage";
pub const INITIAL_EDGE_COVERAGE: &str = "initial_edge_coverage";
pub const INITIAL_FEATURE_COVERAGE: &str = "initial_feature_coverage";
pub const NEW_EDGES: &str = "new_edges";
pub const NEW_FEATURES: &str = "new_features";
pub const NEW_UNITS_ADDED: &str = "new_units_added";
pub const TIMEOUT_LIMIT: &str = "timeout_limit";
pub const EXPECTED_DURATION: &str = "expected_duration";
pub const ACTUAL_DURATION: &str = "actual_duration";
pub const FUZZING_TIME_PERCENT: &str = "fuzzing_time_percent";

/// Reads an integer statistic, treating absent and missing values as `None`.
pub fn stat_i64(stats: &Stats, name: &str) -> Option<i64> {
    stats.get(name).and_then(StatValue::as_i64)
}

static MERGE_STATS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"MERGE-OUTER:\s+\d+\s+new files with\s+(\d+)\s+new features added;\s+(\d+)\s+new coverage edges",
    )
    .expect("valid merge stats regex")
});
static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#(\d+)\s+\S+\s+cov:\s+(\d+)(?:\s+ft:\s+(\d+))?(?:\s+corp:\s+(\d+)/\S+)?(?:.*?exec/s:\s+(\d+))?(?:.*?rss:\s+(\d+)Mb)?")
        .expect("valid progress regex")
});
static FINAL_STAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^stat::([a-z_]+):\s+(\d+)").expect("valid final stat regex"));
static TEST_UNIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Test unit written to\s+(\S+)").expect("valid test unit regex"));
static CRASH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ERROR: (?:AddressSanitizer|MemorySanitizer|UndefinedBehaviorSanitizer|ThreadSanitizer|libFuzzer: deadly signal|libFuzzer: fuzz target exited)")
        .expect("valid crash regex")
});
static OOM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ERROR: libFuzzer: out-of-memory").expect("valid oom regex"));
static TIMEOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ERROR: libFuzzer: timeout").expect("valid timeout regex"));
static LEAK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ERROR: LeakSanitizer: detected memory leaks").expect("valid leak regex")
});
static SLOW_UNIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Slowest unit: \d+ s:").expect("valid slow unit regex"));
static INITED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\d+\s+INITED").expect("valid inited regex"));
static BAD_INSTRUMENTATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ERROR: __sanitizer_set_death_callback is not defined|ERROR: no interesting inputs were found\. Is the code instrumented for coverage\?")
        .expect("valid instrumentation regex")
});
static DICTIONARY_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Dictionary: (\d+) entries").expect("valid dictionary regex"));
static ENGINE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:#\d+|INFO:|MERGE-|stat::|Dictionary:|Done \d+ runs|==\d+==|artifact_prefix=|Slowest unit:|SUMMARY:)")
        .expect("valid engine line regex")
});

/// Extracts the crash artifact path libFuzzer reports, if any.
pub fn get_testcase_path<S: AsRef<str>>(log_lines: &[S]) -> Option<PathBuf> {
    log_lines.iter().find_map(|line| {
        TEST_UNIT_RE
            .captures(line.as_ref())
            .map(|caps| PathBuf::from(&caps[1]))
    })
}

/// Parses the generic statistics of a fuzzing run.
pub fn parse_log_stats<S: AsRef<str>>(log_lines: &[S]) -> Stats {
    let mut stats = Stats::new();
    let mut crash_count = 0i64;
    let mut oom_count = 0i64;
    let mut timeout_count = 0i64;
    let mut leak_count = 0i64;
    let mut slow_units_count = 0i64;

    for line in log_lines {
        let line = line.as_ref().trim_end();
        if let Some(caps) = PROGRESS_RE.captures(line) {
            let int = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<i64>().ok());
            stats.insert("number_of_executed_units".into(), int(1).into());
            stats.insert(EDGE_COVERAGE.into(), int(2).into());
            if let Some(ft) = int(3) {
                stats.insert(FEATURE_COVERAGE.into(), ft.into());
            }
            if let Some(corp) = int(4) {
                stats.insert("corpus_size".into(), corp.into());
            }
            if let Some(execs) = int(5) {
                stats.insert("average_exec_per_sec".into(), execs.into());
            }
            if let Some(rss) = int(6) {
                stats.insert("peak_rss_mb".into(), rss.into());
            }
        }
        if let Some(caps) = FINAL_STAT_RE.captures(line) {
            if let Ok(value) = caps[2].parse::<i64>() {
                stats.insert(caps[1].to_string(), value.into());
            }
        }
        if CRASH_RE.is_match(line) {
            crash_count += 1;
        }
        if OOM_RE.is_match(line) {
            oom_count += 1;
        }
        if TIMEOUT_RE.is_match(line) {
            timeout_count += 1;
        }
        if LEAK_RE.is_match(line) {
            leak_count += 1;
        }
        if SLOW_UNIT_RE.is_match(line) {
            slow_units_count += 1;
        }
    }

    stats.insert("crash_count".into(), crash_count.into());
    stats.insert("oom_count".into(), oom_count.into());
    stats.insert("timeout_count".into(), timeout_count.into());
    stats.insert("leak_count".into(), leak_count.into());
    stats.insert("slow_units_count".into(), slow_units_count.into());
    stats
}

/// Derives performance features from the log, the applied strategies and the
/// arguments the run was started with.
pub fn parse_performance_features<S: AsRef<str>>(
    log_lines: &[S],
    strategies: &[AppliedStrategy],
    arguments: &[String],
) -> Stats {
    let mut stats = Stats::new();
    let mut from_engine = 0i64;
    let mut unwanted = 0i64;
    let mut inited = false;
    let mut crashed = false;
    let mut bad_instrumentation = 0i64;
    let mut manual_dict_size = 0i64;

    for line in log_lines {
        let line = line.as_ref().trim_end();
        if line.is_empty() {
            continue;
        }
        if ENGINE_LINE_RE.is_match(line) {
            from_engine += 1;
        } else {
            unwanted += 1;
        }
        if INITED_RE.is_match(line) {
            inited = true;
        }
        if CRASH_RE.is_match(line) || OOM_RE.is_match(line) || LEAK_RE.is_match(line) {
            crashed = true;
        }
        if BAD_INSTRUMENTATION_RE.is_match(line) {
            bad_instrumentation = 1;
        }
        if let Some(caps) = DICTIONARY_SIZE_RE.captures(line) {
            manual_dict_size = caps[1].parse().unwrap_or(0);
        }
    }

    stats.insert("log_lines_from_engine".into(), from_engine.into());
    stats.insert("log_lines_unwanted".into(), unwanted.into());
    stats.insert(
        "startup_crash_count".into(),
        i64::from(crashed && !inited).into(),
    );
    stats.insert("bad_instrumentation".into(), bad_instrumentation.into());

    let parsed_args = FuzzerArguments::from_list(arguments);
    stats.insert(
        "dict_used".into(),
        i64::from(parsed_args.contains(DICT_FLAGNAME)).into(),
    );
    stats.insert("manual_dict_size".into(), manual_dict_size.into());

    for strategy in strategies {
        let value = strategy
            .parameter
            .map_or(1, |p| i64::try_from(p).unwrap_or(i64::MAX));
        stats.insert(format!("strategy_{}", strategy.name), value.into());
    }
    stats
}

/// Parses cumulative coverage reported by a merge run. Both values default to
/// zero when the summary line is absent.
pub fn parse_stats_from_merge_log<S: AsRef<str>>(log_lines: &[S]) -> Stats {
    let mut stats = Stats::new();
    let (mut features, mut edges) = (0i64, 0i64);
    // The summary is the last line of interest, so search from the end.
    for line in log_lines.iter().rev() {
        if let Some(caps) = MERGE_STATS_RE.captures(line.as_ref()) {
            features = caps[1].parse().unwrap_or(0);
            edges = caps[2].parse().unwrap_or(0);
            break;
        }
    }
    stats.insert(EDGE_COVERAGE.into(), edges.into());
    stats.insert(FEATURE_COVERAGE.into(), features.into());
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    const FUZZ_LOG: &[&str] = &[
        "INFO: Seed: 1337",
        "Dictionary: 12 entries",
        "#2\tINITED cov: 10 ft: 11 corp: 1/1b exec/s: 0 rss: 30Mb",
        "hello from the target",
        "#1024\tpulse  cov: 40 ft: 52 corp: 7/90b lim: 4 exec/s: 512 rss: 41Mb",
        "==42== ERROR: libFuzzer: deadly signal",
        "artifact_prefix='/tmp/r/'; Test unit written to /tmp/r/crash-abc",
        "stat::number_of_executed_units: 2048",
        "stat::peak_rss_mb: 44",
    ];

    #[test]
    fn testcase_path_is_extracted() {
        assert_eq!(
            get_testcase_path(FUZZ_LOG),
            Some(PathBuf::from("/tmp/r/crash-abc"))
        );
        assert_eq!(get_testcase_path(&["nothing here"]), None);
    }

    #[test]
    fn log_stats_prefer_final_stat_lines() {
        let stats = parse_log_stats(FUZZ_LOG);
        assert_eq!(stat_i64(&stats, "number_of_executed_units"), Some(2048));
        assert_eq!(stat_i64(&stats, "peak_rss_mb"), Some(44));
        assert_eq!(stat_i64(&stats, "edge_coverage"), Some(40));
        assert_eq!(stat_i64(&stats, "feature_coverage"), Some(52));
        assert_eq!(stat_i64(&stats, "corpus_size"), Some(7));
        assert_eq!(stat_i64(&stats, "average_exec_per_sec"), Some(512));
        assert_eq!(stat_i64(&stats, "crash_count"), Some(1));
        assert_eq!(stat_i64(&stats, "oom_count"), Some(0));
    }

    #[test]
    fn performance_features_include_strategies_and_dictionary() {
        let strategies = vec![
            AppliedStrategy::new("corpus_subset", Some(50)),
            AppliedStrategy::new("value_profile", None),
        ];
        let args = vec!["-dict=/x.dict".to_string()];
        let stats = parse_performance_features(FUZZ_LOG, &strategies, &args);
        assert_eq!(stat_i64(&stats, "strategy_corpus_subset"), Some(50));
        assert_eq!(stat_i64(&stats, "strategy_value_profile"), Some(1));
        assert_eq!(stat_i64(&stats, "dict_used"), Some(1));
        assert_eq!(stat_i64(&stats, "manual_dict_size"), Some(12));
        assert_eq!(stat_i64(&stats, "log_lines_unwanted"), Some(1));
        assert_eq!(stat_i64(&stats, "startup_crash_count"), Some(0));
    }

    #[test]
    fn crash_before_init_is_a_startup_crash() {
        let log = ["==1==ERROR: AddressSanitizer: SEGV on unknown address"];
        let stats = parse_performance_features(&log, &[], &[]);
        assert_eq!(stat_i64(&stats, "startup_crash_count"), Some(1));
    }

    #[test]
    fn merge_log_uses_last_summary_line() {
        let log = [
            "MERGE-OUTER: 3 new files with 10 new features added; 4 new coverage edges",
            "MERGE-OUTER: 5 new files with 30 new features added; 12 new coverage edges",
        ];
        let stats = parse_stats_from_merge_log(&log);
        assert_eq!(stat_i64(&stats, "edge_coverage"), Some(12));
        assert_eq!(stat_i64(&stats, "feature_coverage"), Some(30));
    }

    #[test]
    fn merge_log_without_summary_defaults_to_zero() {
        let stats = parse_stats_from_merge_log(&["MERGE-INNER: using the control file"]);
        assert_eq!(stat_i64(&stats, "edge_coverage"), Some(0));
        assert_eq!(stat_i64(&stats, "feature_coverage"), Some(0));
    }

    #[test]
    fn missing_values_serialize_as_null() {
        let mut stats = Stats::new();
        stats.insert("timeout_limit".into(), StatValue::Missing);
        stats.insert("actual_duration".into(), StatValue::Int(5));
        let json = serde_json::to_string(&stats).unwrap();
        assert_eq!(json, r#"{"actual_duration":5,"timeout_limit":null}"#);
    }
}
