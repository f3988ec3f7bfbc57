//! A single fuzz phase: run the fuzzer, detect a crash, collect statistics
//! and merge new units back into the corpus.

use crate::args::{
    FuzzerArguments, TIMEOUT_FLAGNAME, fix_timeout_argument_for_reproduction,
    strip_fuzzing_arguments,
};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::merge::CorpusMergeCoordinator;
use crate::runner::{FuzzRequest, Runner};
use crate::stats::{
    ACTUAL_DURATION, EXPECTED_DURATION, FUZZING_TIME_PERCENT, Stats, StatValue, TIMEOUT_LIMIT,
    parse_performance_features,
};
use crate::strategy::AppliedStrategy;
use crate::workspace::Workspace;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Printed by Trusty devices when the kernel panics; such runs leave no artifact.
pub const KERNEL_PANIC_MARKER: &str = "panic notifier - trusty version";

static DICT_PARSE_FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ParseDictionaryFile: error in line (\d+)").expect("valid dictionary error regex")
});

/// Everything needed to run one fuzz phase. Produced by
/// [`crate::prepare::SessionPreparer`].
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct FuzzOptions {
    pub corpus_dir: PathBuf,
    pub arguments: Vec<String>,
    pub strategies: Vec<AppliedStrategy>,
    /// Directories handed to the fuzzer as its corpus, in priority order.
    pub fuzz_corpus_dirs: Vec<PathBuf>,
    pub extra_env: BTreeMap<String, String>,
    pub is_mutations_run: bool,
    pub merge_back_new_testcases: bool,
}

/// A crash found by a fuzz phase.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Crash {
    /// The artifact libFuzzer wrote, or an empty placeholder when it wrote none.
    pub input_path: PathBuf,
    pub logs: String,
    /// The session arguments without fuzzing-only flags, suitable for replay.
    pub reproduce_arguments: Vec<String>,
    pub duration: Duration,
}

/// Outcome of a fuzz phase.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FuzzResult {
    pub logs: String,
    pub command: Vec<String>,
    /// At most one crash per fuzz phase.
    pub crashes: Vec<Crash>,
    pub stats: Stats,
    pub time_executed: Duration,
    pub timed_out: bool,
}

/// Runs one fuzz phase and, if requested, merges the units it found back
/// into the corpus.
pub struct FuzzSession<'a, R: Runner + ?Sized> {
    runner: &'a R,
    config: &'a EngineConfig,
    workspace: &'a Workspace,
}

impl<'a, R: Runner + ?Sized> FuzzSession<'a, R> {
    pub fn new(runner: &'a R, config: &'a EngineConfig, workspace: &'a Workspace) -> Self {
        Self {
            runner,
            config,
            workspace,
        }
    }

    /// Fuzzes `target_path` for up to `max_time`.
    ///
    /// Crashes are reported in [`FuzzResult::crashes`], not as errors. Only
    /// failing to start the target or to set up the session directories fails.
    pub fn fuzz(
        &self,
        target_path: &Path,
        options: &FuzzOptions,
        reproducers_dir: &Path,
        max_time: Duration,
    ) -> EngineResult<FuzzResult> {
        let mut corpus_dirs = Vec::with_capacity(options.fuzz_corpus_dirs.len() + 1);
        let new_corpus_dir = if options.merge_back_new_testcases {
            let dir = self.workspace.create_temp_fuzzing_dir("new")?;
            corpus_dirs.push(dir.clone());
            Some(dir)
        } else {
            None
        };
        corpus_dirs.extend(options.fuzz_corpus_dirs.iter().cloned());

        tracing::info!(
            target = %target_path.display(),
            ?max_time,
            corpus_dirs = corpus_dirs.len(),
            "running fuzzer"
        );
        let result = self.runner.fuzz(
            target_path,
            &FuzzRequest {
                corpus_dirs: &corpus_dirs,
                timeout: max_time,
                arguments: &options.arguments,
                artifact_prefix: reproducers_dir,
                extra_env: &options.extra_env,
            },
        )?;
        match classify_output(&result.output, result.return_code, self.config) {
            OutputCondition::DictionaryParseError { line } => {
                tracing::error!(line = %line, "dictionary parse failed");
            }
            OutputCondition::EngineError => {
                tracing::error!(fuzzer_output = %result.output, "libFuzzer: engine encountered an error");
            }
            OutputCondition::Normal => {}
        }

        // The raw output can be large; keep only the split lines from here on.
        let log_lines: Vec<String> = result.output.lines().map(str::to_owned).collect();
        drop(result.output);

        let crash_path = match self.runner.get_testcase_path(&log_lines) {
            Some(path) => Some(path),
            None if !self.config.is_non_crash_return_code(result.return_code)
                || log_lines.iter().any(|l| l.contains(KERNEL_PANIC_MARKER)) =>
            {
                Some(create_placeholder_testcase(reproducers_dir)?)
            }
            None => None,
        };

        let mut stats = self.runner.parse_log_stats(&log_lines);
        stats.extend(parse_performance_features(
            &log_lines,
            &options.strategies,
            &options.arguments,
        ));

        let merge_arguments = strip_fuzzing_arguments(&options.arguments, true);
        let timeout_limit = FuzzerArguments::from_list(&options.arguments).get_int(TIMEOUT_FLAGNAME);
        let expected = max_time.as_secs_f64();
        let actual = result.time_executed.as_secs_f64();
        let percent = if expected > 0.0 {
            100.0 * actual / expected
        } else {
            0.0
        };
        stats.insert(TIMEOUT_LIMIT.into(), timeout_limit.into());
        stats.insert(EXPECTED_DURATION.into(), StatValue::Float(expected));
        stats.insert(ACTUAL_DURATION.into(), StatValue::Float(actual));
        stats.insert(FUZZING_TIME_PERCENT.into(), StatValue::Float(percent));

        if let Some(new_corpus_dir) = &new_corpus_dir {
            CorpusMergeCoordinator::new(self.runner, self.config, self.workspace).merge_new_units(
                target_path,
                &options.corpus_dir,
                new_corpus_dir,
                &options.fuzz_corpus_dirs,
                &merge_arguments,
                &mut stats,
            );
        }

        let logs = log_lines.join("\n");
        let crashes = match crash_path {
            Some(input_path) => {
                let reproduce_arguments = fix_timeout_argument_for_reproduction(
                    &strip_fuzzing_arguments(&options.arguments, false),
                    self.config.reproduction_timeout_limit_secs,
                );
                tracing::info!(input_path = %input_path.display(), "fuzzer found a crash");
                vec![Crash {
                    input_path,
                    logs: logs.clone(),
                    reproduce_arguments,
                    duration: result.time_executed,
                }]
            }
            None => Vec::new(),
        };

        Ok(FuzzResult {
            logs,
            command: result.command,
            crashes,
            stats,
            time_executed: result.time_executed,
            timed_out: result.timed_out,
        })
    }
}

/// What the fuzzer output says about the run, apart from crashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputCondition {
    /// libFuzzer rejected the dictionary at the given line.
    DictionaryParseError { line: String },
    /// The engine itself failed rather than the target.
    EngineError,
    Normal,
}

/// Classifies fuzzer output. Sandboxes report their own failures with the
/// engine error exit code, so that code only counts when running unsandboxed.
pub fn classify_output(output: &str, return_code: i32, config: &EngineConfig) -> OutputCondition {
    if let Some(caps) = DICT_PARSE_FAILED_RE.captures(output) {
        OutputCondition::DictionaryParseError {
            line: caps[1].to_string(),
        }
    } else if !config.sandboxed && return_code == config.engine_error_exit_code {
        OutputCondition::EngineError
    } else {
        OutputCondition::Normal
    }
}

/// An empty testcase standing in for a crash that left no artifact, such as a
/// startup crash.
fn create_placeholder_testcase(reproducers_dir: &Path) -> EngineResult<PathBuf> {
    std::fs::create_dir_all(reproducers_dir)?;
    let (_, path) = tempfile::Builder::new()
        .prefix("crash-")
        .tempfile_in(reproducers_dir)?
        .keep()
        .map_err(|e| e.error)?;
    Ok(path)
}
