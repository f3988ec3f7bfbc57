//! Timeout-bounded replay, minimization and cleansing of single testcases.

use crate::args::{FuzzerArguments, RUNS_FLAGNAME, strip_fuzzing_arguments};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::runner::{RunResult, Runner};
use crate::workspace::Workspace;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Outcome of a replay, minimization or cleanse.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ReproduceResult {
    pub command: Vec<String>,
    pub return_code: i32,
    pub time_executed: Duration,
    pub output: String,
}

impl From<RunResult> for ReproduceResult {
    fn from(result: RunResult) -> Self {
        Self {
            command: result.command,
            return_code: result.return_code,
            time_executed: result.time_executed,
            output: result.output,
        }
    }
}

/// Replays, minimizes and cleanses single testcases.
pub struct ReproductionRunner<'a, R: Runner + ?Sized> {
    runner: &'a R,
    config: &'a EngineConfig,
    workspace: &'a Workspace,
}

impl<'a, R: Runner + ?Sized> ReproductionRunner<'a, R> {
    pub fn new(runner: &'a R, config: &'a EngineConfig, workspace: &'a Workspace) -> Self {
        Self {
            runner,
            config,
            workspace,
        }
    }

    /// Runs `input_path` through the target `runs_to_reproduce` times.
    ///
    /// # Arguments
    /// * `target_path`: The fuzz target binary.
    /// * `input_path`: The testcase to replay.
    /// * `arguments`: Arguments the crash was found with; fuzzing-only flags
    ///   are removed.
    /// * `max_time`: Replay budget.
    ///
    /// # Returns
    /// The replay result, or [`EngineError::Timeout`] if the budget ran out.
    pub fn reproduce(
        &self,
        target_path: &Path,
        input_path: &Path,
        arguments: &[String],
        max_time: Duration,
    ) -> EngineResult<ReproduceResult> {
        let mut arguments = FuzzerArguments::from_list(&strip_fuzzing_arguments(arguments, false));
        arguments.set(RUNS_FLAGNAME, self.config.runs_to_reproduce);

        let result = self.runner.run_single_testcase(
            target_path,
            input_path,
            max_time,
            &arguments.to_list(),
        )?;
        if result.timed_out {
            tracing::error!(fuzzer_output = %result.output, "reproducing timed out");
            return Err(EngineError::Timeout("Reproducing timed out."));
        }
        Ok(result.into())
    }

    /// Shrinks `input_path` into `output_path`. Fails with
    /// [`EngineError::Timeout`] if `max_time` runs out.
    pub fn minimize_testcase(
        &self,
        target_path: &Path,
        arguments: &[String],
        input_path: &Path,
        output_path: &Path,
        max_time: Duration,
    ) -> EngineResult<ReproduceResult> {
        let artifact_dir = self.workspace.create_temp_fuzzing_dir("minimize-workdir")?;
        let result = self.runner.minimize_crash(
            target_path,
            input_path,
            output_path,
            max_time,
            &artifact_dir,
            &strip_fuzzing_arguments(arguments, false),
        )?;
        if result.timed_out {
            tracing::error!(fuzzer_output = %result.output, "minimization timed out");
            return Err(EngineError::Timeout("Minimization timed out."));
        }
        Ok(result.into())
    }

    /// Rewrites the bytes of a crashing input that do not matter for the crash.
    pub fn cleanse(
        &self,
        target_path: &Path,
        arguments: &[String],
        input_path: &Path,
        output_path: &Path,
        max_time: Duration,
    ) -> EngineResult<ReproduceResult> {
        let artifact_dir = self.workspace.create_temp_fuzzing_dir("cleanse-workdir")?;
        let result = self.runner.cleanse_crash(
            target_path,
            input_path,
            output_path,
            max_time,
            &artifact_dir,
            &strip_fuzzing_arguments(arguments, false),
        )?;
        if result.timed_out {
            tracing::error!(fuzzer_output = %result.output, "cleanse timed out");
            return Err(EngineError::Timeout("Cleanse timed out."));
        }
        Ok(result.into())
    }
}
