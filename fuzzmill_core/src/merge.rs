//! Corpus merging.
//!
//! A libFuzzer merge only reports cumulative coverage of everything it was
//! given. To attribute coverage to the units found by one fuzzing run, the
//! merge is done twice over a shared merge control file: first over the
//! corpus that existed before the run, then with the new units added. The
//! difference between the two is what the new units contributed.

use crate::capability::supports_multistep_merge;
use crate::config::EngineConfig;
use crate::corpus::{directory_file_count, move_mergeable_units, recreate_directory};
use crate::error::{EngineError, EngineResult};
use crate::runner::{MergeRequest, Runner};
use crate::stats::{
    EDGE_COVERAGE, FEATURE_COVERAGE, INITIAL_EDGE_COVERAGE, INITIAL_FEATURE_COVERAGE, NEW_EDGES,
    NEW_FEATURES, NEW_UNITS_ADDED, Stats, parse_stats_from_merge_log, stat_i64,
};
use crate::workspace::{MergeControlFile, Workspace};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MERGE_TIMED_OUT: &str = "Merging new testcases timed out.";

/// Result of a successful merge.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub output: String,
    pub command: Vec<String>,
    pub stats: Stats,
    pub time_executed: Duration,
}

/// Runs merges for one session.
pub struct CorpusMergeCoordinator<'a, R: Runner + ?Sized> {
    runner: &'a R,
    config: &'a EngineConfig,
    workspace: &'a Workspace,
}

impl<'a, R: Runner + ?Sized> CorpusMergeCoordinator<'a, R> {
    pub fn new(runner: &'a R, config: &'a EngineConfig, workspace: &'a Workspace) -> Self {
        Self {
            runner,
            config,
            workspace,
        }
    }

    /// Merges `input_dirs` into `output_dir` and parses the cumulative coverage.
    ///
    /// Fails with [`EngineError::Timeout`] if the merge ran out of time and with
    /// [`EngineError::Merge`] on a non-zero exit code.
    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        &self,
        target_path: &Path,
        arguments: &[String],
        input_dirs: &[PathBuf],
        output_dir: &Path,
        reproducers_dir: Option<&Path>,
        max_time: Duration,
        merge_control_file: Option<&MergeControlFile>,
    ) -> EngineResult<MergeOutcome> {
        let mut dirs = Vec::with_capacity(input_dirs.len() + 1);
        dirs.push(output_dir.to_path_buf());
        dirs.extend_from_slice(input_dirs);

        // Removed on drop, whichever way this function returns.
        let merge_tmp_dir = self.workspace.scratch_dir("merge-wd")?;
        tracing::info!(?max_time, "starting merge");
        let result = self.runner.merge(
            target_path,
            &MergeRequest {
                dirs: &dirs,
                timeout: max_time,
                tmp_dir: merge_tmp_dir.path(),
                arguments,
                artifact_prefix: reproducers_dir,
                merge_control_file: merge_control_file.map(MergeControlFile::path),
            },
        )?;
        drop(merge_tmp_dir);

        tracing::debug!(fuzzer_output = %result.output, "merge completed");
        if result.timed_out {
            tracing::error!(fuzzer_output = %result.output, "merging new testcases timed out");
            return Err(EngineError::Timeout(MERGE_TIMED_OUT));
        }
        if result.return_code != 0 {
            tracing::error!(
                return_code = result.return_code,
                fuzzer_output = %result.output,
                "merging new testcases failed"
            );
            return Err(EngineError::Merge {
                return_code: result.return_code,
            });
        }

        let lines: Vec<&str> = result.output.lines().collect();
        let stats = parse_stats_from_merge_log(&lines);
        Ok(MergeOutcome {
            output: result.output,
            command: result.command,
            stats,
            time_executed: result.time_executed,
        })
    }

    /// Merges `existing_dirs` and `new_dir` into `output_dir`, reporting the
    /// coverage contributed by `new_dir` as `new_edges` / `new_features`.
    ///
    /// Targets without multistep merge support get a single merge over all
    /// directories, which only yields cumulative coverage.
    #[allow(clippy::too_many_arguments)]
    pub fn merge_two_step(
        &self,
        target_path: &Path,
        arguments: &[String],
        existing_dirs: &[PathBuf],
        new_dir: &Path,
        output_dir: &Path,
        reproducers_dir: Option<&Path>,
        max_time: Duration,
    ) -> EngineResult<MergeOutcome> {
        let mut all_dirs = existing_dirs.to_vec();
        all_dirs.push(new_dir.to_path_buf());

        if !supports_multistep_merge(target_path) {
            tracing::info!(
                target = %target_path.display(),
                "old version of libFuzzer is used, using single step merge"
            );
            return self.merge(
                target_path,
                arguments,
                &all_dirs,
                output_dir,
                reproducers_dir,
                max_time,
                None,
            );
        }

        // Both steps must see the same control file; it is deleted when
        // `control_file` goes out of scope, on success and on failure.
        let control_file = self.workspace.merge_control_file()?;

        let initial = self.merge(
            target_path,
            arguments,
            existing_dirs,
            output_dir,
            reproducers_dir,
            max_time,
            Some(&control_file),
        )?;
        let initial_edges = stat_i64(&initial.stats, EDGE_COVERAGE).unwrap_or(0);
        let initial_features = stat_i64(&initial.stats, FEATURE_COVERAGE).unwrap_or(0);

        // Nothing from the first step belongs in the output.
        recreate_directory(output_dir)?;

        let remaining = max_time
            .checked_sub(initial.time_executed)
            .filter(|left| !left.is_zero());
        let Some(remaining) = remaining else {
            tracing::error!(
                fuzzer_output = %initial.output,
                ?max_time,
                "merging new testcases timed out after the first step"
            );
            return Err(EngineError::Timeout(MERGE_TIMED_OUT));
        };

        let full = self.merge(
            target_path,
            arguments,
            &all_dirs,
            output_dir,
            reproducers_dir,
            remaining,
            Some(&control_file),
        )?;
        let edges = stat_i64(&full.stats, EDGE_COVERAGE).unwrap_or(0);
        let features = stat_i64(&full.stats, FEATURE_COVERAGE).unwrap_or(0);

        let output = format!("{}\n\n{}", initial.output, full.output);
        let mut new_edges = edges - initial_edges;
        let mut new_features = features - initial_features;
        if new_edges < 0 || new_features < 0 {
            // Coverage cannot shrink between steps sharing a control file.
            tracing::error!(
                initial_edges,
                initial_features,
                edges,
                features,
                output = %output,
                "two step merge failed"
            );
            new_edges = 0;
            new_features = 0;
        }

        let mut stats = Stats::new();
        stats.insert(INITIAL_EDGE_COVERAGE.into(), initial_edges.into());
        stats.insert(INITIAL_FEATURE_COVERAGE.into(), initial_features.into());
        stats.insert(EDGE_COVERAGE.into(), edges.into());
        stats.insert(FEATURE_COVERAGE.into(), features.into());
        stats.insert(NEW_EDGES.into(), new_edges.into());
        stats.insert(NEW_FEATURES.into(), new_features.into());

        Ok(MergeOutcome {
            output,
            command: full.command,
            stats,
            time_executed: initial.time_executed + full.time_executed,
        })
    }

    /// Merges the units a fuzzing run wrote to `new_corpus_dir` back into
    /// `corpus_dir` and records `new_units_added` (plus the merge coverage
    /// stats) in `stats`. Never fails: a broken merge counts as zero new units.
    pub fn merge_new_units(
        &self,
        target_path: &Path,
        corpus_dir: &Path,
        new_corpus_dir: &Path,
        fuzz_corpus_dirs: &[PathBuf],
        arguments: &[String],
        stats: &mut Stats,
    ) {
        let found = directory_file_count(new_corpus_dir).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to count new units");
            0
        });
        if found == 0 {
            stats.insert(NEW_UNITS_ADDED.into(), 0i64.into());
            tracing::info!("skipped corpus merge since no new units added by fuzzing");
            return;
        }

        let new_units_added = match self.merge_into_corpus(
            target_path,
            corpus_dir,
            new_corpus_dir,
            fuzz_corpus_dirs,
            arguments,
        ) {
            Ok((added, merge_stats)) => {
                stats.extend(merge_stats);
                added
            }
            Err(e) => {
                tracing::warn!(error = %e, "merge failed");
                0
            }
        };
        stats.insert(NEW_UNITS_ADDED.into(), new_units_added.into());

        tracing::info!(
            stats = %serde_json::to_string(stats).unwrap_or_default(),
            "stats calculated"
        );
        if new_units_added > 0 {
            tracing::info!(new_units_added, "new units added to corpus");
        } else {
            tracing::info!("no new units found");
        }
    }

    fn merge_into_corpus(
        &self,
        target_path: &Path,
        corpus_dir: &Path,
        new_corpus_dir: &Path,
        fuzz_corpus_dirs: &[PathBuf],
        arguments: &[String],
    ) -> EngineResult<(i64, Stats)> {
        // If this times out some units are lost, which beats piling more work
        // onto a corpus that already takes that long to load.
        let merge_corpus = self.workspace.create_temp_fuzzing_dir("merge-corpus")?;

        let mut merge_dirs = fuzz_corpus_dirs.to_vec();
        if !merge_dirs.iter().any(|dir| dir == corpus_dir) {
            merge_dirs.push(corpus_dir.to_path_buf());
        }

        let old_corpus_len = directory_file_count(corpus_dir)?;
        let outcome = self.merge_two_step(
            target_path,
            arguments,
            &merge_dirs,
            new_corpus_dir,
            &merge_corpus,
            None,
            self.config.merge_timeout(),
        )?;
        move_mergeable_units(&merge_corpus, corpus_dir)?;
        let new_corpus_len = directory_file_count(corpus_dir)?;

        let added = i64::try_from(new_corpus_len).unwrap_or(i64::MAX)
            - i64::try_from(old_corpus_len).unwrap_or(i64::MAX);
        Ok((added, outcome.stats))
    }
}
