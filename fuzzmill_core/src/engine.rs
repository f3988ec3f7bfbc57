//! The engine facade used by fuzzing workers.

use crate::config::EngineConfig;
use crate::corpus::{DirectorySeedCorpus, SeedCorpus};
use crate::dictionary::{DictionaryManager, FileDictionaryManager};
use crate::error::EngineResult;
use crate::merge::{CorpusMergeCoordinator, MergeOutcome};
use crate::prepare::SessionPreparer;
use crate::reproduce::{ReproduceResult, ReproductionRunner};
use crate::runner::{LibFuzzerRunner, Runner};
use crate::session::{FuzzOptions, FuzzResult, FuzzSession};
use crate::strategy::{LibFuzzerStrategyPicker, StrategyPicker};
use crate::workspace::Workspace;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The libFuzzer engine: prepares, runs and post-processes fuzzing sessions.
///
/// One engine serves one session at a time; run sessions in parallel by
/// giving each worker its own engine and `temp_root`.
pub struct Engine<R: Runner> {
    config: EngineConfig,
    runner: R,
    workspace: Workspace,
    strategy_picker: Box<dyn StrategyPicker>,
    dictionary_manager: Box<dyn DictionaryManager>,
    seed_corpus: Box<dyn SeedCorpus>,
    rng: ChaCha8Rng,
}

impl Engine<LibFuzzerRunner> {
    /// An engine driving real libFuzzer binaries.
    pub fn from_config(config: EngineConfig) -> Self {
        let runner = LibFuzzerRunner::new(config.runner.clone());
        Engine::new(config, runner)
    }
}

impl<R: Runner> Engine<R> {
    /// An engine with the default collaborators and an entropy-seeded RNG.
    pub fn new(config: EngineConfig, runner: R) -> Self {
        Self::with_rng(config, runner, ChaCha8Rng::from_rng(&mut rand::rng()))
    }

    /// Uses `rng` for every random decision, making strategy selection and
    /// corpus subsetting reproducible.
    pub fn with_rng(config: EngineConfig, runner: R, rng: ChaCha8Rng) -> Self {
        let workspace = Workspace::new(config.temp_root.clone());
        Self {
            config,
            runner,
            workspace,
            strategy_picker: Box::new(LibFuzzerStrategyPicker),
            dictionary_manager: Box::new(FileDictionaryManager),
            seed_corpus: Box::new(DirectorySeedCorpus),
            rng,
        }
    }

    pub fn with_strategy_picker(mut self, picker: impl StrategyPicker + 'static) -> Self {
        self.strategy_picker = Box::new(picker);
        self
    }

    pub fn with_dictionary_manager(mut self, manager: impl DictionaryManager + 'static) -> Self {
        self.dictionary_manager = Box::new(manager);
        self
    }

    pub fn with_seed_corpus(mut self, seed_corpus: impl SeedCorpus + 'static) -> Self {
        self.seed_corpus = Box::new(seed_corpus);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Prepares a session; see [`SessionPreparer::prepare`]. Draws from the
    /// engine's RNG.
    pub fn prepare(&mut self, corpus_dir: &Path, target_path: &Path, build_dir: &Path) -> FuzzOptions {
        let preparer = SessionPreparer::new(
            &self.config,
            &self.workspace,
            self.strategy_picker.as_ref(),
            self.dictionary_manager.as_ref(),
            self.seed_corpus.as_ref(),
        );
        preparer.prepare(corpus_dir, target_path, build_dir, &mut self.rng)
    }

    /// Runs one fuzz phase; see [`FuzzSession::fuzz`].
    ///
    /// # Arguments
    /// * `target_path`: The fuzz target binary.
    /// * `options`: Options from [`Engine::prepare`].
    /// * `reproducers_dir`: Where crash artifacts are written.
    /// * `max_time`: Fuzzing budget. Post-processing needs up to
    ///   [`Engine::fuzz_additional_processing_timeout`] on top of it.
    ///
    /// # Returns
    /// The logs, statistics and at most one crash.
    pub fn fuzz(
        &self,
        target_path: &Path,
        options: &FuzzOptions,
        reproducers_dir: &Path,
        max_time: Duration,
    ) -> EngineResult<FuzzResult> {
        FuzzSession::new(&self.runner, &self.config, &self.workspace).fuzz(
            target_path,
            options,
            reproducers_dir,
            max_time,
        )
    }

    /// Replays a testcase; see [`ReproductionRunner::reproduce`].
    pub fn reproduce(
        &self,
        target_path: &Path,
        input_path: &Path,
        arguments: &[String],
        max_time: Duration,
    ) -> EngineResult<ReproduceResult> {
        self.reproduction()
            .reproduce(target_path, input_path, arguments, max_time)
    }

    /// Merges `input_dirs` into `output_dir` in a single step.
    pub fn minimize_corpus(
        &self,
        target_path: &Path,
        arguments: &[String],
        input_dirs: &[PathBuf],
        output_dir: &Path,
        reproducers_dir: &Path,
        max_time: Duration,
    ) -> EngineResult<MergeOutcome> {
        CorpusMergeCoordinator::new(&self.runner, &self.config, &self.workspace).merge(
            target_path,
            arguments,
            input_dirs,
            output_dir,
            Some(reproducers_dir),
            max_time,
            None,
        )
    }

    /// Shrinks a crashing testcase; see [`ReproductionRunner::minimize_testcase`].
    pub fn minimize_testcase(
        &self,
        target_path: &Path,
        arguments: &[String],
        input_path: &Path,
        output_path: &Path,
        max_time: Duration,
    ) -> EngineResult<ReproduceResult> {
        self.reproduction()
            .minimize_testcase(target_path, arguments, input_path, output_path, max_time)
    }

    /// Cleanses a crashing testcase; see [`ReproductionRunner::cleanse`].
    pub fn cleanse(
        &self,
        target_path: &Path,
        arguments: &[String],
        input_path: &Path,
        output_path: &Path,
        max_time: Duration,
    ) -> EngineResult<ReproduceResult> {
        self.reproduction()
            .cleanse(target_path, arguments, input_path, output_path, max_time)
    }

    /// Time a caller must reserve on top of the fuzzing budget for the work
    /// done after the fuzzer exits.
    pub fn fuzz_additional_processing_timeout(&self, options: &FuzzOptions) -> Duration {
        let mut timeout = self.config.merge_timeout();
        if options.is_mutations_run {
            timeout += self.config.mutations_timeout();
        }
        timeout
    }

    fn reproduction(&self) -> ReproductionRunner<'_, R> {
        ReproductionRunner::new(&self.runner, &self.config, &self.workspace)
    }
}
