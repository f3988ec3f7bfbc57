//! Session preparation: target options, strategies, corpus subset and
//! dictionary resolution.

use crate::args::{DICT_FLAGNAME, FuzzerArguments};
use crate::config::EngineConfig;
use crate::corpus::{SeedCorpus, copy_from_corpus, directory_file_count};
use crate::dictionary::DictionaryManager;
use crate::session::FuzzOptions;
use crate::strategy::{
    AppliedStrategy, CORPUS_SUBSET_STRATEGY, StrategyPicker, StrategyPool,
    generate_weighted_strategy_pool,
};
use crate::target_options::TargetOptions;
use crate::workspace::Workspace;
use rand::seq::IndexedRandom;
use rand_core::RngCore;
use std::path::{Path, PathBuf};

/// Builds the [`FuzzOptions`] for a session.
///
/// Preparation never fails. Anything that cannot be resolved (options file,
/// seed corpus, subset, dictionary) is logged and left out.
pub struct SessionPreparer<'a> {
    config: &'a EngineConfig,
    workspace: &'a Workspace,
    strategy_picker: &'a dyn StrategyPicker,
    dictionary_manager: &'a dyn DictionaryManager,
    seed_corpus: &'a dyn SeedCorpus,
}

impl<'a> SessionPreparer<'a> {
    pub fn new(
        config: &'a EngineConfig,
        workspace: &'a Workspace,
        strategy_picker: &'a dyn StrategyPicker,
        dictionary_manager: &'a dyn DictionaryManager,
        seed_corpus: &'a dyn SeedCorpus,
    ) -> Self {
        Self {
            config,
            workspace,
            strategy_picker,
            dictionary_manager,
            seed_corpus,
        }
    }

    /// Builds the options for one fuzz phase.
    ///
    /// # Arguments
    /// * `corpus_dir`: The main corpus. A shipped seed corpus is unpacked here.
    /// * `target_path`: The fuzz target binary; its `.options` and `.dict`
    ///   files are looked up next to it.
    /// * `build_dir`: The build the target comes from.
    /// * `rng`: Source of every random choice, so a fixed seed gives fixed options.
    ///
    /// # Returns
    /// The arguments, environment, corpus directories and applied strategies
    /// for [`crate::session::FuzzSession::fuzz`].
    pub fn prepare(
        &self,
        corpus_dir: &Path,
        target_path: &Path,
        build_dir: &Path,
        rng: &mut dyn RngCore,
    ) -> FuzzOptions {
        tracing::debug!(
            target = %target_path.display(),
            build_dir = %build_dir.display(),
            "preparing fuzz session"
        );
        let target_options = TargetOptions::load_for_target(target_path).unwrap_or_else(|e| {
            tracing::error!(error = %e, "ignoring unreadable target options");
            TargetOptions::default()
        });
        let mut arguments = target_options.arguments;

        let pool = if self.config.do_strategies {
            generate_weighted_strategy_pool(&self.config.strategies.strategy_list(), rng)
        } else {
            StrategyPool::new()
        };
        let mut info =
            self.strategy_picker
                .pick_strategies(&pool, target_path, corpus_dir, &arguments, rng);
        arguments.extend(&info.arguments);

        // Variables set by the target itself take precedence over strategy ones.
        let mut extra_env = target_options.extra_env;
        for (name, value) in std::mem::take(&mut info.extra_env) {
            extra_env.entry(name).or_insert(value);
        }

        if let Err(e) = self.seed_corpus.unpack_if_needed(target_path, corpus_dir) {
            tracing::error!(corpus_dir = %corpus_dir.display(), error = %e, "failed to unpack seed corpus");
        }

        let mut fuzz_corpus_dirs = info.additional_corpus_dirs;
        let subset_size = self.config.corpus_subset_sizes.choose(rng).copied();
        let subset_dir = match subset_size {
            Some(size) if pool.do_strategy(CORPUS_SUBSET_STRATEGY) => self
                .corpus_subset(corpus_dir, size, rng)
                .map(|dir| (dir, size)),
            _ => None,
        };
        match subset_dir {
            Some((dir, size)) => {
                info.fuzzing_strategies.push(AppliedStrategy::new(
                    CORPUS_SUBSET_STRATEGY,
                    Some(u64::try_from(size).unwrap_or(u64::MAX)),
                ));
                fuzz_corpus_dirs.push(dir);
            }
            None => fuzz_corpus_dirs.push(corpus_dir.to_path_buf()),
        }

        self.resolve_dictionary(&mut arguments, target_path);

        FuzzOptions {
            corpus_dir: corpus_dir.to_path_buf(),
            arguments: arguments.to_list(),
            strategies: info.fuzzing_strategies,
            fuzz_corpus_dirs,
            extra_env,
            is_mutations_run: info.is_mutations_run,
            merge_back_new_testcases: true,
        }
    }

    /// Copies `size` random units into a fresh subset directory, but only if
    /// the corpus holds more than `size` units.
    fn corpus_subset(&self, corpus_dir: &Path, size: usize, rng: &mut dyn RngCore) -> Option<PathBuf> {
        let count = match directory_file_count(corpus_dir) {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "cannot count corpus, skipping corpus subset");
                return None;
            }
        };
        if count <= size {
            return None;
        }
        let result = self
            .workspace
            .create_temp_fuzzing_dir("subset")
            .and_then(|dir| copy_from_corpus(&dir, corpus_dir, size, rng).map(|_| dir));
        match result {
            Ok(dir) => Some(dir),
            Err(e) => {
                tracing::warn!(error = %e, "failed to create corpus subset");
                None
            }
        }
    }

    fn resolve_dictionary(&self, arguments: &mut FuzzerArguments, target_path: &Path) {
        if let Some(dict) = arguments.get(DICT_FLAGNAME).map(PathBuf::from) {
            if !dict.exists() {
                tracing::error!(
                    dict = %dict.display(),
                    target = %target_path.display(),
                    "cannot find dictionary"
                );
                arguments.remove(DICT_FLAGNAME);
            }
        }

        let dict_path = match arguments.get(DICT_FLAGNAME) {
            Some(path) => PathBuf::from(path),
            None => {
                let default = self.dictionary_manager.default_dictionary_path(target_path);
                if !default.exists() {
                    return;
                }
                arguments.set(DICT_FLAGNAME, default.to_string_lossy());
                default
            }
        };

        if let Err(e) = self.dictionary_manager.correct_if_needed(&dict_path) {
            tracing::warn!(dict = %dict_path.display(), error = %e, "failed to correct dictionary");
        }
    }
}
