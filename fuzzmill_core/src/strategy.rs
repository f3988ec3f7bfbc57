use crate::args::{FuzzerArguments, MAX_LEN_FLAGNAME, VALUE_PROFILE_FLAGNAME};
use rand::Rng;
use rand_core::RngCore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const CORPUS_SUBSET_STRATEGY: &str = "corpus_subset";
pub const VALUE_PROFILE_STRATEGY: &str = "value_profile";
pub const RANDOM_MAX_LENGTH_STRATEGY: &str = "random_max_len";

/// Upper bound for `-max_len` chosen by the random max length strategy.
pub const MAX_VALUE_FOR_MAX_LENGTH: u64 = 10_000;

/// A strategy that may be applied to a session with the given probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Strategy {
    pub name: &'static str,
    pub probability: f64,
}

/// Label of a strategy that was applied to a session, used for statistics only.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AppliedStrategy {
    pub name: String,
    /// Numeric parameter of the strategy, e.g. the subset size.
    pub parameter: Option<u64>,
}

impl AppliedStrategy {
    pub fn new(name: impl Into<String>, parameter: Option<u64>) -> Self {
        Self {
            name: name.into(),
            parameter,
        }
    }
}

/// The set of strategies a session is allowed to use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyPool {
    strategies: BTreeSet<&'static str>,
}

impl StrategyPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &'static str) {
        self.strategies.insert(name);
    }

    pub fn do_strategy(&self, name: &str) -> bool {
        self.strategies.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.strategies.iter().copied()
    }
}

/// Draws a strategy pool. Each strategy is included independently with its
/// probability, so a fixed `rng` always yields the same pool.
pub fn generate_weighted_strategy_pool(
    strategies: &[Strategy],
    rng: &mut dyn RngCore,
) -> StrategyPool {
    let mut pool = StrategyPool::new();
    for strategy in strategies {
        // Rejects NaN as well as non-positive weights.
        if !(strategy.probability > 0.0) {
            continue;
        }
        if rng.random::<f64>() < strategy.probability {
            pool.add(strategy.name);
        }
    }
    pool
}

/// What a strategy picker decided for one session.
#[derive(Debug, Clone, Default)]
pub struct StrategyInfo {
    pub fuzzing_strategies: Vec<AppliedStrategy>,
    pub arguments: Vec<String>,
    pub extra_env: BTreeMap<String, String>,
    pub additional_corpus_dirs: Vec<PathBuf>,
    pub is_mutations_run: bool,
}

/// Turns a strategy pool into concrete arguments and environment for a target.
pub trait StrategyPicker: Send + Sync {
    /// Picks the strategies for one session.
    ///
    /// # Arguments
    /// * `pool`: Strategies available to this session, with their weights.
    /// * `target_path`: The fuzz target binary.
    /// * `corpus_dir`: The main corpus.
    /// * `arguments`: Arguments prepared so far; a strategy never overrides a
    ///   flag that is already set.
    /// * `rng`: Source of every random choice.
    ///
    /// # Returns
    /// Extra arguments, environment and corpus directories, plus whether this
    /// session is a mutations run.
    fn pick_strategies(
        &self,
        pool: &StrategyPool,
        target_path: &Path,
        corpus_dir: &Path,
        arguments: &FuzzerArguments,
        rng: &mut dyn RngCore,
    ) -> StrategyInfo;
}

/// Applies the argument-only libFuzzer strategies. Corpus subsetting is left
/// to the session preparer since it needs the corpus workspace.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibFuzzerStrategyPicker;

impl StrategyPicker for LibFuzzerStrategyPicker {
    fn pick_strategies(
        &self,
        pool: &StrategyPool,
        _target_path: &Path,
        _corpus_dir: &Path,
        arguments: &FuzzerArguments,
        rng: &mut dyn RngCore,
    ) -> StrategyInfo {
        let mut info = StrategyInfo::default();

        if pool.do_strategy(VALUE_PROFILE_STRATEGY) && !arguments.contains(VALUE_PROFILE_FLAGNAME)
        {
            info.arguments.push(format!("-{VALUE_PROFILE_FLAGNAME}=1"));
            info.fuzzing_strategies
                .push(AppliedStrategy::new(VALUE_PROFILE_STRATEGY, None));
        }

        // A target that pins its own max_len knows its input format better.
        if pool.do_strategy(RANDOM_MAX_LENGTH_STRATEGY) && !arguments.contains(MAX_LEN_FLAGNAME) {
            let max_len = rng.random_range(1..=MAX_VALUE_FOR_MAX_LENGTH);
            info.arguments.push(format!("-{MAX_LEN_FLAGNAME}={max_len}"));
            info.fuzzing_strategies
                .push(AppliedStrategy::new(RANDOM_MAX_LENGTH_STRATEGY, Some(max_len)));
        }

        info
    }
}
