use crate::strategy::{
    CORPUS_SUBSET_STRATEGY, RANDOM_MAX_LENGTH_STRATEGY, Strategy, VALUE_PROFILE_STRATEGY,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    /// Extra time a process gets past its libFuzzer-level budget before it is killed.
    #[serde(default = "default_hard_timeout_grace_secs")]
    pub hard_timeout_grace_secs: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_hard_timeout_grace_secs() -> u64 {
    10
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            hard_timeout_grace_secs: default_hard_timeout_grace_secs(),
            working_dir: None,
        }
    }
}

impl RunnerSettings {
    pub fn hard_timeout_grace(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_grace_secs)
    }
}

/// Probability of each strategy being in a session's pool.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StrategySettings {
    #[serde(default = "default_corpus_subset_probability")]
    pub corpus_subset: f64,
    #[serde(default = "default_value_profile_probability")]
    pub value_profile: f64,
    #[serde(default = "default_random_max_len_probability")]
    pub random_max_len: f64,
}

fn default_corpus_subset_probability() -> f64 {
    0.5
}
fn default_value_profile_probability() -> f64 {
    0.33
}
fn default_random_max_len_probability() -> f64 {
    0.15
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            corpus_subset: default_corpus_subset_probability(),
            value_profile: default_value_profile_probability(),
            random_max_len: default_random_max_len_probability(),
        }
    }
}

impl StrategySettings {
    pub fn strategy_list(&self) -> Vec<Strategy> {
        vec![
            Strategy {
                name: CORPUS_SUBSET_STRATEGY,
                probability: self.corpus_subset,
            },
            Strategy {
                name: VALUE_PROFILE_STRATEGY,
                probability: self.value_profile,
            },
            Strategy {
                name: RANDOM_MAX_LENGTH_STRATEGY,
                probability: self.random_max_len,
            },
        ]
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    #[serde(default = "default_true")]
    pub do_strategies: bool,
    /// Set when targets run inside a sandbox that reports every internal
    /// failure as exit code 1, which makes that code meaningless.
    #[serde(default)]
    pub sandboxed: bool,
    #[serde(default = "default_engine_error_exit_code")]
    pub engine_error_exit_code: i32,
    #[serde(default = "default_non_crash_return_codes")]
    pub non_crash_return_codes: Vec<i32>,
    #[serde(default = "default_merge_timeout_secs")]
    pub merge_timeout_secs: u64,
    #[serde(default = "default_mutations_timeout_secs")]
    pub mutations_timeout_secs: u64,
    #[serde(default = "default_reproduction_timeout_limit_secs")]
    pub reproduction_timeout_limit_secs: u64,
    #[serde(default = "default_runs_to_reproduce")]
    pub runs_to_reproduce: u64,
    #[serde(default = "default_corpus_subset_sizes")]
    pub corpus_subset_sizes: Vec<usize>,
    #[serde(default)]
    pub strategies: StrategySettings,
    #[serde(default)]
    pub runner: RunnerSettings,
}

pub fn default_temp_root() -> PathBuf {
    std::env::temp_dir().join("fuzzmill")
}

fn default_true() -> bool {
    true
}

pub fn default_engine_error_exit_code() -> i32 {
    1
}

pub fn default_non_crash_return_codes() -> Vec<i32> {
    // Clean exit, and SIGKILL / SIGTERM sent when the hard timeout expires.
    vec![0, -9, -15]
}

pub fn default_merge_timeout_secs() -> u64 {
    30 * 60
}

pub fn default_mutations_timeout_secs() -> u64 {
    5 * 60
}

pub fn default_reproduction_timeout_limit_secs() -> u64 {
    60
}

pub fn default_runs_to_reproduce() -> u64 {
    100
}

pub fn default_corpus_subset_sizes() -> Vec<usize> {
    vec![10, 20, 50, 75, 75, 100, 100, 100, 125, 125, 150]
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }

    pub fn mutations_timeout(&self) -> Duration {
        Duration::from_secs(self.mutations_timeout_secs)
    }

    pub fn is_non_crash_return_code(&self, return_code: i32) -> bool {
        self.non_crash_return_codes.contains(&return_code)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            temp_root: default_temp_root(),
            do_strategies: true,
            sandboxed: false,
            engine_error_exit_code: default_engine_error_exit_code(),
            non_crash_return_codes: default_non_crash_return_codes(),
            merge_timeout_secs: default_merge_timeout_secs(),
            mutations_timeout_secs: default_mutations_timeout_secs(),
            reproduction_timeout_limit_secs: default_reproduction_timeout_limit_secs(),
            runs_to_reproduce: default_runs_to_reproduce(),
            corpus_subset_sizes: default_corpus_subset_sizes(),
            strategies: StrategySettings::default(),
            runner: RunnerSettings::default(),
        }
    }
}
