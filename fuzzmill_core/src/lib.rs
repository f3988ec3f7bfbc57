pub mod args;
pub mod capability;
pub mod config;
pub mod corpus;
pub mod dictionary;
pub mod engine;
pub mod error;
pub mod merge;
pub mod prepare;
pub mod reproduce;
pub mod runner;
pub mod session;
pub mod stats;
pub mod strategy;
pub mod target_options;
pub mod workspace;

pub use args::FuzzerArguments;
pub use config::{EngineConfig, RunnerSettings, StrategySettings};
pub use corpus::{CorpusError, DirectorySeedCorpus, SeedCorpus};
pub use dictionary::{DictionaryManager, FileDictionaryManager};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use merge::{CorpusMergeCoordinator, MergeOutcome};
pub use prepare::SessionPreparer;
pub use reproduce::{ReproduceResult, ReproductionRunner};
pub use runner::{FuzzRequest, LibFuzzerRunner, MergeRequest, RunResult, Runner};
pub use session::{Crash, FuzzOptions, FuzzResult, FuzzSession};
pub use stats::{StatValue, Stats};
pub use strategy::{AppliedStrategy, LibFuzzerStrategyPicker, StrategyInfo, StrategyPicker};
pub use target_options::TargetOptions;
pub use workspace::{MergeControlFile, Workspace};
