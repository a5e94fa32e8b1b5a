pub mod config;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod input;
pub mod logging;
pub mod observer;
pub mod oracle;
pub mod strategy;

pub use config::{BackendKind, ScacConfig, SearchMode};
pub use error::{Result, ScacError};
pub use evaluator::{BatchEvaluator, ParallelEvaluator};
pub use executor::{CancellationToken, ProcessRunner};
pub use input::{Batch, Candidate, InputMode, InputTemplate};
pub use observer::{NoOpObserver, RecordingObserver, SearchObserver, TracingObserver};
pub use oracle::{InstructionOracle, PerfOracle, PinOracle, QemuOracle, build_oracle};
pub use strategy::{
    Alphabet, BruteAll, BruteBackward, BruteForward, BruteLength, PartialSecret, SearchContext,
    SearchOutcome, SearchParams, SearchResult, SearchStrategy, build_strategy,
};
