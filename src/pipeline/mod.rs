//! Staged email labeling pipeline.
//!
//! Every run flows through an ordered list of named stages:
//! 1. `extract`: fetch messages from the mailbox or the local store
//! 2. `transform`: classify each message into one configured category
//! 3. `load`: apply the category's actions back on the mailbox
//! 4. `sync`: record outcomes in the store and export a run summary
//!
//! Stages share one [`RunContext`] per run and hand each other a single
//! [`StageData`] value. The [`Pipeline`] orchestrator decides whether a
//! failure stops the run.

pub mod category;
pub mod context;
pub mod extract;
pub mod load;
pub mod orchestrator;
pub mod stage;
pub mod sync;
pub mod transform;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use category::{CategoryMatcher, ExactMatcher, FuzzyMatcher};
pub use context::{MetricValue, RunContext, RunMode};
pub use extract::ExtractStage;
pub use load::{Action, LoadStage};
pub use orchestrator::{Pipeline, RunOptions, StagePosition};
pub use stage::{Stage, StageMetrics};
pub use sync::SyncStage;
pub use transform::TransformStage;
pub use types::{ActionResult, EnrichedRecord, RawRecord, RunResult, StageData};
