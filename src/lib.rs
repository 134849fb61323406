//! mail-sorter: LLM-driven email labeling pipeline.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod llm;
pub mod mailbox;
pub mod metrics;
pub mod pipeline;
pub mod store;
