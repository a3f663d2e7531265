#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::too_many_lines
)]

//! Training Job Harness
//!
//! Runs toolkit training jobs one after another against a durable output volume,
//! optionally recovering from failed jobs, and supervises the toolkit's web UI.

pub mod config;
pub mod job;
pub mod process;
pub mod runner;
pub mod store;
pub mod webui;

pub use config::HarnessConfig;
pub use job::{Job, JobError, JobFactory, ToolkitJob, ToolkitJobFactory};
pub use runner::{JobFailure, JobRunner, RunError, RunTally};
pub use store::{CommitOutcome, OutputStore, Volume};
