//! OBSDP Server Library
//!
//! Pipeline orchestration and dual-instance publishing for biodiversity
//! observation data.
//!
//! # Overview
//!
//! Records from external data sources are harvested per source into a verbatim
//! store, transformed into a canonical model by a process run and published as a
//! snapshot that readers see either fully old or fully new:
//!
//! - **Harvest**: per-source runs, deduplicated, isolated from each other
//! - **Process**: one global run at a time, writing into the slot not serving reads
//! - **Instances**: two slots and an active pointer, swapped atomically on promotion
//! - **Validation reports**: bounded samples of valid and invalid records
//! - **Scheduler contract**: jobs are handed to an injected gateway
//!
//! # Architecture
//!
//! The boundary follows a **CQRS** layout: every operation an operator or a cron
//! entry can trigger is a command or query in [`features`], dispatched through the
//! mediator built in [`cqrs`]. Commands that start long-running work enqueue a job
//! with the [`scheduler`]; the job runner then calls into the [`pipeline`].
//!
//! ## Slot lifecycle
//!
//! ```text
//! Inactive -> Populating -> ReadyToActivate -> Active -> Inactive
//!                  |
//!                  +-> Failed -> Populating (next run)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use obsdp_server::pipeline::Pipeline;
//! use obsdp_server::pipeline::selection::SourceSelection;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> obsdp_common::Result<()> {
//! let pipeline = Pipeline::builder("./data/uploads").build().await?;
//! let selection = SourceSelection::all_active(&pipeline.registry().snapshot());
//! let run = pipeline
//!     .process()
//!     .process(selection, true, true, CancellationToken::new())
//!     .await?;
//! println!("published {} records into slot {}", run.published(), run.target_slot);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod cqrs;
pub mod features;
pub mod pipeline;
pub mod reports;
pub mod scheduler;

// Re-export commonly used types
pub use obsdp_common::{ErrorKind, ObsdpError, Result};
pub use pipeline::{Pipeline, PipelineBuilder};
