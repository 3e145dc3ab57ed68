//! Keel processor: turns queued lifecycle events into cluster effects.
//!
//! Ingest handlers feed the [`keel_store::SharedQueue`]; a single
//! [`Processor`] loop drains it. Entries are acknowledged only once their
//! effect is applied, rejected by admission, or known to be unprocessable.

#![forbid(unsafe_code)]

mod backoff;
mod error;
mod ingest;
mod phases;
mod processor;
mod sweeper;

pub use backoff::IdleBackoff;
pub use error::HandlerError;
pub use ingest::{DeploymentIngest, ProjectIngest};
pub use phases::PhaseReporter;
pub use processor::{Disposition, Outcome, Processor, ProcessorConfig};
pub use sweeper::IdleSweeper;
