//! Durable job queue and workflow engine for AI-generated learning content.
//!
//! Callers enqueue typed jobs through [`enqueue::JobQueue`]; a pool of
//! workers driven by [`dispatcher::Dispatcher`] claims them from the
//! [`store::JobStore`], walks the registered workflow graph and records the
//! outcome, retrying transient failures with exponential backoff.

pub mod anthropic;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod enqueue;
pub mod error;
pub mod state_machine;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod ui;
pub mod workflow;
pub mod workflows;
