//! Shared domain types for Sagaflow.
//!
//! This crate contains the pure-data side of the orchestration engine:
//! flow definitions, run state, step records, snapshots, engine statistics,
//! lifecycle events, engine configuration and storage errors.
//!
//! No runtime dependencies beyond serde, serde_json, uuid, chrono and thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod run;
