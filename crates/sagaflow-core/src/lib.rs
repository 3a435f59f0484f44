//! Orchestration engine for Sagaflow.
//!
//! This crate holds the engine itself and the "ports" (handler and snapshot
//! store traits) that hosts and the infrastructure layer implement. It depends
//! only on `sagaflow-types` -- never on `sagaflow-infra` or any IO adapter.

pub mod event;
pub mod flow;
pub mod repository;
