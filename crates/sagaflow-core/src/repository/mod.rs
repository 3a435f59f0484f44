//! Repository trait definitions (ports).
//!
//! The engine itself keeps everything in memory; these traits describe where
//! hosts may hand snapshots off for durability. `sagaflow-infra` provides the
//! filesystem implementation.

pub mod snapshot;

pub use snapshot::SnapshotStore;
