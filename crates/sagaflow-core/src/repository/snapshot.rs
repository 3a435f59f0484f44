//! Snapshot store trait definition.

use sagaflow_types::error::SnapshotStoreError;
use sagaflow_types::run::FlowSnapshot;
use uuid::Uuid;

/// Durable home for [`FlowSnapshot`]s, keyed by run ID.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait SnapshotStore: Send + Sync {
    /// Upsert a snapshot (insert or replace by run ID).
    fn save(
        &self,
        snapshot: &FlowSnapshot,
    ) -> impl std::future::Future<Output = Result<(), SnapshotStoreError>> + Send;

    /// Load the snapshot of a run, `None` if none was saved.
    fn load(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FlowSnapshot>, SnapshotStoreError>> + Send;

    /// Run IDs of every stored snapshot, ascending.
    fn list(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, SnapshotStoreError>> + Send;

    /// Delete a snapshot. Returns `true` if it existed.
    fn delete(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, SnapshotStoreError>> + Send;
}
