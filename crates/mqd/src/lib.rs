pub mod cascade;
pub mod engine;
pub mod lease;
pub mod pending;
pub mod persistence;
pub mod poller;
pub mod workers;

pub use cascade::{is_open, plan_cascade, CascadePlan, CascadeStep};
pub use engine::{CancelOutcome, EngineError, MergeQueueEngine, SnapshotUpdate};
pub use lease::{LeaseTable, WorkerLease};
pub use pending::{derive_pending, split_batches, AttemptIndex, EligibilityRules};
pub use persistence::{PersistenceError, SqliteStore};
pub use poller::{poll_project, run_poll_cycle, spawn_pollers, spawn_reaper, sync_accounts, PollError};
pub use workers::{WorkerInfo, WorkerRegistry};

#[cfg(test)]
mod tests {
    use super::{EngineError, MergeQueueEngine, PersistenceError, SqliteStore, WorkerRegistry};
    use std::any::TypeId;

    #[test]
    fn crate_root_reexports_engine_types() {
        let _ = TypeId::of::<MergeQueueEngine>();
        let _ = TypeId::of::<EngineError>();
        let _ = TypeId::of::<PersistenceError>();
        let _ = TypeId::of::<WorkerRegistry>();
    }

    #[test]
    fn crate_root_reexports_store() {
        let store = SqliteStore::open_in_memory().expect("in-memory store");
        store.migrate().expect("migrate");
    }
}
