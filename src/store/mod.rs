//! 持久化：在途快照与运行历史

pub mod history;
pub mod snapshot;

pub use history::HistoryStore;
pub use snapshot::SnapshotStore;
