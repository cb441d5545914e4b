//! State management for applied resources.
//!
//! Records are keyed by resource identity and persisted through a pluggable
//! [`StateStorage`] backend (local JSON file or S3). The [`StateStore`] is
//! the single shared object the planner and executor read and write.

mod backend;
mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use backend::StateStorage;
pub use local::{LocalStateStorage, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id, with_state_lock};
pub use s3::S3StateStorage;
pub use store::{Precondition, StateStore};
pub use types::{
    HistoryEntry, MAX_HISTORY, STATE_VERSION, StateOperation, StateRecord, StateSnapshot,
};
