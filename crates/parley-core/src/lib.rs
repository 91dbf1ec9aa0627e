pub mod access;
pub mod errors;
pub mod ids;
pub mod memory;
pub mod payload;
pub mod protocol;
pub mod store;
pub mod topic;

pub use access::{AccessMode, DefaultAccess};
pub use errors::{ProtocolError, StoreError, StoreResult};
pub use ids::{SessionId, Uid};
pub use memory::MemoryStore;
pub use store::Store;
pub use topic::TopicCat;

/// Current server timestamp, truncated to millisecond precision.
pub fn now() -> chrono::DateTime<chrono::Utc> {
    use chrono::SubsecRound;
    chrono::Utc::now().trunc_subsecs(3)
}
