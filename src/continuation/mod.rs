//! 续接线程：把多步工作流绑定到单一 Provider

pub mod backend;
pub mod store;

#[cfg(feature = "async-sqlite")]
pub mod sqlite;

pub use backend::{
    BackendError, ContinuationBackend, ContinuationStep, ContinuationThread, MemoryBackend,
};
pub use store::{ContinuationConfig, ContinuationStore};

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteBackend;
