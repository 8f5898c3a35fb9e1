//! 核心层：错误分类、并发账本、在途表、分层期限监管、调用指纹、关闭协调

pub mod builder;
pub mod error;
pub mod fingerprint;
pub mod inflight;
pub mod ledger;
pub mod shutdown;
pub mod supervisor;

pub use builder::RuntimeBuilder;
pub use error::{CapabilityNotice, DispatchError, NoticeKind, ToolError};
pub use fingerprint::{call_key, canonical_json, CallScope};
pub use inflight::{CallEvent, CallOutcome, CallResult, InFlightTable, ProgressSink, Role};
pub use ledger::{ConcurrencyPool, Ledger, LedgerConfig, LedgerSnapshot, Lease, PoolKind, PoolStats};
pub use shutdown::{CleanupReport, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use supervisor::{run_with_deadline, DeadlineLayer, DeadlineLayers, Supervisor};
