//! 网关：连接、会话与调度入口
//!
//! ## 请求的一生
//!
//! ```text
//! hello ──► SessionManager::handshake ──► hello_ack
//! call_tool ──► DispatchRuntime::submit ──► call_tool_ack
//!                 │
//!                 ├─ InFlightTable::begin_or_attach   （同 call_key 至多一次执行）
//!                 ├─ ProviderRouter::select           （能力 / 熔断 / fallback）
//!                 ├─ Ledger::try_acquire              （会话 → Provider → 全局）
//!                 └─ Supervisor                       （分层期限 + 协作式取消）
//!                       │
//!                       ▼
//!            progress* / notice* ──► call_tool_res | error   （恰好一个终止事件）
//! ```
//!
//! 断开连接（任何方式）都会拆除会话，归还该会话持有的全部槽位与等待登记。

pub mod hub;
pub mod message;
pub mod runtime;
pub mod session;

pub use hub::{Hub, HubConfig, SessionDrain};
pub use message::{GatewayMessage, ToolCallRequest};
pub use runtime::{DispatchRuntime, MaintenanceReport, RuntimeConfig};
pub use session::{Authenticator, SessionId, SessionInfo, SessionManager, StaticTokenAuthenticator};
