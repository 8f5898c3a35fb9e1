//! Provider 层：能力注册表、熔断器组、路由器

pub mod breaker;
pub mod registry;
pub mod router;

pub use breaker::{BreakerBank, BreakerConfig, BreakerPermit, BreakerSnapshot, CircuitState};
pub use registry::{CapabilityRegistry, CapabilityRequirements, ModelSpec, ProviderId, ProviderSpec};
pub use router::{ProviderRouter, RouteRequest, Selection};
