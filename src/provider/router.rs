//! Provider 路由器
//!
//! 根据显式请求的模型、能力要求与熔断状态选择 Provider + 模型：
//! 1. 显式模型可用（熔断未打开、满足必需能力）则直接使用
//! 2. 显式模型缺少可选能力时降级继续，并附带 capability_degraded 通知
//! 3. 否则按 fallback 顺序选第一个满足必需能力且熔断允许的 Provider
//! 4. 都不满足返回 ProviderUnavailable
//!
//! 降级策略在所有路径上一致：任何被选中的模型缺少可选能力都会产生通知。

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::error::{CapabilityNotice, DispatchError};
use crate::provider::breaker::{BreakerBank, BreakerPermit};
use crate::provider::registry::{
    CapabilityRegistry, CapabilityRequirements, ModelSpec, ProviderId, ProviderSpec,
};

/// 一次路由决策
#[derive(Debug)]
pub struct Selection {
    pub provider_id: ProviderId,
    pub model: String,
    /// 被降级关闭的可选能力
    pub disabled_capabilities: Vec<String>,
    pub notices: Vec<CapabilityNotice>,
    /// 熔断许可；调用结束后上报结果
    pub permit: BreakerPermit,
}

/// 路由请求
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub requested_model: Option<&'a str>,
    pub requirements: &'a CapabilityRequirements,
    /// None 时使用注册表声明顺序
    pub fallback_order: Option<&'a [ProviderId]>,
    /// 本次调用中已失败、不再尝试的 Provider
    pub exclude: &'a HashSet<ProviderId>,
}

/// Provider 路由器
pub struct ProviderRouter {
    registry: Arc<CapabilityRegistry>,
    breakers: Arc<BreakerBank>,
    fallback_order: Vec<ProviderId>,
    /// 路由成功次数
    call_count: AtomicUsize,
}

impl ProviderRouter {
    pub fn new(registry: Arc<CapabilityRegistry>, breakers: Arc<BreakerBank>) -> Self {
        let fallback_order = registry.default_fallback_order();
        Self {
            registry,
            breakers,
            fallback_order,
            call_count: AtomicUsize::new(0),
        }
    }

    /// 覆盖默认 fallback 顺序（routing.fallback_order）
    pub fn with_fallback_order(mut self, order: Vec<ProviderId>) -> Self {
        if !order.is_empty() {
            self.fallback_order = order;
        }
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerBank> {
        &self.breakers
    }

    pub fn fallback_order(&self) -> &[ProviderId] {
        &self.fallback_order
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn select(&self, request: RouteRequest<'_>) -> Result<Selection, DispatchError> {
        let requirements = request.requirements;
        let mut notices = Vec::new();

        if let Some(requested) = request.requested_model {
            let (provider, model) = self.registry.resolve_model(requested).ok_or_else(|| {
                DispatchError::ProviderUnavailable(format!("unknown model '{}'", requested))
            })?;

            let blocked = if request.exclude.contains(&provider.id) {
                Some("failed earlier in this call")
            } else if !requirements.satisfied_by(model) {
                Some("lacks a required capability")
            } else {
                None
            };

            match blocked {
                None => match self.breakers.admit(&provider.id) {
                    Some(permit) => {
                        return Ok(self.finish(provider, model, requirements, notices, permit));
                    }
                    None => notices.push(CapabilityNotice::rerouted(requested, "has an open circuit")),
                },
                Some(reason) => notices.push(CapabilityNotice::rerouted(requested, reason)),
            }
            tracing::info!(
                model = %requested,
                provider = %provider.id,
                "Requested model unusable; falling back"
            );
        }

        let order = request.fallback_order.unwrap_or(self.fallback_order.as_slice());
        for provider_id in order {
            if request.exclude.contains(provider_id) {
                continue;
            }
            let Some(provider) = self.registry.provider(provider_id) else {
                tracing::warn!(provider = %provider_id, "Fallback entry names unknown provider");
                continue;
            };
            let Some(model) = best_model(provider, requirements) else {
                continue;
            };
            // admit 有探测副作用，先做无副作用的可用性检查
            if !self.breakers.is_available(&provider.id) {
                continue;
            }
            if let Some(permit) = self.breakers.admit(&provider.id) {
                return Ok(self.finish(provider, model, requirements, notices, permit));
            }
        }

        Err(DispatchError::ProviderUnavailable(format!(
            "no eligible provider among [{}]",
            order.join(", ")
        )))
    }

    fn finish(
        &self,
        provider: &ProviderSpec,
        model: &ModelSpec,
        requirements: &CapabilityRequirements,
        mut notices: Vec<CapabilityNotice>,
        permit: BreakerPermit,
    ) -> Selection {
        let disabled = requirements.missing_optional(model);
        for capability in &disabled {
            tracing::info!(
                provider = %provider.id,
                model = %model.name,
                capability = %capability,
                "Capability degraded"
            );
            notices.push(CapabilityNotice::degraded(&model.name, capability));
        }
        self.call_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            provider = %provider.id,
            model = %model.name,
            probe = permit.is_probe(),
            "Route selected"
        );
        Selection {
            provider_id: provider.id.clone(),
            model: model.name.clone(),
            disabled_capabilities: disabled,
            notices,
            permit,
        }
    }
}

/// 满足必需能力的模型中，缺失可选能力最少的一个（并列取声明顺序）
fn best_model<'a>(
    provider: &'a ProviderSpec,
    requirements: &CapabilityRequirements,
) -> Option<&'a ModelSpec> {
    provider
        .models
        .iter()
        .filter(|m| requirements.satisfied_by(m))
        .min_by_key(|m| requirements.missing_optional(m).len())
}
