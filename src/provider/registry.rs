//! 能力注册表
//!
//! 静态描述 Provider → 模型 → 能力标记（search / vision / ...）与最大上下文，
//! 并给出默认的 fallback 优先顺序（声明顺序）。

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

pub type ProviderId = String;

fn default_max_context() -> u32 {
    128_000
}

/// 单个模型的能力描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_max_context")]
    pub max_context: u32,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
            max_context: default_max_context(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_max_context(mut self, max_context: u32) -> Self {
        self.max_context = max_context;
        self
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Provider 描述（[[providers]] 配置段）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub id: ProviderId,
    /// 覆盖 pools.per_provider 默认容量
    #[serde(default)]
    pub pool_capacity: Option<usize>,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
}

impl ProviderSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pool_capacity: None,
            models: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: ModelSpec) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }
}

/// 一次调用对模型能力的要求
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityRequirements {
    /// 必需能力：不满足的模型不可选
    pub required: BTreeSet<String>,
    /// 可选能力：不满足时降级继续，并产生通知
    pub optional: BTreeSet<String>,
    pub min_context: Option<u32>,
}

impl CapabilityRequirements {
    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required.insert(capability.into());
        self
    }

    pub fn prefer(mut self, capability: impl Into<String>) -> Self {
        self.optional.insert(capability.into());
        self
    }

    pub fn with_min_context(mut self, min_context: u32) -> Self {
        self.min_context = Some(min_context);
        self
    }

    /// 合并请求级的可选能力（已声明为必需的不重复计入）
    pub fn with_requested(&self, requested: &[String]) -> Self {
        let mut merged = self.clone();
        for cap in requested {
            if !merged.required.contains(cap) {
                merged.optional.insert(cap.clone());
            }
        }
        merged
    }

    pub fn satisfied_by(&self, model: &ModelSpec) -> bool {
        self.required.iter().all(|c| model.supports(c))
            && self.min_context.map_or(true, |min| model.max_context >= min)
    }

    pub fn missing_optional(&self, model: &ModelSpec) -> Vec<String> {
        self.optional
            .iter()
            .filter(|c| !model.supports(c))
            .cloned()
            .collect()
    }
}

/// 能力注册表
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    providers: Vec<ProviderSpec>,
    /// 模型名 -> (provider 下标, model 下标)
    model_index: HashMap<String, (usize, usize)>,
}

impl CapabilityRegistry {
    pub fn new(providers: Vec<ProviderSpec>) -> Self {
        let mut model_index = HashMap::new();
        for (pi, provider) in providers.iter().enumerate() {
            for (mi, model) in provider.models.iter().enumerate() {
                if let Some((prev, _)) = model_index.get(&model.name) {
                    let prev: &ProviderSpec = &providers[*prev];
                    tracing::warn!(
                        model = %model.name,
                        kept = %prev.id,
                        ignored = %provider.id,
                        "Duplicate model name in registry; keeping first declaration"
                    );
                    continue;
                }
                model_index.insert(model.name.clone(), (pi, mi));
            }
        }
        Self {
            providers,
            model_index,
        }
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn contains_provider(&self, id: &str) -> bool {
        self.provider(id).is_some()
    }

    pub fn resolve_model(&self, name: &str) -> Option<(&ProviderSpec, &ModelSpec)> {
        self.model_index.get(name).map(|&(pi, mi)| {
            let provider = &self.providers[pi];
            (provider, &provider.models[mi])
        })
    }

    pub fn providers(&self) -> &[ProviderSpec] {
        &self.providers
    }

    /// 声明顺序即默认 fallback 顺序
    pub fn default_fallback_order(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|p| p.id.clone()).collect()
    }

    pub fn model_count(&self) -> usize {
        self.model_index.len()
    }
}
