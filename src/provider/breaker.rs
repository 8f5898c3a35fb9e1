//! 熔断器组（每个 Provider 一个）
//!
//! CLOSED --(连续失败 >= 阈值)--> OPEN --(冷却结束)--> HALF_OPEN --(探测成功)--> CLOSED
//! HALF_OPEN --(失败)--> OPEN
//!
//! 准入通过 `admit` 拿到 `BreakerPermit`，执行结束后由 permit 上报结果；
//! HALF_OPEN 状态同一时刻只放行一个探测请求。所有读改写都在同一把锁内完成。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct ProviderBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl ProviderBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn cooldown_elapsed(&self, cooldown: Duration) -> bool {
        self.opened_at.map_or(true, |at| at.elapsed() >= cooldown)
    }

    fn trip(&mut self, provider_id: &str) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
        tracing::warn!(
            provider = %provider_id,
            consecutive_failures = self.consecutive_failures,
            "Circuit breaker opened"
        );
    }
}

/// 熔断器快照（内省 / 日志）
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// 距上次失败的毫秒数
    pub last_failure_ago_ms: Option<u64>,
}

/// 熔断器组
#[derive(Debug)]
pub struct BreakerBank {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, ProviderBreaker>>,
}

impl BreakerBank {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// 是否可能被放行（不产生副作用，路由预筛选用）
    pub fn is_available(&self, provider_id: &str) -> bool {
        let breakers = self.breakers.lock();
        match breakers.get(provider_id) {
            None => true,
            Some(b) => match b.state {
                CircuitState::Closed => true,
                CircuitState::Open => b.cooldown_elapsed(self.config.cooldown),
                CircuitState::HalfOpen => !b.probe_in_flight,
            },
        }
    }

    /// 申请一次路由许可；OPEN 且冷却结束时转为 HALF_OPEN 并放行唯一的探测请求
    pub fn admit(self: &Arc<Self>, provider_id: &str) -> Option<BreakerPermit> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(provider_id.to_string())
            .or_insert_with(ProviderBreaker::new);

        let probe = match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if !breaker.cooldown_elapsed(self.config.cooldown) {
                    return None;
                }
                breaker.state = CircuitState::HalfOpen;
                breaker.probe_in_flight = true;
                tracing::info!(provider = %provider_id, "Circuit breaker half-open; admitting probe");
                true
            }
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    return None;
                }
                breaker.probe_in_flight = true;
                true
            }
        };

        Some(BreakerPermit {
            bank: Arc::clone(self),
            provider_id: provider_id.to_string(),
            probe,
            settled: false,
        })
    }

    fn settle_success(&self, provider_id: &str, probe: bool) {
        let mut breakers = self.breakers.lock();
        let Some(breaker) = breakers.get_mut(provider_id) else {
            return;
        };
        match breaker.state {
            CircuitState::Closed => breaker.consecutive_failures = 0,
            CircuitState::HalfOpen if probe => {
                breaker.state = CircuitState::Closed;
                breaker.consecutive_failures = 0;
                breaker.opened_at = None;
                breaker.probe_in_flight = false;
                tracing::info!(provider = %provider_id, "Probe succeeded; circuit breaker closed");
            }
            // 熔断前放行的调用迟到的成功不改变状态
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn settle_failure(&self, provider_id: &str, probe: bool) -> CircuitState {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(provider_id.to_string())
            .or_insert_with(ProviderBreaker::new);
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        breaker.last_failure_at = Some(Instant::now());

        match breaker.state {
            CircuitState::Closed => {
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    breaker.trip(provider_id);
                }
            }
            CircuitState::HalfOpen => {
                if probe {
                    tracing::warn!(provider = %provider_id, "Probe failed");
                }
                breaker.trip(provider_id);
            }
            CircuitState::Open => {}
        }
        breaker.state
    }

    fn release_probe(&self, provider_id: &str) {
        if let Some(breaker) = self.breakers.lock().get_mut(provider_id) {
            if breaker.state == CircuitState::HalfOpen {
                breaker.probe_in_flight = false;
            }
        }
    }

    pub fn state(&self, provider_id: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(provider_id)
            .map_or(CircuitState::Closed, |b| b.state)
    }

    pub fn consecutive_failures(&self, provider_id: &str) -> u32 {
        self.breakers
            .lock()
            .get(provider_id)
            .map_or(0, |b| b.consecutive_failures)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshot: Vec<BreakerSnapshot> = self
            .breakers
            .lock()
            .iter()
            .map(|(id, b)| BreakerSnapshot {
                provider_id: id.clone(),
                state: b.state,
                consecutive_failures: b.consecutive_failures,
                last_failure_ago_ms: b.last_failure_at.map(|at| at.elapsed().as_millis() as u64),
            })
            .collect();
        snapshot.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshot
    }
}

impl Default for BreakerBank {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

/// 一次路由许可；结果恰好上报一次。未上报就 Drop 时归还探测名额，不计成败
pub struct BreakerPermit {
    bank: Arc<BreakerBank>,
    provider_id: String,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.bank.settle_success(&self.provider_id, self.probe);
    }

    /// 返回上报后的熔断状态
    pub fn record_failure(mut self) -> CircuitState {
        self.settled = true;
        self.bank.settle_failure(&self.provider_id, self.probe)
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            tracing::debug!(provider = %self.provider_id, "probe abandoned without outcome");
            self.bank.release_probe(&self.provider_id);
        }
    }
}

impl fmt::Debug for BreakerPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("provider_id", &self.provider_id)
            .field("probe", &self.probe)
            .finish()
    }
}
