use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerConfig;

/// Prioritized match/action rule. Lower `priority` is evaluated first;
/// ties keep registration order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub id: String,
    pub name: String,
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, rename = "match")]
    pub matches: PolicyMatch,
    pub action: PolicyAction,
}

fn default_enabled() -> bool {
    true
}

/// All fields optional; an absent field imposes no constraint. Present
/// fields are AND-combined.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyAction {
    #[serde(default)]
    pub primary_upstreams: Vec<WeightedUpstream>,
    #[serde(default)]
    pub fallback_upstreams: Vec<String>,
    /// Carried to the caller/adapter; never executed inside the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_transform: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the matched upstream's breaker thresholds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeightedUpstream {
    pub upstream_id: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_retry_status_codes")]
    pub retry_status_codes: Vec<u16>,
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            retry_status_codes: default_retry_status_codes(),
            max_attempts: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_seconds: Option<u64>,
}

impl RoutingPolicy {
    /// Checked once when a snapshot is built, not during evaluation.
    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("policy id must not be empty".to_string());
        }
        if self.action.primary_upstreams.is_empty() && self.action.fallback_upstreams.is_empty() {
            return Err(format!(
                "policy {:?} names no primary or fallback upstream",
                self.id
            ));
        }
        for entry in &self.action.primary_upstreams {
            if entry.upstream_id.trim().is_empty() {
                return Err(format!("policy {:?} has an empty primary upstream id", self.id));
            }
        }
        for id in &self.action.fallback_upstreams {
            if id.trim().is_empty() {
                return Err(format!("policy {:?} has an empty fallback upstream id", self.id));
            }
        }
        Ok(())
    }
}
