use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerConfig;

/// A configured backend provider. `model_mapping` translates a virtual
/// model name into the name this provider actually accepts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Upstream {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

fn default_enabled() -> bool {
    true
}

impl Upstream {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            enabled: true,
            model_mapping: BTreeMap::new(),
            circuit_breaker: None,
        }
    }

    pub fn with_model(mut self, virtual_name: impl Into<String>, native: impl Into<String>) -> Self {
        self.model_mapping.insert(virtual_name.into(), native.into());
        self
    }
}

/// Caller-facing model identifier. `default_route_id` is consulted only
/// when no policy matched the request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VirtualModel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_route_id: Option<String>,
}
