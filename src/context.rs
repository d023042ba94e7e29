use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Immutable description of one inbound call, built by the caller and
/// discarded after the routing decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingContext {
    pub endpoint: String,
    /// Caller-facing model identifier, conventionally "namespace/name".
    pub virtual_model: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RoutingContext {
    pub fn new(
        endpoint: impl Into<String>,
        virtual_model: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            virtual_model: virtual_model.into(),
            tenant_id: tenant_id.into(),
            api_key_id: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_api_key(mut self, api_key_id: impl Into<String>) -> Self {
        self.api_key_id = Some(api_key_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}
