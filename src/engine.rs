use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::breaker::CircuitBreakerRegistry;
use crate::context::RoutingContext;
use crate::error::{Result, RouteError};
use crate::matcher::{PatternMatcher, PolicyMatcher};
use crate::policy::RoutingPolicy;
use crate::selector::UpstreamSelector;
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::upstream::{Upstream, VirtualModel};

/// Read-only configuration handed to the engine by the persistence
/// collaborator. Validated once at construction; the engine never
/// mutates it. On refresh the caller builds a new snapshot and a new
/// engine around the same breaker registry, so breaker state survives.
#[derive(Clone, Debug)]
pub struct RoutingSnapshot {
    policies: Vec<RoutingPolicy>,
    upstreams: HashMap<String, Upstream>,
    virtual_models: HashMap<String, VirtualModel>,
}

impl RoutingSnapshot {
    pub fn new(
        policies: Vec<RoutingPolicy>,
        upstreams: Vec<Upstream>,
        virtual_models: Vec<VirtualModel>,
    ) -> Result<Self> {
        let mut upstream_map = HashMap::with_capacity(upstreams.len());
        for upstream in upstreams {
            if upstream.id.trim().is_empty() {
                return Err(RouteError::InvalidSnapshot {
                    reason: "upstream id must not be empty".to_string(),
                });
            }
            if upstream_map.insert(upstream.id.clone(), upstream).is_some() {
                return Err(RouteError::InvalidSnapshot {
                    reason: "duplicate upstream id".to_string(),
                });
            }
        }

        let mut seen_policy_ids = HashSet::with_capacity(policies.len());
        for policy in &policies {
            policy
                .validate()
                .map_err(|reason| RouteError::InvalidSnapshot { reason })?;
            if !seen_policy_ids.insert(policy.id.clone()) {
                return Err(RouteError::InvalidSnapshot {
                    reason: format!("duplicate policy id {:?}", policy.id),
                });
            }
            for entry in &policy.action.primary_upstreams {
                if !upstream_map.contains_key(&entry.upstream_id) {
                    return Err(RouteError::InvalidSnapshot {
                        reason: format!(
                            "policy {:?} references unknown upstream {:?}",
                            policy.id, entry.upstream_id
                        ),
                    });
                }
            }
            for id in &policy.action.fallback_upstreams {
                if !upstream_map.contains_key(id) {
                    return Err(RouteError::InvalidSnapshot {
                        reason: format!(
                            "policy {:?} references unknown upstream {:?}",
                            policy.id, id
                        ),
                    });
                }
            }
        }

        // Stable sort: registration order breaks priority ties.
        let mut policies = policies;
        policies.sort_by_key(|policy| policy.priority);

        let virtual_models = virtual_models
            .into_iter()
            .map(|vm| (vm.name.clone(), vm))
            .collect();

        Ok(Self {
            policies,
            upstreams: upstream_map,
            virtual_models,
        })
    }

    pub fn policy(&self, id: &str) -> Option<&RoutingPolicy> {
        self.policies.iter().find(|policy| policy.id == id)
    }

    pub fn upstream(&self, id: &str) -> Option<&Upstream> {
        self.upstreams.get(id)
    }

    pub fn policies(&self) -> &[RoutingPolicy] {
        &self.policies
    }
}

#[derive(Clone, Debug)]
pub struct SelectedRoute {
    pub policy: RoutingPolicy,
    pub upstream: Upstream,
    /// Concrete model name to send to the upstream.
    pub upstream_model: String,
    pub is_fallback: bool,
    pub selection_reason: String,
}

#[derive(Clone, Debug)]
pub struct PolicyReport {
    pub policy_id: String,
    pub policy_name: String,
    pub priority: i32,
    pub matched: bool,
    pub reason: String,
}

/// Output of `dry_run`: every enabled policy's verdict plus the selection
/// outcome, produced without mutating breaker or counter state.
#[derive(Debug)]
pub struct DryRunReport {
    pub policies: Vec<PolicyReport>,
    pub outcome: Result<SelectedRoute>,
}

/// Orchestrates matcher and selector over an ordered policy snapshot and
/// resolves the upstream-native model name. Performs no network I/O and
/// never suspends.
pub struct RoutingEngine {
    snapshot: RoutingSnapshot,
    registry: Arc<CircuitBreakerRegistry>,
    matcher: PolicyMatcher,
    selector: UpstreamSelector,
    stats: EngineStats,
}

impl RoutingEngine {
    pub fn new(snapshot: RoutingSnapshot, registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self::with_matcher(snapshot, registry, PolicyMatcher::default())
    }

    pub fn with_pattern_matcher(
        snapshot: RoutingSnapshot,
        registry: Arc<CircuitBreakerRegistry>,
        pattern: Box<dyn PatternMatcher>,
    ) -> Self {
        Self::with_matcher(snapshot, registry, PolicyMatcher::new(pattern))
    }

    fn with_matcher(
        snapshot: RoutingSnapshot,
        registry: Arc<CircuitBreakerRegistry>,
        matcher: PolicyMatcher,
    ) -> Self {
        let selector = UpstreamSelector::new(registry.clone());
        Self {
            snapshot,
            registry,
            matcher,
            selector,
            stats: EngineStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> &RoutingSnapshot {
        &self.snapshot
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn select_route(&self, context: &RoutingContext) -> Result<SelectedRoute> {
        self.stats.record_request();
        let route = self.decide(context, true)?;
        tracing::debug!(
            policy = %route.policy.id,
            upstream = %route.upstream.id,
            upstream_model = %route.upstream_model,
            is_fallback = route.is_fallback,
            "route selected"
        );
        Ok(route)
    }

    /// Evaluates every enabled policy (not just the first match) and the
    /// same selection as `select_route`, purely observationally. Breaker
    /// and counter state are untouched and decision stats are not
    /// recorded.
    pub fn dry_run(&self, context: &RoutingContext) -> DryRunReport {
        let policies = self
            .snapshot
            .policies
            .iter()
            .filter(|policy| policy.enabled)
            .map(|policy| {
                let outcome = self.matcher.matches(policy, context);
                PolicyReport {
                    policy_id: policy.id.clone(),
                    policy_name: policy.name.clone(),
                    priority: policy.priority,
                    matched: outcome.matched,
                    reason: outcome.reason,
                }
            })
            .collect();

        DryRunReport {
            policies,
            outcome: self.decide(context, false),
        }
    }

    fn decide(&self, context: &RoutingContext, record_stats: bool) -> Result<SelectedRoute> {
        let mut matched = None;
        for policy in self.snapshot.policies.iter().filter(|p| p.enabled) {
            if self.matcher.matches(policy, context).matched {
                matched = Some(policy);
                break;
            }
        }

        let mut via_default_route = false;
        let policy = match matched {
            Some(policy) => policy,
            None => {
                let default_route = self
                    .snapshot
                    .virtual_models
                    .get(&context.virtual_model)
                    .and_then(|vm| vm.default_route_id.as_deref())
                    .and_then(|id| self.snapshot.policy(id))
                    .filter(|policy| policy.enabled);
                match default_route {
                    Some(policy) => {
                        via_default_route = true;
                        policy
                    }
                    None => {
                        if record_stats {
                            self.stats.record_no_route();
                        }
                        return Err(RouteError::NoRouteFound {
                            virtual_model: context.virtual_model.clone(),
                        });
                    }
                }
            }
        };

        let selection = self
            .selector
            .select(policy, &self.snapshot.upstreams)
            .inspect_err(|_| {
                if record_stats {
                    self.stats.record_no_healthy_upstream();
                }
            })?;

        let upstream = self
            .snapshot
            .upstreams
            .get(&selection.upstream_id)
            .cloned()
            .ok_or_else(|| RouteError::NoHealthyUpstream {
                policy: policy.name.clone(),
            })?;

        if record_stats {
            self.stats.record_matched();
            if via_default_route {
                self.stats.record_default_route_used();
            }
            if selection.is_fallback {
                self.stats.record_fallback_used();
            }
        }

        let upstream_model = resolve_upstream_model(&context.virtual_model, &upstream.model_mapping);
        Ok(SelectedRoute {
            policy: policy.clone(),
            upstream,
            upstream_model,
            is_fallback: selection.is_fallback,
            selection_reason: selection.reason,
        })
    }
}

/// Exact mapping first; then the suffix after the first "/" separator;
/// otherwise the virtual name passes through unchanged.
fn resolve_upstream_model(virtual_model: &str, mapping: &BTreeMap<String, String>) -> String {
    if let Some(native) = mapping.get(virtual_model) {
        return native.clone();
    }
    if let Some((_, suffix)) = virtual_model.split_once('/') {
        if let Some(native) = mapping.get(suffix) {
            return native.clone();
        }
    }
    virtual_model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::{PolicyAction, PolicyMatch, WeightedUpstream};

    fn policy(id: &str, priority: i32, virtual_model: &str, upstream: &str) -> RoutingPolicy {
        RoutingPolicy {
            id: id.to_string(),
            name: id.to_string(),
            priority,
            enabled: true,
            matches: PolicyMatch {
                virtual_model: Some(virtual_model.to_string()),
                ..Default::default()
            },
            action: PolicyAction {
                primary_upstreams: vec![WeightedUpstream {
                    upstream_id: upstream.to_string(),
                    weight: 1,
                }],
                ..Default::default()
            },
        }
    }

    fn engine(
        policies: Vec<RoutingPolicy>,
        upstreams: Vec<Upstream>,
        virtual_models: Vec<VirtualModel>,
    ) -> RoutingEngine {
        let snapshot = RoutingSnapshot::new(policies, upstreams, virtual_models).expect("snapshot");
        let registry = Arc::new(CircuitBreakerRegistry::new(Arc::new(ManualClock::new(0))));
        RoutingEngine::new(snapshot, registry)
    }

    #[test]
    fn first_match_wins_by_priority() {
        let engine = engine(
            vec![
                policy("low-priority", 20, "openai/*", "b"),
                policy("high-priority", 10, "openai/*", "a"),
            ],
            vec![Upstream::new("a", "openai"), Upstream::new("b", "openai")],
            vec![],
        );

        let route = engine
            .select_route(&RoutingContext::new("/v1/chat", "openai/gpt-4o", "t1"))
            .expect("route");
        assert_eq!(route.policy.id, "high-priority");
        assert_eq!(route.upstream.id, "a");
    }

    #[test]
    fn priority_ties_keep_registration_order() {
        let engine = engine(
            vec![
                policy("registered-first", 10, "openai/*", "a"),
                policy("registered-second", 10, "openai/*", "b"),
            ],
            vec![Upstream::new("a", "openai"), Upstream::new("b", "openai")],
            vec![],
        );

        let route = engine
            .select_route(&RoutingContext::new("/v1/chat", "openai/gpt-4o", "t1"))
            .expect("route");
        assert_eq!(route.policy.id, "registered-first");
    }

    #[test]
    fn disabled_policies_are_skipped() {
        let mut disabled = policy("disabled", 1, "openai/*", "a");
        disabled.enabled = false;
        let engine = engine(
            vec![disabled, policy("enabled", 2, "openai/*", "b")],
            vec![Upstream::new("a", "openai"), Upstream::new("b", "openai")],
            vec![],
        );

        let route = engine
            .select_route(&RoutingContext::new("/v1/chat", "openai/gpt-4o", "t1"))
            .expect("route");
        assert_eq!(route.policy.id, "enabled");
    }

    #[test]
    fn virtual_model_default_route_when_nothing_matches() {
        let engine = engine(
            vec![policy("mistral-only", 10, "mistral/*", "a")],
            vec![Upstream::new("a", "openai")],
            vec![VirtualModel {
                name: "openai/gpt-4o".to_string(),
                default_route_id: Some("mistral-only".to_string()),
            }],
        );

        let route = engine
            .select_route(&RoutingContext::new("/v1/chat", "openai/gpt-4o", "t1"))
            .expect("route");
        assert_eq!(route.policy.id, "mistral-only");
        assert_eq!(engine.stats().default_route_used, 1);
    }

    #[test]
    fn no_route_is_a_typed_error() {
        let engine = engine(
            vec![policy("mistral-only", 10, "mistral/*", "a")],
            vec![Upstream::new("a", "openai")],
            vec![],
        );

        let err = engine
            .select_route(&RoutingContext::new("/v1/chat", "openai/gpt-4o", "t1"))
            .unwrap_err();
        assert!(matches!(err, RouteError::NoRouteFound { .. }));
        assert_eq!(engine.stats().no_route, 1);
    }

    #[test]
    fn model_mapping_resolution() {
        let mapping: BTreeMap<String, String> =
            [("gpt-4o".to_string(), "gpt-4o-2024-08-06".to_string())].into();
        assert_eq!(
            resolve_upstream_model("openai/gpt-4o", &mapping),
            "gpt-4o-2024-08-06"
        );
        assert_eq!(
            resolve_upstream_model("openai/gpt-4o", &BTreeMap::new()),
            "openai/gpt-4o"
        );

        let exact: BTreeMap<String, String> =
            [("openai/gpt-4o".to_string(), "direct".to_string())].into();
        assert_eq!(resolve_upstream_model("openai/gpt-4o", &exact), "direct");
        assert_eq!(resolve_upstream_model("plain-name", &BTreeMap::new()), "plain-name");
    }

    #[test]
    fn dry_run_reports_every_enabled_policy() {
        let engine = engine(
            vec![
                policy("first", 10, "openai/*", "a"),
                policy("second", 20, "openai/*", "b"),
                policy("other", 30, "mistral/*", "b"),
            ],
            vec![Upstream::new("a", "openai"), Upstream::new("b", "openai")],
            vec![],
        );

        let report = engine.dry_run(&RoutingContext::new("/v1/chat", "openai/gpt-4o", "t1"));
        assert_eq!(report.policies.len(), 3);
        assert!(report.policies[0].matched);
        assert!(report.policies[1].matched);
        assert!(!report.policies[2].matched);
        let route = report.outcome.expect("route");
        assert_eq!(route.policy.id, "first");
        // dry runs do not show up in decision stats
        assert_eq!(engine.stats().requests, 0);
    }

    #[test]
    fn snapshot_rejects_unknown_upstream_references() {
        let err = RoutingSnapshot::new(
            vec![policy("p", 1, "openai/*", "missing")],
            vec![Upstream::new("a", "openai")],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, RouteError::InvalidSnapshot { .. }));
    }

    #[test]
    fn snapshot_rejects_duplicate_ids() {
        let err = RoutingSnapshot::new(
            vec![
                policy("dup", 1, "openai/*", "a"),
                policy("dup", 2, "openai/*", "a"),
            ],
            vec![Upstream::new("a", "openai")],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, RouteError::InvalidSnapshot { .. }));
    }
}
