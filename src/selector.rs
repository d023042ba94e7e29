use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use crate::breaker::CircuitBreakerRegistry;
use crate::error::{Result, RouteError};
use crate::policy::{RoutingPolicy, WeightedUpstream};
use crate::upstream::Upstream;

#[derive(Clone, Debug)]
pub struct Selection {
    pub upstream_id: String,
    pub is_fallback: bool,
    pub reason: String,
}

/// Weighted selection over a policy's primary upstreams, falling back to
/// the ordered fallback chain when no primary is admissible. Consults the
/// breaker registry for health; never mutates it.
pub struct UpstreamSelector {
    registry: Arc<CircuitBreakerRegistry>,
}

impl UpstreamSelector {
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self { registry }
    }

    pub fn select(
        &self,
        policy: &RoutingPolicy,
        upstreams: &HashMap<String, Upstream>,
    ) -> Result<Selection> {
        let admissible = |id: &str| {
            upstreams.get(id).map(|u| u.enabled).unwrap_or(false) && self.registry.is_healthy(id)
        };

        let candidates: Vec<&WeightedUpstream> = policy
            .action
            .primary_upstreams
            .iter()
            .filter(|entry| admissible(&entry.upstream_id))
            .collect();

        if !candidates.is_empty() {
            let total: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
            let chosen = pick_weighted(&candidates, total);
            return Ok(Selection {
                upstream_id: chosen.upstream_id.clone(),
                is_fallback: false,
                reason: format!(
                    "weighted primary upstream {:?} (weight {}/{})",
                    chosen.upstream_id, chosen.weight, total
                ),
            });
        }

        for id in &policy.action.fallback_upstreams {
            if admissible(id) {
                return Ok(Selection {
                    upstream_id: id.clone(),
                    is_fallback: true,
                    reason: format!("fallback upstream {id:?}: no healthy primary"),
                });
            }
        }

        Err(RouteError::NoHealthyUpstream {
            policy: policy.name.clone(),
        })
    }
}

/// Uniform draw in [0, total), walking the list accumulating weight. A
/// non-positive total degenerates to the first candidate.
fn pick_weighted<'a>(candidates: &[&'a WeightedUpstream], total: u64) -> &'a WeightedUpstream {
    if total == 0 {
        return candidates[0];
    }
    let mut draw = rand::thread_rng().gen_range(0..total);
    for candidate in candidates {
        let weight = u64::from(candidate.weight);
        if draw < weight {
            return candidate;
        }
        draw -= weight;
    }
    candidates[candidates.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::policy::PolicyAction;

    fn upstream_map(ids: &[(&str, bool)]) -> HashMap<String, Upstream> {
        ids.iter()
            .map(|(id, enabled)| {
                let mut upstream = Upstream::new(*id, "openai");
                upstream.enabled = *enabled;
                (id.to_string(), upstream)
            })
            .collect()
    }

    fn policy(primaries: &[(&str, u32)], fallbacks: &[&str]) -> RoutingPolicy {
        RoutingPolicy {
            id: "p1".to_string(),
            name: "policy".to_string(),
            priority: 0,
            enabled: true,
            matches: Default::default(),
            action: PolicyAction {
                primary_upstreams: primaries
                    .iter()
                    .map(|(id, weight)| WeightedUpstream {
                        upstream_id: id.to_string(),
                        weight: *weight,
                    })
                    .collect(),
                fallback_upstreams: fallbacks.iter().map(|id| id.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    fn selector() -> UpstreamSelector {
        UpstreamSelector::new(Arc::new(CircuitBreakerRegistry::new(Arc::new(
            ManualClock::new(1_000),
        ))))
    }

    #[test]
    fn weighted_ratio_over_many_draws() {
        let selector = selector();
        let upstreams = upstream_map(&[("a", true), ("b", true)]);
        let policy = policy(&[("a", 70), ("b", 30)], &[]);

        let mut picked_a = 0u32;
        for _ in 0..10_000 {
            let selection = selector.select(&policy, &upstreams).expect("selection");
            if selection.upstream_id == "a" {
                picked_a += 1;
            }
        }
        // a should land near 7000 of 10000
        assert!((6500..=7500).contains(&picked_a), "picked_a = {picked_a}");
    }

    #[test]
    fn disabled_upstreams_are_filtered() {
        let selector = selector();
        let upstreams = upstream_map(&[("a", false), ("b", true)]);
        let policy = policy(&[("a", 100), ("b", 1)], &[]);

        for _ in 0..50 {
            let selection = selector.select(&policy, &upstreams).expect("selection");
            assert_eq!(selection.upstream_id, "b");
            assert!(!selection.is_fallback);
        }
    }

    #[test]
    fn unhealthy_primaries_fall_back_in_order() {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = Arc::new(CircuitBreakerRegistry::new(clock));
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        registry.get_or_create("a", Some(&config)).record_failure();
        registry.get_or_create("c", Some(&config)).record_failure();

        let selector = UpstreamSelector::new(registry);
        let upstreams = upstream_map(&[("a", true), ("c", true), ("d", true)]);
        let policy = policy(&[("a", 1)], &["c", "d"]);

        let selection = selector.select(&policy, &upstreams).expect("selection");
        assert_eq!(selection.upstream_id, "d");
        assert!(selection.is_fallback);
    }

    #[test]
    fn nothing_admissible_is_a_typed_error() {
        let selector = selector();
        let upstreams = upstream_map(&[("a", false)]);
        let policy = policy(&[("a", 1)], &["a"]);

        let err = selector.select(&policy, &upstreams).unwrap_err();
        assert!(matches!(err, RouteError::NoHealthyUpstream { .. }));
    }

    #[test]
    fn zero_total_weight_degenerates_to_first_candidate() {
        let selector = selector();
        let upstreams = upstream_map(&[("a", true), ("b", true)]);
        let policy = policy(&[("a", 0), ("b", 0)], &[]);

        let selection = selector.select(&policy, &upstreams).expect("selection");
        assert_eq!(selection.upstream_id, "a");
    }
}
