use crate::context::RoutingContext;
use crate::policy::RoutingPolicy;

/// Pattern matching sits behind this trait so the engine can swap the
/// implementation without touching evaluation logic.
pub trait PatternMatcher: Send + Sync {
    fn matches(&self, pattern: &str, value: &str) -> bool;
}

/// Glob-style matcher: `*` matches any run of characters, everything else
/// is literal. A pattern without `*` is an exact comparison.
#[derive(Debug, Default)]
pub struct WildcardMatcher;

impl PatternMatcher for WildcardMatcher {
    fn matches(&self, pattern: &str, value: &str) -> bool {
        wildcard_match(pattern, value)
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;

    // First and last segments are anchored; everything between floats.
    let first = segments[0];
    if !rest.starts_with(first) {
        return false;
    }
    rest = &rest[first.len()..];

    let last = segments[segments.len() - 1];
    if !rest.ends_with(last) {
        return false;
    }
    rest = &rest[..rest.len() - last.len()];

    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }
    true
}

#[derive(Clone, Debug)]
pub struct MatchOutcome {
    pub matched: bool,
    pub reason: String,
}

impl MatchOutcome {
    fn hit(reason: String) -> Self {
        Self {
            matched: true,
            reason,
        }
    }

    fn miss(reason: String) -> Self {
        Self {
            matched: false,
            reason,
        }
    }
}

/// Pure predicate evaluator: a policy's `match` block against one request
/// context. AND semantics across every present field; absent fields impose
/// no constraint. No side effects.
pub struct PolicyMatcher {
    pattern: Box<dyn PatternMatcher>,
}

impl Default for PolicyMatcher {
    fn default() -> Self {
        Self::new(Box::new(WildcardMatcher))
    }
}

impl PolicyMatcher {
    pub fn new(pattern: Box<dyn PatternMatcher>) -> Self {
        Self { pattern }
    }

    pub fn matches(&self, policy: &RoutingPolicy, context: &RoutingContext) -> MatchOutcome {
        let rule = &policy.matches;

        if let Some(endpoint) = &rule.endpoint {
            if !self.pattern.matches(endpoint, &context.endpoint) {
                return MatchOutcome::miss(format!(
                    "endpoint {:?} does not match pattern {:?}",
                    context.endpoint, endpoint
                ));
            }
        }

        if let Some(virtual_model) = &rule.virtual_model {
            if !self.pattern.matches(virtual_model, &context.virtual_model) {
                return MatchOutcome::miss(format!(
                    "virtual model {:?} does not match pattern {:?}",
                    context.virtual_model, virtual_model
                ));
            }
        }

        if let Some(tenant_id) = &rule.tenant_id {
            if tenant_id != &context.tenant_id {
                return MatchOutcome::miss(format!(
                    "tenant {:?} is not {:?}",
                    context.tenant_id, tenant_id
                ));
            }
        }

        if let Some(api_key_id) = &rule.api_key_id {
            if context.api_key_id.as_deref() != Some(api_key_id.as_str()) {
                return MatchOutcome::miss(format!(
                    "api key {:?} is not {:?}",
                    context.api_key_id, api_key_id
                ));
            }
        }

        if let Some(tags) = &rule.tags {
            for (key, expected) in tags {
                match context.tags.get(key) {
                    Some(value) if value == expected => {}
                    Some(value) => {
                        return MatchOutcome::miss(format!(
                            "tag {key:?} is {value:?}, expected {expected:?}"
                        ));
                    }
                    None => {
                        return MatchOutcome::miss(format!("tag {key:?} is missing"));
                    }
                }
            }
        }

        MatchOutcome::hit(format!("policy {:?} matched", policy.name))
    }
}
