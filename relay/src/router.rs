//! Provider selection.
//!
//! Candidate filtering runs in two passes: a synchronous pass over the
//! snapshot (enablement, schedule window, group routing) and an async pass
//! consulting the budget engine and breaker registry. Selection then takes
//! the lowest effective-priority bucket and draws weighted-random within
//! it; endpoint choice follows probe state, admin order, latency, id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;

use relay_core::schedule::is_schedule_active;
use relay_middleware::{Admission, BreakerRegistry, RateLimitEngine};
use relay_types::{
    ChainReason, DecisionContext, Provider, ProviderChainItem, ProviderEndpoint, RelayError,
    Scope, SelectionMethod,
};

use crate::snapshot::ProviderSnapshot;

/// A resolved `(provider, endpoint)` pick with its chain item.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Chosen provider.
    pub provider: Arc<Provider>,
    /// Chosen endpoint.
    pub endpoint: ProviderEndpoint,
    /// Whether this attempt holds a half-open probe slot.
    pub is_probe: bool,
    /// Selection chain item (`initial_selection` / `session_reuse`).
    pub chain_item: ProviderChainItem,
}

/// Inputs for one selection round.
pub struct SelectorInputs<'a> {
    /// Current provider snapshot.
    pub snapshot: &'a ProviderSnapshot,
    /// The key's effective routing groups (comma-split); empty routes to
    /// the `default` group.
    pub key_groups: Vec<&'a str>,
    /// Provider that served this session before, for sticky reuse.
    pub session_provider: Option<i64>,
    /// `(provider, endpoint)` pairs already failed this request.
    pub excluded: &'a [(i64, i64)],
    /// Selection instant.
    pub now: DateTime<Utc>,
}

/// Matched groups between a provider and the key. Empty key groups match
/// providers carrying the `default` tag.
fn matched_groups<'p>(provider: &'p Provider, key_groups: &[&str]) -> Vec<&'p str> {
    let provider_groups = provider.groups();
    if key_groups.is_empty() {
        return if provider_groups.contains(&relay_types::DEFAULT_GROUP) {
            vec![relay_types::DEFAULT_GROUP]
        } else {
            Vec::new()
        };
    }
    provider_groups
        .into_iter()
        .filter(|g| key_groups.contains(g))
        .collect()
}

fn endpoint_allowed(endpoint: &ProviderEndpoint, excluded: &[(i64, i64)]) -> bool {
    endpoint.is_enabled
        && !excluded
            .iter()
            .any(|(p, e)| *p == endpoint.provider_id && *e == endpoint.id)
}

/// Weighted-random pick over a priority bucket. `draw` is uniform in
/// `[0, Σweight)`; the bucket is walked in id order so a boundary draw
/// resolves deterministically to the lower id.
fn pick_by_weight(bucket: &[(Arc<Provider>, u32)], draw: u64) -> Arc<Provider> {
    let mut acc = 0u64;
    for (provider, _) in bucket {
        acc += u64::from(provider.clamped_weight());
        if draw < acc {
            return Arc::clone(provider);
        }
    }
    // Σweight ≥ 1, so the loop returns for every draw in range.
    Arc::clone(&bucket[bucket.len() - 1].0)
}

struct Candidate {
    provider: Arc<Provider>,
    effective_priority: u32,
}

/// Run one selection round.
///
/// # Errors
/// Returns [`RelayError::NoCandidates`] when every provider is filtered
/// out, with a message distinguishing "none configured/matched" from
/// "all unhealthy or over budget".
pub async fn select(
    inputs: &SelectorInputs<'_>,
    limits: &RateLimitEngine,
    breakers: &BreakerRegistry,
) -> Result<Selection, RelayError> {
    // Pass 1: enablement, schedule, group routing.
    let mut enabled: Vec<Candidate> = Vec::new();
    for provider in inputs.snapshot.providers() {
        if !provider.is_enabled || provider.deleted_at.is_some() {
            continue;
        }
        if let Some(window) = &provider.schedule
            && !is_schedule_active(window, inputs.now)
        {
            continue;
        }
        let matched = matched_groups(provider, &inputs.key_groups);
        if matched.is_empty() {
            continue;
        }
        let effective_priority = provider.effective_priority(&matched);
        enabled.push(Candidate {
            provider: Arc::clone(provider),
            effective_priority,
        });
    }
    let enabled_count = enabled.len() as u32;
    if enabled.is_empty() {
        return Err(RelayError::no_candidates(
            "no enabled provider matches the key's groups",
        ));
    }

    // Pass 2: lifetime budget and endpoint health.
    let mut healthy: Vec<Candidate> = Vec::new();
    for candidate in enabled {
        let provider = &candidate.provider;
        if let Some(limit) = provider.caps.limit_total_usd {
            match limits
                .check_total_cost_limit(
                    &provider.id.to_string(),
                    Scope::Provider,
                    limit,
                    provider.reset.total_reset_at,
                    inputs.now,
                )
                .await
            {
                Ok(decision) if decision.allowed => {}
                Ok(_) => continue,
                Err(err) => {
                    // Total limits never fail open; an unverifiable budget
                    // takes the provider out of this round.
                    tracing::warn!(provider = %provider.name, %err, "budget unverifiable, skipping provider");
                    continue;
                }
            }
        }
        if has_admissible_endpoint(inputs, breakers, provider).await {
            healthy.push(candidate);
        }
    }
    let healthy_count = healthy.len() as u32;
    if healthy.is_empty() {
        return Err(RelayError::no_candidates(
            "all matching providers are unhealthy or over budget",
        ));
    }

    // Sticky session reuse when the prior provider is still a candidate.
    if let Some(prior) = inputs.session_provider
        && let Some(candidate) = healthy.iter().find(|c| c.provider.id == prior)
    {
        let provider = Arc::clone(&candidate.provider);
        let priority = candidate.effective_priority;
        if let Some((endpoint, is_probe)) =
            pick_endpoint(inputs, breakers, &provider).await
        {
            let mut item =
                ProviderChainItem::new(provider.name.clone(), ChainReason::SessionReuse);
            item.selection_method = Some(SelectionMethod::SessionReuse);
            item.decision_context = Some(DecisionContext {
                enabled_providers: enabled_count,
                after_health_check: healthy_count,
                selected_priority: priority,
            });
            item.cost_multiplier = Some(provider.cost_multiplier);
            return Ok(Selection {
                provider,
                endpoint,
                is_probe,
                chain_item: item,
            });
        }
    }

    // Lowest effective-priority bucket, in id order for deterministic
    // boundary behavior.
    let lowest = healthy
        .iter()
        .map(|c| c.effective_priority)
        .min()
        .unwrap_or(0);
    let mut bucket: Vec<(Arc<Provider>, u32)> = healthy
        .into_iter()
        .filter(|c| c.effective_priority == lowest)
        .map(|c| (c.provider, c.effective_priority))
        .collect();
    bucket.sort_by_key(|(p, _)| p.id);

    let total_weight: u64 = bucket
        .iter()
        .map(|(p, _)| u64::from(p.clamped_weight()))
        .sum();
    let draw = rand::rng().random_range(0..total_weight);
    let provider = pick_by_weight(&bucket, draw);

    let Some((endpoint, is_probe)) = pick_endpoint(inputs, breakers, &provider).await else {
        // The health pass said yes but admission said no (a half-open probe
        // slot was just taken). Treat as no candidates for this round.
        return Err(RelayError::no_candidates(
            "selected provider lost its last admissible endpoint",
        ));
    };

    let mut item = ProviderChainItem::new(provider.name.clone(), ChainReason::InitialSelection);
    item.selection_method = Some(SelectionMethod::PriorityWeighted);
    item.decision_context = Some(DecisionContext {
        enabled_providers: enabled_count,
        after_health_check: healthy_count,
        selected_priority: lowest,
    });
    item.cost_multiplier = Some(provider.cost_multiplier);
    Ok(Selection {
        provider,
        endpoint,
        is_probe,
        chain_item: item,
    })
}

/// Whether any endpoint of `provider` could serve this round: enabled, not
/// excluded, not probe-failing, breaker not open.
async fn has_admissible_endpoint(
    inputs: &SelectorInputs<'_>,
    breakers: &BreakerRegistry,
    provider: &Provider,
) -> bool {
    for endpoint in inputs.snapshot.endpoints_for(provider.id) {
        if !endpoint_allowed(endpoint, inputs.excluded) {
            continue;
        }
        if endpoint.last_probe_ok == Some(false) {
            continue;
        }
        if !breakers.is_open(endpoint.id, inputs.now).await {
            return true;
        }
    }
    false
}

/// Choose the concrete endpoint: preference order (probe state, admin
/// order, latency, id), first one the breaker admits. Probe-failing
/// endpoints are a last resort rather than hard-excluded here, so a
/// provider whose healthy endpoint just lost its probe slot can still
/// degrade gracefully.
async fn pick_endpoint(
    inputs: &SelectorInputs<'_>,
    breakers: &BreakerRegistry,
    provider: &Provider,
) -> Option<(ProviderEndpoint, bool)> {
    for endpoint in inputs.snapshot.endpoints_for(provider.id) {
        if !endpoint_allowed(endpoint, inputs.excluded) {
            continue;
        }
        match breakers.admit(endpoint.id, inputs.now).await {
            Admission::Allowed => return Some((endpoint.clone(), false)),
            Admission::Probe => return Some((endpoint.clone(), true)),
            Admission::Skip => {}
        }
    }
    None
}
