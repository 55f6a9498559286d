use std::collections::HashMap;

use llmgate_provider_core::{HealthStatus, RoutingMetrics, SchedulingStrategy, Upstream};

use crate::session::SessionBinding;

/// One ranked candidate.
#[derive(Debug, Clone)]
pub struct CandidateScore {
    pub upstream: Upstream,
    pub score: f64,
    pub latency_p99_ms: f64,
}

#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub selected: CandidateScore,
    /// Score-descending, including `selected`.
    pub scored: Vec<CandidateScore>,
}

/// Per-provider inputs the scheduler folds into the score.
#[derive(Debug, Clone, Default)]
pub struct ProviderSignals {
    pub metrics: HashMap<String, RoutingMetrics>,
    pub dynamic_weights: HashMap<String, f64>,
    /// Providers whose key pool is fully in backoff; scored zero.
    pub keys_exhausted: HashMap<String, bool>,
    /// Optional per-provider cost factor in 0..=1.
    pub cost_factors: HashMap<String, f64>,
}

/// Rank candidates and pick one, honoring a sticky binding when it is
/// still competitive.
pub fn choose(
    strategy: &SchedulingStrategy,
    upstreams: &[Upstream],
    signals: &ProviderSignals,
    binding: Option<&SessionBinding>,
) -> Option<ScheduleOutcome> {
    let scored = score_candidates(strategy, upstreams, signals);
    let viable: Vec<&CandidateScore> = scored.iter().filter(|c| c.score > 0.0).collect();
    let top = viable.first()?;

    let selected = match binding.filter(|_| strategy.enable_stickiness) {
        Some(binding) => viable
            .iter()
            .find(|candidate| {
                candidate.upstream.provider_id == binding.provider_id
                    && candidate.upstream.upstream_model_id == binding.upstream_model_id
                    && candidate.score >= top.score * (1.0 - strategy.drift_tolerance)
            })
            .copied()
            .unwrap_or(top),
        None => top,
    };

    let selected = (*selected).clone();
    let scored: Vec<CandidateScore> = scored.into_iter().filter(|c| c.score > 0.0).collect();
    Some(ScheduleOutcome { selected, scored })
}

/// Retry order: the selected upstream first, then the remaining scored
/// candidates in score-descending order with the duplicate dropped.
pub fn build_ordered_candidates(outcome: &ScheduleOutcome) -> Vec<CandidateScore> {
    let mut ordered = vec![outcome.selected.clone()];
    for candidate in &outcome.scored {
        if candidate.upstream.provider_id == outcome.selected.upstream.provider_id
            && candidate.upstream.upstream_model_id == outcome.selected.upstream.upstream_model_id
        {
            continue;
        }
        ordered.push(candidate.clone());
    }
    ordered
}

fn score_candidates(
    strategy: &SchedulingStrategy,
    upstreams: &[Upstream],
    signals: &ProviderSignals,
) -> Vec<CandidateScore> {
    // Normalization ceiling: the worst p95 among current candidates.
    let latency_ceiling = upstreams
        .iter()
        .filter_map(|upstream| signals.metrics.get(&upstream.provider_id))
        .map(|metrics| metrics.latency_p95_ms)
        .fold(1.0_f64, f64::max);

    let mut scored: Vec<CandidateScore> = upstreams
        .iter()
        .map(|upstream| {
            let metrics = signals.metrics.get(&upstream.provider_id);
            let p99 = metrics.map(|m| m.latency_p99_ms).unwrap_or(0.0);
            CandidateScore {
                score: score_one(strategy, upstream, metrics, signals, latency_ceiling),
                latency_p99_ms: p99,
                upstream: upstream.clone(),
            }
        })
        .collect();

    // Ties break by lower p99, then provider id, for a deterministic order.
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                a.latency_p99_ms
                    .partial_cmp(&b.latency_p99_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.upstream.provider_id.cmp(&b.upstream.provider_id))
    });
    scored
}

fn score_one(
    strategy: &SchedulingStrategy,
    upstream: &Upstream,
    metrics: Option<&RoutingMetrics>,
    signals: &ProviderSignals,
    latency_ceiling: f64,
) -> f64 {
    let provider_id = upstream.provider_id.as_str();

    if matches!(metrics.map(|m| m.status), Some(HealthStatus::Down)) {
        return 0.0;
    }
    if signals
        .keys_exhausted
        .get(provider_id)
        .copied()
        .unwrap_or(false)
    {
        return 0.0;
    }

    let dynamic_weight = signals
        .dynamic_weights
        .get(provider_id)
        .copied()
        .unwrap_or(1.0);
    let latency_norm = metrics
        .map(|m| (m.latency_p95_ms / latency_ceiling.max(1.0)).clamp(0.0, 1.0))
        .unwrap_or(0.0);
    let error_rate = metrics.map(|m| m.error_rate.clamp(0.0, 1.0)).unwrap_or(0.0);
    let cost_factor = signals
        .cost_factors
        .get(provider_id)
        .copied()
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let quota_penalty = quota_penalty(upstream, metrics);

    let raw = upstream.base_weight
        * dynamic_weight
        * (1.0 - strategy.alpha * latency_norm)
        * (1.0 - strategy.beta * error_rate)
        * (1.0 - strategy.gamma * cost_factor)
        * (1.0 - strategy.delta * quota_penalty);

    raw.max(strategy.min_score)
}

fn quota_penalty(upstream: &Upstream, metrics: Option<&RoutingMetrics>) -> f64 {
    let (Some(max_qps), Some(metrics)) = (upstream.max_qps, metrics) else {
        return 0.0;
    };
    if max_qps == 0 {
        return 0.0;
    }
    (metrics.success_qps_1m / f64::from(max_qps)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmgate_transform::ApiStyle;
    use time::OffsetDateTime;

    fn upstream(provider: &str, weight: f64) -> Upstream {
        Upstream {
            provider_id: provider.to_string(),
            upstream_model_id: "m".to_string(),
            endpoint: format!("https://{provider}/v1/chat/completions"),
            api_style: ApiStyle::OpenAI,
            base_weight: weight,
            region: None,
            max_qps: None,
        }
    }

    fn metrics(p95: f64, p99: f64, error_rate: f64, status: HealthStatus) -> RoutingMetrics {
        RoutingMetrics {
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            error_rate,
            success_qps_1m: 0.0,
            total_requests_1m: 0,
            status,
            last_updated: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn strategy() -> SchedulingStrategy {
        SchedulingStrategy::default()
    }

    #[test]
    fn higher_weight_wins_when_health_is_equal() {
        let ups = vec![upstream("p2", 0.5), upstream("p1", 1.0)];
        let outcome = choose(&strategy(), &ups, &ProviderSignals::default(), None).unwrap();
        assert_eq!(outcome.selected.upstream.provider_id, "p1");
        assert_eq!(outcome.scored.len(), 2);
        assert!(outcome.scored[0].score >= outcome.scored[1].score);
    }

    #[test]
    fn down_status_excludes_candidate() {
        let ups = vec![upstream("p1", 1.0), upstream("p2", 0.5)];
        let mut signals = ProviderSignals::default();
        signals
            .metrics
            .insert("p1".to_string(), metrics(100.0, 150.0, 0.0, HealthStatus::Down));
        let outcome = choose(&strategy(), &ups, &signals, None).unwrap();
        assert_eq!(outcome.selected.upstream.provider_id, "p2");
        assert_eq!(outcome.scored.len(), 1);
    }

    #[test]
    fn keys_exhausted_excludes_candidate() {
        let ups = vec![upstream("p1", 1.0)];
        let mut signals = ProviderSignals::default();
        signals.keys_exhausted.insert("p1".to_string(), true);
        assert!(choose(&strategy(), &ups, &signals, None).is_none());
    }

    #[test]
    fn error_rate_demotes_a_provider() {
        let ups = vec![upstream("p1", 1.0), upstream("p2", 1.0)];
        let mut signals = ProviderSignals::default();
        signals
            .metrics
            .insert("p1".to_string(), metrics(100.0, 120.0, 0.9, HealthStatus::Degraded));
        signals
            .metrics
            .insert("p2".to_string(), metrics(100.0, 120.0, 0.0, HealthStatus::Healthy));
        let outcome = choose(&strategy(), &ups, &signals, None).unwrap();
        assert_eq!(outcome.selected.upstream.provider_id, "p2");
    }

    #[test]
    fn sticky_binding_holds_within_drift_tolerance() {
        let ups = vec![upstream("p1", 1.0), upstream("p2", 0.95)];
        let binding = SessionBinding {
            logical_model: "gpt".to_string(),
            provider_id: "p2".to_string(),
            upstream_model_id: "m".to_string(),
            last_accessed: 0,
        };
        let outcome = choose(
            &strategy(),
            &ups,
            &ProviderSignals::default(),
            Some(&binding),
        )
        .unwrap();
        assert_eq!(outcome.selected.upstream.provider_id, "p2");
    }

    #[test]
    fn sticky_binding_dropped_outside_drift_tolerance() {
        let ups = vec![upstream("p1", 1.0), upstream("p2", 0.2)];
        let binding = SessionBinding {
            logical_model: "gpt".to_string(),
            provider_id: "p2".to_string(),
            upstream_model_id: "m".to_string(),
            last_accessed: 0,
        };
        let outcome = choose(
            &strategy(),
            &ups,
            &ProviderSignals::default(),
            Some(&binding),
        )
        .unwrap();
        assert_eq!(outcome.selected.upstream.provider_id, "p1");
    }

    #[test]
    fn ordered_candidates_put_selected_first_without_duplicate() {
        let ups = vec![upstream("p1", 1.0), upstream("p2", 0.9), upstream("p3", 0.8)];
        let binding = SessionBinding {
            logical_model: "gpt".to_string(),
            provider_id: "p2".to_string(),
            upstream_model_id: "m".to_string(),
            last_accessed: 0,
        };
        let outcome = choose(
            &strategy(),
            &ups,
            &ProviderSignals::default(),
            Some(&binding),
        )
        .unwrap();
        let ordered = build_ordered_candidates(&outcome);
        assert_eq!(ordered[0].upstream.provider_id, "p2");
        let providers: Vec<&str> = ordered
            .iter()
            .map(|c| c.upstream.provider_id.as_str())
            .collect();
        assert_eq!(providers, vec!["p2", "p1", "p3"]);
    }

    #[test]
    fn ties_break_by_p99_then_provider_id() {
        let ups = vec![upstream("pb", 1.0), upstream("pa", 1.0), upstream("pc", 1.0)];
        let mut signals = ProviderSignals::default();
        signals
            .metrics
            .insert("pb".to_string(), metrics(50.0, 80.0, 0.0, HealthStatus::Healthy));
        signals
            .metrics
            .insert("pc".to_string(), metrics(50.0, 80.0, 0.0, HealthStatus::Healthy));
        signals
            .metrics
            .insert("pa".to_string(), metrics(50.0, 300.0, 0.0, HealthStatus::Healthy));
        let outcome = choose(&strategy(), &ups, &signals, None).unwrap();
        let providers: Vec<&str> = outcome
            .scored
            .iter()
            .map(|c| c.upstream.provider_id.as_str())
            .collect();
        assert_eq!(providers, vec!["pb", "pc", "pa"]);
    }
}
