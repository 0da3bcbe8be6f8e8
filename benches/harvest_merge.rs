//! Benchmarks folding a failed delivery's leftover payload back into the
//! next interval's harvest (§4.1 merge-back, §4.3 `Harvest::merge_failed`).

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use apm_agent_core::domain::AgentRun;
use apm_agent_core::domain::rules::RuleSet;
use apm_agent_core::domain_types::{ApdexThresholdSeconds, ReservoirCapacity, RunId};
use apm_agent_core::harvest::Harvest;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn sample_run() -> AgentRun {
    AgentRun {
        run_id: RunId::try_from("bench-run".to_string()).unwrap(),
        collector_host: "collector.example.com".to_string(),
        metric_rules: Arc::new(RuleSet::default()),
        url_rules: Arc::new(RuleSet::default()),
        txn_name_rules: Arc::new(RuleSet::default()),
        segment_terms: Arc::new(RuleSet::default()),
        harvest_caps: apm_agent_core::domain::HarvestCaps {
            analytic_event_data: ReservoirCapacity::try_new(10_000).unwrap(),
            custom_event_data: ReservoirCapacity::try_new(10_000).unwrap(),
            error_event_data: ReservoirCapacity::try_new(100).unwrap(),
            span_event_data: ReservoirCapacity::try_new(1_000).unwrap(),
        },
        collect_traces: true,
        collect_errors: true,
        collect_error_events: true,
        collect_analytics_events: true,
        collect_custom_events: true,
        apdex_threshold_seconds: ApdexThresholdSeconds::default(),
        key_transactions: std::collections::HashMap::new(),
        sampling_target: 10,
        sampling_target_period_seconds: 60,
        trusted_account_key: String::new(),
        security_policies_enabled: false,
    }
}

fn merge_failed_with_metrics(c: &mut Criterion) {
    let run = sample_run();
    let begin = SystemTime::now();

    c.bench_function("harvest_merge_failed_with_metrics", |b| {
        b.iter_batched(
            || {
                let mut leftover = Harvest::new(&run, begin);
                for i in 0..500 {
                    leftover.record_forced_metric(&format!("Custom/bench/{i}"), f64::from(i));
                }
                (Harvest::new(&run, begin), leftover)
            },
            |(mut current, leftover)| {
                current.merge_failed(leftover, Duration::from_secs(10));
                black_box(&current);
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, merge_failed_with_metrics);
criterion_main!(benches);
