//! Translation hot-path benchmarks
//!
//! Measures the non-I/O work done per session update:
//!
//! - Update translation: turning a burst of session updates into SSE chunks
//! - Chunk serialization: encoding chunks as the JSON carried by `data:` lines
//! - Classification: mapping upstream failure text to an error kind
//!
//! Run with: `cargo bench --bench translator`

use acp_gateway::agent::{SessionUpdate, UpstreamFailure};
use acp_gateway::classifier::classify;
use acp_gateway::translator::StreamTranslator;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn updates(count: usize, thoughts_first: usize) -> Vec<SessionUpdate> {
    (0..count)
        .map(|i| {
            if i < thoughts_first {
                SessionUpdate::agent_thought(format!("thinking step {i} "))
            } else {
                SessionUpdate::agent_text(format!("token{i} "))
            }
        })
        .collect()
}

/// Benchmark translating bursts of updates, with and without early reasoning
fn bench_translation(c: &mut Criterion) {
    let mut group = c.benchmark_group("translation");

    for (name, count, thoughts) in [
        ("content_only_100", 100, 0),
        ("reasoning_then_content_100", 100, 20),
        ("content_only_1000", 1000, 0),
    ] {
        let input = updates(count, thoughts);
        group.bench_with_input(BenchmarkId::from_parameter(name), &input, |b, input| {
            b.iter(|| {
                let mut translator = StreamTranslator::new("chatcmpl-bench", "sonnet", 0);
                let mut emitted = 0;
                for update in input.iter().cloned() {
                    emitted += translator.on_update(update).len();
                }
                emitted += translator.finish().len();
                black_box(emitted)
            });
        });
    }

    group.finish();
}

/// Benchmark chunk serialization as done for every SSE event
fn bench_chunk_serialization(c: &mut Criterion) {
    let mut translator = StreamTranslator::new("chatcmpl-bench", "sonnet", 0);
    let chunks = translator.on_update(SessionUpdate::agent_text("a typical short delta"));

    c.bench_function("chunk_serialization", |b| {
        b.iter(|| {
            for chunk in &chunks {
                black_box(serde_json::to_string(chunk).unwrap_or_default());
            }
        });
    });
}

/// Benchmark failure classification over representative messages
fn bench_classification(c: &mut Criterion) {
    let failures = vec![
        UpstreamFailure::new("This model's maximum context length is 200000 tokens"),
        UpstreamFailure::new("Too many requests").with_status(429),
        UpstreamFailure::new("session not found"),
        UpstreamFailure::new("upstream exploded").with_status(502),
        UpstreamFailure::new("something entirely unexpected happened"),
    ];

    c.bench_function("classification", |b| {
        b.iter(|| {
            for failure in &failures {
                black_box(classify(black_box(failure)));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_translation,
    bench_chunk_serialization,
    bench_classification
);
criterion_main!(benches);
