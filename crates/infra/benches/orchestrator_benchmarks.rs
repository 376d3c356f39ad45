use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::time::Duration;

use clinflow_core::{CaseId, ErrorKind, Stage};
use clinflow_infra::jobs::{FixedJitter, InMemoryJobStore, RetryController, RetryPolicy, StagePolicies};
use clinflow_infra::stages::StageSet;
use clinflow_infra::workflow::{StateMachine, SubmitRequest, WorkflowService};
use clinflow_observability::NoopRecorder;
use clinflow_providers::{
    InMemoryKnowledgeBase, InferenceProvider, InferenceRequest, MockProvider, QcContext, QcEngine,
    RuleQcEngine,
};

const NOTES: &str = "Follow-up CT: 8mm nodule in right upper lobe, stable since prior.";

fn knowledge_base() -> Arc<InMemoryKnowledgeBase> {
    let kb = InMemoryKnowledgeBase::new();
    for n in 0..50 {
        kb.ingest(
            "guidelines",
            "2024",
            format!("Guideline {n}"),
            Some(format!("sec-{n}")),
            format!("Nodule surveillance interval {n}: follow-up CT for solid nodules in the upper lobe."),
        )
        .unwrap();
    }
    Arc::new(kb)
}

fn harness() -> (
    WorkflowService<Arc<InMemoryJobStore>>,
    StateMachine<Arc<InMemoryJobStore>>,
) {
    let store = InMemoryJobStore::arc();
    let provider: Arc<dyn InferenceProvider> = Arc::new(MockProvider::new());
    let retry = RetryController::new(StagePolicies::with_delays(Duration::ZERO, Duration::ZERO))
        .with_jitter(Arc::new(FixedJitter(1.0)));
    let stages = StageSet::new(knowledge_base(), provider.clone(), 3, 1.0);
    let machine = StateMachine::new(store.clone(), stages, retry).with_recorder(Arc::new(NoopRecorder));
    let service = WorkflowService::new(store, provider, "medgemma-4b-it");
    (service, machine)
}

fn request(n: usize) -> SubmitRequest {
    SubmitRequest {
        patient_ref: "anon-001".into(),
        notes: NOTES.into(),
        images: vec![],
        idempotency_key: Some(format!("bench-key-{n:08}")),
    }
}

fn bench_submit_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit");
    group.throughput(Throughput::Elements(1));

    group.bench_function("new_key", |b| {
        let (service, _) = harness();
        let mut n = 0;
        b.iter(|| {
            n += 1;
            black_box(service.submit(request(n)).unwrap());
        });
    });

    group.bench_function("duplicate_key", |b| {
        let (service, _) = harness();
        service.submit(request(0)).unwrap();
        b.iter(|| black_box(service.submit(request(0)).unwrap()));
    });

    group.finish();
}

fn bench_pipeline_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_drain");

    for jobs in [1usize, 10, 50] {
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(jobs), &jobs, |b, &jobs| {
            b.iter_batched(
                || {
                    let (service, machine) = harness();
                    for n in 0..jobs {
                        service.submit(request(n)).unwrap();
                    }
                    machine
                },
                |machine| black_box(machine.drain("bench").unwrap()),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_retry_decisions(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry");
    let policy = RetryPolicy::exponential(5, Duration::from_millis(500), Duration::from_secs(30));
    let controller = RetryController::new(StagePolicies::default());

    group.bench_function("delay_for_retry", |b| {
        b.iter(|| {
            for n in 0..8 {
                black_box(policy.delay_for_retry(black_box(n), 1.0));
            }
        });
    });

    group.bench_function("decide", |b| {
        b.iter(|| {
            for kind in [ErrorKind::Transient, ErrorKind::Business, ErrorKind::Fatal] {
                black_box(controller.decide(Stage::Infer, kind, black_box(1)));
            }
        });
    });

    group.finish();
}

fn bench_qc_rules(c: &mut Criterion) {
    let engine = RuleQcEngine::default();
    let output = MockProvider::new()
        .infer(&InferenceRequest {
            case_id: CaseId::new(),
            notes: NOTES.into(),
            context: String::new(),
            tensor_ref: String::new(),
        })
        .unwrap();
    let context = QcContext::from_inference(&output, NOTES)
        .with_history(vec!["prior CT 2023: stable nodule".into()]);

    c.bench_function("qc_rule_check", |b| {
        b.iter(|| black_box(engine.check(black_box(&context)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_submit_throughput,
    bench_pipeline_drain,
    bench_retry_decisions,
    bench_qc_rules
);
criterion_main!(benches);
