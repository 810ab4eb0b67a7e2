use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use application::service_registry_impl::ServiceRegistry;
use domain::service::entity::{Backend, L3n4Addr, LbSvc, SvcType};
use domain::service::options::RegistryOptions;
use ports::test_utils::{NoopLbMap, NoopMetrics, SequentialIds};

fn registry() -> ServiceRegistry {
    ServiceRegistry::new(
        RegistryOptions::default(),
        Box::new(NoopLbMap),
        Box::new(SequentialIds::default()),
        Arc::new(NoopMetrics),
    )
}

fn make_svc(svc: u32, backends: u32) -> LbSvc {
    let fe = L3n4Addr::new(IpAddr::V4(Ipv4Addr::from(0x0a60_0000 + svc)), 80);
    LbSvc::new(fe, SvcType::ClusterIp).with_backends(
        (0..backends)
            .map(|b| Backend::new(IpAddr::V4(Ipv4Addr::from(0x0a01_0000 + b)), 8080))
            .collect(),
    )
}

fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_upsert");

    for &n in &[10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                registry,
                |mut reg| {
                    let _ = reg.upsert(black_box(make_svc(1, n)));
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_backend_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_backend_churn");

    for &n in &[100, 1_000] {
        let mut reg = registry();
        let _ = reg.upsert(make_svc(1, n));
        let mut toggle = false;
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                toggle = !toggle;
                let count = if toggle { n - 1 } else { n };
                let _ = reg.upsert(black_box(make_svc(1, count)));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_upsert, bench_backend_churn);
criterion_main!(benches);
