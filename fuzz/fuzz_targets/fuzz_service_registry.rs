#![no_main]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;

use adapters::memory::id_allocator::MemoryIdAllocator;
use adapters::memory::lb_map_store::{MemoryLbMap, PinnedMaps};
use application::service_registry_impl::ServiceRegistry;
use domain::service::entity::{Backend, L3n4Addr, LbSvc, ServiceId, SvcType, TrafficPolicy};
use domain::service::options::{InitMapsFlags, LbAlgorithm, MAGLEV_TABLE_SIZES, RegistryOptions};
use ports::test_utils::NoopMetrics;

fn boot(pinned: &PinnedMaps, opts: &RegistryOptions) -> ServiceRegistry {
    let mut reg = ServiceRegistry::new(
        opts.clone(),
        Box::new(MemoryLbMap::open(pinned, opts.maglev_table_size)),
        Box::new(MemoryIdAllocator::with_limits(16, 32)),
        Arc::new(NoopMetrics),
    );
    let _ = reg.init_maps(&InitMapsFlags::default());
    reg.restore_all();
    reg
}

fn svc_type(b: u8) -> SvcType {
    match b % 5 {
        0 => SvcType::ClusterIp,
        1 => SvcType::NodePort,
        2 => SvcType::ExternalIps,
        3 => SvcType::LoadBalancer,
        _ => SvcType::LocalRedirect,
    }
}

// Drive the registry through random upsert/delete/restart/sync sequences
// over a small address space so frontends and backends collide often.
//
// Layout:
//   [0] = algorithm (even=random, odd=maglev)
//   rest = 4-byte ops: [opcode, frontend, backend mask, flags]
fuzz_target!(|data: &[u8]| {
    let Some((&algo, ops)) = data.split_first() else {
        return;
    };
    let opts = RegistryOptions {
        algorithm: if algo % 2 == 0 { LbAlgorithm::Random } else { LbAlgorithm::Maglev },
        maglev_table_size: MAGLEV_TABLE_SIZES[0],
        node_name: "node-a".to_string(),
        ..RegistryOptions::default()
    };
    let pinned = PinnedMaps::new();
    let mut reg = boot(&pinned, &opts);

    for op in ops.chunks_exact(4).take(64) {
        let frontend = L3n4Addr::new(IpAddr::V4(Ipv4Addr::new(10, 96, 0, op[1] % 8)), 80);
        match op[0] % 6 {
            0..=2 => {
                let backends = (0..8u8)
                    .filter(|i| op[2] & (1 << i) != 0)
                    .map(|i| {
                        let b = Backend::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i + 1)), 8080);
                        let b = if op[3] & 0x10 != 0 && i % 2 == 1 { b.on_node("node-b") } else { b };
                        if op[3] & 0x20 != 0 && i == 0 { b.terminating() } else { b }
                    })
                    .collect();
                let mut svc = LbSvc::new(frontend, svc_type(op[3])).with_backends(backends);
                if op[3] & 0x40 != 0 {
                    svc.traffic_policy = TrafficPolicy::Local;
                }
                let _ = reg.upsert(svc);
            }
            3 => {
                let _ = reg.delete_by_address(&frontend);
            }
            4 => {
                let _ = reg.delete_by_id(ServiceId(u16::from(op[1] % 16)));
            }
            _ => {
                if op[3] % 2 == 0 {
                    let _ = reg.sync_finished();
                } else {
                    drop(reg);
                    reg = boot(&pinned, &opts);
                }
            }
        }
        if let Err(e) = reg.check_invariants() {
            panic!("registry invariant violated: {e}");
        }
    }
});
