use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};

use activation_orchestrator::config::PortRangeConfig;
use activation_orchestrator::worker::PortAllocator;
use activation_orchestrator::AppError;

/// Find a base with `count` consecutive ports free right now.
fn free_range(count: u16) -> u16 {
    'search: for base in (47000..60000).step_by(usize::from(count) + 7) {
        for port in base..base + count {
            if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_err() {
                continue 'search;
            }
        }
        return base;
    }
    panic!("no free port range found");
}

#[test]
fn leases_are_distinct_until_exhausted() {
    let base = free_range(3);
    let ports = PortAllocator::new(PortRangeConfig { base, count: 3 });

    let leases: Vec<_> = (0..3).map(|_| ports.reserve().expect("reserve")).collect();
    let distinct: HashSet<u16> = leases.iter().map(|l| l.port()).collect();
    assert_eq!(distinct.len(), 3);
    assert!(distinct.iter().all(|p| (base..base + 3).contains(p)));
    assert_eq!(ports.reserved_count(), 3);

    let err = ports.reserve().expect_err("range exhausted");
    assert!(matches!(err, AppError::LaunchFailed(_)));
}

#[test]
fn dropping_a_lease_returns_the_port() {
    let base = free_range(1);
    let ports = PortAllocator::new(PortRangeConfig { base, count: 1 });

    let lease = ports.reserve().expect("reserve");
    assert_eq!(lease.port(), base);
    assert!(ports.reserve().is_err());

    drop(lease);
    assert_eq!(ports.reserved_count(), 0);
    assert_eq!(ports.reserve().expect("reserve again").port(), base);
}

#[test]
fn ports_bound_elsewhere_are_skipped() {
    let base = free_range(2);
    let _occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, base)).expect("bind");
    let ports = PortAllocator::new(PortRangeConfig { base, count: 2 });

    assert_eq!(ports.reserve().expect("reserve").port(), base + 1);
}

#[test]
fn clones_share_one_pool() {
    let base = free_range(1);
    let ports = PortAllocator::new(PortRangeConfig { base, count: 1 });
    let clone = ports.clone();

    let _lease = ports.reserve().expect("reserve");
    assert!(clone.reserve().is_err());
    assert_eq!(clone.reserved_count(), 1);
}
