//! # Hot Path Benchmarks
//!
//! Route matching and backend selection run once per request; these benchmarks keep an
//! eye on both.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::{HeaderMap, Method};
use std::net::SocketAddr;
use std::sync::Arc;

use gatehouse::core::config::Algorithm;
use gatehouse::load_balancing::{Backend, LoadBalancer};
use gatehouse::{Config, Router};

/// Router over `count` prefix locations plus one exact and one regex location
fn create_test_router(count: usize) -> Router {
    let mut text = String::from("[upstreams.api]\naddrs = [\"10.0.0.1:80\"]\n");
    for i in 0..count {
        text.push_str(&format!(
            "[locations.prefix{i}]\nupstream = \"api\"\npath = \"/service{i}\"\n"
        ));
    }
    text.push_str("[locations.login]\nupstream = \"api\"\npath = \"/login\"\npath_type = \"exact\"\n");
    text.push_str(
        "[locations.users]\nupstream = \"api\"\npath = \"^/v[0-9]+/users/[0-9]+$\"\npath_type = \"regex\"\n",
    );

    let config = Config::from_bytes(text.as_bytes()).expect("benchmark config is valid");
    Router::new(config.locations)
}

fn benchmark_route_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_matching");

    for count in [10, 100, 1000] {
        let router = create_test_router(count);
        let last = format!("/service{}/items", count - 1);

        group.bench_with_input(BenchmarkId::new("last_prefix", count), &last, |b, path| {
            b.iter(|| router.match_request(&Method::GET, Some("example.com"), black_box(path)))
        });
        group.bench_with_input(BenchmarkId::new("regex", count), &"/v2/users/42", |b, path| {
            b.iter(|| router.match_request(&Method::GET, None, black_box(path)))
        });
    }

    group.finish();
}

fn benchmark_backend_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("backend_selection");
    let backends: Vec<Arc<Backend>> = (0..16)
        .map(|i| Arc::new(Backend::new(format!("10.0.0.{}:80", i + 1), (i % 4) + 1)))
        .collect();
    let headers = HeaderMap::new();
    let remote: Option<SocketAddr> = "198.51.100.7:40000".parse().ok();

    for algorithm in [
        Algorithm::RoundRobin,
        Algorithm::WeightedRoundRobin,
        Algorithm::IpHash,
        Algorithm::LeastConn,
    ] {
        let balancer = LoadBalancer::new(algorithm);
        group.bench_function(algorithm.as_str(), |b| {
            b.iter(|| balancer.next(black_box(&backends), &headers, remote))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_route_matching, benchmark_backend_selection);
criterion_main!(benches);
