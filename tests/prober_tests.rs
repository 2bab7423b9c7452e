//! Health-probe reactivation behavior.

#[path = "common.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestBalancer, Upstream, record};
use hyper::StatusCode;
use relayd::HealthProber;
use relayd::catalog::Catalog;
use relayd::config::{BalancerMode, HealthCheck, IntervalUnit, ProbeInterval, ProbeMethod, ProbeRequest};

fn probe_config(unit: IntervalUnit, value: u64, method: ProbeMethod) -> HealthCheck {
    HealthCheck {
        interval: ProbeInterval { unit, value },
        request: ProbeRequest {
            method,
            body: serde_json::json!({}),
        },
    }
}

fn prober_for(balancer: &TestBalancer, config: &HealthCheck) -> HealthProber {
    let catalog: Arc<dyn Catalog> = balancer.catalog.clone();
    HealthProber::new(catalog, balancer.cache.clone(), config).unwrap()
}

#[tokio::test]
async fn recovered_backend_is_reactivated_in_catalog_and_cache() {
    let upstream = Upstream::start(StatusCode::OK, "recovered").await;
    let balancer = TestBalancer::start(
        BalancerMode::Proxy,
        vec![record(1, &upstream.url(), 10, 10, false)],
    )
    .await;

    // Nothing active: dispatch has nowhere to go.
    assert_eq!(balancer.get("/").await.status(), 503);

    let prober = prober_for(
        &balancer,
        &probe_config(IntervalUnit::Second, 1, ProbeMethod::Post),
    );
    prober.sweep().await;

    assert!(balancer.catalog.get(1).unwrap().is_active);
    let node = balancer.cache.find(1).expect("node not inserted into cache");
    assert!(node.is_active());

    // Traffic flows again without waiting for a reconcile.
    let resp = balancer.get("/").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("x-upstream").unwrap(), "recovered");
}

#[tokio::test]
async fn probe_sends_configured_method_and_json_body() {
    let upstream = Upstream::start(StatusCode::OK, "probed").await;
    let balancer = TestBalancer::start(
        BalancerMode::Proxy,
        vec![record(1, &upstream.url(), 10, 10, false)],
    )
    .await;

    let prober = prober_for(
        &balancer,
        &probe_config(IntervalUnit::Minute, 30, ProbeMethod::Post),
    );
    prober.sweep().await;

    let seen = upstream.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].body, b"{}");
}

#[tokio::test]
async fn non_200_probe_does_not_reactivate() {
    let upstream = Upstream::start(StatusCode::INTERNAL_SERVER_ERROR, "sick").await;
    let balancer = TestBalancer::start(
        BalancerMode::Proxy,
        vec![record(1, &upstream.url(), 10, 10, false)],
    )
    .await;

    let prober = prober_for(
        &balancer,
        &probe_config(IntervalUnit::Second, 1, ProbeMethod::Get),
    );
    prober.sweep().await;

    assert!(!balancer.catalog.get(1).unwrap().is_active);
    assert!(balancer.cache.find(1).is_none());
    assert_eq!(balancer.get("/").await.status(), 503);
}

#[tokio::test]
async fn unreachable_backend_stays_inactive() {
    let dead = Upstream::dead_origin().await;
    let balancer = TestBalancer::start(
        BalancerMode::Proxy,
        vec![record(1, &dead, 10, 10, false)],
    )
    .await;

    let prober = prober_for(
        &balancer,
        &probe_config(IntervalUnit::Second, 1, ProbeMethod::Get),
    );
    prober.sweep().await;

    assert!(!balancer.catalog.get(1).unwrap().is_active);
    assert!(balancer.cache.find(1).is_none());
}

#[tokio::test]
async fn probe_failure_does_not_abort_the_sweep() {
    let dead = Upstream::dead_origin().await;
    let healthy = Upstream::start(StatusCode::OK, "alive").await;
    let balancer = TestBalancer::start(
        BalancerMode::Proxy,
        vec![
            record(1, &dead, 10, 10, false),
            record(2, &healthy.url(), 10, 10, false),
        ],
    )
    .await;

    let prober = prober_for(
        &balancer,
        &probe_config(IntervalUnit::Second, 1, ProbeMethod::Get),
    );
    prober.sweep().await;

    // The dead backend is skipped, the healthy one still recovers.
    assert!(!balancer.catalog.get(1).unwrap().is_active);
    assert!(balancer.catalog.get(2).unwrap().is_active);
    assert!(balancer.cache.find(2).is_some());
}

#[tokio::test]
async fn run_loop_probes_on_its_interval() {
    let upstream = Upstream::start(StatusCode::OK, "looped").await;
    let balancer = TestBalancer::start(
        BalancerMode::Proxy,
        vec![record(1, &upstream.url(), 10, 10, false)],
    )
    .await;

    let prober = prober_for(
        &balancer,
        &probe_config(IntervalUnit::Second, 1, ProbeMethod::Get),
    );
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(prober.run(shutdown_rx));

    // First sweep lands after one full interval.
    for _ in 0..300 {
        if balancer.cache.find(1).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(balancer.catalog.get(1).unwrap().is_active);
}
