//! The `worker` subcommand hosting plugins behind a process boundary.

#![cfg(test)]

mod common;

use std::time::Instant;

use common::{STOP_TIMEOUT, demo_plugin, free_port, http_get, worker_factory};
use hostwatch_runtime::{Boundary, BoundaryFactory, ProcessBoundary};
use tempfile::tempdir;

#[tokio::test]
async fn test_worker_reports_load_errors() {
    let dir = tempdir().unwrap();
    let plugin = dir
        .path()
        .join(format!("libbroken.{}", std::env::consts::DLL_EXTENSION));
    std::fs::write(&plugin, b"garbage").unwrap();

    let mut boundary = worker_factory().create(dir.path()).await.unwrap();
    let error = boundary.start(&plugin, None, 0).await;
    let error = error.expect("start should fail");
    assert!(error.starts_with("LoadError"), "unexpected error: {error}");

    boundary.teardown().await;
}

#[tokio::test]
async fn test_demo_host_serves_until_released() {
    let plugin = demo_plugin();
    let root = plugin.parent().unwrap();
    let port = free_port();
    let factory = worker_factory();

    let mut boundary = ProcessBoundary::create(factory.config(), root).await.unwrap();
    let pid = boundary.pid();
    assert_eq!(boundary.start(&plugin, None, port).await, None);

    let body = http_get(port).await.unwrap();
    assert!(body.contains("hostwatch_demo::DemoHost"), "{body}");
    assert!(body.contains("runtime_id"), "{body}");

    let started = Instant::now();
    boundary.stop().await;
    Box::new(boundary).teardown().await;
    assert!(started.elapsed() < STOP_TIMEOUT);

    #[cfg(unix)]
    assert!(!common::process_alive(pid), "worker {pid} still running");
    assert!(http_get(port).await.is_err());
}

#[tokio::test]
async fn test_explicit_type_selection() {
    let plugin = demo_plugin();
    let root = plugin.parent().unwrap();
    let factory = worker_factory();

    let mut quiet = factory.create(root).await.unwrap();
    assert_eq!(
        quiet
            .start(&plugin, Some("hostwatch_demo::QuietHost"), 0)
            .await,
        None
    );
    quiet.teardown().await;

    let mut missing = factory.create(root).await.unwrap();
    let error = missing
        .start(&plugin, Some("hostwatch_demo::Nope"), 0)
        .await
        .expect("unknown type should fail");
    assert_eq!(
        error,
        "TypeNotFound: Unable to locate type hostwatch_demo::Nope in plugin hostwatch-demo"
    );
    missing.teardown().await;
}

#[tokio::test]
async fn test_workers_are_independent() {
    let dir = tempdir().unwrap();
    let factory = worker_factory();

    let first = ProcessBoundary::create(factory.config(), dir.path()).await.unwrap();
    let second = ProcessBoundary::create(factory.config(), dir.path()).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_ne!(first.pid(), second.pid());

    let pids = [first.pid(), second.pid()];
    Box::new(first).teardown().await;
    Box::new(second).teardown().await;

    #[cfg(unix)]
    for pid in pids {
        assert!(!common::process_alive(pid), "worker {pid} still running");
    }
    #[cfg(not(unix))]
    let _ = pids;
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_runs_in_its_own_process_group() {
    use nix::unistd::{Pid, getpgid};

    let dir = tempdir().unwrap();
    let boundary = ProcessBoundary::create(worker_factory().config(), dir.path())
        .await
        .unwrap();

    let worker_group = getpgid(Some(Pid::from_raw(boundary.pid() as i32))).unwrap();
    assert_eq!(worker_group, Pid::from_raw(boundary.pid() as i32));
    assert_ne!(worker_group, getpgid(None).unwrap());

    Box::new(boundary).teardown().await;
}
