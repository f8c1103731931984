//! Shared helpers for tests driving real worker processes.

#![allow(dead_code)]

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use hostwatch_runtime::{BoundaryConfig, ProcessBoundaryFactory};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub fn worker_factory() -> ProcessBoundaryFactory {
    ProcessBoundaryFactory::new(
        BoundaryConfig::new(env!("CARGO_BIN_EXE_hostwatch"))
            .with_args(["worker"])
            .with_stop_timeout(STOP_TIMEOUT),
    )
}

fn demo_file_name() -> String {
    format!("{DLL_PREFIX}hostwatch_demo{DLL_SUFFIX}")
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    let exact = dir.join(demo_file_name());
    if exact.is_file() {
        return Some(exact);
    }
    std::fs::read_dir(dir).ok()?.flatten().map(|e| e.path()).find(|p| {
        p.file_name()
            .map(|n| n.to_string_lossy())
            .is_some_and(|n| n.starts_with(&format!("{DLL_PREFIX}hostwatch_demo")) && n.ends_with(DLL_SUFFIX))
    })
}

/// The `hostwatch-demo` cdylib from the build directory, building it on
/// demand when it is not there yet.
pub fn demo_plugin() -> PathBuf {
    let profile_dir = Path::new(env!("CARGO_BIN_EXE_hostwatch"))
        .parent()
        .expect("binary directory")
        .to_path_buf();
    for dir in [profile_dir.clone(), profile_dir.join("deps")] {
        if let Some(found) = find_in(&dir) {
            return found;
        }
    }

    let target = profile_dir.join("demo-plugin");
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../Cargo.toml");
    let status = Command::new(env!("CARGO"))
        .args(["build", "-p", "hostwatch-demo", "--manifest-path"])
        .arg(&manifest)
        .env("CARGO_TARGET_DIR", &target)
        .status()
        .expect("run cargo build");
    assert!(status.success(), "building hostwatch-demo failed");
    find_in(&target.join("debug")).expect("hostwatch-demo cdylib")
}

/// Copy the demo plugin into `dir` so it can be watched in isolation.
pub fn copy_demo_plugin(dir: &Path) -> PathBuf {
    let target = dir.join(demo_file_name());
    std::fs::copy(demo_plugin(), &target).expect("copy demo plugin");
    target
}

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Body of `GET /` on the local port.
pub async fn http_get(port: u16) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;
    let mut answer = String::new();
    stream.read_to_string(&mut answer).await?;
    Ok(answer
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default())
}

pub async fn runtime_id(port: u16) -> String {
    let body = http_get(port).await.expect("demo host answers");
    let json: serde_json::Value = serde_json::from_str(&body).expect("json body");
    json["runtime_id"].as_str().expect("runtime_id").to_string()
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}
