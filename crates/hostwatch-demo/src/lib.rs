//! Demo server host plugin
//!
//! Build it and point hostwatch at the output directory:
//!
//! ```text
//! cargo build -p hostwatch-demo
//! hostwatch hostwatch_demo --bin target/debug --port 8080
//! ```
//!
//! Every rebuild gets a fresh `runtime_id` in the JSON answer.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use hostwatch_kernel::{HostDescriptor, HostResult, LifecycleCapability, ServerHost};
use uuid::Uuid;

hostwatch_kernel::declare_hosts!(
    HostDescriptor::of::<DemoHost>("hostwatch_demo::DemoHost", LifecycleCapability::full_with_uri())
        .self_hosted(),
    HostDescriptor::of::<QuietHost>("hostwatch_demo::QuietHost", LifecycleCapability::start_only()),
);

/// Turn a listener URI such as `http://*:2020/` into a bindable address.
/// `*` and `+` mean every interface.
pub fn bind_address(listener_uri: &str) -> HostResult<String> {
    let authority = listener_uri
        .split_once("://")
        .map_or(listener_uri, |(_, rest)| rest)
        .trim_end_matches('/');
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| format!("listener URI without port: {listener_uri}"))?;
    let host = match host {
        "*" | "+" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        other => other,
    };
    Ok(format!("{host}:{port}"))
}

struct Server {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Answers every HTTP request with a small JSON document.
#[derive(Default)]
pub struct DemoHost {
    runtime_id: Option<Uuid>,
    server: Option<Server>,
}

impl DemoHost {
    pub fn runtime_id(&self) -> Option<Uuid> {
        self.runtime_id
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }
}

impl ServerHost for DemoHost {
    fn init(&mut self) -> HostResult<()> {
        self.runtime_id = Some(Uuid::new_v4());
        Ok(())
    }

    fn start_at(&mut self, listener_uri: &str) -> HostResult<()> {
        if self.server.is_some() {
            return Err("demo host already started".into());
        }
        let runtime_id = self.runtime_id.get_or_insert_with(Uuid::new_v4).to_string();

        let listener = TcpListener::bind(bind_address(listener_uri)?)?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("hostwatch-demo".to_string())
            .spawn(move || serve(listener, flag, runtime_id))?;

        println!("Demo host serving on {addr}");
        self.server = Some(Server {
            addr,
            shutdown,
            thread,
        });
        Ok(())
    }

    fn stop(&mut self) -> HostResult<()> {
        let Some(server) = self.server.take() else {
            return Ok(());
        };
        server.shutdown.store(true, Ordering::SeqCst);

        // Wake the blocking accept.
        let mut wake = server.addr;
        if wake.ip().is_unspecified() {
            wake.set_ip([127, 0, 0, 1].into());
        }
        let _ = TcpStream::connect(wake);

        server
            .thread
            .join()
            .map_err(|_| "demo server thread panicked".into())
    }
}

fn serve(listener: TcpListener, shutdown: Arc<AtomicBool>, runtime_id: String) {
    let served = AtomicU64::new(0);
    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let Ok(stream) = stream else { continue };
        let count = served.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = respond(stream, &runtime_id, count);
    }
}

fn respond(mut stream: TcpStream, runtime_id: &str, count: u64) -> std::io::Result<()> {
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request)?;

    let body = serde_json::json!({
        "host": "hostwatch_demo::DemoHost",
        "runtime_id": runtime_id,
        "requests": count,
    })
    .to_string();
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )?;
    stream.flush()
}

/// Plain host that only has a zero-argument start. Select it with
/// `--type hostwatch_demo::QuietHost`.
#[derive(Default)]
pub struct QuietHost;

impl ServerHost for QuietHost {
    fn start(&mut self) -> HostResult<()> {
        println!("Quiet host started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address() {
        assert_eq!(bind_address("http://*:2020/").unwrap(), "0.0.0.0:2020");
        assert_eq!(bind_address("http://+:80/").unwrap(), "0.0.0.0:80");
        assert_eq!(bind_address("http://localhost:8080").unwrap(), "127.0.0.1:8080");
        assert_eq!(bind_address("127.0.0.1:0").unwrap(), "127.0.0.1:0");
        assert!(bind_address("http://nowhere/").is_err());
    }

    #[test]
    fn test_registry_exports_both_hosts() {
        let registry = unsafe { &*_hostwatch_registry() };
        assert_eq!(registry.plugin(), "hostwatch-demo");
        assert_eq!(registry.hosts().len(), 2);

        let candidates = registry.scan_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].type_name(), "hostwatch_demo::DemoHost");
        assert!(registry.find("hostwatch_demo::QuietHost, hostwatch-demo").is_some());
        assert_eq!(_hostwatch_api_version(), hostwatch_kernel::API_VERSION);
    }

    #[test]
    fn test_serves_runtime_id_until_stopped() {
        let mut host = DemoHost::default();
        host.init().unwrap();
        let id = host.runtime_id().unwrap().to_string();

        host.start_at("http://127.0.0.1:0/").unwrap();
        let addr = host.local_addr().unwrap();
        assert!(host.start_at("http://127.0.0.1:0/").is_err());

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();
        let mut answer = String::new();
        stream.read_to_string(&mut answer).unwrap();
        assert!(answer.starts_with("HTTP/1.1 200 OK"));
        assert!(answer.contains(&id));
        assert!(answer.contains("\"requests\":1"));

        host.stop().unwrap();
        assert!(host.local_addr().is_none());
        assert!(TcpStream::connect(addr).is_err());
        host.stop().unwrap();
    }
}
