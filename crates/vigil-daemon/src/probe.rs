//! TCP reachability probes.
//!
//! A probe's entry task resolves every configured `host:port` and returns one
//! connect task per resolved address, so the addresses are checked
//! concurrently under the scheduler's limits.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, info, warn};
use vigil_core::MonitorConfig;
use vigil_scheduler::{TaskContext, TaskFn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Up(Duration),
    Down(String),
    Cancelled,
}

#[derive(Debug)]
pub struct TcpProbe {
    name: String,
    hosts: Vec<String>,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(name: impl Into<String>, hosts: Vec<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            hosts,
            timeout,
        }
    }

    pub fn from_config(monitor: &MonitorConfig) -> Self {
        Self::new(
            monitor.name.clone(),
            monitor.hosts.clone(),
            Duration::from_millis(monitor.timeout_ms),
        )
    }

    /// Entry task for the scheduler.
    pub fn task(self: Arc<Self>) -> TaskFn {
        TaskFn::new(move |ctx| {
            let probe = Arc::clone(&self);
            async move { probe.resolve(&ctx).await }
        })
    }

    /// Resolve all hosts and build one connect task per address.
    async fn resolve(&self, ctx: &TaskContext) -> Vec<TaskFn> {
        let mut checks = Vec::new();
        for host in &self.hosts {
            if ctx.is_cancelled() {
                break;
            }
            match lookup_host(host.as_str()).await {
                Ok(addrs) => {
                    for addr in addrs {
                        checks.push(self.connect_task(host.clone(), addr));
                    }
                }
                Err(e) => {
                    warn!(monitor = %self.name, %host, error = %e, "host lookup failed");
                }
            }
        }
        debug!(monitor = %self.name, addresses = checks.len(), "resolved probe targets");
        checks
    }

    fn connect_task(&self, host: String, addr: SocketAddr) -> TaskFn {
        let monitor = self.name.clone();
        let timeout = self.timeout;
        TaskFn::new(move |ctx| {
            let monitor = monitor.clone();
            let host = host.clone();
            async move {
                match check(addr, timeout, &ctx).await {
                    Outcome::Up(rtt) => {
                        info!(%monitor, %host, %addr, rtt_ms = rtt.as_millis() as u64, "up")
                    }
                    Outcome::Down(reason) => {
                        warn!(%monitor, %host, %addr, %reason, "down")
                    }
                    Outcome::Cancelled => debug!(%monitor, %addr, "probe cancelled"),
                }
                Vec::new()
            }
        })
    }
}

/// Connect to `addr` once, giving up after `timeout` or on cancellation.
pub async fn check(addr: SocketAddr, timeout: Duration, ctx: &TaskContext) -> Outcome {
    let started = Instant::now();
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Outcome::Cancelled,
        res = tokio::time::timeout(timeout, TcpStream::connect(addr)) => match res {
            Ok(Ok(_stream)) => Outcome::Up(started.elapsed()),
            Ok(Err(e)) => Outcome::Down(e.to_string()),
            Err(_) => Outcome::Down(format!("timed out after {}ms", timeout.as_millis())),
        },
    }
}
