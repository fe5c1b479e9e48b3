//! Tunnel Fleet Supervisor
//!
//! Owns the fleet plan and all state transitions: start-up orchestration,
//! cascading stops, the restart policy, and orderly shutdown. The periodic
//! health passes live in [`monitor`].
//!
//! Locking discipline: fleet records sit behind one mutex that is only held
//! for field mutation. Every probe, spawn, wait, registry call, and sleep
//! happens with the lock released.

mod monitor;
mod records;

pub use records::{DnsttTunnel, SshTunnel, TunnelState};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::probe::Probe;
use crate::process::{ProcessError, ProcessHandle};
use crate::registry::OutboundRegistry;

/// Settle wait after spawning a child before the first readiness probe
const SPAWN_SETTLE: Duration = Duration::from_secs(2);
/// Listen poll after the settle: interval and number of extra attempts
const LISTEN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const LISTEN_POLL_ATTEMPTS: u32 = 5;
/// Pause between a parent reaching Running and its first child spawn
const PARENT_SETTLE: Duration = Duration::from_secs(1);
/// Stride between sibling SSH spawns
const CHILD_STRIDE: Duration = Duration::from_millis(500);

/// Why a start attempt failed
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Spawn(#[from] ProcessError),

    #[error("process exited during settle: {stderr}")]
    ExitedEarly { stderr: String },

    #[error("port {port} not listening after {attempts} polls")]
    PortNotListening { port: u16, attempts: u32 },

    #[error("parent DNSTT tunnel {tunnel_id} is not running")]
    ParentNotRunning { tunnel_id: u32 },
}

/// Snapshot row for status logging
#[derive(Debug, Clone)]
pub struct TunnelStatus {
    pub tunnel_id: u32,
    /// None for a DNSTT parent
    pub ssh_id: Option<u32>,
    pub port: u16,
    pub state: TunnelState,
    pub restart_count: u32,
    pub published: bool,
}

struct FleetState {
    dnstt: BTreeMap<u32, DnsttTunnel>,
    ssh: BTreeMap<(u32, u32), SshTunnel>,
}

impl FleetState {
    /// Materialize the static plan: every record exists up front, stopped.
    fn plan(config: &Config) -> Self {
        let tunnels = &config.tunnels;
        let mut dnstt = BTreeMap::new();
        let mut ssh = BTreeMap::new();
        for tunnel_id in 0..tunnels.dnstt_count {
            dnstt.insert(
                tunnel_id,
                DnsttTunnel::new(tunnel_id, tunnels.local_port(tunnel_id)),
            );
            for ssh_id in 0..tunnels.ssh_per_dnstt {
                ssh.insert(
                    (tunnel_id, ssh_id),
                    SshTunnel::new(tunnel_id, ssh_id, tunnels.socks5_port(tunnel_id, ssh_id)),
                );
            }
        }
        Self { dnstt, ssh }
    }
}

/// Supervisor for the whole two-tier fleet
pub struct Supervisor {
    config: Arc<Config>,
    probe: Probe,
    registry: Arc<dyn OutboundRegistry>,
    state: Mutex<FleetState>,
    started: AtomicBool,
    reload_failures: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(config: Arc<Config>, registry: Arc<dyn OutboundRegistry>) -> Self {
        let probe = Probe::new(
            Duration::from_secs(config.health_check.timeout),
            config.health_check.test_url.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);
        let state = Mutex::new(FleetState::plan(&config));
        Self {
            config,
            probe,
            registry,
            state,
            started: AtomicBool::new(false),
            reload_failures: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Receiver that flips to `true` once shutdown has been requested.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// How many registry reloads failed after a successful add.
    pub fn reload_failures(&self) -> u64 {
        self.reload_failures.load(Ordering::Relaxed)
    }

    /// Bring the whole fleet up: parents in id order, each followed by its
    /// children in ssh_id order. A failed tunnel never aborts the rest of
    /// the plan.
    pub async fn start(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Supervisor is already running");
            return;
        }

        info!(
            "Initializing {} DNSTT tunnels with {} SSH sessions each",
            self.config.tunnels.dnstt_count, self.config.tunnels.ssh_per_dnstt
        );

        let tunnel_ids: Vec<u32> = self.state.lock().dnstt.keys().copied().collect();
        for tunnel_id in tunnel_ids {
            if self.is_shutting_down() {
                break;
            }
            match self.start_dnstt(tunnel_id).await {
                Ok(()) => {
                    tokio::time::sleep(PARENT_SETTLE).await;
                    self.start_children(tunnel_id).await;
                }
                Err(e) => error!("Failed to start DNSTT tunnel {}: {}", tunnel_id, e),
            }
        }

        info!("Tunnel initialization complete");
    }

    /// Start every SSH child of one parent, in ssh_id order with a fixed
    /// stride between spawns.
    pub(crate) async fn start_children(&self, tunnel_id: u32) {
        let keys: Vec<(u32, u32)> = {
            let st = self.state.lock();
            st.ssh
                .keys()
                .filter(|(tid, _)| *tid == tunnel_id)
                .copied()
                .collect()
        };
        for (tid, sid) in keys {
            if self.is_shutting_down() {
                return;
            }
            if let Err(e) = self.start_ssh(tid, sid).await {
                error!("Failed to start SSH tunnel {}:{}: {}", tid, sid, e);
            }
            tokio::time::sleep(CHILD_STRIDE).await;
        }
    }

    /// Spawn one DNSTT parent and wait for its local endpoint to listen.
    pub async fn start_dnstt(&self, tunnel_id: u32) -> Result<(), StartError> {
        let local_port = {
            let mut st = self.state.lock();
            let Some(rec) = st.dnstt.get_mut(&tunnel_id) else {
                debug!("No DNSTT record for tunnel {}", tunnel_id);
                return Ok(());
            };
            rec.state = TunnelState::Starting;
            rec.local_port
        };

        info!("Starting DNSTT tunnel {} on port {}", tunnel_id, local_port);
        let argv = self.config.dnstt_argv(local_port);
        let handle = match ProcessHandle::spawn(&argv) {
            Ok(handle) => handle,
            Err(e) => {
                self.mark_dnstt_failed(tunnel_id);
                return Err(e.into());
            }
        };

        match self.wait_for_listen(handle, local_port).await {
            Ok(handle) => {
                if self.is_shutting_down() {
                    warn!(
                        "DNSTT tunnel {} came up during shutdown, terminating",
                        tunnel_id
                    );
                    handle.terminate().await;
                    let mut st = self.state.lock();
                    if let Some(rec) = st.dnstt.get_mut(&tunnel_id) {
                        rec.state = TunnelState::Stopped;
                    }
                    return Ok(());
                }
                let pid = handle.pid();
                {
                    let mut st = self.state.lock();
                    if let Some(rec) = st.dnstt.get_mut(&tunnel_id) {
                        rec.process = Some(handle);
                        rec.state = TunnelState::Running;
                        rec.last_check = Some(Instant::now());
                    }
                }
                info!("DNSTT tunnel {} started successfully (pid {})", tunnel_id, pid);
                Ok(())
            }
            Err(e) => {
                self.mark_dnstt_failed(tunnel_id);
                Err(e)
            }
        }
    }

    /// Spawn one SSH child, wait for its SOCKS5 listener, then publish it.
    pub async fn start_ssh(&self, tunnel_id: u32, ssh_id: u32) -> Result<(), StartError> {
        let key = (tunnel_id, ssh_id);
        let (dnstt_port, socks5_port, stale_outbound) = {
            let mut st = self.state.lock();
            let dnstt_port = match st.dnstt.get(&tunnel_id) {
                Some(parent) if parent.state == TunnelState::Running => parent.local_port,
                _ => return Err(StartError::ParentNotRunning { tunnel_id }),
            };
            let Some(rec) = st.ssh.get_mut(&key) else {
                debug!("No SSH record for tunnel {}:{}", tunnel_id, ssh_id);
                return Ok(());
            };
            rec.state = TunnelState::Starting;
            (dnstt_port, rec.socks5_port, rec.outbound_id.take())
        };

        // A child that died while published must not leave a duplicate
        // outbound behind when it comes back.
        if let Some(stale) = stale_outbound {
            info!(
                "Removing stale outbound {} for SSH tunnel {}:{}",
                stale, tunnel_id, ssh_id
            );
            self.registry.remove(&stale).await;
        }

        info!(
            "Starting SSH tunnel {}:{} through DNSTT port {} (SOCKS5 {})",
            tunnel_id, ssh_id, dnstt_port, socks5_port
        );
        let argv = self.config.ssh_argv(dnstt_port, socks5_port);
        let handle = match ProcessHandle::spawn(&argv) {
            Ok(handle) => handle,
            Err(e) => {
                self.mark_ssh_failed(key);
                return Err(e.into());
            }
        };
        let handle = match self.wait_for_listen(handle, socks5_port).await {
            Ok(handle) => handle,
            Err(e) => {
                self.mark_ssh_failed(key);
                return Err(e);
            }
        };

        let remark = format!("DNSTT-{}-SSH-{}", tunnel_id, ssh_id);
        let outbound_id = self
            .registry
            .add_socks5("127.0.0.1", socks5_port, &remark)
            .await;
        match &outbound_id {
            Some(id) => {
                if !self.registry.reload().await {
                    self.reload_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Registry reload failed after adding outbound {}", id);
                }
            }
            None => warn!(
                "SSH tunnel {}:{} is up but unpublished; the next restart cycle will retry",
                tunnel_id, ssh_id
            ),
        }

        let parent_running = {
            let st = self.state.lock();
            st.dnstt
                .get(&tunnel_id)
                .map(|p| p.state == TunnelState::Running)
                .unwrap_or(false)
        };
        if self.is_shutting_down() || !parent_running {
            let reason = if parent_running {
                "shutdown"
            } else {
                "a parent outage"
            };
            warn!(
                "SSH tunnel {}:{} came up during {}, rolling back",
                tunnel_id, ssh_id, reason
            );
            if let Some(id) = &outbound_id {
                self.registry.remove(id).await;
                self.registry.reload().await;
            }
            handle.terminate().await;
            let mut st = self.state.lock();
            if let Some(rec) = st.ssh.get_mut(&key) {
                rec.state = TunnelState::Stopped;
            }
            return Ok(());
        }

        let pid = handle.pid();
        {
            let mut st = self.state.lock();
            if let Some(rec) = st.ssh.get_mut(&key) {
                rec.process = Some(handle);
                rec.state = TunnelState::Running;
                rec.last_check = Some(Instant::now());
                rec.outbound_id = outbound_id.clone();
            }
        }
        info!(
            "SSH tunnel {}:{} started successfully (pid {}, outbound {:?})",
            tunnel_id, ssh_id, pid, outbound_id
        );
        Ok(())
    }

    /// Settle, early-exit check, then a bounded listen poll. Returns the
    /// handle on success; terminates the child otherwise.
    async fn wait_for_listen(
        &self,
        mut handle: ProcessHandle,
        port: u16,
    ) -> Result<ProcessHandle, StartError> {
        tokio::time::sleep(SPAWN_SETTLE).await;

        if !handle.alive() {
            let stderr = handle.stderr_snapshot().await;
            return Err(StartError::ExitedEarly { stderr });
        }

        if self.probe.is_port_listening("127.0.0.1", port).await {
            return Ok(handle);
        }
        warn!("Port {} not listening yet, waiting", port);
        for _ in 0..LISTEN_POLL_ATTEMPTS {
            tokio::time::sleep(LISTEN_POLL_INTERVAL).await;
            if self.probe.is_port_listening("127.0.0.1", port).await {
                return Ok(handle);
            }
        }

        handle.terminate().await;
        Err(StartError::PortNotListening {
            port,
            attempts: LISTEN_POLL_ATTEMPTS,
        })
    }

    /// Stop a parent: cascade to all of its children first, then take the
    /// parent's process group down. Idempotent.
    pub async fn stop_dnstt(&self, tunnel_id: u32) {
        let (handle, child_keys) = {
            let mut st = self.state.lock();
            let Some(rec) = st.dnstt.get_mut(&tunnel_id) else {
                return;
            };
            if rec.state == TunnelState::Stopped && rec.process.is_none() {
                return;
            }
            rec.state = TunnelState::Stopping;
            let handle = rec.process.take();
            let children: Vec<(u32, u32)> = st
                .ssh
                .keys()
                .filter(|(tid, _)| *tid == tunnel_id)
                .copied()
                .collect();
            (handle, children)
        };

        info!("Stopping DNSTT tunnel {}", tunnel_id);
        for (tid, sid) in child_keys {
            self.stop_ssh(tid, sid).await;
        }

        if let Some(handle) = handle {
            handle.terminate().await;
        }

        {
            let mut st = self.state.lock();
            if let Some(rec) = st.dnstt.get_mut(&tunnel_id) {
                rec.state = TunnelState::Stopped;
            }
        }
        info!("DNSTT tunnel {} stopped", tunnel_id);
    }

    /// Stop a child: withdraw its outbound, then terminate its process
    /// group. Idempotent.
    pub async fn stop_ssh(&self, tunnel_id: u32, ssh_id: u32) {
        let key = (tunnel_id, ssh_id);
        let (handle, outbound_id) = {
            let mut st = self.state.lock();
            let Some(rec) = st.ssh.get_mut(&key) else {
                return;
            };
            if rec.state == TunnelState::Stopped
                && rec.process.is_none()
                && rec.outbound_id.is_none()
            {
                return;
            }
            rec.state = TunnelState::Stopping;
            (rec.process.take(), rec.outbound_id.take())
        };

        info!("Stopping SSH tunnel {}:{}", tunnel_id, ssh_id);
        if let Some(id) = outbound_id {
            self.registry.remove(&id).await;
            if !self.registry.reload().await {
                warn!("Registry reload failed after removing outbound {}", id);
            }
        }

        if let Some(handle) = handle {
            handle.terminate().await;
        }

        {
            let mut st = self.state.lock();
            if let Some(rec) = st.ssh.get_mut(&key) {
                rec.state = TunnelState::Stopped;
            }
        }
        info!("SSH tunnel {}:{} stopped", tunnel_id, ssh_id);
    }

    /// Drain the whole fleet: wake the monitor loop, then stop every parent
    /// in id order (each cascades to its children). Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }

        info!("Stopping tunnel fleet");
        let tunnel_ids: Vec<u32> = self.state.lock().dnstt.keys().copied().collect();
        for tunnel_id in tunnel_ids {
            self.stop_dnstt(tunnel_id).await;
        }
        info!("Tunnel fleet stopped");
    }

    /// Current state of every record, parents first.
    pub fn fleet_status(&self) -> Vec<TunnelStatus> {
        let st = self.state.lock();
        let mut status = Vec::with_capacity(st.dnstt.len() + st.ssh.len());
        for rec in st.dnstt.values() {
            status.push(TunnelStatus {
                tunnel_id: rec.tunnel_id,
                ssh_id: None,
                port: rec.local_port,
                state: rec.state,
                restart_count: rec.restart_count,
                published: false,
            });
        }
        for rec in st.ssh.values() {
            status.push(TunnelStatus {
                tunnel_id: rec.tunnel_id,
                ssh_id: Some(rec.ssh_id),
                port: rec.socks5_port,
                state: rec.state,
                restart_count: rec.restart_count,
                published: rec.outbound_id.is_some(),
            });
        }
        status
    }

    fn mark_dnstt_failed(&self, tunnel_id: u32) {
        let mut st = self.state.lock();
        if let Some(rec) = st.dnstt.get_mut(&tunnel_id) {
            rec.state = TunnelState::Failed;
        }
    }

    fn mark_ssh_failed(&self, key: (u32, u32)) {
        let mut st = self.state.lock();
        if let Some(rec) = st.ssh.get_mut(&key) {
            rec.state = TunnelState::Failed;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;

    /// In-memory registry double recording every operation.
    pub struct MockRegistry {
        pub adds: Mutex<Vec<(String, u16, String)>>,
        pub removes: Mutex<Vec<String>>,
        pub reloads: AtomicU32,
        next_id: AtomicU32,
    }

    impl MockRegistry {
        pub fn new() -> Self {
            Self {
                adds: Mutex::new(Vec::new()),
                removes: Mutex::new(Vec::new()),
                reloads: AtomicU32::new(0),
                next_id: AtomicU32::new(1),
            }
        }
    }

    #[async_trait]
    impl OutboundRegistry for MockRegistry {
        async fn add_socks5(&self, host: &str, port: u16, remark: &str) -> Option<String> {
            self.adds
                .lock()
                .push((host.to_string(), port, remark.to_string()));
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Some(format!("ob-{}", id))
        }

        async fn remove(&self, outbound_id: &str) -> bool {
            self.removes.lock().push(outbound_id.to_string());
            true
        }

        async fn reload(&self) -> bool {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn list(&self) -> Option<Vec<Value>> {
            Some(Vec::new())
        }
    }

    /// A small fleet config pointing at a binary that never listens, so
    /// start paths fail deterministically.
    pub fn test_config(dnstt_count: u32, ssh_per_dnstt: u32) -> Config {
        let mut config = Config::default();
        config.dnstt.remote_ip = "192.0.2.1".into();
        config.dnstt.domain = "t.example.com".into();
        config.dnstt.path = "/bin/sh".into();
        config.tunnels.dnstt_count = dnstt_count;
        config.tunnels.ssh_per_dnstt = ssh_per_dnstt;
        config.restart.backoff_seconds = 0;
        config.health_check.timeout = 1;
        config
    }

    pub fn test_supervisor(
        dnstt_count: u32,
        ssh_per_dnstt: u32,
    ) -> (Arc<Supervisor>, Arc<MockRegistry>) {
        let registry = Arc::new(MockRegistry::new());
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(test_config(dnstt_count, ssh_per_dnstt)),
            registry.clone(),
        ));
        (supervisor, registry)
    }
}
