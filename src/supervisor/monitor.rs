//! Periodic Health Monitoring
//!
//! One background task re-probes the fleet every `health_check.interval`
//! seconds. Parents are always evaluated before children, so a dead parent
//! cascades into child stops instead of triggering spurious child restarts.
//! Records left in Failed by an unsuccessful relaunch are retried on the
//! next pass until their budget runs out.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::{Supervisor, TunnelState};

impl Supervisor {
    /// Run the monitor loop until shutdown is signalled. The inter-pass
    /// sleep is cancellable, so shutdown returns control immediately.
    pub async fn run_monitor(&self) {
        info!("Starting monitoring loop");
        let mut shutdown_rx = self.subscribe_shutdown();
        let interval = Duration::from_secs(self.config.health_check.interval);

        loop {
            if self.is_shutting_down() {
                break;
            }
            self.monitor_pass().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
        info!("Monitoring loop stopped");
    }

    /// One full pass: parents, then children of running parents. Iteration
    /// works off a key snapshot so restarts during the pass cannot
    /// invalidate it.
    pub async fn monitor_pass(&self) {
        let parent_ids: Vec<u32> = {
            let st = self.state.lock();
            st.dnstt
                .iter()
                .filter(|(_, rec)| {
                    matches!(rec.state, TunnelState::Running | TunnelState::Failed)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for tunnel_id in parent_ids {
            if self.is_shutting_down() {
                return;
            }
            self.check_dnstt(tunnel_id).await;
        }

        let child_keys: Vec<(u32, u32)> = {
            let st = self.state.lock();
            st.ssh
                .iter()
                .filter(|((tid, _), rec)| {
                    matches!(rec.state, TunnelState::Running | TunnelState::Failed)
                        && st
                            .dnstt
                            .get(tid)
                            .map(|p| p.state == TunnelState::Running)
                            .unwrap_or(false)
                })
                .map(|(key, _)| *key)
                .collect()
        };
        for (tunnel_id, ssh_id) in child_keys {
            if self.is_shutting_down() {
                return;
            }
            self.check_ssh(tunnel_id, ssh_id).await;
        }
    }

    /// Probe one parent and apply the restart policy on failure. A
    /// successful parent restart brings all of its children back too.
    async fn check_dnstt(&self, tunnel_id: u32) {
        // Failed records skip the probe: the previous relaunch already lost.
        let probe_target = {
            let mut st = self.state.lock();
            let Some(rec) = st.dnstt.get_mut(&tunnel_id) else {
                return;
            };
            match rec.state {
                TunnelState::Running => Some((rec.alive(), rec.local_port)),
                TunnelState::Failed => None,
                _ => return,
            }
        };

        let verdict = match probe_target {
            Some((alive, local_port)) => {
                let port_ok = self.probe.is_port_listening("127.0.0.1", local_port).await;
                Some((alive, port_ok))
            }
            None => None,
        };

        let restart_count = {
            let mut st = self.state.lock();
            let Some(rec) = st.dnstt.get_mut(&tunnel_id) else {
                return;
            };
            match (rec.state, verdict) {
                (TunnelState::Running, Some((alive, port_ok))) => {
                    rec.last_check = Some(Instant::now());
                    if alive && port_ok {
                        return;
                    }
                    warn!(
                        "DNSTT tunnel {} failed (alive: {}, port: {})",
                        tunnel_id, alive, port_ok
                    );
                    rec.state = TunnelState::Failed;
                }
                (TunnelState::Failed, None) => {
                    rec.last_check = Some(Instant::now());
                }
                _ => return,
            }
            rec.restart_count += 1;
            rec.restart_count
        };

        if restart_count <= self.config.restart.max_retries {
            info!(
                "Restarting DNSTT tunnel {} (attempt {})",
                tunnel_id, restart_count
            );
            self.stop_dnstt(tunnel_id).await;
            self.backoff(restart_count).await;
            if self.is_shutting_down() {
                return;
            }
            match self.start_dnstt(tunnel_id).await {
                Ok(()) => {
                    // The cascade left every child stopped; bring them back
                    // under the fresh parent.
                    self.start_children(tunnel_id).await;
                    let mut st = self.state.lock();
                    if let Some(rec) = st.dnstt.get_mut(&tunnel_id) {
                        rec.restart_count = 0;
                    }
                }
                Err(e) => error!("DNSTT tunnel {} restart failed: {}", tunnel_id, e),
            }
        } else {
            error!("DNSTT tunnel {} exceeded max retries, stopping", tunnel_id);
            self.stop_dnstt(tunnel_id).await;
        }
    }

    /// Probe one child (liveness + end-to-end SOCKS5) and apply the restart
    /// policy on failure.
    async fn check_ssh(&self, tunnel_id: u32, ssh_id: u32) {
        let key = (tunnel_id, ssh_id);
        let probe_target = {
            let mut st = self.state.lock();
            let parent_running = st
                .dnstt
                .get(&tunnel_id)
                .map(|p| p.state == TunnelState::Running)
                .unwrap_or(false);
            let Some(rec) = st.ssh.get_mut(&key) else {
                return;
            };
            if !parent_running {
                return;
            }
            match rec.state {
                TunnelState::Running => Some((rec.alive(), rec.socks5_port)),
                TunnelState::Failed => None,
                _ => return,
            }
        };

        let verdict = match probe_target {
            Some((alive, socks5_port)) => {
                let healthy = self.probe.tunnel_healthy("127.0.0.1", socks5_port).await;
                Some((alive, healthy))
            }
            None => None,
        };

        let restart_count = {
            let mut st = self.state.lock();
            let Some(rec) = st.ssh.get_mut(&key) else {
                return;
            };
            match (rec.state, verdict) {
                (TunnelState::Running, Some((alive, healthy))) => {
                    rec.last_check = Some(Instant::now());
                    if alive && healthy {
                        return;
                    }
                    warn!(
                        "SSH tunnel {}:{} failed (alive: {}, healthy: {})",
                        tunnel_id, ssh_id, alive, healthy
                    );
                    rec.state = TunnelState::Failed;
                }
                (TunnelState::Failed, None) => {
                    rec.last_check = Some(Instant::now());
                }
                _ => return,
            }
            rec.restart_count += 1;
            rec.restart_count
        };

        if restart_count <= self.config.restart.max_retries {
            info!(
                "Restarting SSH tunnel {}:{} (attempt {})",
                tunnel_id, ssh_id, restart_count
            );
            self.stop_ssh(tunnel_id, ssh_id).await;
            self.backoff(restart_count).await;
            if self.is_shutting_down() {
                return;
            }
            match self.start_ssh(tunnel_id, ssh_id).await {
                Ok(()) => {
                    let mut st = self.state.lock();
                    if let Some(rec) = st.ssh.get_mut(&key) {
                        rec.restart_count = 0;
                    }
                }
                Err(e) => error!("SSH tunnel {}:{} restart failed: {}", tunnel_id, ssh_id, e),
            }
        } else {
            error!(
                "SSH tunnel {}:{} exceeded max retries, stopping",
                tunnel_id, ssh_id
            );
            self.stop_ssh(tunnel_id, ssh_id).await;
        }
    }

    /// Linear backoff: attempt N sleeps N * backoff_seconds, cancellable by
    /// shutdown.
    async fn backoff(&self, attempt: u32) {
        let delay = Duration::from_secs(self.config.restart.backoff_seconds * attempt as u64);
        if delay.is_zero() {
            return;
        }
        let mut shutdown_rx = self.subscribe_shutdown();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    fn force_running_child(sup: &Supervisor, key: (u32, u32), outbound_id: Option<&str>) {
        let mut st = sup.state.lock();
        st.dnstt.get_mut(&key.0).unwrap().state = TunnelState::Running;
        let rec = st.ssh.get_mut(&key).unwrap();
        rec.state = TunnelState::Running;
        rec.outbound_id = outbound_id.map(str::to_string);
    }

    #[tokio::test]
    async fn test_pass_ignores_stopped_records() {
        let (sup, registry) = test_supervisor(2, 2);
        // Everything is stopped; a pass must not probe, restart, or publish.
        sup.monitor_pass().await;
        assert!(registry.adds.lock().is_empty());
        assert!(registry.removes.lock().is_empty());
        assert!(sup
            .fleet_status()
            .iter()
            .all(|s| s.state == TunnelState::Stopped));
    }

    #[tokio::test]
    async fn test_child_of_stopped_parent_is_not_probed() {
        let (sup, registry) = test_supervisor(1, 1);
        {
            let mut st = sup.state.lock();
            let rec = st.ssh.get_mut(&(0, 0)).unwrap();
            rec.state = TunnelState::Running;
            rec.restart_count = 99;
        }
        sup.monitor_pass().await;
        // No restart attempt: the parent pass is responsible for this child.
        assert!(registry.removes.lock().is_empty());
        let status = sup.fleet_status();
        assert_eq!(status[1].restart_count, 99);
    }

    #[tokio::test]
    async fn test_exhausted_child_is_pinned_stopped() {
        let (sup, registry) = test_supervisor(1, 1);
        force_running_child(&sup, (0, 0), Some("ob-a"));
        {
            let mut st = sup.state.lock();
            st.ssh.get_mut(&(0, 0)).unwrap().restart_count = sup.config.restart.max_retries;
        }

        // No process and a dead port: the check fails, pushing the counter
        // past the budget, so the child must be stopped for good.
        sup.monitor_pass().await;

        let status = sup.fleet_status();
        assert_eq!(status[1].state, TunnelState::Stopped);
        assert_eq!(status[1].restart_count, sup.config.restart.max_retries + 1);
        assert_eq!(*registry.removes.lock(), vec!["ob-a"]);

        // pinned: a second pass must not touch it again
        sup.monitor_pass().await;
        assert_eq!(registry.removes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_child_within_budget_attempts_restart() {
        let (sup, registry) = test_supervisor(1, 1);
        force_running_child(&sup, (0, 0), Some("ob-a"));

        // First failure: withdrawn, then a relaunch attempt. The ssh argv
        // cannot come up in the test environment, so the record lands in
        // Failed with its counter advanced, ready for the next pass.
        sup.monitor_pass().await;

        let status = sup.fleet_status();
        assert_eq!(status[1].restart_count, 1);
        assert_eq!(status[1].state, TunnelState::Failed);
        assert_eq!(*registry.removes.lock(), vec!["ob-a"]);
    }

    #[tokio::test]
    async fn test_failed_parent_is_retried_then_pinned() {
        let (sup, _) = test_supervisor(2, 0);
        {
            let mut st = sup.state.lock();
            let rec = st.dnstt.get_mut(&0).unwrap();
            rec.state = TunnelState::Failed;
            rec.restart_count = sup.config.restart.max_retries;
        }

        sup.monitor_pass().await;

        let status = sup.fleet_status();
        assert_eq!(status[0].state, TunnelState::Stopped);
        // the sibling keeps its own lifecycle
        assert_eq!(status[1].restart_count, 0);

        sup.monitor_pass().await;
        assert_eq!(sup.fleet_status()[0].state, TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_parent_within_budget_is_relaunched() {
        let (sup, _) = test_supervisor(1, 0);
        {
            let mut st = sup.state.lock();
            st.dnstt.get_mut(&0).unwrap().state = TunnelState::Failed;
        }

        // The relaunch runs (and fails in this environment, /bin/sh exits on
        // the dnstt argv), leaving the record Failed for the next pass.
        sup.monitor_pass().await;

        let status = sup.fleet_status();
        assert_eq!(status[0].restart_count, 1);
        assert_eq!(status[0].state, TunnelState::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_monitor_loop() {
        let (sup, _) = test_supervisor(1, 1);
        let loop_sup = sup.clone();
        let monitor = tokio::spawn(async move { loop_sup.run_monitor().await });
        // give the loop a moment to park in its sleep
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), monitor)
            .await
            .expect("monitor loop must exit promptly on shutdown")
            .unwrap();
    }
}
