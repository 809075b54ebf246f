use std::sync::{Arc, Mutex};

use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MonitorSection;

use super::pool::PoolInner;

/// One host utilization reading, in percent.
#[derive(Debug, Clone, Copy)]
pub struct HostSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Seam over host resource sampling so pressure behaviour is testable.
pub trait HostProbe: Send + Sync {
    fn sample(&self) -> HostSample;
}

pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn sample(&self) -> HostSample {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();
        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f32 / total as f32) * 100.0
        };
        HostSample {
            cpu_percent: system.global_cpu_usage(),
            memory_percent,
        }
    }
}

/// Background task that keeps pool membership healthy: sheds idle sessions
/// under host pressure, evicts sessions that fail the liveness probe and
/// replenishes idle capacity up to `min_idle`.
///
/// The owner holds this handle and awaits [`HealthMonitor::shutdown`]; the
/// loop never relies on process-exit cleanup.
pub struct HealthMonitor {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl HealthMonitor {
    pub(crate) fn spawn(
        inner: Arc<PoolInner>,
        config: MonitorSection,
        probe: Arc<dyn HostProbe>,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a freshly opened
            // pool is not probed before prefill settles.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if inner.is_closed() {
                            break;
                        }
                        run_cycle(&inner, &config, probe.as_ref()).await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("health monitor stopped");
        });
        Self { handle, shutdown }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "health monitor join error");
        }
    }

    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}

/// One monitor pass. Every step is fault-isolated: a failed probe, creation
/// or destruction is logged and never stops the loop.
async fn run_cycle(inner: &Arc<PoolInner>, config: &MonitorSection, probe: &dyn HostProbe) {
    shed_under_pressure(inner, config, probe).await;
    evict_dead(inner).await;
    replenish(inner).await;
}

async fn shed_under_pressure(inner: &Arc<PoolInner>, config: &MonitorSection, probe: &dyn HostProbe) {
    let sample = probe.sample();
    if sample.cpu_percent <= config.cpu_high_water_percent
        && sample.memory_percent <= config.memory_high_water_percent
    {
        return;
    }

    let victims = inner.take_idle_over_min();
    if victims.is_empty() {
        return;
    }
    warn!(
        cpu = sample.cpu_percent,
        memory = sample.memory_percent,
        shedding = victims.len(),
        "host pressure high, destroying idle sessions"
    );
    for session in victims {
        if let Err(err) = session.close().await {
            debug!(error = %err, "close failed for shed session");
        }
    }
}

async fn evict_dead(inner: &Arc<PoolInner>) {
    // Probe without holding the membership lock; re-check idleness before
    // removal so a session leased in the meantime survives.
    let idle = inner.snapshot_idle();
    for (id, session) in idle {
        if session.probe_alive().await {
            continue;
        }
        if inner.remove_if_idle(id) {
            warn!(session = %id, "liveness probe failed, evicting session");
            if let Err(err) = session.close().await {
                debug!(session = %id, error = %err, "close failed for dead session");
            }
        }
    }
}

async fn replenish(inner: &Arc<PoolInner>) {
    while inner.reserve_replacement() {
        match inner.factory.create().await {
            Ok(session) => {
                inner.commit_replacement(session);
                info!("replenished idle session");
            }
            Err(err) => {
                inner.cancel_replacement();
                warn!(error = %err, "replacement session creation failed");
                break;
            }
        }
    }
}
