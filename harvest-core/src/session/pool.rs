use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{MonitorSection, PoolSection};

use super::capability::{BrowserSession, SessionFactory};
use super::error::{SessionError, SessionResult};
use super::monitor::{HealthMonitor, HostProbe, SysinfoProbe};

/// Explicit execution-context identity used for lease affinity.
///
/// Callers that want to get "their" session back across acquire calls thread
/// one of these through the call chain instead of relying on thread identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityToken(Uuid);

impl AffinityToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AffinityToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive lease on one pooled session. Hand it back with
/// [`SessionPool::release`]; dropping it without releasing leaks the slot
/// until `close_all`.
pub struct SessionLease {
    entry_id: Uuid,
    session: Arc<dyn BrowserSession>,
}

impl SessionLease {
    pub fn session(&self) -> &dyn BrowserSession {
        self.session.as_ref()
    }

    pub fn id(&self) -> Uuid {
        self.entry_id
    }
}

pub(crate) struct PoolEntry {
    pub(crate) id: Uuid,
    pub(crate) session: Arc<dyn BrowserSession>,
    pub(crate) leased: bool,
    pub(crate) leased_since: Option<Instant>,
    pub(crate) affinity: Option<AffinityToken>,
    pub(crate) last_used: Instant,
}

impl PoolEntry {
    fn new(session: Arc<dyn BrowserSession>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            leased: false,
            leased_since: None,
            affinity: None,
            last_used: Instant::now(),
        }
    }
}

#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) entries: Vec<PoolEntry>,
    /// Creations in flight, counted against `max_size` so concurrent
    /// acquirers can create in parallel without overshooting the bound.
    pub(crate) pending: usize,
}

pub(crate) struct PoolInner {
    pub(crate) state: Mutex<PoolState>,
    pub(crate) factory: Arc<dyn SessionFactory>,
    pub(crate) config: PoolSection,
    pub(crate) closed: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub leased: usize,
}

enum AcquireStep {
    Leased(SessionLease),
    Create,
    Wait,
}

/// Bounded pool of reusable browser sessions.
///
/// Membership is guarded by a single mutex; factory calls (seconds) always
/// happen with the lock released. Capacity for an in-flight creation is
/// reserved first, so `entries + pending <= max_size` holds at every point.
pub struct SessionPool {
    inner: Arc<PoolInner>,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl SessionPool {
    /// Construct the pool and prefill `min_idle` sessions. Individual
    /// prefill failures are logged and tolerated; the monitor will keep
    /// trying to reach `min_idle`.
    pub async fn open(
        config: PoolSection,
        factory: Arc<dyn SessionFactory>,
    ) -> SessionResult<Self> {
        if config.max_size == 0 {
            return Err(SessionError::Configuration(
                "pool max_size must be >= 1".into(),
            ));
        }
        if config.min_idle > config.max_size {
            return Err(SessionError::Configuration(format!(
                "pool min_idle ({}) exceeds max_size ({})",
                config.min_idle, config.max_size
            )));
        }

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState::default()),
            factory,
            config,
            closed: AtomicBool::new(false),
        });

        for _ in 0..inner.config.min_idle {
            match inner.factory.create().await {
                Ok(session) => {
                    let mut state = inner.lock_state();
                    state.entries.push(PoolEntry::new(session));
                    info!(pool_size = state.entries.len(), "prefilled session");
                }
                Err(err) => warn!(error = %err, "session prefill failed"),
            }
        }

        Ok(Self {
            inner,
            monitor: Mutex::new(None),
        })
    }

    /// Start the background health monitor with host sampling via sysinfo.
    pub fn spawn_monitor(&self, config: MonitorSection) {
        self.spawn_monitor_with_probe(config, Arc::new(SysinfoProbe::new()));
    }

    /// Monitor entry point with an injectable host probe (used by tests).
    pub fn spawn_monitor_with_probe(&self, config: MonitorSection, probe: Arc<dyn HostProbe>) {
        let monitor = HealthMonitor::spawn(Arc::clone(&self.inner), config, probe);
        let mut slot = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(monitor) {
            // Replacing a running monitor is not part of the contract; stop
            // the old one so it does not fight the new one.
            previous.abort();
        }
    }

    /// Lease an idle session, creating one if the pool has headroom,
    /// otherwise polling until `max_wait` elapses.
    pub async fn acquire(
        &self,
        max_wait: Duration,
        affinity: Option<&AffinityToken>,
    ) -> SessionResult<SessionLease> {
        let deadline = Instant::now() + max_wait;
        let poll = self.inner.config.acquire_poll();

        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(SessionError::PoolClosed);
            }

            match self.try_acquire_step(affinity) {
                AcquireStep::Leased(lease) => return Ok(lease),
                AcquireStep::Create => {
                    match self.inner.factory.create().await {
                        Ok(session) => {
                            // The state guard must go out of scope before any
                            // await, or the future stops being Send.
                            let lease = {
                                let mut state = self.inner.lock_state();
                                state.pending -= 1;
                                if self.inner.closed.load(Ordering::SeqCst) {
                                    None
                                } else {
                                    let mut entry = PoolEntry::new(Arc::clone(&session));
                                    entry.leased = true;
                                    entry.leased_since = Some(Instant::now());
                                    entry.affinity = affinity.copied();
                                    let lease = SessionLease {
                                        entry_id: entry.id,
                                        session: Arc::clone(&entry.session),
                                    };
                                    state.entries.push(entry);
                                    info!(pool_size = state.entries.len(), "created session on demand");
                                    Some(lease)
                                }
                            };
                            match lease {
                                Some(lease) => return Ok(lease),
                                None => {
                                    let _ = session.close().await;
                                    return Err(SessionError::PoolClosed);
                                }
                            }
                        }
                        Err(err) => {
                            // Creation is retried opportunistically until the
                            // deadline; the caller only ever sees a timeout.
                            {
                                let mut state = self.inner.lock_state();
                                state.pending -= 1;
                            }
                            warn!(error = %err, "session creation failed, will retry while waiting");
                        }
                    }
                }
                AcquireStep::Wait => {}
            }

            if Instant::now() >= deadline {
                warn!(waited = ?max_wait, "acquire timed out");
                return Err(SessionError::AcquireTimeout(max_wait));
            }
            sleep(poll).await;
        }
    }

    fn try_acquire_step(&self, affinity: Option<&AffinityToken>) -> AcquireStep {
        let mut state = self.inner.lock_state();

        // Prefer the session already affined to this execution context.
        if let Some(token) = affinity {
            if let Some(pos) = state
                .entries
                .iter()
                .position(|e| !e.leased && e.affinity.as_ref() == Some(token))
            {
                return AcquireStep::Leased(lease_at(&mut state, pos, affinity));
            }
        }

        // Randomized selection spreads wear across idle sessions.
        let idle: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.leased)
            .map(|(i, _)| i)
            .collect();
        if !idle.is_empty() {
            let pos = idle[rand::thread_rng().gen_range(0..idle.len())];
            let lease = lease_at(&mut state, pos, affinity);
            debug!(
                leased = state.entries.iter().filter(|e| e.leased).count(),
                total = state.entries.len(),
                "leased existing session"
            );
            return AcquireStep::Leased(lease);
        }

        if state.entries.len() + state.pending < self.inner.config.max_size {
            state.pending += 1;
            return AcquireStep::Create;
        }

        AcquireStep::Wait
    }

    /// Return a leased session to the pool. Unknown leases (already removed
    /// by `close_all` or the monitor) are a no-op.
    pub fn release(&self, lease: SessionLease) {
        let mut state = self.inner.lock_state();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == lease.entry_id) {
            entry.leased = false;
            entry.leased_since = None;
            entry.affinity = None;
            entry.last_used = Instant::now();
            debug!(
                leased = state.entries.iter().filter(|e| e.leased).count(),
                total = state.entries.len(),
                "released session"
            );
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        let leased = state.entries.iter().filter(|e| e.leased).count();
        PoolStats {
            total: state.entries.len(),
            idle: state.entries.len() - leased,
            leased,
        }
    }

    /// Stop the monitor, destroy every session and empty the pool.
    /// Idempotent; concurrent acquirers observe the closed flag and return
    /// `PoolClosed` instead of hanging.
    pub async fn close_all(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let monitor = {
            let mut slot = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }

        let drained: Vec<PoolEntry> = {
            let mut state = self.inner.lock_state();
            std::mem::take(&mut state.entries)
        };
        for entry in drained {
            if let Err(err) = entry.session.close().await {
                warn!(error = %err, "session close failed during shutdown");
            }
        }
        info!("session pool closed");
    }
}

fn lease_at(
    state: &mut PoolState,
    pos: usize,
    affinity: Option<&AffinityToken>,
) -> SessionLease {
    let entry = &mut state.entries[pos];
    entry.leased = true;
    entry.leased_since = Some(Instant::now());
    entry.affinity = affinity.copied();
    SessionLease {
        entry_id: entry.id,
        session: Arc::clone(&entry.session),
    }
}

impl PoolInner {
    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove idle sessions above `min_idle`, least-recently-used first.
    /// Returns the removed sessions for the caller to close outside the lock.
    pub(crate) fn take_idle_over_min(&self) -> Vec<Arc<dyn BrowserSession>> {
        let mut state = self.lock_state();
        let idle_count = state.entries.iter().filter(|e| !e.leased).count();
        let releasable = idle_count.saturating_sub(self.config.min_idle);
        if releasable == 0 {
            return Vec::new();
        }

        let mut idle: Vec<(Instant, Uuid)> = state
            .entries
            .iter()
            .filter(|e| !e.leased)
            .map(|e| (e.last_used, e.id))
            .collect();
        idle.sort_by_key(|(last_used, _)| *last_used);
        let victims: Vec<Uuid> = idle.into_iter().take(releasable).map(|(_, id)| id).collect();

        let mut removed = Vec::with_capacity(victims.len());
        state.entries.retain(|e| {
            if victims.contains(&e.id) {
                removed.push(Arc::clone(&e.session));
                false
            } else {
                true
            }
        });
        removed
    }

    pub(crate) fn snapshot_idle(&self) -> Vec<(Uuid, Arc<dyn BrowserSession>)> {
        let state = self.lock_state();
        state
            .entries
            .iter()
            .filter(|e| !e.leased)
            .map(|e| (e.id, Arc::clone(&e.session)))
            .collect()
    }

    /// Remove an entry if it is still present and still idle. A session that
    /// was leased between the probe and the eviction must not be destroyed.
    pub(crate) fn remove_if_idle(&self, id: Uuid) -> bool {
        let mut state = self.lock_state();
        if let Some(pos) = state.entries.iter().position(|e| e.id == id && !e.leased) {
            state.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Reserve capacity for one replacement session if the idle count is
    /// below `min_idle` and the pool has headroom.
    pub(crate) fn reserve_replacement(&self) -> bool {
        let mut state = self.lock_state();
        let idle = state.entries.iter().filter(|e| !e.leased).count();
        if idle + state.pending < self.config.min_idle
            && state.entries.len() + state.pending < self.config.max_size
        {
            state.pending += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn commit_replacement(&self, session: Arc<dyn BrowserSession>) {
        let mut state = self.lock_state();
        state.pending -= 1;
        state.entries.push(PoolEntry::new(session));
    }

    pub(crate) fn cancel_replacement(&self) {
        let mut state = self.lock_state();
        state.pending -= 1;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
