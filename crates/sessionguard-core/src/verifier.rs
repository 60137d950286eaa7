//! Periodic re-verification of the active session.
//!
//! A single tokio task ticks every `interval`. The first tick is scheduled so
//! that the cadence survives restarts: the last successful check is persisted
//! in the key-value store and only the remainder of the interval is waited.
//!
//! Every scheduling epoch carries a generation number. `stop()` bumps it, so a
//! verification that was already in flight when the verifier stopped finds a
//! newer generation at commit time and drops its result. A rejection claims
//! its generation inside the state machine's commit, and `stop()` bumps it
//! under the same lock, so the two are strictly ordered.
//!
//! Invalidation writes to the vault and runs on the blocking pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::IdentityService;
use crate::clock::Clock;
use crate::error::RemoteError;
use crate::session::{InvalidationReason, SessionStateMachine};
use crate::vault::KeyValueStore;

/// Store key for the epoch-millis time of the last successful verification
pub const LAST_CHECK_KEY: &str = "verifier.lastCheckTimestamp";

/// Result of a single verification tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No authenticated session; nothing was sent
    Skipped,
    Verified,
    /// Transport failure; the session is kept
    TransientFailure,
    /// The identity service refused the session
    Invalidated,
    /// The verifier was stopped while the check was in flight
    Discarded,
}

/// Delay before the first tick: what is left of `interval` since `last_check`.
///
/// With no recorded check the full interval is waited. A `last_check` in the
/// future (clock moved backwards) also waits the full interval.
pub fn initial_delay(now_millis: i64, last_check: Option<i64>, interval: Duration) -> Duration {
    let Some(last_check) = last_check else {
        return interval;
    };
    let elapsed = now_millis.saturating_sub(last_check);
    if elapsed < 0 {
        return interval;
    }
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    let remaining = interval_ms.saturating_sub(elapsed);
    if remaining <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(remaining as u64)
    }
}

struct Shared {
    machine: Arc<SessionStateMachine>,
    identity: Arc<dyn IdentityService>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    generation: AtomicU64,
}

pub struct Verifier {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Verifier {
    /// An `interval` of zero disables verification entirely.
    pub fn new(
        machine: Arc<SessionStateMachine>,
        identity: Arc<dyn IdentityService>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                machine,
                identity,
                store,
                clock,
                interval,
                generation: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Start ticking. Returns `false` when verification is disabled.
    /// Calling it while already running keeps the current schedule.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let interval = self.shared.interval;
        if interval.is_zero() {
            info!("Session verification disabled");
            return false;
        }

        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return true;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = initial_delay(
            self.shared.clock.now_millis(),
            self.shared.last_check(),
            interval,
        );
        info!(
            interval_secs = interval.as_secs(),
            first_tick_ms = delay.as_millis() as u64,
            "Starting session verification"
        );

        let shared = self.shared.clone();
        *task = Some(tokio::spawn(async move {
            shared.run(generation, delay).await;
        }));
        true
    }

    /// Cancel the schedule. Idempotent; never waits for an in-flight tick.
    pub fn stop(&self) {
        let shared = &self.shared;
        shared
            .machine
            .fenced(|| shared.generation.fetch_add(1, Ordering::SeqCst));
        if let Some(task) = self.task().take() {
            task.abort();
            debug!("Session verification stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Run one verification immediately, outside the schedule
    pub async fn verify_now(&self) -> TickOutcome {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        self.shared.tick(generation).await
    }

    fn task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Verifier {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    async fn run(self: Arc<Self>, generation: u64, delay: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + delay, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.is_current(generation) {
                break;
            }
            if self.tick(generation).await == TickOutcome::Invalidated {
                break;
            }
        }
    }

    async fn tick(self: &Arc<Self>, generation: u64) -> TickOutcome {
        self.machine.sweep_expired_ticket();

        let state = self.machine.state();
        if !state.is_authenticated() {
            debug!(?state, "Skipping verification, no session");
            return TickOutcome::Skipped;
        }

        debug!("Verifying session");
        let result = self.identity.verify_session().await;

        if !self.is_current(generation) {
            debug!("Verifier stopped during check, discarding result");
            return TickOutcome::Discarded;
        }

        match result {
            Ok(()) => {
                self.record_check();
                TickOutcome::Verified
            }
            Err(RemoteError::Network(message)) => {
                warn!(error = %message, "Session verification failed, will retry next tick");
                TickOutcome::TransientFailure
            }
            Err(RemoteError::Rejected { code, message }) => {
                warn!(code, error = %message, "Identity service rejected session");
                if self.invalidate(generation).await {
                    TickOutcome::Invalidated
                } else if !self.is_current(generation) {
                    debug!("Verifier stopped before invalidation committed, discarding");
                    TickOutcome::Discarded
                } else {
                    TickOutcome::Skipped
                }
            }
        }
    }

    /// Invalidate if `generation` is still current when the commit happens,
    /// retiring it in the same step.
    async fn invalidate(self: &Arc<Self>, generation: u64) -> bool {
        let shared = Arc::clone(self);
        let committed = tokio::task::spawn_blocking(move || {
            shared
                .machine
                .invalidate_if(InvalidationReason::RemoteRejected, || {
                    shared
                        .generation
                        .compare_exchange(
                            generation,
                            generation + 1,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                })
        })
        .await;
        committed.unwrap_or_else(|e| {
            warn!(error = %e, "Invalidation task failed");
            false
        })
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn last_check(&self) -> Option<i64> {
        match self.store.get(LAST_CHECK_KEY) {
            Ok(Some(bytes)) => std::str::from_utf8(&bytes).ok()?.trim().parse().ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read last verification time");
                None
            }
        }
    }

    fn record_check(&self) {
        let now = self.clock.now_millis();
        if let Err(e) = self.store.put(LAST_CHECK_KEY, now.to_string().as_bytes()) {
            warn!(error = %e, "Failed to record verification time");
        }
    }
}
