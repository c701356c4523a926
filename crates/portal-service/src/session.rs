//! Live guard session.
//!
//! Wraps an [`AccessGuard`] with the three background tasks it needs: the
//! policy feed consumer, the fixed 30 second action reset, and the 1 second
//! countdown that lifts an expired block. The tasks stop together on
//! [`GuardSession::shutdown`] or when the session is dropped.

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use portal_core::activity::ACTION_RESET_INTERVAL_SECS;
use portal_core::block::BlockReason;
use portal_core::cache::LocalCache;
use portal_core::clock::Clock;
use portal_core::event_log::{
    EventLog, EventSeverity, GUARD_BLOCKED, GUARD_UNBLOCKED, POLICY_UNAVAILABLE,
};
use portal_core::guard::{AccessGuard, GuardTransition, GuardView, UnblockCause};
use portal_core::policy::GuardPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::policy_provider::{PolicyProvider, PolicyUpdate};

pub const ACTION_RESET_PERIOD: Duration = Duration::from_secs(ACTION_RESET_INTERVAL_SECS);
pub const COUNTDOWN_PERIOD: Duration = Duration::from_secs(1);

/// Writes guard transitions to the audit log, when one is configured.
#[derive(Clone, Default)]
struct TransitionLog {
    events: Option<Arc<EventLog>>,
}

impl TransitionLog {
    fn record(&self, transition: &GuardTransition) {
        match transition {
            GuardTransition::Unchanged => {}
            GuardTransition::Blocked(reason) => self.blocked(reason),
            GuardTransition::Unblocked(cause) => self.unblocked(*cause),
            GuardTransition::Reblocked(reason) => {
                self.unblocked(UnblockCause::Expired);
                self.blocked(reason);
            }
        }
    }

    fn blocked(&self, reason: &BlockReason) {
        self.append(
            GUARD_BLOCKED,
            EventSeverity::Warn,
            serde_json::json!({ "reason": reason }),
        );
    }

    fn unblocked(&self, cause: UnblockCause) {
        self.append(
            GUARD_UNBLOCKED,
            EventSeverity::Info,
            serde_json::json!({ "cause": cause_label(cause) }),
        );
    }

    fn policy_unavailable(&self, detail: &str) {
        self.append(
            POLICY_UNAVAILABLE,
            EventSeverity::Warn,
            serde_json::json!({ "detail": detail }),
        );
    }

    fn append(&self, event_type: &str, severity: EventSeverity, data: serde_json::Value) {
        if let Some(events) = &self.events {
            if let Err(err) = events.append(event_type, severity, data) {
                warn!(error = %err, event_type, "cannot append audit event");
            }
        }
    }
}

fn cause_label(cause: UnblockCause) -> &'static str {
    match cause {
        UnblockCause::Expired => "EXPIRED",
        UnblockCause::PolicyInactive => "POLICY_INACTIVE",
    }
}

pub struct GuardSession {
    guard: Arc<Mutex<AccessGuard>>,
    clock: Arc<dyn Clock>,
    log: TransitionLog,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl GuardSession {
    /// Load the guard from `cache`, evaluate the initial page load and spawn
    /// the background tasks. Must be called inside a tokio runtime.
    pub fn start(
        cache: Arc<dyn LocalCache>,
        provider: Arc<dyn PolicyProvider>,
        clock: Arc<dyn Clock>,
        events: Option<Arc<EventLog>>,
    ) -> Self {
        let log = TransitionLog { events };
        let now = clock.now();
        let mut guard = AccessGuard::load(cache, now);
        let initial = guard.on_page_load(now);
        log.record(&initial);
        let guard = Arc::new(Mutex::new(guard));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            spawn_policy_consumer(
                provider,
                guard.clone(),
                clock.clone(),
                log.clone(),
                shutdown_rx.clone(),
            ),
            spawn_action_reset(guard.clone(), shutdown_rx.clone()),
            spawn_countdown(guard.clone(), clock.clone(), log.clone(), shutdown_rx),
        ];
        info!("guard session started");

        Self {
            guard,
            clock,
            log,
            shutdown_tx,
            tasks,
        }
    }

    /// A navigation to the guarded shell.
    pub fn on_page_load(&self) -> GuardTransition {
        let transition = self.guard.lock().on_page_load(self.clock.now());
        self.log.record(&transition);
        transition
    }

    pub fn record_action(&self) -> GuardTransition {
        let transition = self.guard.lock().record_action(self.clock.now());
        self.log.record(&transition);
        transition
    }

    /// Lock the session from outside the detection rules.
    pub fn trigger_block(
        &self,
        reason: impl Into<String>,
        duration: Option<ChronoDuration>,
    ) -> GuardTransition {
        let transition = self
            .guard
            .lock()
            .trigger(reason, duration, self.clock.now());
        self.log.record(&transition);
        transition
    }

    pub fn view(&self, route: &str) -> GuardView {
        self.guard.lock().view(route, self.clock.now())
    }

    pub fn policy(&self) -> GuardPolicy {
        self.guard.lock().policy().clone()
    }

    pub fn action_count(&self) -> u32 {
        self.guard.lock().activity().action_count
    }

    pub fn is_blocked(&self) -> bool {
        self.guard.lock().is_blocked(self.clock.now())
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "guard session task failed");
                }
            }
        }
        info!("guard session stopped");
    }
}

impl Drop for GuardSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_policy_consumer(
    provider: Arc<dyn PolicyProvider>,
    guard: Arc<Mutex<AccessGuard>>,
    clock: Arc<dyn Clock>,
    log: TransitionLog,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut updates = tokio::select! {
            subscribed = provider.subscribe() => match subscribed {
                Ok(updates) => updates,
                Err(err) => {
                    warn!(error = %err, "policy feed unavailable; keeping cached policy");
                    log.policy_unavailable(&err.to_string());
                    return;
                }
            },
            _ = shutdown_rx.changed() => return,
        };

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(PolicyUpdate::Policy(policy)) => {
                        let transition = guard.lock().apply_policy(policy, clock.now());
                        log.record(&transition);
                    }
                    Some(PolicyUpdate::Unavailable(detail)) => {
                        warn!(%detail, "policy unavailable; keeping cached policy");
                        log.policy_unavailable(&detail);
                    }
                    None => {
                        debug!("policy feed ended");
                        return;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_action_reset(
    guard: Arc<Mutex<AccessGuard>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(
            Instant::now() + ACTION_RESET_PERIOD,
            ACTION_RESET_PERIOD,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    guard.lock().reset_actions();
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_countdown(
    guard: Arc<Mutex<AccessGuard>>,
    clock: Arc<dyn Clock>,
    log: TransitionLog,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(
            Instant::now() + COUNTDOWN_PERIOD,
            COUNTDOWN_PERIOD,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let transition = guard.lock().tick(clock.now());
                    log.record(&transition);
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    })
}
