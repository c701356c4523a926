//! Access guard for the public site.
//!
//! Decides, for every render, whether the visitor sees the requested page, a
//! lockout screen with a countdown, or the maintenance notice. All state lives
//! in the visitor's local cache, so the guard is advisory only: clearing the
//! cache or switching browser profile resets every counter and block.
//!
//! The guard is a plain state machine. Time is always passed in; the periodic
//! timers that drive [`AccessGuard::reset_actions`] and [`AccessGuard::tick`]
//! belong to whoever owns the guard.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::activity::ActivityWindow;
use crate::block::{BlockReason, BlockState};
use crate::cache::LocalCache;
use crate::policy::GuardPolicy;
use crate::storage::{
    load_activity, load_block_state, load_policy, save_activity, save_block_state, save_policy,
};

pub const ADMIN_ROUTE_PREFIX: &str = "/admin";

/// What the application shell should render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardView {
    Children,
    Blocked {
        reason: BlockReason,
        remaining_secs: u64,
    },
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockCause {
    Expired,
    PolicyInactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardTransition {
    Unchanged,
    Blocked(BlockReason),
    Unblocked(UnblockCause),
    /// An expired block was lifted and a new one entered in the same step.
    Reblocked(BlockReason),
}

impl GuardTransition {
    /// Fold in an expired block lifted earlier in the same step.
    fn after_expiry(self, lifted: bool) -> Self {
        match (lifted, self) {
            (true, GuardTransition::Blocked(reason)) => GuardTransition::Reblocked(reason),
            (true, GuardTransition::Unchanged) => GuardTransition::Unblocked(UnblockCause::Expired),
            (_, transition) => transition,
        }
    }
}

pub struct AccessGuard {
    cache: Arc<dyn LocalCache>,
    policy: GuardPolicy,
    activity: ActivityWindow,
    block: BlockState,
}

impl AccessGuard {
    /// Restore guard state from the local cache. Unreadable entries fall back
    /// to defaults; an expired block is discarded.
    pub fn load(cache: Arc<dyn LocalCache>, now: DateTime<Utc>) -> Self {
        let policy = match load_policy(cache.as_ref()) {
            Ok(Some(policy)) => policy,
            Ok(None) => GuardPolicy::default(),
            Err(err) => {
                warn!(error = %err, "cached policy unreadable; using defaults");
                GuardPolicy::default()
            }
        };
        let activity = load_activity(cache.as_ref()).unwrap_or_else(|err| {
            warn!(error = %err, "cached activity window unreadable; starting fresh");
            ActivityWindow::default()
        });
        let block = load_block_state(cache.as_ref()).unwrap_or_else(|err| {
            warn!(error = %err, "cached block state unreadable; ignoring it");
            BlockState::default()
        });

        let mut guard = Self {
            cache,
            policy,
            activity,
            block,
        };
        if guard.block.active && guard.block.is_expired(now) {
            debug!("discarding expired block from cache");
            guard.clear_block();
        }
        guard
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    pub fn activity(&self) -> &ActivityWindow {
        &self.activity
    }

    pub fn block_state(&self) -> &BlockState {
        &self.block
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.policy.active && self.block.is_enforced(now)
    }

    /// Runs once per navigation to the guarded shell.
    pub fn on_page_load(&mut self, now: DateTime<Utc>) -> GuardTransition {
        if !self.policy.active {
            return self.release(UnblockCause::PolicyInactive);
        }

        if self.block.is_enforced(now) {
            // already locked out: no detection while blocked
            return GuardTransition::Unchanged;
        }
        let lifted = self.lift_expired(now);

        if !self.policy.reload_detection {
            return GuardTransition::Unchanged.after_expiry(lifted);
        }

        let reloads = self
            .activity
            .record_reload(now, self.policy.refresh_window());
        self.persist_activity();
        debug!(reloads, max = self.policy.max_refreshes, "page load recorded");

        let transition = if reloads > self.policy.max_refreshes as usize {
            self.enter_block(BlockReason::ReloadRate, now, self.policy.block_duration())
        } else {
            GuardTransition::Unchanged
        };
        transition.after_expiry(lifted)
    }

    /// Apply a policy pushed by the remote settings document.
    pub fn apply_policy(&mut self, policy: GuardPolicy, now: DateTime<Utc>) -> GuardTransition {
        if let Err(err) = policy.validate() {
            warn!(error = %err, "ignoring invalid guard policy");
            return GuardTransition::Unchanged;
        }
        if policy == self.policy {
            return GuardTransition::Unchanged;
        }

        self.policy = policy;
        if let Err(err) = save_policy(self.cache.as_ref(), &self.policy) {
            warn!(error = %err, "cannot cache guard policy");
        }
        info!(
            active = self.policy.active,
            maintenance = self.policy.maintenance_mode,
            max_refreshes = self.policy.max_refreshes,
            window_secs = self.policy.refresh_window_seconds,
            "guard policy applied"
        );

        if !self.policy.active {
            return self.release(UnblockCause::PolicyInactive);
        }
        self.activity.prune(now, self.policy.refresh_window());
        self.persist_activity();
        GuardTransition::Unchanged
    }

    /// Count one click or key press.
    pub fn record_action(&mut self, now: DateTime<Utc>) -> GuardTransition {
        if !self.policy.active || !self.policy.interaction_detection {
            return GuardTransition::Unchanged;
        }
        if self.block.is_enforced(now) {
            return GuardTransition::Unchanged;
        }
        let lifted = self.lift_expired(now);

        self.activity.record_action();
        let transition = if self.activity.interaction_ceiling_exceeded() {
            self.activity.reset_actions();
            self.persist_activity();
            self.enter_block(BlockReason::InteractionRate, now, self.policy.block_duration())
        } else {
            self.persist_activity();
            GuardTransition::Unchanged
        };
        transition.after_expiry(lifted)
    }

    /// Body of the fixed 30 second reset timer.
    pub fn reset_actions(&mut self) {
        if self.activity.action_count == 0 {
            return;
        }
        self.activity.reset_actions();
        self.persist_activity();
    }

    /// Body of the 1 second countdown timer.
    pub fn tick(&mut self, now: DateTime<Utc>) -> GuardTransition {
        if self.block.active && self.block.is_expired(now) {
            return self.release(UnblockCause::Expired);
        }
        GuardTransition::Unchanged
    }

    /// Lock the session for a reason supplied from outside the detection
    /// rules. `duration` defaults to the policy's block duration.
    pub fn trigger(
        &mut self,
        reason: impl Into<String>,
        duration: Option<Duration>,
        now: DateTime<Utc>,
    ) -> GuardTransition {
        if !self.policy.active {
            debug!("guard inactive; external lock ignored");
            return GuardTransition::Unchanged;
        }
        let duration = duration.unwrap_or_else(|| self.policy.block_duration());
        let lifted = self.lift_expired(now);
        self.enter_block(BlockReason::External(reason.into()), now, duration)
            .after_expiry(lifted)
    }

    pub fn view(&self, route: &str, now: DateTime<Utc>) -> GuardView {
        if self.policy.maintenance_mode && !is_admin_route(route) {
            return GuardView::Maintenance;
        }
        if !self.policy.active {
            return GuardView::Children;
        }
        match self.block.remaining_secs(now) {
            Some(remaining_secs) => GuardView::Blocked {
                reason: self
                    .block
                    .reason
                    .clone()
                    .unwrap_or_else(|| BlockReason::External("Access restricted".into())),
                remaining_secs,
            },
            None => GuardView::Children,
        }
    }

    fn enter_block(
        &mut self,
        reason: BlockReason,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> GuardTransition {
        self.block.enter(reason.clone(), now, duration);
        self.persist_block();
        info!(reason = %reason, until = ?self.block.expires_at, "session blocked");
        GuardTransition::Blocked(reason)
    }

    fn release(&mut self, cause: UnblockCause) -> GuardTransition {
        if !self.block.active {
            return GuardTransition::Unchanged;
        }
        self.clear_block();
        info!(?cause, "session unblocked");
        GuardTransition::Unblocked(cause)
    }

    /// Release a block whose expiry passed before the countdown noticed.
    fn lift_expired(&mut self, now: DateTime<Utc>) -> bool {
        if self.block.active && self.block.is_expired(now) {
            self.release(UnblockCause::Expired);
            return true;
        }
        false
    }

    fn clear_block(&mut self) {
        self.block.exit();
        self.persist_block();
    }

    fn persist_block(&self) {
        if let Err(err) = save_block_state(self.cache.as_ref(), &self.block) {
            warn!(error = %err, "cannot persist block state");
        }
    }

    fn persist_activity(&self) {
        if let Err(err) = save_activity(self.cache.as_ref(), &self.activity) {
            warn!(error = %err, "cannot persist activity window");
        }
    }
}

/// True for `/admin` and anything below it. Query and fragment are ignored.
pub fn is_admin_route(route: &str) -> bool {
    let path = route
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or(route);
    match path.strip_prefix(ADMIN_ROUTE_PREFIX) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::INTERACTION_CEILING;
    use crate::cache::MemoryCache;

    fn cache_with_policy(policy: &GuardPolicy) -> Arc<dyn LocalCache> {
        let cache = Arc::new(MemoryCache::new());
        save_policy(cache.as_ref(), policy).unwrap();
        cache
    }

    fn policy_5_in_15() -> GuardPolicy {
        GuardPolicy {
            max_refreshes: 5,
            refresh_window_seconds: 15,
            block_duration_minutes: 5,
            ..GuardPolicy::default()
        }
    }

    /// Simulates `loads` navigations, each re-reading the cache like a browser
    /// reload would, spaced `spacing` seconds apart.
    fn reload_n_times(
        cache: &Arc<dyn LocalCache>,
        start: DateTime<Utc>,
        loads: i64,
        spacing: i64,
    ) -> AccessGuard {
        let mut last = None;
        for i in 0..loads {
            let now = start + Duration::seconds(i * spacing);
            let mut guard = AccessGuard::load(cache.clone(), now);
            guard.on_page_load(now);
            last = Some(guard);
        }
        last.unwrap()
    }

    #[test]
    fn six_reloads_in_window_block() {
        let cache = cache_with_policy(&policy_5_in_15());
        let start = Utc::now();
        let guard = reload_n_times(&cache, start, 6, 2);
        let now = start + Duration::seconds(10);
        assert!(matches!(
            guard.view("/about", now),
            GuardView::Blocked { reason: BlockReason::ReloadRate, .. }
        ));
    }

    #[test]
    fn five_reloads_in_window_do_not_block() {
        let cache = cache_with_policy(&policy_5_in_15());
        let start = Utc::now();
        let guard = reload_n_times(&cache, start, 5, 3);
        assert_eq!(guard.view("/about", start + Duration::seconds(12)), GuardView::Children);
    }

    #[test]
    fn reloads_spread_beyond_window_do_not_block() {
        let cache = cache_with_policy(&policy_5_in_15());
        let start = Utc::now();
        let guard = reload_n_times(&cache, start, 12, 4);
        assert!(!guard.is_blocked(start + Duration::seconds(44)));
        assert!(guard.activity().reload_timestamps.len() <= 4);
    }

    #[test]
    fn reload_rule_respects_sub_flag() {
        let policy = GuardPolicy {
            reload_detection: false,
            ..policy_5_in_15()
        };
        let cache = cache_with_policy(&policy);
        let start = Utc::now();
        let guard = reload_n_times(&cache, start, 20, 0);
        assert!(!guard.is_blocked(start));
        assert!(guard.activity().reload_timestamps.is_empty());
    }

    #[test]
    fn block_survives_reload_until_expiry() {
        let cache = cache_with_policy(&policy_5_in_15());
        let start = Utc::now();
        let mut guard = AccessGuard::load(cache.clone(), start);
        guard.trigger("suspicious form spam", Some(Duration::seconds(300)), start);

        let at_100 = start + Duration::seconds(100);
        let mut reloaded = AccessGuard::load(cache.clone(), at_100);
        assert_eq!(reloaded.on_page_load(at_100), GuardTransition::Unchanged);
        match reloaded.view("/news", at_100) {
            GuardView::Blocked { remaining_secs, .. } => assert_eq!(remaining_secs, 200),
            other => panic!("expected block, got {other:?}"),
        }

        let at_400 = start + Duration::seconds(400);
        let reloaded = AccessGuard::load(cache.clone(), at_400);
        assert_eq!(reloaded.view("/news", at_400), GuardView::Children);
        assert!(!load_block_state(cache.as_ref()).unwrap().active);
    }

    #[test]
    fn inactive_policy_dominates_existing_block() {
        let cache = cache_with_policy(&policy_5_in_15());
        let now = Utc::now();
        let mut guard = AccessGuard::load(cache.clone(), now);
        guard.trigger("manual", None, now);
        assert!(guard.is_blocked(now));

        let off = GuardPolicy {
            active: false,
            ..policy_5_in_15()
        };
        assert_eq!(
            guard.apply_policy(off, now),
            GuardTransition::Unblocked(UnblockCause::PolicyInactive)
        );
        assert_eq!(guard.view("/about", now), GuardView::Children);
        assert!(!load_block_state(cache.as_ref()).unwrap().active);

        // detection stays off while inactive
        for _ in 0..(INTERACTION_CEILING * 3) {
            guard.record_action(now);
        }
        assert_eq!(guard.on_page_load(now), GuardTransition::Unchanged);
        assert_eq!(guard.view("/about", now), GuardView::Children);
    }

    #[test]
    fn inactive_cached_policy_clears_stale_block_on_load() {
        let now = Utc::now();
        let cache: Arc<dyn LocalCache> = Arc::new(MemoryCache::new());
        let mut block = BlockState::default();
        block.enter(BlockReason::ReloadRate, now, Duration::minutes(5));
        save_block_state(cache.as_ref(), &block).unwrap();
        save_policy(
            cache.as_ref(),
            &GuardPolicy {
                active: false,
                ..GuardPolicy::default()
            },
        )
        .unwrap();

        let mut guard = AccessGuard::load(cache.clone(), now);
        assert_eq!(guard.view("/", now), GuardView::Children);
        assert_eq!(
            guard.on_page_load(now),
            GuardTransition::Unblocked(UnblockCause::PolicyInactive)
        );
        assert!(!load_block_state(cache.as_ref()).unwrap().active);
    }

    #[test]
    fn interaction_burst_blocks_once() {
        let cache = cache_with_policy(&policy_5_in_15());
        let now = Utc::now();
        let mut guard = AccessGuard::load(cache, now);
        for _ in 0..INTERACTION_CEILING {
            assert_eq!(guard.record_action(now), GuardTransition::Unchanged);
        }
        assert_eq!(
            guard.record_action(now),
            GuardTransition::Blocked(BlockReason::InteractionRate)
        );
        let expires_at = guard.block_state().expires_at;
        // no re-trip while blocked
        for _ in 0..(INTERACTION_CEILING * 2) {
            assert_eq!(guard.record_action(now), GuardTransition::Unchanged);
        }
        assert_eq!(guard.block_state().expires_at, expires_at);
    }

    #[test]
    fn periodic_reset_keeps_slow_clicking_unblocked() {
        let cache = cache_with_policy(&policy_5_in_15());
        let now = Utc::now();
        let mut guard = AccessGuard::load(cache, now);
        for _ in 0..4 {
            for _ in 0..40 {
                guard.record_action(now);
            }
            guard.reset_actions();
        }
        assert!(!guard.is_blocked(now));
        assert_eq!(guard.activity().action_count, 0);
    }

    #[test]
    fn countdown_tick_unblocks_at_expiry() {
        let cache = cache_with_policy(&policy_5_in_15());
        let now = Utc::now();
        let mut guard = AccessGuard::load(cache, now);
        guard.trigger("manual", Some(Duration::seconds(3)), now);
        assert_eq!(guard.tick(now + Duration::seconds(2)), GuardTransition::Unchanged);
        assert_eq!(
            guard.tick(now + Duration::seconds(3)),
            GuardTransition::Unblocked(UnblockCause::Expired)
        );
        assert_eq!(guard.tick(now + Duration::seconds(4)), GuardTransition::Unchanged);
    }

    #[test]
    fn expired_block_is_lifted_before_new_interaction_block() {
        let cache = cache_with_policy(&policy_5_in_15());
        let now = Utc::now();
        let mut guard = AccessGuard::load(cache, now);
        guard.trigger("manual", Some(Duration::seconds(10)), now);

        // countdown has not run yet; the block is stale but still recorded
        let later = now + Duration::seconds(11);
        assert!(guard.block_state().active);
        for _ in 0..INTERACTION_CEILING {
            guard.activity.record_action();
        }
        assert_eq!(
            guard.record_action(later),
            GuardTransition::Reblocked(BlockReason::InteractionRate)
        );
        assert_eq!(guard.block_state().blocked_at, Some(later));
    }

    #[test]
    fn first_action_after_stale_block_reports_unblock() {
        let cache = cache_with_policy(&policy_5_in_15());
        let now = Utc::now();
        let mut guard = AccessGuard::load(cache, now);
        guard.trigger("manual", Some(Duration::seconds(10)), now);

        let later = now + Duration::seconds(11);
        assert_eq!(
            guard.record_action(later),
            GuardTransition::Unblocked(UnblockCause::Expired)
        );
        assert!(!guard.block_state().active);
        assert_eq!(guard.record_action(later), GuardTransition::Unchanged);
        assert_eq!(guard.tick(later), GuardTransition::Unchanged);
    }

    #[test]
    fn maintenance_mode_spares_admin_routes() {
        let policy = GuardPolicy {
            maintenance_mode: true,
            ..GuardPolicy::default()
        };
        let cache = cache_with_policy(&policy);
        let now = Utc::now();
        let guard = AccessGuard::load(cache, now);
        assert_eq!(guard.view("/about", now), GuardView::Maintenance);
        assert_eq!(guard.view("/admin/dashboard", now), GuardView::Children);
        assert_eq!(guard.view("/admin", now), GuardView::Children);
        assert_eq!(guard.view("/administration", now), GuardView::Maintenance);
    }

    #[test]
    fn maintenance_takes_precedence_over_block() {
        let cache = cache_with_policy(&GuardPolicy {
            maintenance_mode: true,
            ..GuardPolicy::default()
        });
        let now = Utc::now();
        let mut guard = AccessGuard::load(cache, now);
        guard.trigger("manual", None, now);
        assert_eq!(guard.view("/placements", now), GuardView::Maintenance);
        assert!(matches!(
            guard.view("/admin/users", now),
            GuardView::Blocked { .. }
        ));
    }

    #[test]
    fn invalid_policy_is_ignored() {
        let cache = cache_with_policy(&policy_5_in_15());
        let now = Utc::now();
        let mut guard = AccessGuard::load(cache, now);
        let broken = GuardPolicy {
            max_refreshes: 0,
            ..policy_5_in_15()
        };
        guard.apply_policy(broken, now);
        assert_eq!(guard.policy().max_refreshes, 5);
    }

    #[test]
    fn admin_route_matching() {
        assert!(is_admin_route("/admin"));
        assert!(is_admin_route("/admin/"));
        assert!(is_admin_route("/admin?tab=users"));
        assert!(!is_admin_route("/"));
        assert!(!is_admin_route("/admissions"));
    }
}
