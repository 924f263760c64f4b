//! Per-sender send quotas.
//!
//! Each sender has a rolling 1-hour and 24-hour ceiling plus a weekly
//! business-hour window. A dispatch at `t` counts toward the window
//! `(now - len, now]`. Check-and-record happens under a per-sender
//! `tokio::sync::Mutex`, and every reservation is persisted before the mutex
//! is released, so concurrent workers can never overshoot a limit and a
//! restarted process rebuilds its counts from the database.

pub mod window;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::enrollment::Deferral;
use crate::error::{Result, ValidationError};
use crate::store::Database;

pub use window::{DayWindow, SendSchedule};

const DAILY_RANGE: (u32, u32) = (1, 200);
const HOURLY_RANGE: (u32, u32) = (1, 50);

/// Upper bound on slot-search iterations; each one strictly advances the candidate.
const MAX_SLOT_STEPS: usize = 32;

/// Quota settings for one sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub daily_send_limit: u32,
    pub hourly_send_limit: u32,
    #[serde(default)]
    pub send_window: SendSchedule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            daily_send_limit: 50,
            hourly_send_limit: 6,
            send_window: SendSchedule::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        check_range("dailySendLimit", self.daily_send_limit, DAILY_RANGE)?;
        check_range("hourlySendLimit", self.hourly_send_limit, HOURLY_RANGE)?;
        self.send_window.validate()
    }

    fn windows(&self) -> [(Duration, u32); 2] {
        [
            (Duration::hours(1), self.hourly_send_limit),
            (Duration::hours(24), self.daily_send_limit),
        ]
    }

    /// True if either ceiling is higher than in `previous`.
    fn raises(&self, previous: &RateLimitConfig) -> bool {
        self.daily_send_limit > previous.daily_send_limit
            || self.hourly_send_limit > previous.hourly_send_limit
    }
}

fn check_range(
    field: &str,
    value: u32,
    (min, max): (u32, u32),
) -> std::result::Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::LimitOutOfRange {
            field: field.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// One authorized send, persisted so rolling counts survive a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub id: Uuid,
    pub sender_id: String,
    pub enrollment_id: Uuid,
    pub sent_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn new(sender_id: impl Into<String>, enrollment_id: Uuid, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            enrollment_id,
            sent_at,
        }
    }
}

/// Handle to a held send slot. Give it back with [`RateLimiter::release`] if
/// the send does not happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub record_id: Uuid,
    pub sender_id: String,
    pub sent_at: DateTime<Utc>,
}

/// Result of asking for a send slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    Deferred {
        until: DateTime<Utc>,
        reason: Deferral,
    },
}

/// In-memory view of one sender: config plus send times from the last 24 hours.
#[derive(Debug)]
struct SenderState {
    config: RateLimitConfig,
    sent: VecDeque<DateTime<Utc>>,
}

impl SenderState {
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::hours(24);
        while self.sent.front().is_some_and(|t| *t <= horizon) {
            self.sent.pop_front();
        }
    }

    fn push(&mut self, at: DateTime<Utc>) {
        let idx = self.sent.partition_point(|t| *t <= at);
        self.sent.insert(idx, at);
    }

    fn remove(&mut self, at: DateTime<Utc>) {
        if let Some(idx) = self.sent.iter().position(|t| *t == at) {
            self.sent.remove(idx);
        }
    }

    fn under_limits(&self, at: DateTime<Utc>) -> bool {
        under_limits(&self.config, &self.sent, at)
    }
}

/// Number of sends in `(at - len, at]`.
fn count_in(sent: &VecDeque<DateTime<Utc>>, at: DateTime<Utc>, len: Duration) -> usize {
    let start = at - len;
    sent.iter().filter(|t| **t > start && **t <= at).count()
}

fn under_limits(config: &RateLimitConfig, sent: &VecDeque<DateTime<Utc>>, at: DateTime<Utc>) -> bool {
    config
        .windows()
        .iter()
        .all(|(len, limit)| count_in(sent, at, *len) < *limit as usize)
}

/// Earliest instant at or after `now` where both counts are below their
/// limits and the send window is open. `None` only if no weekday is enabled.
fn next_slot(
    config: &RateLimitConfig,
    sent: &VecDeque<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut t = now;
    for _ in 0..MAX_SLOT_STEPS {
        let mut moved = false;
        for (len, limit) in config.windows() {
            let start = t - len;
            let in_window: Vec<DateTime<Utc>> = sent
                .iter()
                .copied()
                .filter(|s| *s > start && *s <= t)
                .collect();
            let limit = limit as usize;
            if in_window.len() >= limit {
                // The oldest `len - limit + 1` sends must age out.
                let freed = in_window[in_window.len() - limit] + len;
                if freed > t {
                    t = freed;
                    moved = true;
                }
            }
        }
        let open = config.send_window.next_open(t)?;
        if open != t {
            t = open;
            moved = true;
        }
        if !moved {
            return Some(t);
        }
    }
    Some(t)
}

/// Per-sender rolling-window limiter backed by persisted dispatch records.
pub struct RateLimiter {
    store: Arc<dyn Database>,
    senders: RwLock<HashMap<String, Arc<Mutex<SenderState>>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self {
            store,
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Get the sender's state, loading config and recent sends on first use.
    async fn sender(&self, sender_id: &str, now: DateTime<Utc>) -> Result<Arc<Mutex<SenderState>>> {
        if let Some(state) = self.senders.read().await.get(sender_id) {
            return Ok(Arc::clone(state));
        }

        let config = self
            .store
            .get_rate_limits(sender_id)
            .await?
            .unwrap_or_default();
        let sent: VecDeque<_> = self
            .store
            .list_dispatch_times(sender_id, now - Duration::hours(24))
            .await?
            .into();
        debug!(sender = %sender_id, recent = sent.len(), "Loaded sender quota state");

        let mut senders = self.senders.write().await;
        let state = senders
            .entry(sender_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SenderState { config, sent })));
        Ok(Arc::clone(state))
    }

    /// Effective limits for a sender (defaults if none were stored).
    pub async fn limits(&self, sender_id: &str, now: DateTime<Utc>) -> Result<RateLimitConfig> {
        let state = self.sender(sender_id, now).await?;
        let guard = state.lock().await;
        Ok(guard.config.clone())
    }

    /// Whether a send at `now` would be authorized.
    pub async fn may_dispatch(&self, sender_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let state = self.sender(sender_id, now).await?;
        let mut guard = state.lock().await;
        guard.prune(now);
        Ok(guard.config.send_window.is_open(now) && guard.under_limits(now))
    }

    /// Record a send unconditionally.
    pub async fn record_dispatch(
        &self,
        sender_id: &str,
        enrollment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let state = self.sender(sender_id, now).await?;
        let mut guard = state.lock().await;
        guard.prune(now);
        self.persist(&mut guard, sender_id, enrollment_id, now).await
    }

    /// Earliest instant at or after `now` when a send would be authorized.
    pub async fn next_eligible_slot(
        &self,
        sender_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let state = self.sender(sender_id, now).await?;
        let mut guard = state.lock().await;
        guard.prune(now);
        Ok(next_slot(&guard.config, &guard.sent, now))
    }

    /// Atomically check the quota and, if a send is authorized at `now`, hold the slot.
    pub async fn try_reserve(
        &self,
        sender_id: &str,
        enrollment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome> {
        let state = self.sender(sender_id, now).await?;
        let mut guard = state.lock().await;
        guard.prune(now);

        let under = guard.under_limits(now);
        let open = guard.config.send_window.is_open(now);
        if under && open {
            let reservation = self.persist(&mut guard, sender_id, enrollment_id, now).await?;
            return Ok(ReserveOutcome::Reserved(reservation));
        }

        let reason = if under {
            Deferral::OutsideWindow
        } else {
            Deferral::RateLimited
        };
        let until = next_slot(&guard.config, &guard.sent, now).unwrap_or(now + Duration::days(7));
        debug!(
            sender = %sender_id,
            enrollment_id = %enrollment_id,
            until = %until,
            reason = reason.as_str(),
            "Send deferred by quota"
        );
        Ok(ReserveOutcome::Deferred { until, reason })
    }

    /// Return a slot whose send failed.
    pub async fn release(&self, reservation: &Reservation) -> Result<()> {
        let state = self.sender(&reservation.sender_id, reservation.sent_at).await?;
        let mut guard = state.lock().await;
        self.store.delete_dispatch(reservation.record_id).await?;
        guard.remove(reservation.sent_at);
        Ok(())
    }

    /// Validate and store new limits. When a ceiling goes up, rate-deferred
    /// enrollments of the sender are pulled forward to the new earliest slot.
    /// Returns how many enrollments were re-scheduled.
    pub async fn set_limits(
        &self,
        sender_id: &str,
        config: RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        config.validate()?;
        let state = self.sender(sender_id, now).await?;
        let mut guard = state.lock().await;

        self.store.set_rate_limits(sender_id, &config, now).await?;
        let raised = config.raises(&guard.config);
        guard.config = config;
        guard.prune(now);

        if !raised {
            return Ok(0);
        }
        let Some(slot) = next_slot(&guard.config, &guard.sent, now) else {
            return Ok(0);
        };
        let moved = self
            .store
            .reschedule_rate_deferred(sender_id, slot, now)
            .await?;
        info!(sender = %sender_id, moved, slot = %slot, "Limits raised; deferred sends re-scheduled");
        Ok(moved)
    }

    /// Drop dispatch records that no longer count toward any window.
    pub async fn prune_records(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self
            .store
            .prune_dispatches(now - Duration::hours(24))
            .await?)
    }

    async fn persist(
        &self,
        guard: &mut SenderState,
        sender_id: &str,
        enrollment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let record = DispatchRecord::new(sender_id, enrollment_id, now);
        self.store.insert_dispatch(&record).await?;
        guard.push(now);
        Ok(Reservation {
            record_id: record.id,
            sender_id: record.sender_id,
            sent_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono_tz::Tz;
    use proptest::prelude::*;

    use super::*;
    use crate::store::LibSqlBackend;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        // Monday 2026-10-19
        Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap()
    }

    fn always(hourly: u32, daily: u32) -> RateLimitConfig {
        RateLimitConfig {
            daily_send_limit: daily,
            hourly_send_limit: hourly,
            send_window: SendSchedule::always(Tz::UTC),
        }
    }

    async fn limiter() -> (RateLimiter, Arc<dyn Database>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (RateLimiter::new(Arc::clone(&store)), store)
    }

    #[test]
    fn config_validation_ranges() {
        assert!(RateLimitConfig::default().validate().is_ok());
        let err = always(51, 50).validate().unwrap_err();
        assert!(matches!(err, ValidationError::LimitOutOfRange { ref field, max: 50, .. } if field == "hourlySendLimit"));
        assert!(always(1, 0).validate().is_err());
        assert!(always(1, 201).validate().is_err());
    }

    #[test]
    fn config_wire_names() {
        let json = serde_json::to_value(RateLimitConfig::default()).unwrap();
        assert_eq!(json["dailySendLimit"], 50);
        assert_eq!(json["hourlySendLimit"], 6);
        assert_eq!(json["sendWindow"]["timezone"], "UTC");
    }

    #[test]
    fn window_boundary_is_exclusive_of_old_edge() {
        let sent = VecDeque::from([at(9, 0)]);
        let config = always(1, 50);
        assert!(!under_limits(&config, &sent, at(9, 59)));
        // Exactly one hour later the old send has left (now - 1h, now].
        assert!(under_limits(&config, &sent, at(10, 0)));
    }

    #[test]
    fn next_slot_waits_for_oldest_send_to_age_out() {
        let sent = VecDeque::from([at(9, 0), at(9, 20), at(9, 40)]);
        let config = always(2, 50);
        assert_eq!(next_slot(&config, &sent, at(9, 45)), Some(at(10, 20)));
    }

    #[test]
    fn next_slot_respects_both_windows() {
        // Daily ceiling hit early in the day; hourly is free.
        let sent = VecDeque::from([at(1, 0), at(2, 0)]);
        let config = always(5, 2);
        assert_eq!(
            next_slot(&config, &sent, at(3, 0)),
            Some(at(1, 0) + Duration::hours(24))
        );
    }

    #[test]
    fn next_slot_rolls_into_business_hours() {
        let sent = VecDeque::from([at(16, 30)]);
        let config = RateLimitConfig {
            hourly_send_limit: 1,
            ..Default::default()
        };
        // Next hourly slot is 17:30, outside 09:00-17:00; Tuesday opens at 09:00.
        assert_eq!(
            next_slot(&config, &sent, at(16, 45)),
            Some(Utc.with_ymd_and_hms(2026, 10, 20, 9, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn hourly_limit_of_one_defers_second_send() {
        let (limiter, _) = limiter().await;
        limiter.set_limits("s", always(1, 50), at(9, 0)).await.unwrap();

        let first = limiter.try_reserve("s", Uuid::new_v4(), at(9, 0)).await.unwrap();
        assert!(matches!(first, ReserveOutcome::Reserved(_)));

        let second = limiter.try_reserve("s", Uuid::new_v4(), at(9, 0)).await.unwrap();
        assert_eq!(
            second,
            ReserveOutcome::Deferred {
                until: at(10, 0),
                reason: Deferral::RateLimited
            }
        );
    }

    #[tokio::test]
    async fn closed_window_defers_with_outside_window() {
        let (limiter, _) = limiter().await;
        // Default config: weekdays 09:00-17:00 UTC.
        let outcome = limiter.try_reserve("s", Uuid::new_v4(), at(7, 0)).await.unwrap();
        assert_eq!(
            outcome,
            ReserveOutcome::Deferred {
                until: at(9, 0),
                reason: Deferral::OutsideWindow
            }
        );
        assert!(!limiter.may_dispatch("s", at(7, 0)).await.unwrap());
        assert!(limiter.may_dispatch("s", at(9, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn release_returns_the_slot() {
        let (limiter, store) = limiter().await;
        limiter.set_limits("s", always(1, 50), at(9, 0)).await.unwrap();

        let ReserveOutcome::Reserved(reservation) =
            limiter.try_reserve("s", Uuid::new_v4(), at(9, 0)).await.unwrap()
        else {
            panic!("expected a reservation");
        };
        assert!(!limiter.may_dispatch("s", at(9, 1)).await.unwrap());

        limiter.release(&reservation).await.unwrap();
        assert!(limiter.may_dispatch("s", at(9, 1)).await.unwrap());
        assert!(store.list_dispatch_times("s", at(0, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counts_survive_a_new_limiter_on_the_same_store() {
        let (limiter, store) = limiter().await;
        limiter.set_limits("s", always(2, 50), at(9, 0)).await.unwrap();
        limiter.record_dispatch("s", Uuid::new_v4(), at(9, 0)).await.unwrap();
        limiter.record_dispatch("s", Uuid::new_v4(), at(9, 10)).await.unwrap();

        let restarted = RateLimiter::new(store);
        assert_eq!(restarted.limits("s", at(9, 20)).await.unwrap(), always(2, 50));
        assert!(!restarted.may_dispatch("s", at(9, 20)).await.unwrap());
        assert_eq!(
            restarted.next_eligible_slot("s", at(9, 20)).await.unwrap(),
            Some(at(10, 0))
        );
    }

    #[tokio::test]
    async fn set_limits_rejects_out_of_range() {
        let (limiter, store) = limiter().await;
        let err = limiter.set_limits("s", always(0, 50), at(9, 0)).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Validation(_)));
        assert!(store.get_rate_limits("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overshoot() {
        let (limiter, _) = limiter().await;
        let limiter = Arc::new(limiter);
        limiter.set_limits("s", always(3, 50), at(9, 0)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.try_reserve("s", Uuid::new_v4(), at(9, 0)).await.unwrap()
            }));
        }
        let mut reserved = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ReserveOutcome::Reserved(_)) {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 3);
    }

    proptest! {
        #[test]
        fn rolling_limits_are_never_exceeded(
            hourly in 1u32..6,
            daily in 1u32..20,
            gaps in proptest::collection::vec(0i64..90, 1..80),
        ) {
            let config = always(hourly, daily);
            let mut sent = VecDeque::new();
            let mut now = at(0, 0);
            for gap in gaps {
                now += Duration::minutes(gap);
                let slot = next_slot(&config, &sent, now).unwrap();
                prop_assert!(slot >= now);
                prop_assert!(under_limits(&config, &sent, slot));
                if slot == now {
                    sent.push_back(now);
                }
                // Every rolling window ending at a send respects both ceilings.
                for end in sent.iter() {
                    prop_assert!(count_in(&sent, *end, Duration::hours(1)) <= hourly as usize);
                    prop_assert!(count_in(&sent, *end, Duration::hours(24)) <= daily as usize);
                }
            }
        }
    }
}
