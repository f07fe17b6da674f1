//! Ping/RTT: periodic correlated pings and round-trip measurement.
//!
//! Each ping id maps to the instant it was sent; the matching pong removes it and publishes
//! `now - sent` as the current round-trip time. Pings that never get an answer expire, and
//! the table never holds more than [`MAX_PENDING_PINGS`] entries.

use crate::dispatch::Dispatcher;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Upper bound on unanswered pings kept for correlation.
pub const MAX_PENDING_PINGS: usize = 64;

/// Pending ping table and the published round-trip estimate.
pub struct PingTracker {
    next_id: AtomicI32,
    pending: Mutex<HashMap<i32, Instant>>,
    rtt: watch::Sender<Option<Duration>>,
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PingTracker {
    pub fn new() -> Self {
        let (rtt, _) = watch::channel(None);
        Self {
            next_id: AtomicI32::new(0),
            pending: Mutex::new(HashMap::new()),
            rtt,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<i32, Instant>> {
        match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocate the next ping id and record its send time.
    pub fn next_ping(&self) -> i32 {
        self.next_ping_at(Instant::now())
    }

    pub(crate) fn next_ping_at(&self, sent: Instant) -> i32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.pending();
        pending.insert(id, sent);
        if pending.len() > MAX_PENDING_PINGS {
            if let Some(oldest) = pending.iter().min_by_key(|(_, t)| **t).map(|(id, _)| *id) {
                pending.remove(&oldest);
                log::debug!("ping table full, dropped ping {}", oldest);
            }
        }
        id
    }

    /// Drop a ping that was never sent.
    pub fn forget(&self, ping_id: i32) {
        self.pending().remove(&ping_id);
    }

    /// Match a pong. Unknown or already answered ids return `None` and change nothing.
    pub fn on_pong(&self, ping_id: i32) -> Option<Duration> {
        self.on_pong_at(ping_id, Instant::now())
    }

    pub(crate) fn on_pong_at(&self, ping_id: i32, received: Instant) -> Option<Duration> {
        let sent = self.pending().remove(&ping_id)?;
        let rtt = received.saturating_duration_since(sent);
        self.rtt.send_replace(Some(rtt));
        log::debug!("ping {} took {:?}", ping_id, rtt);
        Some(rtt)
    }

    /// Forget pings older than `max_age`. Returns how many were dropped.
    pub fn evict_expired(&self, now: Instant, max_age: Duration) -> usize {
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|_, sent| now.saturating_duration_since(*sent) <= max_age);
        before - pending.len()
    }

    /// Clear all bookkeeping for a new session.
    pub fn reset(&self) {
        self.pending().clear();
        self.next_id.store(0, Ordering::SeqCst);
        self.rtt.send_replace(None);
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Latest measured round-trip time, if any pong has arrived this session.
    pub fn round_trip_time(&self) -> Option<Duration> {
        *self.rtt.borrow()
    }

    /// Receiver that wakes on every new measurement.
    pub fn subscribe(&self) -> watch::Receiver<Option<Duration>> {
        self.rtt.subscribe()
    }
}

/// Send a ping every `interval` until `cancel` fires. The first ping goes out immediately.
pub async fn run_ping_loop(
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<PingTracker>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    log::debug!("ping loop started ({:?} interval)", interval);
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let expired = tracker.evict_expired(Instant::now(), timeout);
                if expired > 0 {
                    log::debug!("{} ping(s) expired without a pong", expired);
                }
                if !dispatcher.is_connected() {
                    continue;
                }
                let ping_id = tracker.next_ping();
                if !dispatcher.send_ping(ping_id).await {
                    tracker.forget(ping_id);
                }
            }
        }
    }
    log::debug!("ping loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_zero_and_increase() {
        let tracker = PingTracker::new();
        assert_eq!(tracker.next_ping(), 0);
        assert_eq!(tracker.next_ping(), 1);
        assert_eq!(tracker.next_ping(), 2);
        assert_eq!(tracker.pending_count(), 3);
    }

    #[test]
    fn pong_computes_rtt_and_removes_entry_once() {
        let tracker = PingTracker::new();
        let sent = Instant::now();
        let id = tracker.next_ping_at(sent);
        let rtt = tracker.on_pong_at(id, sent + Duration::from_millis(40));
        assert_eq!(rtt, Some(Duration::from_millis(40)));
        assert_eq!(tracker.round_trip_time(), Some(Duration::from_millis(40)));
        assert_eq!(tracker.pending_count(), 0);

        assert_eq!(tracker.on_pong_at(id, sent + Duration::from_millis(90)), None);
        assert_eq!(tracker.round_trip_time(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn unknown_pong_is_ignored() {
        let tracker = PingTracker::new();
        tracker.next_ping();
        assert_eq!(tracker.on_pong(77), None);
        assert_eq!(tracker.round_trip_time(), None);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn expired_pings_are_evicted() {
        let tracker = PingTracker::new();
        let start = Instant::now();
        tracker.next_ping_at(start);
        tracker.next_ping_at(start + Duration::from_secs(20));
        let dropped = tracker.evict_expired(start + Duration::from_secs(35), Duration::from_secs(30));
        assert_eq!(dropped, 1);
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.on_pong(0), None);
    }

    #[test]
    fn table_is_capped() {
        let tracker = PingTracker::new();
        let start = Instant::now();
        for i in 0..(MAX_PENDING_PINGS as u64 + 10) {
            tracker.next_ping_at(start + Duration::from_millis(i));
        }
        assert_eq!(tracker.pending_count(), MAX_PENDING_PINGS);
        // The oldest ids were the ones dropped.
        assert_eq!(tracker.on_pong(0), None);
        assert!(tracker.on_pong(MAX_PENDING_PINGS as i32 + 9).is_some());
    }

    #[test]
    fn reset_clears_state() {
        let tracker = PingTracker::new();
        let id = tracker.next_ping();
        tracker.on_pong(id);
        tracker.next_ping();
        tracker.reset();
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.round_trip_time(), None);
        assert_eq!(tracker.next_ping(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_new_measurements() {
        let tracker = PingTracker::new();
        let mut rx = tracker.subscribe();
        let id = tracker.next_ping();
        tracker.on_pong(id);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_some());
    }
}
