//! Session-to-backend matching and client rate limiting.
//!
//! Each client session that addresses a logical service name gets
//! matched to one concrete backend instance, and the match is sticky:
//! as long as that instance stays live, later requests for the same
//! name resolve to it, so server-side per-session state is never
//! orphaned by a mid-session switch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use tracing::debug;

use cluster_core::balance::{pick_min_weight, TieBreak};

use crate::directory::{ServiceDirectory, ServiceEntry};

/// Where a session's traffic for its requested service goes.
#[derive(Debug, Clone, Default)]
pub struct SessionLocation {
    pub ssid: String,
    /// Logical name the client last addressed.
    pub requested: String,
    /// Full advertised name of the chosen instance.
    pub matched: String,
}

/// Matches sessions to backend instances.
pub struct SessionDirector {
    directory: Arc<ServiceDirectory>,
    locations: DashMap<String, SessionLocation>,
    tie_break: TieBreak,
}

impl SessionDirector {
    pub fn new(directory: Arc<ServiceDirectory>, tie_break: TieBreak) -> Self {
        Self {
            directory,
            locations: DashMap::new(),
            tie_break,
        }
    }

    /// Resolves `server_name` for session `ssid` to a live instance.
    ///
    /// Priority order: exact advertised-name match, then the sticky
    /// previous match if still live, then the under-`min_weight`
    /// candidates, then the lowest-weight candidate whose `max_weight`
    /// (0 = unlimited) is not exceeded. `None` means the request must
    /// be rejected, never queued.
    pub fn match_best_server(&self, ssid: &str, server_name: &str) -> Option<ServiceEntry> {
        if let Some(entry) = self.directory.exact(server_name) {
            self.remember(ssid, server_name, &entry.name);
            return Some(entry);
        }

        let candidates = self.directory.candidates_for(server_name);
        if candidates.is_empty() {
            return None;
        }

        if let Some(location) = self.locations.get(ssid) {
            if location.requested == server_name && !location.matched.is_empty() {
                if let Some(previous) =
                    candidates.iter().find(|c| c.name == location.matched)
                {
                    return Some(previous.clone());
                }
            }
        }

        let chosen = self.select(&candidates)?;
        self.remember(ssid, server_name, &chosen.name);
        Some(chosen)
    }

    fn select(&self, candidates: &[ServiceEntry]) -> Option<ServiceEntry> {
        let under_min: Vec<(String, i32)> = candidates
            .iter()
            .filter(|c| c.weight < c.min_weight)
            .map(|c| (c.name.clone(), c.weight))
            .collect();
        let pool = if under_min.is_empty() {
            candidates
                .iter()
                .filter(|c| c.max_weight == 0 || c.weight < c.max_weight)
                .map(|c| (c.name.clone(), c.weight))
                .collect()
        } else {
            under_min
        };

        let name = pick_min_weight(pool, self.tie_break)?;
        candidates.iter().find(|c| c.name == name).cloned()
    }

    fn remember(&self, ssid: &str, requested: &str, matched: &str) {
        let mut location = self
            .locations
            .entry(ssid.to_string())
            .or_insert_with(|| SessionLocation {
                ssid: ssid.to_string(),
                ..Default::default()
            });
        if location.requested != requested || location.matched != matched {
            debug!("session {ssid}: '{requested}' now served by '{matched}'");
        }
        location.requested = requested.to_string();
        location.matched = matched.to_string();
    }

    /// Current location of a session, if it has resolved anything.
    pub fn location(&self, ssid: &str) -> Option<SessionLocation> {
        self.locations.get(ssid).map(|l| l.clone())
    }

    /// Drops all state of a closed session.
    pub fn remove_session(&self, ssid: &str) {
        self.locations.remove(ssid);
    }

    pub fn session_count(&self) -> usize {
        self.locations.len()
    }
}

/// What to do with a client that exceeds the rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateAction {
    /// Stall the offending read until the window rolls over.
    #[default]
    Delay,
    /// Drop the connection outright.
    Disconnect,
}

/// Width of the rolling rate-limit window.
pub const RATE_WINDOW: Duration = Duration::from_secs(2);

/// Per-connection rolling message counter.
///
/// A client sending faster than `limit` messages per window is
/// guaranteed to hit [`RateLimiter::admit`]'s over-limit branch before
/// the window ends; it is never silently starved of throttling.
pub struct RateLimiter {
    limit: u32,
    action: RateAction,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, action: RateAction) -> Self {
        Self::starting_at(limit, action, Instant::now())
    }

    /// Test seam: a limiter whose first window begins at `start`.
    pub fn starting_at(limit: u32, action: RateAction, start: Instant) -> Self {
        Self {
            limit,
            action,
            window_start: start,
            count: 0,
        }
    }

    /// Counts one inbound message at `now`.
    ///
    /// `None` admits the message; `Some(action)` means the limit was
    /// exceeded this window and the caller must apply the action. A
    /// zero limit disables limiting entirely.
    pub fn admit(&mut self, now: Instant) -> Option<RateAction> {
        if self.limit == 0 {
            return None;
        }
        if now.duration_since(self.window_start) >= RATE_WINDOW {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        if self.count > self.limit {
            Some(self.action)
        } else {
            None
        }
    }

    /// Time remaining until the current window rolls over; how long a
    /// [`RateAction::Delay`] should stall.
    pub fn window_remaining(&self, now: Instant) -> Duration {
        RATE_WINDOW.saturating_sub(now.duration_since(self.window_start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_core::protocol::ServiceNotice;

    fn directory_with(entries: &[(&str, &str, i32, i32, i32)]) -> Arc<ServiceDirectory> {
        let directory = Arc::new(ServiceDirectory::new());
        for (name, addr, weight, min_weight, max_weight) in entries {
            directory.apply_available(ServiceNotice {
                name: name.to_string(),
                addr: addr.to_string(),
                weight: *weight,
                min_weight: *min_weight,
                max_weight: *max_weight,
            });
        }
        directory
    }

    #[test]
    fn exact_name_match_wins_over_everything() {
        let directory = directory_with(&[
            ("room", "10.0.0.2:7001", 50, 0, 0),
            ("room-pool,room", "10.0.0.3:7001", 1, 0, 0),
        ]);
        let director = SessionDirector::new(directory, TieBreak::LowestKey);

        let entry = director.match_best_server("s1", "room").unwrap();
        assert_eq!(entry.addr, "10.0.0.2:7001");
    }

    #[test]
    fn under_min_weight_instance_is_preferred() {
        // An instance reporting weight below its own min_weight is
        // considered under-utilized and takes new sessions first.
        let directory = directory_with(&[
            ("a,room", "10.0.0.2:7001", 5, 10, 100),
            ("b,room", "10.0.0.3:7001", 2, 0, 100),
        ]);
        let director = SessionDirector::new(directory, TieBreak::LowestKey);

        let entry = director.match_best_server("s1", "room").unwrap();
        assert_eq!(entry.addr, "10.0.0.2:7001");
    }

    #[test]
    fn fresh_session_resolves_an_under_min_singleton() {
        let directory = directory_with(&[("pool,room", "10.0.0.2:7001", 5, 10, 100)]);
        let director = SessionDirector::new(directory, TieBreak::LowestKey);

        let entry = director.match_best_server("s1", "room").unwrap();
        assert_eq!(entry.name, "pool,room");
        let location = director.location("s1").unwrap();
        assert_eq!(location.requested, "room");
        assert_eq!(location.matched, "pool,room");
    }

    #[test]
    fn lowest_weight_wins_when_none_are_under_min() {
        let directory = directory_with(&[
            ("a,room", "10.0.0.2:7001", 9, 0, 0),
            ("b,room", "10.0.0.3:7001", 3, 0, 0),
        ]);
        let director = SessionDirector::new(directory, TieBreak::LowestKey);

        let entry = director.match_best_server("s1", "room").unwrap();
        assert_eq!(entry.addr, "10.0.0.3:7001");
    }

    #[test]
    fn max_weight_excludes_saturated_instances() {
        let directory = directory_with(&[
            ("a,room", "10.0.0.2:7001", 10, 0, 10),
            ("b,room", "10.0.0.3:7001", 40, 0, 0),
        ]);
        let director = SessionDirector::new(directory, TieBreak::LowestKey);

        let entry = director.match_best_server("s1", "room").unwrap();
        assert_eq!(entry.addr, "10.0.0.3:7001");

        let full = directory_with(&[("a,room", "10.0.0.2:7001", 10, 0, 10)]);
        let director = SessionDirector::new(full, TieBreak::LowestKey);
        assert!(director.match_best_server("s1", "room").is_none());
    }

    #[test]
    fn match_is_sticky_while_the_instance_lives() {
        let directory = directory_with(&[
            ("a,room", "10.0.0.2:7001", 8, 0, 0),
            ("b,room", "10.0.0.3:7001", 9, 0, 0),
        ]);
        let director = SessionDirector::new(directory.clone(), TieBreak::LowestKey);

        let first = director.match_best_server("s1", "room").unwrap();
        assert_eq!(first.name, "a,room");

        // A lighter alternative appears; the session stays put.
        directory.apply_available(ServiceNotice {
            name: "c,room".to_string(),
            addr: "10.0.0.4:7001".to_string(),
            weight: 1,
            min_weight: 0,
            max_weight: 0,
        });
        let again = director.match_best_server("s1", "room").unwrap();
        assert_eq!(again.name, "a,room");

        // The matched instance dies; the session re-resolves.
        directory.apply_unavailable("a,room");
        let moved = director.match_best_server("s1", "room").unwrap();
        assert_eq!(moved.name, "c,room");
    }

    #[test]
    fn requesting_a_different_name_re_resolves() {
        let directory = directory_with(&[
            ("a,room", "10.0.0.2:7001", 1, 0, 0),
            ("b,chat", "10.0.0.3:7001", 1, 0, 0),
        ]);
        let director = SessionDirector::new(directory, TieBreak::LowestKey);

        director.match_best_server("s1", "room").unwrap();
        let chat = director.match_best_server("s1", "chat").unwrap();
        assert_eq!(chat.name, "b,chat");
        assert_eq!(director.location("s1").unwrap().matched, "b,chat");
    }

    #[test]
    fn equal_weight_tie_follows_the_configured_rule() {
        for (tie_break, expected) in [
            (TieBreak::LowestKey, "a,room"),
            (TieBreak::HighestKey, "b,room"),
        ] {
            let directory = directory_with(&[
                ("a,room", "10.0.0.2:7001", 4, 0, 0),
                ("b,room", "10.0.0.3:7001", 4, 0, 0),
            ]);
            let director = SessionDirector::new(directory, tie_break);
            let entry = director.match_best_server("s1", "room").unwrap();
            assert_eq!(entry.name, expected);
        }
    }

    #[test]
    fn unknown_name_is_rejected_not_queued() {
        let directory = directory_with(&[("a,room", "10.0.0.2:7001", 1, 0, 0)]);
        let director = SessionDirector::new(directory, TieBreak::LowestKey);
        assert!(director.match_best_server("s1", "mail").is_none());
        assert!(director.location("s1").is_none());
    }

    #[test]
    fn session_removal_forgets_the_match() {
        let directory = directory_with(&[("a,room", "10.0.0.2:7001", 1, 0, 0)]);
        let director = SessionDirector::new(directory, TieBreak::LowestKey);

        director.match_best_server("s1", "room").unwrap();
        director.remove_session("s1");
        assert!(director.location("s1").is_none());
        assert_eq!(director.session_count(), 0);
    }

    #[test]
    fn over_limit_traffic_is_always_throttled() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(3, RateAction::Delay, start);

        // Three messages pass, everything after trips the limiter
        // until the window rolls over.
        for _ in 0..3 {
            assert_eq!(limiter.admit(start), None);
        }
        for i in 0..5 {
            let now = start + Duration::from_millis(100 * (i + 1));
            assert_eq!(limiter.admit(now), Some(RateAction::Delay));
        }

        let next_window = start + RATE_WINDOW;
        assert_eq!(limiter.admit(next_window), None);
    }

    #[test]
    fn disconnect_action_is_reported() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(1, RateAction::Disconnect, start);
        assert_eq!(limiter.admit(start), None);
        assert_eq!(limiter.admit(start), Some(RateAction::Disconnect));
    }

    #[test]
    fn zero_limit_disables_limiting() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(0, RateAction::Disconnect, start);
        for _ in 0..1000 {
            assert_eq!(limiter.admit(start), None);
        }
    }

    #[test]
    fn delay_is_bounded_by_the_window() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(1, RateAction::Delay, start);
        let now = start + Duration::from_millis(500);
        assert_eq!(limiter.window_remaining(now), Duration::from_millis(1500));
        assert_eq!(limiter.window_remaining(start + RATE_WINDOW), Duration::ZERO);
    }
}
