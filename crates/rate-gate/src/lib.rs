//! Per-origin request throttling.
//!
//! A gate is a pure admission check: it never grants or denies
//! authorization, it only throttles request attempts. Memory is bounded by
//! evicting the oldest-inserted origin when a new one would exceed
//! capacity.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use origin_key::OriginKey;
use thiserror::Error;

/// Admission refused: the origin retried inside its cooldown window.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limit exceeded for {origin}, try again later")]
pub struct RateLimited {
    pub origin: OriginKey,
    pub retry_after: Duration,
}

/// Bounded map of origin to last-accepted instant.
#[derive(Debug)]
pub struct RateGate {
    interval: Duration,
    max_entries: usize,
    last_accepted: HashMap<OriginKey, Instant>,
    insertion_order: VecDeque<OriginKey>,
}

impl RateGate {
    pub fn new(interval: Duration, max_entries: usize) -> Self {
        Self {
            interval,
            max_entries,
            last_accepted: HashMap::new(),
            insertion_order: VecDeque::new(),
        }
    }

    /// Admit or refuse a request attempt at `now`.
    ///
    /// A refused attempt does not refresh the stored timestamp, so a
    /// spamming origin cannot push its own window forward.
    pub fn check(&mut self, origin: &OriginKey, now: Instant) -> Result<(), RateLimited> {
        if let Some(last) = self.last_accepted.get(origin) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.interval {
                return Err(RateLimited {
                    origin: origin.clone(),
                    retry_after: self.interval - elapsed,
                });
            }
            self.last_accepted.insert(origin.clone(), now);
            return Ok(());
        }

        if self.last_accepted.len() >= self.max_entries {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.last_accepted.remove(&oldest);
            }
        }
        self.insertion_order.push_back(origin.clone());
        self.last_accepted.insert(origin.clone(), now);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }

    pub fn contains(&self, origin: &OriginKey) -> bool {
        self.last_accepted.contains_key(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use origin_key::normalize;

    fn key(n: usize) -> OriginKey {
        normalize(&format!("https://site{n}.example.com")).unwrap()
    }

    #[test]
    fn refuses_within_interval_and_admits_after() {
        let mut gate = RateGate::new(Duration::from_secs(3), 10);
        let start = Instant::now();
        let origin = key(0);

        gate.check(&origin, start).unwrap();
        let refused = gate
            .check(&origin, start + Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(refused.retry_after, Duration::from_secs(2));
        gate.check(&origin, start + Duration::from_secs(3)).unwrap();
    }

    #[test]
    fn refused_attempt_does_not_refresh_the_window() {
        let mut gate = RateGate::new(Duration::from_secs(3), 10);
        let start = Instant::now();
        let origin = key(0);

        gate.check(&origin, start).unwrap();
        assert!(gate.check(&origin, start + Duration::from_secs(2)).is_err());
        // measured from the accepted attempt, not the refused one
        gate.check(&origin, start + Duration::from_secs(3)).unwrap();
    }

    #[test]
    fn eleventh_origin_evicts_the_first_inserted() {
        let mut gate = RateGate::new(Duration::from_secs(3), 10);
        let start = Instant::now();

        for n in 0..11 {
            gate.check(&key(n), start).unwrap();
        }
        assert_eq!(gate.len(), 10);
        assert!(!gate.contains(&key(0)));
        assert!(gate.contains(&key(1)));
        assert!(gate.contains(&key(10)));
    }

    #[test]
    fn reaccepting_an_existing_origin_keeps_insertion_order() {
        let mut gate = RateGate::new(Duration::ZERO, 2);
        let start = Instant::now();

        gate.check(&key(0), start).unwrap();
        gate.check(&key(1), start).unwrap();
        // refresh key(0); it stays the oldest-inserted entry
        gate.check(&key(0), start + Duration::from_secs(1)).unwrap();
        gate.check(&key(2), start + Duration::from_secs(1)).unwrap();
        assert!(!gate.contains(&key(0)));
        assert!(gate.contains(&key(1)));
        assert!(gate.contains(&key(2)));
    }

    #[test]
    fn zero_interval_always_admits() {
        let mut gate = RateGate::new(Duration::ZERO, 10);
        let now = Instant::now();
        let origin = key(0);
        gate.check(&origin, now).unwrap();
        gate.check(&origin, now).unwrap();
    }
}
