//! Active Expiry
//!
//! Lazy expiry alone never reclaims a key that is not accessed again. The
//! cron therefore calls [`Keyspace::active_expire_cycle`], which walks each
//! database's expiry index with the table's scan cursor, a few keys at a
//! time, and deletes whatever is past its deadline.
//!
//! ## Adaptive effort
//!
//! A database keeps being sampled while more than `stale_threshold` of the
//! sampled keys turn out to be expired, and is left alone once the expired
//! share drops below it. The whole cycle stops when its time budget is
//! spent; the next call resumes at the database and cursor where this one
//! stopped.

use super::keyspace::Keyspace;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tuning for the active expiry cycle.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Keys sampled per round on one database.
    pub keys_per_loop: usize,

    /// Keep sampling a database while this fraction of sampled keys was
    /// expired.
    pub stale_threshold: f64,

    /// Share of each cron period the cycle may use, in percent.
    pub time_percent: u32,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            keys_per_loop: 20,
            stale_threshold: 0.25,
            time_percent: 25,
        }
    }
}

impl ExpiryConfig {
    /// Time budget of one cycle at `hz` cron runs per second.
    pub fn budget(&self, hz: u32) -> Duration {
        let period_us = 1_000_000 / u64::from(hz.max(1));
        Duration::from_micros(period_us * u64::from(self.time_percent) / 100)
    }
}

impl Keyspace {
    /// Removes expired keys until `budget` is spent or no database has
    /// enough of them left to be worth sampling.
    ///
    /// # Returns
    ///
    /// Number of keys removed. They are queued for [`Keyspace::take_expired`].
    pub fn active_expire_cycle(&mut self, config: &ExpiryConfig, budget: Duration) -> usize {
        if self.is_loading() {
            return 0;
        }
        let start = Instant::now();
        let db_count = self.db_count();
        let mut removed = 0;

        for _ in 0..db_count {
            let id = self.expire_db % db_count;
            self.expire_db = (id + 1) % db_count;

            loop {
                let (sampled, expired) = self.expire_round(id, config.keys_per_loop);
                removed += expired;

                if start.elapsed() > budget {
                    debug!(
                        removed,
                        elapsed_us = start.elapsed().as_micros() as u64,
                        "Active expiry hit time limit"
                    );
                    return removed;
                }
                if sampled == 0 || (expired as f64) <= sampled as f64 * config.stale_threshold {
                    break;
                }
            }
        }

        if removed > 0 {
            debug!(removed, keys_remaining = self.len(), "Expired keys cleaned up");
        }
        removed
    }

    /// Samples about `keys` entries of `id`'s expiry index.
    ///
    /// # Returns
    ///
    /// `(sampled, expired)`.
    fn expire_round(&mut self, id: usize, keys: usize) -> (usize, usize) {
        let now = self.now_ms();
        let Some(db) = self.db_mut(id) else {
            return (0, 0);
        };
        if db.expires.is_empty() {
            return (0, 0);
        }

        let mut sampled = 0;
        let mut stale: Vec<Bytes> = Vec::new();
        let mut cursor = db.expire_cursor;
        // Buckets may be empty; bound the walk at four times the sample size.
        let mut buckets = keys.max(1) * 4;
        loop {
            cursor = db.expires.scan(cursor, |key, &when| {
                sampled += 1;
                if when <= now {
                    stale.push(key.clone());
                }
            });
            buckets -= 1;
            if cursor == 0 || sampled >= keys || buckets == 0 {
                break;
            }
        }
        db.expire_cursor = cursor;

        for key in &stale {
            db.dict.remove(key);
            db.expires.remove(key);
        }
        let expired = stale.len();
        for key in stale {
            self.note_expired(id, key);
        }
        (sampled, expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::ResizePolicy;
    use crate::reactor::ManualClock;
    use crate::storage::Value;

    fn populated(expiring: usize, persistent: usize) -> (Keyspace, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let mut ks = Keyspace::with_clock(2, ResizePolicy::default(), clock.clone());
        for i in 0..expiring {
            let key = Bytes::from(format!("tmp:{}", i));
            ks.set(0, key.clone(), Value::Str(Bytes::from("v")));
            ks.set_expire(0, &key, 1_000_050);
        }
        for i in 0..persistent {
            ks.set(1, Bytes::from(format!("keep:{}", i)), Value::Str(Bytes::from("v")));
        }
        (ks, clock)
    }

    #[test]
    fn test_cycle_removes_only_expired_keys() {
        let (mut ks, clock) = populated(500, 10);
        let config = ExpiryConfig::default();

        assert_eq!(ks.active_expire_cycle(&config, Duration::from_secs(1)), 0);

        clock.advance(100);
        let mut removed = 0;
        for _ in 0..100 {
            removed += ks.active_expire_cycle(&config, Duration::from_secs(1));
            if ks.db(0).unwrap().is_empty() {
                break;
            }
        }
        assert_eq!(removed, 500);
        assert_eq!(ks.len(), 10);
        assert_eq!(ks.take_expired().len(), 500);
        assert_eq!(ks.stats().expired_keys, 500);
    }

    #[test]
    fn test_cycle_skipped_while_loading() {
        let (mut ks, clock) = populated(10, 0);
        clock.advance(100);
        ks.set_loading(true);
        assert_eq!(ks.active_expire_cycle(&ExpiryConfig::default(), Duration::from_secs(1)), 0);
        assert_eq!(ks.len(), 10);
    }

    #[test]
    fn test_budget_from_hz() {
        let config = ExpiryConfig::default();
        assert_eq!(config.budget(10), Duration::from_millis(25));
        assert_eq!(config.budget(100), Duration::from_micros(2500));
    }
}
