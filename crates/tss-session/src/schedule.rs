//! Deterministic session epochs.
//!
//! Sessions start on wall-clock boundaries of a fixed interval. The epoch of
//! a boundary is `floor(unix_time / interval)`, so every peer derives the same
//! session id for the same slot without coordination.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use crate::{Result, SessionError};

/// Epoch containing the instant `since_unix` after the Unix epoch.
pub fn epoch_at(since_unix: Duration, interval: Duration) -> u64 {
    let interval = interval.as_millis().max(1);
    u64::try_from(since_unix.as_millis() / interval).unwrap_or(u64::MAX)
}

/// Wall-clock start of `epoch`, as an offset from the Unix epoch.
pub fn epoch_start(epoch: u64, interval: Duration) -> Duration {
    let interval = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(epoch.saturating_mul(interval))
}

/// A scheduled slot: the epoch and its start on the monotonic clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub epoch: u64,
    pub start_at: Instant,
}

/// Yields consecutive slots, each `lead` ahead of its start.
///
/// The lead gives the session time to register its route before peers'
/// first messages arrive. A slot whose start is closer than `lead` is
/// skipped, as is any epoch already yielded.
#[derive(Debug)]
pub struct Scheduler {
    interval: Duration,
    lead: Duration,
    last: Option<u64>,
}

impl Scheduler {
    pub fn new(interval: Duration, lead: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(SessionError::Config("session interval must be positive".to_string()));
        }
        if lead >= interval {
            return Err(SessionError::Config(
                "grace window must be shorter than the session interval".to_string(),
            ));
        }
        Ok(Self {
            interval,
            lead,
            last: None,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The next slot to schedule given the current wall clock.
    pub fn next_slot(&mut self, now: SystemTime) -> Slot {
        let since_unix = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut epoch = epoch_at(since_unix, self.interval).saturating_add(1);
        if epoch_start(epoch, self.interval).saturating_sub(since_unix) < self.lead {
            epoch = epoch.saturating_add(1);
        }
        if let Some(last) = self.last {
            epoch = epoch.max(last.saturating_add(1));
        }
        self.last = Some(epoch);

        let wait = epoch_start(epoch, self.interval).saturating_sub(since_unix);
        Slot {
            epoch,
            start_at: Instant::now() + wait,
        }
    }

    /// Sleep until `lead` before the next slot, then return it.
    pub async fn tick(&mut self) -> Slot {
        let slot = self.next_slot(SystemTime::now());
        tokio::time::sleep_until(slot.start_at.checked_sub(self.lead).unwrap_or(slot.start_at)).await;
        tracing::debug!(epoch = slot.epoch, "session slot due");
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    #[test]
    fn test_epoch_arithmetic() {
        let interval = Duration::from_secs(60);
        assert_eq!(epoch_at(Duration::from_secs(0), interval), 0);
        assert_eq!(epoch_at(Duration::from_millis(59_999), interval), 0);
        assert_eq!(epoch_at(Duration::from_secs(60), interval), 1);
        assert_eq!(epoch_start(3, interval), Duration::from_secs(180));
    }

    #[test]
    fn test_same_slot_on_every_peer() {
        let mut a = Scheduler::new(Duration::from_secs(60), Duration::from_secs(5)).expect("a");
        let mut b = Scheduler::new(Duration::from_secs(60), Duration::from_secs(5)).expect("b");
        // Two peers with slightly different clocks inside one interval.
        assert_eq!(a.next_slot(at(120_100)).epoch, 3);
        assert_eq!(b.next_slot(at(121_900)).epoch, 3);
    }

    #[test]
    fn test_skips_slot_inside_lead() {
        let mut scheduler =
            Scheduler::new(Duration::from_secs(60), Duration::from_secs(5)).expect("scheduler");
        assert_eq!(scheduler.next_slot(at(177_000)).epoch, 4);
    }

    #[test]
    fn test_never_repeats_epoch() {
        let mut scheduler =
            Scheduler::new(Duration::from_secs(60), Duration::from_secs(5)).expect("scheduler");
        let first = scheduler.next_slot(at(10_000)).epoch;
        let second = scheduler.next_slot(at(10_500)).epoch;
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_rejects_bad_intervals() {
        assert!(Scheduler::new(Duration::ZERO, Duration::ZERO).is_err());
        assert!(Scheduler::new(Duration::from_secs(5), Duration::from_secs(5)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_returns_ahead_of_start() {
        let mut scheduler =
            Scheduler::new(Duration::from_millis(200), Duration::from_millis(50)).expect("scheduler");
        let slot = scheduler.tick().await;
        let now = Instant::now();
        assert!(slot.start_at >= now);
        assert!(slot.start_at - now <= Duration::from_millis(200));
    }
}
