//! Liveness: client-side miss counter driving heartbeat probes, server-side staleness sweep.

use crate::identity::PeerId;

/// Default unanswered heartbeats before the link is declared lost.
pub const DEFAULT_MAX_MISSED: u32 = 3;

/// What the monitor wants done at this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Not due yet, or stopped.
    Idle,
    /// Send a heartbeat request.
    Probe,
    /// Too many unanswered probes; the monitor has stopped itself.
    Exhausted,
}

/// Client heartbeat timer with a miss counter.
///
/// Each due period either reports exhaustion (`misses >= max_missed`) or counts a miss and asks
/// for a probe; each answered probe takes one miss back. A link answering within a period never
/// exhausts; a dead link exhausts on the period after the last allowed probe.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    period_ms: u64,
    max_missed: u32,
    misses: u32,
    next_due: Option<u64>,
}

impl HeartbeatMonitor {
    pub fn new(period_ms: u64, max_missed: u32) -> Self {
        Self {
            period_ms,
            max_missed,
            misses: 0,
            next_due: None,
        }
    }

    /// (Re)start with a clean miss count; first beat is one period from `now`.
    pub fn start(&mut self, now: u64) {
        self.misses = 0;
        self.next_due = Some(now.saturating_add(self.period_ms));
    }

    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    /// Advance to `now`. At most one beat per call: a host that stalls for several periods gets
    /// one probe, not a burst.
    pub fn poll(&mut self, now: u64) -> Beat {
        let Some(due) = self.next_due else {
            return Beat::Idle;
        };
        if now < due {
            return Beat::Idle;
        }
        if self.misses >= self.max_missed {
            self.next_due = None;
            return Beat::Exhausted;
        }
        self.misses += 1;
        self.next_due = Some(now.saturating_add(self.period_ms));
        Beat::Probe
    }

    /// A heartbeat response arrived.
    pub fn on_response(&mut self) {
        self.misses = self.misses.saturating_sub(1);
    }
}

/// Server sweep schedule. The first call only anchors the schedule.
#[derive(Debug, Clone)]
pub struct Sweep {
    interval_ms: u64,
    last_run: Option<u64>,
}

impl Sweep {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_run: None,
        }
    }

    /// True when a sweep should run at `now`; records the run.
    pub fn due(&mut self, now: u64) -> bool {
        match self.last_run {
            None => {
                self.last_run = Some(now);
                false
            }
            Some(last) if now.saturating_sub(last) >= self.interval_ms => {
                self.last_run = Some(now);
                true
            }
            Some(_) => false,
        }
    }
}

/// Peers whose last heartbeat is older than `stale_after_ms` at `now`.
pub fn stale_peers<'a, I>(last_heartbeats: I, now: u64, stale_after_ms: u64) -> Vec<PeerId>
where
    I: IntoIterator<Item = (&'a PeerId, u64)>,
{
    last_heartbeats
        .into_iter()
        .filter(|(_, last)| now.saturating_sub(*last) > stale_after_ms)
        .map(|(peer, _)| peer.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: u64 = 1000;

    #[test]
    fn idle_until_started() {
        let mut hb = HeartbeatMonitor::new(PERIOD, DEFAULT_MAX_MISSED);
        assert_eq!(hb.poll(10_000), Beat::Idle);
        hb.start(0);
        assert_eq!(hb.poll(999), Beat::Idle);
        assert_eq!(hb.poll(1000), Beat::Probe);
        assert_eq!(hb.misses(), 1);
    }

    #[test]
    fn three_unanswered_probes_then_exhausted() {
        let mut hb = HeartbeatMonitor::new(PERIOD, DEFAULT_MAX_MISSED);
        hb.start(0);
        assert_eq!(hb.poll(1000), Beat::Probe);
        assert_eq!(hb.poll(2000), Beat::Probe);
        assert_eq!(hb.poll(3000), Beat::Probe);
        assert_eq!(hb.poll(4000), Beat::Exhausted);
        assert!(!hb.is_running());
        assert_eq!(hb.poll(5000), Beat::Idle);
    }

    #[test]
    fn answered_probes_never_exhaust() {
        let mut hb = HeartbeatMonitor::new(PERIOD, DEFAULT_MAX_MISSED);
        hb.start(0);
        for i in 1..=500u64 {
            assert_eq!(hb.poll(i * PERIOD), Beat::Probe);
            hb.on_response();
        }
        assert_eq!(hb.misses(), 0);
    }

    #[test]
    fn late_answers_still_count() {
        let mut hb = HeartbeatMonitor::new(PERIOD, DEFAULT_MAX_MISSED);
        hb.start(0);
        assert_eq!(hb.poll(1000), Beat::Probe);
        assert_eq!(hb.poll(2000), Beat::Probe);
        hb.on_response();
        hb.on_response();
        assert_eq!(hb.poll(3000), Beat::Probe);
        assert_eq!(hb.poll(4000), Beat::Probe);
        assert_eq!(hb.misses(), 2);
    }

    #[test]
    fn stalled_host_gets_single_probe() {
        let mut hb = HeartbeatMonitor::new(PERIOD, DEFAULT_MAX_MISSED);
        hb.start(0);
        assert_eq!(hb.poll(10_000), Beat::Probe);
        assert_eq!(hb.poll(10_500), Beat::Idle);
        assert_eq!(hb.misses(), 1);
    }

    #[test]
    fn sweep_runs_on_interval() {
        let mut sweep = Sweep::new(2 * PERIOD);
        assert!(!sweep.due(0));
        assert!(!sweep.due(1999));
        assert!(sweep.due(2000));
        assert!(!sweep.due(3000));
        assert!(sweep.due(4100));
    }

    #[test]
    fn stale_peers_strictly_older() {
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let seen = vec![(&a, 0u64), (&b, 1000u64)];
        let stale = stale_peers(seen.iter().map(|(p, t)| (*p, *t)), 4000, 3 * PERIOD);
        assert_eq!(stale, vec![a.clone()]);
        let none = stale_peers(seen.iter().map(|(p, t)| (*p, *t)), 3000, 3 * PERIOD);
        assert!(none.is_empty());
    }
}
