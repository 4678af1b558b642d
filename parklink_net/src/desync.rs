// Client-side desync detection.
//
// The server periodically announces the tick it is at, together with its
// PRNG state and (every few announcements) a checksum of the whole world.
// The client keeps the first announcement for a tick it has not reached
// yet, and compares when its own simulation gets there. Both sides take
// the fingerprint at the start of the tick, before that tick's commands
// run. The retained fingerprint is discarded as soon as it is compared,
// match or not.
//
// A mismatch sets a sticky flag. `check` reports it once; later ticks do
// not report the same divergence again until `reset` (a new snapshot).

use parklink_protocol::Tick;

/// What the server reported for one tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub tick: Tick,
    pub prng_seed: u32,
    pub checksum: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct DesyncDetector {
    pending: Option<Fingerprint>,
    desynchronized: bool,
}

impl DesyncDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain a server fingerprint. Ignored while another one is waiting to
    /// be compared, or if the local simulation has already started its tick.
    pub fn record(&mut self, fingerprint: Fingerprint, local_tick: Tick) {
        if self.pending.is_some() || fingerprint.tick <= local_tick {
            return;
        }
        self.pending = Some(fingerprint);
    }

    /// Compare against the retained fingerprint if the local simulation is
    /// at its tick. `local_checksum` is only called when the server sent a
    /// checksum. Returns `true` exactly when a new divergence is detected.
    pub fn check(
        &mut self,
        local_tick: Tick,
        local_seed: u32,
        local_checksum: impl FnOnce() -> String,
    ) -> bool {
        if !self.pending.as_ref().is_some_and(|fp| fp.tick <= local_tick) {
            return false;
        }
        let Some(expected) = self.pending.take() else {
            return false;
        };
        if expected.tick < local_tick {
            // Overshot; nothing left to compare against.
            return false;
        }

        let seed_matches = expected.prng_seed == local_seed;
        let checksum_matches = match &expected.checksum {
            Some(theirs) => *theirs == local_checksum(),
            None => true,
        };
        if seed_matches && checksum_matches {
            return false;
        }
        if self.desynchronized {
            return false;
        }
        self.desynchronized = true;
        tracing::warn!(
            tick = expected.tick,
            server_seed = expected.prng_seed,
            local_seed,
            checksum_mismatch = !checksum_matches,
            "desynchronized from server"
        );
        true
    }

    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    pub fn pending(&self) -> Option<&Fingerprint> {
        self.pending.as_ref()
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.desynchronized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(tick: Tick, seed: u32, checksum: Option<&str>) -> Fingerprint {
        Fingerprint {
            tick,
            prng_seed: seed,
            checksum: checksum.map(str::to_string),
        }
    }

    #[test]
    fn matching_fingerprint_is_consumed_silently() {
        let mut detector = DesyncDetector::new();
        detector.record(fp(10, 42, Some("abc")), 8);
        assert!(!detector.check(9, 0, || unreachable!()));
        assert!(detector.pending().is_some());
        assert!(!detector.check(10, 42, || "abc".into()));
        assert!(detector.pending().is_none());
        assert!(!detector.is_desynchronized());
    }

    #[test]
    fn keeps_first_announcement_only() {
        let mut detector = DesyncDetector::new();
        detector.record(fp(10, 1, None), 5);
        detector.record(fp(11, 2, None), 5);
        assert_eq!(detector.pending().unwrap().tick, 10);
    }

    #[test]
    fn ignores_announcements_already_passed() {
        let mut detector = DesyncDetector::new();
        detector.record(fp(3, 1, None), 5);
        assert!(detector.pending().is_none());
        detector.record(fp(5, 1, None), 5);
        assert!(detector.pending().is_none());
    }

    #[test]
    fn divergence_is_flagged_once() {
        let mut detector = DesyncDetector::new();
        detector.record(fp(10, 1, None), 9);
        assert!(detector.check(10, 2, String::new));
        assert!(detector.is_desynchronized());

        detector.record(fp(11, 1, None), 10);
        assert!(!detector.check(11, 3, String::new));
        assert!(detector.is_desynchronized());
    }

    #[test]
    fn checksum_mismatch_counts() {
        let mut detector = DesyncDetector::new();
        detector.record(fp(4, 7, Some("aaaa")), 0);
        assert!(detector.check(4, 7, || "bbbb".into()));
    }

    #[test]
    fn reset_clears_flag() {
        let mut detector = DesyncDetector::new();
        detector.record(fp(1, 1, None), 0);
        assert!(detector.check(1, 0, String::new));
        detector.reset();
        assert!(!detector.is_desynchronized());
        detector.record(fp(2, 1, None), 1);
        assert!(detector.check(2, 0, String::new));
    }

    #[test]
    fn overshot_fingerprint_is_discarded() {
        let mut detector = DesyncDetector::new();
        detector.record(fp(5, 1, None), 4);
        assert!(!detector.check(6, 99, String::new));
        assert!(detector.pending().is_none());
    }
}
