//! Bucketed sliding-window failure counter.
//!
//! The window is split into [`HISTORY_BINS`] bins of `bin_len` seconds kept in a
//! ring. Registering an event either bumps the bin covering its timestamp,
//! rotates the ring forward (evicting expired bins), or restarts the window
//! when the event is far past everything seen so far. Work per call is bounded
//! by the bin count. The count is approximate to within one bin.
//!
//! The history has no locking of its own; its owner serialises access.

/// Number of bins in the ring.
pub const HISTORY_BINS: usize = 17;

/// Width of one counting bin.
pub type BinCount = u16;

/// Sliding-window failure history.
#[derive(Debug, Clone)]
pub struct FailHistory {
    bins: [BinCount; HISTORY_BINS],
    bin_len: i64,
    length: i64,
    start: i64,
    last_event: i64,
    cur_index: usize,
    events: u32,
}

impl FailHistory {
    /// An empty history covering `window` seconds.
    pub fn new(window: u32) -> Self {
        let bins = HISTORY_BINS as i64;
        let bin_len = ((i64::from(window) + bins - 1) / bins).max(1);
        Self {
            bins: [0; HISTORY_BINS],
            bin_len,
            length: bin_len * bins,
            start: 0,
            last_event: 0,
            cur_index: 0,
            events: 0,
        }
    }

    /// Events currently counted in the window.
    pub fn events(&self) -> u32 {
        self.events
    }

    /// Timestamp of the newest registered event (0 when none).
    pub fn last_event(&self) -> i64 {
        self.last_event
    }

    /// Register one event at `t`, returning the in-window total.
    pub fn register(&mut self, t: i64) -> u32 {
        self.register_n(t, 1)
    }

    /// Register `n` events at `t`, returning the in-window total.
    ///
    /// Events older than the window start are dropped.
    pub fn register_n(&mut self, t: i64, n: BinCount) -> u32 {
        if t < self.start {
            return self.events;
        }
        if t > self.last_event + self.length {
            self.restart_at(t, n);
            return self.events;
        }

        let added = if t < self.start + self.length {
            let offset = ((t - self.start) / self.bin_len) as usize;
            let idx = (offset + 1 + self.cur_index) % HISTORY_BINS;
            let before = self.bins[idx];
            self.bins[idx] = before.saturating_add(n);
            self.bins[idx] - before
        } else {
            while self.start + self.length <= t {
                self.start += self.bin_len;
                self.cur_index = (self.cur_index + 1) % HISTORY_BINS;
                self.events -= u32::from(self.bins[self.cur_index]);
                self.bins[self.cur_index] = 0;
            }
            self.bins[self.cur_index] = n;
            n
        };
        self.events += u32::from(added);
        self.last_event = self.last_event.max(t);
        self.events
    }

    /// The same events re-counted in a window of `window` seconds.
    ///
    /// Each bin is replayed at its end time (capped at the newest event), so
    /// a narrower window drops what now falls outside it and a wider one
    /// keeps everything.
    pub fn resized(&self, window: u32) -> Self {
        let mut out = Self::new(window);
        if self.events == 0 {
            return out;
        }
        for offset in 0..HISTORY_BINS {
            let count = self.bins[(offset + 1 + self.cur_index) % HISTORY_BINS];
            if count == 0 {
                continue;
            }
            let bin_end = self.start + (offset as i64 + 1) * self.bin_len - 1;
            out.register_n(bin_end.min(self.last_event), count);
        }
        out
    }

    /// Seed the window with `n` events at `t`; the newest bin ends after `t`.
    fn restart_at(&mut self, t: i64, n: BinCount) {
        self.bins = [0; HISTORY_BINS];
        self.bins[0] = n;
        self.cur_index = 0;
        self.events = u32::from(n);
        self.last_event = t;
        self.start = t + self.bin_len - t.rem_euclid(self.bin_len) - self.length;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const T0: i64 = 1_700_000_000;

    #[test]
    fn bin_length_rounds_up() {
        assert_eq!(FailHistory::new(120).bin_len, 8);
        assert_eq!(FailHistory::new(17).bin_len, 1);
        assert_eq!(FailHistory::new(0).bin_len, 1);
    }

    #[test]
    fn events_within_window_accumulate() {
        let mut h = FailHistory::new(120);
        assert_eq!(h.register(T0), 1);
        assert_eq!(h.register(T0 + 5), 2);
        assert_eq!(h.register(T0 + 9), 3);
        assert_eq!(h.last_event(), T0 + 9);
    }

    #[test]
    fn stale_events_are_dropped() {
        let mut h = FailHistory::new(120);
        h.register(T0);
        assert_eq!(h.register(T0 - 1_000), 1);
    }

    #[test]
    fn far_future_event_restarts_window() {
        let mut h = FailHistory::new(120);
        h.register(T0);
        h.register(T0 + 1);
        assert_eq!(h.register(T0 + 10_000), 1);
        assert!(h.start <= T0 + 10_000);
        assert!(T0 + 10_000 < h.start + h.length);
    }

    #[test]
    fn rotation_evicts_expired_bins() {
        let mut h = FailHistory::new(17);
        h.register(T0);
        h.register(T0 + 1);
        // one window later the first two bins have rotated out
        assert_eq!(h.register(T0 + 17), 2);
        assert_eq!(h.register(T0 + 18), 2);
    }

    #[test]
    fn wider_window_keeps_every_event() {
        let mut h = FailHistory::new(60);
        h.register(T0);
        h.register(T0 + 20);
        h.register(T0 + 40);
        let wide = h.resized(600);
        assert_eq!(wide.events(), 3);
        assert_eq!(wide.last_event(), T0 + 40);
    }

    #[test]
    fn narrower_window_drops_old_events() {
        let mut h = FailHistory::new(600);
        h.register(T0);
        h.register(T0 + 300);
        h.register(T0 + 301);
        let narrow = h.resized(60);
        assert_eq!(narrow.events(), 2);
        assert_eq!(narrow.last_event(), T0 + 301);
        assert_eq!(FailHistory::new(60).resized(600).events(), 0);
    }

    proptest! {
        #[test]
        fn sum_of_bins_matches_total(offsets in proptest::collection::vec(0i64..400, 1..200)) {
            let mut h = FailHistory::new(60);
            let mut t = T0;
            for step in offsets {
                t += step % 7;
                h.register(t);
                let sum: u32 = h.bins.iter().map(|b| u32::from(*b)).sum();
                prop_assert_eq!(sum, h.events());
            }
        }

        #[test]
        fn uniform_rate_stays_within_one_bin(window in 17u32..600, rate in 1i64..4, span in 1i64..3) {
            let mut h = FailHistory::new(window);
            let length = h.length;
            let end = T0 + length * (span + 1);
            let mut total = 0;
            let mut t = T0;
            while t < end {
                for _ in 0..rate {
                    total = h.register(t);
                }
                t += 1;
            }
            let expected = rate * length;
            let slack = rate * h.bin_len;
            prop_assert!((i64::from(total) - expected).abs() <= slack,
                "total {} expected {} slack {}", total, expected, slack);
        }
    }
}
