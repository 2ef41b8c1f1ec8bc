use log::warn;
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::Mutex;
use std::time::Instant;

/// Slack under which two beat instants are treated as the same for visual
/// purposes. Tolerates ingestion jitter and float rounding; also the default
/// coalescing window for lane packing (see `subindex`).
pub const VISUAL_SLACK: Beats = Beats(0.01);

// ─── Beat-length ────────────────────────────────────────────────────────────

/// A length of logical time, measured in beats. May be infinite for
/// open-ended spans (a held note with no stop received yet).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Beats(pub f32);

impl Beats {
    pub fn forever() -> Self {
        Beats(f32::INFINITY)
    }

    pub fn beats(&self) -> f32 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0.0
    }

    pub fn is_infinite(&self) -> bool {
        self.0.is_infinite()
    }

    pub fn visually_zero(&self) -> bool {
        self.0.abs() < VISUAL_SLACK.0
    }
}

impl fmt::Display for Beats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "beats={:.2}", self.0)
    }
}

// ─── Beat-time ──────────────────────────────────────────────────────────────

/// A point on the logical timeline, in beats since the clock epoch.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Time(f32);

impl Time {
    pub fn on_beat(beat: f32) -> Self {
        Time(beat)
    }

    pub fn beat(&self) -> f32 {
        self.0
    }

    pub fn after(&self, other: Time) -> bool {
        self.0 > other.0
    }

    pub fn before(&self, other: Time) -> bool {
        self.0 < other.0
    }

    pub fn delta(&self, other: Time) -> Beats {
        Beats(self.0 - other.0)
    }

    pub fn visually_close(&self, other: Time) -> bool {
        self.delta(other).visually_zero()
    }

    /// Truncate down to a bucket boundary.
    pub fn truncate(&self, bucket: Beats) -> Time {
        Time((self.0 / bucket.0).floor() * bucket.0)
    }

    /// Integer bucket index. Buckets are keyed by this rather than by a
    /// floating-point boundary time, so map lookups are exact.
    pub fn bucket_index(&self, bucket: Beats) -> i64 {
        (self.0 / bucket.0).floor() as i64
    }

    /// Start time of the bucket with the given index.
    pub fn of_bucket(index: i64, bucket: Beats) -> Time {
        Time(index as f32 * bucket.0)
    }
}

impl Add<Beats> for Time {
    type Output = Time;
    fn add(self, d: Beats) -> Time {
        Time(self.0 + d.0)
    }
}

impl Sub<Beats> for Time {
    type Output = Time;
    fn sub(self, d: Beats) -> Time {
        Time(self.0 - d.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "beat={:.2}", self.0)
    }
}

// ─── Pulse: the shared beat clock ───────────────────────────────────────────

/// Converts wall-clock time into beat time. One instance is shared (via
/// `Arc`) by every trail that must stay phase-locked to the global tempo.
pub struct Pulse {
    inner: Mutex<PulseInner>,
}

struct PulseInner {
    /// Wall-clock instant at which the beat counter read `base_beat`.
    mark: Instant,
    base_beat: f32,
    bpm: f32,
    frozen: Option<Time>,
}

impl Pulse {
    pub fn new(bpm: f32) -> Self {
        Pulse {
            inner: Mutex::new(PulseInner {
                mark: Instant::now(),
                base_beat: 0.0,
                bpm,
                frozen: None,
            }),
        }
    }

    /// Current beat time. Monotonic between `sync` calls.
    pub fn now(&self) -> Time {
        let inner = self.inner.lock().unwrap();
        Time(inner.base_beat + inner.mark.elapsed().as_secs_f32() / 60.0 * inner.bpm)
    }

    pub fn bpm(&self) -> f32 {
        self.inner.lock().unwrap().bpm
    }

    /// Update the tempo, rebasing so the beat happening right now lands on a
    /// whole beat. The beat value stays continuous (up to rounding to the
    /// nearest beat); only the rate of advance changes.
    ///
    /// A non-positive tempo is rejected and leaves the clock unchanged.
    pub fn sync(&self, bpm: f32) {
        if bpm <= 0.0 {
            warn!("Rejecting sync to non-positive bpm {}", bpm);
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let old_beat = inner.base_beat + inner.mark.elapsed().as_secs_f32() / 60.0 * inner.bpm;
        inner.base_beat = old_beat.round();
        inner.mark = Instant::now();
        inner.bpm = bpm;
    }

    /// Freeze or unfreeze the drawing horizon. Stored span timestamps are
    /// unaffected; only `horizon()` reads the captured value.
    pub fn toggle_frozen(&self) {
        let frozen = {
            let inner = self.inner.lock().unwrap();
            match inner.frozen {
                Some(_) => None,
                None => Some(Time(
                    inner.base_beat + inner.mark.elapsed().as_secs_f32() / 60.0 * inner.bpm,
                )),
            }
        };
        self.inner.lock().unwrap().frozen = frozen;
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().unwrap().frozen.is_some()
    }

    /// Current (potentially frozen) time, for drawing and retention.
    pub fn horizon(&self) -> Time {
        let inner = self.inner.lock().unwrap();
        match inner.frozen {
            Some(t) => t,
            None => Time(inner.base_beat + inner.mark.elapsed().as_secs_f32() / 60.0 * inner.bpm),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn almost_equal(a: f32, b: f32) -> bool {
        (b - a).abs() < 1e-3
    }

    #[test]
    fn test_time_arithmetic() {
        let t = Time::on_beat(2.5);
        assert!(almost_equal((t + Beats(1.0)).beat(), 3.5));
        assert!(almost_equal((t - Beats(0.5)).beat(), 2.0));
        assert!(almost_equal(t.delta(Time::on_beat(1.0)).beats(), 1.5));
        assert!(t.after(Time::on_beat(2.0)));
        assert!(t.before(Time::on_beat(3.0)));
    }

    #[test]
    fn test_truncate_and_bucket_index() {
        let bucket = Beats(1.0);
        assert!(almost_equal(Time::on_beat(3.7).truncate(bucket).beat(), 3.0));
        assert_eq!(Time::on_beat(3.7).bucket_index(bucket), 3);
        assert_eq!(Time::on_beat(3.999).bucket_index(bucket), 3);
        assert_eq!(Time::on_beat(4.0).bucket_index(bucket), 4);
        assert!(almost_equal(Time::of_bucket(3, bucket).beat(), 3.0));

        let wide = Beats(8.0);
        assert_eq!(Time::on_beat(17.2).bucket_index(wide), 2);
        assert!(almost_equal(Time::on_beat(17.2).truncate(wide).beat(), 16.0));
    }

    #[test]
    fn test_visually_close() {
        assert!(Time::on_beat(1.0).visually_close(Time::on_beat(1.005)));
        assert!(!Time::on_beat(1.0).visually_close(Time::on_beat(1.1)));
        assert!(Beats::forever().is_infinite());
    }

    #[test]
    fn test_pulse_advances() {
        let pulse = Pulse::new(60_000.0); // 1000 beats per second
        let a = pulse.now();
        thread::sleep(StdDuration::from_millis(10));
        let b = pulse.now();
        assert!(b.after(a), "clock must advance: {} -> {}", a, b);
    }

    #[test]
    fn test_sync_is_continuous_up_to_rounding() {
        let pulse = Pulse::new(120.0);
        thread::sleep(StdDuration::from_millis(20));
        let before = pulse.now();
        pulse.sync(120.0);
        pulse.sync(120.0);
        let after = pulse.now();
        assert!(
            (after.beat() - before.beat()).abs() < 1.0,
            "sync moved the beat by {} (before={}, after={})",
            (after.beat() - before.beat()).abs(),
            before,
            after
        );
    }

    #[test]
    fn test_sync_changes_rate() {
        let pulse = Pulse::new(60.0);
        pulse.sync(240.0);
        assert!(almost_equal(pulse.bpm(), 240.0));
        let a = pulse.now();
        thread::sleep(StdDuration::from_millis(50));
        let advanced = pulse.now().delta(a).beats();
        // 240 bpm = 4 beats/s; 50ms ≈ 0.2 beats
        assert!(advanced > 0.1 && advanced < 0.5, "advanced {}", advanced);
    }

    #[test]
    fn test_sync_rejects_non_positive_bpm() {
        let pulse = Pulse::new(120.0);
        pulse.sync(0.0);
        assert!(almost_equal(pulse.bpm(), 120.0));
        pulse.sync(-10.0);
        assert!(almost_equal(pulse.bpm(), 120.0));
    }

    #[test]
    fn test_frozen_horizon_holds_still() {
        let pulse = Pulse::new(60_000.0);
        pulse.toggle_frozen();
        let h1 = pulse.horizon();
        thread::sleep(StdDuration::from_millis(10));
        let h2 = pulse.horizon();
        assert_eq!(h1, h2, "frozen horizon must not advance");
        assert!(pulse.now().after(h2), "now keeps advancing while frozen");

        pulse.toggle_frozen();
        thread::sleep(StdDuration::from_millis(5));
        assert!(pulse.horizon().after(h2), "unfrozen horizon advances again");
    }
}
