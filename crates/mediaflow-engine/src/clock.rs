// crates/mediaflow-engine/src/clock.rs
//
// Monotonic-derived PTS projection. `get`/`set` take an explicit serial so a
// caller can invalidate a clock's last reading by supplying a serial that no
// longer matches what `set`/`set_at` last recorded — callers that don't need
// that (every call site in this crate reads back `clock.serial()` right
// before calling `get`) always see a live value; the only NaN they'll
// observe is the one `Clock::new` starts with, before the first `set`.

use std::time::Instant;

/// Two clocks adopt each other's value when they disagree by more than this,
/// rather than drifting toward one another gradually.
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;

struct ClockState {
    pts: f64,
    pts_drift: f64,
    last_updated: Instant,
    speed: f64,
    paused: bool,
    serial: u64,
}

pub struct Clock {
    state: std::sync::Mutex<ClockState>,
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        let now = Instant::now();
        Clock {
            state: std::sync::Mutex::new(ClockState {
                pts: f64::NAN,
                pts_drift: 0.0,
                last_updated: now,
                speed: 1.0,
                paused: false,
                serial: 0,
            }),
            epoch: now,
        }
    }

    fn now_secs(&self, at: Instant) -> f64 {
        at.duration_since(self.epoch).as_secs_f64()
    }

    pub fn set_at(&self, pts: f64, serial: u64, time: Instant) {
        let mut g = self.state.lock().unwrap();
        g.pts = pts;
        g.last_updated = time;
        g.pts_drift = pts - self.now_secs(time);
        g.serial = serial;
    }

    pub fn set(&self, pts: f64, serial: u64) {
        self.set_at(pts, serial, Instant::now());
    }

    /// `NaN` when `upstream_serial` disagrees with the clock's recorded
    /// serial; the frozen `pts` while paused; otherwise the drift-projected
    /// wallclock value.
    pub fn get(&self, upstream_serial: u64) -> f64 {
        let g = self.state.lock().unwrap();
        if g.serial != upstream_serial {
            return f64::NAN;
        }
        if g.paused {
            return g.pts;
        }
        let now = self.now_secs(Instant::now());
        g.pts_drift + now - (now - self.now_secs(g.last_updated)) * (1.0 - g.speed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().unwrap().paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().unwrap().speed
    }

    pub fn serial(&self) -> u64 {
        self.state.lock().unwrap().serial
    }

    /// Adopts `other`'s value and serial when this clock is NaN, or the two
    /// disagree by more than `AV_NOSYNC_THRESHOLD` seconds.
    pub fn sync_slave_to(&self, this_serial: u64, other: &Clock, other_serial: u64) {
        let this_val = self.get(this_serial);
        let other_val = other.get(other_serial);
        if !other_val.is_finite() {
            return;
        }
        if !this_val.is_finite() || (this_val - other_val).abs() > AV_NOSYNC_THRESHOLD {
            self.set(other_val, other.serial());
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_mismatch_reads_nan() {
        let c = Clock::new();
        c.set(1.0, 5);
        assert!(c.get(6).is_nan());
        assert!(c.get(5).is_finite());
    }

    #[test]
    fn paused_clock_reads_frozen_pts() {
        let c = Clock::new();
        c.set(2.5, 1);
        c.set_paused(true);
        assert_eq!(c.get(1), 2.5);
    }

    #[test]
    fn sync_slave_adopts_other_when_nan() {
        let a = Clock::new();
        let b = Clock::new();
        b.set(3.0, 2);
        // `a` has never been set, serial 0 vs queried serial 1 -> NaN
        a.sync_slave_to(1, &b, 2);
        assert!((a.get(2) - 3.0).abs() < 0.01);
    }

    #[test]
    fn sync_slave_ignores_small_disagreement() {
        let a = Clock::new();
        let b = Clock::new();
        a.set(1.0, 1);
        b.set(1.05, 1);
        a.sync_slave_to(1, &b, 1);
        assert!((a.get(1) - 1.0).abs() < 0.1);
    }
}
