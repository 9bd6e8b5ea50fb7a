// crates/mediaflow-engine/src/scheduler.rs
//
// Video refresh loop. Runs on its own thread with a 10ms base period,
// computing target delay from the master clock, dropping/duplicating frames
// as needed, and handing the chosen frame to the display callback.
//
// "Currently displayed frame" uses the same shared-reference semantics as an
// AVFrame clone (a cheap refcount bump, not a data copy): the scheduler holds
// one strong reference and swaps it on every display.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mediaflow_types::{EngineMessage, MessageSink};

use crate::clock::Clock;
use crate::decoder::VideoFrameContent;
use crate::frame_queue::FrameQueue;

const REFRESH_PERIOD: Duration = Duration::from_millis(10);
const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;

pub trait DisplaySink: Send + Sync {
    fn display(&self, frame: &VideoFrameContent);
}

impl<F: Fn(&VideoFrameContent) + Send + Sync> DisplaySink for F {
    fn display(&self, frame: &VideoFrameContent) {
        self(frame)
    }
}

/// `b.pts - a.pts` when same serial and the result is finite, positive and
/// within `max_frame_duration`; otherwise falls back to `a.duration`. A
/// serial mismatch (a new play sequence) returns zero.
pub fn vp_duration(a_pts: f64, a_duration: f64, a_serial: u64, b_pts: f64, b_serial: u64, max_frame_duration: f64) -> f64 {
    if a_serial != b_serial {
        return 0.0;
    }
    let d = b_pts - a_pts;
    if d.is_finite() && d > 0.0 && d <= max_frame_duration {
        d
    } else {
        a_duration
    }
}

/// Returns a value in `[0, 2*delay + |diff|]` on a finite `diff`; unchanged
/// `delay` when `diff` is NaN or exceeds `max_frame_duration`.
pub fn compute_target_delay(delay: f64, vid_clock: f64, master_clock: f64, max_frame_duration: f64) -> f64 {
    let diff = vid_clock - master_clock;
    let sync_threshold = delay.clamp(AV_SYNC_THRESHOLD_MIN, AV_SYNC_THRESHOLD_MAX);

    if diff.is_finite() && max_frame_duration.is_finite() && diff.abs() < max_frame_duration {
        if diff <= -sync_threshold {
            return (delay + diff).max(0.0);
        } else if diff >= sync_threshold && delay > 0.1 {
            return delay + diff;
        } else if diff >= sync_threshold {
            return 2.0 * delay;
        }
    }
    delay
}

pub struct Scheduler {
    frame_queue: Arc<FrameQueue<VideoFrameContent>>,
    video_clock: Arc<Clock>,
    external_clock: Arc<Clock>,
    audio_clock: Option<Arc<Clock>>,
    display: Arc<dyn DisplaySink>,
    message_sink: Arc<dyn MessageSink>,
    paused: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    max_frame_duration: f64,
    frame_timer: Mutex<Instant>,
    currently_displayed: Mutex<Option<VideoFrameContent>>,
    /// (pts, duration, serial) of the most recently displayed frame — this
    /// queue's analogue of ffplay's `peek_last`, tracked explicitly since this
    /// FrameQueue retires a slot the instant `next()` is called rather than
    /// keeping a "shown but not yet retired" slot around.
    last_shown: Mutex<(f64, f64, u64)>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frame_queue: Arc<FrameQueue<VideoFrameContent>>,
        video_clock: Arc<Clock>,
        external_clock: Arc<Clock>,
        audio_clock: Option<Arc<Clock>>,
        display: Arc<dyn DisplaySink>,
        message_sink: Arc<dyn MessageSink>,
        paused: Arc<AtomicBool>,
        abort: Arc<AtomicBool>,
        max_frame_duration: f64,
    ) -> Self {
        Scheduler {
            frame_queue,
            video_clock,
            external_clock,
            audio_clock,
            display,
            message_sink,
            paused,
            abort,
            max_frame_duration,
            frame_timer: Mutex::new(Instant::now()),
            currently_displayed: Mutex::new(None),
            last_shown: Mutex::new((f64::NAN, 0.0, 0)),
        }
    }

    /// Audio master when an audio stream exists (this scheduler only runs
    /// when a video stream exists, so the remaining choice is video master,
    /// never external — external only applies to a video-only engine with
    /// no scheduler driving it at all).
    fn master_clock_value(&self) -> f64 {
        match &self.audio_clock {
            Some(clock) => clock.get(clock.serial()),
            None => self.video_clock.get(self.video_clock.serial()),
        }
    }

    /// Runs until `abort` is set. Intended to be the body of the dedicated
    /// refresh thread.
    pub fn run(&self) {
        let mut remaining = REFRESH_PERIOD;
        while !self.abort.load(Ordering::Relaxed) {
            std::thread::sleep(remaining.min(REFRESH_PERIOD));
            remaining = REFRESH_PERIOD;
            if self.paused.load(Ordering::Relaxed) {
                continue;
            }
            remaining = self.refresh_once(remaining);
        }
    }

    fn refresh_once(&self, mut remaining: Duration) -> Duration {
        loop {
            let Some(cur_index) = self.maybe_peek_readable() else { return remaining };

            let (last_pts, last_duration, last_serial) = *self.last_shown.lock().unwrap();
            let (cur_pts, cur_duration, cur_serial) =
                self.frame_queue.with_readable(cur_index, |f| (f.pts, f.duration, f.serial));

            if last_serial != cur_serial {
                *self.frame_timer.lock().unwrap() = Instant::now();
            }

            let last_frame_duration = vp_duration(last_pts, last_duration, last_serial, cur_pts, cur_serial, self.max_frame_duration);
            let master = self.master_clock_value();
            let video_now = self.video_clock.get(self.video_clock.serial());
            let delay = compute_target_delay(last_frame_duration, video_now, master, self.max_frame_duration);

            let now = Instant::now();
            let timer = *self.frame_timer.lock().unwrap();
            if now < timer + Duration::from_secs_f64(delay.max(0.0)) {
                let wait = (timer + Duration::from_secs_f64(delay.max(0.0))) - now;
                remaining = remaining.min(wait);
                return remaining;
            }

            {
                let mut t = self.frame_timer.lock().unwrap();
                *t += Duration::from_secs_f64(delay.max(0.0));
                if delay > 0.0 && now.saturating_duration_since(*t) > Duration::from_millis(100) {
                    *t = now;
                }
            }

            if cur_pts.is_finite() {
                self.video_clock.set(cur_pts, cur_serial);
                self.external_clock.sync_slave_to(self.external_clock.serial(), &self.video_clock, cur_serial);
            }

            if self.frame_queue.nb_remaining() > 1 {
                let next_index = self.frame_queue.peek_next_index();
                let (next_pts, next_serial) = self.frame_queue.with_readable(next_index, |f| (f.pts, f.serial));
                let drop_after = vp_duration(cur_pts, cur_duration, cur_serial, next_pts, next_serial, self.max_frame_duration);
                if now.duration_since(timer).as_secs_f64() > drop_after {
                    self.frame_queue.next();
                    continue; // retry the whole step, per spec
                }
            }

            self.frame_queue.with_readable(cur_index, |f| {
                let mut displayed = self.currently_displayed.lock().unwrap();
                *displayed = Some(VideoFrameContent {
                    frame: f.content.frame.clone(),
                    format: f.content.format,
                    width: f.content.width,
                    height: f.content.height,
                });
            });
            self.frame_queue.next();
            *self.last_shown.lock().unwrap() = (cur_pts, cur_duration, cur_serial);

            if let Some(displayed) = self.currently_displayed.lock().unwrap().as_ref() {
                self.display.display(displayed);
            }
            return remaining;
        }
    }

    fn maybe_peek_readable(&self) -> Option<usize> {
        if self.frame_queue.nb_remaining() == 0 {
            self.message_sink.post(EngineMessage::FrameQueueIsEmpty);
            return None;
        }
        self.frame_queue.peek_readable(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vp_duration_returns_diff_on_matching_serial() {
        let d = vp_duration(1.0, 0.5, 7, 1.2, 7, 10.0);
        assert!((d - 0.2).abs() < 1e-9);
    }

    #[test]
    fn vp_duration_falls_back_on_serial_mismatch() {
        assert_eq!(vp_duration(1.0, 0.5, 7, 1.2, 8, 10.0), 0.0);
    }

    #[test]
    fn vp_duration_never_negative() {
        assert!(vp_duration(2.0, 0.5, 1, 1.0, 1, 10.0) >= 0.0);
    }

    #[test]
    fn compute_target_delay_catches_up_when_video_behind() {
        let delay = compute_target_delay(0.04, 0.0, 0.5, 10.0);
        assert_eq!(delay, 0.0);
    }

    #[test]
    fn compute_target_delay_doubles_when_video_ahead() {
        let delay = compute_target_delay(0.04, 0.3, 0.0, 10.0);
        assert!((delay - 0.08).abs() < 1e-9);
    }

    #[test]
    fn compute_target_delay_bounded_by_invariant_four() {
        let d = 0.04;
        let diff = 0.3_f64;
        let delay = compute_target_delay(d, diff, 0.0, 10.0);
        assert!(delay >= 0.0 && delay <= 2.0 * d + diff.abs());
    }

    #[test]
    fn compute_target_delay_nan_diff_short_circuits() {
        let delay = compute_target_delay(0.04, f64::NAN, 0.0, 10.0);
        assert_eq!(delay, 0.04);
    }
}
