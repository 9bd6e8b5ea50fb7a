// crates/mediaflow-engine/src/engine.rs
//
// The public lifecycle facade: instance_create/prepare/play/pause/destroy.
// Owns every queue, clock and thread handle the pipeline spawns and is the
// only place that joins them back in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use ffmpeg_the_third as ffmpeg;

use mediaflow_types::{EngineError, EngineParams, MessageSink, SampleFormat};

use crate::audio_sink::{fetch_planar, fetch_samples};
use crate::clock::Clock;
use crate::decoder::VideoFrameContent;
use crate::reader::{open_streams, run_reader_loop, AudioStreamHandles, ReaderTarget, VideoStreamHandles};
use crate::scheduler::{DisplaySink, Scheduler};
use crate::signal::Signal;

static RUNTIME_INIT: std::sync::Once = std::sync::Once::new();

fn init_runtime_once() {
    RUNTIME_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            eprintln!("[engine] ffmpeg init failed: {e}");
        }
    });
}

struct ClockSet {
    video: Arc<Clock>,
    audio: Arc<Clock>,
    external: Arc<Clock>,
}

struct Threads {
    reader: Option<std::thread::JoinHandle<()>>,
    scheduler: Option<std::thread::JoinHandle<()>>,
}

/// One open media session. `prepare` spawns the reader/decoder/refresh
/// threads; `destroy` tears all of it back down. Every other operation is a
/// cheap atomic flip or a non-blocking queue peek.
pub struct Engine {
    params: EngineParams,
    paused: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    clocks: ClockSet,
    audio: Mutex<Option<AudioStreamHandles>>,
    video: Mutex<Option<VideoStreamHandles>>,
    threads: Mutex<Threads>,
    display: Mutex<Option<Arc<dyn DisplaySink>>>,
    destroyed: AtomicBool,
}

impl Engine {
    /// Captures the URL, callbacks and capability masks. Initializes the
    /// underlying runtime once per process; safe to call from multiple
    /// threads concurrently.
    pub fn instance_create(params: EngineParams) -> Arc<Engine> {
        init_runtime_once();
        Arc::new(Engine {
            params,
            paused: Arc::new(AtomicBool::new(false)),
            abort: Arc::new(AtomicBool::new(false)),
            clocks: ClockSet {
                video: Arc::new(Clock::new()),
                audio: Arc::new(Clock::new()),
                external: Arc::new(Clock::new()),
            },
            audio: Mutex::new(None),
            video: Mutex::new(None),
            threads: Mutex::new(Threads { reader: None, scheduler: None }),
            display: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn set_display_func(&self, sink: Arc<dyn DisplaySink>) {
        *self.display.lock().unwrap() = Some(sink);
    }

    /// Opens the input, selects streams, spawns one decoder thread per
    /// selected stream plus the reader and (if a video stream was found) the
    /// refresh thread. Fails without leaving any thread running.
    pub fn prepare(&self) -> anyhow::Result<()> {
        let mut ictx = ffmpeg::format::input(&self.params.url)
            .map_err(|e| EngineError::InputOpenFailure(e.to_string()))
            .context("opening input")?;

        let reader_wake = Arc::new(Signal::new());
        let opened = open_streams(
            &mut ictx,
            self.params.supported_sample_formats,
            self.params.supported_sample_rate,
            self.params.supported_pixel_formats,
            self.params.message_sink.clone(),
            reader_wake.clone(),
        )
        .context("opening streams")?;

        if opened.audio.is_none() && opened.video.is_none() {
            return Err(EngineError::StreamDiscoveryFailure("no playable audio or video stream".into()).into());
        }

        let audio_target: Option<ReaderTarget> = opened.audio.as_ref().map(ReaderTarget::from);
        let video_target: Option<ReaderTarget> = opened.video.as_ref().map(ReaderTarget::from);

        let scheduler_handle = if let Some(video) = &opened.video {
            let audio_clock = opened.audio.as_ref().map(|_| self.clocks.audio.clone());

            let display = self
                .display
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Arc::new(|_: &VideoFrameContent| {}) as Arc<dyn DisplaySink>);

            let scheduler = Scheduler::new(
                video.frame_queue.clone(),
                self.clocks.video.clone(),
                self.clocks.external.clone(),
                audio_clock,
                display,
                self.params.message_sink.clone(),
                self.paused.clone(),
                self.abort.clone(),
                opened.max_frame_duration,
            );
            Some(std::thread::spawn(move || scheduler.run()))
        } else {
            None
        };

        let audio_sink = self.params.message_sink.clone();
        let reader_handle = std::thread::spawn(move || {
            run_reader_loop(ictx, &audio_target, &video_target, reader_wake, audio_sink);
        });

        *self.audio.lock().unwrap() = opened.audio;
        *self.video.lock().unwrap() = opened.video;
        let mut threads = self.threads.lock().unwrap();
        threads.reader = Some(reader_handle);
        threads.scheduler = scheduler_handle;
        Ok(())
    }

    pub fn play(&self) {
        self.set_paused(false);
    }

    pub fn pause(&self) {
        self.set_paused(true);
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
        self.clocks.video.set_paused(paused);
        self.clocks.audio.set_paused(paused);
        self.clocks.external.set_paused(paused);
    }

    pub fn fetch_samples(&self, format: SampleFormat, out_buf: &mut [u8]) -> usize {
        let audio = self.audio.lock().unwrap();
        match audio.as_ref() {
            Some(a) => fetch_samples(
                &a.frame_queue,
                &self.clocks.audio,
                &self.clocks.external,
                &self.paused,
                self.params.message_sink.as_ref(),
                format,
                out_buf,
            ),
            None => 0,
        }
    }

    pub fn fetch_planar(&self, format: SampleFormat, l_buf: &mut [u8], r_buf: Option<&mut [u8]>) -> (usize, usize) {
        let audio = self.audio.lock().unwrap();
        match audio.as_ref() {
            Some(a) => fetch_planar(
                &a.frame_queue,
                &self.clocks.audio,
                &self.clocks.external,
                &self.paused,
                self.params.message_sink.as_ref(),
                format,
                l_buf,
                r_buf,
            ),
            None => (0, 0),
        }
    }

    /// Aborts every queue, joins every thread this instance spawned, releases
    /// whatever frame the scheduler was last holding. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.abort.store(true, Ordering::Relaxed);

        if let Some(a) = self.audio.lock().unwrap().take() {
            a.queue.abort();
            let _ = a.decoder_thread.join();
        }
        if let Some(v) = self.video.lock().unwrap().take() {
            v.queue.abort();
            let _ = v.decoder_thread.join();
        }

        let mut threads = self.threads.lock().unwrap();
        if let Some(h) = threads.reader.take() {
            let _ = h.join();
        }
        if let Some(h) = threads.scheduler.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaflow_types::EngineMessage;

    fn noop_sink() -> Arc<dyn MessageSink> {
        Arc::new(|_msg: EngineMessage| {})
    }

    #[test]
    fn play_pause_round_trip_leaves_state_equal() {
        let params = EngineParams {
            url: String::new(),
            message_sink: noop_sink(),
            supported_sample_formats: mediaflow_types::SampleFormatMask::empty(),
            supported_sample_rate: 44_100,
            supported_pixel_formats: mediaflow_types::PixelFormatMask::empty(),
        };
        let engine = Engine::instance_create(params);
        assert!(!engine.paused.load(Ordering::Relaxed));
        engine.pause();
        assert!(engine.paused.load(Ordering::Relaxed));
        engine.play();
        assert!(!engine.paused.load(Ordering::Relaxed));
        engine.pause();
        engine.play();
        assert!(!engine.paused.load(Ordering::Relaxed));
    }

    #[test]
    fn destroy_twice_is_a_no_op() {
        let params = EngineParams {
            url: String::new(),
            message_sink: noop_sink(),
            supported_sample_formats: mediaflow_types::SampleFormatMask::empty(),
            supported_sample_rate: 44_100,
            supported_pixel_formats: mediaflow_types::PixelFormatMask::empty(),
        };
        let engine = Engine::instance_create(params);
        engine.destroy();
        engine.destroy();
        assert!(engine.destroyed.load(Ordering::Relaxed));
    }
}
