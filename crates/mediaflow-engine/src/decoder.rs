// crates/mediaflow-engine/src/decoder.rs
//
// Per-stream decode loop: drain buffered frames from the codec, pull one
// packet with get_or_buffer when empty, submit it, push every frame the
// codec emits (through the resampler/scaler if one was negotiated) onto the
// frame queue. Exits when the upstream packet queue is aborted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::decoder;
use ffmpeg::software::resampling::Context as SwrContext;
use ffmpeg::software::scaling::context::Context as SwsContext;

use mediaflow_types::{PixelFormat, SampleFormat};

use crate::frame_queue::FrameQueue;
use crate::negotiate::{from_ffmpeg_pixel, from_ffmpeg_sample};
use crate::packet_queue::{DequeuedPacket, PacketQueue};
use crate::signal::Signal;

pub struct AudioFrameContent {
    pub frame: ffmpeg::util::frame::audio::Audio,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
}

impl Default for AudioFrameContent {
    fn default() -> Self {
        AudioFrameContent {
            frame: ffmpeg::util::frame::audio::Audio::empty(),
            sample_rate: 0,
            channels: 0,
            format: SampleFormat::FltP,
        }
    }
}

pub struct VideoFrameContent {
    pub frame: ffmpeg::util::frame::video::Video,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl Default for VideoFrameContent {
    fn default() -> Self {
        VideoFrameContent {
            frame: ffmpeg::util::frame::video::Video::empty(),
            format: PixelFormat::Yuv420p,
            width: 0,
            height: 0,
        }
    }
}

/// Shared per-decoder bookkeeping the scheduler/reader peek at from other
/// threads: whether this decoder has observed EOF on its current serial.
pub struct DecoderState {
    finished_serial: AtomicU64,
}

impl DecoderState {
    pub fn new() -> Self {
        DecoderState { finished_serial: AtomicU64::new(u64::MAX) }
    }

    pub fn mark_finished(&self, pkt_serial: u64) {
        self.finished_serial.store(pkt_serial, Ordering::Release);
    }

    pub fn is_finished(&self, pkt_serial: u64) -> bool {
        self.finished_serial.load(Ordering::Acquire) == pkt_serial
    }
}

impl Default for DecoderState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls one packet, logging and continuing on a codec protocol violation
/// rather than treating it as fatal, per the spec's DecoderProtocol recovery
/// policy.
fn pull_packet(upstream: &PacketQueue, reader_wake: &Signal) -> Option<DequeuedPacket> {
    if upstream.packet_count() == 0 {
        reader_wake.notify();
    }
    match upstream.get_or_buffer() {
        Ok(pkt) => Some(pkt),
        Err(_aborted) => None,
    }
}

pub fn run_audio_decoder(
    upstream: Arc<PacketQueue>,
    mut codec: decoder::Audio,
    mut resampler: Option<SwrContext>,
    format: SampleFormat,
    frame_queue: Arc<FrameQueue<AudioFrameContent>>,
    time_base: (i32, i32),
    state: Arc<DecoderState>,
    reader_wake: Arc<Signal>,
) {
    let tb = time_base.0 as f64 / time_base.1 as f64;
    let mut frame_serial: u64 = 0;

    'outer: loop {
        let mut decoded = ffmpeg::util::frame::audio::Audio::empty();
        while codec.receive_frame(&mut decoded).is_ok() {
            emit_audio_frame(&decoded, &mut resampler, format, tb, &frame_queue, &mut frame_serial);
            decoded = ffmpeg::util::frame::audio::Audio::empty();
        }

        let pkt = match pull_packet(&upstream, &reader_wake) {
            Some(p) => p,
            None => break 'outer,
        };

        match pkt.packet {
            Some(packet) => {
                if let Err(e) = codec.send_packet(&packet) {
                    eprintln!("[decoder:audio] send_packet back-pressure: {e}");
                }
            }
            None => {
                // Null sentinel: flush then observe EOF for this stream.
                let _ = codec.send_eof();
                state.mark_finished(pkt.serial);
                let mut flushed = ffmpeg::util::frame::audio::Audio::empty();
                while codec.receive_frame(&mut flushed).is_ok() {
                    emit_audio_frame(&flushed, &mut resampler, format, tb, &frame_queue, &mut frame_serial);
                    flushed = ffmpeg::util::frame::audio::Audio::empty();
                }
                break 'outer;
            }
        }
    }
}

fn emit_audio_frame(
    decoded: &ffmpeg::util::frame::audio::Audio,
    resampler: &mut Option<SwrContext>,
    format: SampleFormat,
    time_base: f64,
    frame_queue: &FrameQueue<AudioFrameContent>,
    frame_serial: &mut u64,
) {
    let pts = decoded.pts().map(|p| p as f64 * time_base).unwrap_or(f64::NAN);
    let sample_rate = decoded.rate();
    let channels = decoded.channel_layout().channels() as u16;
    let samples = decoded.samples();

    let Some(index) = frame_queue.peek_writable() else { return };
    // Frame-queue serial bumps once per pushed frame, independent of packet
    // serials — preserved deliberately; see the design notes on serial bumps.
    *frame_serial += 1;
    let serial = *frame_serial;

    frame_queue.with_writable(index, |slot| {
        slot.pts = pts;
        slot.duration = samples as f64 / sample_rate.max(1) as f64;
        slot.serial = serial;
        match resampler {
            Some(swr) => {
                let mut out = ffmpeg::util::frame::audio::Audio::empty();
                if swr.run(decoded, &mut out).is_ok() {
                    slot.content = AudioFrameContent {
                        frame: out,
                        sample_rate,
                        channels,
                        format,
                    };
                }
            }
            None => {
                slot.content = AudioFrameContent {
                    frame: decoded.clone(),
                    sample_rate,
                    channels,
                    format,
                };
            }
        }
    });
    frame_queue.push();
}

/// `packet_duration + half a repeated field's worth of time` when the codec
/// reported a packet duration, otherwise one frame interval at `fps`.
fn video_frame_duration(packet_duration: f64, repeat_pict: i32, fps: f64) -> f64 {
    if packet_duration > 0.0 {
        packet_duration + repeat_pict as f64 / (2.0 * fps.max(1e-6))
    } else {
        1.0 / fps.max(1e-6)
    }
}

pub fn run_video_decoder(
    upstream: Arc<PacketQueue>,
    mut codec: decoder::Video,
    mut scaler: Option<SwsContext>,
    format: PixelFormat,
    width: u32,
    height: u32,
    frame_queue: Arc<FrameQueue<VideoFrameContent>>,
    time_base: f64,
    fps: f64,
    state: Arc<DecoderState>,
    reader_wake: Arc<Signal>,
) {
    let mut frame_serial: u64 = 0;

    'outer: loop {
        let mut decoded = ffmpeg::util::frame::video::Video::empty();
        while codec.receive_frame(&mut decoded).is_ok() {
            emit_video_frame(&decoded, &mut scaler, format, width, height, time_base, fps, &frame_queue, &mut frame_serial);
            decoded = ffmpeg::util::frame::video::Video::empty();
        }

        let pkt = match pull_packet(&upstream, &reader_wake) {
            Some(p) => p,
            None => break 'outer,
        };

        match pkt.packet {
            Some(packet) => {
                if let Err(e) = codec.send_packet(&packet) {
                    eprintln!("[decoder:video] send_packet back-pressure: {e}");
                }
            }
            None => {
                let _ = codec.send_eof();
                state.mark_finished(pkt.serial);
                let mut flushed = ffmpeg::util::frame::video::Video::empty();
                while codec.receive_frame(&mut flushed).is_ok() {
                    emit_video_frame(&flushed, &mut scaler, format, width, height, time_base, fps, &frame_queue, &mut frame_serial);
                    flushed = ffmpeg::util::frame::video::Video::empty();
                }
                break 'outer;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_video_frame(
    decoded: &ffmpeg::util::frame::video::Video,
    scaler: &mut Option<SwsContext>,
    format: PixelFormat,
    width: u32,
    height: u32,
    time_base: f64,
    fps: f64,
    frame_queue: &FrameQueue<VideoFrameContent>,
    frame_serial: &mut u64,
) {
    let pts = decoded.pts().map(|p| p as f64 * time_base).unwrap_or(f64::NAN);
    // packet_duration/repeat_pict aren't exposed by the safe wrapper; read the
    // raw AVFrame fields directly, matching the unsafe-fallback pattern used
    // elsewhere in this crate for fields ffmpeg-the-third doesn't surface.
    let (packet_duration, repeat_pict) = unsafe {
        let p = decoded.as_ptr();
        ((*p).pkt_duration as f64 * time_base, (*p).repeat_pict)
    };
    let duration = video_frame_duration(packet_duration, repeat_pict, fps);

    let Some(index) = frame_queue.peek_writable() else { return };
    *frame_serial += 1;
    let serial = *frame_serial;
    frame_queue.with_writable(index, |slot| {
        slot.pts = pts;
        slot.duration = duration;
        slot.serial = serial;
        match scaler {
            Some(sws) => {
                let mut out = ffmpeg::util::frame::video::Video::empty();
                if sws.run(decoded, &mut out).is_ok() {
                    slot.content = VideoFrameContent { frame: out, format, width, height };
                }
            }
            None => {
                slot.content = VideoFrameContent { frame: decoded.clone(), format, width, height };
            }
        }
    });
    frame_queue.push();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_frame_duration_uses_packet_duration_plus_half_repeat_field() {
        let d = video_frame_duration(0.04, 1, 25.0);
        assert!((d - (0.04 + 1.0 / 50.0)).abs() < 1e-9);
    }

    #[test]
    fn video_frame_duration_ignores_repeat_pict_without_packet_duration() {
        let d = video_frame_duration(0.0, 1, 25.0);
        assert!((d - 1.0 / 25.0).abs() < 1e-9);
    }

    #[test]
    fn video_frame_duration_falls_back_to_fps_when_packet_duration_is_zero() {
        assert_eq!(video_frame_duration(0.0, 0, 30.0), 1.0 / 30.0);
    }

    #[test]
    fn video_frame_duration_never_divides_by_zero_fps() {
        let d = video_frame_duration(0.0, 0, 0.0);
        assert!(d.is_finite());
    }

    #[test]
    fn decoder_state_starts_unfinished_for_real_serials() {
        let state = DecoderState::new();
        assert!(!state.is_finished(0));
        assert!(!state.is_finished(1));
    }

    #[test]
    fn decoder_state_marks_only_the_recorded_serial_finished() {
        let state = DecoderState::new();
        state.mark_finished(3);
        assert!(state.is_finished(3));
        assert!(!state.is_finished(4));
    }
}
