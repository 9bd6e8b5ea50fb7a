// crates/mediaflow-engine/src/reader.rs
//
// Opens the input, selects the best audio/video streams, spawns one decoder
// thread per selected stream, then runs the steady-state read loop: pull one
// packet, route it to the right PacketQueue, backpressure when both queues
// are near budget.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::format::context::Input;
use ffmpeg::media::Type;

use mediaflow_types::{EngineError, EngineMessage, MessageSink, PixelFormatMask, SampleFormatMask};

use crate::decoder::{run_audio_decoder, run_video_decoder, AudioFrameContent, DecoderState, VideoFrameContent};
use crate::frame_queue::FrameQueue;
use crate::negotiate::{negotiate_audio, negotiate_video};
use crate::packet_queue::PacketQueue;
use crate::signal::Signal;

const PACKET_QUEUE_BYTE_BUDGET: i64 = 50 * 1024 * 1024;
const PACKET_QUEUE_COUNT_BUDGET: usize = 500;
const NODE_OVERHEAD: i64 = 24;

pub struct AudioStreamHandles {
    pub stream_index: usize,
    pub queue: Arc<PacketQueue>,
    pub frame_queue: Arc<FrameQueue<AudioFrameContent>>,
    pub decoder_state: Arc<DecoderState>,
    pub decoder_thread: JoinHandle<()>,
}

pub struct VideoStreamHandles {
    pub stream_index: usize,
    pub queue: Arc<PacketQueue>,
    pub frame_queue: Arc<FrameQueue<VideoFrameContent>>,
    pub decoder_state: Arc<DecoderState>,
    pub decoder_thread: JoinHandle<()>,
}

pub struct OpenedStreams {
    pub audio: Option<AudioStreamHandles>,
    pub video: Option<VideoStreamHandles>,
    pub max_frame_duration: f64,
}

fn codec_time_base(stream: &ffmpeg::format::stream::Stream) -> f64 {
    let tb = stream.time_base();
    if tb.numerator() != 0 && tb.denominator() != 0 {
        tb.numerator() as f64 / tb.denominator() as f64
    } else {
        0.04
    }
}

/// Opens `url`, selects streams, builds codec contexts + format negotiation,
/// spawns decoder threads. Errors here fail `prepare`; the engine stays in
/// "not started" state.
pub fn open_streams(
    ictx: &mut Input,
    sample_mask: SampleFormatMask,
    sample_rate: u32,
    pixel_mask: PixelFormatMask,
    message_sink: Arc<dyn MessageSink>,
    reader_wake: Arc<Signal>,
) -> Result<OpenedStreams, EngineError> {
    let flags = unsafe { (*ictx.as_ptr()).iformat };
    let discontinuous = unsafe { !flags.is_null() && ((*flags).flags & ffi::AVFMT_TS_DISCONT as i32) != 0 };
    let max_frame_duration = if discontinuous { 10.0 } else { 3600.0 };

    let video_stream_index = ictx
        .streams()
        .filter(|s| s.parameters().medium() == Type::Video)
        .find(|s| s.parameters().id() == ffmpeg::codec::Id::H264)
        .or_else(|| ictx.streams().best(Type::Video))
        .map(|s| s.index());

    let audio_stream_index = ictx.streams().best(Type::Audio).map(|s| s.index());

    let video = match video_stream_index {
        Some(idx) => Some(open_video_stream(ictx, idx, pixel_mask, &message_sink, reader_wake.clone())?),
        None => None,
    };

    let audio = match audio_stream_index {
        Some(idx) => Some(open_audio_stream(ictx, idx, sample_mask, sample_rate, &message_sink, reader_wake)?),
        None => None,
    };

    Ok(OpenedStreams { audio, video, max_frame_duration })
}

fn open_audio_stream(
    ictx: &mut Input,
    stream_index: usize,
    sample_mask: SampleFormatMask,
    host_rate: u32,
    message_sink: &Arc<dyn MessageSink>,
    reader_wake: Arc<Signal>,
) -> Result<AudioStreamHandles, EngineError> {
    let stream = ictx
        .stream(stream_index)
        .ok_or_else(|| EngineError::StreamDiscoveryFailure("audio stream vanished".into()))?;
    let time_base_secs = codec_time_base(&stream);
    let time_base = {
        let tb = stream.time_base();
        (tb.numerator(), tb.denominator())
    };
    let params = stream.parameters();
    let ctx = ffmpeg::codec::context::Context::from_parameters(params)
        .map_err(|e| EngineError::StreamDiscoveryFailure(format!("codec ctx: {e}")))?;
    let codec = ctx
        .decoder()
        .audio()
        .map_err(|e| EngineError::StreamDiscoveryFailure(format!("audio decoder open: {e}")))?;

    let native_format = codec.format();
    let native_rate = codec.rate();
    let native_channels = codec.channel_layout().channels() as u16;

    let target = negotiate_audio(stream_index, native_format, native_rate, native_channels, sample_mask, host_rate)?;
    message_sink.post(EngineMessage::InitAudioRender { sample_format: target.format });

    let queue = Arc::new(PacketQueue::new("audio", NODE_OVERHEAD));
    let frame_queue = Arc::new(FrameQueue::new(9, queue.clone()));
    let decoder_state = Arc::new(DecoderState::new());

    let thread_queue = queue.clone();
    let thread_frame_queue = frame_queue.clone();
    let thread_state = decoder_state.clone();
    let format = target.format;
    let decoder_thread = std::thread::spawn(move || {
        run_audio_decoder(
            thread_queue,
            codec,
            target.resampler,
            format,
            thread_frame_queue,
            time_base,
            thread_state,
            reader_wake,
        );
    });

    let _ = time_base_secs;
    Ok(AudioStreamHandles { stream_index, queue, frame_queue, decoder_state, decoder_thread })
}

fn open_video_stream(
    ictx: &mut Input,
    stream_index: usize,
    pixel_mask: PixelFormatMask,
    message_sink: &Arc<dyn MessageSink>,
    reader_wake: Arc<Signal>,
) -> Result<VideoStreamHandles, EngineError> {
    let stream = ictx
        .stream(stream_index)
        .ok_or_else(|| EngineError::StreamDiscoveryFailure("video stream vanished".into()))?;
    let time_base = codec_time_base(&stream);
    let fps = {
        let avg = stream.avg_frame_rate();
        if avg.numerator() != 0 && avg.denominator() != 0 {
            avg.numerator() as f64 / avg.denominator() as f64
        } else {
            let r = stream.rate();
            if r.numerator() != 0 && r.denominator() != 0 {
                r.numerator() as f64 / r.denominator() as f64
            } else {
                1.0 / time_base.max(1e-6)
            }
        }
    };

    let params = stream.parameters();
    let ctx = ffmpeg::codec::context::Context::from_parameters(params)
        .map_err(|e| EngineError::StreamDiscoveryFailure(format!("codec ctx: {e}")))?;
    let codec = ctx
        .decoder()
        .video()
        .map_err(|e| EngineError::StreamDiscoveryFailure(format!("video decoder open: {e}")))?;

    let native_format = codec.format();
    let width = codec.width();
    let height = codec.height();

    let target = negotiate_video(stream_index, native_format, width, height, pixel_mask)?;
    message_sink.post(EngineMessage::InitVideoRender { width, height });

    let queue = Arc::new(PacketQueue::new("video", NODE_OVERHEAD));
    let frame_queue = Arc::new(FrameQueue::new(3, queue.clone()));
    let decoder_state = Arc::new(DecoderState::new());

    let thread_queue = queue.clone();
    let thread_frame_queue = frame_queue.clone();
    let thread_state = decoder_state.clone();
    let (format, out_w, out_h) = (target.format, target.width, target.height);
    let decoder_thread = std::thread::spawn(move || {
        run_video_decoder(
            thread_queue,
            codec,
            target.scaler,
            format,
            out_w,
            out_h,
            thread_frame_queue,
            time_base,
            fps,
            thread_state,
            reader_wake,
        );
    });

    Ok(VideoStreamHandles { stream_index, queue, frame_queue, decoder_state, decoder_thread })
}

/// Everything the reader loop needs for one stream: just the queue it feeds
/// and the stream index that routes packets to it. Kept separate from
/// `AudioStreamHandles`/`VideoStreamHandles` so the reader thread doesn't
/// have to take ownership of the decoder `JoinHandle` the engine facade needs
/// to keep around for `destroy`.
pub struct ReaderTarget {
    pub stream_index: usize,
    pub queue: Arc<PacketQueue>,
}

impl From<&AudioStreamHandles> for ReaderTarget {
    fn from(h: &AudioStreamHandles) -> Self {
        ReaderTarget { stream_index: h.stream_index, queue: h.queue.clone() }
    }
}

impl From<&VideoStreamHandles> for ReaderTarget {
    fn from(h: &VideoStreamHandles) -> Self {
        ReaderTarget { stream_index: h.stream_index, queue: h.queue.clone() }
    }
}

fn need_more(audio: &Option<ReaderTarget>, video: &Option<ReaderTarget>) -> bool {
    let audio_size = audio.as_ref().map(|a| a.queue.size_bytes()).unwrap_or(0);
    let video_size = video.as_ref().map(|v| v.queue.size_bytes()).unwrap_or(0);
    if audio_size + video_size >= PACKET_QUEUE_BYTE_BUDGET {
        return false;
    }
    let audio_ok = audio.as_ref().map(|a| a.queue.packet_count() < PACKET_QUEUE_COUNT_BUDGET).unwrap_or(true);
    let video_ok = video.as_ref().map(|v| v.queue.packet_count() < PACKET_QUEUE_COUNT_BUDGET).unwrap_or(true);
    audio_ok && video_ok
}

/// Steady-state read loop; returns once EOF sentinels have been enqueued to
/// every open stream or the caller aborts both queues out from under it.
pub fn run_reader_loop(
    mut ictx: Input,
    audio: &Option<ReaderTarget>,
    video: &Option<ReaderTarget>,
    reader_wake: Arc<Signal>,
    message_sink: Arc<dyn MessageSink>,
) {
    'outer: loop {
        if !need_more(audio, video) {
            message_sink.post(EngineMessage::PackQueueIsFull);
            reader_wake.wait_timeout(Duration::from_millis(10));
            continue;
        }

        let mut packets = ictx.packets();
        match packets.next() {
            Some(Ok((stream, packet))) => {
                let idx = stream.index();
                drop(packets);
                if let Some(a) = audio {
                    if idx == a.stream_index {
                        a.queue.bump_serial();
                        if a.queue.put(idx, packet).is_err() {
                            return;
                        }
                        continue;
                    }
                }
                if let Some(v) = video {
                    if idx == v.stream_index {
                        v.queue.bump_serial();
                        if v.queue.put(idx, packet).is_err() {
                            return;
                        }
                        continue;
                    }
                }
                // Packet belongs to a discarded stream; drop it.
            }
            Some(Err(_)) | None => {
                drop(packets);
                if let Some(a) = audio {
                    let _ = a.queue.put_null(a.stream_index);
                }
                if let Some(v) = video {
                    let _ = v.queue.put_null(v.stream_index);
                }
                break 'outer;
            }
        }
    }
    // Teardown: close the input context and release it.
    drop(ictx);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(queue: Arc<PacketQueue>) -> Option<ReaderTarget> {
        Some(ReaderTarget { stream_index: 0, queue })
    }

    fn dummy_packet() -> ffmpeg::Packet {
        ffmpeg::Packet::copy(&[0u8; 4])
    }

    #[test]
    fn need_more_with_no_streams_is_true() {
        assert!(need_more(&None, &None));
    }

    #[test]
    fn need_more_false_once_combined_bytes_exceed_budget() {
        let audio = Arc::new(PacketQueue::new("audio", NODE_OVERHEAD));
        let video = Arc::new(PacketQueue::new("video", NODE_OVERHEAD));
        let big = ffmpeg::Packet::copy(&vec![0u8; PACKET_QUEUE_BYTE_BUDGET as usize + 1]);
        video.put(0, big).unwrap();
        assert!(!need_more(&target(audio), &target(video)));
    }

    #[test]
    fn need_more_blocks_at_exactly_the_byte_budget() {
        let audio = Arc::new(PacketQueue::new("audio", 0));
        let video = Arc::new(PacketQueue::new("video", 0));
        let exact = ffmpeg::Packet::copy(&vec![0u8; PACKET_QUEUE_BYTE_BUDGET as usize]);
        video.put(0, exact).unwrap();
        assert_eq!(video.size_bytes(), PACKET_QUEUE_BYTE_BUDGET);
        assert!(!need_more(&target(audio), &target(video)));
    }

    #[test]
    fn need_more_true_one_byte_under_the_byte_budget() {
        let audio = Arc::new(PacketQueue::new("audio", 0));
        let video = Arc::new(PacketQueue::new("video", 0));
        let under = ffmpeg::Packet::copy(&vec![0u8; PACKET_QUEUE_BYTE_BUDGET as usize - 1]);
        video.put(0, under).unwrap();
        assert!(need_more(&target(audio), &target(video)));
    }

    #[test]
    fn need_more_false_once_a_single_queue_hits_the_count_budget() {
        let audio = Arc::new(PacketQueue::new("audio", NODE_OVERHEAD));
        for _ in 0..PACKET_QUEUE_COUNT_BUDGET {
            audio.put(0, dummy_packet()).unwrap();
        }
        assert!(!need_more(&target(audio), &None));
    }

    #[test]
    fn need_more_true_one_packet_under_the_count_budget() {
        let audio = Arc::new(PacketQueue::new("audio", NODE_OVERHEAD));
        for _ in 0..PACKET_QUEUE_COUNT_BUDGET - 1 {
            audio.put(0, dummy_packet()).unwrap();
        }
        assert!(need_more(&target(audio), &None));
    }

    #[test]
    fn need_more_ignores_the_stream_not_selected() {
        // Only a video target exists; an absent audio target must not force
        // `need_more` false just because it has no packets of its own.
        let video = Arc::new(PacketQueue::new("video", NODE_OVERHEAD));
        assert!(need_more(&None, &target(video)));
    }
}
