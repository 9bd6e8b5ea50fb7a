// crates/mediaflow-engine/src/audio_sink.rs
//
// The engine's half of the audio pull: the host's audio thread calls
// fetch_samples/fetch_planar on its own callback, we copy out of whatever
// frame sampq currently holds and retire it when exhausted. Runs on a caller
// thread we don't own, so nothing here blocks beyond the non-blocking
// FrameQueue peek.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use mediaflow_types::{EngineMessage, MessageSink, SampleFormat};

use crate::clock::Clock;
use crate::decoder::AudioFrameContent;
use crate::frame_queue::FrameQueue;

fn sample_bytes(format: SampleFormat) -> usize {
    match format {
        SampleFormat::S16 | SampleFormat::S16P => 2,
        SampleFormat::Flt | SampleFormat::FltP => 4,
    }
}

/// How many bytes to take out of a plane of `plane_len` bytes starting at
/// `offset`, capped by how much the caller still wants.
fn take_amount(plane_len: usize, offset: usize, want: usize) -> usize {
    plane_len.saturating_sub(offset).min(want)
}

fn first_touch(f: &mut crate::frame_queue::Frame<AudioFrameContent>, audio_clock: &Clock, external_clock: &Clock) {
    let samples = f.content.frame.samples() as f64;
    let rate = f.content.sample_rate.max(1) as f64;
    let clock_pts = f.pts + samples / rate;
    audio_clock.set_at(clock_pts, 0, Instant::now());
    external_clock.sync_slave_to(external_clock.serial(), audio_clock, audio_clock.serial());
}

/// Copies up to `out_buf.len()` interleaved bytes out of the audio frame
/// queue, pulling and retiring frames as needed. Returns the number of bytes
/// written; 0 on an empty queue (after posting `FrameQueueIsEmpty`) or while
/// paused.
#[allow(clippy::too_many_arguments)]
pub fn fetch_samples(
    frame_queue: &FrameQueue<AudioFrameContent>,
    audio_clock: &Clock,
    external_clock: &Clock,
    paused: &AtomicBool,
    message_sink: &dyn MessageSink,
    format: SampleFormat,
    out_buf: &mut [u8],
) -> usize {
    if paused.load(Ordering::Relaxed) {
        return 0;
    }

    let bytes_per_sample = sample_bytes(format);
    let mut written = 0;
    let mut want = out_buf.len();

    while want > 0 {
        let Some(index) = frame_queue.peek_readable(false) else {
            message_sink.post(EngineMessage::FrameQueueIsEmpty);
            return written;
        };

        let exhausted = frame_queue.with_readable_mut(index, |f| {
            if f.left_offset == 0 {
                first_touch(f, audio_clock, external_clock);
            }

            let channels = f.content.channels.max(1) as usize;
            let plane_len = f.content.frame.samples() * bytes_per_sample * channels;
            let take = take_amount(plane_len, f.left_offset, want);

            let data = f.content.frame.data(0);
            out_buf[written..written + take].copy_from_slice(&data[f.left_offset..f.left_offset + take]);

            f.left_offset += take;
            written += take;
            want -= take;
            f.left_offset >= plane_len
        });

        if exhausted {
            frame_queue.next();
        }
    }

    written
}

/// Planar counterpart: `l_buf`/`r_buf` advance independently via
/// `left_offset`/`right_offset`; the frame retires once the left side is
/// exhausted. `r_buf` is `None` for a mono stream. Returns `(left_written,
/// right_written)`.
#[allow(clippy::too_many_arguments)]
pub fn fetch_planar(
    frame_queue: &FrameQueue<AudioFrameContent>,
    audio_clock: &Clock,
    external_clock: &Clock,
    paused: &AtomicBool,
    message_sink: &dyn MessageSink,
    format: SampleFormat,
    l_buf: &mut [u8],
    mut r_buf: Option<&mut [u8]>,
) -> (usize, usize) {
    if paused.load(Ordering::Relaxed) {
        return (0, 0);
    }

    let bytes_per_sample = sample_bytes(format);
    let mut l_written = 0;
    let mut r_written = 0;
    let mut l_want = l_buf.len();
    let mut r_want = r_buf.as_ref().map(|b| b.len()).unwrap_or(0);

    while l_want > 0 || r_want > 0 {
        let Some(index) = frame_queue.peek_readable(false) else {
            message_sink.post(EngineMessage::FrameQueueIsEmpty);
            return (l_written, r_written);
        };

        let left_done = frame_queue.with_readable_mut(index, |f| {
            if f.left_offset == 0 {
                first_touch(f, audio_clock, external_clock);
            }

            let plane_len = f.content.frame.samples() * bytes_per_sample;

            if l_want > 0 {
                let take = take_amount(plane_len, f.left_offset, l_want);
                let data = f.content.frame.data(0);
                l_buf[l_written..l_written + take].copy_from_slice(&data[f.left_offset..f.left_offset + take]);
                f.left_offset += take;
                l_written += take;
                l_want -= take;
            }

            if r_want > 0 && f.content.channels > 1 {
                if let Some(r_buf) = r_buf.as_deref_mut() {
                    let take = take_amount(plane_len, f.right_offset, r_want);
                    let data = f.content.frame.data(1);
                    r_buf[r_written..r_written + take].copy_from_slice(&data[f.right_offset..f.right_offset + take]);
                    f.right_offset += take;
                    r_written += take;
                    r_want -= take;
                }
            } else {
                r_want = 0;
            }

            f.left_offset >= plane_len
        });

        if left_done {
            frame_queue.next();
        }
    }

    (l_written, r_written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_bytes_matches_format_width() {
        assert_eq!(sample_bytes(SampleFormat::S16), 2);
        assert_eq!(sample_bytes(SampleFormat::S16P), 2);
        assert_eq!(sample_bytes(SampleFormat::Flt), 4);
        assert_eq!(sample_bytes(SampleFormat::FltP), 4);
    }

    #[test]
    fn take_amount_caps_at_remaining_plane() {
        assert_eq!(take_amount(100, 90, 50), 10);
    }

    #[test]
    fn take_amount_caps_at_want() {
        assert_eq!(take_amount(100, 0, 30), 30);
    }

    #[test]
    fn take_amount_zero_when_offset_past_end() {
        assert_eq!(take_amount(100, 100, 30), 0);
    }
}
