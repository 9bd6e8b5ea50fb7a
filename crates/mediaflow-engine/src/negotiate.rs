// crates/mediaflow-engine/src/negotiate.rs
//
// Matches a decoder's native format against the host's supported-format
// bitmask and lazily builds a resampler or scaler only when conversion is
// actually required.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::software::resampling::Context as SwrContext;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::channel_layout::ChannelLayout;

use mediaflow_types::{EngineError, PixelFormat, PixelFormatMask, SampleFormat, SampleFormatMask};

pub fn to_ffmpeg_sample(fmt: SampleFormat) -> Sample {
    use ffmpeg::format::sample::Type;
    match fmt {
        SampleFormat::S16 => Sample::I16(Type::Packed),
        SampleFormat::S16P => Sample::I16(Type::Planar),
        SampleFormat::Flt => Sample::F32(Type::Packed),
        SampleFormat::FltP => Sample::F32(Type::Planar),
    }
}

pub fn from_ffmpeg_sample(fmt: Sample) -> Option<SampleFormat> {
    use ffmpeg::format::sample::Type;
    match fmt {
        Sample::I16(Type::Packed) => Some(SampleFormat::S16),
        Sample::I16(Type::Planar) => Some(SampleFormat::S16P),
        Sample::F32(Type::Packed) => Some(SampleFormat::Flt),
        Sample::F32(Type::Planar) => Some(SampleFormat::FltP),
        _ => None,
    }
}

pub fn to_ffmpeg_pixel(fmt: PixelFormat) -> Pixel {
    match fmt {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Nv21 => Pixel::NV21,
        PixelFormat::Rgb24 => Pixel::RGB24,
    }
}

pub fn from_ffmpeg_pixel(fmt: Pixel) -> Option<PixelFormat> {
    match fmt {
        Pixel::YUV420P => Some(PixelFormat::Yuv420p),
        Pixel::NV12 => Some(PixelFormat::Nv12),
        Pixel::NV21 => Some(PixelFormat::Nv21),
        Pixel::RGB24 => Some(PixelFormat::Rgb24),
        _ => None,
    }
}

pub struct AudioTarget {
    pub resampler: Option<SwrContext>,
    pub format: SampleFormat,
}

/// If the decoder's native format is supported and its rate matches the
/// host's, no resampler is built. Otherwise the target format is the native
/// format if supported, else the first supported format in priority order;
/// the target rate is always the host's.
pub fn negotiate_audio(
    stream_index: usize,
    native_format: Sample,
    native_rate: u32,
    native_channels: u16,
    supported: SampleFormatMask,
    host_rate: u32,
) -> Result<AudioTarget, EngineError> {
    if supported.is_empty() {
        let format = from_ffmpeg_sample(native_format).unwrap_or(SampleFormat::FltP);
        return Ok(AudioTarget { resampler: None, format });
    }

    let native = from_ffmpeg_sample(native_format);
    if let Some(native) = native {
        if supported.supports(native) && native_rate == host_rate {
            return Ok(AudioTarget { resampler: None, format: native });
        }
    }

    let target = match native {
        Some(n) if supported.supports(n) => n,
        _ => supported.best().ok_or_else(|| EngineError::FormatUnsupported {
            stream_index,
            message: "no supported audio sample format in priority list".into(),
        })?,
    };

    let layout = ChannelLayout::default(native_channels as i32);
    let resampler = SwrContext::get(
        native_format,
        layout,
        native_rate,
        to_ffmpeg_sample(target),
        layout,
        host_rate,
    )
    .map_err(|e| EngineError::FormatUnsupported {
        stream_index,
        message: format!("resampler construction failed: {e}"),
    })?;

    Ok(AudioTarget { resampler: Some(resampler), format: target })
}

pub struct VideoTarget {
    pub scaler: Option<SwsContext>,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// First format in priority order that matches both the decoder's native
/// pixel format and the supported mask means no scaler. Otherwise a
/// point-filter scaler targets the first supported format at the decoder's
/// intrinsic size.
pub fn negotiate_video(
    stream_index: usize,
    native_format: Pixel,
    width: u32,
    height: u32,
    supported: PixelFormatMask,
) -> Result<VideoTarget, EngineError> {
    if supported.is_empty() {
        let format = from_ffmpeg_pixel(native_format).unwrap_or(PixelFormat::Yuv420p);
        return Ok(VideoTarget { scaler: None, format, width, height });
    }

    if let Some(native) = from_ffmpeg_pixel(native_format) {
        if supported.supports(native) {
            return Ok(VideoTarget { scaler: None, format: native, width, height });
        }
    }

    let target = supported.best().ok_or_else(|| EngineError::FormatUnsupported {
        stream_index,
        message: "no supported pixel format in priority list".into(),
    })?;

    let scaler = SwsContext::get(
        native_format,
        width,
        height,
        to_ffmpeg_pixel(target),
        width,
        height,
        Flags::POINT,
    )
    .map_err(|e| EngineError::FormatUnsupported {
        stream_index,
        message: format!("scaler construction failed: {e}"),
    })?;

    Ok(VideoTarget { scaler: Some(scaler), format: target, width, height })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_supported_and_matching_rate_skips_resampler() {
        let supported = SampleFormatMask::with(&[SampleFormat::FltP, SampleFormat::S16]);
        let target = negotiate_audio(
            0,
            to_ffmpeg_sample(SampleFormat::FltP),
            44_100,
            2,
            supported,
            44_100,
        )
        .unwrap();
        assert!(target.resampler.is_none());
        assert_eq!(target.format, SampleFormat::FltP);
    }

    #[test]
    fn rate_mismatch_forces_resampler_even_if_format_native() {
        let supported = SampleFormatMask::with(&[SampleFormat::FltP]);
        let target = negotiate_audio(
            0,
            to_ffmpeg_sample(SampleFormat::FltP),
            44_100,
            2,
            supported,
            48_000,
        )
        .unwrap();
        assert!(target.resampler.is_some());
    }

    #[test]
    fn empty_mask_passes_native_through() {
        let target = negotiate_video(0, Pixel::YUV420P, 640, 480, PixelFormatMask::empty()).unwrap();
        assert!(target.scaler.is_none());
        assert_eq!(target.format, PixelFormat::Yuv420p);
    }

    #[test]
    fn unsupported_native_builds_scaler_to_first_priority_match() {
        let supported = PixelFormatMask::with(&[PixelFormat::Rgb24]);
        let target = negotiate_video(0, Pixel::YUV420P, 640, 480, supported).unwrap();
        assert!(target.scaler.is_some());
        assert_eq!(target.format, PixelFormat::Rgb24);
    }
}
