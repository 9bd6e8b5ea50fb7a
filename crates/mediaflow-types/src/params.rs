// crates/mediaflow-types/src/params.rs
//
// instance_create() takes one of these. Plain data, no config-file/env layer:
// the host process owns configuration, the engine only validates the masks
// it's handed.

use std::sync::Arc;

use crate::format::{PixelFormatMask, SampleFormatMask};
use crate::message::MessageSink;

#[derive(Clone)]
pub struct EngineParams {
    pub url: String,
    pub message_sink: Arc<dyn MessageSink>,
    pub supported_sample_formats: SampleFormatMask,
    pub supported_sample_rate: u32,
    pub supported_pixel_formats: PixelFormatMask,
}

impl std::fmt::Debug for EngineParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineParams")
            .field("url", &self.url)
            .field("supported_sample_formats", &self.supported_sample_formats)
            .field("supported_sample_rate", &self.supported_sample_rate)
            .field("supported_pixel_formats", &self.supported_pixel_formats)
            .finish()
    }
}
