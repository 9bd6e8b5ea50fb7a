// crates/mediaflow-types/src/error.rs
//
// Typed error kinds the pipeline core distinguishes. Queues, decoders and the
// negotiation step all return EngineError so callers can match on kind instead
// of parsing a message; the public facade wraps these in anyhow at the boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A queue was aborted; this is end-of-work, not a failure, for the thread
    /// that observes it.
    #[error("aborted")]
    Aborted,

    /// Allocation failure. Terminal for the thread that observed it.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The codec returned an unexpected state (e.g. back-pressure after a
    /// drain). Logged and the decode loop continues.
    #[error("decoder protocol violation on stream {stream_index}: {message}")]
    DecoderProtocol { stream_index: usize, message: String },

    /// A resampler or scaler could not be built for the negotiated format.
    #[error("format unsupported on stream {stream_index}: {message}")]
    FormatUnsupported { stream_index: usize, message: String },

    /// Opening the input container failed; `prepare` fails and the engine
    /// stays in "not started" state.
    #[error("failed to open input: {0}")]
    InputOpenFailure(String),

    /// Stream probing/selection failed.
    #[error("stream discovery failed: {0}")]
    StreamDiscoveryFailure(String),

    /// Normal termination on the reader; propagates via null-packet sentinels,
    /// surfaced as an error kind only so callers that want to distinguish it
    /// from a real failure can match on it explicitly.
    #[error("end of stream")]
    EndOfStream,
}

impl EngineError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, EngineError::Aborted)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
