// crates/mediaflow-types/src/message.rs
//
// Message types the core posts to the host's callback. The core never blocks
// on delivery — posting is fire-and-forget from the thread that noticed the
// condition.

use crate::format::SampleFormat;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineMessage {
    /// Posted once the audio format is resolved (resampler built or not).
    InitAudioRender { sample_format: SampleFormat },
    /// Posted once video dimensions are resolved (scaler built or not).
    InitVideoRender { width: u32, height: u32 },
    /// The reader is backpressured: queues are at their byte/count budget.
    PackQueueIsFull,
    /// The audio pull endpoint or the scheduler found an empty frame queue.
    FrameQueueIsEmpty,
}

/// Host-supplied sink for `EngineMessage`. The core never blocks on this.
/// `Sync` as well as `Send`: an `Arc<dyn MessageSink>` gets moved into more
/// than one spawned thread (the reader thread and the scheduler thread), and
/// `Arc<T>` is only `Send` when `T: Send + Sync`.
pub trait MessageSink: Send + Sync {
    fn post(&self, message: EngineMessage);
}

impl<F: Fn(EngineMessage) + Send + Sync> MessageSink for F {
    fn post(&self, message: EngineMessage) {
        self(message)
    }
}
