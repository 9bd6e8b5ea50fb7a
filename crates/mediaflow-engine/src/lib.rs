// crates/mediaflow-engine/src/lib.rs

pub mod audio_sink;
pub mod clock;
pub mod decoder;
pub mod engine;
pub mod frame_queue;
pub mod negotiate;
pub mod packet_queue;
pub mod reader;
pub mod scheduler;
pub mod signal;

pub use engine::Engine;
pub use scheduler::DisplaySink;
pub use mediaflow_types::{EngineError, EngineMessage, EngineParams, MessageSink};
