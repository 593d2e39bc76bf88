//! Client-side core of a streaming voice-recognition pipeline.
//!
//! `voicelink` sits between a local wake-word/VAD front-end and a remote
//! speech-understanding service. The [`SpeechEngine`] opens a server-side
//! session when speech is detected, streams audio frames, and multiplexes
//! recognition and NLP results back through a blocking
//! [`poll`](SpeechEngine::poll) surface; the [`VoiceService`] dispatcher
//! turns front-end events into engine calls and engine results into
//! application callbacks, including server-side activation arbitration.
//!
//! # Engine example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voicelink::{SpeechConfig, SpeechEngine, WsTransport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = SpeechConfig::new();
//!     config.set("host", "speech.example.com");
//!     let transport = Arc::new(WsTransport::from_config(&config).unwrap());
//!     let engine = SpeechEngine::new(transport);
//!
//!     if engine.prepare().await {
//!         let id = engine.put_text("what time is it");
//!         while let Some(result) = engine.poll().await {
//!             println!("{id}: {:?} {}", result.kind, result.asr);
//!             if result.kind.is_terminal() {
//!                 break;
//!             }
//!         }
//!     }
//!     engine.release().await;
//! }
//! ```

pub mod config;
pub mod engine;
pub mod errors;
pub mod options;
pub mod service;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::SpeechConfig;
pub use engine::{
    OpStatus, Operation, OperationController, Popped, ResultKind, SpeechEngine,
    SpeechResult, StreamQueue,
};
pub use errors::SpeechError;
pub use options::{Options, SessionOptions};
pub use service::{
    ProfileError, SirenControl, SirenEvent, SirenEventKind, SirenState,
    SpeechState, TriggerSpan, VoiceCallback, VoiceEventKind, VoiceProfile,
    VoiceService,
};
pub use transport::ws::WsTransport;
pub use transport::{
    RequestKind, SpeechRequest, SpeechResponse, Transport, TransportError,
};
