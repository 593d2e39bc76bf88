//! Front-end (wake-word / VAD) event contract.

use bytes::Bytes;

/// Event kinds delivered by the audio front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SirenEventKind {
    /// Pre-wake: energy rose above the wake threshold.
    WakePre,
    /// A wake command word was spotted.
    WakeCmd,
    VadStart,
    VadData,
    VadEnd,
    VadCancel,
    /// Voice-print measurement for the utterance about to start.
    VoicePrint,
    Sleep,
}

/// Voice-trigger span measured by the wake-word engine, in samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TriggerSpan {
    pub start: u32,
    pub end: u32,
    pub energy: f32,
}

/// One event from the front-end.
///
/// The service copies the event before its handler returns, so the
/// front-end may reuse its buffers immediately; `data` is owned here and
/// never aliases front-end memory.
#[derive(Debug, Clone)]
pub struct SirenEvent {
    pub kind: SirenEventKind,
    /// The payload carries audible voice samples.
    pub has_voice: bool,
    /// The payload carries voice-trigger data.
    pub has_trigger: bool,
    /// Sound location estimate, degrees.
    pub sl: f32,
    pub data: Bytes,
    pub trigger: TriggerSpan,
}

impl SirenEvent {
    pub fn new(kind: SirenEventKind) -> Self {
        Self {
            kind,
            has_voice: false,
            has_trigger: false,
            sl: 0.0,
            data: Bytes::new(),
            trigger: TriggerSpan::default(),
        }
    }

    /// An event carrying voice samples, copied out of the caller's buffer.
    pub fn with_voice(kind: SirenEventKind, data: &[u8]) -> Self {
        Self {
            has_voice: true,
            data: Bytes::copy_from_slice(data),
            ..Self::new(kind)
        }
    }

    /// A voice-print event carrying the trigger span and its samples.
    pub fn with_trigger(span: TriggerSpan, data: &[u8]) -> Self {
        Self {
            has_trigger: true,
            data: Bytes::copy_from_slice(data),
            trigger: span,
            ..Self::new(SirenEventKind::VoicePrint)
        }
    }
}

/// Control surface of the wake-word front-end.
pub trait SirenControl: Send + Sync {
    /// Start feeding the processing stream.
    fn start_stream(&self);

    /// Stop feeding the processing stream.
    fn stop_stream(&self);

    /// Push the front-end back to sleep, e.g. after losing activation
    /// arbitration or finishing an utterance.
    fn sleep(&self);
}
