//! Application-facing callback surface.

use crate::engine::ResultKind;
use crate::errors::SpeechError;

/// Events surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEventKind {
    /// Energy rose above the wake threshold; someone may be speaking.
    Coming,
    /// A recognition session opened for the utterance.
    Start,
    /// The local wake word fired.
    LocalWake,
    /// Server arbitration accepted this device.
    Accept,
    /// Server arbitration rejected this device.
    Reject,
    /// Server judged the wake a false trigger.
    Fake,
    /// The session was cancelled.
    Cancel,
    /// The front-end went back to sleep.
    Sleep,
}

impl VoiceEventKind {
    /// Map a server activation verdict onto an application event. Unknown
    /// verdicts map to nothing and are not delivered.
    pub(crate) fn from_activation(verdict: &str) -> Option<Self> {
        match verdict {
            "accept" => Some(VoiceEventKind::Accept),
            "reject" => Some(VoiceEventKind::Reject),
            "fake" => Some(VoiceEventKind::Fake),
            _ => None,
        }
    }
}

/// Callbacks invoked from the service's event and response tasks.
///
/// Implementations should return quickly; a slow callback stalls the task
/// that delivers it (and therefore result consumption).
pub trait VoiceCallback: Send + Sync {
    /// A lifecycle event. `id` is `-1` for wake events that precede any
    /// session; `sl` is the sound location for wake events, `0.0`
    /// otherwise.
    fn voice_event(&self, id: i32, event: VoiceEventKind, sl: f32);

    /// A partial recognition result.
    fn intermediate_result(&self, id: i32, kind: ResultKind, asr: &str);

    /// The final recognition outcome of a session.
    fn voice_command(&self, id: i32, asr: &str, nlp: &str, action: &str);

    /// A session ended in an error.
    fn speech_error(&self, id: i32, err: SpeechError);
}
