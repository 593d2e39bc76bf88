//! Results emitted to the application consumer.

use crate::errors::SpeechError;

/// Kind of a poll result. For one session the engine emits exactly one
/// `Start`, zero or more `Intermediate`, then exactly one terminal kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Intermediate,
    Start,
    End,
    Cancelled,
    Error,
}

impl ResultKind {
    /// Terminal kinds end the session and free the operation slot.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResultKind::End | ResultKind::Cancelled | ResultKind::Error
        )
    }
}

/// One unit of recognition output for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechResult {
    pub id: i32,
    pub kind: ResultKind,
    /// Set only on `Error` results.
    pub error: Option<SpeechError>,
    pub asr: String,
    pub nlp: String,
    pub action: String,
    pub extra: String,
}

impl SpeechResult {
    pub fn new(id: i32, kind: ResultKind) -> Self {
        Self {
            id,
            kind,
            error: None,
            asr: String::new(),
            nlp: String::new(),
            action: String::new(),
            extra: String::new(),
        }
    }

    pub(crate) fn with_error(id: i32, error: SpeechError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(id, ResultKind::Error)
        }
    }

    pub(crate) fn with_body(id: i32, kind: ResultKind, body: ResponseBody) -> Self {
        Self {
            asr: body.asr,
            nlp: body.nlp,
            action: body.action,
            extra: body.extra,
            ..Self::new(id, kind)
        }
    }
}

/// Decoded body of a server response, buffered until polled.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ResponseBody {
    pub asr: String,
    pub nlp: String,
    pub action: String,
    pub extra: String,
}
