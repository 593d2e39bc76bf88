//! Speech error taxonomy.

use thiserror::Error;

/// Errors surfaced to the application through terminal poll results and
/// `speech_error` callbacks.
///
/// Server-side failures arrive as numeric result codes on the wire and are
/// mapped through [`SpeechError::from_code`]; transport failures are mapped
/// by the engine (`ServiceUnavailable`, `Timeout`, `Unknown`). Codes `101`
/// (service unavailable) and `103` (timeout) are the publicly documented
/// error kinds.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SpeechError {
    #[error("request not authenticated")]
    Unauthenticated,
    #[error("too many concurrent connections")]
    ConnectionExceeded,
    #[error("server resource exhausted")]
    ResourceExhausted,
    #[error("server busy")]
    ServerBusy,
    #[error("server internal error")]
    ServerInternal,
    #[error("speech service unavailable")]
    ServiceUnavailable,
    #[error("sdk closed")]
    SdkClosed,
    #[error("request timed out")]
    Timeout,
    #[error("unknown speech error")]
    Unknown,
}

impl SpeechError {
    /// Map a wire result code to an error. Code `0` is success and maps to
    /// `None`; unrecognized codes collapse to [`SpeechError::Unknown`].
    pub fn from_code(code: u32) -> Option<SpeechError> {
        match code {
            0 => None,
            2 => Some(SpeechError::Unauthenticated),
            3 => Some(SpeechError::ConnectionExceeded),
            4 => Some(SpeechError::ResourceExhausted),
            5 => Some(SpeechError::ServerBusy),
            6 => Some(SpeechError::ServerInternal),
            101 => Some(SpeechError::ServiceUnavailable),
            102 => Some(SpeechError::SdkClosed),
            103 => Some(SpeechError::Timeout),
            _ => Some(SpeechError::Unknown),
        }
    }

    /// The numeric code exposed to applications.
    pub fn code(self) -> u32 {
        match self {
            SpeechError::Unauthenticated => 2,
            SpeechError::ConnectionExceeded => 3,
            SpeechError::ResourceExhausted => 4,
            SpeechError::ServerBusy => 5,
            SpeechError::ServerInternal => 6,
            SpeechError::ServiceUnavailable => 101,
            SpeechError::SdkClosed => 102,
            SpeechError::Timeout => 103,
            SpeechError::Unknown => 104,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_mapping() {
        assert_eq!(SpeechError::from_code(0), None);
        assert_eq!(SpeechError::from_code(2), Some(SpeechError::Unauthenticated));
        assert_eq!(SpeechError::from_code(5), Some(SpeechError::ServerBusy));
        assert_eq!(
            SpeechError::from_code(101),
            Some(SpeechError::ServiceUnavailable)
        );
        assert_eq!(SpeechError::from_code(102), Some(SpeechError::SdkClosed));
        assert_eq!(SpeechError::from_code(77), Some(SpeechError::Unknown));
    }

    #[test]
    fn test_code_round_trip() {
        for err in [
            SpeechError::Unauthenticated,
            SpeechError::ConnectionExceeded,
            SpeechError::ResourceExhausted,
            SpeechError::ServerBusy,
            SpeechError::ServerInternal,
            SpeechError::ServiceUnavailable,
            SpeechError::SdkClosed,
            SpeechError::Timeout,
        ] {
            assert_eq!(SpeechError::from_code(err.code()), Some(err));
        }
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            SpeechError::ServiceUnavailable.to_string(),
            "speech service unavailable"
        );
        assert_eq!(SpeechError::Timeout.to_string(), "request timed out");
    }
}
