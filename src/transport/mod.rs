//! Wire contract between the engine and the speech service.

pub mod ws;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level failures, mapped onto operation errors by the engine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection not available")]
    NotAvailable,
    #[error("transport operation timed out")]
    Timeout,
    #[error("connection broken")]
    Broken,
    /// The connection has been shut down and will not produce any further
    /// messages. The engine's receiver task exits on this.
    #[error("transport closed")]
    Closed,
    #[error("transport failure")]
    Unknown,
}

/// Request kinds understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Text,
    Start,
    Voice,
    End,
}

/// One protocol message to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub id: i32,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub asr: String,
    #[serde(default, skip_serializing_if = "Bytes::is_empty")]
    pub voice: Bytes,
    pub lang: String,
    pub codec: String,
    pub vt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub framework_options: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skill_options: String,
}

impl SpeechRequest {
    pub fn new(id: i32, kind: RequestKind) -> Self {
        Self {
            id,
            kind,
            asr: String::new(),
            voice: Bytes::new(),
            lang: "zh".to_string(),
            codec: "pcm".to_string(),
            vt: String::new(),
            framework_options: String::new(),
            skill_options: String::new(),
        }
    }
}

/// One decoded message from the server. A session yields zero or more
/// non-finish responses followed by exactly one finish response, unless a
/// non-zero `result_code` terminates the stream early.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeechResponse {
    pub id: i32,
    #[serde(default)]
    pub result_code: u32,
    #[serde(default)]
    pub finish: bool,
    #[serde(default)]
    pub asr: String,
    #[serde(default)]
    pub nlp: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub extra: String,
}

/// A framed, message-oriented connection to the speech service.
///
/// The engine owns the transport: `open` is called from `prepare`, `close`
/// from `release`, after which `recv` must return [`TransportError::Closed`]
/// so the receiver task can exit. Implementations do not retry or
/// reconnect; a broken connection stays broken until `open` is called
/// again.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;

    async fn send(
        &self,
        req: &SpeechRequest,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Wait for the next server message. A `timeout` of `None` waits until
    /// a message arrives or the connection goes away.
    async fn recv(
        &self,
        timeout: Option<Duration>,
    ) -> Result<SpeechResponse, TransportError>;

    async fn close(&self);
}
