//! Stub implementations shared by the engine and service tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::engine::ResultKind;
use crate::errors::SpeechError;
use crate::service::{SirenControl, VoiceCallback, VoiceEventKind};
use crate::transport::{
    RequestKind, SpeechRequest, SpeechResponse, Transport, TransportError,
};

type Responder = Box<dyn Fn(&SpeechRequest) -> Vec<SpeechResponse> + Send + Sync>;

/// Transport stub that answers each sent request with scripted responses.
///
/// `recv` waits on an internal queue fed by the responder, honoring the
/// caller's timeout, and reports `Closed` once `close` has been called,
/// matching the termination contract of the real transport.
pub(crate) struct StubTransport {
    responder: Responder,
    sent: Mutex<Vec<SpeechRequest>>,
    inbound: Mutex<VecDeque<SpeechResponse>>,
    notify: Notify,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl StubTransport {
    pub fn new(
        responder: impl Fn(&SpeechRequest) -> Vec<SpeechResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// A transport whose server never answers.
    pub fn silent() -> Arc<Self> {
        Self::new(|_| Vec::new())
    }

    /// A transport that echoes a stream + finish pair for every final
    /// request, tagging responses with the request id.
    pub fn echoing() -> Arc<Self> {
        Self::new(|req| match req.kind {
            RequestKind::Text => vec![
                SpeechResponse {
                    id: req.id,
                    asr: req.asr.clone(),
                    ..Default::default()
                },
                SpeechResponse {
                    id: req.id,
                    finish: true,
                    nlp: format!("{{\"intent\":\"echo {}\"}}", req.asr),
                    action: "speak".to_string(),
                    ..Default::default()
                },
            ],
            RequestKind::End => vec![
                SpeechResponse {
                    id: req.id,
                    asr: "partial".to_string(),
                    ..Default::default()
                },
                SpeechResponse {
                    id: req.id,
                    finish: true,
                    asr: "final transcript".to_string(),
                    nlp: "{\"intent\":\"play\"}".to_string(),
                    action: "play".to_string(),
                    ..Default::default()
                },
            ],
            _ => Vec::new(),
        })
    }

    pub fn sent(&self) -> Vec<SpeechRequest> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<RequestKind> {
        self.sent.lock().iter().map(|req| req.kind).collect()
    }

    /// Inject an unsolicited server response.
    pub fn push_response(&self, resp: SpeechResponse) {
        self.inbound.lock().push_back(resp);
        self.notify.notify_waiters();
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        req: &SpeechRequest,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotAvailable);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::NotAvailable);
        }
        let replies = (self.responder)(req);
        self.sent.lock().push(req.clone());
        if !replies.is_empty() {
            self.inbound.lock().extend(replies);
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn recv(
        &self,
        timeout: Option<Duration>,
    ) -> Result<SpeechResponse, TransportError> {
        loop {
            let notified = self.notify.notified();
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            if let Some(resp) = self.inbound.lock().pop_front() {
                return Ok(resp);
            }
            match timeout {
                Some(t) => {
                    if tokio::time::timeout(t, notified).await.is_err() {
                        return Err(TransportError::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Callback stub recording everything the service delivers.
#[derive(Default)]
pub(crate) struct RecordingCallback {
    pub events: Mutex<Vec<(i32, VoiceEventKind)>>,
    pub intermediates: Mutex<Vec<(i32, String)>>,
    pub commands: Mutex<Vec<(i32, String, String, String)>>,
    pub errors: Mutex<Vec<(i32, SpeechError)>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn event_kinds(&self) -> Vec<VoiceEventKind> {
        self.events.lock().iter().map(|(_, kind)| *kind).collect()
    }
}

impl VoiceCallback for RecordingCallback {
    fn voice_event(&self, id: i32, event: VoiceEventKind, _sl: f32) {
        self.events.lock().push((id, event));
    }

    fn intermediate_result(&self, id: i32, _kind: ResultKind, asr: &str) {
        self.intermediates.lock().push((id, asr.to_string()));
    }

    fn voice_command(&self, id: i32, asr: &str, nlp: &str, action: &str) {
        self.commands.lock().push((
            id,
            asr.to_string(),
            nlp.to_string(),
            action.to_string(),
        ));
    }

    fn speech_error(&self, id: i32, err: SpeechError) {
        self.errors.lock().push((id, err));
    }
}

/// Siren stub counting control calls.
#[derive(Default)]
pub(crate) struct StubSiren {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub sleeps: AtomicUsize,
}

impl StubSiren {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SirenControl for StubSiren {
    fn start_stream(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_stream(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn sleep(&self) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
    }
}

/// Spin until `cond` holds or the deadline passes; panics on expiry.
pub(crate) async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Duration::from_secs(2);
    let started = tokio::time::Instant::now();
    while !cond() {
        if started.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
