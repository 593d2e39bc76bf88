//! The speech session engine.
//!
//! Owns the request and response stream queues and the operation
//! controller, runs a sender task and a receiver task against the
//! transport, and exposes the blocking [`poll`](SpeechEngine::poll)
//! surface the dispatcher consumes. All public operations are safe to call
//! from any task; on an unprepared engine they return sentinels (`-1` for
//! id-returning calls) or are silent no-ops.

mod controller;
mod result;
mod stream_queue;

pub use controller::{OpStatus, Operation, OperationController, DEFAULT_OP_TIMEOUT};
pub use result::{ResultKind, SpeechResult};
pub use stream_queue::{Popped, StreamQueue};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SpeechConfig;
use crate::errors::SpeechError;
use crate::options::{Options, SessionOptions};
use crate::transport::{
    RequestKind, SpeechRequest, SpeechResponse, Transport, TransportError,
};
use result::ResponseBody;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on one receiver wait while no deadline is armed, so a
/// deadline armed mid-wait is picked up on the next pass.
const RECV_HEARTBEAT: Duration = Duration::from_millis(500);

/// One request as seen by the sender task.
#[derive(Debug)]
enum Outbound {
    Text { id: i32, text: String },
    VoiceStart { id: i32, options: Arc<SessionOptions> },
    VoiceData { id: i32, voice: Bytes },
    VoiceEnd { id: i32 },
    Cancelled { id: i32 },
}

impl Outbound {
    fn id(&self) -> i32 {
        match self {
            Outbound::Text { id, .. }
            | Outbound::VoiceStart { id, .. }
            | Outbound::VoiceData { id, .. }
            | Outbound::VoiceEnd { id }
            | Outbound::Cancelled { id } => *id,
        }
    }

    /// Final requests end a session on the wire; after sending one the
    /// sender holds back until the operation settles.
    fn is_final(&self) -> bool {
        matches!(
            self,
            Outbound::Text { .. } | Outbound::VoiceEnd { .. } | Outbound::Cancelled { .. }
        )
    }
}

#[derive(Debug)]
struct TextRequest {
    id: i32,
    text: String,
    cancelled: bool,
}

struct ReqState {
    voice: StreamQueue<Bytes, Arc<SessionOptions>>,
    texts: VecDeque<TextRequest>,
}

struct RespState {
    responses: StreamQueue<ResponseBody>,
    controller: OperationController,
}

/// The speech session engine. See the module docs for the task layout.
pub struct SpeechEngine {
    core: Arc<EngineCore>,
}

/// State shared between the public surface and the internal tasks.
///
/// Locking: `reqs` before `resps`, never both the other way around.
/// Neither lock is held across an await point.
struct EngineCore {
    transport: Arc<dyn Transport>,
    config: Mutex<SpeechConfig>,
    initialized: AtomicBool,
    next_id: AtomicI32,
    reqs: Mutex<ReqState>,
    resps: Mutex<RespState>,
    req_notify: Notify,
    resp_notify: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SpeechEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(EngineCore {
                transport,
                config: Mutex::new(SpeechConfig::new()),
                initialized: AtomicBool::new(false),
                next_id: AtomicI32::new(0),
                reqs: Mutex::new(ReqState {
                    voice: StreamQueue::new(),
                    texts: VecDeque::new(),
                }),
                resps: Mutex::new(RespState {
                    responses: StreamQueue::new(),
                    controller: OperationController::new(),
                }),
                req_notify: Notify::new(),
                resp_notify: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Set a configuration entry. Takes effect for requests built after
    /// the call; the operation deadline is read once at `prepare`.
    pub fn config(&self, key: &str, value: &str) {
        self.core.config.lock().set(key, value);
    }

    /// Open the transport and start the internal tasks. Idempotent;
    /// returns true when the engine is ready (or already was).
    pub async fn prepare(&self) -> bool {
        let core = &self.core;
        if core
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return true;
        }
        if core.transport.open().await.is_err() {
            warn!("prepare failed, transport not available");
            core.initialized.store(false, Ordering::SeqCst);
            return false;
        }
        let timeout = core
            .config
            .lock()
            .get_u64("op_timeout_ms")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_OP_TIMEOUT);
        {
            let mut reqs = core.reqs.lock();
            reqs.voice = StreamQueue::new();
            reqs.texts.clear();
        }
        {
            let mut resps = core.resps.lock();
            resps.responses = StreamQueue::new();
            resps.controller = OperationController::with_timeout(timeout);
        }
        let sender = tokio::spawn({
            let core = Arc::clone(core);
            async move { core.run_sender().await }
        });
        let receiver = tokio::spawn({
            let core = Arc::clone(core);
            async move { core.run_receiver().await }
        });
        core.tasks.lock().extend([sender, receiver]);
        info!("speech engine prepared");
        true
    }

    /// Shut the engine down: close the transport and both queues, cancel
    /// any active operation, wake every waiter and join the internal
    /// tasks. Idempotent, and safe to call while a `poll` is blocked.
    pub async fn release(&self) {
        self.core.release().await;
    }

    /// Queue a one-shot text request. Returns the allocated session id, or
    /// `-1` if the engine is not prepared or the text is empty.
    pub fn put_text(&self, text: &str) -> i32 {
        self.core.put_text(text)
    }

    /// Open a streaming voice session. Returns the allocated session id,
    /// or `-1` if the engine is not prepared.
    pub fn start_voice(
        &self,
        framework: Option<Options>,
        skill: Option<Options>,
    ) -> i32 {
        self.core.start_voice(framework, skill)
    }

    /// Append audio for a session. The buffer is copied, so the caller may
    /// reuse it immediately. Silently dropped for unknown or ended ids.
    pub fn put_voice(&self, id: i32, voice: &[u8]) {
        self.core.put_voice(id, voice);
    }

    /// Close the audio stream of a session. Silently dropped for unknown
    /// ids.
    pub fn end_voice(&self, id: i32) {
        self.core.end_voice(id);
    }

    /// Cancel a session, racy-safe at any point of its life. `id <= 0`
    /// cancels everything: the whole request queue plus the active
    /// operation. An accepted-but-unsent session still yields its
    /// CANCELLED poll result; a finished one is left alone.
    pub fn cancel(&self, id: i32) {
        self.core.cancel(id);
    }

    /// Block until the next result for the active operation is available,
    /// or until the engine is released. Returns `None` iff released. Each
    /// accepted session yields exactly one terminal result, and its
    /// operation slot is freed only when that result is consumed here.
    pub async fn poll(&self) -> Option<SpeechResult> {
        self.core.poll().await
    }
}

impl EngineCore {
    async fn release(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("release, shutting down engine");
        {
            let mut reqs = self.reqs.lock();
            reqs.voice.close();
            reqs.texts.clear();
        }
        self.req_notify.notify_waiters();
        self.transport.close().await;
        {
            let mut resps = self.resps.lock();
            resps.responses.close();
            resps.controller.cancel(0);
        }
        self.resp_notify.notify_waiters();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("speech engine released");
    }

    fn put_text(&self, text: &str) -> i32 {
        if !self.initialized.load(Ordering::SeqCst) || text.is_empty() {
            return -1;
        }
        let mut reqs = self.reqs.lock();
        let id = self.alloc_id();
        reqs.texts.push_back(TextRequest {
            id,
            text: text.to_string(),
            cancelled: false,
        });
        drop(reqs);
        debug!(id, "text request queued");
        self.req_notify.notify_waiters();
        id
    }

    fn start_voice(&self, framework: Option<Options>, skill: Option<Options>) -> i32 {
        if !self.initialized.load(Ordering::SeqCst) {
            return -1;
        }
        let mut reqs = self.reqs.lock();
        let id = self.alloc_id();
        let options = Arc::new(SessionOptions { framework, skill });
        if !reqs.voice.start(id, options) {
            return -1;
        }
        drop(reqs);
        debug!(id, "voice session started");
        self.req_notify.notify_waiters();
        id
    }

    fn put_voice(&self, id: i32, voice: &[u8]) {
        if !self.initialized.load(Ordering::SeqCst) || id <= 0 || voice.is_empty() {
            return;
        }
        let mut reqs = self.reqs.lock();
        if reqs.voice.stream(id, Bytes::copy_from_slice(voice)) {
            drop(reqs);
            self.req_notify.notify_waiters();
        }
    }

    fn end_voice(&self, id: i32) {
        if !self.initialized.load(Ordering::SeqCst) || id <= 0 {
            return;
        }
        let mut reqs = self.reqs.lock();
        if reqs.voice.end(id, None) {
            drop(reqs);
            debug!(id, "voice session ended");
            self.req_notify.notify_waiters();
        }
    }

    fn cancel(&self, id: i32) {
        let mut reqs = self.reqs.lock();
        if !self.initialized.load(Ordering::SeqCst) {
            return;
        }
        debug!(id, "cancel");
        if id > 0 {
            // In flight: flip the operation and drop its queued remainder.
            // The terminal result comes from the operation, never from a
            // queue marker, so only one CANCELLED can surface.
            let op_status = {
                let mut resps = self.resps.lock();
                if resps.controller.cancel(id) {
                    reqs.voice.discard(id);
                    drop(resps);
                    drop(reqs);
                    self.resp_notify.notify_waiters();
                    return;
                }
                resps
                    .controller
                    .current()
                    .filter(|op| op.id == id)
                    .map(|op| op.status)
            };
            if op_status.is_some() {
                // Terminal but not yet consumed by poll: too late to
                // cancel, the finished result stands.
                reqs.voice.discard(id);
                return;
            }
            // Never reached the wire: drop data, leave one marker for the
            // sender to turn into the CANCELLED result.
            if reqs.voice.cancel(id) {
                drop(reqs);
                self.req_notify.notify_waiters();
                return;
            }
            if let Some(text) = reqs.texts.iter_mut().find(|text| text.id == id) {
                text.cancelled = true;
            }
        } else {
            let flipped = {
                let mut resps = self.resps.lock();
                if let Some(op) = resps.controller.current() {
                    reqs.voice.discard(op.id);
                }
                resps.controller.cancel(0)
            };
            let min_cleared = reqs.voice.clear();
            for text in reqs.texts.iter_mut() {
                text.cancelled = true;
            }
            drop(reqs);
            if min_cleared.is_some_and(|min_id| min_id > 0) {
                self.req_notify.notify_waiters();
            }
            if flipped {
                self.resp_notify.notify_waiters();
            }
        }
    }

    async fn poll(&self) -> Option<SpeechResult> {
        loop {
            let notified = self.resp_notify.notified();
            {
                let mut resps = self.resps.lock();
                if !self.initialized.load(Ordering::SeqCst) {
                    debug!("poll, engine released");
                    return None;
                }
                if let Some(result) = Self::next_result(&mut resps) {
                    debug!(id = result.id, kind = ?result.kind, "poll result");
                    if result.kind.is_terminal() {
                        drop(resps);
                        // The freed slot unblocks the sender's gate.
                        self.resp_notify.notify_waiters();
                    }
                    return Some(result);
                }
            }
            notified.await;
        }
    }

    fn next_result(resps: &mut RespState) -> Option<SpeechResult> {
        let op = resps.controller.current()?.clone();
        match op.status {
            OpStatus::Cancelled => {
                resps.responses.discard(op.id);
                resps.controller.remove();
                Some(SpeechResult::new(op.id, ResultKind::Cancelled))
            }
            OpStatus::Error => {
                resps.responses.discard(op.id);
                resps.controller.remove();
                Some(SpeechResult::with_error(
                    op.id,
                    op.error.unwrap_or(SpeechError::Unknown),
                ))
            }
            _ => {
                let result = match resps.responses.pop() {
                    Popped::Empty | Popped::Drained => return None,
                    Popped::Start(id) => SpeechResult::new(id, ResultKind::Start),
                    Popped::Data(id, body) => {
                        SpeechResult::with_body(id, ResultKind::Intermediate, body)
                    }
                    Popped::End(id, body) => SpeechResult::with_body(
                        id,
                        ResultKind::End,
                        body.unwrap_or_default(),
                    ),
                    Popped::Cancelled(id) => SpeechResult::new(id, ResultKind::Cancelled),
                    Popped::Error(id, code) => SpeechResult::with_error(
                        id,
                        SpeechError::from_code(code).unwrap_or(SpeechError::Unknown),
                    ),
                };
                debug_assert_eq!(result.id, op.id);
                if result.kind.is_terminal() {
                    resps.controller.remove();
                }
                Some(result)
            }
        }
    }

    fn alloc_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ---- sender task -------------------------------------------------

    async fn run_sender(self: Arc<Self>) {
        debug!("sender task started");
        loop {
            let notified = self.req_notify.notified();
            let next = {
                let mut reqs = self.reqs.lock();
                if !self.initialized.load(Ordering::SeqCst) {
                    break;
                }
                Self::next_outbound(&mut reqs)
            };
            let Some(req) = next else {
                notified.await;
                continue;
            };

            // Session-opening requests need the slot free; a cancel marker
            // may also have to install its own CANCELLED operation.
            match &req {
                Outbound::Text { .. } | Outbound::VoiceStart { .. } => {
                    self.wait_slot_vacant(0).await;
                }
                Outbound::Cancelled { id } => {
                    self.wait_slot_vacant(*id).await;
                }
                _ => {}
            }
            if !self.initialized.load(Ordering::SeqCst) {
                break;
            }

            let proceed = {
                let mut resps = self.resps.lock();
                self.apply_op_transition(&mut resps, &req)
            };
            if proceed {
                self.dispatch(req).await;
            }
        }
        debug!("sender task quit");
    }

    fn next_outbound(reqs: &mut ReqState) -> Option<Outbound> {
        match reqs.voice.pop() {
            Popped::Start(id) => {
                let options = reqs
                    .voice
                    .arg(id)
                    .unwrap_or_else(|| Arc::new(SessionOptions::default()));
                Some(Outbound::VoiceStart { id, options })
            }
            Popped::Data(id, voice) => Some(Outbound::VoiceData { id, voice }),
            Popped::End(id, _) => Some(Outbound::VoiceEnd { id }),
            Popped::Cancelled(id) | Popped::Error(id, _) => {
                Some(Outbound::Cancelled { id })
            }
            Popped::Empty | Popped::Drained => reqs.texts.pop_front().map(|text| {
                if text.cancelled {
                    Outbound::Cancelled { id: text.id }
                } else {
                    Outbound::Text {
                        id: text.id,
                        text: text.text,
                    }
                }
            }),
        }
    }

    /// Decide what the queued request does to the operation slot and
    /// whether it goes out on the wire.
    fn apply_op_transition(&self, resps: &mut RespState, req: &Outbound) -> bool {
        let occupied = resps.controller.current().is_some();
        match req {
            Outbound::Text { id, .. } | Outbound::VoiceStart { id, .. } => {
                if occupied {
                    // The sender gates on a vacant slot before getting here.
                    debug_assert!(false, "new request while the slot is occupied");
                    error!(id, "request dropped, operation slot occupied");
                    return false;
                }
                resps.controller.new_op(*id, OpStatus::Start);
                true
            }
            Outbound::VoiceData { .. } | Outbound::VoiceEnd { .. } => {
                // A session that was never admitted has no operation; its
                // stray data is dropped.
                occupied
            }
            Outbound::Cancelled { id } => {
                if occupied {
                    if resps.controller.cancel(*id) {
                        self.resp_notify.notify_waiters();
                    }
                    true
                } else {
                    // Cancelled before anything reached the wire: install
                    // the operation directly in CANCELLED so poll still
                    // emits the terminal result. Nothing is sent.
                    resps.controller.new_op(*id, OpStatus::Cancelled);
                    self.resp_notify.notify_waiters();
                    false
                }
            }
        }
    }

    async fn dispatch(&self, req: Outbound) {
        let id = req.id();
        let msg = self.build_request(&req);
        match self.transport.send(&msg, SEND_TIMEOUT).await {
            Ok(()) => {
                if matches!(req, Outbound::Text { .. } | Outbound::VoiceEnd { .. }) {
                    let mut resps = self.resps.lock();
                    resps.controller.refresh_deadline();
                    debug!(id, "final message sent, deadline armed");
                }
                if req.is_final() {
                    self.wait_op_finish(id).await;
                }
            }
            Err(err) => {
                let mapped = match err {
                    TransportError::NotAvailable => SpeechError::ServiceUnavailable,
                    _ => SpeechError::Unknown,
                };
                warn!(id, %err, "send failed, marking operation");
                {
                    let mut resps = self.resps.lock();
                    resps.controller.set_error(mapped);
                }
                self.resp_notify.notify_waiters();
            }
        }
    }

    fn build_request(&self, req: &Outbound) -> SpeechRequest {
        let config = self.config.lock();
        let mut msg = SpeechRequest::new(req.id(), RequestKind::Text);
        msg.lang = config.get("lang", "zh").to_string();
        msg.codec = config.get("codec", "pcm").to_string();
        msg.vt = config.get("vt", "").to_string();
        match req {
            Outbound::Text { text, .. } => {
                msg.kind = RequestKind::Text;
                msg.asr = text.clone();
            }
            Outbound::VoiceStart { options, .. } => {
                msg.kind = RequestKind::Start;
                if let Some(framework) = &options.framework {
                    msg.framework_options = framework.to_json_string();
                }
                if let Some(skill) = &options.skill {
                    msg.skill_options = skill.to_json_string();
                }
            }
            Outbound::VoiceData { voice, .. } => {
                msg.kind = RequestKind::Voice;
                msg.voice = voice.clone();
            }
            Outbound::VoiceEnd { .. } | Outbound::Cancelled { .. } => {
                msg.kind = RequestKind::End;
            }
        }
        msg
    }

    /// Park until the operation slot is free, or holds the given id, or
    /// the engine is released.
    async fn wait_slot_vacant(&self, same_id: i32) {
        loop {
            let notified = self.resp_notify.notified();
            {
                let resps = self.resps.lock();
                if !self.initialized.load(Ordering::SeqCst) {
                    return;
                }
                match resps.controller.current() {
                    None => return,
                    Some(op) if op.id == same_id => return,
                    Some(_) => {}
                }
            }
            notified.await;
        }
    }

    /// Park until the operation with `id` leaves START/STREAMING. Spurious
    /// wakeups loop back into the status check.
    async fn wait_op_finish(&self, id: i32) {
        debug!(id, "waiting for operation to finish");
        loop {
            let notified = self.resp_notify.notified();
            {
                let resps = self.resps.lock();
                if !self.initialized.load(Ordering::SeqCst) {
                    return;
                }
                match resps.controller.current() {
                    Some(op)
                        if op.id == id
                            && matches!(
                                op.status,
                                OpStatus::Start | OpStatus::Streaming
                            ) => {}
                    _ => return,
                }
            }
            notified.await;
        }
    }

    // ---- receiver task -----------------------------------------------

    async fn run_receiver(self: Arc<Self>) {
        debug!("receiver task started");
        loop {
            if !self.initialized.load(Ordering::SeqCst) {
                break;
            }
            let remaining = self.resps.lock().controller.remaining_timeout();
            let wait = remaining.unwrap_or(RECV_HEARTBEAT);
            match self.transport.recv(Some(wait)).await {
                Err(TransportError::Closed) => break,
                Ok(resp) => {
                    let notify = {
                        let mut resps = self.resps.lock();
                        Self::ingest_response(&mut resps, resp)
                    };
                    if notify {
                        self.resp_notify.notify_waiters();
                    }
                }
                Err(TransportError::Timeout) => {
                    let notify = {
                        let mut resps = self.resps.lock();
                        if resps.controller.expired() {
                            warn!("operation deadline expired");
                            resps.controller.set_error(SpeechError::Timeout);
                            true
                        } else {
                            false
                        }
                    };
                    if notify {
                        self.resp_notify.notify_waiters();
                    }
                }
                Err(TransportError::Broken) => {
                    {
                        let mut resps = self.resps.lock();
                        resps.controller.set_error(SpeechError::ServiceUnavailable);
                    }
                    self.resp_notify.notify_waiters();
                }
                Err(err) => {
                    warn!(%err, "receive failed");
                    {
                        let mut resps = self.resps.lock();
                        resps.controller.set_error(SpeechError::Unknown);
                    }
                    self.resp_notify.notify_waiters();
                }
            }
        }
        debug!("receiver task quit");
    }

    /// Fold one server response into the response queue and the operation
    /// state. Returns whether anything changed (the poll condition must
    /// then be signalled).
    fn ingest_response(resps: &mut RespState, resp: SpeechResponse) -> bool {
        let (op_id, status) = match resps.controller.current() {
            Some(op) => (op.id, op.status),
            None => {
                debug!(id = resp.id, "response without active operation, dropped");
                return false;
            }
        };
        if op_id != resp.id || matches!(status, OpStatus::Cancelled | OpStatus::Error)
        {
            debug!(id = resp.id, op_id, "late response dropped");
            return false;
        }

        let id = resp.id;
        if status == OpStatus::Start {
            resps.responses.start(id, ());
            if let Some(op) = resps.controller.current_mut() {
                op.status = OpStatus::Streaming;
            }
            debug!(id, "first response, operation streaming");
        }

        if resp.result_code != 0 {
            resps.responses.fail(id, resp.result_code);
            resps.controller.finish();
            return true;
        }

        let body = ResponseBody {
            asr: resp.asr,
            nlp: resp.nlp,
            action: resp.action,
            extra: resp.extra,
        };
        if resp.finish {
            resps.responses.end(id, Some(body));
            resps.controller.finish();
            debug!(id, "final response buffered");
        } else {
            resps.responses.stream(id, body);
        }
        true
    }
}
