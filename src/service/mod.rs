//! VoiceService: translates front-end events into engine calls and engine
//! results into application callbacks.
//!
//! Two long-lived tasks run here: the event task, a serial consumer of
//! front-end events, and the response task, a serial consumer of
//! [`SpeechEngine::poll`]. Results are pulled from the engine, never
//! pushed into the service, so the engine holds no reference back.

mod callbacks;
mod config;
mod events;
#[cfg(test)]
mod tests;

pub use callbacks::{VoiceCallback, VoiceEventKind};
pub use config::{ProfileError, VoiceProfile};
pub use events::{SirenControl, SirenEvent, SirenEventKind, TriggerSpan};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{ResultKind, SpeechEngine, SpeechResult};
use crate::options::Options;

/// Lifecycle of the local front-end stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SirenState {
    Unknown,
    Inited,
    Started,
    Stopped,
}

/// Whether the engine behind the service is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechState {
    Released,
    Prepared,
}

const NO_SESSION: i32 = -1;

/// One-shot voice-trigger record, consumed by the next VAD_START.
struct TriggerRecord {
    span: TriggerSpan,
    data: Bytes,
}

/// The dispatcher between the audio front-end, the speech engine and the
/// application.
pub struct VoiceService {
    core: Arc<ServiceCore>,
}

struct ServiceCore {
    engine: Arc<SpeechEngine>,
    callback: Arc<dyn VoiceCallback>,
    siren: Arc<dyn SirenControl>,
    profile: RwLock<VoiceProfile>,
    profile_path: Option<PathBuf>,
    /// App stack identifier forwarded in VAD_START options.
    stack: RwLock<String>,
    session_id: AtomicI32,
    asr_finished: AtomicBool,
    trigger: Mutex<Option<TriggerRecord>>,
    siren_state: Mutex<SirenState>,
    /// The application asked for an open stream; remembered so a later
    /// reconnect can restart it.
    siren_requested: AtomicBool,
    speech_state: AsyncMutex<SpeechState>,
    events_tx: Mutex<Option<UnboundedSender<SirenEvent>>>,
    events_rx: Mutex<Option<UnboundedReceiver<SirenEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceService {
    pub fn new(
        engine: Arc<SpeechEngine>,
        callback: Arc<dyn VoiceCallback>,
        siren: Arc<dyn SirenControl>,
        profile: VoiceProfile,
        profile_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            core: Arc::new(ServiceCore {
                engine,
                callback,
                siren,
                profile: RwLock::new(profile),
                profile_path,
                stack: RwLock::new(String::new()),
                session_id: AtomicI32::new(NO_SESSION),
                asr_finished: AtomicBool::new(false),
                trigger: Mutex::new(None),
                siren_state: Mutex::new(SirenState::Unknown),
                siren_requested: AtomicBool::new(false),
                speech_state: AsyncMutex::new(SpeechState::Released),
                events_tx: Mutex::new(Some(events_tx)),
                events_rx: Mutex::new(Some(events_rx)),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the event task. Idempotent; returns true once the front-end
    /// side is up.
    pub fn init(&self) -> bool {
        let core = &self.core;
        {
            let mut state = core.siren_state.lock();
            if *state != SirenState::Unknown {
                return true;
            }
            *state = SirenState::Inited;
        }
        let Some(rx) = core.events_rx.lock().take() else {
            return false;
        };
        let task = tokio::spawn({
            let core = Arc::clone(core);
            async move { core.run_events(rx).await }
        });
        core.tasks.lock().push(task);
        true
    }

    /// Front-end callback entry point. The event is copied out before this
    /// returns; the caller may reuse its buffers immediately.
    pub fn on_siren_event(&self, event: &SirenEvent) {
        if let Some(tx) = self.core.events_tx.lock().as_ref() {
            let _ = tx.send(event.clone());
        }
    }

    /// Open or close the front-end processing stream.
    pub fn start_siren(&self, open: bool) {
        self.core.start_siren(open);
    }

    /// Track connectivity: prepare the engine and start the response task
    /// on connect, release on disconnect. A profile without credentials
    /// keeps the speech side released.
    pub async fn network_state_change(&self, connected: bool) {
        let core = &self.core;
        let mut state = core.speech_state.lock().await;
        if connected && *state != SpeechState::Prepared {
            let profile = core.profile.read().clone();
            if !profile.is_complete() {
                warn!("voice profile incomplete, speech stays released");
                return;
            }
            profile.apply(|key, value| core.engine.config(key, value));
            if !core.engine.prepare().await {
                return;
            }
            *state = SpeechState::Prepared;
            let task = tokio::spawn({
                let core = Arc::clone(core);
                async move { core.run_responses().await }
            });
            core.tasks.lock().push(task);
            info!("speech prepared");

            if core.siren_requested.load(Ordering::SeqCst) {
                let mut siren = core.siren_state.lock();
                if matches!(*siren, SirenState::Inited | SirenState::Stopped) {
                    core.siren.start_stream();
                    *siren = SirenState::Started;
                }
            }
        } else if !connected && *state == SpeechState::Prepared {
            {
                let mut siren = core.siren_state.lock();
                if *siren == SirenState::Started {
                    core.siren.stop_stream();
                    *siren = SirenState::Stopped;
                }
            }
            core.engine.release().await;
            *state = SpeechState::Released;
            info!("speech released");
        }
    }

    /// Replace the stack identifier forwarded with the next session.
    pub fn update_stack(&self, appid: &str) {
        *self.core.stack.write() = appid.to_string();
    }

    /// Update and persist the device credentials.
    pub fn update_config(
        &self,
        device_id: &str,
        device_type_id: &str,
        key: &str,
        secret: &str,
    ) -> Result<(), ProfileError> {
        let core = &self.core;
        let mut profile = core.profile.write();
        profile.device_id = device_id.to_string();
        profile.device_type_id = device_type_id.to_string();
        profile.key = key.to_string();
        profile.secret = secret.to_string();
        if let Some(path) = &core.profile_path {
            profile.save(path)?;
        }
        Ok(())
    }

    /// Release the engine and join both service tasks.
    pub async fn shutdown(&self) {
        let core = &self.core;
        *core.events_tx.lock() = None;
        core.engine.release().await;
        let handles: Vec<JoinHandle<()>> = core.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// The session id of the utterance in progress, `-1` when idle.
    pub fn session_id(&self) -> i32 {
        self.core.session_id()
    }
}

impl ServiceCore {
    fn session_id(&self) -> i32 {
        self.session_id.load(Ordering::SeqCst)
    }

    fn cloud_vad_enabled(&self) -> bool {
        self.profile.read().cloud_vad_enable
    }

    fn clear_session(&self) {
        self.session_id.store(NO_SESSION, Ordering::SeqCst);
    }

    fn clear_if_current(&self, id: i32) {
        let _ = self.session_id.compare_exchange(
            id,
            NO_SESSION,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn start_siren(&self, open: bool) {
        let mut state = self.siren_state.lock();
        debug!(open, ?state, "start_siren");
        if open && matches!(*state, SirenState::Inited | SirenState::Stopped) {
            self.siren_requested.store(true, Ordering::SeqCst);
            self.siren.start_stream();
            *state = SirenState::Started;
        } else if !open && *state == SirenState::Started {
            self.siren.stop_stream();
            *state = SirenState::Stopped;
        }
        if !open && *state != SirenState::Unknown {
            self.siren_requested.store(false, Ordering::SeqCst);
        }
    }

    // ---- event task --------------------------------------------------

    async fn run_events(self: Arc<Self>, mut rx: UnboundedReceiver<SirenEvent>) {
        debug!("event task started");
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
        debug!("event task quit");
    }

    async fn handle_event(&self, event: SirenEvent) {
        match event.kind {
            SirenEventKind::WakePre => {
                self.callback
                    .voice_event(NO_SESSION, VoiceEventKind::Coming, event.sl);
            }
            SirenEventKind::WakeCmd => {
                self.callback
                    .voice_event(NO_SESSION, VoiceEventKind::LocalWake, event.sl);
            }
            SirenEventKind::VadStart => {
                if self.session_id() < 0 {
                    let id = self.vad_start().await;
                    self.session_id.store(id, Ordering::SeqCst);
                    debug!(id, "vad start");
                    self.callback.voice_event(id, VoiceEventKind::Start, 0.0);
                }
            }
            SirenEventKind::VadData => {
                let id = self.session_id();
                if id > 0 && event.has_voice {
                    self.engine.put_voice(id, &event.data);
                }
            }
            SirenEventKind::VadEnd => {
                if !self.cloud_vad_enabled() {
                    let id = self.session_id();
                    debug!(id, "vad end");
                    if id > 0 {
                        self.engine.end_voice(id);
                    }
                    self.clear_session();
                }
            }
            SirenEventKind::VadCancel => {
                let id = self.session_id();
                debug!(id, "vad cancel");
                if id > 0 && !self.asr_finished.load(Ordering::SeqCst) {
                    self.engine.cancel(id);
                }
                self.asr_finished.store(false, Ordering::SeqCst);
                if !self.cloud_vad_enabled() {
                    self.clear_session();
                }
            }
            SirenEventKind::VoicePrint => {
                if event.has_trigger {
                    *self.trigger.lock() = Some(TriggerRecord {
                        span: event.trigger,
                        data: event.data.clone(),
                    });
                }
            }
            SirenEventKind::Sleep => {
                if !self.cloud_vad_enabled() {
                    self.callback.voice_event(
                        self.session_id(),
                        VoiceEventKind::Sleep,
                        0.0,
                    );
                }
            }
        }
    }

    /// Open a voice session for the utterance that just started. The
    /// pending voice-trigger record, if any, is consumed here.
    async fn vad_start(&self) -> i32 {
        if *self.speech_state.lock().await != SpeechState::Prepared {
            return NO_SESSION;
        }
        let mut options = Options::new();
        if let Some(trigger) = self.trigger.lock().take() {
            options.set(
                "voice_trigger",
                String::from_utf8_lossy(&trigger.data).into_owned(),
            );
            options.set("trigger_start", trigger.span.start.to_string());
            options.set(
                "trigger_length",
                trigger.span.end.saturating_sub(trigger.span.start).to_string(),
            );
            options.set("voice_power", trigger.span.energy.to_string());
        }
        options.set("stack", self.stack.read().as_str());
        debug!(options = %options.to_json_string(), "session options");
        self.engine.start_voice(Some(options), None)
    }

    // ---- response task -----------------------------------------------

    async fn run_responses(self: Arc<Self>) {
        debug!("response task started");
        let mut activation = String::new();
        let mut last_asr = String::new();
        while let Some(result) = self.engine.poll().await {
            debug!(id = result.id, kind = ?result.kind, "engine result");
            if result.kind == ResultKind::Start {
                self.asr_finished.store(false, Ordering::SeqCst);
                activation.clear();
                last_asr.clear();
            }

            if matches!(result.kind, ResultKind::Intermediate | ResultKind::End) {
                if let Some(verdict) = extract_activation(&result.extra) {
                    debug!(%verdict, "activation verdict");
                    match VoiceEventKind::from_activation(&verdict) {
                        Some(event) => {
                            self.callback.voice_event(result.id, event, 0.0)
                        }
                        None => debug!(%verdict, "unmapped activation verdict"),
                    }
                    if arbitrated_out(&verdict) {
                        self.siren.sleep();
                    }
                    activation = verdict;
                }
            }

            if !arbitrated_out(&activation) {
                self.deliver(&result, &mut last_asr);
            }

            if result.kind.is_terminal() {
                self.clear_if_current(result.id);
            }
        }
        self.clear_session();
        debug!("response task quit");
    }

    fn deliver(&self, result: &SpeechResult, last_asr: &mut String) {
        match result.kind {
            ResultKind::Intermediate => {
                if !result.asr.is_empty() {
                    *last_asr = result.asr.clone();
                }
                self.callback
                    .intermediate_result(result.id, result.kind, &result.asr);
            }
            ResultKind::End => {
                let asr = if result.asr.is_empty() {
                    last_asr.as_str()
                } else {
                    &result.asr
                };
                self.callback
                    .voice_command(result.id, asr, &result.nlp, &result.action);
            }
            ResultKind::Cancelled => {
                self.callback
                    .voice_event(result.id, VoiceEventKind::Cancel, 0.0);
            }
            ResultKind::Error => {
                if let Some(err) = result.error {
                    if result.id == self.session_id() && self.cloud_vad_enabled() {
                        self.siren.sleep();
                    }
                    self.callback.speech_error(result.id, err);
                    self.asr_finished.store(false, Ordering::SeqCst);
                }
            }
            ResultKind::Start => {}
        }
    }
}

fn extract_activation(extra: &str) -> Option<String> {
    if extra.is_empty() {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(extra)
        .ok()?
        .get("activation")?
        .as_str()
        .map(str::to_string)
}

fn arbitrated_out(verdict: &str) -> bool {
    verdict == "fake" || verdict == "reject"
}
