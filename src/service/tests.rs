//! Dispatcher tests with a recording callback and stub siren.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::engine::SpeechEngine;
use crate::errors::SpeechError;
use crate::testutil::{wait_until, RecordingCallback, StubSiren, StubTransport};
use crate::transport::{RequestKind, SpeechRequest, SpeechResponse};

use super::{
    SirenEvent, SirenEventKind, TriggerSpan, VoiceEventKind, VoiceProfile,
    VoiceService,
};

fn complete_profile() -> VoiceProfile {
    VoiceProfile {
        device_id: "dev-1".to_string(),
        device_type_id: "type-a".to_string(),
        key: "k".to_string(),
        secret: "s".to_string(),
        cloud_vad_enable: false,
    }
}

async fn prepared_service(
    transport: Arc<StubTransport>,
    profile: VoiceProfile,
) -> (
    Arc<VoiceService>,
    Arc<RecordingCallback>,
    Arc<StubSiren>,
) {
    let engine = SpeechEngine::new(transport);
    let callback = RecordingCallback::new();
    let siren = StubSiren::new();
    let service = VoiceService::new(
        engine,
        callback.clone(),
        siren.clone(),
        profile,
        None,
    );
    assert!(service.init());
    service.network_state_change(true).await;
    (service, callback, siren)
}

#[tokio::test]
async fn test_vad_flow_delivers_command() {
    let transport = StubTransport::echoing();
    let (service, callback, _siren) =
        prepared_service(transport.clone(), complete_profile()).await;

    service.on_siren_event(&SirenEvent::new(SirenEventKind::VadStart));
    service.on_siren_event(&SirenEvent::with_voice(
        SirenEventKind::VadData,
        b"pcm-frame",
    ));
    service.on_siren_event(&SirenEvent::new(SirenEventKind::VadEnd));

    wait_until("voice command", || !callback.commands.lock().is_empty()).await;

    let events = callback.events.lock().clone();
    let (start_id, start_kind) = events[0];
    assert_eq!(start_kind, VoiceEventKind::Start);
    assert!(start_id > 0);

    let intermediates = callback.intermediates.lock().clone();
    assert_eq!(intermediates, vec![(start_id, "partial".to_string())]);

    let commands = callback.commands.lock().clone();
    assert_eq!(commands.len(), 1);
    let (id, asr, nlp, action) = &commands[0];
    assert_eq!(*id, start_id);
    assert_eq!(asr, "final transcript");
    assert_eq!(nlp, "{\"intent\":\"play\"}");
    assert_eq!(action, "play");

    // Terminal result clears the per-session state.
    wait_until("session cleared", || service.session_id() == -1).await;
    assert_eq!(
        transport.sent_kinds(),
        [RequestKind::Start, RequestKind::Voice, RequestKind::End]
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_trigger_options_are_one_shot() {
    let transport = StubTransport::silent();
    let (service, callback, _siren) =
        prepared_service(transport.clone(), complete_profile()).await;
    service.update_stack("com.example.player");

    let span = TriggerSpan {
        start: 100,
        end: 148,
        energy: 0.5,
    };
    service.on_siren_event(&SirenEvent::with_trigger(span, b"nihao"));
    service.on_siren_event(&SirenEvent::new(SirenEventKind::VadStart));
    wait_until("first start frame", || !transport.sent().is_empty()).await;

    let start = &transport.sent()[0];
    assert_eq!(start.kind, RequestKind::Start);
    assert!(start.framework_options.contains("\"voice_trigger\":\"nihao\""));
    assert!(start.framework_options.contains("\"trigger_start\":\"100\""));
    assert!(start.framework_options.contains("\"trigger_length\":\"48\""));
    assert!(start
        .framework_options
        .contains("\"stack\":\"com.example.player\""));

    // Cancel the utterance, then start another: the trigger record must
    // not resurface.
    service.on_siren_event(&SirenEvent::new(SirenEventKind::VadCancel));
    wait_until("cancel delivered", || {
        callback.event_kinds().contains(&VoiceEventKind::Cancel)
    })
    .await;
    service.on_siren_event(&SirenEvent::new(SirenEventKind::VadStart));
    wait_until("second start frame", || {
        transport
            .sent()
            .iter()
            .filter(|req| req.kind == RequestKind::Start)
            .count()
            >= 2
    })
    .await;

    let second: Vec<SpeechRequest> = transport
        .sent()
        .into_iter()
        .filter(|req| req.kind == RequestKind::Start)
        .collect();
    assert!(!second[1].framework_options.contains("voice_trigger"));
    assert!(second[1]
        .framework_options
        .contains("\"stack\":\"com.example.player\""));

    service.shutdown().await;
}

#[tokio::test]
async fn test_activation_fake_suppresses_delivery() {
    let transport = StubTransport::new(|req| match req.kind {
        RequestKind::Start => vec![
            SpeechResponse {
                id: req.id,
                asr: "partial".to_string(),
                extra: "{\"activation\":\"fake\"}".to_string(),
                ..Default::default()
            },
            SpeechResponse {
                id: req.id,
                finish: true,
                asr: "should not surface".to_string(),
                ..Default::default()
            },
        ],
        _ => Vec::new(),
    });
    let (service, callback, siren) =
        prepared_service(transport, complete_profile()).await;

    service.on_siren_event(&SirenEvent::new(SirenEventKind::VadStart));
    wait_until("session finished", || service.session_id() == -1).await;

    assert!(callback.event_kinds().contains(&VoiceEventKind::Fake));
    assert!(callback.commands.lock().is_empty());
    assert!(callback.intermediates.lock().is_empty());
    assert!(siren.sleeps.load(Ordering::SeqCst) >= 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_activation_accept_keeps_delivery() {
    let transport = StubTransport::new(|req| match req.kind {
        RequestKind::Start => vec![
            SpeechResponse {
                id: req.id,
                asr: "turn on".to_string(),
                extra: "{\"activation\":\"accept\"}".to_string(),
                ..Default::default()
            },
            SpeechResponse {
                id: req.id,
                finish: true,
                nlp: "{\"intent\":\"lights_on\"}".to_string(),
                action: "execute".to_string(),
                ..Default::default()
            },
        ],
        _ => Vec::new(),
    });
    let (service, callback, siren) =
        prepared_service(transport, complete_profile()).await;

    service.on_siren_event(&SirenEvent::new(SirenEventKind::VadStart));
    wait_until("voice command", || !callback.commands.lock().is_empty()).await;

    assert!(callback.event_kinds().contains(&VoiceEventKind::Accept));
    let commands = callback.commands.lock().clone();
    // The final response carried no asr; the last intermediate stands in.
    assert_eq!(commands[0].1, "turn on");
    assert_eq!(commands[0].3, "execute");
    assert_eq!(siren.sleeps.load(Ordering::SeqCst), 0);

    service.shutdown().await;
}

#[tokio::test]
async fn test_error_sleeps_siren_under_cloud_vad() {
    let transport = StubTransport::new(|req| match req.kind {
        RequestKind::Start => vec![SpeechResponse {
            id: req.id,
            result_code: 101,
            ..Default::default()
        }],
        _ => Vec::new(),
    });
    let mut profile = complete_profile();
    profile.cloud_vad_enable = true;
    let (service, callback, siren) = prepared_service(transport, profile).await;

    service.on_siren_event(&SirenEvent::new(SirenEventKind::VadStart));
    wait_until("speech error", || !callback.errors.lock().is_empty()).await;

    let errors = callback.errors.lock().clone();
    assert_eq!(errors[0].1, SpeechError::ServiceUnavailable);
    assert!(siren.sleeps.load(Ordering::SeqCst) >= 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_wake_events_precede_sessions() {
    let transport = StubTransport::silent();
    let (service, callback, _siren) =
        prepared_service(transport, complete_profile()).await;

    let mut pre = SirenEvent::new(SirenEventKind::WakePre);
    pre.sl = 90.0;
    service.on_siren_event(&pre);
    service.on_siren_event(&SirenEvent::new(SirenEventKind::WakeCmd));

    wait_until("wake events", || callback.events.lock().len() == 2).await;
    let events = callback.events.lock().clone();
    assert_eq!(events[0], (-1, VoiceEventKind::Coming));
    assert_eq!(events[1], (-1, VoiceEventKind::LocalWake));

    service.shutdown().await;
}

#[tokio::test]
async fn test_vad_data_requires_voice_flag() {
    let transport = StubTransport::silent();
    let (service, _callback, _siren) =
        prepared_service(transport.clone(), complete_profile()).await;

    service.on_siren_event(&SirenEvent::new(SirenEventKind::VadStart));
    wait_until("start frame", || !transport.sent().is_empty()).await;

    let mut silent_frame = SirenEvent::new(SirenEventKind::VadData);
    silent_frame.data = bytes::Bytes::from_static(b"noise");
    service.on_siren_event(&silent_frame);
    service.on_siren_event(&SirenEvent::with_voice(
        SirenEventKind::VadData,
        b"speech",
    ));

    wait_until("voice frame", || {
        transport.sent_kinds().contains(&RequestKind::Voice)
    })
    .await;
    let voiced: Vec<SpeechRequest> = transport
        .sent()
        .into_iter()
        .filter(|req| req.kind == RequestKind::Voice)
        .collect();
    assert_eq!(voiced.len(), 1);
    assert_eq!(&voiced[0].voice[..], b"speech");

    service.shutdown().await;
}

#[tokio::test]
async fn test_incomplete_profile_keeps_speech_released() {
    let transport = StubTransport::silent();
    let (service, callback, _siren) =
        prepared_service(transport.clone(), VoiceProfile::default()).await;

    service.on_siren_event(&SirenEvent::new(SirenEventKind::VadStart));
    wait_until("start event", || !callback.events.lock().is_empty()).await;

    // No session could be opened: the sentinel id is surfaced and nothing
    // hits the wire.
    let events = callback.events.lock().clone();
    assert_eq!(events[0], (-1, VoiceEventKind::Start));
    assert!(transport.sent().is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_releases_and_stops_siren() {
    let transport = StubTransport::silent();
    let (service, _callback, siren) =
        prepared_service(transport, complete_profile()).await;

    service.start_siren(true);
    assert_eq!(siren.starts.load(Ordering::SeqCst), 1);

    service.network_state_change(false).await;
    assert_eq!(siren.stops.load(Ordering::SeqCst), 1);

    // Reconnect restarts the stream that was requested open.
    service.network_state_change(true).await;
    assert_eq!(siren.starts.load(Ordering::SeqCst), 2);

    service.shutdown().await;
}
