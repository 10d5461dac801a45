//! End-to-end streaming session scenarios
//!
//! Built on the energy probe and a scripted recognizer backend, so the full
//! chunk -> window -> segment -> transcript path runs without model files.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use asr_pipeline::{
    EnergyProbe, PipelineError, Recognizer, SpeechProbe, SttBackend, VadConfig,
    VoiceActivityDetector,
};
use asr_server::{AsrSession, MessageKind, SessionConfig};

struct FixedBackend(&'static str);

impl SttBackend for FixedBackend {
    fn transcribe(&mut self, _samples: &[f32], _rate: u32) -> Result<String, PipelineError> {
        Ok(self.0.to_string())
    }
}

fn vad_config() -> VadConfig {
    VadConfig {
        threshold: 0.5,
        min_silence_duration: 0.5,
        min_speech_duration: 0.25,
        max_speech_duration: 20.0,
        sample_rate: 16_000,
        window_size: 512,
        context_size: 0,
        ..VadConfig::default()
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        sample_rate: 16_000,
        window_size: 512,
        min_audio_sec: 0.5,
        max_audio_sec: 30.0,
    }
}

fn make_session(text: &'static str, config: SessionConfig) -> AsrSession {
    let recognizer = Arc::new(Recognizer::from_backends(vec![Box::new(FixedBackend(text))]).unwrap());
    let vad = VoiceActivityDetector::with_probe(vad_config(), Box::new(EnergyProbe::default())).unwrap();
    AsrSession::new(recognizer, vad, config)
}

fn sine(frames: usize) -> Vec<f32> {
    (0..frames)
        .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16_000.0).sin())
        .collect()
}

#[test]
fn silence_round_trip_emits_only_done() {
    let mut session = make_session("unused", session_config());

    // 1 s of zeros in 4096-sample chunks: interim status only
    for chunk in vec![0.0f32; 16_000].chunks(4_096) {
        let messages = session.on_audio(chunk).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Interim);
        assert!(messages[0].json.contains(r#""is_speech":false"#));
    }

    let messages = session.on_recognize().unwrap();
    let finals = messages.iter().filter(|m| m.kind == MessageKind::Final).count();
    let dones = messages.iter().filter(|m| m.kind == MessageKind::Done).count();
    assert_eq!(finals, 0);
    assert_eq!(dones, 1);
}

#[test]
fn streaming_speech_produces_final_then_done() {
    let mut session = make_session("hello world", session_config());

    let audio = sine(16_000);
    let mut all_kinds = Vec::new();
    for chunk in audio.chunks(4_096) {
        for msg in session.on_audio(chunk).unwrap() {
            all_kinds.push(msg.kind);
        }
    }

    let messages = session.on_recognize().unwrap();
    assert!(!messages.is_empty());
    assert_eq!(messages.last().unwrap().kind, MessageKind::Done);

    let final_msg = messages
        .iter()
        .find(|m| m.kind == MessageKind::Final)
        .expect("expected at least one final");
    assert!(final_msg.json.contains("hello world"));
    assert!(final_msg.json.contains(r#""type":"final""#));

    // During feeding every call produced interim status only
    assert!(all_kinds.iter().all(|&k| k == MessageKind::Interim));
}

#[test]
fn message_order_is_interims_then_finals_then_done() {
    let mut session = make_session("words", session_config());

    // Speech followed by enough silence to close the segment mid-stream
    let mut audio = sine(16_000);
    audio.extend(std::iter::repeat(0.0f32).take(16_000));

    let mut kinds = Vec::new();
    for chunk in audio.chunks(1_600) {
        for msg in session.on_audio(chunk).unwrap() {
            kinds.push(msg.kind);
        }
    }
    for msg in session.on_recognize().unwrap() {
        kinds.push(msg.kind);
    }

    // Exactly one final (segment closed by mid-stream silence), done last
    assert_eq!(kinds.iter().filter(|&&k| k == MessageKind::Final).count(), 1);
    assert_eq!(*kinds.last().unwrap(), MessageKind::Done);
    assert_eq!(kinds.iter().filter(|&&k| k == MessageKind::Done).count(), 1);

    // Everything before the final is interim status
    let final_pos = kinds.iter().position(|&k| k == MessageKind::Final).unwrap();
    assert!(kinds[..final_pos].iter().all(|&k| k == MessageKind::Interim));
}

#[test]
fn max_audio_guard_auto_finalizes() {
    let mut config = session_config();
    config.max_audio_sec = 1.0;
    let mut session = make_session("unused", config);

    // 100 ms chunks; the guard must fire before the 13th chunk
    let chunk = vec![0.0f32; 1_600];
    let mut done_at = None;
    for i in 0..12 {
        let messages = session.on_audio(&chunk).unwrap();
        if messages.iter().any(|m| m.kind == MessageKind::Done) {
            done_at = Some(i);
            break;
        }
    }
    let done_at = done_at.expect("auto-finalize never fired");
    assert!(done_at < 12, "done at chunk {}", done_at);

    // Subsequent audio is a no-op
    assert!(session.on_audio(&chunk).unwrap().is_empty());
    assert!(session.on_audio(&chunk).unwrap().is_empty());

    // The flag consumes itself: recognize emits nothing, no second done
    assert!(session.on_recognize().unwrap().is_empty());

    // After consumption the session accepts audio again
    let messages = session.on_audio(&chunk).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, MessageKind::Interim);
}

#[test]
fn window_discipline_holds_for_ragged_chunks() {
    struct CountingProbe {
        calls: Arc<AtomicUsize>,
        lengths: Arc<Mutex<Vec<usize>>>,
    }

    impl SpeechProbe for CountingProbe {
        fn probe(&mut self, samples: &[f32]) -> Result<f32, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.lengths.lock().unwrap().push(samples.len());
            Ok(0.0)
        }
        fn reset(&mut self) {}
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let lengths = Arc::new(Mutex::new(Vec::new()));
    let recognizer = Arc::new(Recognizer::from_backends(vec![Box::new(FixedBackend(""))]).unwrap());
    let mut config = vad_config();
    config.context_size = 64;
    let vad = VoiceActivityDetector::with_probe(
        config,
        Box::new(CountingProbe {
            calls: calls.clone(),
            lengths: lengths.clone(),
        }),
    )
    .unwrap();
    let mut session = AsrSession::new(recognizer, vad, session_config());

    // Ragged chunk sizes, deliberately not multiples of the window
    let mut fed = 0usize;
    for size in [700usize, 1, 511, 513, 4_096, 100] {
        session.on_audio(&vec![0.0f32; size]).unwrap();
        fed += size;
    }

    // The VAD saw only whole windows, each with its context prefix
    assert_eq!(calls.load(Ordering::SeqCst), fed / 512);
    assert!(lengths.lock().unwrap().iter().all(|&len| len == 64 + 512));
}

#[test]
fn segment_durations_stay_within_bounds() {
    struct DurationCheckBackend {
        min_samples: usize,
        max_samples: usize,
        seen: Arc<AtomicUsize>,
    }

    impl SttBackend for DurationCheckBackend {
        fn transcribe(&mut self, samples: &[f32], _rate: u32) -> Result<String, PipelineError> {
            assert!(samples.len() >= self.min_samples, "segment too short: {}", samples.len());
            assert!(samples.len() <= self.max_samples, "segment too long: {}", samples.len());
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok("ok".to_string())
        }
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let mut vconfig = vad_config();
    vconfig.max_speech_duration = 2.0;
    let recognizer = Arc::new(
        Recognizer::from_backends(vec![Box::new(DurationCheckBackend {
            min_samples: (0.25 * 16_000.0) as usize,
            // One-window grace over max_speech_duration
            max_samples: (2.0 * 16_000.0) as usize + 512,
            seen: seen.clone(),
        })])
        .unwrap(),
    );
    let vad = VoiceActivityDetector::with_probe(vconfig, Box::new(EnergyProbe::default())).unwrap();
    let mut session = AsrSession::new(recognizer, vad, session_config());

    // 5 s of continuous speech against a 2 s cap: repeated forced splits
    let audio = sine(80_000);
    for chunk in audio.chunks(4_096) {
        session.on_audio(chunk).unwrap();
    }
    session.on_recognize().unwrap();

    assert!(seen.load(Ordering::SeqCst) >= 2);
}

#[test]
fn reset_discards_pending_audio() {
    let mut session = make_session("ghost", session_config());

    // Speech that would transcribe if finalized
    let audio = sine(16_000);
    for chunk in audio.chunks(4_096) {
        session.on_audio(chunk).unwrap();
    }
    session.on_reset();

    // Nothing survives the reset
    let messages = session.on_recognize().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, MessageKind::Done);
}

#[test]
fn empty_transcript_counts_as_silence() {
    let mut session = make_session("", session_config());

    let audio = sine(16_000);
    for chunk in audio.chunks(4_096) {
        session.on_audio(chunk).unwrap();
    }
    let messages = session.on_recognize().unwrap();

    // Backend produced empty text: no final, just done
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, MessageKind::Done);
}

#[test]
fn interim_reports_cumulative_duration_and_rms() {
    let mut session = make_session("unused", session_config());

    let loud = vec![0.5f32; 1_600];
    let messages = session.on_audio(&loud).unwrap();
    let value: serde_json::Value = serde_json::from_str(&messages[0].json).unwrap();
    assert_eq!(value["type"], "interim");
    assert!((value["duration"].as_f64().unwrap() - 0.1).abs() < 1e-9);
    assert!((value["rms"].as_f64().unwrap() - 0.5).abs() < 1e-3);

    let messages = session.on_audio(&loud).unwrap();
    let value: serde_json::Value = serde_json::from_str(&messages[0].json).unwrap();
    assert!((value["duration"].as_f64().unwrap() - 0.2).abs() < 1e-9);
}
