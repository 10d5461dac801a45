//! Session hot-path benchmarks
//!
//! Run with: cargo bench -p asr-server --bench session_bench
//!
//! The silence path exercises the steady-state status loop: after warm-up,
//! pending accumulation, VAD windows, and interim formatting all reuse
//! pre-allocated buffers.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use asr_pipeline::{
    EnergyProbe, PipelineError, Recognizer, SttBackend, VadConfig, VoiceActivityDetector,
};
use asr_server::{AsrSession, SessionConfig};

struct EmptyBackend;

impl SttBackend for EmptyBackend {
    fn transcribe(&mut self, _samples: &[f32], _rate: u32) -> Result<String, PipelineError> {
        Ok(String::new())
    }
}

fn make_session() -> AsrSession {
    let recognizer = Arc::new(Recognizer::from_backends(vec![Box::new(EmptyBackend)]).unwrap());
    let vad_config = VadConfig {
        sample_rate: 16_000,
        window_size: 512,
        context_size: 64,
        ..VadConfig::default()
    };
    let vad = VoiceActivityDetector::with_probe(vad_config, Box::new(EnergyProbe::default())).unwrap();
    let config = SessionConfig {
        sample_rate: 16_000,
        window_size: 512,
        min_audio_sec: 0.5,
        // Effectively unbounded so the guard never fires mid-benchmark
        max_audio_sec: f32::MAX,
    };
    AsrSession::new(recognizer, vad, config)
}

fn bench_on_audio_silence(c: &mut Criterion) {
    let mut group = c.benchmark_group("session");

    for &chunk_size in &[1_600usize, 4_096] {
        let chunk = vec![0.0f32; chunk_size];
        let mut session = make_session();

        // Warm-up establishes the buffer high-water marks
        for _ in 0..5 {
            session.on_audio(&chunk).unwrap();
        }

        group.throughput(Throughput::Elements(chunk_size as u64));
        group.bench_function(format!("on_audio_silence_{}", chunk_size), |b| {
            b.iter(|| session.on_audio(&chunk).unwrap().len())
        });
    }

    group.finish();
}

fn bench_on_audio_speech(c: &mut Criterion) {
    let mut group = c.benchmark_group("session");

    let chunk: Vec<f32> = (0..4_096)
        .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16_000.0).sin())
        .collect();
    let mut session = make_session();

    group.throughput(Throughput::Elements(4_096));
    group.bench_function("on_audio_speech_4096", |b| {
        b.iter(|| session.on_audio(&chunk).unwrap().len())
    });

    group.finish();
}

criterion_group!(benches, bench_on_audio_silence, bench_on_audio_speech);
criterion_main!(benches);
