//! Voice Activity Detection
//!
//! A hysteresis state machine over per-window speech probabilities turns a
//! sample stream into bounded speech segments. The probability source is
//! pluggable: the Silero ONNX model in production, an energy probe for
//! development and tests.

use std::collections::VecDeque;

use crate::audio::compute_rms;
use crate::PipelineError;

/// VAD configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    pub model_path: String,
    pub threshold: f32,
    pub min_silence_duration: f32,
    pub min_speech_duration: f32,
    pub max_speech_duration: f32,
    pub sample_rate: u32,
    pub window_size: usize,
    pub context_size: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            model_path: "models/silero_vad.onnx".to_string(),
            threshold: 0.5,
            min_silence_duration: 0.5,
            min_speech_duration: 0.25,
            max_speech_duration: 20.0,
            sample_rate: 16_000,
            window_size: 512,
            context_size: 64,
        }
    }
}

/// A contiguous run of speech samples, emitted atomically for transcription.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub samples: Vec<f32>,
}

impl SpeechSegment {
    pub fn duration_sec(&self, sample_rate: u32) -> f32 {
        self.samples.len() as f32 / sample_rate as f32
    }
}

/// Per-window speech probability source.
///
/// `samples` is the concatenated `[context | window]` buffer. Implementations
/// carry any recurrent state across calls; `reset` wipes it.
pub trait SpeechProbe: Send {
    fn probe(&mut self, samples: &[f32]) -> Result<f32, PipelineError>;
    fn reset(&mut self);
}

/// Energy-threshold probe. Stateless; used when the crate is built without
/// the `onnx` feature and by tests that need deterministic decisions.
#[derive(Debug, Clone)]
pub struct EnergyProbe {
    rms_threshold: f32,
}

impl EnergyProbe {
    pub fn new(rms_threshold: f32) -> Self {
        Self { rms_threshold }
    }
}

impl Default for EnergyProbe {
    fn default() -> Self {
        Self { rms_threshold: 0.01 }
    }
}

impl SpeechProbe for EnergyProbe {
    fn probe(&mut self, samples: &[f32]) -> Result<f32, PipelineError> {
        Ok(if compute_rms(samples) >= self.rms_threshold {
            1.0
        } else {
            0.0
        })
    }

    fn reset(&mut self) {}
}

/// Silero VAD probe over ONNX Runtime.
///
/// The model takes `[context | window]` samples, a recurrent state of shape
/// (2, 1, 128), and a scalar sample rate; it returns a speech probability
/// and the next state. All buffers are pre-allocated at construction.
#[cfg(feature = "onnx")]
pub use silero::SileroProbe;

#[cfg(feature = "onnx")]
mod silero {
    use ort::{GraphOptimizationLevel, Session};

    use super::SpeechProbe;
    use crate::PipelineError;

    const STATE_LEN: usize = 2 * 1 * 128;

    pub struct SileroProbe {
        session: Session,
        state: Vec<f32>,
        state_scratch: Vec<f32>,
        sr: [i64; 1],
    }

    impl SileroProbe {
        pub fn load(model_path: &str, sample_rate: u32) -> Result<Self, PipelineError> {
            let session = Session::builder()
                .map_err(|e| PipelineError::Model(e.to_string()))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| PipelineError::Model(e.to_string()))?
                .with_intra_threads(1)
                .map_err(|e| PipelineError::Model(e.to_string()))?
                .commit_from_file(model_path)
                .map_err(|e| {
                    PipelineError::Model(format!("Failed to load {}: {}", model_path, e))
                })?;

            Ok(Self {
                session,
                state: vec![0.0; STATE_LEN],
                state_scratch: vec![0.0; STATE_LEN],
                sr: [sample_rate as i64],
            })
        }
    }

    impl SpeechProbe for SileroProbe {
        fn probe(&mut self, samples: &[f32]) -> Result<f32, PipelineError> {
            let input = ndarray::ArrayView2::from_shape((1, samples.len()), samples)
                .map_err(|e| PipelineError::Vad(e.to_string()))?;
            let state = ndarray::ArrayView3::from_shape((2, 1, 128), &self.state)
                .map_err(|e| PipelineError::Vad(e.to_string()))?;
            let sr = ndarray::ArrayView1::from_shape(1, &self.sr)
                .map_err(|e| PipelineError::Vad(e.to_string()))?;

            let prob = {
                let outputs = self
                    .session
                    .run(
                        ort::inputs![
                            "input" => input,
                            "state" => state,
                            "sr" => sr,
                        ]
                        .map_err(|e| PipelineError::Model(e.to_string()))?,
                    )
                    .map_err(|e| PipelineError::Model(format!("VAD inference failed: {}", e)))?;

                let prob_tensor = outputs
                    .get("output")
                    .ok_or_else(|| PipelineError::Model("Missing output tensor".to_string()))?
                    .try_extract_tensor::<f32>()
                    .map_err(|e| PipelineError::Model(e.to_string()))?;
                let prob = prob_tensor.iter().copied().next().unwrap_or(0.0);

                let next_state = outputs
                    .get("stateN")
                    .ok_or_else(|| PipelineError::Model("Missing stateN tensor".to_string()))?
                    .try_extract_tensor::<f32>()
                    .map_err(|e| PipelineError::Model(e.to_string()))?;
                for (dst, src) in self.state_scratch.iter_mut().zip(next_state.iter()) {
                    *dst = *src;
                }

                prob
            };

            self.state.copy_from_slice(&self.state_scratch);
            Ok(prob)
        }

        fn reset(&mut self) {
            self.state.fill(0.0);
        }
    }
}

/// Hysteresis segmenter over per-window speech probabilities.
pub struct VoiceActivityDetector {
    config: VadConfig,
    probe: Box<dyn SpeechProbe>,

    // Pre-allocated [context | window] inference input
    input_buf: Vec<f32>,
    context: Vec<f32>,

    in_speech: bool,
    silence_samples: u64,
    segment_samples: u64,
    speech_buf: Vec<f32>,
    segments: VecDeque<SpeechSegment>,
}

impl VoiceActivityDetector {
    /// Build a detector with the default probe: Silero when built with the
    /// `onnx` feature, the energy probe otherwise.
    #[cfg(feature = "onnx")]
    pub fn new(config: VadConfig) -> Result<Self, PipelineError> {
        let probe = SileroProbe::load(&config.model_path, config.sample_rate)?;
        Self::with_probe(config, Box::new(probe))
    }

    #[cfg(not(feature = "onnx"))]
    pub fn new(config: VadConfig) -> Result<Self, PipelineError> {
        Self::with_probe(config, Box::new(EnergyProbe::default()))
    }

    pub fn with_probe(config: VadConfig, probe: Box<dyn SpeechProbe>) -> Result<Self, PipelineError> {
        if config.window_size == 0 {
            return Err(PipelineError::Vad("window_size must be positive".to_string()));
        }
        if config.context_size >= config.window_size {
            return Err(PipelineError::Vad(format!(
                "context_size must be in [0, window_size), got {}",
                config.context_size
            )));
        }
        if config.sample_rate == 0 {
            return Err(PipelineError::Vad("sample_rate must be positive".to_string()));
        }
        if config.threshold <= 0.0 || config.threshold >= 1.0 {
            return Err(PipelineError::Vad(format!(
                "threshold must be in (0, 1), got {}",
                config.threshold
            )));
        }

        let speech_capacity = (config.max_speech_duration * config.sample_rate as f32) as usize;
        let detector = Self {
            input_buf: vec![0.0; config.context_size + config.window_size],
            context: vec![0.0; config.context_size],
            in_speech: false,
            silence_samples: 0,
            segment_samples: 0,
            speech_buf: Vec::with_capacity(speech_capacity),
            segments: VecDeque::new(),
            probe,
            config,
        };

        tracing::info!(
            threshold = detector.config.threshold,
            window = detector.config.window_size,
            context = detector.config.context_size,
            "VAD initialized"
        );
        Ok(detector)
    }

    /// Feed exactly `window_size` samples.
    pub fn accept(&mut self, samples: &[f32]) -> Result<(), PipelineError> {
        if samples.len() != self.config.window_size {
            return Err(PipelineError::WindowSize {
                expected: self.config.window_size,
                got: samples.len(),
            });
        }

        let prob = self.infer(samples)?;

        let window_samples = self.config.window_size as u64;
        let min_silence_samples =
            (self.config.min_silence_duration * self.config.sample_rate as f32) as u64;
        let max_speech_samples =
            (self.config.max_speech_duration * self.config.sample_rate as f32) as u64;

        if prob >= self.config.threshold {
            if !self.in_speech {
                self.in_speech = true;
                self.segment_samples = 0;
                self.speech_buf.clear();
            }
            self.silence_samples = 0;
            self.speech_buf.extend_from_slice(samples);
            self.segment_samples += window_samples;

            if self.segment_samples >= max_speech_samples {
                tracing::debug!(samples = self.segment_samples, "VAD: force-split");
                self.finalize_segment();
            }
        } else if self.in_speech {
            self.silence_samples += window_samples;
            self.speech_buf.extend_from_slice(samples);
            self.segment_samples += window_samples;

            if self.silence_samples >= min_silence_samples {
                self.finalize_segment();
            }
        }
        // Silence while not in speech is ignored

        Ok(())
    }

    fn infer(&mut self, samples: &[f32]) -> Result<f32, PipelineError> {
        let ctx = self.config.context_size;
        self.input_buf[..ctx].copy_from_slice(&self.context);
        self.input_buf[ctx..].copy_from_slice(samples);

        let prob = self.probe.probe(&self.input_buf)?;

        if ctx > 0 {
            self.context
                .copy_from_slice(&samples[self.config.window_size - ctx..]);
        }
        Ok(prob)
    }

    fn finalize_segment(&mut self) {
        if self.speech_buf.is_empty() {
            self.in_speech = false;
            self.silence_samples = 0;
            self.segment_samples = 0;
            return;
        }

        let duration = self.speech_buf.len() as f32 / self.config.sample_rate as f32;
        if duration < self.config.min_speech_duration {
            tracing::debug!(
                duration,
                min = self.config.min_speech_duration,
                "VAD: discarding short segment"
            );
            self.in_speech = false;
            self.silence_samples = 0;
            self.segment_samples = 0;
            self.speech_buf.clear();
            return;
        }

        // Move the flat buffer into the segment, then re-reserve so
        // subsequent appends stay allocation-free.
        let samples = std::mem::take(&mut self.speech_buf);
        self.segments.push_back(SpeechSegment { samples });

        self.in_speech = false;
        self.silence_samples = 0;
        self.segment_samples = 0;
        let capacity = (self.config.max_speech_duration * self.config.sample_rate as f32) as usize;
        self.speech_buf.reserve(capacity);
    }

    pub fn empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn front(&self) -> Option<&SpeechSegment> {
        self.segments.front()
    }

    pub fn pop(&mut self) -> Option<SpeechSegment> {
        self.segments.pop_front()
    }

    pub fn is_speech(&self) -> bool {
        self.in_speech
    }

    /// Force finalization of the in-progress run without resetting state.
    pub fn flush(&mut self) {
        if self.in_speech && !self.speech_buf.is_empty() {
            self.finalize_segment();
        }
    }

    /// Wipe all state: segments, counters, context, and probe state.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.silence_samples = 0;
        self.segment_samples = 0;
        self.speech_buf.clear();
        self.segments.clear();
        self.context.fill(0.0);
        self.probe.reset();
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}
