//! Conformer CTC transcription backend
//!
//! Offline decode of one speech segment: mel spectrogram preprocessing,
//! conformer encoder (encoder.onnx), CTC decoder (ctc_decoder.onnx), greedy
//! collapse over the tokens.txt vocabulary. Built without the `onnx` feature
//! this is a stub that accepts audio and returns empty text, so the rest of
//! the pipeline stays testable without model files.

use crate::PipelineError;

use super::SttBackend;

#[cfg(feature = "onnx")]
use ndarray::Array3;

#[cfg(feature = "onnx")]
use ort::{GraphOptimizationLevel, Session};

const N_FFT: usize = 512;

/// Conformer CTC backend bound to one recognizer slot.
pub struct ConformerBackend {
    #[cfg(feature = "onnx")]
    encoder_session: Session,
    #[cfg(feature = "onnx")]
    decoder_session: Session,

    tokens: Vec<String>,
    blank_id: usize,
    mel: MelFilterbank,
    n_mels: usize,
}

impl ConformerBackend {
    /// Load model files from `model_dir`:
    /// - encoder.onnx
    /// - ctc_decoder.onnx
    /// - tokens.txt
    #[cfg(feature = "onnx")]
    pub fn load(
        model_dir: &str,
        n_mels: usize,
        sample_rate: u32,
        intra_threads: usize,
    ) -> Result<Self, PipelineError> {
        let dir = std::path::Path::new(model_dir);

        let encoder_session = Self::load_session(&dir.join("encoder.onnx"), intra_threads)?;
        let decoder_session = Self::load_session(&dir.join("ctc_decoder.onnx"), intra_threads)?;

        let tokens_text = std::fs::read_to_string(dir.join("tokens.txt"))
            .map_err(|e| PipelineError::Io(format!("Failed to read tokens.txt: {}", e)))?;
        let (tokens, blank_id) = parse_tokens(&tokens_text)?;

        Ok(Self {
            encoder_session,
            decoder_session,
            tokens,
            blank_id,
            mel: MelFilterbank::new(sample_rate as usize, N_FFT, n_mels),
            n_mels,
        })
    }

    /// Stub without ONNX: accepts audio, returns empty text.
    #[cfg(not(feature = "onnx"))]
    pub fn load(
        model_dir: &str,
        n_mels: usize,
        sample_rate: u32,
        _intra_threads: usize,
    ) -> Result<Self, PipelineError> {
        let _ = model_dir;
        Ok(Self {
            tokens: Vec::new(),
            blank_id: 0,
            mel: MelFilterbank::new(sample_rate as usize, N_FFT, n_mels),
            n_mels,
        })
    }

    #[cfg(feature = "onnx")]
    fn load_session(path: &std::path::Path, intra_threads: usize) -> Result<Session, PipelineError> {
        Session::builder()
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_intra_threads(intra_threads)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| PipelineError::Model(format!("Failed to load {}: {}", path.display(), e)))
    }

    #[cfg(feature = "onnx")]
    fn decode(&mut self, samples: &[f32]) -> Result<String, PipelineError> {
        let mel = self.mel.extract(samples);
        let n_frames = mel.len() / self.n_mels;
        if n_frames == 0 {
            return Ok(String::new());
        }

        let mel_input = Array3::from_shape_vec((1, n_frames, self.n_mels), mel)
            .map_err(|e| PipelineError::Backend(format!("Failed to reshape mel: {}", e)))?;

        let encoder_outputs = self
            .encoder_session
            .run(
                ort::inputs!["audio_signal" => mel_input.view()]
                    .map_err(|e| PipelineError::Model(e.to_string()))?,
            )
            .map_err(|e| PipelineError::Model(format!("Encoder failed: {}", e)))?;

        let encoded = encoder_outputs
            .get("encoded")
            .ok_or_else(|| PipelineError::Model("Missing encoded output".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let decoder_outputs = self
            .decoder_session
            .run(
                ort::inputs!["encoder_output" => encoded.view()]
                    .map_err(|e| PipelineError::Model(e.to_string()))?,
            )
            .map_err(|e| PipelineError::Model(format!("Decoder failed: {}", e)))?;

        let logits = decoder_outputs
            .get("logits")
            .or_else(|| decoder_outputs.get("log_probs"))
            .ok_or_else(|| PipelineError::Model("Missing logits output".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let logits_view = logits.view();
        let shape = logits_view.shape();
        if shape.len() < 3 {
            return Err(PipelineError::Model(format!(
                "Unexpected logits shape: {:?}",
                shape
            )));
        }
        let frames = shape[1];
        let vocab_size = shape[2];

        let ids = (0..frames).map(|t| {
            let mut best = 0;
            let mut best_score = f32::NEG_INFINITY;
            for v in 0..vocab_size {
                let score = logits_view[[0, t, v]];
                if score > best_score {
                    best_score = score;
                    best = v;
                }
            }
            best
        });

        Ok(collapse_ctc(ids, self.blank_id, &self.tokens))
    }

    #[cfg(not(feature = "onnx"))]
    fn decode(&mut self, _samples: &[f32]) -> Result<String, PipelineError> {
        Ok(String::new())
    }
}

impl SttBackend for ConformerBackend {
    fn transcribe(&mut self, samples: &[f32], _sample_rate: u32) -> Result<String, PipelineError> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        self.decode(samples)
    }
}

/// Parse a sherpa-style tokens file: one `<token> <id>` pair per line.
/// The blank token is `<blk>` when present, id 0 otherwise.
fn parse_tokens(text: &str) -> Result<(Vec<String>, usize), PipelineError> {
    let mut tokens = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some(token) => tokens.push(token.to_string()),
            None => continue,
        }
    }
    if tokens.is_empty() {
        return Err(PipelineError::Io("tokens.txt contains no tokens".to_string()));
    }
    let blank_id = tokens.iter().position(|t| t == "<blk>").unwrap_or(0);
    Ok((tokens, blank_id))
}

/// Greedy CTC collapse: drop repeats and blanks, join tokens, turn the
/// sentencepiece word-boundary marker into a space.
fn collapse_ctc(ids: impl Iterator<Item = usize>, blank_id: usize, tokens: &[String]) -> String {
    let mut text = String::new();
    let mut prev = blank_id;
    for id in ids {
        if id != blank_id && id != prev {
            if let Some(token) = tokens.get(id) {
                if let Some(rest) = token.strip_prefix('\u{2581}') {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(rest);
                } else {
                    text.push_str(token);
                }
            }
        }
        prev = id;
    }
    text
}

/// Mel filterbank preprocessing with real-signal FFT.
pub(crate) struct MelFilterbank {
    n_fft: usize,
    n_mels: usize,
    hop_length: usize,
    mel_filters: Vec<Vec<f32>>,
    hann_window: Vec<f32>,
    fft: std::sync::Arc<dyn realfft::RealToComplex<f32>>,
}

impl MelFilterbank {
    pub(crate) fn new(sample_rate: usize, n_fft: usize, n_mels: usize) -> Self {
        let hann_window: Vec<f32> = (0..n_fft)
            .map(|i| {
                let x = std::f32::consts::PI * i as f32 / (n_fft - 1) as f32;
                0.5 * (1.0 - (2.0 * x).cos())
            })
            .collect();

        let mel_filters = Self::create_mel_filters(sample_rate, n_fft, n_mels);

        let mut planner = realfft::RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);

        // 10ms hop
        let hop_length = sample_rate / 100;

        Self {
            n_fft,
            n_mels,
            hop_length,
            mel_filters,
            hann_window,
            fft,
        }
    }

    fn hz_to_mel(hz: f32) -> f32 {
        2595.0 * (1.0 + hz / 700.0).log10()
    }

    fn mel_to_hz(mel: f32) -> f32 {
        700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
    }

    fn create_mel_filters(sample_rate: usize, n_fft: usize, n_mels: usize) -> Vec<Vec<f32>> {
        let mel_min = Self::hz_to_mel(0.0);
        let mel_max = Self::hz_to_mel(sample_rate as f32 / 2.0);

        let mel_points: Vec<f32> = (0..n_mels + 2)
            .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
            .collect();
        let bin_points: Vec<usize> = mel_points
            .iter()
            .map(|&m| ((n_fft + 1) as f32 * Self::mel_to_hz(m) / sample_rate as f32).floor() as usize)
            .collect();

        let n_bins = n_fft / 2 + 1;
        let mut filters = vec![vec![0.0f32; n_bins]; n_mels];

        for i in 0..n_mels {
            let start = bin_points[i];
            let center = bin_points[i + 1];
            let end = bin_points[i + 2];

            for j in start..center {
                if center > start && j < n_bins {
                    filters[i][j] = (j - start) as f32 / (center - start) as f32;
                }
            }
            for j in center..end {
                if end > center && j < n_bins {
                    filters[i][j] = (end - j) as f32 / (end - center) as f32;
                }
            }
        }

        filters
    }

    /// Extract a log-mel spectrogram: `n_frames * n_mels` values.
    pub(crate) fn extract(&self, audio: &[f32]) -> Vec<f32> {
        let n_frames = audio.len().saturating_sub(self.n_fft) / self.hop_length + 1;
        if audio.len() < self.n_fft {
            return vec![0.0; self.n_mels];
        }

        let n_bins = self.n_fft / 2 + 1;
        let mut mel_spec = Vec::with_capacity(n_frames * self.n_mels);
        let mut windowed = vec![0.0f32; self.n_fft];
        let mut spectrum = vec![realfft::num_complex::Complex::new(0.0f32, 0.0f32); n_bins];

        for frame_idx in 0..n_frames {
            let start = frame_idx * self.hop_length;
            let frame = &audio[start..start + self.n_fft];
            for (w, (&s, &h)) in windowed
                .iter_mut()
                .zip(frame.iter().zip(self.hann_window.iter()))
            {
                *w = s * h;
            }

            let magnitudes: &[_] = if self.fft.process(&mut windowed, &mut spectrum).is_ok() {
                &spectrum
            } else {
                spectrum.fill(realfft::num_complex::Complex::new(0.0, 0.0));
                &spectrum
            };

            for filter in &self.mel_filters {
                let mut mel_energy = 0.0f32;
                for (c, &w) in magnitudes.iter().zip(filter.iter()) {
                    mel_energy += c.norm() * w;
                }
                mel_spec.push((mel_energy + 1e-10).ln());
            }
        }

        mel_spec
    }
}
