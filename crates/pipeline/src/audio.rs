//! Audio decode, resampling, and level measurement
//!
//! One-shot WAV decode uses the FFT resampler (highest quality); the
//! streaming path uses a polynomial resampler with a much shorter filter,
//! trading a little quality for latency.

use std::io::Cursor;

use rubato::{FastFixedIn, FftFixedIn, PolynomialDegree, Resampler};

use crate::PipelineError;

/// Frames beyond this are rejected (1 hour at 48 kHz)
const MAX_WAV_FRAMES: u32 = 48_000 * 3600;

/// Chunk size for whole-buffer FFT resampling
const FFT_CHUNK: usize = 1024;

/// Decoded mono audio, normalized to [-1, 1]
#[derive(Debug, Clone)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub duration_sec: f32,
}

/// Decode a WAV container from memory and resample to `target_rate`.
///
/// Mono only; int16/int24/int32/float32 sample formats are accepted and
/// normalized to float.
pub fn decode_wav(data: &[u8], target_rate: u32) -> Result<AudioData, PipelineError> {
    if data.is_empty() {
        return Err(PipelineError::Audio("Empty audio data".to_string()));
    }

    let mut reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| PipelineError::Audio(format!("Failed to decode WAV file: {}", e)))?;

    let spec = reader.spec();
    if spec.channels != 1 {
        return Err(PipelineError::Audio(format!(
            "Only mono audio is supported, got {} channels",
            spec.channels
        )));
    }

    let total_frames = reader.duration();
    if total_frames == 0 {
        return Err(PipelineError::Audio("WAV file contains no audio frames".to_string()));
    }
    if total_frames > MAX_WAV_FRAMES {
        return Err(PipelineError::Audio(format!(
            "WAV file too long: {} frames exceeds 1-hour limit",
            total_frames
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::Audio(format!("Failed to read PCM frames: {}", e)))?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| PipelineError::Audio(format!("Failed to read PCM frames: {}", e)))?
        }
    };

    if samples.is_empty() {
        return Err(PipelineError::Audio("Failed to read PCM frames from WAV".to_string()));
    }

    let samples = if spec.sample_rate != target_rate {
        resample_buffer(&samples, spec.sample_rate, target_rate)?
    } else {
        samples
    };

    let duration_sec = samples.len() as f32 / target_rate as f32;
    Ok(AudioData { samples, duration_sec })
}

/// Whole-buffer conversion for one-shot decode. Failures surface as audio
/// errors: to the upload client a resampling failure is an undecodable file.
fn resample_buffer(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, PipelineError> {
    let mut resampler = FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, FFT_CHUNK, 2, 1)
        .map_err(|e| PipelineError::Audio(format!("Failed to create resampler: {}", e)))?;

    let input: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
    let ratio = to_rate as f64 / from_rate as f64;
    let mut output: Vec<f32> = Vec::with_capacity((samples.len() as f64 * ratio).ceil() as usize + FFT_CHUNK);

    let mut pos = 0;
    while input.len() - pos >= FFT_CHUNK {
        let frames = resampler
            .process(&[&input[pos..pos + FFT_CHUNK]], None)
            .map_err(|e| PipelineError::Audio(format!("Resampling failed: {}", e)))?;
        output.extend(frames[0].iter().map(|&s| s as f32));
        pos += FFT_CHUNK;
    }

    if pos < input.len() {
        let frames = resampler
            .process_partial(Some(&[&input[pos..]]), None)
            .map_err(|e| PipelineError::Audio(format!("Resampling failed: {}", e)))?;
        output.extend(frames[0].iter().map(|&s| s as f32));
    }

    // Drain the filter tail
    let none: Option<&[&[f64]]> = None;
    let frames = resampler
        .process_partial(none, None)
        .map_err(|e| PipelineError::Audio(format!("Resampler drain failed: {}", e)))?;
    output.extend(frames[0].iter().map(|&s| s as f32));

    Ok(output)
}

/// Streaming resampler for real-time audio.
///
/// Accepts arbitrary-size input chunks, converts in fixed internal chunks,
/// and returns a view into an internal buffer. The view is invalidated by
/// the next `process` or `flush` call on the same instance. The output
/// buffer grows to its high-water mark and never shrinks, so steady-state
/// calls do not allocate.
pub struct StreamResampler {
    inner: FastFixedIn<f32>,
    chunk_in: usize,
    pending: Vec<f32>,
    scratch: Vec<Vec<f32>>,
    output: Vec<f32>,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, PipelineError> {
        if input_rate == 0 || output_rate == 0 {
            return Err(PipelineError::Resample(format!(
                "invalid rates: {} -> {}",
                input_rate, output_rate
            )));
        }

        let ratio = output_rate as f64 / input_rate as f64;
        // ~20ms internal chunks keep conversion latency below a VAD window
        let chunk_in = (input_rate as usize / 50).max(64);
        let inner = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Septic, chunk_in, 1)
            .map_err(|e| PipelineError::Resample(format!("Failed to create resampler: {}", e)))?;
        let scratch = vec![vec![0.0f32; inner.output_frames_max()]];

        Ok(Self {
            inner,
            chunk_in,
            pending: Vec::with_capacity(chunk_in * 2),
            scratch,
            output: Vec::new(),
        })
    }

    /// Resample `input`. Returns a view of the internal buffer, valid until
    /// the next call on this instance.
    pub fn process(&mut self, input: &[f32]) -> Result<&[f32], PipelineError> {
        self.output.clear();
        self.pending.extend_from_slice(input);

        let mut consumed = 0;
        while self.pending.len() - consumed >= self.chunk_in {
            let (used, written) = self
                .inner
                .process_into_buffer(
                    &[&self.pending[consumed..consumed + self.chunk_in]],
                    &mut self.scratch,
                    None,
                )
                .map_err(|e| PipelineError::Resample(format!("Resampling failed: {}", e)))?;
            consumed += used;
            self.output.extend_from_slice(&self.scratch[0][..written]);
        }
        self.pending.drain(..consumed);

        Ok(&self.output)
    }

    /// Drain the remaining partial chunk and the filter tail, then reset the
    /// converter so the instance can be reused. Call once per stream end.
    pub fn flush(&mut self) -> Result<&[f32], PipelineError> {
        self.output.clear();

        if !self.pending.is_empty() {
            let (_, written) = self
                .inner
                .process_partial_into_buffer(Some(&[&self.pending[..]]), &mut self.scratch, None)
                .map_err(|e| PipelineError::Resample(format!("Resampler flush failed: {}", e)))?;
            self.output.extend_from_slice(&self.scratch[0][..written]);
            self.pending.clear();
        }

        let none: Option<&[&[f32]]> = None;
        let (_, written) = self
            .inner
            .process_partial_into_buffer(none, &mut self.scratch, None)
            .map_err(|e| PipelineError::Resample(format!("Resampler flush failed: {}", e)))?;
        self.output.extend_from_slice(&self.scratch[0][..written]);

        self.inner.reset();
        Ok(&self.output)
    }
}

/// RMS of an audio slice; 0.0 on empty input.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| s as f64 * s as f64).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, frames: usize, amplitude: f32) -> Vec<f32> {
        (0..frames)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    fn wav_f32(sample_rate: u32, channels: u16, samples: &[f32]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_rms_of_sine_is_amplitude_over_sqrt2() {
        // Integer number of cycles: 440 Hz over exactly 1 s at 16 kHz
        let samples = sine(440.0, 16_000, 16_000, 0.8);
        let rms = compute_rms(&samples);
        let expected = 0.8 / 2.0f32.sqrt();
        assert!(
            (rms - expected).abs() / expected < 0.01,
            "rms {} vs expected {}",
            rms,
            expected
        );
    }

    #[test]
    fn test_rms_empty_is_zero() {
        assert_eq!(compute_rms(&[]), 0.0);
    }

    #[test]
    fn test_rms_zeros_is_zero() {
        assert_eq!(compute_rms(&[0.0; 512]), 0.0);
    }

    #[test]
    fn test_decode_mono_sine_roundtrip() {
        let input = sine(440.0, 16_000, 16_000, 0.5);
        let data = wav_f32(16_000, 1, &input);

        let audio = decode_wav(&data, 16_000).unwrap();
        assert!((audio.duration_sec - 1.0).abs() < 1e-3);
        assert_eq!(audio.samples.len(), input.len());
        for (a, b) in audio.samples.iter().zip(input.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_decode_rejects_stereo() {
        let input = vec![0.1f32; 640];
        let data = wav_f32(16_000, 2, &input);
        let err = decode_wav(&data, 16_000).unwrap_err();
        assert!(err.is_invalid_audio());
        assert!(err.to_string().contains("mono"));
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(decode_wav(&[], 16_000).is_err());
        assert!(decode_wav(&[0u8, 1, 2, 3], 16_000).is_err());
    }

    #[test]
    fn test_decode_int16_normalizes() {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..160 {
            writer.write_sample(16_384i16).unwrap();
        }
        writer.finalize().unwrap();

        let audio = decode_wav(&cursor.into_inner(), 16_000).unwrap();
        for &s in &audio.samples {
            assert!((s - 0.5).abs() < 1e-4, "sample {}", s);
        }
    }

    #[test]
    fn test_decode_resamples_to_target() {
        let input = sine(440.0, 48_000, 48_000, 0.5);
        let data = wav_f32(48_000, 1, &input);

        let audio = decode_wav(&data, 16_000).unwrap();
        // 1 s of audio at any rate stays ~1 s; allow for filter transients
        let expected = 16_000i64;
        assert!(
            (audio.samples.len() as i64 - expected).abs() <= 256,
            "expected ~{}, got {}",
            expected,
            audio.samples.len()
        );
    }

    #[test]
    fn test_stream_resampler_length() {
        let mut rs = StreamResampler::new(48_000, 16_000).unwrap();
        let input = sine(440.0, 48_000, 4_800, 0.5);

        let mut total = rs.process(&input).unwrap().len();
        total += rs.flush().unwrap().len();

        let expected = 1_600i64;
        assert!(
            (total as i64 - expected).abs() <= 256,
            "expected ~{}, got {}",
            expected,
            total
        );
    }

    #[test]
    fn test_stream_resampler_arbitrary_chunks() {
        // Chunk sizes smaller and larger than the internal chunk both work
        let mut rs = StreamResampler::new(44_100, 16_000).unwrap();
        let input = sine(440.0, 44_100, 44_100, 0.5);

        let mut total = 0;
        for chunk in input.chunks(777) {
            total += rs.process(chunk).unwrap().len();
        }
        total += rs.flush().unwrap().len();

        let expected = 16_000i64;
        assert!(
            (total as i64 - expected).abs() <= 512,
            "expected ~{}, got {}",
            expected,
            total
        );
    }

    #[test]
    fn test_stream_resampler_reusable_after_flush() {
        let mut rs = StreamResampler::new(48_000, 16_000).unwrap();

        for _ in 0..2 {
            let input = vec![0.25f32; 4_800];
            let mut total = rs.process(&input).unwrap().len();
            total += rs.flush().unwrap().len();
            assert!(
                (total as i64 - 1_600).abs() <= 256,
                "unexpected output length {}",
                total
            );
        }
    }

    #[test]
    fn test_stream_resampler_rejects_zero_rate() {
        assert!(StreamResampler::new(0, 16_000).is_err());
        assert!(StreamResampler::new(16_000, 0).is_err());
    }
}
