//! Speech-to-text backends and the recognizer pool
//!
//! Transcription backends are thread-safe but serialized: one decode at a
//! time per backend. The pool owns `pool_size` independent backends and
//! gates access so up to `pool_size` decodes run in parallel while further
//! callers block until a slot frees.

mod conformer;

pub use conformer::ConformerBackend;

use parking_lot::{Condvar, Mutex};

use crate::PipelineError;

/// A transcription backend bound to one pool slot.
pub trait SttBackend: Send {
    fn transcribe(&mut self, samples: &[f32], sample_rate: u32) -> Result<String, PipelineError>;
}

/// Recognizer pool configuration
#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    /// Directory containing encoder.onnx, ctc_decoder.onnx, tokens.txt
    pub model_dir: String,
    /// Total inference threads, partitioned across slots
    pub num_threads: usize,
    /// Number of slots
    pub pool_size: usize,
    /// Expected input sample rate
    pub sample_rate: u32,
    /// Mel feature dimension
    pub feature_dim: usize,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            model_dir: "models/asr".to_string(),
            num_threads: 4,
            pool_size: 1,
            sample_rate: 16_000,
            feature_dim: 64,
        }
    }
}

struct Slot {
    backend: Mutex<Box<dyn SttBackend>>,
}

/// Fixed pool of transcription backends.
///
/// Acquisition linearly scans the in-use flags under a mutex; a condition
/// variable wakes waiters on release. The decode itself runs without the
/// pool lock, so slots decode in parallel.
pub struct Recognizer {
    slots: Vec<Slot>,
    in_use: Mutex<Vec<bool>>,
    available: Condvar,
}

impl Recognizer {
    /// Build a pool of [`ConformerBackend`] slots. The total thread budget
    /// is partitioned: each slot gets `max(1, num_threads / pool_size)`
    /// intra-op threads. A slot that fails to load drops the slots created
    /// before it and fails the constructor.
    pub fn new(config: &RecognizerConfig) -> Result<Self, PipelineError> {
        let pool_size = config.pool_size.max(1);
        let threads_per_slot = (config.num_threads / pool_size).max(1);

        let mut backends: Vec<Box<dyn SttBackend>> = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let backend = ConformerBackend::load(
                &config.model_dir,
                config.feature_dim,
                config.sample_rate,
                threads_per_slot,
            )?;
            backends.push(Box::new(backend));
        }

        tracing::info!(pool_size, threads_per_slot, "Recognizer pool initialized");
        Self::from_backends(backends)
    }

    /// Build a pool from pre-constructed backends.
    pub fn from_backends(backends: Vec<Box<dyn SttBackend>>) -> Result<Self, PipelineError> {
        if backends.is_empty() {
            return Err(PipelineError::Backend(
                "recognizer pool must have at least one slot".to_string(),
            ));
        }
        let in_use = vec![false; backends.len()];
        let slots = backends
            .into_iter()
            .map(|backend| Slot {
                backend: Mutex::new(backend),
            })
            .collect();
        Ok(Self {
            slots,
            in_use: Mutex::new(in_use),
            available: Condvar::new(),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// Transcribe a segment. Thread-safe; blocks when all slots are busy.
    ///
    /// Empty input returns empty text without touching the pool. The result
    /// is trimmed of ASCII whitespace. A transient backend failure releases
    /// the slot, logs, and returns empty text.
    pub fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String, PipelineError> {
        if samples.is_empty() {
            return Ok(String::new());
        }

        let slot_idx = {
            let mut in_use = self.in_use.lock();
            loop {
                if let Some(idx) = in_use.iter().position(|&busy| !busy) {
                    in_use[idx] = true;
                    break idx;
                }
                self.available.wait(&mut in_use);
            }
        };

        // Decode without the pool lock so slots run in parallel
        let result = {
            let mut backend = self.slots[slot_idx].backend.lock();
            backend.transcribe(samples, sample_rate)
        };

        {
            let mut in_use = self.in_use.lock();
            in_use[slot_idx] = false;
        }
        self.available.notify_one();

        match result {
            Ok(mut text) => {
                let end = text.trim_end().len();
                text.truncate(end);
                let start = text.len() - text.trim_start().len();
                if start > 0 {
                    text.drain(..start);
                }
                Ok(text)
            }
            Err(e) => {
                tracing::error!("Transcription failed: {}", e);
                Ok(String::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct FixedBackend {
        text: &'static str,
    }

    impl SttBackend for FixedBackend {
        fn transcribe(&mut self, _samples: &[f32], _rate: u32) -> Result<String, PipelineError> {
            Ok(self.text.to_string())
        }
    }

    struct SlowBackend {
        delay: Duration,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl SttBackend for SlowBackend {
        fn transcribe(&mut self, _samples: &[f32], _rate: u32) -> Result<String, PipelineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok("ok".to_string())
        }
    }

    struct FailingBackend;

    impl SttBackend for FailingBackend {
        fn transcribe(&mut self, _samples: &[f32], _rate: u32) -> Result<String, PipelineError> {
            Err(PipelineError::Backend("stream creation failed".to_string()))
        }
    }

    #[test]
    fn test_empty_input_skips_pool() {
        let pool = Recognizer::from_backends(vec![Box::new(FailingBackend)]).unwrap();
        // Even a failing backend is never touched for empty input
        assert_eq!(pool.transcribe(&[], 16_000).unwrap(), "");
    }

    #[test]
    fn test_result_is_trimmed() {
        let pool =
            Recognizer::from_backends(vec![Box::new(FixedBackend { text: "  hello world \n" })])
                .unwrap();
        let text = pool.transcribe(&[0.0; 160], 16_000).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_transient_failure_yields_empty_text() {
        let pool = Recognizer::from_backends(vec![Box::new(FailingBackend)]).unwrap();
        assert_eq!(pool.transcribe(&[0.0; 160], 16_000).unwrap(), "");
        // Slot was released: a second call still works
        assert_eq!(pool.transcribe(&[0.0; 160], 16_000).unwrap(), "");
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(Recognizer::from_backends(Vec::new()).is_err());
    }

    #[test]
    fn test_concurrent_calls_respect_pool_bound() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(100);

        let backends: Vec<Box<dyn SttBackend>> = (0..2)
            .map(|_| {
                Box::new(SlowBackend {
                    delay,
                    active: active.clone(),
                    peak: peak.clone(),
                }) as Box<dyn SttBackend>
            })
            .collect();
        let pool = Arc::new(Recognizer::from_backends(backends).unwrap());

        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.transcribe(&[0.0; 16_000], 16_000).unwrap())
            })
            .collect();
        for handle in handles {
            let text = handle.join().unwrap();
            assert_eq!(text, "ok");
        }
        let elapsed = start.elapsed();

        // Two waves of two parallel decodes: well under 4x the single-call
        // latency, and never more than pool_size decodes at once
        assert!(elapsed < delay * 4, "elapsed {:?}", elapsed);
        assert!(elapsed >= delay * 2, "elapsed {:?}", elapsed);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
