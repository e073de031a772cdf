//! Two-thread recording pipeline.
//!
//! The capture thread pulls frame-aligned audio from a `CaptureSource`,
//! applies gain and metering, and pushes into the lock-free ring. The
//! storage thread drains the ring in bounded chunks into an
//! `AudioSink`. The ring never blocks the capture side: when storage
//! falls behind, bytes are dropped and counted rather than queued.
//!
//! Shutdown order matters: the capture thread is joined first so
//! nothing new enters the ring, then the storage thread drains what
//! remains and closes the sink. Every byte the ring accepted reaches
//! the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::models::config::CaptureConfiguration;
use crate::models::error::CaptureError;
use crate::models::state::PipelineStats;
use crate::processing::gain::apply_gain_s24le;
use crate::processing::ring_buffer::{spsc_ring, RingConsumer, RingProducer};
use crate::traits::audio_sink::AudioSink;
use crate::traits::capture_source::CaptureSource;

/// Storage-thread wait when the ring is empty.
const IDLE_WAIT: Duration = Duration::from_millis(20);
/// Capture-thread pause when the source has nothing.
const SOURCE_IDLE_WAIT: Duration = Duration::from_millis(1);
/// Drop-warning suppression interval (in drop events).
const DROP_LOG_EVERY: u64 = 256;
/// Staging buffer when the source does not suggest one.
const DEFAULT_STAGING: usize = 16 * 1024;

/// A running capture-to-storage pipeline.
pub struct RecordingSession {
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<PipelineStats>>,
    wakeup: Arc<(Mutex<()>, Condvar)>,
    capture_thread: Option<JoinHandle<()>>,
    storage_thread: Option<JoinHandle<Result<(), CaptureError>>>,
}

impl RecordingSession {
    /// Open the sink and spawn both pipeline threads.
    ///
    /// `sample_rate` is the device's effective rate, which is what the
    /// sink must be told, not the requested one.
    pub fn start<S, K>(
        source: S,
        mut sink: K,
        config: &CaptureConfiguration,
        sample_rate: u32,
    ) -> Result<Self, CaptureError>
    where
        S: CaptureSource + 'static,
        K: AudioSink + 'static,
    {
        config.validate().map_err(CaptureError::ConfigurationFailed)?;
        sink.open(sample_rate, config.channels, config.bytes_per_sample * 8)?;

        let (producer, consumer) = spsc_ring(config.ring_capacity);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(PipelineStats::default()));
        let wakeup = Arc::new((Mutex::new(()), Condvar::new()));

        let capture_thread = thread::Builder::new()
            .name("array-capture".into())
            .spawn({
                let running = Arc::clone(&running);
                let stats = Arc::clone(&stats);
                let wakeup = Arc::clone(&wakeup);
                let gain = config.gain;
                let meter = config.bytes_per_sample == 3;
                move || capture_loop(source, producer, running, stats, wakeup, gain, meter)
            })
            .map_err(|e| CaptureError::StorageError(format!("spawn capture thread: {e}")))?;

        let storage_thread = thread::Builder::new()
            .name("array-storage".into())
            .spawn({
                let running = Arc::clone(&running);
                let stats = Arc::clone(&stats);
                let wakeup = Arc::clone(&wakeup);
                let chunk = config.storage_chunk;
                move || storage_loop(sink, consumer, running, stats, wakeup, chunk)
            })
            .map_err(|e| CaptureError::StorageError(format!("spawn storage thread: {e}")))?;

        Ok(Self {
            running,
            stats,
            wakeup,
            capture_thread: Some(capture_thread),
            storage_thread: Some(storage_thread),
        })
    }

    /// Snapshot of the pipeline counters.
    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop both threads and flush everything the ring accepted.
    pub fn stop(mut self) -> Result<PipelineStats, CaptureError> {
        self.shutdown()?;
        Ok(self.stats.lock().clone())
    }

    fn shutdown(&mut self) -> Result<(), CaptureError> {
        self.running.store(false, Ordering::Relaxed);

        // Capture first: once it is gone the ring only shrinks, so the
        // storage thread's final drain is complete.
        if let Some(handle) = self.capture_thread.take() {
            if handle.join().is_err() {
                log::error!("capture thread panicked");
            }
        }
        self.wakeup.1.notify_all();
        match self.storage_thread.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(CaptureError::StorageError(
                    "storage thread panicked".into(),
                )),
            },
            None => Ok(()),
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.capture_thread.is_some() || self.storage_thread.is_some() {
            if let Err(e) = self.shutdown() {
                log::error!("recording session teardown: {e}");
            }
        }
    }
}

fn capture_loop<S: CaptureSource>(
    mut source: S,
    mut producer: RingProducer,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<PipelineStats>>,
    wakeup: Arc<(Mutex<()>, Condvar)>,
    gain: f32,
    meter: bool,
) {
    let staging_size = match source.recommended_buffer_size() {
        0 => DEFAULT_STAGING,
        n => n,
    };
    let mut staging = vec![0u8; staging_size];
    let mut drop_events = 0u64;

    while running.load(Ordering::Relaxed) {
        let n = match source.read(&mut staging) {
            Ok(0) => {
                thread::sleep(SOURCE_IDLE_WAIT);
                continue;
            }
            Ok(n) => n,
            Err(e) => {
                log::error!("capture source failed: {e}");
                break;
            }
        };

        let peak = if meter {
            apply_gain_s24le(&mut staging[..n], gain)
        } else {
            0.0
        };

        let written = producer.write(&staging[..n]);
        let dropped = n - written;
        if dropped > 0 {
            drop_events += 1;
            if drop_events % DROP_LOG_EVERY == 1 {
                log::warn!(
                    "ring buffer full, dropped {dropped} bytes ({drop_events} drop events)"
                );
            }
        }

        {
            let mut stats = stats.lock();
            stats.bytes_buffered += written as u64;
            stats.bytes_dropped += dropped as u64;
            if peak > stats.peak_level {
                stats.peak_level = peak;
            }
        }
        if written > 0 {
            wakeup.1.notify_one();
        }
    }
    // The pipeline owns the source's streaming lifecycle; tear the
    // device side down before the storage drain finishes.
    source.stop();
    running.store(false, Ordering::Relaxed);
    log::debug!("capture thread exiting");
}

fn storage_loop<K: AudioSink>(
    mut sink: K,
    mut consumer: RingConsumer,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<PipelineStats>>,
    wakeup: Arc<(Mutex<()>, Condvar)>,
    chunk_size: usize,
) -> Result<(), CaptureError> {
    let mut chunk = vec![0u8; chunk_size];
    let result = loop {
        let n = consumer.read(&mut chunk);
        if n > 0 {
            if let Err(e) = sink.write(&chunk[..n]) {
                log::error!("sink write failed: {e}");
                break Err(e);
            }
            let mut stats = stats.lock();
            stats.bytes_stored += n as u64;
            stats.storage_flushes += 1;
            continue;
        }

        // Empty ring: exit only after the capture side is done, so the
        // final drain above has already seen everything.
        if !running.load(Ordering::Relaxed) {
            break Ok(());
        }
        let mut guard = wakeup.0.lock();
        wakeup.1.wait_for(&mut guard, IDLE_WAIT);
    };

    let close_result = sink.close();
    log::debug!("storage thread exiting");
    result.and(close_result)
}
