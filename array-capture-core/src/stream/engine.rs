//! Isochronous transfer engine.
//!
//! Owns a fixed pool of transfer blocks and drives the submit/reap
//! cycle against the transport: prime the pool, reap completions,
//! reassemble channel-aligned frames from per-packet payloads,
//! resubmit, and detect the stuck-transfer pathology where one
//! physical buffer keeps completing while the rest silently stall.

use crate::models::config::StreamingConfig;
use crate::models::error::CaptureError;
use crate::models::state::{CaptureDiagnostics, EngineState};
use crate::models::transfer::TransferBlock;
use crate::traits::usb_transport::{TransportError, UsbTransport};

/// Transfer blocks in the pool.
pub const POOL_SIZE: usize = 64;

/// Upper bound on non-blocking reaps per read call.
const MAX_REAPS_PER_CALL: usize = 16;

/// Bounded reap attempts while waiting out cancelled blocks.
const TEARDOWN_REAP_ATTEMPTS: usize = POOL_SIZE * 2 + 16;

/// Error log suppression interval on the hot path.
const LOG_EVERY: u64 = 256;

/// Consecutive identical reaped slots before the pattern counts.
const STUCK_RUN: u32 = 50;
/// Sampling window over reap events.
const STUCK_WINDOW: usize = 100;
/// Repeat fraction of the window that confirms the pattern (4/5).
const STUCK_FRACTION_NUM: u32 = 4;
const STUCK_FRACTION_DEN: u32 = 5;

/// Detects a device/kernel pathology where reaps make no forward
/// progress: the same block address completes over and over while the
/// rest of the pool never comes back.
#[derive(Debug, Default)]
pub struct StuckDetector {
    last_slot: Option<usize>,
    run: u32,
    window: std::collections::VecDeque<bool>,
    repeats_in_window: u32,
}

impl StuckDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one reaped slot; returns true when the stuck pattern is
    /// confirmed and the pool should be reset.
    pub fn record(&mut self, slot: usize) -> bool {
        let repeat = self.last_slot == Some(slot);
        self.last_slot = Some(slot);

        if repeat {
            self.run += 1;
        } else {
            self.run = 0;
        }

        if self.window.len() == STUCK_WINDOW {
            if self.window.pop_front() == Some(true) {
                self.repeats_in_window -= 1;
            }
        }
        self.window.push_back(repeat);
        if repeat {
            self.repeats_in_window += 1;
        }

        self.run >= STUCK_RUN
            && self.repeats_in_window * STUCK_FRACTION_DEN
                >= self.window.len() as u32 * STUCK_FRACTION_NUM
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

enum ReapOutcome {
    /// A block completed and was absorbed.
    Completed,
    /// Nothing available right now.
    Empty,
    /// The stuck pattern fired; the pool was torn down.
    Recovered,
}

/// The transfer-block pump between the transport and the caller.
///
/// Not thread-safe by design: exactly one thread (the capture thread)
/// calls `read`. The transport is borrowed per call so the surrounding
/// device can also use it for control traffic between reads.
pub struct IsoEngine {
    config: StreamingConfig,
    state: EngineState,
    pool: Vec<TransferBlock>,
    in_flight: Vec<bool>,
    /// Payload bytes not yet delivered; everything below one frame at
    /// rest. Cleared only on `stop`, never on recovery, so no audio
    /// already received is lost.
    pending: Vec<u8>,
    detector: StuckDetector,
    diagnostics: CaptureDiagnostics,
    streaming: bool,
}

impl IsoEngine {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            state: EngineState::Idle,
            pool: Vec::new(),
            in_flight: Vec::new(),
            pending: Vec::new(),
            detector: StuckDetector::new(),
            diagnostics: CaptureDiagnostics::default(),
            streaming: false,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> CaptureDiagnostics {
        self.diagnostics.clone()
    }

    /// Allocate and prime the pool, then enter the steady reap loop.
    pub fn start<T: UsbTransport>(&mut self, transport: &mut T) -> Result<(), CaptureError> {
        if !matches!(self.state, EngineState::Idle | EngineState::Stopped) {
            return Err(CaptureError::InvalidState(format!(
                "cannot start streaming from {:?}",
                self.state
            )));
        }
        self.streaming = true;
        self.prime(transport)?;
        Ok(())
    }

    fn prime<T: UsbTransport>(&mut self, transport: &mut T) -> Result<(), CaptureError> {
        self.pool = (0..POOL_SIZE)
            .map(|slot| {
                TransferBlock::new(
                    slot,
                    self.config.endpoint_address,
                    self.config.packet_size,
                    self.config.packets_per_urb,
                )
            })
            .collect();
        self.in_flight = vec![false; POOL_SIZE];
        self.state = EngineState::Priming;

        let mut last_error = None;
        for slot in 0..POOL_SIZE {
            match transport.submit(&mut self.pool[slot]) {
                Ok(()) => self.in_flight[slot] = true,
                Err(e) => {
                    self.diagnostics.submit_errors += 1;
                    last_error = Some(e);
                }
            }
        }

        let airborne = self.in_flight.iter().filter(|f| **f).count();
        if airborne == 0 {
            self.pool.clear();
            self.in_flight.clear();
            self.state = EngineState::Idle;
            return Err(CaptureError::Transport(
                last_error.unwrap_or(TransportError::Io("no transfers submitted".into())),
            ));
        }
        if airborne < POOL_SIZE {
            log::warn!("primed with {airborne}/{POOL_SIZE} transfer blocks in flight");
        }
        self.state = EngineState::Steady;
        log::debug!(
            "isochronous pool primed: {airborne} blocks, {} packets x {} bytes each",
            self.config.packets_per_urb,
            self.config.packet_size
        );
        Ok(())
    }

    /// Cancel everything, drain the completions, free the pool, and
    /// leave the engine stopped.
    pub fn stop<T: UsbTransport>(&mut self, transport: &mut T) {
        self.streaming = false;
        self.teardown_pool(transport);
        self.pending.clear();
        self.detector.reset();
        self.state = EngineState::Stopped;
    }

    /// Pull up to `out.len()` bytes of frame-aligned audio.
    ///
    /// Reaps a bounded number of completions, resubmitting each block
    /// as it comes back; if nothing completed, performs exactly one
    /// blocking reap so the caller does not busy-spin. Only whole
    /// channel-frames are ever copied out; a trailing sub-frame
    /// remainder is held back for the next call.
    pub fn read<T: UsbTransport>(
        &mut self,
        transport: &mut T,
        out: &mut [u8],
    ) -> Result<usize, CaptureError> {
        // A recovery leaves the engine idle; self-heal on the next read.
        if self.state.is_idle() && self.streaming {
            if let Err(e) = self.prime(transport) {
                log::debug!("re-prime after recovery failed: {e}");
                return Ok(self.deliver(out));
            }
        }
        if !self.state.is_steady() {
            return Ok(self.deliver(out));
        }

        let mut completed_any = false;
        for _ in 0..MAX_REAPS_PER_CALL {
            match self.reap_once(transport, false) {
                ReapOutcome::Completed => completed_any = true,
                ReapOutcome::Empty => break,
                ReapOutcome::Recovered => return Ok(self.deliver(out)),
            }
        }

        if !completed_any && self.streaming {
            self.diagnostics.blocking_reaps += 1;
            match self.reap_once(transport, true) {
                ReapOutcome::Completed => {
                    // Completions often arrive in bursts; drain what
                    // piled up behind the one we waited for.
                    for _ in 0..MAX_REAPS_PER_CALL {
                        match self.reap_once(transport, false) {
                            ReapOutcome::Completed => {}
                            ReapOutcome::Empty => break,
                            ReapOutcome::Recovered => return Ok(self.deliver(out)),
                        }
                    }
                }
                ReapOutcome::Empty => {}
                ReapOutcome::Recovered => return Ok(self.deliver(out)),
            }
        }

        Ok(self.deliver(out))
    }

    fn reap_once<T: UsbTransport>(&mut self, transport: &mut T, blocking: bool) -> ReapOutcome {
        match transport.reap(blocking, &mut self.pool) {
            Ok(Some(slot)) => {
                assert!(slot < self.pool.len(), "transport reaped unknown slot {slot}");
                self.in_flight[slot] = false;
                self.diagnostics.reaps += 1;

                if self.detector.record(slot) {
                    log::warn!(
                        "stuck transfer pattern on slot {slot} after {} reaps; resetting pool",
                        self.diagnostics.reaps
                    );
                    self.recover(transport);
                    return ReapOutcome::Recovered;
                }

                self.absorb(slot);
                self.resubmit(transport, slot);
                ReapOutcome::Completed
            }
            Ok(None) => ReapOutcome::Empty,
            Err(e) if e.is_transient() => ReapOutcome::Empty,
            Err(TransportError::Disconnected) => {
                if self.streaming {
                    log::error!("device disconnected during streaming");
                }
                self.streaming = false;
                ReapOutcome::Empty
            }
            Err(e) => {
                self.diagnostics.reap_errors += 1;
                if self.diagnostics.reap_errors % LOG_EVERY == 1 {
                    log::warn!("reap error ({} total): {e}", self.diagnostics.reap_errors);
                }
                ReapOutcome::Empty
            }
        }
    }

    /// Copy a completed block's payload into the pending assembly
    /// buffer, walking packets at their submitted strides.
    fn absorb(&mut self, slot: usize) {
        let block = &self.pool[slot];
        let mut offset = 0usize;
        for packet in &block.packets {
            let stride = packet.length as usize;
            if packet.status == 0 {
                let actual = packet.actual_length as usize;
                // A payload past the allocated buffer is a logic
                // defect, not a device condition; fail loudly.
                assert!(
                    offset + actual <= block.buffer.len(),
                    "packet payload ({} bytes at offset {}) exceeds transfer buffer ({})",
                    actual,
                    offset,
                    block.buffer.len()
                );
                self.pending
                    .extend_from_slice(&block.buffer[offset..offset + actual]);
                self.diagnostics.bytes_received += actual as u64;
            }
            offset += stride;
        }
    }

    fn resubmit<T: UsbTransport>(&mut self, transport: &mut T, slot: usize) {
        let block = &mut self.pool[slot];
        block.reset();
        match transport.submit(block) {
            Ok(()) => self.in_flight[slot] = true,
            Err(e) => {
                self.diagnostics.submit_errors += 1;
                if self.diagnostics.submit_errors % LOG_EVERY == 1 {
                    log::warn!(
                        "resubmit failed on slot {slot} ({} total): {e}",
                        self.diagnostics.submit_errors
                    );
                }
            }
        }
    }

    /// Hand whole frames to the caller, preserving frame alignment.
    fn deliver(&mut self, out: &mut [u8]) -> usize {
        let frame = self.config.frame_size();
        let mut count = self.pending.len().min(out.len());
        count -= count % frame;
        if count == 0 {
            return 0;
        }
        out[..count].copy_from_slice(&self.pending[..count]);
        self.pending.drain(..count);
        self.diagnostics.frames_delivered += (count / frame) as u64;
        count
    }

    /// Cancel all in-flight blocks, reap every one of them back, and
    /// only then free the pool.
    fn teardown_pool<T: UsbTransport>(&mut self, transport: &mut T) {
        for slot in 0..self.pool.len() {
            if self.in_flight[slot] {
                if let Err(e) = transport.cancel(&self.pool[slot]) {
                    log::debug!("cancel on slot {slot} failed: {e}");
                }
            }
        }
        // Cancellation is asynchronous: the device keeps writing into a
        // cancelled block's buffer until its completion is reaped. Wait
        // (bounded) for every in-flight block to come back.
        let mut attempts = 0;
        while self.in_flight.iter().any(|f| *f) && attempts < TEARDOWN_REAP_ATTEMPTS {
            attempts += 1;
            match transport.reap(true, &mut self.pool) {
                Ok(Some(slot)) => {
                    if let Some(flag) = self.in_flight.get_mut(slot) {
                        *flag = false;
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => {
                    log::debug!("reap during teardown failed: {e}");
                    break;
                }
            }
        }
        if self.in_flight.iter().any(|f| *f) {
            // Buffers the device may still write into must never be
            // freed; leak them instead.
            let stranded = self.in_flight.iter().filter(|f| **f).count();
            log::error!("{stranded} cancelled blocks never surfaced; leaking their buffers");
            std::mem::forget(std::mem::take(&mut self.pool));
        }
        self.pool.clear();
        self.in_flight.clear();
    }

    /// Stuck-transfer recovery: tear the pool down and return to idle;
    /// the next read while streaming re-primes.
    fn recover<T: UsbTransport>(&mut self, transport: &mut T) {
        self.state = EngineState::Recovering;
        self.teardown_pool(transport);
        self.detector.reset();
        self.diagnostics.stuck_recoveries += 1;
        self.state = EngineState::Idle;
    }
}
