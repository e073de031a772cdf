use serde::Serialize;

/// Isochronous engine state machine.
///
/// State transitions:
/// ```text
/// idle → priming → steady ↔ recovering (→ idle)
///                     ↓
///                  stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No transfer pool allocated.
    Idle,
    /// Pool allocated, blocks being submitted until all are in flight.
    Priming,
    /// Reap-then-resubmit loop running.
    Steady,
    /// Stuck-transfer pattern detected; cancelling in-flight blocks.
    Recovering,
    /// Streaming torn down, interface back at alternate setting 0.
    Stopped,
}

impl EngineState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_steady(&self) -> bool {
        matches!(self, Self::Steady)
    }
}

/// Diagnostics owned by the engine and exported as a snapshot.
///
/// These are plain engine state, never process-wide statics; hosts that
/// want cross-instance metrics aggregate snapshots themselves.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureDiagnostics {
    /// Completed transfer blocks reaped.
    pub reaps: u64,
    /// Blocking reaps performed to avoid busy-spinning.
    pub blocking_reaps: u64,
    /// Submit calls that failed (block left out of flight).
    pub submit_errors: u64,
    /// Reap calls that failed with something other than backpressure.
    pub reap_errors: u64,
    /// Pool resets triggered by the stuck-transfer detector.
    pub stuck_recoveries: u64,
    /// Whole channel-frames delivered to the caller.
    pub frames_delivered: u64,
    /// Payload bytes received from the device.
    pub bytes_received: u64,
}

/// Diagnostics for the capture/storage pipeline threads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Bytes accepted into the ring buffer by the capture thread.
    pub bytes_buffered: u64,
    /// Bytes dropped because the ring buffer was full.
    pub bytes_dropped: u64,
    /// Bytes handed to the file sink by the storage thread.
    pub bytes_stored: u64,
    /// Storage drain cycles that wrote at least one byte.
    pub storage_flushes: u64,
    /// Peak absolute sample level observed, 0.0..=1.0.
    pub peak_level: f32,
}
