use crate::models::error::CaptureError;

/// Source of channel-aligned audio for the capture thread.
///
/// Implemented by `UacCaptureDevice`; the pipeline only needs this
/// seam, which also makes it testable without hardware. `read` must
/// never block longer than one bounded device wait, and must only ever
/// return whole channel-frames.
pub trait CaptureSource: Send {
    /// Pull up to `out.len()` bytes of frame-aligned audio.
    ///
    /// Returns 0 when no audio is available right now; the caller
    /// yields rather than spinning.
    fn read(&mut self, out: &mut [u8]) -> Result<usize, CaptureError>;

    /// One channel-frame in bytes; reads are always multiples of this.
    fn frame_size(&self) -> usize;

    /// Preferred staging-buffer size, a multiple of `frame_size`.
    fn recommended_buffer_size(&self) -> usize;

    /// Release device-side streaming resources.
    ///
    /// Called exactly once by the pipeline when its capture loop ends,
    /// before the storage side drains. Sources without device state
    /// keep the default no-op.
    fn stop(&mut self) {}
}
