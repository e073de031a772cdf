use crate::models::error::CaptureError;

/// Destination for finished multichannel audio.
///
/// The pipeline is agnostic to container format; a WAV writer, a
/// network streamer, or an in-memory buffer all fit behind this trait.
/// `write` is only ever called between `open` and `close`, and only
/// from the storage thread.
pub trait AudioSink: Send {
    fn open(
        &mut self,
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
    ) -> Result<(), CaptureError>;

    fn write(&mut self, data: &[u8]) -> Result<(), CaptureError>;

    fn close(&mut self) -> Result<(), CaptureError>;
}
