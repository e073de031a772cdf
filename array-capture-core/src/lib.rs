//! # array-capture-core
//!
//! Platform-agnostic capture engine for USB Audio Class microphone
//! arrays (84-channel, 24-bit) over isochronous USB.
//!
//! Handles descriptor discovery, clock topology resolution, endpoint
//! selection, device programming, the isochronous transfer engine with
//! stuck-transfer recovery, and the two-thread capture/storage
//! pipeline. Platform backends (Linux usbdevfs) implement the
//! `UsbTransport` trait over an already-opened device handle and plug
//! into the generic `UacCaptureDevice`.
//!
//! ## Architecture
//!
//! ```text
//! array-capture-core (this crate)
//! ├── traits/       ← UsbTransport, CaptureSource, AudioSink
//! ├── models/       ← CaptureError, CaptureConfiguration, TransferBlock, diagnostics
//! ├── uac           ← USB / UAC wire constants
//! ├── descriptor/   ← configuration parsing, clock graph, endpoint selection
//! ├── stream/       ← UacCaptureDevice, IsoEngine, rate programming
//! ├── processing/   ← lock-free SPSC ring, gain and metering
//! └── session/      ← RecordingSession (capture + storage threads)
//! ```

pub mod descriptor;
pub mod models;
pub mod processing;
pub mod session;
pub mod stream;
pub mod traits;
pub mod uac;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types at crate root for convenience.
pub use models::config::{BusSpeed, CaptureConfiguration, StreamingConfig};
pub use models::error::CaptureError;
pub use models::state::{CaptureDiagnostics, EngineState, PipelineStats};
pub use models::transfer::{IsoPacket, TransferBlock};
pub use processing::ring_buffer::{spsc_ring, RingConsumer, RingProducer};
pub use session::recording::RecordingSession;
pub use stream::device::UacCaptureDevice;
pub use traits::audio_sink::AudioSink;
pub use traits::capture_source::CaptureSource;
pub use traits::usb_transport::{ControlRequest, TransportError, UsbTransport};
