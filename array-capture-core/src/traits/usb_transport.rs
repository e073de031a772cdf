use thiserror::Error;

use crate::models::config::BusSpeed;
use crate::models::transfer::TransferBlock;

/// Errors at the device I/O boundary.
///
/// `Again`, `Busy` and `Timeout` are backpressure, not failures; callers
/// retry or back off. Everything else is a real device condition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no completion available")]
    Again,

    #[error("device busy")]
    Busy,

    #[error("transfer timed out")]
    Timeout,

    #[error("device disconnected")]
    Disconnected,

    #[error("endpoint stalled")]
    Stall,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether a retry with backoff is reasonable.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Again | Self::Busy | Self::Timeout)
    }
}

/// A control transfer request, excluding the data stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub timeout_ms: u32,
}

impl ControlRequest {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            timeout_ms: 1_000,
        }
    }
}

/// Raw device handle boundary.
///
/// Implementations wrap an already-opened, permission-granted device
/// handle supplied by the host platform; this crate never enumerates
/// devices or negotiates permissions. Backends:
/// - `array-capture-linux::UsbdevfsTransport` (usbdevfs ioctls)
/// - `MockTransport` in this crate's tests
pub trait UsbTransport: Send {
    /// Negotiated bus speed of the connection.
    fn speed(&self) -> BusSpeed;

    /// IN control transfer; returns bytes read into `data`.
    fn control_in(&mut self, req: &ControlRequest, data: &mut [u8]) -> Result<usize, TransportError>;

    /// OUT control transfer; returns bytes written from `data`.
    fn control_out(&mut self, req: &ControlRequest, data: &[u8]) -> Result<usize, TransportError>;

    /// Claim an interface for this handle. Already-claimed is success.
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Select an alternate setting on a claimed interface.
    fn set_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    /// Queue one isochronous transfer block.
    ///
    /// The block's buffer and packet geometry must stay untouched until
    /// the block comes back through `reap` or is cancelled.
    fn submit(&mut self, block: &mut TransferBlock) -> Result<(), TransportError>;

    /// Reap one completed block, writing per-packet results back into
    /// `pool[slot]`. Returns the completed slot, or `None` when nothing
    /// has completed (non-blocking mode) or the bounded wait elapsed.
    fn reap(
        &mut self,
        blocking: bool,
        pool: &mut [TransferBlock],
    ) -> Result<Option<usize>, TransportError>;

    /// Cancel an in-flight block. The block still surfaces via `reap`.
    fn cancel(&mut self, block: &TransferBlock) -> Result<(), TransportError>;
}
