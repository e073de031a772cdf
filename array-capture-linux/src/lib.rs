//! # array-capture-linux
//!
//! Linux usbdevfs backend for array-capture-kit.
//!
//! Provides `UsbdevfsTransport`, a `UsbTransport` implementation over
//! an already-opened `/dev/bus/usb` device node. Device discovery and
//! permission handling stay with the host; this crate only speaks
//! ioctls on the handed-over descriptor.
//!
//! ## Usage
//! ```ignore
//! use array_capture_core::{CaptureConfiguration, UacCaptureDevice};
//! use array_capture_linux::UsbdevfsTransport;
//!
//! let transport = UsbdevfsTransport::from_fd(device_fd)?;
//! let mut device = UacCaptureDevice::new(transport);
//! device.initialize(&CaptureConfiguration::default())?;
//! device.start_streaming()?;
//! ```

#[cfg(target_os = "linux")]
pub mod usbdevfs;

#[cfg(target_os = "linux")]
pub use usbdevfs::UsbdevfsTransport;
