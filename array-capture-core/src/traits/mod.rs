pub mod audio_sink;
pub mod capture_source;
pub mod usb_transport;
