use serde::Serialize;

/// Negotiated bus speed of the device connection.
///
/// Not part of the configuration descriptor; the transport reports it
/// (on Linux the kernel knows via `USBDEVFS_GET_SPEED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BusSpeed {
    Full,
    High,
    Super,
}

impl BusSpeed {
    /// Isochronous service intervals per second: 1 ms frames at full
    /// speed, 125 us microframes at high/super speed.
    pub fn service_intervals_per_sec(self) -> u32 {
        match self {
            BusSpeed::Full => 1_000,
            BusSpeed::High | BusSpeed::Super => 8_000,
        }
    }
}

/// Caller-supplied capture parameters.
#[derive(Debug, Clone)]
pub struct CaptureConfiguration {
    /// Requested sample rate in Hz (default: 48000).
    pub sample_rate: u32,

    /// Number of capture channels (default: 84 for the full array).
    pub channels: u16,

    /// Bytes per sample per channel (default: 3 for 24-bit PCM).
    pub bytes_per_sample: u16,

    /// Poll the clock source's CLOCK_VALID control before trusting it.
    pub validate_clock: bool,

    /// Linear gain applied in place by the capture thread (1.0 = unity).
    pub gain: f32,

    /// Ring buffer size in bytes between capture and storage threads.
    pub ring_capacity: usize,

    /// Maximum bytes drained from the ring per storage-thread cycle.
    pub storage_chunk: usize,
}

impl CaptureConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample rate must be positive".into());
        }
        if self.channels == 0 {
            return Err("channel count must be positive".into());
        }
        if ![2, 3, 4].contains(&self.bytes_per_sample) {
            return Err(format!("unsupported bytes per sample: {}", self.bytes_per_sample));
        }
        if self.ring_capacity < self.frame_size() * 2 {
            return Err("ring capacity below two frames".into());
        }
        if self.storage_chunk == 0 {
            return Err("storage chunk must be positive".into());
        }
        Ok(())
    }

    /// One channel-frame in bytes (all channels, one sample each).
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 84,
            bytes_per_sample: 3,
            validate_clock: true,
            gain: 1.0,
            ring_capacity: 4 * 1024 * 1024,
            storage_chunk: 64 * 1024,
        }
    }
}

/// Resolved streaming parameters, fixed once streaming starts and
/// rebuilt on every `initialize`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamingConfig {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub endpoint_address: u8,

    /// Maximum payload per isochronous packet.
    pub packet_size: usize,

    /// Packets carried by one transfer block.
    pub packets_per_urb: usize,

    pub channels: u16,
    pub bytes_per_sample: u16,

    /// The device's measured running rate, not the requested one.
    pub effective_sample_rate: u32,
}

impl StreamingConfig {
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    /// Total buffer size of one transfer block.
    pub fn urb_buffer_size(&self) -> usize {
        self.packet_size * self.packets_per_urb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        assert!(CaptureConfiguration::default().validate().is_ok());
    }

    #[test]
    fn frame_size_for_array() {
        let config = CaptureConfiguration::default();
        assert_eq!(config.frame_size(), 252); // 84 channels x 3 bytes
    }

    #[test]
    fn rejects_zero_rate() {
        let config = CaptureConfiguration {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_odd_sample_width() {
        let config = CaptureConfiguration {
            bytes_per_sample: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn service_intervals_by_speed() {
        assert_eq!(BusSpeed::Full.service_intervals_per_sec(), 1_000);
        assert_eq!(BusSpeed::High.service_intervals_per_sec(), 8_000);
        assert_eq!(BusSpeed::Super.service_intervals_per_sec(), 8_000);
    }
}
