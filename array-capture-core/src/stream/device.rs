//! The capture device: descriptor discovery, clock resolution, rate
//! programming and the streaming lifecycle, glued over one transport.

use crate::descriptor::clock::ClockResolver;
use crate::descriptor::endpoint::{select_endpoint, EndpointCandidate, RateSupport};
use crate::descriptor::parser::parse_configuration;
use crate::models::config::{BusSpeed, CaptureConfiguration, StreamingConfig};
use crate::models::error::CaptureError;
use crate::models::state::CaptureDiagnostics;
use crate::stream::engine::IsoEngine;
use crate::stream::programmer::{set_alt_setting, RateProgrammer};
use crate::traits::capture_source::CaptureSource;
use crate::traits::usb_transport::{ControlRequest, UsbTransport};
use crate::uac;

/// Packets per transfer block: one millisecond of microframes at
/// high/super speed, a full-speed bus gets larger, fewer packets.
const PACKETS_PER_URB_HIGH: usize = 16;
const PACKETS_PER_URB_FULL: usize = 8;

/// A UAC microphone-array capture device over an opened USB handle.
///
/// The transport hands over an already-opened device; enumeration and
/// permissions belong to the host platform. Typical lifecycle:
/// `initialize`, `start_streaming`, a `read_audio_data` loop, then
/// `stop_streaming`.
pub struct UacCaptureDevice<T: UsbTransport> {
    transport: T,
    capture_config: Option<CaptureConfiguration>,
    selected: Option<EndpointCandidate>,
    streaming_config: Option<StreamingConfig>,
    engine: Option<IsoEngine>,
}

impl<T: UsbTransport> UacCaptureDevice<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            capture_config: None,
            selected: None,
            streaming_config: None,
            engine: None,
        }
    }

    /// Discover the device and program it for the requested format.
    ///
    /// Reads the configuration descriptor, picks the streaming
    /// endpoint, resolves and validates the clock feeding it, writes
    /// the sample rate, selects the streaming alternate setting and
    /// reads back the rate the hardware actually settled on.
    pub fn initialize(&mut self, config: &CaptureConfiguration) -> Result<(), CaptureError> {
        config.validate().map_err(CaptureError::ConfigurationFailed)?;
        if self.engine.as_ref().is_some_and(|e| e.state().is_steady()) {
            return Err(CaptureError::InvalidState(
                "cannot reinitialize while streaming".into(),
            ));
        }

        let speed = self.transport.speed();
        let blob = self.fetch_configuration_descriptor()?;
        let parsed = parse_configuration(&blob, speed);
        log::info!(
            "descriptor walk found {} endpoint candidates, {} clock entities ({speed:?} speed)",
            parsed.candidates.len(),
            parsed.clocks.len()
        );

        let frame_size = config.frame_size();
        let selected = select_endpoint(&parsed.candidates, config.sample_rate, frame_size)?.clone();
        log::info!(
            "selected interface {} alt {} endpoint {:#04x}, {} bytes/interval (derived {:.0} Hz)",
            selected.interface_number,
            selected.alternate_setting,
            selected.endpoint_address,
            selected.bytes_per_interval,
            selected.derived_sample_rate(frame_size)
        );

        if let Some(ac) = parsed.ac_interface {
            self.transport.claim_interface(ac)?;
        }
        self.transport.claim_interface(selected.interface_number)?;

        // Idle the interface before touching clocks; some devices
        // ignore clock writes while an alternate setting is live.
        set_alt_setting(&mut self.transport, selected.interface_number, 0)?;

        let clock_id = match parsed.ac_interface {
            Some(ac) => {
                let entity = parsed
                    .clock_for_interface(selected.interface_number)
                    .or_else(|| parsed.first_clock_source());
                entity.and_then(|id| {
                    ClockResolver::new(&parsed.clocks, ac, config.validate_clock)
                        .resolve(&mut self.transport, id)
                })
            }
            None => None,
        };
        if clock_id.is_none() && !parsed.clocks.is_empty() {
            log::warn!("clock topology did not resolve; falling back to endpoint controls");
        }

        let programmer = RateProgrammer {
            clock_id,
            ac_interface: parsed.ac_interface,
            streaming_interface: selected.interface_number,
            endpoint_address: selected.endpoint_address,
        };
        if !programmer.program(&mut self.transport, config.sample_rate) {
            log::warn!(
                "device did not accept {} Hz; continuing with its native rate",
                config.sample_rate
            );
        }
        programmer.enable_pitch(&mut self.transport);

        set_alt_setting(
            &mut self.transport,
            selected.interface_number,
            selected.alternate_setting,
        )?;

        let effective_sample_rate = programmer
            .read_back(&mut self.transport)
            .unwrap_or(config.sample_rate);
        log::info!("device running at {effective_sample_rate} Hz");

        let packets_per_urb = match speed {
            BusSpeed::Full => PACKETS_PER_URB_FULL,
            BusSpeed::High | BusSpeed::Super => PACKETS_PER_URB_HIGH,
        };
        let streaming_config = StreamingConfig {
            interface_number: selected.interface_number,
            alternate_setting: selected.alternate_setting,
            endpoint_address: selected.endpoint_address,
            packet_size: selected.bytes_per_interval,
            packets_per_urb,
            channels: selected.channels.unwrap_or(config.channels),
            bytes_per_sample: selected.bytes_per_sample.unwrap_or(config.bytes_per_sample),
            effective_sample_rate,
        };

        self.engine = Some(IsoEngine::new(streaming_config.clone()));
        self.streaming_config = Some(streaming_config);
        self.selected = Some(selected);
        self.capture_config = Some(config.clone());
        Ok(())
    }

    /// Prime the transfer pool and enter steady streaming.
    pub fn start_streaming(&mut self) -> Result<(), CaptureError> {
        match &mut self.engine {
            Some(engine) => engine.start(&mut self.transport),
            None => Err(CaptureError::InvalidState(
                "start_streaming before initialize".into(),
            )),
        }
    }

    /// Cancel in-flight transfers and idle the streaming interface.
    pub fn stop_streaming(&mut self) {
        if let Some(engine) = &mut self.engine {
            engine.stop(&mut self.transport);
        }
        if let Some(config) = &self.streaming_config {
            if let Err(e) = set_alt_setting(&mut self.transport, config.interface_number, 0) {
                log::debug!("idling interface after stop failed: {e}");
            }
        }
    }

    /// Pull frame-aligned audio; see `IsoEngine::read`.
    pub fn read_audio_data(&mut self, out: &mut [u8]) -> Result<usize, CaptureError> {
        match &mut self.engine {
            Some(engine) => engine.read(&mut self.transport, out),
            None => Err(CaptureError::InvalidState(
                "read_audio_data before initialize".into(),
            )),
        }
    }

    /// The rate the device reported after programming, in Hz.
    pub fn effective_sample_rate(&self) -> Option<u32> {
        self.streaming_config
            .as_ref()
            .map(|c| c.effective_sample_rate)
    }

    pub fn streaming_config(&self) -> Option<&StreamingConfig> {
        self.streaming_config.as_ref()
    }

    /// Discrete rates the selected alternate setting advertises.
    pub fn supported_sample_rates(&self) -> Vec<u32> {
        match self.selected.as_ref().map(|s| &s.rates) {
            Some(RateSupport::Discrete(rates)) => rates.clone(),
            _ => Vec::new(),
        }
    }

    pub fn supports_continuous_rate(&self) -> bool {
        matches!(
            self.selected.as_ref().map(|s| &s.rates),
            Some(RateSupport::Continuous { .. })
        )
    }

    pub fn diagnostics(&self) -> Option<CaptureDiagnostics> {
        self.engine.as_ref().map(|e| e.diagnostics())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn fetch_configuration_descriptor(&mut self) -> Result<Vec<u8>, CaptureError> {
        let req = ControlRequest::new(
            uac::REQ_IN_STANDARD_DEVICE,
            uac::GET_DESCRIPTOR,
            (uac::DT_CONFIGURATION as u16) << 8,
            0,
        );

        let mut header = [0u8; 9];
        let n = self.transport.control_in(&req, &mut header)?;
        if n < 4 {
            return Err(CaptureError::DescriptorError(format!(
                "configuration header truncated to {n} bytes"
            )));
        }
        let total = u16::from_le_bytes([header[2], header[3]]) as usize;
        if total < header.len() {
            return Err(CaptureError::DescriptorError(format!(
                "implausible wTotalLength {total}"
            )));
        }

        let mut blob = vec![0u8; total];
        let n = self.transport.control_in(&req, &mut blob)?;
        blob.truncate(n);
        Ok(blob)
    }
}

impl<T: UsbTransport> CaptureSource for UacCaptureDevice<T> {
    fn read(&mut self, out: &mut [u8]) -> Result<usize, CaptureError> {
        self.read_audio_data(out)
    }

    fn frame_size(&self) -> usize {
        self.streaming_config
            .as_ref()
            .map(|c| c.frame_size())
            .unwrap_or(0)
    }

    /// One transfer block's payload, rounded up to whole frames.
    fn recommended_buffer_size(&self) -> usize {
        let Some(config) = &self.streaming_config else {
            return 0;
        };
        let frame = config.frame_size();
        let urb = config.urb_buffer_size();
        urb.div_ceil(frame) * frame
    }

    fn stop(&mut self) {
        self.stop_streaming();
    }
}
