//! Device programming: alternate settings, sample-rate controls and
//! the readback that establishes the effective running rate.
//!
//! Real array firmware is uneven here. Some units take the UAC2 clock
//! write on the audio-control interface, some only on the streaming
//! interface, some only speak the legacy UAC1 per-endpoint request,
//! and a few accept 3-byte payloads where 4 would be correct. Every
//! variant below was observed on shipping hardware; the order goes
//! from most to least standard.

use std::thread;
use std::time::Duration;

use crate::models::error::CaptureError;
use crate::traits::usb_transport::{ControlRequest, UsbTransport};
use crate::uac;

/// SET_INTERFACE attempts before giving up.
const SET_ALT_ATTEMPTS: u32 = 5;
/// Initial retry delay; doubles per attempt.
const SET_ALT_BACKOFF: Duration = Duration::from_millis(10);

/// Select an alternate setting, retrying transient refusals.
///
/// Devices commonly return busy for a short window right after the
/// previous alternate setting tore its bandwidth reservation down.
pub fn set_alt_setting<T: UsbTransport>(
    transport: &mut T,
    interface: u8,
    alt_setting: u8,
) -> Result<(), CaptureError> {
    let mut delay = SET_ALT_BACKOFF;
    let mut last = None;
    for attempt in 1..=SET_ALT_ATTEMPTS {
        match transport.set_interface(interface, alt_setting) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < SET_ALT_ATTEMPTS => {
                log::debug!(
                    "set interface {interface} alt {alt_setting} attempt {attempt}: {e}, retrying"
                );
                thread::sleep(delay);
                delay *= 2;
                last = Some(e);
            }
            Err(e) => {
                last = Some(e);
                break;
            }
        }
    }
    Err(CaptureError::ProgrammingFailed(format!(
        "set interface {interface} alt {alt_setting}: {}",
        last.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Sample-rate programming surface for one streaming path.
pub struct RateProgrammer {
    /// Clock entity to program, when the device exposes one (UAC2).
    pub clock_id: Option<u8>,
    pub ac_interface: Option<u8>,
    pub streaming_interface: u8,
    pub endpoint_address: u8,
}

impl RateProgrammer {
    /// Try every known way of setting the rate; true if any stuck.
    ///
    /// A false return is not fatal by itself. Fixed-rate devices reject
    /// all writes and still stream correctly; the readback decides.
    pub fn program<T: UsbTransport>(&self, transport: &mut T, rate: u32) -> bool {
        if let Some(clock) = self.clock_id {
            for interface in self.target_interfaces() {
                let req = ControlRequest::new(
                    uac::REQ_OUT_CLASS_INTERFACE,
                    uac::UAC2_CUR,
                    uac::uac2_control_value(uac::CS_SAM_FREQ_CONTROL),
                    uac::uac2_entity_index(clock, interface),
                );
                let bytes = rate.to_le_bytes();
                // UAC2 defines a 4-byte payload; some firmware insists on 3.
                for len in [4usize, 3] {
                    match transport.control_out(&req, &bytes[..len]) {
                        Ok(_) => {
                            log::debug!(
                                "clock {clock} rate set to {rate} Hz via interface {interface} ({len}-byte)"
                            );
                            return true;
                        }
                        Err(e) => log::trace!(
                            "clock rate write (interface {interface}, {len}-byte) rejected: {e}"
                        ),
                    }
                }
            }
        }

        let req = ControlRequest::new(
            uac::REQ_OUT_CLASS_ENDPOINT,
            uac::UAC1_SET_CUR,
            uac::uac2_control_value(uac::EP_SAMPLING_FREQ_CONTROL),
            self.endpoint_address as u16,
        );
        match transport.control_out(&req, &rate.to_le_bytes()[..3]) {
            Ok(_) => {
                log::debug!(
                    "endpoint {:#04x} rate set to {rate} Hz (UAC1)",
                    self.endpoint_address
                );
                true
            }
            Err(e) => {
                log::warn!("no sample-rate control accepted {rate} Hz: {e}");
                false
            }
        }
    }

    /// Best-effort UAC1 pitch enable. Failure is expected on most
    /// devices and ignored.
    pub fn enable_pitch<T: UsbTransport>(&self, transport: &mut T) {
        let req = ControlRequest::new(
            uac::REQ_OUT_CLASS_ENDPOINT,
            uac::UAC1_SET_CUR,
            uac::uac2_control_value(uac::EP_PITCH_CONTROL),
            self.endpoint_address as u16,
        );
        if let Err(e) = transport.control_out(&req, &[1]) {
            log::trace!("pitch control not accepted: {e}");
        }
    }

    /// Read the rate the device is actually running at.
    pub fn read_back<T: UsbTransport>(&self, transport: &mut T) -> Option<u32> {
        if let Some(clock) = self.clock_id {
            for interface in self.target_interfaces() {
                let req = ControlRequest::new(
                    uac::REQ_IN_CLASS_INTERFACE,
                    uac::UAC2_CUR,
                    uac::uac2_control_value(uac::CS_SAM_FREQ_CONTROL),
                    uac::uac2_entity_index(clock, interface),
                );
                let mut buf = [0u8; 4];
                if let Ok(n) = transport.control_in(&req, &mut buf) {
                    if n >= 3 {
                        return Some(u32::from_le_bytes(buf));
                    }
                }
            }
        }

        let req = ControlRequest::new(
            uac::REQ_IN_CLASS_ENDPOINT,
            uac::UAC1_GET_CUR,
            uac::uac2_control_value(uac::EP_SAMPLING_FREQ_CONTROL),
            self.endpoint_address as u16,
        );
        let mut buf = [0u8; 3];
        match transport.control_in(&req, &mut buf) {
            Ok(3) => Some(u32::from(buf[0]) | u32::from(buf[1]) << 8 | u32::from(buf[2]) << 16),
            _ => None,
        }
    }

    /// Interfaces to address the clock entity through, most standard
    /// first, deduplicated.
    fn target_interfaces(&self) -> Vec<u8> {
        let mut targets = Vec::with_capacity(3);
        if let Some(ac) = self.ac_interface {
            targets.push(ac);
        }
        if !targets.contains(&self.streaming_interface) {
            targets.push(self.streaming_interface);
        }
        if !targets.contains(&0) {
            targets.push(0);
        }
        targets
    }
}
