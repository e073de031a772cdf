//! UAC2 clock entity graph and topology resolution.
//!
//! Clock descriptors form a small directed graph (sources, selectors,
//! multipliers). Malformed firmware can make it cyclic, so resolution
//! carries a visited set and fails closed on a revisit instead of
//! recursing forever.

use std::collections::HashSet;
use std::time::Duration;

use crate::traits::usb_transport::{ControlRequest, TransportError, UsbTransport};
use crate::uac;

/// One clock entity from the audio-control interface, built once from
/// descriptors and read-only afterwards except for a selector's active
/// pin, which may be switched live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockEntity {
    Source {
        id: u8,
        /// bmAttributes: internal/external, sync to SOF.
        attributes: u8,
        /// 2-bits-per-control bitmap (sample rate, clock validity).
        controls: u8,
    },
    Selector {
        id: u8,
        /// Upstream entity ids, in pin order (pins are 1-based).
        inputs: Vec<u8>,
        controls: u8,
    },
    Multiplier {
        id: u8,
        source_id: u8,
    },
}

impl ClockEntity {
    pub fn id(&self) -> u8 {
        match self {
            ClockEntity::Source { id, .. }
            | ClockEntity::Selector { id, .. }
            | ClockEntity::Multiplier { id, .. } => *id,
        }
    }
}

/// How many times to poll CLOCK_VALID while the source locks.
const VALIDITY_POLLS: u32 = 20;
const VALIDITY_POLL_SPACING: Duration = Duration::from_millis(100);

/// Resolves which physical clock source feeds a streaming interface.
pub struct ClockResolver<'a> {
    entities: &'a [ClockEntity],
    /// Audio-control interface number, used to address entity controls.
    ac_interface: u8,
    /// Poll CLOCK_VALID before accepting a source.
    validate: bool,
}

impl<'a> ClockResolver<'a> {
    pub fn new(entities: &'a [ClockEntity], ac_interface: u8, validate: bool) -> Self {
        Self {
            entities,
            ac_interface,
            validate,
        }
    }

    /// Resolve starting from `entity_id`, switching selector pins as
    /// needed. Returns the resolved clock-source entity id, or `None`;
    /// streaming may still proceed on descriptor-implied timing.
    pub fn resolve<T: UsbTransport>(&self, transport: &mut T, entity_id: u8) -> Option<u8> {
        let mut visited = HashSet::new();
        self.resolve_entity(transport, entity_id, &mut visited)
    }

    fn find(&self, id: u8) -> Option<&ClockEntity> {
        self.entities.iter().find(|e| e.id() == id)
    }

    fn resolve_entity<T: UsbTransport>(
        &self,
        transport: &mut T,
        entity_id: u8,
        visited: &mut HashSet<u8>,
    ) -> Option<u8> {
        if !visited.insert(entity_id) {
            log::warn!("clock entity {entity_id} revisited; cyclic clock graph");
            return None;
        }
        match self.find(entity_id)? {
            ClockEntity::Source { id, controls, .. } => {
                if !self.validate || self.source_is_valid(transport, *id, *controls) {
                    Some(*id)
                } else {
                    None
                }
            }
            ClockEntity::Multiplier { source_id, .. } => {
                self.resolve_entity(transport, *source_id, visited)
            }
            ClockEntity::Selector {
                id,
                inputs,
                controls,
            } => self.resolve_selector(transport, *id, inputs, *controls, visited),
        }
    }

    /// Try the selector's active pin first, then the rest in order.
    /// A failed switched-to pin is switched back before moving on.
    fn resolve_selector<T: UsbTransport>(
        &self,
        transport: &mut T,
        selector_id: u8,
        inputs: &[u8],
        controls: u8,
        visited: &mut HashSet<u8>,
    ) -> Option<u8> {
        if inputs.is_empty() {
            return None;
        }

        let current_pin = self.read_selector_pin(transport, selector_id);
        let writable =
            uac::control_writable(controls as u32, uac::CX_CLOCK_SELECTOR_CONTROL - 1);

        let mut pin_order: Vec<u8> = Vec::with_capacity(inputs.len());
        if let Some(pin) = current_pin {
            if pin >= 1 && (pin as usize) <= inputs.len() {
                pin_order.push(pin);
            }
        }
        for pin in 1..=inputs.len() as u8 {
            if !pin_order.contains(&pin) {
                pin_order.push(pin);
            }
        }

        for pin in pin_order {
            let needs_switch = current_pin != Some(pin);
            if needs_switch {
                if !writable {
                    continue;
                }
                if let Err(e) = self.write_selector_pin(transport, selector_id, pin) {
                    log::debug!("selector {selector_id} pin {pin} switch failed: {e}");
                    continue;
                }
            }

            let upstream = inputs[pin as usize - 1];
            if let Some(source) = self.resolve_entity(transport, upstream, visited) {
                return Some(source);
            }

            if needs_switch {
                if let Some(original) = current_pin {
                    let _ = self.write_selector_pin(transport, selector_id, original);
                }
            }
        }
        None
    }

    /// Poll the CLOCK_VALID control; devices may need time to lock.
    fn source_is_valid<T: UsbTransport>(&self, transport: &mut T, id: u8, controls: u8) -> bool {
        if !uac::control_readable(controls as u32, uac::CS_CLOCK_VALID_CONTROL - 1) {
            // Nothing to read; accept the source as-is.
            log::debug!("clock source {id} has no readable validity control");
            return true;
        }

        let req = ControlRequest::new(
            uac::REQ_IN_CLASS_INTERFACE,
            uac::UAC2_CUR,
            uac::uac2_control_value(uac::CS_CLOCK_VALID_CONTROL),
            uac::uac2_entity_index(id, self.ac_interface),
        );

        for poll in 0..VALIDITY_POLLS {
            let mut valid = [0u8; 1];
            match transport.control_in(&req, &mut valid) {
                Ok(n) if n >= 1 && valid[0] != 0 => return true,
                Ok(_) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => {
                    log::warn!("clock source {id} validity read failed: {e}");
                    return false;
                }
            }
            if poll + 1 < VALIDITY_POLLS {
                std::thread::sleep(VALIDITY_POLL_SPACING);
            }
        }
        log::warn!("clock source {id} never reported valid");
        false
    }

    fn read_selector_pin<T: UsbTransport>(&self, transport: &mut T, id: u8) -> Option<u8> {
        let req = ControlRequest::new(
            uac::REQ_IN_CLASS_INTERFACE,
            uac::UAC2_CUR,
            uac::uac2_control_value(uac::CX_CLOCK_SELECTOR_CONTROL),
            uac::uac2_entity_index(id, self.ac_interface),
        );
        let mut pin = [0u8; 1];
        match transport.control_in(&req, &mut pin) {
            Ok(n) if n >= 1 => Some(pin[0]),
            _ => None,
        }
    }

    fn write_selector_pin<T: UsbTransport>(
        &self,
        transport: &mut T,
        id: u8,
        pin: u8,
    ) -> Result<(), TransportError> {
        let req = ControlRequest::new(
            uac::REQ_OUT_CLASS_INTERFACE,
            uac::UAC2_CUR,
            uac::uac2_control_value(uac::CX_CLOCK_SELECTOR_CONTROL),
            uac::uac2_entity_index(id, self.ac_interface),
        );
        transport.control_out(&req, &[pin]).map(|_| ())
    }
}
