//! Test doubles: a scriptable `UsbTransport` and a descriptor-blob
//! builder. Compiled for tests only.

use std::collections::{HashMap, VecDeque};

use crate::models::config::BusSpeed;
use crate::models::transfer::TransferBlock;
use crate::traits::usb_transport::{ControlRequest, TransportError, UsbTransport};

/// One scripted isochronous completion.
#[derive(Debug, Clone)]
pub struct MockCompletion {
    /// Complete this slot; `None` completes the oldest in-flight block.
    pub slot: Option<usize>,
    /// Payload bytes per packet, copied into the block at packet
    /// strides. Packets beyond this list complete empty.
    pub packets: Vec<Vec<u8>>,
}

impl MockCompletion {
    pub fn next_in_flight(packets: Vec<Vec<u8>>) -> Self {
        Self {
            slot: None,
            packets,
        }
    }

    /// Single-packet payload convenience.
    pub fn with_payload(payload: &[u8]) -> Self {
        Self::next_in_flight(vec![payload.to_vec()])
    }
}

/// Scriptable transport covering every seam the engine exercises.
pub struct MockTransport {
    pub bus_speed: BusSpeed,
    /// Keyed by (request, value, index).
    control_in_responses: HashMap<(u8, u16, u16), Vec<u8>>,
    pub control_in_log: Vec<ControlRequest>,
    pub control_out_log: Vec<(ControlRequest, Vec<u8>)>,
    /// Requests in this set fail with `Stall`.
    pub control_out_failures: Vec<(u8, u16, u16)>,
    pub set_interface_log: Vec<(u8, u8)>,
    /// Fail this many set_interface calls with `Busy` before succeeding.
    pub set_interface_failures: u32,
    pub claimed: Vec<u8>,
    /// When set, every submit fails with this error.
    pub submit_failure: Option<TransportError>,
    pub submits: u64,
    pub cancels: u64,
    /// When set, every reap completes this slot again (stuck device).
    pub stuck_slot: Option<usize>,
    /// Packet payloads used for stuck-slot completions.
    pub stuck_payload: Vec<Vec<u8>>,
    /// When set, cancelled blocks never surface through reap, like a
    /// device that went away mid-unlink.
    pub lose_cancelled_completions: bool,
    script: VecDeque<MockCompletion>,
    in_flight: VecDeque<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            bus_speed: BusSpeed::High,
            control_in_responses: HashMap::new(),
            control_in_log: Vec::new(),
            control_out_log: Vec::new(),
            control_out_failures: Vec::new(),
            set_interface_log: Vec::new(),
            set_interface_failures: 0,
            claimed: Vec::new(),
            submit_failure: None,
            submits: 0,
            cancels: 0,
            stuck_slot: None,
            stuck_payload: Vec::new(),
            lose_cancelled_completions: false,
            script: VecDeque::new(),
            in_flight: VecDeque::new(),
        }
    }

    pub fn set_control_in_response(&mut self, request: u8, value: u16, index: u16, data: Vec<u8>) {
        self.control_in_responses
            .insert((request, value, index), data);
    }

    pub fn push_completion(&mut self, completion: MockCompletion) {
        self.script.push_back(completion);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Completions queued but not yet reaped (including cancelled ones).
    pub fn pending_completions(&self) -> usize {
        self.script.len()
    }

    fn complete(
        &mut self,
        completion: MockCompletion,
        pool: &mut [TransferBlock],
    ) -> Option<usize> {
        let slot = match completion.slot {
            Some(slot) => {
                self.in_flight.retain(|&s| s != slot);
                slot
            }
            None => self.in_flight.pop_front()?,
        };
        let block = &mut pool[slot];
        let mut offset = 0usize;
        for (i, packet) in block.packets.iter_mut().enumerate() {
            let payload = completion.packets.get(i);
            let bytes: &[u8] = payload.map(|p| p.as_slice()).unwrap_or(&[]);
            block.buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
            packet.actual_length = bytes.len() as u32;
            packet.status = 0;
            offset += packet.length as usize;
        }
        Some(slot)
    }
}

impl UsbTransport for MockTransport {
    fn speed(&self) -> BusSpeed {
        self.bus_speed
    }

    fn control_in(&mut self, req: &ControlRequest, data: &mut [u8]) -> Result<usize, TransportError> {
        self.control_in_log.push(req.clone());
        match self
            .control_in_responses
            .get(&(req.request, req.value, req.index))
        {
            Some(response) => {
                let n = response.len().min(data.len());
                data[..n].copy_from_slice(&response[..n]);
                Ok(n)
            }
            None => Err(TransportError::Stall),
        }
    }

    fn control_out(&mut self, req: &ControlRequest, data: &[u8]) -> Result<usize, TransportError> {
        let key = (req.request, req.value, req.index);
        self.control_out_log.push((req.clone(), data.to_vec()));
        if self.control_out_failures.contains(&key) {
            return Err(TransportError::Stall);
        }
        Ok(data.len())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        self.claimed.push(interface);
        Ok(())
    }

    fn set_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        self.set_interface_log.push((interface, alt_setting));
        if self.set_interface_failures > 0 {
            self.set_interface_failures -= 1;
            return Err(TransportError::Busy);
        }
        Ok(())
    }

    fn submit(&mut self, block: &mut TransferBlock) -> Result<(), TransportError> {
        if let Some(err) = &self.submit_failure {
            return Err(err.clone());
        }
        self.submits += 1;
        self.in_flight.push_back(block.slot);
        Ok(())
    }

    fn reap(
        &mut self,
        _blocking: bool,
        pool: &mut [TransferBlock],
    ) -> Result<Option<usize>, TransportError> {
        if let Some(completion) = self.script.pop_front() {
            return Ok(self.complete(completion, pool));
        }
        if let Some(slot) = self.stuck_slot {
            let completion = MockCompletion {
                slot: Some(slot),
                packets: self.stuck_payload.clone(),
            };
            return Ok(self.complete(completion, pool));
        }
        Ok(None)
    }

    /// Cancellation is asynchronous, as with a real unlink: the block
    /// still surfaces through reap (unless configured lost).
    fn cancel(&mut self, block: &TransferBlock) -> Result<(), TransportError> {
        self.cancels += 1;
        self.in_flight.retain(|&s| s != block.slot);
        if !self.lose_cancelled_completions {
            self.script.push_back(MockCompletion {
                slot: Some(block.slot),
                packets: Vec::new(),
            });
        }
        Ok(())
    }
}

/// Builder for synthetic configuration-descriptor blobs.
pub mod blob {
    use crate::uac;

    pub struct DescriptorBlob {
        data: Vec<u8>,
    }

    impl DescriptorBlob {
        pub fn new() -> Self {
            Self { data: Vec::new() }
        }

        fn record(mut self, descriptor_type: u8, body: &[u8]) -> Self {
            self.data.push(body.len() as u8 + 2);
            self.data.push(descriptor_type);
            self.data.extend_from_slice(body);
            self
        }

        /// Standard interface descriptor for an audio-control interface.
        pub fn control_interface(self, number: u8) -> Self {
            self.record(
                uac::DT_INTERFACE,
                &[
                    number,
                    0,
                    0,
                    uac::CLASS_AUDIO,
                    uac::SUBCLASS_AUDIOCONTROL,
                    uac::IP_VERSION_02_00,
                    0,
                ],
            )
        }

        /// Standard interface descriptor for an audio-streaming
        /// alternate setting.
        pub fn streaming_interface(self, number: u8, alt: u8) -> Self {
            self.record(
                uac::DT_INTERFACE,
                &[
                    number,
                    alt,
                    if alt == 0 { 0 } else { 1 },
                    uac::CLASS_AUDIO,
                    uac::SUBCLASS_AUDIOSTREAMING,
                    uac::IP_VERSION_02_00,
                    0,
                ],
            )
        }

        /// UAC2 AS_GENERAL with a terminal link and channel count.
        pub fn as_general(self, terminal_link: u8, channels: u8) -> Self {
            self.record(
                uac::DT_CS_INTERFACE,
                &[
                    uac::AS_GENERAL,
                    terminal_link,
                    0b11, // bmControls
                    0x01, // bFormatType
                    0x01,
                    0,
                    0,
                    0, // bmFormats: PCM
                    channels,
                    0,
                    0,
                    0,
                    0, // bmChannelConfig
                    0, // iChannelNames
                ],
            )
        }

        /// UAC1 Type I format descriptor with a discrete rate table.
        pub fn format_type_uac1(self, channels: u8, subframe: u8, rates: &[u32]) -> Self {
            let mut body = vec![
                uac::AS_FORMAT_TYPE,
                0x01, // FORMAT_TYPE_I
                channels,
                subframe,
                subframe * 8,
                rates.len() as u8,
            ];
            for &rate in rates {
                body.extend_from_slice(&rate.to_le_bytes()[..3]);
            }
            self.record(uac::DT_CS_INTERFACE, &body)
        }

        /// UAC1 Type I format descriptor with a continuous range.
        pub fn format_type_uac1_continuous(
            self,
            channels: u8,
            subframe: u8,
            min: u32,
            max: u32,
        ) -> Self {
            let mut body = vec![
                uac::AS_FORMAT_TYPE,
                0x01,
                channels,
                subframe,
                subframe * 8,
                0, // continuous
            ];
            body.extend_from_slice(&min.to_le_bytes()[..3]);
            body.extend_from_slice(&max.to_le_bytes()[..3]);
            self.record(uac::DT_CS_INTERFACE, &body)
        }

        pub fn clock_source(self, id: u8, attributes: u8, controls: u8) -> Self {
            self.record(
                uac::DT_CS_INTERFACE,
                &[uac::AC_CLOCK_SOURCE, id, attributes, controls, 0, 0],
            )
        }

        pub fn clock_selector(self, id: u8, inputs: &[u8], controls: u8) -> Self {
            let mut body = vec![uac::AC_CLOCK_SELECTOR, id, inputs.len() as u8];
            body.extend_from_slice(inputs);
            body.push(controls);
            body.push(0); // iClockSelector
            self.record(uac::DT_CS_INTERFACE, &body)
        }

        pub fn clock_multiplier(self, id: u8, source_id: u8) -> Self {
            self.record(
                uac::DT_CS_INTERFACE,
                &[uac::AC_CLOCK_MULTIPLIER, id, source_id, 0, 0],
            )
        }

        /// UAC2 input terminal naming the clock that feeds it.
        pub fn input_terminal(self, terminal_id: u8, clock_id: u8) -> Self {
            self.record(
                uac::DT_CS_INTERFACE,
                &[
                    uac::AC_INPUT_TERMINAL,
                    terminal_id,
                    0x01,
                    0x02, // wTerminalType: microphone
                    0,
                    clock_id,
                    84,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                ],
            )
        }

        /// Isochronous IN endpoint.
        pub fn iso_in_endpoint(self, address: u8, max_packet: u16, interval: u8) -> Self {
            self.raw_endpoint(address, 0x05, max_packet, interval)
        }

        /// Endpoint with explicit attributes, for negative cases.
        pub fn raw_endpoint(self, address: u8, attributes: u8, max_packet: u16, interval: u8) -> Self {
            let packet = max_packet.to_le_bytes();
            self.record(
                uac::DT_ENDPOINT,
                &[address, attributes, packet[0], packet[1], interval],
            )
        }

        /// SuperSpeed endpoint companion.
        pub fn ss_companion(self, max_burst: u8, mult: u8, bytes_per_interval: u16) -> Self {
            let total = bytes_per_interval.to_le_bytes();
            self.record(
                uac::DT_SS_ENDPOINT_COMPANION,
                &[max_burst, mult, total[0], total[1]],
            )
        }

        pub fn build(self) -> Vec<u8> {
            self.data
        }

        /// Build with a leading standard configuration descriptor whose
        /// wTotalLength covers the whole blob, as GET_DESCRIPTOR returns.
        pub fn build_with_header(self) -> Vec<u8> {
            let total = (self.data.len() + 9) as u16;
            let mut out = vec![
                9,
                uac::DT_CONFIGURATION,
                total.to_le_bytes()[0],
                total.to_le_bytes()[1],
                2,    // bNumInterfaces
                1,    // bConfigurationValue
                0,    // iConfiguration
                0x80, // bmAttributes
                250,  // bMaxPower
            ];
            out.extend_from_slice(&self.data);
            out
        }
    }
}
