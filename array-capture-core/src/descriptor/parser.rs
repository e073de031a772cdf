//! Configuration-descriptor parsing.
//!
//! Walks the raw tag-length-value blob a GET_DESCRIPTOR control
//! transfer returns and builds owned records: isochronous IN endpoint
//! candidates, the clock entity graph, and the terminal links joining
//! streaming interfaces to their clocks. Pure function, no I/O.
//!
//! Parsing fails closed: a zero-length or out-of-bounds record stops
//! the walk and whatever was collected so far is returned.

use crate::descriptor::clock::ClockEntity;
use crate::descriptor::endpoint::{EndpointCandidate, RateSupport};
use crate::models::config::BusSpeed;
use crate::uac;

/// Everything discovery extracts from one configuration descriptor.
#[derive(Debug, Default)]
pub struct ParsedDescriptors {
    pub candidates: Vec<EndpointCandidate>,
    pub clocks: Vec<ClockEntity>,
    /// Audio-control interface number, if one was seen.
    pub ac_interface: Option<u8>,
    /// Input terminal id -> clock entity id feeding it.
    terminal_clocks: Vec<(u8, u8)>,
    /// Streaming interface number -> linked terminal id.
    stream_terminals: Vec<(u8, u8)>,
}

impl ParsedDescriptors {
    /// The clock entity feeding a streaming interface, joined through
    /// its linked input terminal.
    pub fn clock_for_interface(&self, interface: u8) -> Option<u8> {
        let (_, terminal) = self
            .stream_terminals
            .iter()
            .find(|(iface, _)| *iface == interface)?;
        let (_, clock) = self
            .terminal_clocks
            .iter()
            .find(|(term, _)| term == terminal)?;
        Some(*clock)
    }

    /// Fallback when the terminal join fails: the first clock source.
    pub fn first_clock_source(&self) -> Option<u8> {
        self.clocks.iter().find_map(|e| match e {
            ClockEntity::Source { id, .. } => Some(*id),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum InterfaceKind {
    AudioControl,
    AudioStreaming,
    Other,
}

/// Interface-level context carried across descriptors.
#[derive(Debug, Clone, Copy)]
struct CurrentInterface {
    number: u8,
    alt_setting: u8,
    kind: InterfaceKind,
}

/// Format facts collected for the current alternate setting, attached
/// to its endpoints once they appear.
#[derive(Debug, Clone, Default)]
struct AltFormat {
    channels: Option<u16>,
    bytes_per_sample: Option<u16>,
    rates: Option<RateSupport>,
}

/// Parse a raw configuration descriptor blob.
pub fn parse_configuration(data: &[u8], speed: BusSpeed) -> ParsedDescriptors {
    let mut out = ParsedDescriptors::default();
    let mut current: Option<CurrentInterface> = None;
    let mut format = AltFormat::default();
    // Candidates for the current alternate setting; format facts can
    // arrive after the endpoint, so they are applied when the setting
    // closes.
    let mut open_candidates: Vec<EndpointCandidate> = Vec::new();

    let mut offset = 0usize;
    while offset + 2 <= data.len() {
        let length = data[offset] as usize;
        let descriptor_type = data[offset + 1];
        if length < 2 || offset + length > data.len() {
            log::warn!(
                "descriptor walk stopped at offset {offset}: record length {length} out of bounds"
            );
            break;
        }
        let record = &data[offset..offset + length];

        match descriptor_type {
            uac::DT_INTERFACE => {
                flush_alt_setting(&mut out, &mut open_candidates, &format);
                format = AltFormat::default();
                current = parse_interface(record, &mut out);
            }
            uac::DT_CS_INTERFACE => match current.map(|c| c.kind) {
                Some(InterfaceKind::AudioControl) => parse_audio_control(record, &mut out),
                Some(InterfaceKind::AudioStreaming) => {
                    if let Some(iface) = current {
                        parse_audio_streaming(record, iface.number, &mut out, &mut format);
                    }
                }
                _ => {}
            },
            uac::DT_ENDPOINT => {
                if let Some(iface) = current {
                    parse_endpoint(record, iface, speed, &mut open_candidates);
                }
            }
            uac::DT_SS_ENDPOINT_COMPANION => {
                parse_ss_companion(record, open_candidates.last_mut());
            }
            _ => {}
        }

        offset += length;
    }

    flush_alt_setting(&mut out, &mut open_candidates, &format);
    out
}

/// Close out the current alternate setting: stamp collected format
/// facts onto its endpoints and promote them to candidates.
fn flush_alt_setting(
    out: &mut ParsedDescriptors,
    open_candidates: &mut Vec<EndpointCandidate>,
    format: &AltFormat,
) {
    for mut candidate in open_candidates.drain(..) {
        candidate.channels = format.channels;
        candidate.bytes_per_sample = format.bytes_per_sample;
        candidate.rates = format.rates.clone().unwrap_or(RateSupport::Unspecified);
        out.candidates.push(candidate);
    }
}

fn parse_interface(record: &[u8], out: &mut ParsedDescriptors) -> Option<CurrentInterface> {
    if record.len() < 9 {
        return None;
    }
    let number = record[2];
    let alt_setting = record[3];
    let class = record[5];
    let subclass = record[6];

    let kind = if class == uac::CLASS_AUDIO && subclass == uac::SUBCLASS_AUDIOCONTROL {
        out.ac_interface.get_or_insert(number);
        InterfaceKind::AudioControl
    } else if class == uac::CLASS_AUDIO && subclass == uac::SUBCLASS_AUDIOSTREAMING {
        InterfaceKind::AudioStreaming
    } else {
        InterfaceKind::Other
    };

    Some(CurrentInterface {
        number,
        alt_setting,
        kind,
    })
}

fn parse_audio_control(record: &[u8], out: &mut ParsedDescriptors) {
    // A class-specific record needs at least a subtype byte.
    let Some(&subtype) = record.get(2) else { return };
    match subtype {
        uac::AC_CLOCK_SOURCE if record.len() >= 6 => {
            out.clocks.push(ClockEntity::Source {
                id: record[3],
                attributes: record[4],
                controls: record[5],
            });
        }
        uac::AC_CLOCK_SELECTOR if record.len() >= 5 => {
            let pin_count = record[4] as usize;
            if record.len() < 5 + pin_count + 1 {
                return;
            }
            out.clocks.push(ClockEntity::Selector {
                id: record[3],
                inputs: record[5..5 + pin_count].to_vec(),
                controls: record[5 + pin_count],
            });
        }
        uac::AC_CLOCK_MULTIPLIER if record.len() >= 5 => {
            out.clocks.push(ClockEntity::Multiplier {
                id: record[3],
                source_id: record[4],
            });
        }
        uac::AC_INPUT_TERMINAL if record.len() >= 9 => {
            // UAC2 input terminal names the clock feeding it.
            out.terminal_clocks.push((record[3], record[7]));
        }
        _ => {}
    }
}

fn parse_audio_streaming(
    record: &[u8],
    interface: u8,
    out: &mut ParsedDescriptors,
    format: &mut AltFormat,
) {
    let Some(&subtype) = record.get(2) else { return };
    match subtype {
        uac::AS_GENERAL if record.len() >= 7 => {
            let terminal_link = record[3];
            if !out
                .stream_terminals
                .iter()
                .any(|(iface, _)| *iface == interface)
            {
                out.stream_terminals.push((interface, terminal_link));
            }
            // UAC2 layout carries the channel count; UAC1 does not.
            if record.len() >= 16 {
                format.channels = Some(record[10] as u16);
            }
        }
        uac::AS_FORMAT_TYPE => parse_format_type(record, format),
        _ => {}
    }
}

fn parse_format_type(record: &[u8], format: &mut AltFormat) {
    if record.len() >= 8 {
        // UAC1 Type I: channel count, subframe size, then the rate
        // table (discrete list, or min/max when bSamFreqType is 0).
        format.channels = Some(record[4] as u16);
        format.bytes_per_sample = Some(record[5] as u16);
        let rate_count = record[7] as usize;
        let table = &record[8..];
        if rate_count == 0 {
            if table.len() >= 6 {
                format.rates = Some(RateSupport::Continuous {
                    min: rate24(&table[0..3]),
                    max: rate24(&table[3..6]),
                });
            }
        } else if table.len() >= rate_count * 3 {
            let rates = (0..rate_count)
                .map(|i| rate24(&table[i * 3..i * 3 + 3]))
                .collect();
            format.rates = Some(RateSupport::Discrete(rates));
        }
    } else if record.len() >= 6 {
        // UAC2 Type I: subslot size only; rates live on the clock.
        format.bytes_per_sample = Some(record[4] as u16);
    }
}

fn rate24(bytes: &[u8]) -> u32 {
    u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16
}

fn parse_endpoint(
    record: &[u8],
    iface: CurrentInterface,
    speed: BusSpeed,
    open_candidates: &mut Vec<EndpointCandidate>,
) {
    if record.len() < 7 {
        return;
    }
    // Alt 0 is the idle setting; nothing streams there.
    if iface.kind != InterfaceKind::AudioStreaming || iface.alt_setting == 0 {
        return;
    }
    let address = record[2];
    let attributes = record[3];
    let is_isochronous_in = attributes & 0x03 == 0x01 && address & 0x80 != 0;
    if !is_isochronous_in {
        return;
    }

    let max_packet = u16::from_le_bytes([record[4], record[5]]);
    let base_size = (max_packet & 0x07FF) as usize;
    let extra_transactions = ((max_packet >> 11) & 0x03) as usize;
    let interval = record[6];

    let bytes_per_interval = match speed {
        BusSpeed::Full => base_size,
        BusSpeed::High => base_size * (1 + extra_transactions),
        // Provisional until a companion descriptor refines it.
        BusSpeed::Super => base_size,
    };

    let packets_per_service_interval = 1u32 << interval.saturating_sub(1).min(15);

    open_candidates.push(EndpointCandidate {
        interface_number: iface.number,
        alternate_setting: iface.alt_setting,
        endpoint_address: address,
        packet_size: base_size,
        bytes_per_interval,
        packets_per_service_interval,
        speed,
        channels: None,
        bytes_per_sample: None,
        rates: RateSupport::Unspecified,
    });
}

fn parse_ss_companion(record: &[u8], candidate: Option<&mut EndpointCandidate>) {
    let Some(candidate) = candidate else { return };
    if record.len() < 6 || candidate.speed != BusSpeed::Super {
        return;
    }
    let burst = record[2] as usize;
    let mult = (record[3] & 0x03) as usize;
    let total = u16::from_le_bytes([record[4], record[5]]) as usize;
    candidate.bytes_per_interval = if total > 0 {
        total
    } else {
        candidate.packet_size * (burst + 1) * (mult + 1)
    };
    candidate.packet_size = candidate.packet_size.max(candidate.bytes_per_interval);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::blob::DescriptorBlob;

    #[test]
    fn finds_iso_in_endpoint_in_nonzero_alt() {
        let blob = DescriptorBlob::new()
            .streaming_interface(1, 0)
            .streaming_interface(1, 1)
            .as_general(0x02, 84)
            .iso_in_endpoint(0x81, 1512, 1)
            .build();

        let parsed = parse_configuration(&blob, BusSpeed::High);
        assert_eq!(parsed.candidates.len(), 1);
        let c = &parsed.candidates[0];
        assert_eq!(c.interface_number, 1);
        assert_eq!(c.alternate_setting, 1);
        assert_eq!(c.endpoint_address, 0x81);
        assert_eq!(c.bytes_per_interval, 1512);
        assert_eq!(c.channels, Some(84));
    }

    #[test]
    fn skips_idle_alt_setting_endpoints() {
        let blob = DescriptorBlob::new()
            .streaming_interface(1, 0)
            .iso_in_endpoint(0x81, 512, 1)
            .build();
        let parsed = parse_configuration(&blob, BusSpeed::High);
        assert!(parsed.candidates.is_empty());
    }

    #[test]
    fn skips_out_and_non_iso_endpoints() {
        let mut blob = DescriptorBlob::new().streaming_interface(1, 1);
        // OUT isochronous and IN bulk.
        blob = blob.raw_endpoint(0x01, 0x01, 512, 1);
        blob = blob.raw_endpoint(0x82, 0x02, 512, 0);
        let parsed = parse_configuration(&blob.build(), BusSpeed::High);
        assert!(parsed.candidates.is_empty());
    }

    #[test]
    fn decodes_high_speed_additional_transactions() {
        // Base 756 with one extra transaction per microframe.
        let blob = DescriptorBlob::new()
            .streaming_interface(1, 1)
            .raw_endpoint(0x81, 0x05, 756 | (1 << 11), 1)
            .build();
        let parsed = parse_configuration(&blob, BusSpeed::High);
        assert_eq!(parsed.candidates[0].bytes_per_interval, 1512);
        assert_eq!(parsed.candidates[0].packet_size, 756);
    }

    #[test]
    fn superspeed_companion_overrides_bytes_per_interval() {
        let blob = DescriptorBlob::new()
            .streaming_interface(1, 1)
            .iso_in_endpoint(0x81, 1024, 1)
            .ss_companion(2, 1, 6048)
            .build();
        let parsed = parse_configuration(&blob, BusSpeed::Super);
        assert_eq!(parsed.candidates[0].bytes_per_interval, 6048);
    }

    #[test]
    fn discrete_rate_table_parses() {
        let blob = DescriptorBlob::new()
            .streaming_interface(1, 1)
            .format_type_uac1(84, 3, &[44_100, 48_000, 96_000])
            .iso_in_endpoint(0x81, 1512, 1)
            .build();
        let parsed = parse_configuration(&blob, BusSpeed::High);
        let c = &parsed.candidates[0];
        assert_eq!(
            c.rates,
            RateSupport::Discrete(vec![44_100, 48_000, 96_000])
        );
        assert_eq!(c.channels, Some(84));
        assert_eq!(c.bytes_per_sample, Some(3));
    }

    #[test]
    fn continuous_rate_range_parses() {
        let blob = DescriptorBlob::new()
            .streaming_interface(1, 1)
            .format_type_uac1_continuous(84, 3, 8_000, 192_000)
            .iso_in_endpoint(0x81, 1512, 1)
            .build();
        let parsed = parse_configuration(&blob, BusSpeed::High);
        assert_eq!(
            parsed.candidates[0].rates,
            RateSupport::Continuous {
                min: 8_000,
                max: 192_000
            }
        );
    }

    #[test]
    fn format_facts_apply_even_when_declared_after_endpoint() {
        let blob = DescriptorBlob::new()
            .streaming_interface(1, 1)
            .iso_in_endpoint(0x81, 1512, 1)
            .format_type_uac1(84, 3, &[48_000])
            .build();
        let parsed = parse_configuration(&blob, BusSpeed::High);
        assert_eq!(parsed.candidates[0].bytes_per_sample, Some(3));
    }

    #[test]
    fn clock_entities_parse_into_graph() {
        let blob = DescriptorBlob::new()
            .control_interface(0)
            .clock_source(0x10, 0x01, 0b0111)
            .clock_selector(0x20, &[0x10, 0x11], 0b11)
            .clock_multiplier(0x21, 0x10)
            .build();
        let parsed = parse_configuration(&blob, BusSpeed::High);
        assert_eq!(parsed.ac_interface, Some(0));
        assert_eq!(parsed.clocks.len(), 3);
        assert_eq!(parsed.first_clock_source(), Some(0x10));
        assert!(matches!(
            parsed.clocks[1],
            ClockEntity::Selector { id: 0x20, .. }
        ));
    }

    #[test]
    fn stream_clock_join_through_input_terminal() {
        let blob = DescriptorBlob::new()
            .control_interface(0)
            .clock_source(0x10, 0x01, 0b0111)
            .input_terminal(0x02, 0x10)
            .streaming_interface(1, 1)
            .as_general(0x02, 84)
            .iso_in_endpoint(0x81, 1512, 1)
            .build();
        let parsed = parse_configuration(&blob, BusSpeed::High);
        assert_eq!(parsed.clock_for_interface(1), Some(0x10));
        assert_eq!(parsed.clock_for_interface(7), None);
    }

    #[test]
    fn subtype_less_cs_records_are_skipped() {
        // Length-2 class-specific records: header only, no subtype.
        let mut blob = DescriptorBlob::new().control_interface(0).build();
        blob.extend_from_slice(&[2, 0x24]);
        let mut tail = DescriptorBlob::new()
            .clock_source(0x10, 0x01, 0b0111)
            .streaming_interface(1, 1)
            .build();
        tail.extend_from_slice(&[2, 0x24]);
        blob.extend_from_slice(&tail);
        blob.extend_from_slice(
            &DescriptorBlob::new().iso_in_endpoint(0x81, 1512, 1).build(),
        );

        let parsed = parse_configuration(&blob, BusSpeed::High);
        // The walk continues past both malformed records.
        assert_eq!(parsed.clocks.len(), 1);
        assert_eq!(parsed.candidates.len(), 1);
    }

    #[test]
    fn zero_length_record_stops_the_walk() {
        let mut blob = DescriptorBlob::new()
            .streaming_interface(1, 1)
            .iso_in_endpoint(0x81, 1512, 1)
            .build();
        blob.push(0); // zero-length record
        blob.push(0x05);
        blob.extend_from_slice(&[0xFF; 16]);
        let parsed = parse_configuration(&blob, BusSpeed::High);
        // Everything before the bad record is retained.
        assert_eq!(parsed.candidates.len(), 1);
    }

    #[test]
    fn truncated_record_stops_the_walk() {
        let mut blob = DescriptorBlob::new().streaming_interface(1, 1).build();
        blob.push(30); // claims 30 bytes, blob ends here
        blob.push(0x05);
        let parsed = parse_configuration(&blob, BusSpeed::High);
        assert!(parsed.candidates.is_empty());
    }

    #[test]
    fn empty_blob_yields_nothing() {
        let parsed = parse_configuration(&[], BusSpeed::High);
        assert!(parsed.candidates.is_empty());
        assert!(parsed.clocks.is_empty());
    }
}
