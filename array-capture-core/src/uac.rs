//! USB and USB Audio Class wire constants.
//!
//! Only the subset this engine actually speaks: standard descriptor
//! walking, alternate-setting selection, and the UAC1/UAC2 clock and
//! sample-rate controls. Mixer/volume units are out of scope.

// Standard descriptor types.
pub const DT_CONFIGURATION: u8 = 0x02;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;
pub const DT_CS_INTERFACE: u8 = 0x24;
pub const DT_SS_ENDPOINT_COMPANION: u8 = 0x30;

// Audio interface class/subclass.
pub const CLASS_AUDIO: u8 = 0x01;
pub const SUBCLASS_AUDIOCONTROL: u8 = 0x01;
pub const SUBCLASS_AUDIOSTREAMING: u8 = 0x02;
/// bInterfaceProtocol marking a UAC2 function.
pub const IP_VERSION_02_00: u8 = 0x20;

// Class-specific audio-control interface descriptor subtypes (UAC2).
pub const AC_INPUT_TERMINAL: u8 = 0x02;
pub const AC_CLOCK_SOURCE: u8 = 0x0A;
pub const AC_CLOCK_SELECTOR: u8 = 0x0B;
pub const AC_CLOCK_MULTIPLIER: u8 = 0x0C;

// Class-specific audio-streaming interface descriptor subtypes.
pub const AS_GENERAL: u8 = 0x01;
pub const AS_FORMAT_TYPE: u8 = 0x02;

// Standard requests.
pub const GET_DESCRIPTOR: u8 = 0x06;

// bmRequestType values.
pub const REQ_IN_STANDARD_DEVICE: u8 = 0x80;
pub const REQ_OUT_CLASS_INTERFACE: u8 = 0x21;
pub const REQ_IN_CLASS_INTERFACE: u8 = 0xA1;
pub const REQ_OUT_CLASS_ENDPOINT: u8 = 0x22;
pub const REQ_IN_CLASS_ENDPOINT: u8 = 0xA2;

// UAC2 class requests and control selectors.
pub const UAC2_CUR: u8 = 0x01;
pub const CS_SAM_FREQ_CONTROL: u8 = 0x01;
pub const CS_CLOCK_VALID_CONTROL: u8 = 0x02;
pub const CX_CLOCK_SELECTOR_CONTROL: u8 = 0x01;

// UAC1 class requests and per-endpoint control selectors.
pub const UAC1_SET_CUR: u8 = 0x01;
pub const UAC1_GET_CUR: u8 = 0x81;
pub const EP_SAMPLING_FREQ_CONTROL: u8 = 0x01;
pub const EP_PITCH_CONTROL: u8 = 0x02;

/// Read one control's 2-bit field from a UAC2 bmControls bitmap.
fn control_bits(bitmap: u32, control: u8) -> u32 {
    (bitmap >> (2 * control)) & 0b11
}

/// Control is at least host-readable (0b01 or 0b11).
pub fn control_readable(bitmap: u32, control: u8) -> bool {
    control_bits(bitmap, control) & 0b01 != 0
}

/// Control is host-programmable (0b11).
pub fn control_writable(bitmap: u32, control: u8) -> bool {
    control_bits(bitmap, control) == 0b11
}

/// wValue for a UAC2 entity control: selector in the high byte.
pub fn uac2_control_value(control_selector: u8) -> u16 {
    (control_selector as u16) << 8
}

/// wIndex addressing a UAC2 entity behind an audio-control interface.
pub fn uac2_entity_index(entity_id: u8, interface: u8) -> u16 {
    ((entity_id as u16) << 8) | interface as u16
}
