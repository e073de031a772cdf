//! Isochronous endpoint candidates and the selection policy.

use crate::models::config::BusSpeed;
use crate::models::error::CaptureError;

/// Sample rates a streaming alternate setting advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateSupport {
    /// Explicit list from a UAC1 Type I format descriptor.
    Discrete(Vec<u32>),
    /// Continuous range, inclusive on both ends.
    Continuous { min: u32, max: u32 },
    /// Nothing advertised (UAC2 formats leave rates to the clock).
    Unspecified,
}

impl RateSupport {
    /// Exact advertised match for the requested rate.
    pub fn advertises(&self, rate: u32) -> bool {
        match self {
            RateSupport::Discrete(rates) => rates.contains(&rate),
            RateSupport::Continuous { .. } | RateSupport::Unspecified => false,
        }
    }

    /// Continuous range containing the requested rate.
    pub fn covers(&self, rate: u32) -> bool {
        match self {
            RateSupport::Continuous { min, max } => (*min..=*max).contains(&rate),
            _ => false,
        }
    }
}

/// One isochronous IN endpoint discovered in a non-idle alternate
/// setting. Transient: only the winner's fields survive selection.
#[derive(Debug, Clone)]
pub struct EndpointCandidate {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub endpoint_address: u8,

    /// Base isochronous packet size (wMaxPacketSize bits 10..0).
    pub packet_size: usize,

    /// Bus capacity per serviced interval, including high-speed
    /// additional transactions or the SuperSpeed companion total.
    pub bytes_per_interval: usize,

    /// Service intervals between consecutive packets (2^(bInterval-1)).
    pub packets_per_service_interval: u32,

    pub speed: BusSpeed,

    /// Channel count advertised by the alternate setting, if any.
    pub channels: Option<u16>,

    /// Subslot size advertised by the format descriptor, if any.
    pub bytes_per_sample: Option<u16>,

    pub rates: RateSupport,
}

impl EndpointCandidate {
    /// Sample rate implied by packet geometry alone.
    ///
    /// bytesPerInterval / frameSize frames arrive every
    /// packetsPerServiceInterval service intervals.
    pub fn derived_sample_rate(&self, frame_size: usize) -> f64 {
        if frame_size == 0 || self.packets_per_service_interval == 0 {
            return 0.0;
        }
        let frames_per_packet = self.bytes_per_interval as f64 / frame_size as f64;
        let intervals_per_sec = self.speed.service_intervals_per_sec() as f64;
        frames_per_packet * intervals_per_sec / self.packets_per_service_interval as f64
    }

    /// Relative distance of the best rate this candidate can claim
    /// (advertised or derived) from the request.
    fn rate_distance(&self, requested: u32, frame_size: usize) -> f64 {
        let requested_f = requested as f64;
        let mut best = (self.derived_sample_rate(frame_size) - requested_f).abs() / requested_f;
        if let RateSupport::Discrete(rates) = &self.rates {
            for &rate in rates {
                let d = (rate as f64 - requested_f).abs() / requested_f;
                if d < best {
                    best = d;
                }
            }
        }
        if self.rates.covers(requested) {
            best = 0.0;
        }
        best
    }

    /// Advertised or derived rate within the 5% match tolerance.
    pub fn matches_requested(&self, requested: u32, frame_size: usize) -> bool {
        self.rate_distance(requested, frame_size) <= RATE_TOLERANCE
    }
}

const RATE_TOLERANCE: f64 = 0.05;

/// Distances closer than this are considered equal; bus load decides.
const RATE_EPSILON: f64 = 0.005;

/// Pick the endpoint to stream from.
///
/// Deterministic total order, best first:
/// 1. exact advertised discrete rate,
/// 2. advertised/derived rate within 5% of the request (a continuous
///    range containing the request counts),
/// 3. measurably closer rate,
/// 4. smaller bytesPerInterval (lower bus load),
/// 5. declaration order.
pub fn select_endpoint<'a>(
    candidates: &'a [EndpointCandidate],
    requested_rate: u32,
    frame_size: usize,
) -> Result<&'a EndpointCandidate, CaptureError> {
    let mut best: Option<&EndpointCandidate> = None;
    for candidate in candidates {
        best = Some(match best {
            None => candidate,
            Some(current) => {
                if prefer(candidate, current, requested_rate, frame_size) {
                    candidate
                } else {
                    current
                }
            }
        });
    }
    best.ok_or(CaptureError::NoSuitableEndpoint)
}

/// Whether `a` beats the incumbent `b`. Strict: ties keep `b`, so
/// declaration order breaks anything the earlier criteria leave open.
fn prefer(a: &EndpointCandidate, b: &EndpointCandidate, requested: u32, frame_size: usize) -> bool {
    let exact_a = a.rates.advertises(requested);
    let exact_b = b.rates.advertises(requested);
    if exact_a != exact_b {
        return exact_a;
    }

    let near_a = a.matches_requested(requested, frame_size);
    let near_b = b.matches_requested(requested, frame_size);
    if near_a != near_b {
        return near_a;
    }

    let dist_a = a.rate_distance(requested, frame_size);
    let dist_b = b.rate_distance(requested, frame_size);
    if (dist_a - dist_b).abs() > RATE_EPSILON {
        return dist_a < dist_b;
    }

    a.bytes_per_interval < b.bytes_per_interval
}
