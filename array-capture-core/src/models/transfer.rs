/// Per-packet descriptor of one isochronous transfer block.
#[derive(Debug, Clone, Default)]
pub struct IsoPacket {
    /// Bytes requested for this packet.
    pub length: u32,
    /// Bytes the device actually delivered.
    pub actual_length: u32,
    /// Completion status, 0 on success (negative errno convention).
    pub status: i32,
}

/// One in-flight isochronous request.
///
/// Blocks live in the engine's fixed-size pool and are addressed by
/// `slot`, never by pointer identity; the transport encodes the slot in
/// its completion correlation so reaping is a bounds-checked integer
/// lookup. The buffer must not be touched or reallocated by the engine
/// while the block is in flight.
#[derive(Debug)]
pub struct TransferBlock {
    /// Index of this block in the engine pool.
    pub slot: usize,
    /// IN endpoint address (direction bit set).
    pub endpoint: u8,
    /// Packet payloads, laid out at `length`-sized strides.
    pub buffer: Vec<u8>,
    pub packets: Vec<IsoPacket>,
}

impl TransferBlock {
    pub fn new(slot: usize, endpoint: u8, packet_size: usize, packet_count: usize) -> Self {
        let packets = (0..packet_count)
            .map(|_| IsoPacket {
                length: packet_size as u32,
                actual_length: 0,
                status: 0,
            })
            .collect();
        Self {
            slot,
            endpoint,
            buffer: vec![0u8; packet_size * packet_count],
            packets,
        }
    }

    /// Clear completion results before resubmission.
    pub fn reset(&mut self) {
        for packet in &mut self.packets {
            packet.actual_length = 0;
            packet.status = 0;
        }
    }

    /// Total payload bytes across successfully completed packets.
    pub fn payload_len(&self) -> usize {
        self.packets
            .iter()
            .filter(|p| p.status == 0)
            .map(|p| p.actual_length as usize)
            .sum()
    }
}
