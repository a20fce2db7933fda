// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::collections::ring::{
    RingEntry,
    RING_ENTRY_SIZE,
};
use ::byteorder::{
    ByteOrder,
    LittleEndian,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Shared segment layout. Byte-exact and little-endian: the accelerator peer in the other address
// space parses these offsets directly.
//
//   0x00000  command ring (32 KiB): header + packets, kernel produces
//   0x08000  response ring (32 KiB): header + packets, peer produces
//   0x10000  doorbell control block (256 B)
//   0x10100  heap control block (~4 KiB)
//   0x11000  heap data region (~956 KiB), 64 B blocks
pub const SHARED_SEGMENT_SIZE: usize = 0x10_0000;
pub const CMD_RING_OFFSET: usize = 0x0_0000;
pub const RSP_RING_OFFSET: usize = 0x0_8000;
pub const RING_REGION_SIZE: usize = 0x8000;
pub const DOORBELL_OFFSET: usize = 0x1_0000;
pub const DOORBELL_SIZE: usize = 0x100;
pub const HEAP_CTL_OFFSET: usize = 0x1_0100;
pub const HEAP_CTL_SIZE: usize = 0xF00;
pub const HEAP_DATA_OFFSET: usize = 0x1_1000;
pub const HEAP_DATA_SIZE: usize = 0xE_F000;

/// Command ring magic.
pub const CMD_RING_MAGIC: u32 = 0x51DE_CA9E;
/// Response ring magic ("RSP0").
pub const RSP_RING_MAGIC: u32 = 0x5253_5030;
/// Doorbell magic ("DOOR").
pub const DOORBELL_MAGIC: u32 = 0x444F_4F52;
/// Heap control magic ("HEAP").
pub const HEAP_MAGIC: u32 = 0x4845_4150;
/// Blob header magic ("BLOB").
pub const BLOB_MAGIC: u32 = 0x424C_4F42;

/// Protocol version stamped into the doorbell and heap control blocks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default number of packets in each ring.
pub const DEFAULT_RING_SIZE: u32 = 1024;

// Command ids (0x0000-0x7FFF).
pub const CMD_PING: u16 = 0x0001;
pub const CMD_PRINT: u16 = 0x0002;
pub const CMD_RUN_MODEL: u16 = 0x0010;

// Response statuses (0x8000-0xFFFF); the high bit marks a response.
pub const RSP_OK: u16 = 0x8000;
pub const RSP_ERROR: u16 = 0x8001;
pub const RSP_BUSY: u16 = 0x8002;

/// Packet flag: request an interrupt on completion.
pub const FLAG_IRQ_ON_COMPLETE: u16 = 0x0001;

// Doorbell flags.
pub const DOORBELL_FLAG_IRQ_ENABLED: u32 = 0x01;
pub const DOORBELL_FLAG_PENDING: u32 = 0x02;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A command published by the kernel side (16 bytes on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandPacket {
    pub cmd: u16,
    pub flags: u16,
    /// Id of the blob carrying the payload in the shared heap.
    pub payload_id: u32,
    /// Send timestamp, for latency tracking.
    pub timestamp_us: u64,
}

/// A response published by the accelerator side (16 bytes on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponsePacket {
    pub status: u16,
    /// The command this responds to.
    pub orig_cmd: u16,
    /// Result value or error code.
    pub result: u32,
    /// Server-side processing time, in microseconds.
    pub timestamp_us: u64,
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl RingEntry for CommandPacket {
    fn encode(&self, buf: &mut [u8; RING_ENTRY_SIZE]) {
        LittleEndian::write_u16(&mut buf[0..2], self.cmd);
        LittleEndian::write_u16(&mut buf[2..4], self.flags);
        LittleEndian::write_u32(&mut buf[4..8], self.payload_id);
        LittleEndian::write_u64(&mut buf[8..16], self.timestamp_us);
    }

    fn decode(buf: &[u8; RING_ENTRY_SIZE]) -> Self {
        Self {
            cmd: LittleEndian::read_u16(&buf[0..2]),
            flags: LittleEndian::read_u16(&buf[2..4]),
            payload_id: LittleEndian::read_u32(&buf[4..8]),
            timestamp_us: LittleEndian::read_u64(&buf[8..16]),
        }
    }
}

impl RingEntry for ResponsePacket {
    fn encode(&self, buf: &mut [u8; RING_ENTRY_SIZE]) {
        LittleEndian::write_u16(&mut buf[0..2], self.status);
        LittleEndian::write_u16(&mut buf[2..4], self.orig_cmd);
        LittleEndian::write_u32(&mut buf[4..8], self.result);
        LittleEndian::write_u64(&mut buf[8..16], self.timestamp_us);
    }

    fn decode(buf: &[u8; RING_ENTRY_SIZE]) -> Self {
        Self {
            status: LittleEndian::read_u16(&buf[0..2]),
            orig_cmd: LittleEndian::read_u16(&buf[2..4]),
            result: LittleEndian::read_u32(&buf[4..8]),
            timestamp_us: LittleEndian::read_u64(&buf[8..16]),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        CommandPacket,
        ResponsePacket,
        CMD_PING,
        RSP_OK,
    };
    use crate::collections::ring::{
        RingEntry,
        RING_ENTRY_SIZE,
    };
    use ::anyhow::Result;

    /// Tests the exact wire bytes of a command packet.
    #[test]
    fn command_wire_format() -> Result<()> {
        let packet: CommandPacket = CommandPacket {
            cmd: CMD_PING,
            flags: 0,
            payload_id: 0xDEAD_BEEF,
            timestamp_us: 0x0102_0304_0506_0708,
        };
        let mut buf: [u8; RING_ENTRY_SIZE] = [0; RING_ENTRY_SIZE];
        packet.encode(&mut buf);

        crate::ensure_eq!(buf[0], 0x01); // cmd low byte first
        crate::ensure_eq!(buf[1], 0x00);
        crate::ensure_eq!(buf[4], 0xEF); // payload little-endian
        crate::ensure_eq!(buf[7], 0xDE);
        crate::ensure_eq!(buf[8], 0x08); // timestamp little-endian
        crate::ensure_eq!(buf[15], 0x01);

        crate::ensure_eq!(CommandPacket::decode(&buf), packet);
        Ok(())
    }

    /// Tests the response packet codec.
    #[test]
    fn response_wire_format() -> Result<()> {
        let packet: ResponsePacket = ResponsePacket {
            status: RSP_OK,
            orig_cmd: CMD_PING,
            result: 42,
            timestamp_us: 900,
        };
        let mut buf: [u8; RING_ENTRY_SIZE] = [0; RING_ENTRY_SIZE];
        packet.encode(&mut buf);

        crate::ensure_eq!(buf[1], 0x80); // status high bit marks a response
        crate::ensure_eq!(ResponsePacket::decode(&buf), packet);
        Ok(())
    }
}
