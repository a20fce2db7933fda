// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::ring::PacketRing,
    ipc::{
        doorbell::Doorbell,
        segment::SharedSegment,
        wire::{
            CommandPacket,
            ResponsePacket,
            CMD_RING_MAGIC,
            CMD_RING_OFFSET,
            DOORBELL_OFFSET,
            DOORBELL_SIZE,
            RING_REGION_SIZE,
            RSP_OK,
            RSP_RING_MAGIC,
            RSP_RING_OFFSET,
        },
    },
    runtime::fail::Fail,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Accelerator-side endpoint: consumes commands, produces responses. This is what the external
/// accelerator process attaches over the shared segment; in-process tests drive it directly to
/// stand in for that process.
pub struct PeerEndpoint {
    /// Command ring (this side consumes).
    cmd: PacketRing<CommandPacket>,
    /// Response ring (this side produces).
    rsp: PacketRing<ResponsePacket>,
    doorbell: Doorbell,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl PeerEndpoint {
    /// Attaches to a segment whose transport the kernel side has initialized.
    pub fn attach(segment: &SharedSegment) -> Result<PeerEndpoint, Fail> {
        let cmd: PacketRing<CommandPacket> =
            PacketRing::attach(segment.view(CMD_RING_OFFSET, RING_REGION_SIZE)?, CMD_RING_MAGIC)?;
        let rsp: PacketRing<ResponsePacket> =
            PacketRing::attach(segment.view(RSP_RING_OFFSET, RING_REGION_SIZE)?, RSP_RING_MAGIC)?;
        let doorbell: Doorbell = Doorbell::attach(segment.view(DOORBELL_OFFSET, DOORBELL_SIZE)?)?;

        Ok(Self { cmd, rsp, doorbell })
    }

    /// Checks for an unconsumed command.
    pub fn has_command(&self) -> bool {
        !self.cmd.is_empty()
    }

    /// Consumes one command, if any.
    pub fn poll_command(&self) -> Option<CommandPacket> {
        self.cmd.try_dequeue()
    }

    /// Clears the command pending flag. Callers drain the ring afterwards.
    pub fn acknowledge_command(&self) -> bool {
        self.doorbell.acknowledge_command()
    }

    /// Publishes a response and rings the response doorbell.
    pub fn push_response(&self, status: u16, orig_cmd: u16, result: u32, timestamp_us: u64) -> Result<(), Fail> {
        let packet: ResponsePacket = ResponsePacket {
            status,
            orig_cmd,
            result,
            timestamp_us,
        };
        let next: u32 = self.rsp.try_enqueue(&packet)?;
        self.doorbell.ring_response(next);
        Ok(())
    }

    /// Serves one pending command with an OK echo carrying `server_us` as the reported
    /// processing time. Returns the command served, if any.
    pub fn serve_one(&self, result: u32, server_us: u64) -> Option<CommandPacket> {
        let command: CommandPacket = self.poll_command()?;
        // Backpressure on the response ring is the peer's problem to retry; a lost echo
        // surfaces as a timeout on the kernel side.
        let _ = self.push_response(RSP_OK, command.cmd, result, server_us);
        Some(command)
    }

    pub fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }
}
