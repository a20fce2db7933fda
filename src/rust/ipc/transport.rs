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
            RSP_RING_MAGIC,
            RSP_RING_OFFSET,
        },
    },
    runtime::{
        fail::Fail,
        SharedClock,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Kernel-side endpoint of the accelerator transport: produces commands, consumes responses, and
/// rings the doorbell after every publish. One producer and one consumer per ring; the peer in
/// the other address space is the counterpart.
pub struct Transport {
    /// Command ring (this side produces).
    cmd: PacketRing<CommandPacket>,
    /// Response ring (this side consumes).
    rsp: PacketRing<ResponsePacket>,
    doorbell: Doorbell,
    clock: SharedClock,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Transport {
    /// Initializes the transport over a segment: writes both ring headers and the doorbell
    /// control block. The accelerator side attaches afterwards with [super::PeerEndpoint::attach].
    pub fn host(segment: &SharedSegment, clock: SharedClock, ring_size: u32) -> Result<Transport, Fail> {
        let cmd: PacketRing<CommandPacket> =
            PacketRing::create(segment.view(CMD_RING_OFFSET, RING_REGION_SIZE)?, CMD_RING_MAGIC, ring_size)?;
        let rsp: PacketRing<ResponsePacket> =
            PacketRing::create(segment.view(RSP_RING_OFFSET, RING_REGION_SIZE)?, RSP_RING_MAGIC, ring_size)?;
        let doorbell: Doorbell = Doorbell::create(segment.view(DOORBELL_OFFSET, DOORBELL_SIZE)?)?;

        debug!("host(): transport ready (ring_size={})", ring_size);

        Ok(Self {
            cmd,
            rsp,
            doorbell,
            clock,
        })
    }

    /// Publishes a command with no flags.
    pub fn send(&self, cmd: u16, payload_id: u32) -> Result<(), Fail> {
        self.send_flags(cmd, payload_id, 0)
    }

    /// Publishes a command and rings the command doorbell.
    pub fn send_flags(&self, cmd: u16, payload_id: u32, flags: u16) -> Result<(), Fail> {
        let packet: CommandPacket = CommandPacket {
            cmd,
            flags,
            payload_id,
            timestamp_us: self.clock.now_us(),
        };
        let next: u32 = match self.cmd.try_enqueue(&packet) {
            Ok(next) => next,
            Err(e) => {
                warn!("send_flags(): command ring full (cmd={:#x})", cmd);
                return Err(e);
            },
        };
        self.doorbell.ring_command(next);
        Ok(())
    }

    /// Checks for an unconsumed response.
    pub fn has_response(&self) -> bool {
        !self.rsp.is_empty()
    }

    /// Consumes one response, if any.
    pub fn poll_response(&self) -> Option<ResponsePacket> {
        self.rsp.try_dequeue()
    }

    /// Interrupt entry point: acknowledges the doorbell, then drains every pending response into
    /// `sink`. Draining after the acknowledge is what prevents lost wakeups.
    pub fn service_irq<F: FnMut(ResponsePacket)>(&self, mut sink: F) -> usize {
        self.doorbell.acknowledge_response();

        let mut drained: usize = 0;
        while let Some(response) = self.poll_response() {
            sink(response);
            drained += 1;
        }
        drained
    }

    pub fn set_response_irq_enabled(&self, enabled: bool) {
        self.doorbell.set_response_irq_enabled(enabled);
    }

    pub fn command_ring(&self) -> &PacketRing<CommandPacket> {
        &self.cmd
    }

    pub fn response_ring(&self) -> &PacketRing<ResponsePacket> {
        &self.rsp
    }

    pub fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }

    /// Dumps ring and doorbell state through the logging facade.
    pub fn dump(&self) {
        debug!(
            "cmd ring: head={} tail={} pending={}",
            self.cmd.head(),
            self.cmd.tail(),
            self.cmd.len()
        );
        debug!(
            "rsp ring: head={} tail={} pending={}",
            self.rsp.head(),
            self.rsp.tail(),
            self.rsp.len()
        );
        debug!(
            "doorbell: cmd={} (writes={}, irqs={}) rsp={} (writes={}, irqs={})",
            self.doorbell.command_doorbell(),
            self.doorbell.command_writes(),
            self.doorbell.command_irq_count(),
            self.doorbell.response_doorbell(),
            self.doorbell.response_writes(),
            self.doorbell.response_irq_count()
        );
    }
}
