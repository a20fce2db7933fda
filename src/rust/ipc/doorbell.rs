// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::raw_region::RegionView,
    ipc::wire::{
        DOORBELL_FLAG_IRQ_ENABLED,
        DOORBELL_FLAG_PENDING,
        DOORBELL_MAGIC,
        DOORBELL_SIZE,
        PROTOCOL_VERSION,
    },
    runtime::fail::Fail,
};
use ::core::sync::atomic::Ordering;

//======================================================================================================================
// Constants
//======================================================================================================================

// Field offsets inside the 256-byte control block.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_CMD_DOORBELL: usize = 8;
const OFF_CMD_FLAGS: usize = 12;
const OFF_CMD_IRQ_COUNT: usize = 16;
const OFF_RSP_DOORBELL: usize = 20;
const OFF_RSP_FLAGS: usize = 24;
const OFF_RSP_IRQ_COUNT: usize = 28;
const OFF_CMD_WRITES: usize = 32;
const OFF_RSP_WRITES: usize = 36;

//======================================================================================================================
// Structures
//======================================================================================================================

/// The doorbell control block: each side notifies the other that ring entries are available by
/// publishing the new producer index, bumping a write counter, and raising the pending flag when
/// the receiver has interrupts enabled. Doorbell values are advisory; a consumer that observes a
/// non-empty ring must drain it regardless.
#[derive(Clone, Copy)]
pub struct Doorbell {
    view: RegionView,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Doorbell {
    /// Initializes the control block. Call on exactly one side. Response interrupts start out
    /// enabled, because the kernel side sleeps on them.
    pub fn create(view: RegionView) -> Result<Doorbell, Fail> {
        if view.len() < DOORBELL_SIZE {
            return Err(Fail::new(libc::EINVAL, "doorbell region is too small"));
        }
        view.fill_zero(0, DOORBELL_SIZE);
        view.write_u32(OFF_MAGIC, DOORBELL_MAGIC);
        view.write_u32(OFF_VERSION, PROTOCOL_VERSION);
        view.write_u32(OFF_RSP_FLAGS, DOORBELL_FLAG_IRQ_ENABLED);
        Ok(Self { view })
    }

    /// Attaches to a control block initialized by the other side.
    pub fn attach(view: RegionView) -> Result<Doorbell, Fail> {
        if view.len() < DOORBELL_SIZE {
            return Err(Fail::new(libc::EINVAL, "doorbell region is too small"));
        }
        if view.read_u32(OFF_MAGIC) != DOORBELL_MAGIC {
            return Err(Fail::new(libc::EINVAL, "bad doorbell magic"));
        }
        if view.read_u32(OFF_VERSION) != PROTOCOL_VERSION {
            return Err(Fail::new(libc::EINVAL, "unsupported doorbell version"));
        }
        Ok(Self { view })
    }

    fn ring(&self, head: u32, doorbell_off: usize, flags_off: usize, irq_off: usize, writes_off: usize) {
        // The release store orders the ring publish before the doorbell value.
        self.view.atomic_u32(doorbell_off).store(head, Ordering::Release);
        self.view.atomic_u32(writes_off).fetch_add(1, Ordering::Relaxed);

        if self.view.atomic_u32(flags_off).load(Ordering::Relaxed) & DOORBELL_FLAG_IRQ_ENABLED != 0 {
            self.view.atomic_u32(flags_off).fetch_or(DOORBELL_FLAG_PENDING, Ordering::Release);
            self.view.atomic_u32(irq_off).fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Notifies the peer that commands are available up to `head`.
    pub fn ring_command(&self, head: u32) {
        self.ring(head, OFF_CMD_DOORBELL, OFF_CMD_FLAGS, OFF_CMD_IRQ_COUNT, OFF_CMD_WRITES);
    }

    /// Notifies the kernel side that responses are available up to `head`.
    pub fn ring_response(&self, head: u32) {
        self.ring(head, OFF_RSP_DOORBELL, OFF_RSP_FLAGS, OFF_RSP_IRQ_COUNT, OFF_RSP_WRITES);
    }

    fn acknowledge(&self, flags_off: usize) -> bool {
        let old: u32 = self
            .view
            .atomic_u32(flags_off)
            .fetch_and(!DOORBELL_FLAG_PENDING, Ordering::Acquire);
        old & DOORBELL_FLAG_PENDING != 0
    }

    /// Clears the response pending flag. Returns whether it was raised. The caller must re-drain
    /// the response ring after this, or wakeups can be lost.
    pub fn acknowledge_response(&self) -> bool {
        self.acknowledge(OFF_RSP_FLAGS)
    }

    /// Clears the command pending flag, peer side.
    pub fn acknowledge_command(&self) -> bool {
        self.acknowledge(OFF_CMD_FLAGS)
    }

    fn set_irq_enabled(&self, flags_off: usize, enabled: bool) {
        if enabled {
            self.view
                .atomic_u32(flags_off)
                .fetch_or(DOORBELL_FLAG_IRQ_ENABLED, Ordering::Relaxed);
        } else {
            self.view
                .atomic_u32(flags_off)
                .fetch_and(!DOORBELL_FLAG_IRQ_ENABLED, Ordering::Relaxed);
        }
    }

    pub fn set_response_irq_enabled(&self, enabled: bool) {
        self.set_irq_enabled(OFF_RSP_FLAGS, enabled);
    }

    pub fn set_command_irq_enabled(&self, enabled: bool) {
        self.set_irq_enabled(OFF_CMD_FLAGS, enabled);
    }

    pub fn command_doorbell(&self) -> u32 {
        self.view.atomic_u32(OFF_CMD_DOORBELL).load(Ordering::Acquire)
    }

    pub fn response_doorbell(&self) -> u32 {
        self.view.atomic_u32(OFF_RSP_DOORBELL).load(Ordering::Acquire)
    }

    pub fn command_writes(&self) -> u32 {
        self.view.atomic_u32(OFF_CMD_WRITES).load(Ordering::Relaxed)
    }

    pub fn response_writes(&self) -> u32 {
        self.view.atomic_u32(OFF_RSP_WRITES).load(Ordering::Relaxed)
    }

    pub fn command_irq_count(&self) -> u32 {
        self.view.atomic_u32(OFF_CMD_IRQ_COUNT).load(Ordering::Relaxed)
    }

    pub fn response_irq_count(&self) -> u32 {
        self.view.atomic_u32(OFF_RSP_IRQ_COUNT).load(Ordering::Relaxed)
    }

    pub fn response_pending(&self) -> bool {
        self.view.atomic_u32(OFF_RSP_FLAGS).load(Ordering::Acquire) & DOORBELL_FLAG_PENDING != 0
    }

    pub fn command_pending(&self) -> bool {
        self.view.atomic_u32(OFF_CMD_FLAGS).load(Ordering::Acquire) & DOORBELL_FLAG_PENDING != 0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::Doorbell;
    use crate::collections::raw_region::RawRegion;
    use ::anyhow::Result;

    fn do_doorbell() -> Result<(RawRegion, Doorbell)> {
        let region: RawRegion = RawRegion::anonymous(256).unwrap();
        let doorbell: Doorbell = match Doorbell::create(region.view(0, 256).unwrap()) {
            Ok(doorbell) => doorbell,
            Err(_) => anyhow::bail!("creating a doorbell should be possible"),
        };
        Ok((region, doorbell))
    }

    /// Tests counters and the pending flag across ring/acknowledge cycles.
    #[test]
    fn ring_and_acknowledge() -> Result<()> {
        let (_region, doorbell) = do_doorbell()?;

        // Response IRQs are enabled at creation, so ringing raises pending.
        doorbell.ring_response(1);
        crate::ensure_eq!(doorbell.response_doorbell(), 1);
        crate::ensure_eq!(doorbell.response_writes(), 1);
        crate::ensure_eq!(doorbell.response_irq_count(), 1);
        crate::ensure_eq!(doorbell.response_pending(), true);

        crate::ensure_eq!(doorbell.acknowledge_response(), true);
        crate::ensure_eq!(doorbell.response_pending(), false);
        crate::ensure_eq!(doorbell.acknowledge_response(), false);

        // Command IRQs start disabled: writes count, but no pending flag.
        doorbell.ring_command(3);
        crate::ensure_eq!(doorbell.command_doorbell(), 3);
        crate::ensure_eq!(doorbell.command_writes(), 1);
        crate::ensure_eq!(doorbell.command_irq_count(), 0);
        crate::ensure_eq!(doorbell.command_pending(), false);

        doorbell.set_command_irq_enabled(true);
        doorbell.ring_command(4);
        crate::ensure_eq!(doorbell.command_pending(), true);
        crate::ensure_eq!(doorbell.command_irq_count(), 1);
        Ok(())
    }

    /// Tests that attach validates the magic.
    #[test]
    fn bad_attach() -> Result<()> {
        let region: RawRegion = RawRegion::anonymous(256).unwrap();
        match Doorbell::attach(region.view(0, 256).unwrap()) {
            Ok(_) => anyhow::bail!("attaching to an uninitialized doorbell should fail"),
            Err(_) => Ok(()),
        }
    }
}
