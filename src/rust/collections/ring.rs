// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::raw_region::RegionView,
    runtime::fail::Fail,
};
use ::core::{
    marker::PhantomData,
    sync::atomic::Ordering,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Size of one ring entry, in bytes.
pub const RING_ENTRY_SIZE: usize = 16;

/// Size of the ring header preamble, in bytes. The live fields occupy the first sixteen bytes;
/// the rest is reserved padding so the entry array starts on its own cache line.
pub const RING_HEADER_SIZE: usize = 64;

/// Byte offsets of the header fields.
const OFF_MAGIC: usize = 0;
const OFF_HEAD: usize = 4;
const OFF_TAIL: usize = 8;
const OFF_SIZE: usize = 12;

//======================================================================================================================
// Traits
//======================================================================================================================

/// A fixed-size record that can be carried in a packet ring. Encoding is little-endian and
/// byte-exact, because the other end of the ring may live in a different address space.
pub trait RingEntry: Copy {
    /// Serializes the record into a ring slot.
    fn encode(&self, buf: &mut [u8; RING_ENTRY_SIZE]);

    /// Deserializes a record from a ring slot.
    fn decode(buf: &[u8; RING_ENTRY_SIZE]) -> Self;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// A lock-free, single-producer/single-consumer circular buffer of 16-byte records over a shared
/// byte region. The producer owns `head`, the consumer owns `tail`; the ring is empty when they
/// are equal and full when advancing `head` would collide with `tail`, sacrificing one slot.
pub struct PacketRing<T: RingEntry> {
    /// Window covering the ring header and the entry array.
    view: RegionView,
    /// Number of slots. Power of two.
    size: u32,
    /// Pre-computed index mask.
    mask: u32,
    _marker: PhantomData<T>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T: RingEntry> PacketRing<T> {
    /// Creates a ring over `view`, initializing the header. Call this on exactly one side.
    pub fn create(view: RegionView, magic: u32, size: u32) -> Result<PacketRing<T>, Fail> {
        if size == 0 || !size.is_power_of_two() {
            return Err(Fail::new(
                libc::EINVAL,
                "cannot create a packet ring that does not have a power of two capacity",
            ));
        }
        if view.len() < RING_HEADER_SIZE + (size as usize) * RING_ENTRY_SIZE {
            return Err(Fail::new(libc::EINVAL, "memory region is too small to fit in a packet ring"));
        }

        view.write_u32(OFF_MAGIC, magic);
        view.write_u32(OFF_HEAD, 0);
        view.write_u32(OFF_TAIL, 0);
        view.write_u32(OFF_SIZE, size);
        view.fill_zero(16, RING_HEADER_SIZE - 16);

        Ok(PacketRing {
            view,
            size,
            mask: size - 1,
            _marker: PhantomData,
        })
    }

    /// Attaches to a ring that the other side has already initialized.
    pub fn attach(view: RegionView, magic: u32) -> Result<PacketRing<T>, Fail> {
        if view.read_u32(OFF_MAGIC) != magic {
            let cause: String = format!("bad ring magic (expected={:#x})", magic);
            error!("attach(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let size: u32 = view.read_u32(OFF_SIZE);
        if size == 0 || !size.is_power_of_two() {
            return Err(Fail::new(libc::EINVAL, "attached ring has a bad size"));
        }
        if view.len() < RING_HEADER_SIZE + (size as usize) * RING_ENTRY_SIZE {
            return Err(Fail::new(libc::EINVAL, "attached ring does not fit its region"));
        }

        Ok(PacketRing {
            view,
            size,
            mask: size - 1,
            _marker: PhantomData,
        })
    }

    fn slot_offset(&self, index: u32) -> usize {
        RING_HEADER_SIZE + (index as usize) * RING_ENTRY_SIZE
    }

    /// Reads the producer index.
    pub fn head(&self) -> u32 {
        self.view.atomic_u32(OFF_HEAD).load(Ordering::Acquire)
    }

    /// Reads the consumer index.
    pub fn tail(&self) -> u32 {
        self.view.atomic_u32(OFF_TAIL).load(Ordering::Acquire)
    }

    /// Returns the effective capacity of the target ring.
    pub fn capacity(&self) -> u32 {
        self.size - 1
    }

    /// Peeks the target ring and checks if it is empty.
    pub fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }

    /// Peeks the target ring and checks if it is full.
    pub fn is_full(&self) -> bool {
        (self.head() + 1) & self.mask == self.tail()
    }

    /// Number of entries currently outstanding.
    pub fn len(&self) -> u32 {
        (self.head().wrapping_sub(self.tail())) & self.mask
    }

    /// Attempts to insert a record at the back of the target ring. On success, returns the new
    /// producer index, which is the value to publish through the doorbell.
    ///
    /// Only the producing side may call this.
    pub fn try_enqueue(&self, entry: &T) -> Result<u32, Fail> {
        let head: u32 = self.view.atomic_u32(OFF_HEAD).load(Ordering::Relaxed);
        let tail: u32 = self.view.atomic_u32(OFF_TAIL).load(Ordering::Acquire);
        let next: u32 = (head + 1) & self.mask;

        if next == tail {
            return Err(Fail::new(libc::EBUSY, "packet ring is full"));
        }

        let mut buf: [u8; RING_ENTRY_SIZE] = [0; RING_ENTRY_SIZE];
        entry.encode(&mut buf);
        self.view.copy_from_slice(self.slot_offset(head), &buf);

        // Publish. The release store orders the slot bytes before the new head.
        self.view.atomic_u32(OFF_HEAD).store(next, Ordering::Release);

        Ok(next)
    }

    /// Attempts to remove the record at the front of the target ring.
    ///
    /// Only the consuming side may call this.
    pub fn try_dequeue(&self) -> Option<T> {
        let head: u32 = self.view.atomic_u32(OFF_HEAD).load(Ordering::Acquire);
        let tail: u32 = self.view.atomic_u32(OFF_TAIL).load(Ordering::Relaxed);

        if head == tail {
            return None;
        }

        let mut buf: [u8; RING_ENTRY_SIZE] = [0; RING_ENTRY_SIZE];
        self.view.copy_to_slice(self.slot_offset(tail), &mut buf);
        let entry: T = T::decode(&buf);

        // The release store orders the slot read before handing the slot back to the producer.
        self.view.atomic_u32(OFF_TAIL).store((tail + 1) & self.mask, Ordering::Release);

        Some(entry)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        PacketRing,
        RingEntry,
        RING_ENTRY_SIZE,
        RING_HEADER_SIZE,
    };
    use crate::collections::raw_region::RawRegion;
    use ::anyhow::Result;
    use ::byteorder::{
        ByteOrder,
        LittleEndian,
    };
    use ::std::thread;

    const RING_SIZE: u32 = 64;
    const TEST_MAGIC: u32 = 0x5452_494E;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct TestRecord {
        seq: u64,
        tag: u32,
    }

    impl RingEntry for TestRecord {
        fn encode(&self, buf: &mut [u8; RING_ENTRY_SIZE]) {
            LittleEndian::write_u64(&mut buf[0..8], self.seq);
            LittleEndian::write_u32(&mut buf[8..12], self.tag);
        }

        fn decode(buf: &[u8; RING_ENTRY_SIZE]) -> Self {
            Self {
                seq: LittleEndian::read_u64(&buf[0..8]),
                tag: LittleEndian::read_u32(&buf[8..12]),
            }
        }
    }

    fn do_region() -> Result<RawRegion> {
        let len: usize = RING_HEADER_SIZE + (RING_SIZE as usize) * RING_ENTRY_SIZE;
        match RawRegion::anonymous(len) {
            Ok(region) => Ok(region),
            Err(_) => anyhow::bail!("creating a backing region should be possible"),
        }
    }

    /// Tests if we fail to create a ring with a capacity that is not a power of two.
    #[test]
    fn bad_create() -> Result<()> {
        let region: RawRegion = do_region()?;
        let view = region.view(0, region.len()).unwrap();
        match PacketRing::<TestRecord>::create(view, TEST_MAGIC, RING_SIZE - 1) {
            Ok(_) => anyhow::bail!("creating a ring with an invalid capacity should fail"),
            Err(_) => Ok(()),
        }
    }

    /// Tests if attaching validates the magic word.
    #[test]
    fn bad_attach() -> Result<()> {
        let region: RawRegion = do_region()?;
        let view = region.view(0, region.len()).unwrap();
        let _ring: PacketRing<TestRecord> = PacketRing::create(view, TEST_MAGIC, RING_SIZE).unwrap();
        match PacketRing::<TestRecord>::attach(view, !TEST_MAGIC) {
            Ok(_) => anyhow::bail!("attaching with a mismatched magic should fail"),
            Err(_) => Ok(()),
        }
    }

    /// Tests if we succeed to sequentially enqueue and dequeue records.
    #[test]
    fn enqueue_dequeue_sequential() -> Result<()> {
        let region: RawRegion = do_region()?;
        let view = region.view(0, region.len()).unwrap();
        let ring: PacketRing<TestRecord> = PacketRing::create(view, TEST_MAGIC, RING_SIZE).unwrap();

        crate::ensure_eq!(ring.is_empty(), true);
        crate::ensure_eq!(ring.is_full(), false);

        // Fill up to the effective capacity: one slot is sacrificed.
        for i in 0..ring.capacity() {
            let record: TestRecord = TestRecord {
                seq: i as u64,
                tag: i ^ 0xFF,
            };
            if ring.try_enqueue(&record).is_err() {
                anyhow::bail!("enqueue should succeed below capacity");
            }
        }
        crate::ensure_eq!(ring.is_full(), true);
        crate::ensure_eq!(ring.len(), ring.capacity());

        // One more must be refused.
        let overflow: TestRecord = TestRecord { seq: 0, tag: 0 };
        if ring.try_enqueue(&overflow).is_ok() {
            anyhow::bail!("enqueue on a full ring should fail");
        }

        for i in 0..ring.capacity() {
            let record: TestRecord = match ring.try_dequeue() {
                Some(record) => record,
                None => anyhow::bail!("dequeue should succeed on a non-empty ring"),
            };
            crate::ensure_eq!(record.seq, i as u64);
            crate::ensure_eq!(record.tag, i ^ 0xFF);
        }
        crate::ensure_eq!(ring.is_empty(), true);
        crate::ensure_eq!(ring.try_dequeue().is_none(), true);
        Ok(())
    }

    /// Tests if the consumed sequence equals the produced sequence under concurrent access.
    #[test]
    fn enqueue_dequeue_concurrent() -> Result<()> {
        const NUM_RECORDS: u64 = 4096;

        let region: RawRegion = do_region()?;
        let producer: PacketRing<TestRecord> =
            PacketRing::create(region.view(0, region.len()).unwrap(), TEST_MAGIC, RING_SIZE).unwrap();
        let consumer: PacketRing<TestRecord> =
            PacketRing::attach(region.view(0, region.len()).unwrap(), TEST_MAGIC).unwrap();

        thread::scope(|s| {
            let writer: thread::ScopedJoinHandle<()> = s.spawn(move || {
                for i in 0..NUM_RECORDS {
                    let record: TestRecord = TestRecord {
                        seq: i,
                        tag: (i & 0xFFFF) as u32,
                    };
                    while producer.try_enqueue(&record).is_err() {}
                }
            });
            let reader: thread::ScopedJoinHandle<()> = s.spawn(move || {
                for i in 0..NUM_RECORDS {
                    let record: TestRecord = loop {
                        if let Some(record) = consumer.try_dequeue() {
                            break record;
                        }
                    };
                    assert!(record.seq == i, "records must come out in FIFO order");
                }
            });

            writer.join().unwrap();
            reader.join().unwrap();
        });

        Ok(())
    }
}
