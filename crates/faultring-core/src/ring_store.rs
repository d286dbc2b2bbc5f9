//! Fixed-capacity circular store of error records.
//!
//! The store lives in a flat byte segment: a 64-byte header followed by
//! `capacity` slots of [`SLOT_SIZE`] bytes. It does no synchronization of its
//! own; callers reach it through the guards in [`crate::guard`]. The same code
//! runs over a heap buffer (`Vec<u8>`) and over a segment of the shared region.
//!
//! Writes go to `write_cursor` and advance it modulo the capacity, so eviction
//! is strictly by insertion order.

use std::io;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::{EncodedSlot, Record, SLOT_PREFIX_LEN, SLOT_SIZE, SlotPrefix};
use crate::region::align_up;

/// Header size at the start of the store segment.
pub const HEADER_SIZE: usize = 64;

/// Magic bytes identifying a ring header.
pub const RING_MAGIC: [u8; 8] = *b"FRING\0\0\x01";

/// Layout version written into the header.
pub const LAYOUT_VERSION: u32 = 1;

/// Default number of slots.
pub const DEFAULT_CAPACITY: usize = 100;

/// Largest supported number of slots.
pub const MAX_CAPACITY: usize = u16::MAX as usize;

static ZERO_SLOT: [u8; SLOT_SIZE] = [0; SLOT_SIZE];

// =============================================================================
// RingMemory
// =============================================================================

/// Byte-addressable backing for a [`RingStore`].
pub trait RingMemory {
    /// Size of the backing in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`. Reads past the end are an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` at `offset`. Writes past the end are an error.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
}

impl RingMemory for Vec<u8> {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = checked_range(offset, buf.len(), self.len())?;
        buf.copy_from_slice(&self[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let range = checked_range(offset, data.len(), self.len())?;
        self[range].copy_from_slice(data);
        Ok(())
    }
}

pub(crate) fn checked_range(
    offset: u64,
    len: usize,
    size: usize,
) -> io::Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset).map_err(|_| out_of_bounds(offset, len))?;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= size)
        .ok_or_else(|| out_of_bounds(offset, len))?;
    Ok(start..end)
}

pub(crate) fn out_of_bounds(offset: u64, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("access of {len} bytes at offset {offset} is out of bounds"),
    )
}

// =============================================================================
// RingHeader
// =============================================================================

/// Decoded store header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHeader {
    pub capacity: usize,
    pub slot_size: usize,
    pub write_cursor: usize,
    pub total_written: u64,
    pub creator_origin: i32,
    pub created_at: i64,
}

impl RingHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&RING_MAGIC);
        buf[8..12].copy_from_slice(&LAYOUT_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.capacity as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&(self.slot_size as u32).to_le_bytes());
        buf[20..24].copy_from_slice(&(self.write_cursor as u32).to_le_bytes());
        buf[24..32].copy_from_slice(&self.total_written.to_le_bytes());
        buf[32..36].copy_from_slice(&self.creator_origin.to_le_bytes());
        buf[36..44].copy_from_slice(&self.created_at.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..8] != RING_MAGIC {
            return Err(Error::Corrupt("missing ring header magic".to_string()));
        }
        let version = u32_at(buf, 8);
        if version != LAYOUT_VERSION {
            return Err(Error::LayoutMismatch {
                expected: format!("layout version {LAYOUT_VERSION}"),
                found: format!("layout version {version}"),
            });
        }
        let mut total = [0u8; 8];
        total.copy_from_slice(&buf[24..32]);
        let mut created = [0u8; 8];
        created.copy_from_slice(&buf[36..44]);
        Ok(Self {
            capacity: u32_at(buf, 12) as usize,
            slot_size: u32_at(buf, 16) as usize,
            write_cursor: u32_at(buf, 20) as usize,
            total_written: u64::from_le_bytes(total),
            creator_origin: i32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]),
            created_at: i64::from_le_bytes(created),
        })
    }
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

// =============================================================================
// RingStore
// =============================================================================

/// Result of a single append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    /// Slot index the record was written to.
    pub slot: usize,
    /// Value of `total_written` after the append.
    pub total_written: u64,
    /// Timestamp stamped into the record.
    pub captured_at: i64,
}

/// A fixed-capacity ring of record slots over some [`RingMemory`].
pub struct RingStore<M> {
    mem: M,
    capacity: usize,
}

impl<M: RingMemory> RingStore<M> {
    /// Bytes needed for a store of `capacity` slots, rounded up to the region
    /// alignment.
    #[must_use]
    pub fn required_size(capacity: usize) -> u64 {
        align_up((HEADER_SIZE + capacity * SLOT_SIZE) as u64)
    }

    /// Initialize a fresh store: zero every slot and write a header with
    /// `write_cursor = 0` and `total_written = 0`.
    pub fn format(
        mut mem: M,
        capacity: usize,
        creator_origin: i32,
        created_at: i64,
    ) -> Result<Self> {
        check_capacity(capacity)?;
        let needed = Self::required_size(capacity);
        if mem.size() < needed {
            return Err(Error::LayoutMismatch {
                expected: format!("at least {needed} bytes"),
                found: format!("{} bytes", mem.size()),
            });
        }
        for index in 0..capacity {
            mem.write_at(slot_offset(index), &ZERO_SLOT)?;
        }
        let header = RingHeader {
            capacity,
            slot_size: SLOT_SIZE,
            write_cursor: 0,
            total_written: 0,
            creator_origin,
            created_at,
        };
        mem.write_at(0, &header.encode())?;
        Ok(Self { mem, capacity })
    }

    /// Open an existing store, checking it matches `capacity`.
    pub fn open(mem: M, capacity: usize) -> Result<Self> {
        let store = Self { mem, capacity };
        let header = store.header()?;
        if header.capacity != capacity || header.slot_size != SLOT_SIZE {
            return Err(Error::LayoutMismatch {
                expected: format!("capacity {capacity}, slot size {SLOT_SIZE}"),
                found: format!(
                    "capacity {}, slot size {}",
                    header.capacity, header.slot_size
                ),
            });
        }
        Ok(store)
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read and validate the header.
    pub fn header(&self) -> Result<RingHeader> {
        let mut buf = [0u8; HEADER_SIZE];
        self.mem.read_at(0, &mut buf)?;
        let header = RingHeader::decode(&buf)?;
        if header.capacity > 0 && header.write_cursor >= header.capacity {
            return Err(Error::Corrupt(format!(
                "write cursor {} outside capacity {}",
                header.write_cursor, header.capacity
            )));
        }
        Ok(header)
    }

    /// Write `slot` at the cursor, stamping it with `captured_at`, and advance
    /// the cursor. The previous occupant of that slot is overwritten.
    pub fn append(&mut self, slot: &mut EncodedSlot, captured_at: i64) -> Result<AppendReceipt> {
        let mut header = self.header()?;
        let index = header.write_cursor;
        header.write_cursor = (index + 1) % self.capacity;
        header.total_written = header.total_written.wrapping_add(1);

        slot.set_captured_at(captured_at);
        self.mem.write_at(slot_offset(index), slot.as_bytes())?;
        self.mem.write_at(0, &header.encode())?;

        Ok(AppendReceipt {
            slot: index,
            total_written: header.total_written,
            captured_at: captured_at.max(1),
        })
    }

    /// Reset the cursor and counter and zero every slot.
    pub fn clear(&mut self) -> Result<()> {
        let mut header = self.header()?;
        for index in 0..self.capacity {
            self.mem.write_at(slot_offset(index), &ZERO_SLOT)?;
        }
        header.write_cursor = 0;
        header.total_written = 0;
        self.mem.write_at(0, &header.encode())?;
        Ok(())
    }

    /// Read the fixed prefix of one slot.
    pub fn slot_prefix(&self, index: usize) -> Result<SlotPrefix> {
        let mut buf = [0u8; SLOT_PREFIX_LEN];
        self.mem.read_at(slot_offset(index), &mut buf)?;
        Ok(SlotPrefix::decode(&buf))
    }

    /// Copy one whole slot into `buf` (which must be [`SLOT_SIZE`] long).
    pub fn read_slot_into(&self, index: usize, buf: &mut [u8]) -> Result<()> {
        self.mem
            .read_at(slot_offset(index), &mut buf[..SLOT_SIZE])
            .map_err(Error::from)
    }

    /// Decode one slot, or `None` if it is empty.
    pub fn record(&self, index: usize) -> Result<Option<Record>> {
        let mut buf = vec![0u8; SLOT_SIZE];
        self.read_slot_into(index, &mut buf)?;
        let record = Record::decode(&buf);
        Ok(record.is_live().then_some(record))
    }

    /// Index of the live slot from `origin_id` with the greatest timestamp.
    ///
    /// Ties go to the last matching slot in scan order. That choice is an
    /// implementation detail and callers must not depend on it.
    pub fn latest_slot_for(&self, origin_id: i32) -> Result<Option<usize>> {
        let mut best: Option<(usize, i64)> = None;
        for index in 0..self.capacity {
            let prefix = self.slot_prefix(index)?;
            if !prefix.is_live() || prefix.origin_id != origin_id {
                continue;
            }
            match best {
                Some((_, ts)) if prefix.captured_at < ts => {}
                _ => best = Some((index, prefix.captured_at)),
            }
        }
        Ok(best.map(|(index, _)| index))
    }

    /// Copy every slot, in index order, into `buf` with a single read.
    /// `buf` must be exactly `capacity * SLOT_SIZE` bytes.
    pub fn copy_slots_into(&self, buf: &mut [u8]) -> Result<()> {
        let expected = self.capacity * SLOT_SIZE;
        if buf.len() != expected {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("snapshot buffer is {} bytes, need {expected}", buf.len()),
            )));
        }
        self.mem.read_at(HEADER_SIZE as u64, buf)?;
        Ok(())
    }

    /// Live slot count and header counters.
    pub fn stats(&self) -> Result<RingStats> {
        let header = self.header()?;
        let mut live = 0usize;
        for index in 0..self.capacity {
            if self.slot_prefix(index)?.is_live() {
                live += 1;
            }
        }
        Ok(RingStats {
            capacity: self.capacity,
            live,
            write_cursor: header.write_cursor,
            total_written: header.total_written,
            total_evicted: header.total_written.saturating_sub(self.capacity as u64),
            fill_ratio: live as f64 / self.capacity as f64,
            creator_origin: header.creator_origin,
            created_at: header.created_at,
        })
    }

    /// Give back the backing memory.
    pub fn into_inner(self) -> M {
        self.mem
    }
}

impl<M> std::fmt::Debug for RingStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingStore")
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn slot_offset(index: usize) -> u64 {
    (HEADER_SIZE + index * SLOT_SIZE) as u64
}

fn check_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 || capacity > MAX_CAPACITY {
        return Err(Error::Plan(format!(
            "capacity must be between 1 and {MAX_CAPACITY}, got {capacity}"
        )));
    }
    Ok(())
}

// =============================================================================
// RingStats (serializable)
// =============================================================================

/// Serializable statistics about the ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingStats {
    /// Number of slots.
    pub capacity: usize,
    /// Slots currently holding a record.
    pub live: usize,
    /// Next slot to be overwritten.
    pub write_cursor: usize,
    /// Appends since creation or the last clear (wrapping).
    pub total_written: u64,
    /// Appends that overwrote an older record.
    pub total_evicted: u64,
    /// Fill ratio (live / capacity).
    pub fill_ratio: f64,
    /// Origin that created the region.
    pub creator_origin: i32,
    /// Creation time, microseconds since the Unix epoch.
    pub created_at: i64,
}
