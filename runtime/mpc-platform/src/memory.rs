//! Coprocessor memory: typed banks, dual-addressed chunks, allocator seam.

use crate::{CoreId, DomainId, Result};

/// Memory bank classes of the coprocessor address map.
///
/// Code and data live in different banks with different wait states; the
/// allocator treats each class as its own pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemKind {
    /// External SDRAM, instruction side.
    SdramCode,
    /// External SDRAM, data side.
    SdramData,
    /// On-chip embedded SRAM, instruction side.
    EsramCode,
    /// On-chip embedded SRAM, data side.
    EsramData,
}

impl MemKind {
    pub fn is_code(self) -> bool {
        matches!(self, MemKind::SdramCode | MemKind::EsramCode)
    }

    pub fn is_data(self) -> bool {
        !self.is_code()
    }
}

/// Allocator-scoped identity of one allocation, passed back on free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub u64);

/// One allocated region of coprocessor memory, visible from both sides.
///
/// The host reaches the region through a mapped pointer, the DSP through a
/// 32-bit bus address. Keeping both in one object is what lets the loader
/// patch images host-side while emitting addresses the DSP will execute
/// with. Word accessors are little-endian, matching the DSP bus.
#[derive(Debug)]
pub struct MemoryChunk {
    id: ChunkId,
    host: *mut u8,
    dsp: u32,
    len: usize,
    kind: MemKind,
}

impl MemoryChunk {
    /// Wrap a region handed out by an allocator.
    ///
    /// # Safety
    /// `host` must be valid for reads and writes of `len` bytes for the
    /// whole lifetime of the chunk, and must not be aliased while the chunk
    /// exists. `dsp` must be the bus address the coprocessor sees for the
    /// same bytes.
    pub unsafe fn from_raw(id: ChunkId, host: *mut u8, dsp: u32, len: usize, kind: MemKind) -> Self {
        Self {
            id,
            host,
            dsp,
            len,
            kind,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Bus address of the first byte as seen by the DSP.
    pub fn dsp_addr(&self) -> u32 {
        self.dsp
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kind(&self) -> MemKind {
        self.kind
    }

    fn bytes(&self) -> &[u8] {
        // from_raw guarantees host..host+len stays valid and unaliased
        unsafe { core::slice::from_raw_parts(self.host, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.host, self.len) }
    }

    /// Read one little-endian word at a byte offset.
    pub fn read_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset % 4 == 0);
        let b = &self.bytes()[offset..offset + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Write one little-endian word at a byte offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        debug_assert!(offset % 4 == 0);
        self.bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Copy a byte run into the chunk at `offset`.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Fill `len` bytes starting at `offset`.
    pub fn fill(&mut self, offset: usize, len: usize, value: u8) {
        self.bytes_mut()[offset..offset + len].fill(value);
    }
}

/// Coprocessor memory allocator seam.
///
/// Implementations hand out [`MemoryChunk`]s from the banks of the SoC and
/// know the static domain-to-core placement. Methods take `&self`; an
/// implementation over a mailbox or a pool uses interior mutability, and
/// the runtime above is caller-serialized anyway.
pub trait DspAllocator {
    /// Allocate `size` bytes from `kind`, aligned to `align` (a power of
    /// two), for the domain's core. `zero` requests cleared memory.
    fn alloc(
        &self,
        domain: DomainId,
        kind: MemKind,
        size: usize,
        align: u32,
        zero: bool,
    ) -> Result<MemoryChunk>;

    /// Return a chunk to its pool.
    fn free(&self, chunk: MemoryChunk);

    /// The core a domain is placed on.
    fn domain_core(&self, domain: DomainId) -> CoreId;
}

/// Round `value` up to the next multiple of `align` (a power of two).
///
/// `None` when the rounded value does not fit in a `u32`.
pub fn checked_align_up(value: u32, align: u32) -> Option<u32> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    Some(value.checked_add(mask)? & !mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_align_up() {
        assert_eq!(checked_align_up(0, 8), Some(0));
        assert_eq!(checked_align_up(1, 8), Some(8));
        assert_eq!(checked_align_up(8, 8), Some(8));
        assert_eq!(checked_align_up(13, 4), Some(16));
        assert_eq!(checked_align_up(1, 0x8000_0000), Some(0x8000_0000));
        assert_eq!(checked_align_up(0x8000_0001, 0x8000_0000), None);
    }

    #[test]
    fn test_mem_kind_sides() {
        assert!(MemKind::SdramCode.is_code());
        assert!(MemKind::EsramCode.is_code());
        assert!(MemKind::SdramData.is_data());
        assert!(MemKind::EsramData.is_data());
    }

    #[test]
    fn test_chunk_word_access() {
        let mut backing = vec![0u8; 64];
        let mut chunk = unsafe {
            MemoryChunk::from_raw(
                ChunkId(1),
                backing.as_mut_ptr(),
                0x4000_0000,
                backing.len(),
                MemKind::SdramData,
            )
        };
        chunk.write_u32(8, 0xDEAD_BEEF);
        assert_eq!(chunk.read_u32(8), 0xDEAD_BEEF);

        chunk.write_bytes(0, &[1, 2, 3, 4]);
        assert_eq!(chunk.read_u32(0), 0x0403_0201);
        chunk.fill(0, 4, 0);
        assert_eq!(chunk.read_u32(0), 0);
        assert_eq!(chunk.dsp_addr(), 0x4000_0000);
        assert_eq!(chunk.len(), 64);

        drop(chunk);
        assert_eq!(backing[8], 0xEF);
        assert_eq!(backing[11], 0xDE);
    }
}
