//! Component Object Format (COF) definitions.
//!
//! # Purpose
//! COF is the container for MPC component binaries: a 64-bit indexed image
//! holding typed segments, relocations, the component's interface tables
//! (required and provided), attributes, properties and the four lifecycle
//! entry addresses. This crate defines the constants, byte layout and flag
//! sets of the format; parsing lives with the component manager, packing
//! with `cof-builder`.
//!
//! # Layout
//! All fields are little-endian. The file starts with a fixed 136-byte
//! header (identity block, lifecycle block, section directory), followed by
//! the sections the directory points at. Strings are NUL-terminated UTF-8
//! in one string table; every `*_ref` field is a byte offset into it.

#![no_std]

mod flags;

pub use flags::{ProvideKind, RequireKind};

use mpc_platform::MemKind;
use static_assertions::const_assert_eq;

/// File identity: `0x7F 'C' 'O' 'F'`.
pub const MAGIC: [u8; 4] = [0x7F, b'C', b'O', b'F'];

/// Object class tag of the 64-bit indexed layout. Class 1 was the legacy
/// 32-bit indexed layout and is not handled by this loader.
pub const CLASS_COF64: u8 = 2;

/// Machine tag of the MPC DSP family (`"MP"`).
pub const MACHINE_MPC: u16 = 0x4D50;

/// Format version this loader implements.
pub const VERSION_MAJOR: u8 = 2;
pub const VERSION_MINOR: u8 = 1;
pub const VERSION_PATCH: u8 = 0;

/// 2.2 images are layout-identical to 2.1; loaders accept both minors.
pub const COMPAT_MINOR: u8 = 2;

/// Lifecycle address sentinel: the entry does not exist.
pub const ENTRY_NONE: u32 = 0xFFFF_FFFF;

/// Interrupt line sentinel for provides that are not interrupt handlers.
pub const IRQ_NONE: u32 = 0xFFFF_FFFF;

/// Version acceptance matrix.
///
/// The major must match exactly. Within major 2 the loader accepts its own
/// minor and the documented compatible successor; the patch level never
/// participates.
pub fn version_compatible(major: u8, minor: u8) -> bool {
    major == VERSION_MAJOR && (minor == VERSION_MINOR || minor == COMPAT_MINOR)
}

/// Component class, from the header's `comp_class` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompClass {
    /// Ordinary component: constructed per instance.
    Component = 0,
    /// Resident firmware: runs from fixed addresses, has no construct
    /// phase and is born runnable.
    Firmware = 1,
    /// One shared instance multiplexed across clients.
    Singleton = 2,
}

impl CompClass {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(CompClass::Component),
            1 => Some(CompClass::Firmware),
            2 => Some(CompClass::Singleton),
            _ => None,
        }
    }
}

/// What a segment holds, which decides its sharing across instances.
///
/// Code and constants load once per template; data is copied fresh for
/// every instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentPurpose {
    Code = 0,
    Const = 1,
    Data = 2,
}

impl SegmentPurpose {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(SegmentPurpose::Code),
            1 => Some(SegmentPurpose::Const),
            2 => Some(SegmentPurpose::Data),
            _ => None,
        }
    }

    /// Shared segments live in the template's regions.
    pub fn is_shared(self) -> bool {
        matches!(self, SegmentPurpose::Code | SegmentPurpose::Const)
    }

    /// Private segments are materialized per instance.
    pub fn is_private(self) -> bool {
        !self.is_shared()
    }
}

/// Wire code of a memory bank, from a segment entry's `mem` field.
pub fn mem_kind_from_u16(raw: u16) -> Option<MemKind> {
    match raw {
        0 => Some(MemKind::SdramCode),
        1 => Some(MemKind::SdramData),
        2 => Some(MemKind::EsramCode),
        3 => Some(MemKind::EsramData),
        _ => None,
    }
}

pub fn mem_kind_to_u16(kind: MemKind) -> u16 {
    match kind {
        MemKind::SdramCode => 0,
        MemKind::SdramData => 1,
        MemKind::EsramCode => 2,
        MemKind::EsramData => 3,
    }
}

/// Code goes to instruction banks, constants and data to data banks.
pub fn purpose_matches_kind(purpose: SegmentPurpose, kind: MemKind) -> bool {
    match purpose {
        SegmentPurpose::Code => kind.is_code(),
        SegmentPurpose::Const | SegmentPurpose::Data => kind.is_data(),
    }
}

/// Fixed header length.
pub const HEADER_LEN: usize = 136;

/// Segment table entry: name_ref, purpose, mem, vaddr, size, align,
/// reserved, file_off, file_len.
pub const SEGMENT_ENTRY_LEN: usize = 40;

/// Relocation entry: seg, target_seg, offset, addend.
pub const RELOC_ENTRY_LEN: usize = 12;

/// Attribute entry: name_ref, addr.
pub const ATTRIBUTE_ENTRY_LEN: usize = 8;

/// Property entry: name_ref, value_ref.
pub const PROPERTY_ENTRY_LEN: usize = 8;

// identity block + machine/comp_class + min_stack + name_ref
// + lifecycle block + file_size + section directory (8 offsets, 8 counts)
const_assert_eq!(
    HEADER_LEN,
    (4 + 1 + 3) + 2 + 2 + 4 + 4 + 4 * 4 + 4 + 8 * 8 + 8 * 4
);
const_assert_eq!(SEGMENT_ENTRY_LEN, 4 + 2 + 2 + 4 + 4 + 4 + 4 + 8 + 8);
const_assert_eq!(RELOC_ENTRY_LEN, 2 + 2 + 4 + 4);
const_assert_eq!(ATTRIBUTE_ENTRY_LEN, 4 + 4);
const_assert_eq!(PROPERTY_ENTRY_LEN, 4 + 4);
