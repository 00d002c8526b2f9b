//! COF image parser.
//!
//! # Purpose
//! Turns raw image bytes into a validated [`ComponentDescriptor`]. The
//! parser is strict: every reference is bounds-checked, every address is
//! resolved against the segment table, and the first violation aborts the
//! parse. Interface types are interned into the [`InterfaceRegistry`]
//! while parsing; a failed parse releases everything it interned, so a
//! rejected image leaves the registry exactly as it found it.
//!
//! # Layout
//! See the `cof` crate for the byte layout. Sections are located through
//! the header directory, so their order inside the file does not matter.

use alloc::string::String;
use alloc::vec::Vec;

use cof::{
    version_compatible, CompClass, ProvideKind, RequireKind, CLASS_COF64, ENTRY_NONE,
    HEADER_LEN, IRQ_NONE, MACHINE_MPC, MAGIC, RELOC_ENTRY_LEN, SEGMENT_ENTRY_LEN,
};
use thiserror::Error;

use crate::descriptor::{
    AttributeRecord, CodeAddr, ComponentDescriptor, Lifecycle, MemoryRef, PropertyRecord,
    ProvidedInterface, RelocRecord, RequiredInterface, SegmentRecord,
};
use crate::registry::{InterfaceRef, InterfaceRegistry};

/// Why an image was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("image truncated at byte {offset}")]
    UnexpectedEnd { offset: usize },

    #[error("not a COF image")]
    BadMagic,

    #[error("unsupported object class {class}")]
    BadClass { class: u8 },

    #[error("wrong machine tag {machine:#06x}")]
    BadMachine { machine: u16 },

    #[error("incompatible format version {major}.{minor}")]
    IncompatibleVersion { major: u8, minor: u8 },

    #[error("declared file size {declared} does not match image length {actual}")]
    SizeMismatch { declared: u32, actual: usize },

    #[error("unknown component class {raw}")]
    BadComponentClass { raw: u16 },

    #[error("component name is empty")]
    EmptyName,

    #[error("string reference {offset} outside the string table")]
    StringOutOfRange { offset: u32 },

    #[error("string at {offset} is not terminated")]
    StringNotTerminated { offset: u32 },

    #[error("string at {offset} is not UTF-8")]
    StringNotUtf8 { offset: u32 },

    #[error("segment {index}: unknown purpose {raw}")]
    BadPurpose { index: usize, raw: u16 },

    #[error("segment {index}: unknown memory bank {raw}")]
    BadMemKind { index: usize, raw: u16 },

    #[error("segment {index}: purpose does not fit its memory bank")]
    PurposeKindMismatch { index: usize },

    #[error("segment {index}: bad alignment {align}")]
    BadAlignment { index: usize, align: u32 },

    #[error("segment {index}: address range wraps")]
    SegmentWraps { index: usize },

    #[error("segment {index}: payload outside the image")]
    PayloadOutOfRange { index: usize },

    #[error("segment {index}: payload longer than the segment")]
    PayloadExceedsSize { index: usize },

    #[error("segments {first} and {second} overlap")]
    SegmentsOverlap { first: usize, second: usize },

    #[error("segment {index}: packed region exceeds the address space")]
    RegionOverflow { index: usize },

    #[error("relocation {index}: bad segment index")]
    RelocBadSegment { index: usize },

    #[error("relocation {index}: site not word aligned")]
    RelocUnaligned { index: usize },

    #[error("relocation {index}: site outside its segment")]
    RelocOutOfRange { index: usize },

    #[error("relocation {index}: shared site cannot target private memory")]
    RelocSharedToPrivate { index: usize },

    #[error("code address {addr:#010x} outside every segment")]
    EntryOutsideSegments { addr: u32 },

    #[error("code address {addr:#010x} not in a code segment")]
    EntryNotInCode { addr: u32 },

    #[error("firmware images cannot declare a construct entry")]
    FirmwareWithConstruct,

    #[error("attribute address {addr:#010x} unusable")]
    AttrOutOfRange { addr: u32 },

    #[error("attribute address {addr:#010x} not word aligned")]
    AttrUnaligned { addr: u32 },

    #[error("interface index {index} outside the interface table")]
    BadInterfaceIndex { index: u32 },

    #[error("unknown require flags {raw:#x}")]
    BadRequireFlags { raw: u32 },

    #[error("unknown provide flags {raw:#x}")]
    BadProvideFlags { raw: u32 },

    #[error("interface {interface:?} declares an empty collection")]
    ZeroCollection { interface: String },

    #[error("patch site {addr:#010x} unusable")]
    SiteOutOfRange { addr: u32 },

    #[error("patch site {addr:#010x} not in a private segment")]
    SiteNotPrivate { addr: u32 },

    #[error("patch site {addr:#010x} not word aligned")]
    SiteUnaligned { addr: u32 },

    #[error("interrupt provide {interface:?} names no interrupt line")]
    MissingIrqLine { interface: String },

    #[error("interrupt provide {interface:?} has no handler method")]
    InterruptWithoutHandler { interface: String },
}

type PResult<T> = core::result::Result<T, ParseError>;

/// Little-endian cursor over the image.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn seek(&mut self, pos: u64) -> PResult<()> {
        let pos = usize::try_from(pos).map_err(|_| ParseError::UnexpectedEnd {
            offset: self.data.len(),
        })?;
        if pos > self.data.len() {
            return Err(ParseError::UnexpectedEnd {
                offset: self.data.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn take(&mut self, n: usize) -> PResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(ParseError::UnexpectedEnd {
                offset: self.data.len(),
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> PResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> PResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> PResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> PResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

struct Header {
    comp_class: CompClass,
    version: (u8, u8, u8),
    min_stack: u32,
    name_ref: u32,
    construct: u32,
    start: u32,
    stop: u32,
    destroy: u32,
    strtab_off: u64,
    strtab_len: u32,
    seg_count: u32,
    seg_off: u64,
    itf_off: u64,
    itf_count: u32,
    reloc_count: u32,
    reloc_off: u64,
    attr_off: u64,
    attr_count: u32,
    prop_count: u32,
    prop_off: u64,
    req_off: u64,
    req_count: u32,
    pro_count: u32,
    pro_off: u64,
}

/// Parse and validate one image.
///
/// Interns the image's interface types into `registry`. On error the
/// registry is left unchanged; on success the returned descriptor owns one
/// registry reference per interface-table entry.
pub fn parse(
    image: &[u8],
    registry: &mut InterfaceRegistry,
) -> PResult<ComponentDescriptor> {
    // 1. Fixed header and identity checks
    let header = parse_header(image)?;

    // 2. String table and component name
    let strtab = section(image, header.strtab_off, header.strtab_len as u64)?;
    let name = String::from(read_str(strtab, header.name_ref)?);
    if name.is_empty() {
        return Err(ParseError::EmptyName);
    }

    // 3. Segment table
    let segments = parse_segments(image, &header, strtab)?;

    // 4. Lifecycle entries (no registry effects yet)
    let lifecycle = resolve_lifecycle(&header, &segments)?;

    // 5. Interface table; from here on failures must release what was
    //    interned
    let table = parse_interface_table(image, &header, strtab, registry)?;

    // 6. Remaining sections
    match parse_body(image, &header, strtab, &segments, &table) {
        Ok((relocs, attributes, properties, requires, provides)) => Ok(ComponentDescriptor {
            name,
            class: header.comp_class,
            version: header.version,
            min_stack: header.min_stack,
            lifecycle,
            segments,
            relocs,
            attributes,
            properties,
            requires,
            provides,
            interned: table,
        }),
        Err(e) => {
            for desc in &table {
                registry.release(desc);
            }
            Err(e)
        }
    }
}

fn parse_header(image: &[u8]) -> PResult<Header> {
    let mut r = Reader::new(image);

    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(ParseError::BadMagic);
    }
    let class = r.u8()?;
    if class != CLASS_COF64 {
        return Err(ParseError::BadClass { class });
    }
    let major = r.u8()?;
    let minor = r.u8()?;
    let patch = r.u8()?;
    if !version_compatible(major, minor) {
        return Err(ParseError::IncompatibleVersion { major, minor });
    }
    let machine = r.u16()?;
    if machine != MACHINE_MPC {
        return Err(ParseError::BadMachine { machine });
    }
    let comp_class_raw = r.u16()?;
    let comp_class = CompClass::from_u16(comp_class_raw)
        .ok_or(ParseError::BadComponentClass { raw: comp_class_raw })?;

    let min_stack = r.u32()?;
    let name_ref = r.u32()?;
    let construct = r.u32()?;
    let start = r.u32()?;
    let stop = r.u32()?;
    let destroy = r.u32()?;

    let file_size = r.u32()?;
    if file_size as u64 != image.len() as u64 {
        return Err(ParseError::SizeMismatch {
            declared: file_size,
            actual: image.len(),
        });
    }

    let strtab_off = r.u64()?;
    let strtab_len = r.u32()?;
    let seg_count = r.u32()?;
    let seg_off = r.u64()?;
    let itf_off = r.u64()?;
    let itf_count = r.u32()?;
    let reloc_count = r.u32()?;
    let reloc_off = r.u64()?;
    let attr_off = r.u64()?;
    let attr_count = r.u32()?;
    let prop_count = r.u32()?;
    let prop_off = r.u64()?;
    let req_off = r.u64()?;
    let req_count = r.u32()?;
    let pro_count = r.u32()?;
    let pro_off = r.u64()?;
    debug_assert_eq!(r.pos, HEADER_LEN);

    Ok(Header {
        comp_class,
        version: (major, minor, patch),
        min_stack,
        name_ref,
        construct,
        start,
        stop,
        destroy,
        strtab_off,
        strtab_len,
        seg_count,
        seg_off,
        itf_off,
        itf_count,
        reloc_count,
        reloc_off,
        attr_off,
        attr_count,
        prop_count,
        prop_off,
        req_off,
        req_count,
        pro_count,
        pro_off,
    })
}

fn section(image: &[u8], off: u64, len: u64) -> PResult<&[u8]> {
    let end = off.checked_add(len).ok_or(ParseError::UnexpectedEnd {
        offset: image.len(),
    })?;
    if end > image.len() as u64 {
        return Err(ParseError::UnexpectedEnd {
            offset: image.len(),
        });
    }
    Ok(&image[off as usize..end as usize])
}

fn read_str(strtab: &[u8], offset: u32) -> PResult<&str> {
    let start = offset as usize;
    if start >= strtab.len() {
        return Err(ParseError::StringOutOfRange { offset });
    }
    let rest = &strtab[start..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(ParseError::StringNotTerminated { offset })?;
    core::str::from_utf8(&rest[..nul]).map_err(|_| ParseError::StringNotUtf8 { offset })
}

fn parse_segments(image: &[u8], header: &Header, strtab: &[u8]) -> PResult<Vec<SegmentRecord>> {
    let table = section(
        image,
        header.seg_off,
        header.seg_count as u64 * SEGMENT_ENTRY_LEN as u64,
    )?;
    let mut r = Reader::new(table);
    let mut segments = Vec::new();

    for index in 0..header.seg_count as usize {
        let name_ref = r.u32()?;
        let purpose_raw = r.u16()?;
        let mem_raw = r.u16()?;
        let vaddr = r.u32()?;
        let size = r.u32()?;
        let align = r.u32()?;
        let _reserved = r.u32()?;
        let file_off = r.u64()?;
        let file_len = r.u64()?;

        let name = String::from(read_str(strtab, name_ref)?);
        let purpose = cof::SegmentPurpose::from_u16(purpose_raw).ok_or(ParseError::BadPurpose {
            index,
            raw: purpose_raw,
        })?;
        let mem = cof::mem_kind_from_u16(mem_raw).ok_or(ParseError::BadMemKind {
            index,
            raw: mem_raw,
        })?;
        if !cof::purpose_matches_kind(purpose, mem) {
            return Err(ParseError::PurposeKindMismatch { index });
        }
        // Words are the patch granularity, so nothing may be packed looser
        if align < 4 || !align.is_power_of_two() {
            return Err(ParseError::BadAlignment { index, align });
        }
        if vaddr.checked_add(size).is_none() {
            return Err(ParseError::SegmentWraps { index });
        }
        if file_len > size as u64 {
            return Err(ParseError::PayloadExceedsSize { index });
        }
        let payload = section(image, file_off, file_len)
            .map_err(|_| ParseError::PayloadOutOfRange { index })?
            .to_vec();

        segments.push(SegmentRecord {
            name,
            purpose,
            mem,
            vaddr,
            size,
            align,
            payload,
        });
    }

    // Link addresses must be unambiguous for address resolution
    for a in 0..segments.len() {
        for b in a + 1..segments.len() {
            let (sa, sb) = (&segments[a], &segments[b]);
            if sa.size == 0 || sb.size == 0 {
                continue;
            }
            let a_end = sa.vaddr as u64 + sa.size as u64;
            let b_end = sb.vaddr as u64 + sb.size as u64;
            if (sa.vaddr as u64) < b_end && (sb.vaddr as u64) < a_end {
                return Err(ParseError::SegmentsOverlap {
                    first: a,
                    second: b,
                });
            }
        }
    }

    Ok(segments)
}

/// Find the segment whose link range contains `addr`.
fn find_segment(segments: &[SegmentRecord], addr: u32) -> Option<(u16, u32)> {
    segments.iter().enumerate().find_map(|(i, s)| {
        let addr = addr as u64;
        let start = s.vaddr as u64;
        if addr >= start && addr < start + s.size as u64 {
            Some((i as u16, (addr - start) as u32))
        } else {
            None
        }
    })
}

/// Resolve a code address into a code segment.
fn resolve_code(segments: &[SegmentRecord], addr: u32) -> PResult<MemoryRef> {
    let (segment, offset) =
        find_segment(segments, addr).ok_or(ParseError::EntryOutsideSegments { addr })?;
    if segments[segment as usize].purpose != cof::SegmentPurpose::Code {
        return Err(ParseError::EntryNotInCode { addr });
    }
    Ok(MemoryRef { segment, offset })
}

fn resolve_lifecycle(header: &Header, segments: &[SegmentRecord]) -> PResult<Lifecycle> {
    let firmware = header.comp_class == CompClass::Firmware;
    if firmware && header.construct != ENTRY_NONE {
        return Err(ParseError::FirmwareWithConstruct);
    }
    let resolve = |raw: u32| -> PResult<CodeAddr> {
        if raw == ENTRY_NONE {
            Ok(CodeAddr::Absent)
        } else if firmware {
            Ok(CodeAddr::Absolute(raw))
        } else {
            resolve_code(segments, raw).map(CodeAddr::InSegment)
        }
    };
    Ok(Lifecycle {
        construct: resolve(header.construct)?,
        start: resolve(header.start)?,
        stop: resolve(header.stop)?,
        destroy: resolve(header.destroy)?,
    })
}

fn parse_interface_table(
    image: &[u8],
    header: &Header,
    strtab: &[u8],
    registry: &mut InterfaceRegistry,
) -> PResult<Vec<InterfaceRef>> {
    let mut r = Reader::new(image);
    r.seek(header.itf_off)?;

    let mut table: Vec<InterfaceRef> = Vec::new();
    for _ in 0..header.itf_count {
        match read_interface_entry(&mut r, strtab) {
            Ok((type_name, methods)) => table.push(registry.intern(&type_name, methods)),
            Err(e) => {
                for desc in &table {
                    registry.release(desc);
                }
                return Err(e);
            }
        }
    }
    Ok(table)
}

fn read_interface_entry<'a>(
    r: &mut Reader<'a>,
    strtab: &'a [u8],
) -> PResult<(String, Vec<String>)> {
    let name_ref = r.u32()?;
    let method_count = r.u32()?;
    let type_name = String::from(read_str(strtab, name_ref)?);
    let mut methods = Vec::new();
    for _ in 0..method_count {
        let m_ref = r.u32()?;
        methods.push(String::from(read_str(strtab, m_ref)?));
    }
    Ok((type_name, methods))
}

type Body = (
    Vec<RelocRecord>,
    Vec<AttributeRecord>,
    Vec<PropertyRecord>,
    Vec<RequiredInterface>,
    Vec<ProvidedInterface>,
);

fn parse_body(
    image: &[u8],
    header: &Header,
    strtab: &[u8],
    segments: &[SegmentRecord],
    table: &[InterfaceRef],
) -> PResult<Body> {
    let relocs = parse_relocs(image, header, segments)?;
    let attributes = parse_attributes(image, header, strtab, segments)?;
    let properties = parse_properties(image, header, strtab)?;
    let requires = parse_requires(image, header, strtab, segments, table)?;
    let provides = parse_provides(image, header, strtab, segments, table)?;
    Ok((relocs, attributes, properties, requires, provides))
}

fn parse_relocs(
    image: &[u8],
    header: &Header,
    segments: &[SegmentRecord],
) -> PResult<Vec<RelocRecord>> {
    let table = section(
        image,
        header.reloc_off,
        header.reloc_count as u64 * RELOC_ENTRY_LEN as u64,
    )?;
    let mut r = Reader::new(table);
    let mut relocs = Vec::new();

    for index in 0..header.reloc_count as usize {
        let seg = r.u16()?;
        let target = r.u16()?;
        let offset = r.u32()?;
        let addend = r.u32()?;

        let site = segments
            .get(seg as usize)
            .ok_or(ParseError::RelocBadSegment { index })?;
        let target_seg = segments
            .get(target as usize)
            .ok_or(ParseError::RelocBadSegment { index })?;
        if offset % 4 != 0 {
            return Err(ParseError::RelocUnaligned { index });
        }
        if offset as u64 + 4 > site.size as u64 {
            return Err(ParseError::RelocOutOfRange { index });
        }
        // A shared word holding a per-instance address can never be right
        if site.purpose.is_shared() && target_seg.purpose.is_private() {
            return Err(ParseError::RelocSharedToPrivate { index });
        }

        relocs.push(RelocRecord {
            seg,
            target,
            offset,
            addend,
        });
    }
    Ok(relocs)
}

fn parse_attributes(
    image: &[u8],
    header: &Header,
    strtab: &[u8],
    segments: &[SegmentRecord],
) -> PResult<Vec<AttributeRecord>> {
    let table = section(
        image,
        header.attr_off,
        header.attr_count as u64 * cof::ATTRIBUTE_ENTRY_LEN as u64,
    )?;
    let mut r = Reader::new(table);
    let mut attributes = Vec::new();

    for _ in 0..header.attr_count {
        let name_ref = r.u32()?;
        let addr = r.u32()?;
        let name = String::from(read_str(strtab, name_ref)?);

        let (segment, offset) =
            find_segment(segments, addr).ok_or(ParseError::AttrOutOfRange { addr })?;
        if offset % 4 != 0 {
            return Err(ParseError::AttrUnaligned { addr });
        }
        if offset as u64 + 4 > segments[segment as usize].size as u64 {
            return Err(ParseError::AttrOutOfRange { addr });
        }
        attributes.push(AttributeRecord {
            name,
            addr: MemoryRef { segment, offset },
        });
    }
    Ok(attributes)
}

fn parse_properties(image: &[u8], header: &Header, strtab: &[u8]) -> PResult<Vec<PropertyRecord>> {
    let table = section(
        image,
        header.prop_off,
        header.prop_count as u64 * cof::PROPERTY_ENTRY_LEN as u64,
    )?;
    let mut r = Reader::new(table);
    let mut properties = Vec::new();

    for _ in 0..header.prop_count {
        let name_ref = r.u32()?;
        let value_ref = r.u32()?;
        properties.push(PropertyRecord {
            name: String::from(read_str(strtab, name_ref)?),
            value: String::from(read_str(strtab, value_ref)?),
        });
    }
    Ok(properties)
}

fn parse_requires(
    image: &[u8],
    header: &Header,
    strtab: &[u8],
    segments: &[SegmentRecord],
    table: &[InterfaceRef],
) -> PResult<Vec<RequiredInterface>> {
    let mut r = Reader::new(image);
    r.seek(header.req_off)?;
    let mut requires = Vec::new();

    for _ in 0..header.req_count {
        let name_ref = r.u32()?;
        let itf_index = r.u32()?;
        let flags_raw = r.u32()?;
        let collection = r.u32()?;

        let name = String::from(read_str(strtab, name_ref)?);
        let descriptor = table
            .get(itf_index as usize)
            .ok_or(ParseError::BadInterfaceIndex { index: itf_index })?
            .clone();
        let kind =
            RequireKind::from_bits(flags_raw).ok_or(ParseError::BadRequireFlags { raw: flags_raw })?;
        if collection == 0 {
            return Err(ParseError::ZeroCollection { interface: name });
        }

        let mut sites = Vec::new();
        if kind.has_patch_sites() {
            // One "this" word plus one word per method
            let cell_bytes = 4 * (1 + descriptor.method_count() as u64);
            for _member in 0..collection {
                let site_count = r.u32()?;
                let mut cells = Vec::new();
                for _ in 0..site_count {
                    let addr = r.u32()?;
                    let (segment, offset) = find_segment(segments, addr)
                        .ok_or(ParseError::SiteOutOfRange { addr })?;
                    if !segments[segment as usize].purpose.is_private() {
                        return Err(ParseError::SiteNotPrivate { addr });
                    }
                    if offset % 4 != 0 {
                        return Err(ParseError::SiteUnaligned { addr });
                    }
                    if offset as u64 + cell_bytes > segments[segment as usize].size as u64 {
                        return Err(ParseError::SiteOutOfRange { addr });
                    }
                    cells.push(MemoryRef { segment, offset });
                }
                sites.push(cells);
            }
        }

        requires.push(RequiredInterface {
            name,
            descriptor,
            kind,
            collection,
            sites,
        });
    }
    Ok(requires)
}

fn parse_provides(
    image: &[u8],
    header: &Header,
    strtab: &[u8],
    segments: &[SegmentRecord],
    table: &[InterfaceRef],
) -> PResult<Vec<ProvidedInterface>> {
    let firmware_addrs = header.comp_class == CompClass::Firmware;
    let mut r = Reader::new(image);
    r.seek(header.pro_off)?;
    let mut provides = Vec::new();

    for _ in 0..header.pro_count {
        let name_ref = r.u32()?;
        let itf_index = r.u32()?;
        let flags_raw = r.u32()?;
        let irq_raw = r.u32()?;
        let collection = r.u32()?;

        let name = String::from(read_str(strtab, name_ref)?);
        let descriptor = table
            .get(itf_index as usize)
            .ok_or(ParseError::BadInterfaceIndex { index: itf_index })?
            .clone();
        let kind =
            ProvideKind::from_bits(flags_raw).ok_or(ParseError::BadProvideFlags { raw: flags_raw })?;
        if kind.is_virtual() && kind.is_interrupt() {
            // An interrupt handler must be directly addressable
            return Err(ParseError::BadProvideFlags { raw: flags_raw });
        }
        if collection == 0 {
            return Err(ParseError::ZeroCollection { interface: name });
        }

        let irq_line = if kind.is_interrupt() {
            if irq_raw == IRQ_NONE {
                return Err(ParseError::MissingIrqLine { interface: name });
            }
            if descriptor.method_count() == 0 {
                return Err(ParseError::InterruptWithoutHandler { interface: name });
            }
            Some(irq_raw)
        } else {
            None
        };

        let mut methods = Vec::new();
        if !kind.is_virtual() {
            for _member in 0..collection {
                let mut member = Vec::new();
                for _ in 0..descriptor.method_count() {
                    let addr = r.u32()?;
                    let resolved = if firmware_addrs {
                        CodeAddr::Absolute(addr)
                    } else {
                        CodeAddr::InSegment(resolve_code(segments, addr)?)
                    };
                    member.push(resolved);
                }
                methods.push(member);
            }
        }

        provides.push(ProvidedInterface {
            name,
            descriptor,
            kind,
            irq_line,
            collection,
            methods,
        });
    }
    Ok(provides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec;

    use cof::SegmentPurpose;
    use cof_builder::ImageBuilder;
    use mpc_platform::MemKind;

    fn code_payload(words: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        for i in 0..words {
            bytes.extend_from_slice(&(0xE000_0000u32 | i as u32).to_le_bytes());
        }
        bytes
    }

    /// Two segments (.text code, .bss-ish data), three lifecycle entries.
    fn basic_image() -> Vec<u8> {
        ImageBuilder::new("demo")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x1000,
                64,
                8,
                &code_payload(16),
            )
            .with_segment(
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x8000,
                32,
                8,
                &[1, 2, 3, 4],
            )
            .with_construct(0x1000)
            .with_start(0x1004)
            .with_stop(0x1008)
            .build()
    }

    #[test]
    fn test_parse_basic_image() {
        let mut reg = InterfaceRegistry::new();
        let d = parse(&basic_image(), &mut reg).unwrap();

        assert_eq!(d.name, "demo");
        assert_eq!(d.class, CompClass::Component);
        assert_eq!(d.version, (2, 1, 0));
        assert_eq!(d.segments.len(), 2);
        assert_eq!(d.segments[0].name, ".text");
        assert_eq!(d.segments[0].payload.len(), 64);
        assert_eq!(d.segments[1].payload, vec![1, 2, 3, 4]);
        assert_eq!(
            d.lifecycle.construct,
            CodeAddr::InSegment(MemoryRef {
                segment: 0,
                offset: 0
            })
        );
        assert_eq!(
            d.lifecycle.start,
            CodeAddr::InSegment(MemoryRef {
                segment: 0,
                offset: 4
            })
        );
        assert_eq!(d.lifecycle.destroy, CodeAddr::Absent);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut img = basic_image();
        img[0] = 0x7E;
        let mut reg = InterfaceRegistry::new();
        assert_eq!(parse(&img, &mut reg).unwrap_err(), ParseError::BadMagic);
    }

    #[test]
    fn test_rejects_wrong_class_and_machine() {
        let mut reg = InterfaceRegistry::new();

        let mut img = basic_image();
        img[4] = 1; // the legacy 32-bit class
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::BadClass { class: 1 }
        );

        let mut img = basic_image();
        img[8] = 0x41;
        img[9] = 0x41;
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::BadMachine { machine: 0x4141 }
        );
    }

    #[test]
    fn test_version_matrix() {
        let mut reg = InterfaceRegistry::new();

        // Compatible successor minor parses
        let ok = ImageBuilder::new("v22")
            .with_version(2, 2, 7)
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0,
                16,
                8,
                &code_payload(4),
            )
            .build();
        assert!(parse(&ok, &mut reg).is_ok());

        for (major, minor) in [(2, 0), (2, 3), (1, 1), (3, 1)] {
            let img = ImageBuilder::new("vx")
                .with_version(major, minor, 0)
                .with_segment(
                    ".text",
                    SegmentPurpose::Code,
                    MemKind::SdramCode,
                    0,
                    16,
                    8,
                    &code_payload(4),
                )
                .build();
            assert_eq!(
                parse(&img, &mut reg).unwrap_err(),
                ParseError::IncompatibleVersion { major, minor }
            );
        }
    }

    #[test]
    fn test_rejects_size_mismatch() {
        let mut img = basic_image();
        // file_size field sits after ident, machine, comp_class, min_stack,
        // name_ref and the four lifecycle words
        let declared = u32::from_le_bytes([img[36], img[37], img[38], img[39]]);
        img[36..40].copy_from_slice(&(declared + 8).to_le_bytes());
        let mut reg = InterfaceRegistry::new();
        assert!(matches!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_rejects_truncation() {
        let img = basic_image();
        let mut reg = InterfaceRegistry::new();
        assert!(matches!(
            parse(&img[..20], &mut reg).unwrap_err(),
            ParseError::UnexpectedEnd { .. }
        ));
    }

    #[test]
    fn test_segment_validation() {
        let mut reg = InterfaceRegistry::new();

        // Code purpose in a data bank
        let img = ImageBuilder::new("x")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramData,
                0,
                16,
                8,
                &[],
            )
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::PurposeKindMismatch { index: 0 }
        );

        // Alignment below word size
        let img = ImageBuilder::new("x")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0,
                16,
                2,
                &[],
            )
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::BadAlignment { index: 0, align: 2 }
        );

        // Payload longer than the segment
        let img = ImageBuilder::new("x")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0,
                8,
                8,
                &code_payload(4),
            )
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::PayloadExceedsSize { index: 0 }
        );

        // Overlapping link ranges
        let img = ImageBuilder::new("x")
            .with_segment(
                ".a",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x100,
                32,
                8,
                &[],
            )
            .with_segment(
                ".b",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x110,
                32,
                8,
                &[],
            )
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::SegmentsOverlap {
                first: 0,
                second: 1
            }
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_reloc_validation() {
        let mut reg = InterfaceRegistry::new();
        let builder = || {
            ImageBuilder::new("x")
                .with_segment(
                    ".text",
                    SegmentPurpose::Code,
                    MemKind::SdramCode,
                    0x1000,
                    32,
                    8,
                    &code_payload(8),
                )
                .with_segment(
                    ".data",
                    SegmentPurpose::Data,
                    MemKind::SdramData,
                    0x8000,
                    32,
                    8,
                    &[],
                )
        };

        let img = builder().with_reloc(5, 0, 0, 0).build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::RelocBadSegment { index: 0 }
        );

        let img = builder().with_reloc(0, 1, 2, 0).build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::RelocUnaligned { index: 0 }
        );

        let img = builder().with_reloc(0, 1, 32, 0).build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::RelocOutOfRange { index: 0 }
        );

        // Site in shared .text, target in private .data
        let img = builder().with_reloc(0, 1, 0, 0).build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::RelocSharedToPrivate { index: 0 }
        );

        // Private site may target shared memory
        let img = builder().with_reloc(1, 0, 4, 0x10).build();
        let d = parse(&img, &mut reg).unwrap();
        assert_eq!(
            d.relocs[0],
            RelocRecord {
                seg: 1,
                target: 0,
                offset: 4,
                addend: 0x10
            }
        );
    }

    #[test]
    fn test_lifecycle_resolution_rules() {
        let mut reg = InterfaceRegistry::new();

        let img = ImageBuilder::new("x")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x1000,
                32,
                8,
                &code_payload(8),
            )
            .with_start(0x2000)
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::EntryOutsideSegments { addr: 0x2000 }
        );

        let img = ImageBuilder::new("x")
            .with_segment(
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x8000,
                32,
                8,
                &[],
            )
            .with_start(0x8000)
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::EntryNotInCode { addr: 0x8000 }
        );

        // Firmware keeps absolute addresses and refuses construct
        let img = ImageBuilder::new("fw")
            .with_class(CompClass::Firmware)
            .with_start(0x00A0_0000)
            .build();
        let d = parse(&img, &mut reg).unwrap();
        assert_eq!(d.lifecycle.start, CodeAddr::Absolute(0x00A0_0000));

        let img = ImageBuilder::new("fw")
            .with_class(CompClass::Firmware)
            .with_construct(0x00A0_0000)
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::FirmwareWithConstruct
        );
    }

    #[test]
    fn test_interface_interning_is_shared_and_balanced() {
        let mut reg = InterfaceRegistry::new();

        let provider = ImageBuilder::new("provider")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x1000,
                32,
                8,
                &code_payload(8),
            )
            .with_interface("audio.sink", &["open", "write"])
            .with_provide("sink", 0, ProvideKind::empty(), None, &[&[0x1000, 0x1004]])
            .build();
        let consumer = ImageBuilder::new("consumer")
            .with_segment(
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x8000,
                64,
                8,
                &[],
            )
            .with_interface("audio.sink", &["open", "write"])
            .with_require("sink", 0, RequireKind::empty(), &[&[0x8000]])
            .build();

        let dp = parse(&provider, &mut reg).unwrap();
        let dc = parse(&consumer, &mut reg).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.ref_count("audio.sink"), 2);
        assert!(Rc::ptr_eq(
            &dp.provides[0].descriptor,
            &dc.requires[0].descriptor
        ));

        // Releasing both parses drains the registry
        for d in dp.interned.iter().chain(dc.interned.iter()) {
            reg.release(d);
        }
        assert!(reg.is_empty());
    }

    #[test]
    fn test_failed_parse_leaves_registry_unchanged() {
        let mut reg = InterfaceRegistry::new();
        // Require references interface index 7, which does not exist
        let img = ImageBuilder::new("bad")
            .with_segment(
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x8000,
                64,
                8,
                &[],
            )
            .with_interface("bus.ctl", &["reset"])
            .with_require("ctl", 7, RequireKind::empty(), &[&[0x8000]])
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::BadInterfaceIndex { index: 7 }
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_require_site_rules() {
        let mut reg = InterfaceRegistry::new();
        let base = || {
            ImageBuilder::new("x")
                .with_segment(
                    ".text",
                    SegmentPurpose::Code,
                    MemKind::SdramCode,
                    0x1000,
                    32,
                    8,
                    &code_payload(8),
                )
                .with_segment(
                    ".data",
                    SegmentPurpose::Data,
                    MemKind::SdramData,
                    0x8000,
                    32,
                    8,
                    &[],
                )
                .with_interface("clk", &["now"])
        };

        // Patch cell in shared memory
        let img = base()
            .with_require("clk", 0, RequireKind::empty(), &[&[0x1000]])
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::SiteNotPrivate { addr: 0x1000 }
        );
        assert!(reg.is_empty());

        // Cell of 2 words spilling off the segment end
        let img = base()
            .with_require("clk", 0, RequireKind::empty(), &[&[0x801C]])
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::SiteOutOfRange { addr: 0x801C }
        );

        // Zero collection is refused even without sites
        let img = base()
            .with_require_abstract("clk", 0, RequireKind::VIRTUAL, 0)
            .build();
        assert!(matches!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::ZeroCollection { .. }
        ));

        // Virtual requires carry no sites
        let img = base()
            .with_require_abstract("clk", 0, RequireKind::VIRTUAL, 2)
            .build();
        let d = parse(&img, &mut reg).unwrap();
        assert_eq!(d.requires[0].collection, 2);
        assert!(d.requires[0].sites.is_empty());
        for i in &d.interned {
            reg.release(i);
        }
    }

    #[test]
    fn test_provide_interrupt_rules() {
        let mut reg = InterfaceRegistry::new();
        let base = || {
            ImageBuilder::new("x")
                .with_segment(
                    ".text",
                    SegmentPurpose::Code,
                    MemKind::SdramCode,
                    0x1000,
                    32,
                    8,
                    &code_payload(8),
                )
                .with_interface("irq.sink", &["service"])
        };

        let img = base()
            .with_provide("irq", 0, ProvideKind::INTERRUPT, None, &[&[0x1000]])
            .build();
        assert!(matches!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::MissingIrqLine { .. }
        ));

        let img = base()
            .with_provide("irq", 0, ProvideKind::INTERRUPT, Some(12), &[&[0x1000]])
            .build();
        let d = parse(&img, &mut reg).unwrap();
        assert_eq!(d.provides[0].irq_line, Some(12));
        assert_eq!(
            d.provides[0].methods[0][0],
            CodeAddr::InSegment(MemoryRef {
                segment: 0,
                offset: 0
            })
        );
        for i in &d.interned {
            reg.release(i);
        }
    }

    #[test]
    fn test_properties_and_attributes() {
        let mut reg = InterfaceRegistry::new();
        let img = ImageBuilder::new("x")
            .with_segment(
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x8000,
                32,
                8,
                &[],
            )
            .with_property("hardware", "true")
            .with_attribute("state_word", 0x8004)
            .build();
        let d = parse(&img, &mut reg).unwrap();
        assert_eq!(d.property("hardware"), Some("true"));
        assert_eq!(d.property("missing"), None);
        assert_eq!(
            d.attributes[0].addr,
            MemoryRef {
                segment: 0,
                offset: 4
            }
        );

        let img = ImageBuilder::new("x")
            .with_segment(
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x8000,
                32,
                8,
                &[],
            )
            .with_attribute("bad", 0x9000)
            .build();
        assert_eq!(
            parse(&img, &mut reg).unwrap_err(),
            ParseError::AttrOutOfRange { addr: 0x9000 }
        );
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let mut reg = InterfaceRegistry::new();
        let img = ImageBuilder::new("").build();
        assert_eq!(parse(&img, &mut reg).unwrap_err(), ParseError::EmptyName);
    }

    #[test]
    fn test_reparse_counts_references_again() {
        let mut reg = InterfaceRegistry::new();
        let img = ImageBuilder::new("x")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x1000,
                32,
                8,
                &code_payload(8),
            )
            .with_interface("dma", &["go"])
            .with_provide("dma", 0, ProvideKind::empty(), None, &[&[0x1000]])
            .build();
        let a = parse(&img, &mut reg).unwrap();
        let b = parse(&img, &mut reg).unwrap();
        assert_eq!(reg.ref_count("dma"), 2);
        for d in a.interned.iter().chain(b.interned.iter()) {
            reg.release(d);
        }
        assert_eq!(reg.ref_count("dma"), 0);
    }
}
