//! COF image packer.
//!
//! # Purpose
//! Builds component images byte-compatible with the runtime's loader. The
//! builder is declarative: describe the component, then [`ImageBuilder::build`]
//! lays out the file as fixed header, string table, section tables and the
//! payload blob. Readers locate sections through the header directory, so
//! the order chosen here is not part of the format.

use std::collections::BTreeMap;

use cof::{
    mem_kind_to_u16, CompClass, ProvideKind, RequireKind, SegmentPurpose, CLASS_COF64, ENTRY_NONE,
    HEADER_LEN, IRQ_NONE, MACHINE_MPC, MAGIC, SEGMENT_ENTRY_LEN, VERSION_MAJOR, VERSION_MINOR,
    VERSION_PATCH,
};
use mpc_platform::MemKind;

struct SegmentSpec {
    name: String,
    purpose: SegmentPurpose,
    mem: MemKind,
    vaddr: u32,
    size: u32,
    align: u32,
    payload: Vec<u8>,
}

struct InterfaceSpec {
    type_name: String,
    methods: Vec<String>,
}

struct RequireSpec {
    name: String,
    interface: u32,
    kind: RequireKind,
    collection: u32,
    sites: Vec<Vec<u32>>,
}

struct ProvideSpec {
    name: String,
    interface: u32,
    kind: ProvideKind,
    irq: u32,
    collection: u32,
    methods: Vec<Vec<u32>>,
}

/// Declarative builder for one COF image.
///
/// Addresses passed in (`vaddr`, lifecycle entries, patch sites, method
/// implementations) are link addresses; the loader resolves them against
/// the segment table.
pub struct ImageBuilder {
    name: String,
    class: CompClass,
    version: (u8, u8, u8),
    min_stack: u32,
    construct: u32,
    start: u32,
    stop: u32,
    destroy: u32,
    segments: Vec<SegmentSpec>,
    relocs: Vec<(u16, u16, u32, u32)>,
    interfaces: Vec<InterfaceSpec>,
    requires: Vec<RequireSpec>,
    provides: Vec<ProvideSpec>,
    attributes: Vec<(String, u32)>,
    properties: Vec<(String, String)>,
}

impl ImageBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            class: CompClass::Component,
            version: (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH),
            min_stack: 0,
            construct: ENTRY_NONE,
            start: ENTRY_NONE,
            stop: ENTRY_NONE,
            destroy: ENTRY_NONE,
            segments: Vec::new(),
            relocs: Vec::new(),
            interfaces: Vec::new(),
            requires: Vec::new(),
            provides: Vec::new(),
            attributes: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn with_class(mut self, class: CompClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_version(mut self, major: u8, minor: u8, patch: u8) -> Self {
        self.version = (major, minor, patch);
        self
    }

    /// Stack demand in words.
    pub fn with_min_stack(mut self, words: u32) -> Self {
        self.min_stack = words;
        self
    }

    pub fn with_construct(mut self, addr: u32) -> Self {
        self.construct = addr;
        self
    }

    pub fn with_start(mut self, addr: u32) -> Self {
        self.start = addr;
        self
    }

    pub fn with_stop(mut self, addr: u32) -> Self {
        self.stop = addr;
        self
    }

    pub fn with_destroy(mut self, addr: u32) -> Self {
        self.destroy = addr;
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_segment(
        mut self,
        name: &str,
        purpose: SegmentPurpose,
        mem: MemKind,
        vaddr: u32,
        size: u32,
        align: u32,
        payload: &[u8],
    ) -> Self {
        self.segments.push(SegmentSpec {
            name: String::from(name),
            purpose,
            mem,
            vaddr,
            size,
            align,
            payload: payload.to_vec(),
        });
        self
    }

    pub fn with_reloc(mut self, seg: u16, target: u16, offset: u32, addend: u32) -> Self {
        self.relocs.push((seg, target, offset, addend));
        self
    }

    /// Add an interface type to the image's interface table. Requires and
    /// provides reference it by table index.
    pub fn with_interface(mut self, type_name: &str, methods: &[&str]) -> Self {
        self.interfaces.push(InterfaceSpec {
            type_name: String::from(type_name),
            methods: methods.iter().map(|m| String::from(*m)).collect(),
        });
        self
    }

    /// Require with one patch-site list per collection member; the
    /// collection size is the number of lists.
    pub fn with_require(
        mut self,
        name: &str,
        interface: u32,
        kind: RequireKind,
        sites: &[&[u32]],
    ) -> Self {
        self.requires.push(RequireSpec {
            name: String::from(name),
            interface,
            kind,
            collection: sites.len() as u32,
            sites: sites.iter().map(|s| s.to_vec()).collect(),
        });
        self
    }

    /// Require without site data, for kinds that carry none.
    pub fn with_require_abstract(
        mut self,
        name: &str,
        interface: u32,
        kind: RequireKind,
        collection: u32,
    ) -> Self {
        self.requires.push(RequireSpec {
            name: String::from(name),
            interface,
            kind,
            collection,
            sites: Vec::new(),
        });
        self
    }

    /// Provide with one method-address list per collection member; each
    /// list must match the interface's method count.
    pub fn with_provide(
        mut self,
        name: &str,
        interface: u32,
        kind: ProvideKind,
        irq: Option<u32>,
        methods: &[&[u32]],
    ) -> Self {
        self.provides.push(ProvideSpec {
            name: String::from(name),
            interface,
            kind,
            irq: irq.unwrap_or(IRQ_NONE),
            collection: methods.len() as u32,
            methods: methods.iter().map(|m| m.to_vec()).collect(),
        });
        self
    }

    /// Provide without method addresses, for virtual dispatch.
    pub fn with_provide_abstract(
        mut self,
        name: &str,
        interface: u32,
        kind: ProvideKind,
        collection: u32,
    ) -> Self {
        self.provides.push(ProvideSpec {
            name: String::from(name),
            interface,
            kind,
            irq: IRQ_NONE,
            collection,
            methods: Vec::new(),
        });
        self
    }

    pub fn with_attribute(mut self, name: &str, addr: u32) -> Self {
        self.attributes.push((String::from(name), addr));
        self
    }

    pub fn with_property(mut self, name: &str, value: &str) -> Self {
        self.properties
            .push((String::from(name), String::from(value)));
        self
    }

    /// Lay out and serialize the image.
    pub fn build(&self) -> Vec<u8> {
        let mut strtab = StrTab::new();
        let name_ref = strtab.add(&self.name);

        let seg_names: Vec<u32> = self.segments.iter().map(|s| strtab.add(&s.name)).collect();

        let mut itf = Vec::new();
        for spec in &self.interfaces {
            push_u32(&mut itf, strtab.add(&spec.type_name));
            push_u32(&mut itf, spec.methods.len() as u32);
            for method in &spec.methods {
                push_u32(&mut itf, strtab.add(method));
            }
        }

        let mut reloc = Vec::new();
        for &(seg, target, offset, addend) in &self.relocs {
            push_u16(&mut reloc, seg);
            push_u16(&mut reloc, target);
            push_u32(&mut reloc, offset);
            push_u32(&mut reloc, addend);
        }

        let mut attr = Vec::new();
        for (name, addr) in &self.attributes {
            push_u32(&mut attr, strtab.add(name));
            push_u32(&mut attr, *addr);
        }

        let mut prop = Vec::new();
        for (name, value) in &self.properties {
            push_u32(&mut prop, strtab.add(name));
            push_u32(&mut prop, strtab.add(value));
        }

        let mut req = Vec::new();
        for spec in &self.requires {
            push_u32(&mut req, strtab.add(&spec.name));
            push_u32(&mut req, spec.interface);
            push_u32(&mut req, spec.kind.bits());
            push_u32(&mut req, spec.collection);
            if spec.kind.has_patch_sites() {
                for member in 0..spec.collection as usize {
                    let cells = spec.sites.get(member).map(Vec::as_slice).unwrap_or(&[]);
                    push_u32(&mut req, cells.len() as u32);
                    for &site in cells {
                        push_u32(&mut req, site);
                    }
                }
            }
        }

        let mut pro = Vec::new();
        for spec in &self.provides {
            push_u32(&mut pro, strtab.add(&spec.name));
            push_u32(&mut pro, spec.interface);
            push_u32(&mut pro, spec.kind.bits());
            push_u32(&mut pro, spec.irq);
            push_u32(&mut pro, spec.collection);
            if !spec.kind.is_virtual() {
                for member in &spec.methods {
                    for &addr in member {
                        push_u32(&mut pro, addr);
                    }
                }
            }
        }

        // Fix the layout: header, strtab, tables, payload blob
        let mut cursor = HEADER_LEN as u64;
        let strtab_off = cursor;
        cursor += strtab.bytes.len() as u64;

        cursor = align_to(cursor, 8);
        let seg_off = cursor;
        cursor += self.segments.len() as u64 * SEGMENT_ENTRY_LEN as u64;

        cursor = align_to(cursor, 8);
        let itf_off = cursor;
        cursor += itf.len() as u64;

        cursor = align_to(cursor, 8);
        let reloc_off = cursor;
        cursor += reloc.len() as u64;

        cursor = align_to(cursor, 8);
        let attr_off = cursor;
        cursor += attr.len() as u64;

        cursor = align_to(cursor, 8);
        let prop_off = cursor;
        cursor += prop.len() as u64;

        cursor = align_to(cursor, 8);
        let req_off = cursor;
        cursor += req.len() as u64;

        cursor = align_to(cursor, 8);
        let pro_off = cursor;
        cursor += pro.len() as u64;

        let mut payload_spans = Vec::new();
        for seg in &self.segments {
            cursor = align_to(cursor, 4);
            payload_spans.push((cursor, seg.payload.len() as u64));
            cursor += seg.payload.len() as u64;
        }
        let file_size = cursor as u32;

        let mut seg_table = Vec::new();
        for (i, seg) in self.segments.iter().enumerate() {
            push_u32(&mut seg_table, seg_names[i]);
            push_u16(&mut seg_table, seg.purpose as u16);
            push_u16(&mut seg_table, mem_kind_to_u16(seg.mem));
            push_u32(&mut seg_table, seg.vaddr);
            push_u32(&mut seg_table, seg.size);
            push_u32(&mut seg_table, seg.align);
            push_u32(&mut seg_table, 0);
            push_u64(&mut seg_table, payload_spans[i].0);
            push_u64(&mut seg_table, payload_spans[i].1);
        }

        let mut out = Vec::with_capacity(file_size as usize);
        out.extend_from_slice(&MAGIC);
        out.push(CLASS_COF64);
        out.push(self.version.0);
        out.push(self.version.1);
        out.push(self.version.2);
        push_u16(&mut out, MACHINE_MPC);
        push_u16(&mut out, self.class as u16);
        push_u32(&mut out, self.min_stack);
        push_u32(&mut out, name_ref);
        push_u32(&mut out, self.construct);
        push_u32(&mut out, self.start);
        push_u32(&mut out, self.stop);
        push_u32(&mut out, self.destroy);
        push_u32(&mut out, file_size);
        push_u64(&mut out, strtab_off);
        push_u32(&mut out, strtab.bytes.len() as u32);
        push_u32(&mut out, self.segments.len() as u32);
        push_u64(&mut out, seg_off);
        push_u64(&mut out, itf_off);
        push_u32(&mut out, self.interfaces.len() as u32);
        push_u32(&mut out, self.relocs.len() as u32);
        push_u64(&mut out, reloc_off);
        push_u64(&mut out, attr_off);
        push_u32(&mut out, self.attributes.len() as u32);
        push_u32(&mut out, self.properties.len() as u32);
        push_u64(&mut out, prop_off);
        push_u64(&mut out, req_off);
        push_u32(&mut out, self.requires.len() as u32);
        push_u32(&mut out, self.provides.len() as u32);
        push_u64(&mut out, pro_off);
        debug_assert_eq!(out.len(), HEADER_LEN);

        out.extend_from_slice(&strtab.bytes);
        pad_to(&mut out, seg_off);
        out.extend_from_slice(&seg_table);
        pad_to(&mut out, itf_off);
        out.extend_from_slice(&itf);
        pad_to(&mut out, reloc_off);
        out.extend_from_slice(&reloc);
        pad_to(&mut out, attr_off);
        out.extend_from_slice(&attr);
        pad_to(&mut out, prop_off);
        out.extend_from_slice(&prop);
        pad_to(&mut out, req_off);
        out.extend_from_slice(&req);
        pad_to(&mut out, pro_off);
        out.extend_from_slice(&pro);
        for (i, seg) in self.segments.iter().enumerate() {
            pad_to(&mut out, payload_spans[i].0);
            out.extend_from_slice(&seg.payload);
        }
        debug_assert_eq!(out.len(), file_size as usize);
        out
    }
}

/// One string table: NUL-terminated entries, deduplicated, with the empty
/// string pinned at offset 0.
struct StrTab {
    bytes: Vec<u8>,
    index: BTreeMap<String, u32>,
}

impl StrTab {
    fn new() -> Self {
        let mut index = BTreeMap::new();
        index.insert(String::new(), 0);
        Self {
            bytes: vec![0],
            index,
        }
    }

    fn add(&mut self, s: &str) -> u32 {
        if let Some(&off) = self.index.get(s) {
            return off;
        }
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.index.insert(String::from(s), off);
        off
    }
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn align_to(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

fn pad_to(buf: &mut Vec<u8>, off: u64) {
    debug_assert!(buf.len() as u64 <= off);
    buf.resize(off as usize, 0);
}
