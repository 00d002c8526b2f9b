//! Parsed form of one component image.
//!
//! A [`ComponentDescriptor`] is the validated, owned result of parsing a
//! COF image: every string resolved, every address turned into a segment
//! reference, every interface type interned. The template loader consumes
//! it; nothing here touches hardware.

use alloc::string::String;
use alloc::vec::Vec;

use cof::{CompClass, ProvideKind, RequireKind, SegmentPurpose};
use mpc_platform::MemKind;

use crate::registry::InterfaceRef;

/// A location inside one segment of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRef {
    pub segment: u16,
    pub offset: u32,
}

/// A code address from the image, after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeAddr {
    /// The image declares no such entry.
    Absent,
    /// Fixed DSP address; only firmware images carry these.
    Absolute(u32),
    /// Relocatable address, resolved once the segment is placed.
    InSegment(MemoryRef),
}

impl CodeAddr {
    pub fn is_present(self) -> bool {
        !matches!(self, CodeAddr::Absent)
    }
}

/// The four lifecycle entries of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub construct: CodeAddr,
    pub start: CodeAddr,
    pub stop: CodeAddr,
    pub destroy: CodeAddr,
}

/// One segment: placement metadata plus its file payload. The payload is
/// shorter than `size` when the tail is zero-initialized.
#[derive(Debug)]
pub struct SegmentRecord {
    pub name: String,
    pub purpose: SegmentPurpose,
    pub mem: MemKind,
    pub vaddr: u32,
    pub size: u32,
    pub align: u32,
    pub payload: Vec<u8>,
}

/// One relocation: the word at `offset` inside `seg` receives the loaded
/// base of `target` plus `addend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocRecord {
    pub seg: u16,
    pub target: u16,
    pub offset: u32,
    pub addend: u32,
}

/// A named word of instance memory, readable from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRecord {
    pub name: String,
    pub addr: MemoryRef,
}

/// A named constant string baked into the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRecord {
    pub name: String,
    pub value: String,
}

/// A declared dependency on an interface type.
#[derive(Debug)]
pub struct RequiredInterface {
    /// Binding-point name, unique within the component.
    pub name: String,
    pub descriptor: InterfaceRef,
    pub kind: RequireKind,
    /// Collection size, at least 1.
    pub collection: u32,
    /// Per collection member, the call-site cells to patch on bind. Each
    /// cell starts with the provider "this" word followed by one word per
    /// method. Empty when the kind carries no patch sites.
    pub sites: Vec<Vec<MemoryRef>>,
}

/// A declared implementation of an interface type.
#[derive(Debug)]
pub struct ProvidedInterface {
    pub name: String,
    pub descriptor: InterfaceRef,
    pub kind: ProvideKind,
    /// Interrupt line, for interrupt provides only.
    pub irq_line: Option<u32>,
    pub collection: u32,
    /// Per member, per method, the implementation address. Empty for
    /// virtual provides, which dispatch through the component's vtable.
    pub methods: Vec<Vec<CodeAddr>>,
}

/// Everything the loader needs from one validated image.
#[derive(Debug)]
pub struct ComponentDescriptor {
    pub name: String,
    pub class: CompClass,
    pub version: (u8, u8, u8),
    /// Stack demand in words, per priority band the component runs at.
    pub min_stack: u32,
    pub lifecycle: Lifecycle,
    pub segments: Vec<SegmentRecord>,
    pub relocs: Vec<RelocRecord>,
    pub attributes: Vec<AttributeRecord>,
    pub properties: Vec<PropertyRecord>,
    pub requires: Vec<RequiredInterface>,
    pub provides: Vec<ProvidedInterface>,
    /// Registry references taken while parsing, one per interface-table
    /// entry. Released when the template unloads.
    pub interned: Vec<InterfaceRef>,
}

impl ComponentDescriptor {
    /// Value of a property, if declared.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}
