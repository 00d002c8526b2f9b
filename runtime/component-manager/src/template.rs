//! Loaded templates.
//!
//! A template is the per-core resident form of a parsed image: its shared
//! regions are allocated and relocated once, and every instance on that
//! core then shares them. The template keeps the full segment table and
//! relocation list around because instances still need them, private
//! regions are seeded and patched per instance.

use alloc::string::String;
use alloc::vec::Vec;

use cof::CompClass;
use log::{debug, warn};
use mpc_platform::{
    CoreId, DomainId, DspAllocator, Handle, MemoryChunk, ServiceKind,
};

use crate::descriptor::{
    AttributeRecord, CodeAddr, ComponentDescriptor, Lifecycle, MemoryRef, PropertyRecord,
    ProvidedInterface, RelocRecord, RequiredInterface, SegmentRecord,
};
use crate::layout::{plan_regions, RegionPlan};
use crate::registry::{InterfaceRef, InterfaceRegistry};
use crate::Result;

#[derive(Debug)]
pub struct Template {
    pub name: String,
    pub core: CoreId,
    pub class: CompClass,
    pub min_stack: u32,
    pub lifecycle: Lifecycle,
    pub segments: Vec<SegmentRecord>,
    pub plan: RegionPlan,
    /// Indexed by region; `None` for private regions.
    pub shared_chunks: Vec<Option<MemoryChunk>>,
    pub relocs: Vec<RelocRecord>,
    pub attributes: Vec<AttributeRecord>,
    pub properties: Vec<PropertyRecord>,
    pub requires: Vec<RequiredInterface>,
    pub provides: Vec<ProvidedInterface>,
    pub interned: Vec<InterfaceRef>,
    /// The image asked for the hardware power gate.
    pub hardware: bool,
    /// Live instances built from this template.
    pub instances: usize,
    /// For singleton components, the one instance everyone shares.
    pub singleton: Option<Handle>,
}

impl Template {
    /// Make a parsed image resident on `core`.
    ///
    /// Allocates and seeds the shared regions and applies the relocations
    /// whose site words live in shared memory. On failure everything
    /// allocated here is freed and the descriptor's interned interface
    /// references are released.
    pub fn load<A: DspAllocator>(
        descriptor: ComponentDescriptor,
        core: CoreId,
        domain: DomainId,
        allocator: &A,
        registry: &mut InterfaceRegistry,
    ) -> Result<Template> {
        let plan = match plan_regions(&descriptor.segments) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("template {:?}: region plan failed: {}", descriptor.name, e);
                for desc in &descriptor.interned {
                    registry.release(desc);
                }
                return Err(e.into());
            }
        };

        let mut shared_chunks: Vec<Option<MemoryChunk>> =
            (0..plan.regions.len()).map(|_| None).collect();
        for (index, region) in plan.regions.iter().enumerate() {
            if !region.shared {
                continue;
            }
            match allocator.alloc(domain, region.mem, region.size as usize, region.align, true) {
                Ok(chunk) => shared_chunks[index] = Some(chunk),
                Err(e) => {
                    warn!(
                        "template {:?}: shared region allocation failed: {}",
                        descriptor.name, e
                    );
                    free_chunks(allocator, shared_chunks);
                    for desc in &descriptor.interned {
                        registry.release(desc);
                    }
                    return Err(e.into());
                }
            }
        }

        // Seed shared regions with their payloads; the tails stay zero
        for (index, seg) in descriptor.segments.iter().enumerate() {
            let p = plan.placement(index);
            if !plan.regions[p.region].shared || seg.payload.is_empty() {
                continue;
            }
            chunk_mut(&mut shared_chunks, p.region).write_bytes(p.offset as usize, &seg.payload);
        }

        // Shared-site relocation pass; private sites wait for instances
        for reloc in &descriptor.relocs {
            let site = plan.placement(reloc.seg as usize);
            if !plan.regions[site.region].shared {
                continue;
            }
            let target = plan.placement(reloc.target as usize);
            let value = chunk_base(&shared_chunks, target.region)
                .wrapping_add(target.offset)
                .wrapping_add(reloc.addend);
            chunk_mut(&mut shared_chunks, site.region)
                .write_u32((site.offset + reloc.offset) as usize, value);
        }

        let hardware = descriptor.property("hardware") == Some("true");

        let ComponentDescriptor {
            name,
            class,
            version: _,
            min_stack,
            lifecycle,
            segments,
            relocs,
            attributes,
            properties,
            requires,
            provides,
            interned,
        } = descriptor;

        debug!(
            "template {:?} resident on core {} ({} regions, {} shared)",
            name,
            core.0,
            plan.regions.len(),
            shared_chunks.iter().filter(|c| c.is_some()).count()
        );

        Ok(Template {
            name,
            core,
            class,
            min_stack,
            lifecycle,
            segments,
            plan,
            shared_chunks,
            relocs,
            attributes,
            properties,
            requires,
            provides,
            interned,
            hardware,
            instances: 0,
            singleton: None,
        })
    }

    /// Drop residency: release interned interfaces and free shared memory.
    /// Callers only unload templates with no live instances.
    pub fn unload<A: DspAllocator>(self, allocator: &A, registry: &mut InterfaceRegistry) {
        debug_assert_eq!(self.instances, 0);
        debug!("template {:?} unloaded from core {}", self.name, self.core.0);
        for desc in &self.interned {
            registry.release(desc);
        }
        free_chunks(allocator, self.shared_chunks);
    }

    pub fn is_singleton(&self) -> bool {
        self.class == CompClass::Singleton
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn find_attribute(&self, name: &str) -> Option<MemoryRef> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.addr)
    }

    pub fn find_require(&self, name: &str) -> Option<usize> {
        self.requires.iter().position(|r| r.name == name)
    }

    pub fn find_provide(&self, name: &str) -> Option<usize> {
        self.provides.iter().position(|p| p.name == name)
    }

    /// DSP address of a lifecycle entry, if the image has one.
    pub fn lifecycle_entry(&self, kind: ServiceKind) -> Option<u32> {
        let addr = match kind {
            ServiceKind::Construct => self.lifecycle.construct,
            ServiceKind::Start => self.lifecycle.start,
            ServiceKind::Stop => self.lifecycle.stop,
            ServiceKind::Destroy => self.lifecycle.destroy,
        };
        self.resolve_code_addr(addr)
    }

    /// DSP address of a code reference. Code lives in shared regions (or,
    /// for firmware, at fixed addresses), so the template can resolve it
    /// without any instance.
    pub fn resolve_code_addr(&self, addr: CodeAddr) -> Option<u32> {
        match addr {
            CodeAddr::Absent => None,
            CodeAddr::Absolute(a) => Some(a),
            CodeAddr::InSegment(mref) => Some(self.shared_dsp_addr(mref)),
        }
    }

    /// DSP address of a location in a shared segment.
    pub fn shared_dsp_addr(&self, mref: MemoryRef) -> u32 {
        let p = self.plan.placement(mref.segment as usize);
        chunk_base(&self.shared_chunks, p.region)
            .wrapping_add(p.offset)
            .wrapping_add(mref.offset)
    }
}

fn free_chunks<A: DspAllocator>(allocator: &A, chunks: Vec<Option<MemoryChunk>>) {
    for chunk in chunks.into_iter().flatten() {
        allocator.free(chunk);
    }
}

fn chunk_base(chunks: &[Option<MemoryChunk>], region: usize) -> u32 {
    match &chunks[region] {
        Some(c) => c.dsp_addr(),
        // The parser segregates shared and private sites and targets
        None => unreachable!("no chunk for region {}", region),
    }
}

fn chunk_mut(chunks: &mut [Option<MemoryChunk>], region: usize) -> &mut MemoryChunk {
    match &mut chunks[region] {
        Some(c) => c,
        None => unreachable!("no chunk for region {}", region),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    use cof::SegmentPurpose;
    use cof_builder::ImageBuilder;
    use mpc_platform::mock::{bank_base, MockAllocator};
    use mpc_platform::MemKind;

    use crate::parser::parse;

    fn load_one(img: &[u8], allocator: &MockAllocator) -> (Template, InterfaceRegistry) {
        let mut registry = InterfaceRegistry::new();
        let descriptor = parse(img, &mut registry).unwrap();
        let template = Template::load(
            descriptor,
            CoreId(0),
            DomainId(1),
            allocator,
            &mut registry,
        )
        .unwrap();
        (template, registry)
    }

    #[test]
    fn test_load_allocates_only_shared_regions() {
        let img = ImageBuilder::new("demo")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x1000,
                0x40,
                8,
                &[0xAA; 0x10],
            )
            .with_segment(
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x8000,
                0x20,
                8,
                &[],
            )
            .build();
        let allocator = MockAllocator::new();
        let (template, _reg) = load_one(&img, &allocator);

        assert_eq!(allocator.alloc_count(), 1);
        assert_eq!(template.plan.regions.len(), 2);
        assert!(template.shared_chunks[0].is_some());
        assert!(template.shared_chunks[1].is_none());

        // Payload seeded, tail cleared
        let text = template.shared_chunks[0].as_ref().unwrap();
        assert_eq!(text.read_u32(0), 0xAAAA_AAAA);
        assert_eq!(text.read_u32(0x10), 0);

        let dead = template;
        let mut reg = InterfaceRegistry::new();
        dead.unload(&allocator, &mut reg);
        assert_eq!(allocator.free_count(), 1);
    }

    #[test]
    fn test_shared_reloc_pass() {
        // .rodata word 0 points into .text with an addend
        let img = ImageBuilder::new("demo")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x1000,
                0x40,
                8,
                &[0; 0x40],
            )
            .with_segment(
                ".rodata",
                SegmentPurpose::Const,
                MemKind::SdramData,
                0x8000,
                0x10,
                8,
                &[0; 0x10],
            )
            .with_segment(
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x9000,
                0x10,
                8,
                &[0; 0x10],
            )
            .with_reloc(1, 0, 0, 0x24)
            .with_reloc(2, 1, 4, 0)
            .build();
        let allocator = MockAllocator::new();
        let (template, _reg) = load_one(&img, &allocator);

        let rodata = template.shared_chunks[1].as_ref().unwrap();
        assert_eq!(
            rodata.read_u32(0),
            bank_base(MemKind::SdramCode) + 0x24
        );
        // The private-site reloc was left for the instance pass
        assert_eq!(rodata.read_u32(4), 0);
        assert_eq!(
            template.relocs[1],
            crate::descriptor::RelocRecord {
                seg: 2,
                target: 1,
                offset: 4,
                addend: 0
            }
        );
    }

    #[test]
    fn test_load_failure_unwinds() {
        let img = ImageBuilder::new("big")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0,
                0x100,
                8,
                &[],
            )
            .with_segment(
                ".rodata",
                SegmentPurpose::Const,
                MemKind::SdramData,
                0x8000,
                0x4000,
                8,
                &[],
            )
            .with_interface("bus", &["read", "write"])
            .with_provide_abstract("bus", 0, cof::ProvideKind::VIRTUAL, 1)
            .build();
        // Second region cannot fit
        let allocator = MockAllocator::new().with_capacity(MemKind::SdramData, 0x1000);
        let mut registry = InterfaceRegistry::new();
        let descriptor = parse(&img, &mut registry).unwrap();
        assert_eq!(registry.len(), 1);

        let err = Template::load(
            descriptor,
            CoreId(0),
            DomainId(1),
            &allocator,
            &mut registry,
        )
        .unwrap_err();
        assert!(matches!(err, crate::CmError::OutOfMemory { .. }));
        assert_eq!(allocator.alloc_count(), allocator.free_count());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lifecycle_and_code_resolution() {
        let img = ImageBuilder::new("demo")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x1000,
                0x40,
                8,
                &vec![0u8; 0x40],
            )
            .with_construct(0x1010)
            .with_stop(0x1004)
            .build();
        let allocator = MockAllocator::new();
        let (template, _reg) = load_one(&img, &allocator);

        let base = bank_base(MemKind::SdramCode);
        assert_eq!(
            template.lifecycle_entry(ServiceKind::Construct),
            Some(base + 0x10)
        );
        assert_eq!(template.lifecycle_entry(ServiceKind::Stop), Some(base + 4));
        assert_eq!(template.lifecycle_entry(ServiceKind::Start), None);
    }

    #[test]
    fn test_hardware_property_flag() {
        let img = ImageBuilder::new("hw")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0,
                0x10,
                8,
                &[],
            )
            .with_property("hardware", "true")
            .build();
        let allocator = MockAllocator::new();
        let (template, _reg) = load_one(&img, &allocator);
        assert!(template.hardware);
        assert_eq!(template.property("hardware"), Some("true"));
    }
}
