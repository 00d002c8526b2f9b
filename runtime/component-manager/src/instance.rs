//! Component instances.
//!
//! An instance layers a private region set over its template's shared
//! regions. Building one is a pure host-side affair until the construct
//! call: allocate and seed the private regions, run the instance
//! relocation pass, poison the require call-site cells. The manager owns
//! the fallible orchestration around this and unwinds it step by step.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use mpc_platform::{CoreId, DomainId, DspAllocator, Handle, MemoryChunk, Priority};

use crate::binding::Binding;
use crate::descriptor::MemoryRef;
use crate::lifecycle::State;
use crate::template::Template;
use crate::{ClientId, Result, UNBOUND_WORD};

/// Per-client bookkeeping for singleton multiplexing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounters {
    pub instances: u32,
    pub starts: u32,
    pub binds: u32,
}

pub struct ComponentInstance {
    pub template: Handle,
    pub label: String,
    pub domain: DomainId,
    pub core: CoreId,
    pub priority: Priority,
    pub state: State,
    /// DSP base of the first private region; the component's self pointer.
    pub this: u32,
    /// Indexed by region; `None` for shared regions.
    pub private_chunks: Vec<Option<MemoryChunk>>,
    /// Mirrors the requires shape: one slot per collection member.
    pub bindings: Vec<Vec<Option<Binding>>>,
    /// Remote bindings currently targeting one of our provides.
    pub provided_refs: u32,
    /// Interrupt lines routed to this instance.
    pub irq_lines: Vec<u32>,
    pub hw_on: bool,
    /// Instantiation references; above 1 only for singletons.
    pub refs: u32,
    pub clients: BTreeMap<ClientId, ClientCounters>,
}

impl ComponentInstance {
    /// Allocate and seed the private regions of `template`.
    ///
    /// Regions come back zeroed with their payload seeds copied in. On
    /// allocation failure everything already allocated here is freed.
    pub fn build_regions<A: DspAllocator>(
        template: &Template,
        domain: DomainId,
        allocator: &A,
    ) -> Result<Vec<Option<MemoryChunk>>> {
        let plan = &template.plan;
        let mut chunks: Vec<Option<MemoryChunk>> =
            (0..plan.regions.len()).map(|_| None).collect();

        for (index, region) in plan.regions.iter().enumerate() {
            if region.shared {
                continue;
            }
            match allocator.alloc(domain, region.mem, region.size as usize, region.align, true) {
                Ok(chunk) => chunks[index] = Some(chunk),
                Err(e) => {
                    for chunk in chunks.into_iter().flatten() {
                        allocator.free(chunk);
                    }
                    return Err(e.into());
                }
            }
        }

        for (index, seg) in template.segments.iter().enumerate() {
            let p = plan.placement(index);
            if plan.regions[p.region].shared || seg.payload.is_empty() {
                continue;
            }
            match &mut chunks[p.region] {
                Some(chunk) => chunk.write_bytes(p.offset as usize, &seg.payload),
                None => unreachable!("private region without a chunk"),
            }
        }

        Ok(chunks)
    }

    /// Assemble the instance around its freshly built regions and count the
    /// creating client.
    pub fn assemble(
        template_handle: Handle,
        template: &Template,
        domain: DomainId,
        priority: Priority,
        label: &str,
        private_chunks: Vec<Option<MemoryChunk>>,
        client: ClientId,
    ) -> Self {
        let this = template
            .plan
            .first_private_region()
            .and_then(|region| private_chunks[region].as_ref())
            .map(|chunk| chunk.dsp_addr())
            .unwrap_or(0);

        let bindings = template
            .requires
            .iter()
            .map(|req| (0..req.collection).map(|_| None).collect())
            .collect();

        let mut clients = BTreeMap::new();
        clients.insert(
            client,
            ClientCounters {
                instances: 1,
                ..ClientCounters::default()
            },
        );

        Self {
            template: template_handle,
            label: String::from(label),
            domain,
            core: template.core,
            priority,
            state: State::Idle,
            this,
            private_chunks,
            bindings,
            provided_refs: 0,
            irq_lines: Vec::new(),
            hw_on: false,
            refs: 1,
            clients,
        }
    }

    /// Relocation pass over private sites; shared sites were done when the
    /// template went resident.
    pub fn apply_instance_relocs(&mut self, template: &Template) {
        for reloc in &template.relocs {
            let site = template.plan.placement(reloc.seg as usize);
            if template.plan.regions[site.region].shared {
                continue;
            }
            let target = template.plan.placement(reloc.target as usize);
            let value = self
                .region_base(template, target.region)
                .wrapping_add(target.offset)
                .wrapping_add(reloc.addend);
            match &mut self.private_chunks[site.region] {
                Some(chunk) => {
                    chunk.write_u32((site.offset + reloc.offset) as usize, value);
                }
                None => unreachable!("private region without a chunk"),
            }
        }
    }

    /// Write the unbound pattern into every patchable require cell: the
    /// "this" word points back at the instance itself, the method words
    /// fault on call.
    pub fn poison_all_sites(&mut self, template: &Template) {
        for require_index in 0..template.requires.len() {
            for member in 0..template.requires[require_index].sites.len() {
                self.poison_cell(template, require_index, member);
            }
        }
    }

    /// Restore one collection member's cells to the unbound pattern.
    pub fn poison_cell(&mut self, template: &Template, require_index: usize, member: usize) {
        let req = &template.requires[require_index];
        let methods = req.descriptor.method_count();
        let this = self.this;
        for &cell in &req.sites[member] {
            self.write_word(template, cell, this);
            for k in 1..=methods {
                let word = MemoryRef {
                    segment: cell.segment,
                    offset: cell.offset + 4 * k as u32,
                };
                self.write_word(template, word, UNBOUND_WORD);
            }
        }
    }

    /// DSP base address of a region, shared or private.
    pub fn region_base(&self, template: &Template, region: usize) -> u32 {
        if template.plan.regions[region].shared {
            match &template.shared_chunks[region] {
                Some(chunk) => chunk.dsp_addr(),
                None => unreachable!("shared region without a chunk"),
            }
        } else {
            match &self.private_chunks[region] {
                Some(chunk) => chunk.dsp_addr(),
                None => unreachable!("private region without a chunk"),
            }
        }
    }

    /// Host-side read of one word, wherever the segment landed.
    pub fn read_word(&self, template: &Template, mref: MemoryRef) -> u32 {
        let p = template.plan.placement(mref.segment as usize);
        let offset = (p.offset + mref.offset) as usize;
        if template.plan.regions[p.region].shared {
            match &template.shared_chunks[p.region] {
                Some(chunk) => chunk.read_u32(offset),
                None => unreachable!("shared region without a chunk"),
            }
        } else {
            match &self.private_chunks[p.region] {
                Some(chunk) => chunk.read_u32(offset),
                None => unreachable!("private region without a chunk"),
            }
        }
    }

    /// Host-side write of one word. Patchable words live in private
    /// segments only.
    pub fn write_word(&mut self, template: &Template, mref: MemoryRef, value: u32) {
        let p = template.plan.placement(mref.segment as usize);
        debug_assert!(!template.plan.regions[p.region].shared);
        match &mut self.private_chunks[p.region] {
            Some(chunk) => chunk.write_u32((p.offset + mref.offset) as usize, value),
            None => unreachable!("private region without a chunk"),
        }
    }

    /// Counters for `client`, created lazily at zero.
    pub fn client_mut(&mut self, client: ClientId) -> &mut ClientCounters {
        self.clients.entry(client).or_default()
    }

    /// Aggregate start count across every client.
    pub fn total_starts(&self) -> u32 {
        self.clients.values().map(|c| c.starts).sum()
    }

    /// Populated slots among this instance's own requires.
    pub fn bound_slots(&self) -> usize {
        self.bindings
            .iter()
            .flat_map(|slots| slots.iter())
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Free the private regions. The caller has already handled interrupt
    /// routing and table removal.
    pub fn release<A: DspAllocator>(self, allocator: &A) {
        for chunk in self.private_chunks.into_iter().flatten() {
            allocator.free(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    use cof::SegmentPurpose;
    use cof_builder::ImageBuilder;
    use mpc_platform::mock::{bank_base, MockAllocator};
    use mpc_platform::{HandleTable, MemKind};

    use crate::parser::parse;
    use crate::registry::InterfaceRegistry;

    fn template_for(img: &[u8], allocator: &MockAllocator) -> Template {
        let mut registry = InterfaceRegistry::new();
        let descriptor = parse(img, &mut registry).unwrap();
        Template::load(descriptor, CoreId(0), DomainId(1), allocator, &mut registry).unwrap()
    }

    fn dummy_handle() -> Handle {
        let mut table: HandleTable<u8> = HandleTable::new(1);
        table.insert(0).unwrap()
    }

    fn assemble(template: &Template, allocator: &MockAllocator) -> ComponentInstance {
        let chunks =
            ComponentInstance::build_regions(template, DomainId(1), allocator).unwrap();
        let mut instance = ComponentInstance::assemble(
            dummy_handle(),
            template,
            DomainId(1),
            Priority::Normal,
            "t",
            chunks,
            ClientId(1),
        );
        instance.apply_instance_relocs(template);
        instance.poison_all_sites(template);
        instance
    }

    #[test]
    fn test_this_is_first_private_region_base() {
        let img = ImageBuilder::new("demo")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x1000,
                0x20,
                8,
                &[0; 0x20],
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
        let template = template_for(&img, &allocator);
        let instance = assemble(&template, &allocator);

        assert_eq!(instance.this, bank_base(MemKind::SdramData));
        assert_eq!(allocator.alloc_count(), 2); // one shared, one private
    }

    #[test]
    fn test_code_only_instance_has_zero_this() {
        let img = ImageBuilder::new("demo")
            .with_segment(
                ".text",
                SegmentPurpose::Code,
                MemKind::SdramCode,
                0x1000,
                0x20,
                8,
                &[0; 0x20],
            )
            .build();
        let allocator = MockAllocator::new();
        let template = template_for(&img, &allocator);
        let instance = assemble(&template, &allocator);
        assert_eq!(instance.this, 0);
        assert!(instance.private_chunks.iter().all(|c| c.is_none()));
    }

    #[test]
    fn test_instance_reloc_pass_targets_both_sides() {
        // .data word 0 -> .text+0x10, .data word 4 -> .data+0x18
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
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x8000,
                0x40,
                8,
                &vec![0u8; 0x40],
            )
            .with_reloc(1, 0, 0, 0x10)
            .with_reloc(1, 1, 4, 0x18)
            .build();
        let allocator = MockAllocator::new();
        let template = template_for(&img, &allocator);
        let instance = assemble(&template, &allocator);

        let data = instance.private_chunks[1].as_ref().unwrap();
        assert_eq!(data.read_u32(0), bank_base(MemKind::SdramCode) + 0x10);
        assert_eq!(data.read_u32(4), instance.this + 0x18);
    }

    #[test]
    fn test_poison_pattern() {
        let img = ImageBuilder::new("demo")
            .with_segment(
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x8000,
                0x40,
                8,
                &vec![0u8; 0x40],
            )
            .with_interface("fx.chain", &["push", "pull"])
            .with_require("next", 0, cof::RequireKind::empty(), &[&[0x8008]])
            .build();
        let allocator = MockAllocator::new();
        let template = template_for(&img, &allocator);
        let instance = assemble(&template, &allocator);

        let data = instance.private_chunks[0].as_ref().unwrap();
        assert_eq!(data.read_u32(0x08), instance.this);
        assert_eq!(data.read_u32(0x0C), UNBOUND_WORD);
        assert_eq!(data.read_u32(0x10), UNBOUND_WORD);
        // Neighbouring words untouched
        assert_eq!(data.read_u32(0x04), 0);
        assert_eq!(data.read_u32(0x14), 0);
    }

    #[test]
    fn test_build_regions_unwinds_on_exhaustion() {
        let img = ImageBuilder::new("demo")
            .with_segment(
                ".data",
                SegmentPurpose::Data,
                MemKind::SdramData,
                0x8000,
                0x400,
                8,
                &[],
            )
            .with_segment(
                ".heap",
                SegmentPurpose::Data,
                MemKind::EsramData,
                0x9000,
                0x4000,
                8,
                &[],
            )
            .build();
        let allocator = MockAllocator::new().with_capacity(MemKind::EsramData, 0x100);
        let template = template_for(&img, &allocator);
        let before_frees = allocator.free_count();

        let err = ComponentInstance::build_regions(&template, DomainId(1), &allocator)
            .unwrap_err();
        assert!(matches!(err, crate::CmError::OutOfMemory { .. }));
        // The SdramData chunk that did allocate was freed again
        assert_eq!(allocator.free_count(), before_frees + 1);
    }
}
