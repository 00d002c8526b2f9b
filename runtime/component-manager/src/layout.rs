//! Region planning.
//!
//! Segments do not get one coprocessor allocation each. All segments on the
//! same sharing side that live in the same memory bank are packed into one
//! region, and the region is what gets allocated: shared regions once per
//! template, private regions once per instance. The plan records the region
//! list and where each segment landed inside its region, so the same plan
//! drives both allocation passes and every later address lookup.

use alloc::vec::Vec;

use mpc_platform::{checked_align_up, MemKind};

use crate::descriptor::SegmentRecord;
use crate::parser::ParseError;

/// One region to allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
    pub mem: MemKind,
    pub shared: bool,
    pub size: u32,
    pub align: u32,
}

/// Where a segment sits inside its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub region: usize,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPlan {
    pub regions: Vec<RegionSpec>,
    /// Indexed like the segment table.
    pub placements: Vec<Placement>,
}

impl RegionPlan {
    /// Region backing the instance "this" pointer, when one exists.
    pub fn first_private_region(&self) -> Option<usize> {
        self.regions.iter().position(|r| !r.shared)
    }

    pub fn placement(&self, segment: usize) -> Placement {
        self.placements[segment]
    }
}

/// Pack segments into regions, in segment-table order.
///
/// Fails when a region would outgrow the 32-bit address space. Alignments
/// are only bounded below, so a well-formed image can still request that.
pub fn plan_regions(segments: &[SegmentRecord]) -> Result<RegionPlan, ParseError> {
    let mut regions: Vec<RegionSpec> = Vec::new();
    let mut placements = Vec::new();

    for (index, seg) in segments.iter().enumerate() {
        let shared = seg.purpose.is_shared();
        let region = match regions
            .iter()
            .position(|r| r.mem == seg.mem && r.shared == shared)
        {
            Some(i) => i,
            None => {
                regions.push(RegionSpec {
                    mem: seg.mem,
                    shared,
                    size: 0,
                    align: 4,
                });
                regions.len() - 1
            }
        };

        let r = &mut regions[region];
        let offset =
            checked_align_up(r.size, seg.align).ok_or(ParseError::RegionOverflow { index })?;
        r.size = offset
            .checked_add(seg.size)
            .ok_or(ParseError::RegionOverflow { index })?;
        r.align = r.align.max(seg.align);
        placements.push(Placement { region, offset });
    }

    Ok(RegionPlan {
        regions,
        placements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::vec;

    use cof::SegmentPurpose;

    fn seg(purpose: SegmentPurpose, mem: MemKind, size: u32, align: u32) -> SegmentRecord {
        SegmentRecord {
            name: String::from("s"),
            purpose,
            mem,
            vaddr: 0,
            size,
            align,
            payload: vec![],
        }
    }

    #[test]
    fn test_groups_by_bank_and_side() {
        let segs = [
            seg(SegmentPurpose::Code, MemKind::SdramCode, 0x100, 8),
            seg(SegmentPurpose::Const, MemKind::SdramData, 0x40, 4),
            seg(SegmentPurpose::Data, MemKind::SdramData, 0x80, 4),
            seg(SegmentPurpose::Code, MemKind::EsramCode, 0x20, 16),
        ];
        // vaddrs irrelevant here; planning looks only at size/align/kind
        let plan = plan_regions(&segs).unwrap();

        assert_eq!(plan.regions.len(), 3);
        assert!(plan.regions[0].shared);
        assert!(plan.regions[1].shared); // Const side shares the data bank
        assert!(!plan.regions[2].shared);
        assert_eq!(plan.placements[2].region, 2);
        assert_eq!(plan.first_private_region(), Some(2));
    }

    #[test]
    fn test_packs_in_order_with_alignment() {
        let segs = [
            seg(SegmentPurpose::Data, MemKind::SdramData, 0x30, 4),
            seg(SegmentPurpose::Data, MemKind::SdramData, 0x10, 64),
            seg(SegmentPurpose::Data, MemKind::SdramData, 0x08, 4),
        ];
        let plan = plan_regions(&segs).unwrap();

        assert_eq!(plan.regions.len(), 1);
        assert_eq!(plan.placement(0).offset, 0);
        assert_eq!(plan.placement(1).offset, 0x40);
        assert_eq!(plan.placement(2).offset, 0x50);
        assert_eq!(plan.regions[0].size, 0x58);
        assert_eq!(plan.regions[0].align, 64);
    }

    #[test]
    fn test_no_private_region_without_data() {
        let segs = [seg(SegmentPurpose::Code, MemKind::SdramCode, 0x100, 8)];
        let plan = plan_regions(&segs).unwrap();
        assert_eq!(plan.first_private_region(), None);
    }

    #[test]
    fn test_region_growth_is_checked() {
        // Alignment rounding runs past the address space
        let by_align = [
            seg(SegmentPurpose::Data, MemKind::SdramData, 0x10, 0x8000_0000),
            seg(SegmentPurpose::Data, MemKind::SdramData, 0x10, 0x8000_0000),
            seg(SegmentPurpose::Data, MemKind::SdramData, 0x10, 0x8000_0000),
        ];
        assert_eq!(
            plan_regions(&by_align).unwrap_err(),
            ParseError::RegionOverflow { index: 2 }
        );

        // Accumulated sizes run past the address space
        let by_size = [
            seg(SegmentPurpose::Data, MemKind::SdramData, 0x8000_0000, 4),
            seg(SegmentPurpose::Data, MemKind::SdramData, 0x8000_0000, 4),
        ];
        assert_eq!(
            plan_regions(&by_size).unwrap_err(),
            ParseError::RegionOverflow { index: 1 }
        );
    }
}
