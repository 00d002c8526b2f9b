//! Flag sets of the interface tables.

use bitflags::bitflags;

bitflags! {
    /// Flags on a required interface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequireKind: u32 {
        /// Resolved at link time; the image carries no runtime slot.
        const STATIC = 1 << 0;
        /// May remain unbound when the component starts.
        const OPTIONAL = 1 << 1;
        /// Dispatched through the component's own vtable, not a patch cell.
        const VIRTUAL = 1 << 2;
        /// Satisfied by the execution environment, never by a peer binding.
        const INTRINSIC = 1 << 3;
    }
}

impl RequireKind {
    pub fn is_static(self) -> bool {
        self.contains(RequireKind::STATIC)
    }

    pub fn is_optional(self) -> bool {
        self.contains(RequireKind::OPTIONAL)
    }

    pub fn is_virtual(self) -> bool {
        self.contains(RequireKind::VIRTUAL)
    }

    pub fn is_intrinsic(self) -> bool {
        self.contains(RequireKind::INTRINSIC)
    }

    /// Whether the image carries patch-site cells for this require.
    pub fn has_patch_sites(self) -> bool {
        !self.intersects(RequireKind::STATIC | RequireKind::VIRTUAL)
    }

    /// Whether start demands the slot be bound.
    pub fn must_bind_before_start(self) -> bool {
        self.has_patch_sites() && !self.is_optional() && !self.is_intrinsic()
    }
}

bitflags! {
    /// Flags on a provided interface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProvideKind: u32 {
        /// Reached through the component's vtable.
        const VIRTUAL = 1 << 0;
        /// First method is an interrupt handler; the entry names the line.
        const INTERRUPT = 1 << 1;
    }
}

impl ProvideKind {
    pub fn is_virtual(self) -> bool {
        self.contains(ProvideKind::VIRTUAL)
    }

    pub fn is_interrupt(self) -> bool {
        self.contains(ProvideKind::INTERRUPT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_predicates() {
        let plain = RequireKind::empty();
        assert!(plain.has_patch_sites());
        assert!(plain.must_bind_before_start());

        let optional = RequireKind::OPTIONAL;
        assert!(optional.is_optional());
        assert!(optional.has_patch_sites());
        assert!(!optional.must_bind_before_start());

        let virt = RequireKind::VIRTUAL;
        assert!(virt.is_virtual());
        assert!(!virt.has_patch_sites());
        assert!(!virt.must_bind_before_start());

        let stat = RequireKind::STATIC;
        assert!(stat.is_static());
        assert!(!stat.has_patch_sites());

        let intrinsic = RequireKind::INTRINSIC;
        assert!(intrinsic.is_intrinsic());
        assert!(intrinsic.has_patch_sites());
        assert!(!intrinsic.must_bind_before_start());
    }

    #[test]
    fn test_provide_predicates() {
        assert!(ProvideKind::INTERRUPT.is_interrupt());
        assert!(ProvideKind::VIRTUAL.is_virtual());
        assert!(!ProvideKind::empty().is_interrupt());
    }

    #[test]
    fn test_unknown_bits_are_rejected() {
        assert!(RequireKind::from_bits(1 << 7).is_none());
        assert!(ProvideKind::from_bits(1 << 5).is_none());
        assert_eq!(
            RequireKind::from_bits(0b0011),
            Some(RequireKind::STATIC | RequireKind::OPTIONAL)
        );
    }
}
