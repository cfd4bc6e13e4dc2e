use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use gmi_core::MemoryAccess;

/// The levels in the AArch64 page-table hierarchy (4 KiB granule, 48-bit
/// virtual addresses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page Table Entry level - the lowest level, mapping 4 KiB pages.
    Pte,

    /// Page Middle Directory - can point to PTE tables or map 2 MiB blocks.
    Pmd,

    /// Page Upper Directory - can point to PMDs or map 1 GiB blocks.
    Pud,

    /// Page Global Directory - the top level of the 4-level hierarchy.
    Pgd,
}

impl PageTableLevel {
    /// Returns the next lower level in the page table hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pte => None,
            Self::Pmd => Some(Self::Pte),
            Self::Pud => Some(Self::Pmd),
            Self::Pgd => Some(Self::Pud),
        }
    }

    /// Returns the bit position of this level's index within a virtual
    /// address.
    pub fn va_shift(self) -> u64 {
        match self {
            Self::Pte => 12,
            Self::Pmd => 21,
            Self::Pud => 30,
            Self::Pgd => 39,
        }
    }

    /// Returns the size of the region spanned by a single entry at this
    /// level.
    pub fn entry_span(self) -> u64 {
        1 << self.va_shift()
    }

    /// Checks whether a block descriptor may terminate translation at this
    /// level.
    ///
    /// With the 4 KiB granule, blocks exist at the PUD (1 GiB) and PMD
    /// (2 MiB) levels only.
    pub fn supports_block(self) -> bool {
        matches!(self, Self::Pud | Self::Pmd)
    }

    /// Returns the mapped page size when translation terminates at this
    /// level, if it can.
    pub fn page_size(self) -> Option<PageSize> {
        match self {
            Self::Pte => Some(PageSize::Size4K),
            Self::Pmd => Some(PageSize::Size2M),
            Self::Pud => Some(PageSize::Size1G),
            Self::Pgd => None,
        }
    }
}

/// The size of a leaf mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PageSize {
    /// A 4 KiB page.
    Size4K,

    /// A 2 MiB block.
    Size2M,

    /// A 1 GiB block.
    Size1G,
}

impl PageSize {
    /// Returns the size in bytes.
    pub fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 0x1000,
            Self::Size2M => 0x20_0000,
            Self::Size1G => 0x4000_0000,
        }
    }
}

/// Classification of a descriptor at a given level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// The descriptor does not map anything.
    Invalid,

    /// A block descriptor terminating translation with a large page.
    Block,

    /// A table descriptor pointing to the next-level table.
    Table,

    /// A page descriptor at the PTE level.
    Page,
}

/// An AArch64 translation-table descriptor.
///
/// Bits [1:0] classify the descriptor: `0b01` is a block at the PUD and PMD
/// levels, `0b11` is a table above the PTE level and a page at it, anything
/// else is invalid. The output address occupies bits [47:12]; bits [63:48]
/// and [11:2] carry attributes.
#[repr(transparent)]
#[derive(
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Serialize,
    Deserialize,
)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    const OUTPUT_MASK: u64 = 0x0000_FFFF_FFFF_F000;
    const BLOCK_1G_MASK: u64 = 0x0000_FFFF_C000_0000;
    const BLOCK_2M_MASK: u64 = 0x0000_FFFF_FFE0_0000;

    /// Checks if the descriptor is valid (bit 0 set).
    pub fn valid(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the descriptor carries the table/page bit (bit 1).
    pub fn table_bit(self) -> bool {
        self.0 & 0b10 != 0
    }

    /// Classifies the descriptor at the given level.
    pub fn kind(self, level: PageTableLevel) -> DescriptorKind {
        match (self.0 & 0b11, level) {
            (0b11, PageTableLevel::Pte) => DescriptorKind::Page,
            (0b11, _) => DescriptorKind::Table,
            (0b01, level) if level.supports_block() => DescriptorKind::Block,
            _ => DescriptorKind::Invalid,
        }
    }

    /// Extracts the output address (bits [47:12]) of a table or page
    /// descriptor.
    pub fn output_address(self) -> u64 {
        self.0 & Self::OUTPUT_MASK
    }

    /// Assembles the physical address mapped for `va` when this descriptor
    /// terminates translation at `level`.
    pub fn mapped_address(self, level: PageTableLevel, va: u64) -> u64 {
        match level {
            PageTableLevel::Pud => (self.0 & Self::BLOCK_1G_MASK) | (va & 0x3FFF_FFFF),
            PageTableLevel::Pmd => (self.0 & Self::BLOCK_2M_MASK) | (va & 0x1F_FFFF),
            _ => self.output_address() | (va & 0xFFF),
        }
    }

    /// Checks the access flag (bit 10).
    pub fn access_flag(self) -> bool {
        (self.0 >> 10) & 1 != 0
    }

    /// Checks AP[1] (bit 6): the mapping is accessible from EL0.
    pub fn el0_accessible(self) -> bool {
        (self.0 >> 6) & 1 != 0
    }

    /// Checks AP[2] (bit 7): the mapping is read-only.
    pub fn read_only(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Checks the unprivileged execute-never bit (bit 54).
    pub fn uxn(self) -> bool {
        (self.0 >> 54) & 1 != 0
    }

    /// Checks the privileged execute-never bit (bit 53).
    pub fn pxn(self) -> bool {
        (self.0 >> 53) & 1 != 0
    }

    /// Checks the not-global bit (bit 11).
    pub fn not_global(self) -> bool {
        (self.0 >> 11) & 1 != 0
    }

    /// Returns the memory-attribute index (bits [4:2]).
    pub fn attr_index(self) -> u8 {
        ((self.0 >> 2) & 0b111) as u8
    }

    /// Returns the low attribute/flag bits [11:0].
    pub fn low_attributes(self) -> u16 {
        (self.0 & 0xFFF) as u16
    }

    /// Returns the high attribute bits [63:48].
    pub fn high_attributes(self) -> u16 {
        (self.0 >> 48) as u16
    }

    /// Decodes the EL0 (user) view of the mapping permissions.
    pub fn user_access(self) -> MemoryAccess {
        let mut access = MemoryAccess::default();

        if self.el0_accessible() {
            access |= MemoryAccess::R;

            if !self.read_only() {
                access |= MemoryAccess::W;
            }
        }

        if !self.uxn() {
            access |= MemoryAccess::X;
        }

        access
    }

    /// Decodes the EL1 (kernel) view of the mapping permissions.
    pub fn kernel_access(self) -> MemoryAccess {
        let mut access = MemoryAccess::R;

        if !self.read_only() {
            access |= MemoryAccess::W;
        }

        if !self.pxn() {
            access |= MemoryAccess::X;
        }

        access
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("raw", &format_args!("{:#018x}", self.0))
            .field("valid", &self.valid())
            .field("table_bit", &self.table_bit())
            .field("output_address", &format_args!("{:#x}", self.output_address()))
            .field("access_flag", &self.access_flag())
            .field("el0_accessible", &self.el0_accessible())
            .field("read_only", &self.read_only())
            .field("uxn", &self.uxn())
            .field("pxn", &self.pxn())
            .finish()
    }
}
