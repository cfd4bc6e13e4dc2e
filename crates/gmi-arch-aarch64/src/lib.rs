//! AArch64 architecture definitions.
//!
//! Implements the 4 KiB granule, 48-bit VA, 4-level translation regime used
//! by the introspected guests. The authoritative path is the full table walk;
//! the kernel linear-map shortcut is kept as a fast path and is never
//! trusted over a successful walk.

mod paging;
mod translation;
mod walker;

use std::mem::size_of;

use gmi_core::{Architecture, Gfn, GmiCore, GmiError, ImageDriver, Pa, Va};
use zerocopy::FromBytes;

pub use self::{
    paging::{DescriptorKind, PageSize, PageTableEntry, PageTableLevel},
    translation::{TranslationEntries, TranslationEntry, VaTranslation},
    walker::{LeafMapping, PageTableWalk, WalkLimits, WalkScope, walk_tables},
};

/// AArch64 architecture.
#[derive(Debug)]
pub struct Aarch64;

impl Architecture for Aarch64 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFF_FFFF_FFFF_F000;

    fn gfn_from_pa(pa: Pa) -> Gfn {
        Gfn(pa.0 >> Self::PAGE_SHIFT)
    }

    fn pa_from_gfn(gfn: Gfn) -> Pa {
        Pa(gfn.0 << Self::PAGE_SHIFT)
    }

    fn pa_offset(pa: Pa) -> u64 {
        pa.0 & !Self::PAGE_MASK
    }

    fn is_kernel_va(va: Va) -> bool {
        va.0 >> 48 == 0xFFFF
    }

    fn translate_address<Driver>(gmi: &GmiCore<Driver>, va: Va, root: Pa) -> Result<Pa, GmiError>
    where
        Driver: ImageDriver<Architecture = Self>,
    {
        // The shortcut result is only accepted when it lands in guest RAM,
        // and even then the table walk wins whenever it succeeds.
        if let Some(shortcut) = Self::linear_map_shortcut(va) {
            if gmi.contains(shortcut) {
                return match Self::walk(gmi, va, root) {
                    Ok(pa) => {
                        if pa != shortcut {
                            tracing::debug!(
                                %va,
                                %shortcut,
                                %pa,
                                "linear-map shortcut disagrees with page-table walk"
                            );
                        }
                        Ok(pa)
                    }
                    Err(_) => Ok(shortcut),
                };
            }
        }

        Self::walk(gmi, va, root)
    }
}

impl Aarch64 {
    /// The exclusive upper bound of the user half of the address space.
    pub const USER_CEILING: u64 = 1 << 48;

    /// Extracts the table index of a virtual address at the given level.
    pub fn va_index_for(va: Va, level: PageTableLevel) -> u64 {
        (va.0 >> level.va_shift()) & 0x1FF
    }

    /// Returns the offset of a virtual address within its 4 KiB page.
    pub fn va_offset(va: Va) -> u64 {
        va.0 & !Self::PAGE_MASK
    }

    /// Checks whether a virtual address is canonical (bits [63:48] all zero
    /// or all one).
    pub fn va_canonical(va: Va) -> bool {
        matches!(va.0 >> 48, 0 | 0xFFFF)
    }

    /// Sign-extends a 48-bit address into a canonical virtual address.
    pub fn va_from_raw48(raw: u64) -> Va {
        if raw & (1 << 47) != 0 {
            Va(raw | 0xFFFF_0000_0000_0000)
        } else {
            Va(raw & (Self::USER_CEILING - 1))
        }
    }

    /// Removes the pointer-authentication code from a kernel data pointer.
    ///
    /// The observed kernels do not sign the pointers this crate reads
    /// (memory descriptors, file tables), so the strip is the identity.
    /// All PAC handling funnels through this one seam; an authenticated
    /// layout only needs to change it here.
    pub fn strip_pac(va: Va) -> Va {
        va
    }

    /// Resolves a kernel linear-map virtual address without a table walk.
    ///
    /// Applies only to addresses whose high 32 bits are `0xFFFF_0000`; the
    /// low 48 bits are then the physical address directly.
    pub fn linear_map_shortcut(va: Va) -> Option<Pa> {
        if (va.0 >> 32) as u32 == 0xFFFF_0000 {
            Some(Pa(va.0 & 0x0000_FFFF_FFFF_FFFF))
        } else {
            None
        }
    }

    /// Reads the `index`-th descriptor of the table at `table`.
    pub(crate) fn table_entry<Driver>(
        gmi: &GmiCore<Driver>,
        table: Pa,
        index: u64,
    ) -> Result<PageTableEntry, GmiError>
    where
        Driver: ImageDriver<Architecture = Self>,
    {
        let buffer = gmi.read_page(Self::gfn_from_pa(table))?;
        let table = <[PageTableEntry]>::ref_from_bytes(&buffer)
            .map_err(|_| GmiError::Other("short page"))?;

        Ok(table[index as usize])
    }

    /// Performs the full 4-level page-table walk.
    fn walk<Driver>(gmi: &GmiCore<Driver>, va: Va, root: Pa) -> Result<Pa, GmiError>
    where
        Driver: ImageDriver<Architecture = Self>,
    {
        let mut table = root;
        let mut level = PageTableLevel::Pgd;

        loop {
            if !gmi.contains(table) {
                return Err(GmiError::page_fault((va, root)));
            }

            let index = Self::va_index_for(va, level);
            let entry = Self::table_entry(gmi, table, index)?;

            match entry.kind(level) {
                DescriptorKind::Invalid => return Err(GmiError::page_fault((va, root))),
                DescriptorKind::Block | DescriptorKind::Page => {
                    return Ok(Pa(entry.mapped_address(level, va.0)));
                }
                DescriptorKind::Table => {
                    table = Pa(entry.output_address());
                    level = match level.next() {
                        Some(next) => next,
                        // A table descriptor cannot appear at the PTE level;
                        // kind() classified it as Page already.
                        None => return Err(GmiError::page_fault((va, root))),
                    };
                }
            }
        }
    }

    /// Performs a diagnostic page table walk, recording each descriptor
    /// traversed.
    ///
    /// If any step fails, the entries collected so far are returned with
    /// `None` as the physical address.
    pub fn translation<Driver>(gmi: &GmiCore<Driver>, va: Va, root: Pa) -> VaTranslation
    where
        Driver: ImageDriver<Architecture = Self>,
    {
        let mut entries = TranslationEntries::new();

        let mut table = root;
        let mut level = PageTableLevel::Pgd;

        loop {
            if !gmi.contains(table) {
                return VaTranslation { entries, pa: None };
            }

            let index = Self::va_index_for(va, level);
            let entry = match Self::table_entry(gmi, table, index) {
                Ok(entry) => entry,
                Err(_) => return VaTranslation { entries, pa: None },
            };

            entries.push(TranslationEntry {
                level,
                entry,
                entry_address: table + index * size_of::<PageTableEntry>() as u64,
            });

            match entry.kind(level) {
                DescriptorKind::Invalid => return VaTranslation { entries, pa: None },
                DescriptorKind::Block | DescriptorKind::Page => {
                    return VaTranslation {
                        entries,
                        pa: Some(Pa(entry.mapped_address(level, va.0))),
                    };
                }
                DescriptorKind::Table => {
                    table = Pa(entry.output_address());
                    level = match level.next() {
                        Some(next) => next,
                        None => return VaTranslation { entries, pa: None },
                    };
                }
            }
        }
    }
}
