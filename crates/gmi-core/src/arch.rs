//! Architecture abstraction.

use crate::{Gfn, GmiCore, GmiError, ImageDriver, Pa, Va};

/// A trait for architecture-specific address handling and translation.
pub trait Architecture {
    /// The size of a base page in bytes.
    const PAGE_SIZE: u64;

    /// log2 of the base page size.
    const PAGE_SHIFT: u64;

    /// Mask selecting the page-number bits of an address.
    const PAGE_MASK: u64;

    /// Converts a physical address to a guest frame number.
    fn gfn_from_pa(pa: Pa) -> Gfn;

    /// Converts a guest frame number to a physical address.
    fn pa_from_gfn(gfn: Gfn) -> Pa;

    /// Returns the offset of a physical address within its page.
    fn pa_offset(pa: Pa) -> u64;

    /// Checks whether a virtual address belongs to the kernel half of the
    /// address space.
    fn is_kernel_va(va: Va) -> bool;

    /// Translates a virtual address to a physical address by walking the
    /// page tables rooted at `root`.
    fn translate_address<Driver>(
        gmi: &GmiCore<Driver>,
        va: Va,
        root: Pa,
    ) -> Result<Pa, GmiError>
    where
        Driver: ImageDriver<Architecture = Self>;
}
