//! Image driver trait.
//!
//! An image driver serves guest physical pages from some backing store:
//! a memory-mapped capture file, an in-memory buffer, or anything else that
//! can produce 4 KiB pages by guest frame number. Drivers are read-only;
//! the introspection pass never modifies the image.

use crate::{Architecture, Gfn, GmiError, MappedPage, Pa};

/// Describes the guest RAM covered by an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// Size of a guest page in bytes.
    pub page_size: u64,

    /// log2 of the page size.
    pub page_shift: u64,

    /// Guest physical address of the first byte of the image.
    pub ram_base: Pa,

    /// Number of bytes of guest RAM covered by the image.
    pub ram_size: u64,
}

impl ImageInfo {
    /// Checks whether a physical address lies within guest RAM.
    pub fn contains(&self, pa: Pa) -> bool {
        pa >= self.ram_base && pa.0 < self.ram_base.0 + self.ram_size
    }

    /// Checks whether a `len`-byte range starting at `pa` lies within guest
    /// RAM.
    pub fn contains_range(&self, pa: Pa, len: u64) -> bool {
        pa >= self.ram_base
            && pa.0.checked_add(len).is_some_and(|end| {
                end <= self.ram_base.0 + self.ram_size
            })
    }
}

/// A driver serving guest physical pages from a memory image.
///
/// The `'static` lifetime is required in order to use the driver with the
/// OS-level enumerators.
pub trait ImageDriver: 'static {
    /// The architecture the image was captured from.
    type Architecture: Architecture + ?Sized;

    /// Returns information about the captured guest RAM.
    fn info(&self) -> Result<ImageInfo, GmiError>;

    /// Reads a page of guest memory.
    ///
    /// Fails with [`GmiError::OutOfBounds`] when the frame lies outside the
    /// image; there are no partial reads.
    fn read_page(&self, gfn: Gfn) -> Result<MappedPage, GmiError>;
}
