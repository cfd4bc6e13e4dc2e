use std::{fs::File, path::Path};

use memmap2::Mmap;

use gmi_core::{Gfn, GmiError, ImageDriver, ImageInfo, MappedPage, Pa};

use crate::Error;

/// Guest physical address of the first byte of RAM on the captured
/// machines (the QEMU/KVM `virt` board convention).
pub const DEFAULT_RAM_BASE: Pa = Pa(0x4000_0000);

const PAGE_SIZE: u64 = 0x1000;
const PAGE_SHIFT: u64 = 12;

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => mmap,
            Self::Owned(bytes) => bytes,
        }
    }
}

/// Image driver for a flat capture of guest RAM.
///
/// The file holds guest physical memory verbatim: its first byte is the
/// byte at the RAM base, with no header and no holes. The backing store is
/// memory-mapped, so pages are faulted in on demand.
pub struct RamImageDriver<Arch> {
    backing: Backing,
    ram_base: Pa,
    _marker: std::marker::PhantomData<Arch>,
}

impl<Arch> RamImageDriver<Arch> {
    /// Memory-maps a capture file, assuming the default RAM base.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::with_ram_base(path, DEFAULT_RAM_BASE)
    }

    /// Memory-maps a capture file with an explicit RAM base.
    pub fn with_ram_base(path: impl AsRef<Path>, ram_base: Pa) -> Result<Self, Error> {
        let file = File::open(path)?;

        // SAFETY: The mapping is read-only and the file is never written
        // through this process.
        let mmap = unsafe { Mmap::map(&file)? };

        if (mmap.len() as u64) < PAGE_SIZE {
            return Err(Error::ImageTooSmall);
        }

        Ok(Self {
            backing: Backing::Mapped(mmap),
            ram_base,
            _marker: std::marker::PhantomData,
        })
    }

    /// Wraps an in-memory capture.
    pub fn from_bytes(bytes: Vec<u8>, ram_base: Pa) -> Result<Self, Error> {
        if (bytes.len() as u64) < PAGE_SIZE {
            return Err(Error::ImageTooSmall);
        }

        Ok(Self {
            backing: Backing::Owned(bytes),
            ram_base,
            _marker: std::marker::PhantomData,
        })
    }

    fn len(&self) -> u64 {
        self.backing.bytes().len() as u64
    }
}

impl<Arch> ImageDriver for RamImageDriver<Arch>
where
    Arch: gmi_core::Architecture + 'static,
{
    type Architecture = Arch;

    fn info(&self) -> Result<ImageInfo, GmiError> {
        Ok(ImageInfo {
            page_size: PAGE_SIZE,
            page_shift: PAGE_SHIFT,
            ram_base: self.ram_base,
            ram_size: self.len(),
        })
    }

    fn read_page(&self, gfn: Gfn) -> Result<MappedPage, GmiError> {
        let pa = gfn.0 << PAGE_SHIFT;

        let start = pa
            .checked_sub(self.ram_base.0)
            .ok_or(GmiError::OutOfBounds)? as usize;
        let end = start.checked_add(PAGE_SIZE as usize).ok_or(GmiError::OutOfBounds)?;

        let bytes = self.backing.bytes();
        let page = bytes.get(start..end).ok_or(GmiError::OutOfBounds)?;

        Ok(MappedPage::copy_from(page))
    }
}

#[cfg(test)]
mod tests {
    use gmi_core::GmiCore;

    use super::*;

    struct TestArch;

    impl gmi_core::Architecture for TestArch {
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

        fn is_kernel_va(va: gmi_core::Va) -> bool {
            va.0 >> 48 == 0xFFFF
        }

        fn translate_address<Driver>(
            _gmi: &GmiCore<Driver>,
            _va: gmi_core::Va,
            _root: Pa,
        ) -> Result<Pa, GmiError>
        where
            Driver: ImageDriver<Architecture = Self>,
        {
            Err(GmiError::Other("unused"))
        }
    }

    #[test]
    fn serves_pages_relative_to_ram_base() {
        let mut bytes = vec![0u8; 0x3000];
        bytes[0x1004] = 0xAB;

        let driver =
            RamImageDriver::<TestArch>::from_bytes(bytes, DEFAULT_RAM_BASE).expect("driver");

        let page = driver
            .read_page(Gfn((DEFAULT_RAM_BASE.0 >> 12) + 1))
            .expect("page");
        assert_eq!(page[4], 0xAB);
    }

    #[test]
    fn rejects_frames_outside_the_image() {
        let driver = RamImageDriver::<TestArch>::from_bytes(vec![0u8; 0x2000], DEFAULT_RAM_BASE)
            .expect("driver");

        assert!(matches!(
            driver.read_page(Gfn(0)),
            Err(GmiError::OutOfBounds)
        ));
        assert!(matches!(
            driver.read_page(Gfn((DEFAULT_RAM_BASE.0 >> 12) + 2)),
            Err(GmiError::OutOfBounds)
        ));
    }

    #[test]
    fn rejects_tiny_images() {
        assert!(matches!(
            RamImageDriver::<TestArch>::from_bytes(vec![0u8; 16], DEFAULT_RAM_BASE),
            Err(Error::ImageTooSmall)
        ));
    }

    #[test]
    fn partial_trailing_page_is_a_miss() {
        let driver = RamImageDriver::<TestArch>::from_bytes(vec![0u8; 0x2800], DEFAULT_RAM_BASE)
            .expect("driver");

        assert!(driver.read_page(Gfn((DEFAULT_RAM_BASE.0 >> 12) + 1)).is_ok());
        assert!(driver.read_page(Gfn((DEFAULT_RAM_BASE.0 >> 12) + 2)).is_err());
    }
}
