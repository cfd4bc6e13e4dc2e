//! In-memory image construction for tests.

use std::collections::HashMap;

use gmi_core::{Gfn, GmiError, ImageDriver, ImageInfo, MappedPage, Pa};

/// A sparse guest-RAM image under construction.
///
/// Pages never written read back as zeros, which keeps multi-gigabyte test
/// layouts cheap.
pub(crate) struct MockImage {
    ram_base: u64,
    ram_size: u64,
    pages: HashMap<u64, Vec<u8>>,
}

impl MockImage {
    pub fn new(ram_base: u64, ram_size: u64) -> Self {
        Self {
            ram_base,
            ram_size,
            pages: HashMap::new(),
        }
    }

    pub fn write_bytes(&mut self, pa: u64, bytes: &[u8]) {
        let mut pa = pa;
        let mut remaining = bytes;

        while !remaining.is_empty() {
            let gfn = pa >> 12;
            let offset = (pa & 0xFFF) as usize;
            let span = remaining.len().min(0x1000 - offset);

            let page = self.pages.entry(gfn).or_insert_with(|| vec![0u8; 0x1000]);
            page[offset..offset + span].copy_from_slice(&remaining[..span]);

            pa += span as u64;
            remaining = &remaining[span..];
        }
    }

    pub fn write_u32(&mut self, pa: u64, value: u32) {
        self.write_bytes(pa, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, pa: u64, value: u64) {
        self.write_bytes(pa, &value.to_le_bytes());
    }

    pub fn write_cstr(&mut self, pa: u64, value: &str) {
        self.write_bytes(pa, value.as_bytes());
        self.write_bytes(pa + value.len() as u64, &[0]);
    }

    pub fn into_driver(self) -> MockImageDriver {
        MockImageDriver {
            ram_base: self.ram_base,
            ram_size: self.ram_size,
            pages: self.pages,
            zero: MappedPage::new(vec![0u8; 0x1000]),
        }
    }
}

pub(crate) struct MockImageDriver {
    ram_base: u64,
    ram_size: u64,
    pages: HashMap<u64, Vec<u8>>,
    zero: MappedPage,
}

impl ImageDriver for MockImageDriver {
    type Architecture = gmi_arch_aarch64::Aarch64;

    fn info(&self) -> Result<ImageInfo, GmiError> {
        Ok(ImageInfo {
            page_size: 0x1000,
            page_shift: 12,
            ram_base: Pa(self.ram_base),
            ram_size: self.ram_size,
        })
    }

    fn read_page(&self, gfn: Gfn) -> Result<MappedPage, GmiError> {
        let pa = gfn.0 << 12;
        if pa < self.ram_base || pa + 0x1000 > self.ram_base + self.ram_size {
            return Err(GmiError::OutOfBounds);
        }

        match self.pages.get(&gfn.0) {
            Some(page) => Ok(MappedPage::new(page.clone())),
            None => Ok(self.zero.clone()),
        }
    }
}
