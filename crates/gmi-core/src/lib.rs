//! Core functionality for offline guest-memory introspection.
//!
//! The entry point is [`GmiCore`], which wraps an [`ImageDriver`] and
//! provides translation-aware read helpers over the captured guest RAM.
//! Everything here is read-only: the image is never modified.

pub mod arch;
mod cancel;
mod core;
mod driver;
mod error;
mod page;

use std::{cell::RefCell, num::NonZeroUsize};

use lru::LruCache;
use zerocopy::{FromBytes, IntoBytes};

pub use self::{
    arch::Architecture,
    cancel::CancelToken,
    core::{AccessContext, AddressContext, Gfn, MemoryAccess, Pa, TranslationMechanism, Va},
    driver::{ImageDriver, ImageInfo},
    error::{GmiError, PageFaults},
    page::MappedPage,
};

struct Cache {
    gfn: RefCell<LruCache<Gfn, MappedPage>>,
    v2p: RefCell<LruCache<AccessContext, Pa>>,
}

impl Cache {
    const DEFAULT_SIZE: usize = 8192;

    fn new() -> Self {
        Self {
            gfn: RefCell::new(LruCache::new(
                NonZeroUsize::new(Self::DEFAULT_SIZE).unwrap(),
            )),
            v2p: RefCell::new(LruCache::new(
                NonZeroUsize::new(Self::DEFAULT_SIZE).unwrap(),
            )),
        }
    }
}

/// Translation-aware access to a guest-memory image.
///
/// `GmiCore` combines an image driver with a page cache and a
/// virtual-to-physical translation cache. All read helpers accept an
/// [`AccessContext`]: a bare [`Pa`] reads the image directly, a `(Va, Pa)`
/// pair walks the page tables rooted at the given physical address first.
pub struct GmiCore<Driver>
where
    Driver: ImageDriver,
{
    driver: Driver,
    info: ImageInfo,
    cache: Cache,
}

impl<Driver> GmiCore<Driver>
where
    Driver: ImageDriver,
{
    /// Creates a new `GmiCore` instance with the given driver.
    ///
    /// Both the GFN cache and the V2P cache are enabled by default, each
    /// with a capacity of 8192 entries.
    pub fn new(driver: Driver) -> Result<Self, GmiError> {
        let info = driver.info()?;

        if info.ram_size < info.page_size {
            return Err(GmiError::Other("image shorter than one page"));
        }

        Ok(Self {
            driver,
            info,
            cache: Cache::new(),
        })
    }

    /// Resizes the GFN cache.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn with_gfn_cache(self, size: usize) -> Self {
        Self {
            cache: Cache {
                gfn: RefCell::new(LruCache::new(NonZeroUsize::new(size).unwrap())),
                ..self.cache
            },
            ..self
        }
    }

    /// Resizes the V2P cache.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn with_v2p_cache(self, size: usize) -> Self {
        Self {
            cache: Cache {
                v2p: RefCell::new(LruCache::new(NonZeroUsize::new(size).unwrap())),
                ..self.cache
            },
            ..self
        }
    }

    /// Clears the V2P cache.
    pub fn flush_v2p_cache(&self) {
        self.cache.v2p.borrow_mut().clear();
    }

    /// Returns the driver used by this `GmiCore` instance.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Returns information about the captured guest RAM.
    pub fn info(&self) -> ImageInfo {
        self.info
    }

    /// Checks whether a physical address lies within guest RAM.
    pub fn contains(&self, pa: Pa) -> bool {
        self.info.contains(pa)
    }

    /// Reads memory from the image.
    ///
    /// The read crosses page boundaries transparently; with a paging
    /// context, every covered page is translated separately.
    pub fn read(&self, ctx: impl Into<AccessContext>, buffer: &mut [u8]) -> Result<(), GmiError> {
        let ctx = ctx.into();
        let mut position = 0usize;
        let mut remaining = buffer.len();

        while remaining > 0 {
            let address = self.translate_access_context(ctx + position as u64)?;
            let gfn = Driver::Architecture::gfn_from_pa(address);
            let offset = Driver::Architecture::pa_offset(address) as usize;

            let page = self.read_page(gfn)?;
            let page = &page[offset..];

            let size = std::cmp::min(remaining, page.len());
            buffer[position..position + size].copy_from_slice(&page[..size]);

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    /// Reads a single byte from the image.
    pub fn read_u8(&self, ctx: impl Into<AccessContext>) -> Result<u8, GmiError> {
        let mut buffer = [0u8; 1];
        self.read(ctx, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a 16-bit unsigned integer from the image.
    pub fn read_u16(&self, ctx: impl Into<AccessContext>) -> Result<u16, GmiError> {
        let mut buffer = [0u8; 2];
        self.read(ctx, &mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    /// Reads a 32-bit unsigned integer from the image.
    pub fn read_u32(&self, ctx: impl Into<AccessContext>) -> Result<u32, GmiError> {
        let mut buffer = [0u8; 4];
        self.read(ctx, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a 64-bit unsigned integer from the image.
    pub fn read_u64(&self, ctx: impl Into<AccessContext>) -> Result<u64, GmiError> {
        let mut buffer = [0u8; 8];
        self.read(ctx, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads a 64-bit virtual address from the image.
    pub fn read_va(&self, ctx: impl Into<AccessContext>) -> Result<Va, GmiError> {
        Ok(Va(self.read_u64(ctx)?))
    }

    /// Reads a 64-bit physical address from the image.
    pub fn read_pa(&self, ctx: impl Into<AccessContext>) -> Result<Pa, GmiError> {
        Ok(Pa(self.read_u64(ctx)?))
    }

    /// Reads a struct from the image.
    pub fn read_struct<T>(&self, ctx: impl Into<AccessContext>) -> Result<T, GmiError>
    where
        T: FromBytes + IntoBytes,
    {
        let mut result = T::new_zeroed();
        self.read(ctx, result.as_mut_bytes())?;
        Ok(result)
    }

    /// Reads a NUL-terminated string from the image with a length limit.
    ///
    /// Non-UTF-8 bytes are replaced; use [`read_cstring`] when the content
    /// must be validated.
    ///
    /// [`read_cstring`]: Self::read_cstring
    pub fn read_string_limited(
        &self,
        ctx: impl Into<AccessContext>,
        limit: usize,
    ) -> Result<String, GmiError> {
        match self.read_cstring_bytes(ctx.into(), limit)? {
            Some(bytes) => Ok(String::from_utf8_lossy(&bytes).into()),
            None => Ok(String::new()),
        }
    }

    /// Reads a printable-ASCII, NUL-terminated string from the image.
    ///
    /// Returns `None` when no terminator is found within `limit` bytes or
    /// when a non-printable byte precedes it.
    pub fn read_cstring(
        &self,
        ctx: impl Into<AccessContext>,
        limit: usize,
    ) -> Result<Option<String>, GmiError> {
        let bytes = match self.read_cstring_bytes(ctx.into(), limit)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        if bytes.iter().any(|&b| !(0x20..0x7F).contains(&b)) {
            return Ok(None);
        }

        // Printable ASCII is valid UTF-8.
        Ok(Some(String::from_utf8_lossy(&bytes).into()))
    }

    /// Reads bytes up to a NUL terminator. `None` when no terminator was
    /// found within `limit` bytes.
    fn read_cstring_bytes(
        &self,
        ctx: AccessContext,
        limit: usize,
    ) -> Result<Option<Vec<u8>>, GmiError> {
        let mut bytes = Vec::new();

        let mut offset = 0u64;
        while (offset as usize) < limit {
            // Read up to the next page boundary so a string that ends before
            // an unmapped page is still recovered.
            let address = ctx.address + offset;
            let span =
                Driver::Architecture::PAGE_SIZE - (address & !Driver::Architecture::PAGE_MASK);
            let span = std::cmp::min(span as usize, limit - offset as usize);

            let mut chunk = vec![0u8; span];
            self.read(ctx + offset, &mut chunk)?;

            match memchr::memchr(0, &chunk) {
                Some(position) => {
                    bytes.extend_from_slice(&chunk[..position]);
                    return Ok(Some(bytes));
                }
                None => bytes.extend_from_slice(&chunk),
            }

            offset += span as u64;
        }

        Ok(None)
    }

    /// Translates a virtual address to a physical address.
    pub fn translate_address(&self, ctx: impl Into<AddressContext>) -> Result<Pa, GmiError> {
        self.translate_access_context(AccessContext::from(ctx.into()))
    }

    /// Translates an access context to a physical address.
    pub fn translate_access_context(&self, ctx: AccessContext) -> Result<Pa, GmiError> {
        let root = match ctx.mechanism {
            TranslationMechanism::Direct => return Ok(Pa(ctx.address)),
            TranslationMechanism::Paging { root } => root,
        };

        let key = AccessContext {
            address: ctx.address & Driver::Architecture::PAGE_MASK,
            ..ctx
        };

        if let Some(pa) = self.cache.v2p.borrow_mut().get(&key) {
            return Ok(*pa + (ctx.address & !Driver::Architecture::PAGE_MASK));
        }

        let pa = Driver::Architecture::translate_address(self, Va(ctx.address), root)?;

        let page = Pa(pa.0 & Driver::Architecture::PAGE_MASK);
        self.cache.v2p.borrow_mut().put(key, page);

        Ok(pa)
    }

    /// Reads a page of guest memory, using the cache.
    pub fn read_page(&self, gfn: Gfn) -> Result<MappedPage, GmiError> {
        let mut cache = self.cache.gfn.borrow_mut();
        let value = cache.try_get_or_insert(gfn, || self.driver.read_page(gfn))?;
        Ok(value.clone())
    }
}
