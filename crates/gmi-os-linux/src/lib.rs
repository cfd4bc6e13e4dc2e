//! Linux guest structure discovery over a captured RAM image.
//!
//! Everything in this crate consumes untrusted bytes: process descriptors,
//! page directories, maple trees and page-cache structures are recognized
//! by shape, validated field by field, and cross-checked where two
//! independent paths exist. The entry point is [`Discovery`], which runs
//! the whole pass and produces a [`DiscoveryOutput`].

mod discovery;
mod error;
mod iter;
mod maple_tree;
pub mod offsets;
mod page_cache;
mod swapper;
mod task;
#[cfg(test)]
mod testutil;
mod vma;
mod xarray;

pub use self::{
    discovery::{
        Discovery, DiscoveryConfig, DiscoveryLimits, DiscoveryOutput, DiscoveryStats,
        TrustedPgdSource, KERNEL_PID,
    },
    error::LinuxError,
    iter::ListEntryIterator,
    maple_tree::{MapleTree, MapleWalk},
    offsets::Offsets,
    page_cache::{
        CachedFile, FilesystemInfo, PageCacheLimits, PageCacheSummary, PageCacheWalker,
    },
    swapper::{locate_kernel_pgd, validate_pgd_signature, SwapperPgd},
    task::{resolve_process_paging, scan_tasks, ProcessDescriptor, PID_MAX},
    vma::{read_vm_area, MemoryRegion, RegionKind, VmaFlags},
    xarray::{count_cached_pages, XarrayWalk},
};
