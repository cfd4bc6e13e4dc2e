//! XArray traversal for page-cache address spaces.
//!
//! The page cache indexes cached pages in an xarray. Entries tag their low
//! two bits: `10` marks an internal (node) pointer when the value is above
//! 4096, anything else non-zero in a leaf slot is a page pointer. Only the
//! occupancy is of interest here; page struct pointers are opaque.

use std::collections::HashSet;

use gmi_core::{Architecture as _, GmiCore, ImageDriver, Pa, Va};

use gmi_arch_aarch64::Aarch64;

use crate::offsets::Offsets;

/// Nodes deeper than this are cut off; an xarray over a file of sane size
/// is at most a handful of levels deep.
const MAX_DEPTH: usize = 8;

/// Result of walking one address space's xarray.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct XarrayWalk {
    /// Occupied leaf slots (cached pages) reached.
    pub pages: u64,

    /// Nodes visited.
    pub nodes: u64,

    /// Whether a depth or cycle guard cut the walk short.
    pub truncated: bool,
}

const fn xa_is_internal(entry: u64) -> bool {
    entry & 0b11 == 0b10
}

const fn xa_is_node(entry: u64) -> bool {
    xa_is_internal(entry) && entry > 4096
}

const fn xa_to_node(entry: u64) -> Va {
    Va(entry - 2)
}

/// Counts the cached pages reachable from the xarray of the address space
/// at `mapping` (a kernel virtual address).
pub fn count_cached_pages<Driver>(
    gmi: &GmiCore<Driver>,
    offsets: &Offsets,
    kernel_pgd: Pa,
    mapping: Va,
) -> XarrayWalk
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    let mut walk = XarrayWalk::default();

    let head = mapping + offsets.address_space.i_pages + offsets.xarray.xa_head;
    let Ok(entry) = gmi.read_u64((head, kernel_pgd)) else {
        return walk;
    };

    if entry == 0 {
        return walk;
    }

    if !xa_is_node(entry) {
        // A single page stored directly in the head slot.
        if !xa_is_internal(entry) {
            walk.pages = 1;
        }
        return walk;
    }

    let mut visited = HashSet::new();
    walk_node(gmi, offsets, kernel_pgd, entry, 0, &mut visited, &mut walk);

    walk
}

fn walk_node<Driver>(
    gmi: &GmiCore<Driver>,
    offsets: &Offsets,
    kernel_pgd: Pa,
    entry: u64,
    depth: usize,
    visited: &mut HashSet<Pa>,
    walk: &mut XarrayWalk,
) where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    if depth > MAX_DEPTH {
        walk.truncated = true;
        return;
    }

    let node_va = xa_to_node(entry);
    if !Aarch64::is_kernel_va(node_va) {
        return;
    }

    let Ok(node) = gmi.translate_address((node_va, kernel_pgd)) else {
        return;
    };

    if !visited.insert(node) {
        walk.truncated = true;
        return;
    }

    walk.nodes += 1;

    for i in 0..offsets.xarray.slot_count as u64 {
        // Node payloads can cross a page; read slot by slot through the
        // translated VA instead of assuming physical contiguity.
        let Ok(slot) = gmi.read_u64((node_va + offsets.xarray.slots + i * 8, kernel_pgd)) else {
            continue;
        };

        if slot == 0 {
            continue;
        }

        if xa_is_node(slot) {
            walk_node(gmi, offsets, kernel_pgd, slot, depth + 1, visited, walk);
        } else if !xa_is_internal(slot) {
            walk.pages += 1;
        }
    }
}
