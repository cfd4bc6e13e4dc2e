//! Maple tree traversal over a captured image.
//!
//! The maple tree indexes a process's virtual memory areas. Node pointers
//! carry metadata in their low byte: bits [4:3] select the node layout and
//! masking the low 8 bits yields the node address (nodes are 256-byte
//! aligned, so a node never straddles a page). Every pointer is an
//! untrusted kernel VA and is translated through the kernel PGD before
//! use.
//!
//! # References
//!
//! - [Linux Kernel Source - maple_tree.h](https://elixir.bootlin.com/linux/v6.10.5/source/include/linux/maple_tree.h)
//! - [Maple Tree: Storing Ranges](https://blogs.oracle.com/linux/post/maple-tree-storing-ranges)

use std::collections::HashSet;

use gmi_core::{Architecture as _, GmiCore, GmiError, ImageDriver, Pa, Va};

use gmi_arch_aarch64::Aarch64;

use crate::offsets::{MapleNodeLayout, Offsets};

/// Represents different node types in a Maple Tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapleType {
    /// Dense nodes contain directly addressable slots.
    Dense,

    /// Leaf nodes.
    Leaf64,

    /// Range nodes.
    Range64,

    /// Allocation range nodes.
    Arange64,
}

/// Root slot values below this are tree states, not pointers.
const MAPLE_RESERVED_RANGE: u64 = 0x100;

/// The low byte of an encoded node pointer is metadata.
const MAPLE_NODE_MASK: u64 = 0xFF;

const fn mte_node_type(entry: u64) -> MapleType {
    match (entry >> 3) & 0x3 {
        0x0 => MapleType::Dense,
        0x1 => MapleType::Leaf64,
        0x2 => MapleType::Range64,
        _ => MapleType::Arange64,
    }
}

const fn mte_to_node(entry: u64) -> Va {
    Va(entry & !MAPLE_NODE_MASK)
}

const fn ma_is_leaf(typ: MapleType) -> bool {
    matches!(typ, MapleType::Dense | MapleType::Leaf64)
}

/// Counters describing one tree traversal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapleWalk {
    /// Nodes visited.
    pub nodes_visited: u64,

    /// Node pointers skipped because they were already visited.
    pub cycles: u64,

    /// Node or slot reads that missed.
    pub misses: u64,

    /// Whether the depth limit cut a branch short.
    pub truncated: bool,
}

/// A maple tree reader rooted in a process's memory descriptor.
pub struct MapleTree<'a, Driver>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    gmi: &'a GmiCore<Driver>,
    offsets: &'a Offsets,
    kernel_pgd: Pa,
    max_depth: usize,
}

impl<'a, Driver> MapleTree<'a, Driver>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    /// Creates a new maple tree reader.
    pub fn new(gmi: &'a GmiCore<Driver>, offsets: &'a Offsets, kernel_pgd: Pa) -> Self {
        Self {
            gmi,
            offsets,
            kernel_pgd,
            max_depth: 15,
        }
    }

    /// Overrides the recursion depth limit.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Enumerates the tree rooted at the slot stored at `root_slot`
    /// (typically `mm_struct.mm_mt.ma_root`), calling `callback` with
    /// every entry (VMA pointer) found.
    ///
    /// The callback returns `false` to stop the walk.
    pub fn enumerate(
        &self,
        root_slot: impl Into<gmi_core::AccessContext>,
        callback: &mut impl FnMut(Va) -> bool,
    ) -> Result<MapleWalk, GmiError> {
        let root_slot = root_slot.into();
        let mut walk = MapleWalk::default();

        let Ok(mut root) = self.gmi.read_u64(root_slot) else {
            walk.misses += 1;
            return Ok(walk);
        };

        if root < MAPLE_RESERVED_RANGE {
            match root {
                // Empty and none: definitely no entries.
                0x0 | 0x2 => return Ok(walk),

                // Pause, start, stop, active and friends describe an
                // in-flight operation; the root may settle, so it is read
                // one more time.
                state => {
                    root = self.gmi.read_u64(root_slot).unwrap_or(state);

                    if root < MAPLE_RESERVED_RANGE {
                        tracing::debug!(state = root, "maple root holds a tree state");
                        return Ok(walk);
                    }
                }
            }
        }

        let mut visited = HashSet::new();
        self.walk_node(root, 0, &mut visited, &mut walk, callback)?;

        Ok(walk)
    }

    /// Descends into one encoded node pointer. Returns `false` when the
    /// callback stopped the walk.
    fn walk_node(
        &self,
        entry: u64,
        depth: usize,
        visited: &mut HashSet<Pa>,
        walk: &mut MapleWalk,
        callback: &mut impl FnMut(Va) -> bool,
    ) -> Result<bool, GmiError> {
        let typ = mte_node_type(entry);
        let node_va = mte_to_node(entry);

        if !Aarch64::is_kernel_va(node_va) {
            walk.misses += 1;
            return Ok(true);
        }

        let Ok(node) = self.gmi.translate_address((node_va, self.kernel_pgd)) else {
            walk.misses += 1;
            return Ok(true);
        };

        if !visited.insert(node) {
            walk.cycles += 1;
            return Ok(true);
        }

        if depth > self.max_depth {
            tracing::warn!(depth, "maple tree deeper than the recursion limit");
            walk.truncated = true;
            return Ok(true);
        }

        walk.nodes_visited += 1;

        let layout = self.layout(typ);
        let leaf = ma_is_leaf(typ);

        for i in 0..layout.slot_count {
            // Pivots bound each slot's range; a zero pivot past the first
            // slot marks the end of the occupied part of the node. Dense
            // nodes have no pivots.
            if !matches!(typ, MapleType::Dense) && i > 0 && i < layout.slot_count - 1 {
                match self.node_u64(node, layout.pivots + (i as u64 - 1) * 8) {
                    Some(0) => break,
                    Some(_) => {}
                    None => {
                        walk.misses += 1;
                        break;
                    }
                }
            }

            let Some(slot) = self.node_u64(node, layout.slots + i as u64 * 8) else {
                walk.misses += 1;
                break;
            };

            if slot == 0 {
                continue;
            }

            if leaf {
                if Aarch64::is_kernel_va(Va(slot)) && !callback(Va(slot)) {
                    return Ok(false);
                }
            } else if Aarch64::is_kernel_va(mte_to_node(slot))
                && !self.walk_node(slot, depth + 1, visited, walk, callback)?
            {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn layout(&self, typ: MapleType) -> MapleNodeLayout {
        let maple = &self.offsets.maple;

        match typ {
            MapleType::Dense => maple.dense,
            MapleType::Leaf64 => maple.leaf64,
            MapleType::Range64 => maple.range64,
            MapleType::Arange64 => maple.arange64,
        }
    }

    /// Reads a u64 inside a node. Nodes are 256-byte aligned so the read
    /// never crosses a page.
    fn node_u64(&self, node: Pa, offset: u64) -> Option<u64> {
        self.gmi.read_u64(node + offset).ok()
    }
}
