//! Exhaustive enumeration of leaf mappings reachable from a page directory.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use gmi_core::{GmiCore, ImageDriver, MemoryAccess, Pa, Va};

use super::{Aarch64, DescriptorKind, PageSize, PageTableEntry, PageTableLevel};

/// Which half of the address space a walk is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkScope {
    /// Walk a user process: kernel-half entries are skipped.
    User,

    /// Walk the kernel page directory: everything reachable is kept.
    Kernel,
}

/// Hard caps applied to a page-table walk.
///
/// A cap hit truncates the walk and is reported on the result; it is never
/// an error.
#[derive(Debug, Clone, Copy)]
pub struct WalkLimits {
    /// Maximum number of tables processed.
    pub max_tables: usize,

    /// Maximum number of tables queued at any time.
    pub max_queued: usize,
}

impl Default for WalkLimits {
    fn default() -> Self {
        Self {
            max_tables: 1000,
            max_queued: 5000,
        }
    }
}

/// A single leaf mapping produced by a page-table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafMapping {
    /// The mapped virtual address (aligned to `size`).
    pub va: Va,

    /// The backing physical address (aligned to `size`).
    pub pa: Pa,

    /// The mapping size.
    pub size: PageSize,

    /// The raw descriptor.
    pub entry: PageTableEntry,

    /// Decoded permissions, from the point of view of the walked scope.
    pub access: MemoryAccess,
}

/// The result of a page-table walk.
#[derive(Debug, Default)]
pub struct PageTableWalk {
    /// All valid leaf mappings, ordered by ascending virtual address.
    pub mappings: Vec<LeafMapping>,

    /// Number of tables read.
    pub tables_processed: usize,

    /// Number of non-empty descriptors dropped as invalid or out of RAM.
    pub garbage_entries: u64,

    /// Whether a cap cut the walk short.
    pub truncated: bool,
}

struct WorkItem {
    table: Pa,
    level: PageTableLevel,
    va_base: u64,
}

/// Enumerates every leaf mapping reachable from `root`.
///
/// The traversal is iterative with an explicit queue; visited tables are
/// deduplicated so self-referencing structures terminate, and the caps in
/// `limits` bound the worst case. Read misses and malformed descriptors are
/// absorbed into the garbage counter.
pub fn walk_tables<Driver>(
    gmi: &GmiCore<Driver>,
    root: Pa,
    scope: WalkScope,
    limits: &WalkLimits,
) -> PageTableWalk
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    let mut walk = PageTableWalk::default();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();

    queue.push_back(WorkItem {
        table: root,
        level: PageTableLevel::Pgd,
        va_base: 0,
    });

    while let Some(item) = queue.pop_front() {
        if !visited.insert(item.table) {
            continue;
        }

        if walk.tables_processed >= limits.max_tables {
            tracing::warn!(
                %root,
                max_tables = limits.max_tables,
                "page-table walk truncated"
            );
            walk.truncated = true;
            break;
        }
        walk.tables_processed += 1;

        let entries = match read_table(gmi, item.table) {
            Some(entries) => entries,
            None => {
                walk.garbage_entries += 1;
                continue;
            }
        };

        for (index, entry) in entries.iter().enumerate() {
            if entry.0 == 0 {
                continue;
            }

            let raw = item.va_base + ((index as u64) << item.level.va_shift());
            let kernel_half = raw & (1 << 47) != 0;

            if matches!(scope, WalkScope::User) && kernel_half {
                continue;
            }

            let va = Aarch64::va_from_raw48(raw);

            match entry.kind(item.level) {
                DescriptorKind::Invalid => walk.garbage_entries += 1,

                DescriptorKind::Block | DescriptorKind::Page => {
                    let size = item
                        .level
                        .page_size()
                        .expect("level with a terminal descriptor maps a page size");
                    let pa = Pa(entry.mapped_address(item.level, va.0));

                    if !gmi.contains(pa) {
                        walk.garbage_entries += 1;
                        continue;
                    }

                    walk.mappings.push(LeafMapping {
                        va,
                        pa,
                        size,
                        entry: *entry,
                        access: match scope {
                            WalkScope::User => entry.user_access(),
                            WalkScope::Kernel => entry.kernel_access(),
                        },
                    });
                }

                DescriptorKind::Table => {
                    let child = Pa(entry.output_address());

                    if !gmi.contains(child) {
                        walk.garbage_entries += 1;
                        continue;
                    }

                    if queue.len() >= limits.max_queued {
                        tracing::warn!(
                            %root,
                            max_queued = limits.max_queued,
                            "page-table queue full"
                        );
                        walk.truncated = true;
                        continue;
                    }

                    queue.push_back(WorkItem {
                        table: child,
                        level: item
                            .level
                            .next()
                            .expect("table descriptors only exist above the PTE level"),
                        va_base: raw,
                    });
                }
            }
        }
    }

    walk.mappings.sort_by_key(|mapping| mapping.va);

    walk
}

fn read_table<Driver>(gmi: &GmiCore<Driver>, table: Pa) -> Option<[PageTableEntry; 512]>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    use gmi_core::Architecture as _;
    use zerocopy::FromBytes;

    let page = gmi.read_page(Aarch64::gfn_from_pa(table)).ok()?;
    <[PageTableEntry; 512]>::read_from_bytes(&page[..0x1000.min(page.len())]).ok()
}
