//! The discovery driver.
//!
//! One pass over the image: locate the kernel PGD, scan for tasks, walk
//! each process's page tables and maple tree, walk the kernel page tables,
//! build the reverse page index, and catalog the page cache. Every
//! recoverable failure along the way degrades into a counter; the pass
//! itself only fails on cancellation or on a rejected trusted PGD with
//! fallback disabled.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use gmi_core::{CancelToken, GmiCore, GmiError, ImageDriver, Pa, Va};

use gmi_arch_aarch64::{walk_tables, Aarch64, LeafMapping, WalkLimits, WalkScope};

use crate::{
    error::LinuxError,
    maple_tree::MapleTree,
    offsets::Offsets,
    page_cache::{PageCacheLimits, PageCacheSummary, PageCacheWalker},
    swapper::{self, SwapperPgd},
    task::{self, ProcessDescriptor},
    vma::{self, MemoryRegion},
};

/// PID key under which kernel mappings are filed.
pub const KERNEL_PID: u32 = 0;

/// Bytes sampled when deciding whether a page is all-zero.
const ZERO_SAMPLE: usize = 256;

/// An external channel that can supply a hypervisor-trusted kernel PGD.
///
/// The source is consulted exactly once, before any CPU-bound work; a
/// failure is non-fatal and falls back to the heuristic locator.
pub trait TrustedPgdSource {
    /// Returns the physical address of the kernel PGD, or `None` when the
    /// channel has nothing to offer.
    fn fetch(&mut self) -> Result<Option<Pa>, GmiError>;
}

/// Hard caps applied across the pass.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryLimits {
    /// Page-table walk caps, applied per process and to the kernel walk.
    pub page_tables: WalkLimits,

    /// Maple tree recursion limit.
    pub max_maple_depth: usize,

    /// Maximum memory regions collected per process.
    pub max_vmas_per_process: usize,

    /// Page-cache walk caps.
    pub page_cache: PageCacheLimits,
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        Self {
            page_tables: WalkLimits::default(),
            max_maple_depth: 15,
            max_vmas_per_process: 0x1_0000,
            page_cache: PageCacheLimits::default(),
        }
    }
}

/// Configuration of a discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// The structure-offset profile to read kernel objects with.
    pub offsets: Offsets,

    /// A hypervisor-supplied kernel PGD, adopted after validation.
    pub trusted_pgd: Option<Pa>,

    /// Whether a rejected trusted PGD may fall back to the heuristic
    /// scan. When `false`, the rejection is fatal.
    pub allow_heuristic_fallback: bool,

    /// VA of the kernel's superblock list head, when a symbol for it is
    /// known.
    pub super_blocks: Option<Va>,

    /// Hard caps.
    pub limits: DiscoveryLimits,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            offsets: Offsets::modern(),
            trusted_pgd: None,
            allow_heuristic_fallback: true,
            super_blocks: None,
            limits: DiscoveryLimits::default(),
        }
    }
}

/// Counters describing one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryStats {
    /// Processes discovered.
    pub total_processes: u64,

    /// Of those, kernel threads.
    pub kernel_threads: u64,

    /// Of those, user processes.
    pub user_processes: u64,

    /// Leaf mappings emitted, kernel included.
    pub total_ptes: u64,

    /// Kernel leaf mappings.
    pub kernel_ptes: u64,

    /// Distinct non-zero physical pages referenced by user processes.
    pub unique_pages: u64,

    /// Pages referenced by more than one process.
    pub shared_pages: u64,

    /// Pages sampled as all-zero and dropped from the reverse index.
    pub zero_pages: u64,

    /// Descriptors dropped during page-table walks.
    pub garbage_ptes: u64,

    /// Walks cut short by a cap.
    pub truncated_walks: u64,

    /// Maple node revisits skipped.
    pub maple_cycles: u64,

    /// VMA pointers that failed validation.
    pub vmas_rejected: u64,

    /// User processes whose PGD could not be resolved.
    pub unresolved_pgds: u64,
}

/// Everything one pass recovers from the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryOutput {
    /// Discovered processes, ordered by PID.
    pub processes: Vec<ProcessDescriptor>,

    /// Leaf mappings per PID, VA-ascending. PID 0 holds the kernel
    /// mappings.
    pub ptes_by_pid: BTreeMap<u32, Vec<LeafMapping>>,

    /// Memory regions per PID, in maple-tree order.
    pub sections_by_pid: BTreeMap<u32, Vec<MemoryRegion>>,

    /// Reverse index: page-aligned PA to the PIDs mapping it. All-zero
    /// pages are excluded.
    pub page_to_pids: BTreeMap<u64, BTreeSet<u32>>,

    /// The verified kernel PGD, `None` when only an unverified candidate
    /// was available.
    pub swapper_pg_dir: Option<Pa>,

    /// Page-cache catalog.
    pub page_cache: PageCacheSummary,

    /// Counters.
    pub stats: DiscoveryStats,
}

impl DiscoveryOutput {
    /// The kernel leaf mappings (PID 0).
    pub fn kernel_ptes(&self) -> &[LeafMapping] {
        self.ptes_by_pid
            .get(&KERNEL_PID)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// The discovery pass.
pub struct Discovery<'a, Driver>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    gmi: &'a GmiCore<Driver>,
    config: DiscoveryConfig,
}

impl<'a, Driver> Discovery<'a, Driver>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    /// Creates a pass with the default configuration.
    pub fn new(gmi: &'a GmiCore<Driver>) -> Self {
        Self {
            gmi,
            config: DiscoveryConfig::default(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs the pass, asking `source` for a trusted PGD first.
    ///
    /// Channel errors are non-fatal; the heuristic locator takes over.
    pub fn run_with_source(
        mut self,
        source: &mut dyn TrustedPgdSource,
        cancel: &CancelToken,
    ) -> Result<DiscoveryOutput, GmiError> {
        if self.config.trusted_pgd.is_none() {
            self.config.trusted_pgd = match source.fetch() {
                Ok(pgd) => pgd,
                Err(err) => {
                    tracing::warn!(%err, "trusted PGD channel unavailable");
                    None
                }
            };
        }

        self.run(cancel)
    }

    /// Runs the pass.
    ///
    /// On cancellation the partial state is discarded and
    /// [`GmiError::Cancelled`] is returned.
    pub fn run(&self, cancel: &CancelToken) -> Result<DiscoveryOutput, GmiError> {
        let offsets = &self.config.offsets;
        let limits = &self.config.limits;

        let mut stats = DiscoveryStats::default();

        // 1. Kernel PGD.
        if let Some(trusted) = self.config.trusted_pgd {
            if !self.config.allow_heuristic_fallback
                && !swapper::validate_pgd_signature(self.gmi, trusted)
            {
                return Err(LinuxError::TrustedPgdRejected("signature mismatch").into());
            }
        }

        let swapper = swapper::locate_kernel_pgd(self.gmi, self.config.trusted_pgd, cancel)?;

        // 2. Task scan.
        let mut processes = task::scan_tasks(self.gmi, offsets, cancel)?;

        if let Some(swapper) = &swapper {
            for process in &mut processes {
                if cancel.is_cancelled() {
                    return Err(GmiError::Cancelled);
                }

                task::resolve_process_paging(self.gmi, offsets, swapper.pa, process);
            }
        }

        // 3. Kernel mappings.
        let mut ptes_by_pid = BTreeMap::new();

        if let Some(swapper) = &swapper {
            let walk = walk_tables(
                self.gmi,
                swapper.pa,
                WalkScope::Kernel,
                &limits.page_tables,
            );

            stats.kernel_ptes = walk.mappings.len() as u64;
            stats.garbage_ptes += walk.garbage_entries;
            stats.truncated_walks += u64::from(walk.truncated);

            ptes_by_pid.insert(KERNEL_PID, walk.mappings);
        }

        // 4. Per-process mappings and regions.
        let mut sections_by_pid = BTreeMap::new();
        let mut page_to_pids: BTreeMap<u64, BTreeSet<u32>> = BTreeMap::new();

        for process in &processes {
            if cancel.is_cancelled() {
                return Err(GmiError::Cancelled);
            }

            if process.kernel_thread {
                stats.kernel_threads += 1;
                continue;
            }
            stats.user_processes += 1;

            let Some(pgd) = process.pgd else {
                stats.unresolved_pgds += 1;
                continue;
            };

            let walk = walk_tables(self.gmi, pgd, WalkScope::User, &limits.page_tables);
            stats.garbage_ptes += walk.garbage_entries;
            stats.truncated_walks += u64::from(walk.truncated);

            for mapping in &walk.mappings {
                let page = mapping.pa.0 & !0xFFF;
                page_to_pids.entry(page).or_default().insert(process.pid);
            }

            ptes_by_pid.insert(process.pid, walk.mappings);

            if let Some(swapper) = &swapper {
                let regions = self.collect_regions(swapper.pa, process, Some(pgd), &mut stats);
                sections_by_pid.insert(process.pid, regions);
            }
        }

        // 5. Reverse index: drop pages that sample as all-zero.
        let zero_pages = self.sample_zero_pages(&page_to_pids);
        stats.zero_pages = zero_pages.len() as u64;
        page_to_pids.retain(|page, _| !zero_pages.contains(page));

        stats.unique_pages = page_to_pids.len() as u64;
        stats.shared_pages = page_to_pids
            .values()
            .filter(|pids| pids.len() > 1)
            .count() as u64;

        stats.total_processes = processes.len() as u64;
        stats.total_ptes = ptes_by_pid.values().map(|ptes| ptes.len() as u64).sum();

        // 6. Page cache.
        let page_cache = match &swapper {
            Some(swapper) => PageCacheWalker::new(self.gmi, offsets, swapper.pa)
                .with_limits(limits.page_cache)
                .walk(self.config.super_blocks, &processes, cancel)?,
            None => PageCacheSummary::default(),
        };

        let output = DiscoveryOutput {
            processes,
            ptes_by_pid,
            sections_by_pid,
            page_to_pids,
            swapper_pg_dir: swapper.as_ref().and_then(verified_pa),
            page_cache,
            stats,
        };

        tracing::info!(
            processes = output.stats.total_processes,
            ptes = output.stats.total_ptes,
            cached_files = output.page_cache.cached_files.len(),
            "discovery complete"
        );

        Ok(output)
    }

    /// Walks one process's maple tree into validated memory regions.
    fn collect_regions(
        &self,
        kernel_pgd: Pa,
        process: &ProcessDescriptor,
        process_pgd: Option<Pa>,
        stats: &mut DiscoveryStats,
    ) -> Vec<MemoryRegion> {
        let offsets = &self.config.offsets;
        let limits = &self.config.limits;

        let root_slot = gmi_core::AccessContext::paging(
            process.mm_va + offsets.mm_struct.maple_root,
            kernel_pgd,
        );

        let tree = MapleTree::new(self.gmi, offsets, kernel_pgd)
            .with_max_depth(limits.max_maple_depth);

        let mut regions = Vec::new();
        let mut rejected = 0u64;

        let walk = tree.enumerate(root_slot, &mut |vma_ptr| {
            match vma::read_vm_area(self.gmi, offsets, kernel_pgd, process_pgd, vma_ptr) {
                Some(region) => regions.push(region),
                None => rejected += 1,
            }

            regions.len() < limits.max_vmas_per_process
        });

        match walk {
            Ok(walk) => {
                stats.maple_cycles += walk.cycles;
                stats.truncated_walks += u64::from(walk.truncated);
            }
            Err(err) => {
                tracing::debug!(pid = process.pid, %err, "maple walk failed");
            }
        }

        if rejected > 0 {
            tracing::debug!(pid = process.pid, rejected, "VMA pointers rejected");
        }
        stats.vmas_rejected += rejected;

        regions
    }

    /// Samples the first bytes of every referenced page; a page of zeros
    /// carries no sharing information.
    fn sample_zero_pages(&self, page_to_pids: &BTreeMap<u64, BTreeSet<u32>>) -> BTreeSet<u64> {
        let mut zero = BTreeSet::new();
        let mut sample = [0u8; ZERO_SAMPLE];

        for &page in page_to_pids.keys() {
            if self.gmi.read(Pa(page), &mut sample).is_err() {
                continue;
            }

            if sample.iter().all(|&b| b == 0) {
                zero.insert(page);
            }
        }

        zero
    }
}

fn verified_pa(swapper: &SwapperPgd) -> Option<Pa> {
    swapper.verified.then_some(swapper.pa)
}

#[cfg(test)]
mod tests {
    use gmi_core::Architecture as _;

    use super::*;
    use crate::{testutil::MockImage, vma::RegionKind};

    const RAM_BASE: u64 = 0x4000_0000;
    const RAM_SIZE: u64 = 0x100_0000;

    const KVA: u64 = 0xFFFF_0000_0000_0000;

    // Layout of the synthetic guest.
    const KPGD: u64 = RAM_BASE + 0x1000;
    const KPUD: u64 = RAM_BASE + 0x2000;
    const HEAD: u64 = RAM_BASE + 0x9_0000;
    const SB: u64 = RAM_BASE + 0x9_2000;
    const FST: u64 = RAM_BASE + 0x9_4000;
    const FST_NAME: u64 = RAM_BASE + 0x9_5000;
    const INODE: u64 = RAM_BASE + 0x9_6000;
    const MAPPING: u64 = RAM_BASE + 0x9_8000;
    const TASK1: u64 = RAM_BASE + 0x40_0000;
    const TASK2: u64 = RAM_BASE + 0x41_0000;
    const MM1: u64 = RAM_BASE + 0x50_0000;
    const MM2: u64 = RAM_BASE + 0x51_0000;
    const UPGD: u64 = RAM_BASE + 0x60_0000;
    const UPUD: u64 = RAM_BASE + 0x61_0000;
    const UPMD: u64 = RAM_BASE + 0x62_0000;
    const UPTE: u64 = RAM_BASE + 0x63_0000;
    const DATA: u64 = RAM_BASE + 0x70_0000;
    const NODE: u64 = RAM_BASE + 0x80_0000;
    const VMA: u64 = RAM_BASE + 0x81_0000;

    const USER_VA: u64 = 0x7FFF_0000;

    fn table(next: u64) -> u64 {
        next | 0b11
    }

    fn block(pa: u64) -> u64 {
        pa | 0b01 | (1 << 10)
    }

    fn page(pa: u64) -> u64 {
        pa | 0b11 | (1 << 10) | (1 << 6)
    }

    fn write_task(image: &mut MockImage, base: u64, pid: u32, comm: &str, mm: u64) {
        let offsets = Offsets::modern();
        let __task = &offsets.task_struct;

        image.write_u32(base + __task.pid, pid);

        let mut comm_bytes = [0u8; 16];
        comm_bytes[..comm.len()].copy_from_slice(comm.as_bytes());
        image.write_bytes(base + __task.comm, &comm_bytes);

        image.write_u64(base + __task.mm, mm);
        image.write_u64(base + __task.tasks, KVA | (RAM_BASE + 0x10_0000));
        image.write_u64(base + __task.tasks + 8, KVA | (RAM_BASE + 0x20_0000));

        for slot in 0..6u64 {
            image.write_u64(base + 0x40 + slot * 8, KVA | (RAM_BASE + 0x1000 * slot));
        }
    }

    /// A complete miniature guest: verified kernel PGD, two user
    /// processes sharing one data page, one VMA each, and a page cache
    /// with one file.
    fn build_guest() -> MockImage {
        let offsets = Offsets::modern();
        let mut image = MockImage::new(RAM_BASE, RAM_SIZE);

        // Kernel PGD with a linear map of the first RAM gigabyte.
        image.write_u64(KPGD, table(KPUD));
        image.write_u64(KPGD + 256 * 8, table(KPUD));
        image.write_u64(KPGD + 511 * 8, table(KPUD));
        image.write_u64(KPUD + 8, block(0x4000_0000));

        // Two processes, one shared user address space.
        write_task(&mut image, TASK1, 1, "systemd", KVA | MM1);
        write_task(&mut image, TASK2, 2, "sshd", KVA | MM2);

        for mm in [MM1, MM2] {
            image.write_u64(mm + offsets.mm_struct.pgd, UPGD);
            image.write_u32(mm + offsets.mm_struct.mm_users, 1);
            image.write_u64(mm + offsets.mm_struct.maple_root, (KVA | NODE) | (0x1 << 3) | 0x2);
        }

        // User translation for USER_VA.
        image.write_u64(UPGD, table(UPUD));
        image.write_u64(UPUD + 1 * 8, table(UPMD));
        image.write_u64(UPMD + 511 * 8, table(UPTE));
        image.write_u64(UPTE + 0x1F0 * 8, page(DATA));
        image.write_bytes(DATA, &[0xAA; 16]);

        // One leaf64 maple node holding the stack VMA.
        image.write_u64(NODE, USER_VA + 0xFFF);
        image.write_u64(NODE + 0x80, KVA | VMA);

        image.write_u64(VMA + offsets.vm_area_struct.vm_start, USER_VA);
        image.write_u64(VMA + offsets.vm_area_struct.vm_end, USER_VA + 0x1000);
        image.write_u64(VMA + offsets.vm_area_struct.vm_flags, 0x8B);

        // A superblock with one cached file.
        image.write_u64(HEAD, KVA | SB);
        image.write_u64(HEAD + 8, KVA | SB);
        image.write_u64(SB + offsets.super_block.s_list, KVA | HEAD);
        image.write_u64(SB + offsets.super_block.s_list + 8, KVA | HEAD);
        image.write_cstr(SB + offsets.super_block.s_id, "vda");
        image.write_u64(SB + offsets.super_block.s_type, KVA | FST);
        image.write_u64(FST + offsets.file_system_type.name, KVA | FST_NAME);
        image.write_cstr(FST_NAME, "ext4");

        let inode_list = SB + offsets.super_block.s_inodes;
        image.write_u64(inode_list, KVA | (INODE + offsets.inode.i_sb_list));
        image.write_u64(INODE + offsets.inode.i_sb_list, KVA | inode_list);
        image.write_u64(INODE + offsets.inode.i_sb, KVA | SB);
        image.write_u64(INODE + offsets.inode.i_mapping, KVA | MAPPING);
        image.write_u64(INODE + offsets.inode.i_ino, 77);
        image.write_u64(INODE + offsets.inode.i_size, 13 * 0x1000);
        image.write_u64(MAPPING + offsets.address_space.nrpages, 13);

        image
    }

    fn run_discovery() -> DiscoveryOutput {
        let gmi = GmiCore::new(build_guest().into_driver()).expect("core");

        Discovery::new(&gmi)
            .with_config(DiscoveryConfig {
                super_blocks: Some(Va(KVA | HEAD)),
                ..DiscoveryConfig::default()
            })
            .run(&CancelToken::new())
            .expect("discovery")
    }

    #[test]
    fn full_pass_over_a_synthetic_guest() {
        let output = run_discovery();

        // Kernel PGD located and verified.
        assert_eq!(output.swapper_pg_dir, Some(Pa(KPGD)));

        // Both processes found and resolved.
        assert_eq!(output.stats.total_processes, 2);
        assert_eq!(output.stats.user_processes, 2);
        assert_eq!(output.processes[0].pid, 1);
        assert_eq!(output.processes[0].comm, "systemd");
        assert_eq!(output.processes[0].pgd, Some(Pa(UPGD)));
        assert_eq!(output.processes[1].pid, 2);

        // One leaf mapping per process, plus the kernel linear map.
        let ptes = &output.ptes_by_pid[&1];
        assert_eq!(ptes.len(), 1);
        assert_eq!(ptes[0].va, Va(USER_VA));
        assert_eq!(ptes[0].pa, Pa(DATA));
        assert!(!output.kernel_ptes().is_empty());
        assert_eq!(output.stats.total_ptes, 2 + output.stats.kernel_ptes);

        // The stack VMA decoded from the maple tree.
        let sections = &output.sections_by_pid[&1];
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].start, Va(USER_VA));
        assert_eq!(sections[0].kind, RegionKind::Stack);
        assert_eq!(sections[0].start_pa, Pa(DATA));

        // The shared data page shows up once, referenced by both PIDs.
        assert_eq!(output.stats.unique_pages, 1);
        assert_eq!(output.stats.shared_pages, 1);
        assert_eq!(output.stats.zero_pages, 0);
        let pids = &output.page_to_pids[&DATA];
        assert!(pids.contains(&1) && pids.contains(&2));

        // The page cache catalog.
        assert_eq!(output.page_cache.cached_files.len(), 1);
        assert_eq!(output.page_cache.total_cached_pages, 13);
        assert_eq!(output.page_cache.total_cached_bytes, 13 * 4096);
    }

    #[test]
    fn discovery_is_deterministic() {
        assert_eq!(run_discovery(), run_discovery());
    }

    #[test]
    fn emitted_leaves_agree_with_the_translator() {
        let output = run_discovery();
        let gmi = GmiCore::new(build_guest().into_driver()).expect("core");

        for (pid, ptes) in &output.ptes_by_pid {
            if *pid == KERNEL_PID {
                continue;
            }

            let pgd = output
                .processes
                .iter()
                .find(|p| p.pid == *pid)
                .and_then(|p| p.pgd)
                .expect("pgd");

            for pte in ptes {
                assert_eq!(
                    Aarch64::translate_address(&gmi, pte.va, pgd).expect("translate"),
                    pte.pa,
                    "pid {pid} va {}",
                    pte.va
                );

                assert_eq!(pte.va.0 % pte.size.bytes(), 0);
                assert_eq!(pte.pa.0 % pte.size.bytes(), 0);
            }
        }
    }

    #[test]
    fn zero_pages_are_dropped_from_the_reverse_index() {
        let mut image = build_guest();

        // Map a second, all-zero page into both processes.
        let zero_data = RAM_BASE + 0x71_0000;
        image.write_u64(UPTE + 0x1F1 * 8, page(zero_data));

        let gmi = GmiCore::new(image.into_driver()).expect("core");
        let output = Discovery::new(&gmi)
            .with_config(DiscoveryConfig {
                super_blocks: Some(Va(KVA | HEAD)),
                ..DiscoveryConfig::default()
            })
            .run(&CancelToken::new())
            .expect("discovery");

        assert_eq!(output.stats.zero_pages, 1);
        assert!(!output.page_to_pids.contains_key(&zero_data));
        assert!(output.page_to_pids.contains_key(&DATA));
    }

    #[test]
    fn rejected_trusted_pgd_is_fatal_without_fallback() {
        let gmi = GmiCore::new(build_guest().into_driver()).expect("core");

        let result = Discovery::new(&gmi)
            .with_config(DiscoveryConfig {
                trusted_pgd: Some(Pa(RAM_BASE + 0x5000)),
                allow_heuristic_fallback: false,
                ..DiscoveryConfig::default()
            })
            .run(&CancelToken::new());

        assert!(matches!(result, Err(GmiError::Os(_))));
    }

    #[test]
    fn trusted_source_feeds_the_locator() {
        struct Channel;

        impl TrustedPgdSource for Channel {
            fn fetch(&mut self) -> Result<Option<Pa>, GmiError> {
                Ok(Some(Pa(KPGD)))
            }
        }

        let gmi = GmiCore::new(build_guest().into_driver()).expect("core");
        let output = Discovery::new(&gmi)
            .run_with_source(&mut Channel, &CancelToken::new())
            .expect("discovery");

        assert_eq!(output.swapper_pg_dir, Some(Pa(KPGD)));
    }

    #[test]
    fn cancellation_discards_the_pass() {
        let gmi = GmiCore::new(build_guest().into_driver()).expect("core");

        let cancel = CancelToken::new();
        cancel.cancel();

        // The synthetic image is small; cancellation is observed at the
        // per-process checkpoints instead of the scan interval.
        let result = Discovery::new(&gmi).run(&cancel);
        assert!(matches!(result, Err(GmiError::Cancelled)));
    }
}
