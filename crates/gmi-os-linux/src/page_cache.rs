//! Page-cache discovery.
//!
//! Cached files are reached along two independent paths and cross-checked:
//! the per-superblock inode lists, and the file tables of every discovered
//! process. The superblock list itself is found either from a configured
//! kernel VA or by scanning for a nodev filesystem's identity string and
//! walking the circular list it sits on.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use gmi_core::{Architecture as _, CancelToken, GmiCore, GmiError, ImageDriver, Pa, Va};

use gmi_arch_aarch64::Aarch64;

use crate::{iter::ListEntryIterator, offsets::Offsets, task::ProcessDescriptor, xarray};

/// Filesystems whose superblock identity string equals the filesystem name.
/// At least one of them is mounted on any Linux system, which makes them
/// reliable scan anchors.
const NODEV_FS_IDS: &[&str] = &["tmpfs", "devtmpfs", "proc", "sysfs", "ramfs"];

/// A file with pages in the page cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    /// Inode number.
    pub inode: u64,

    /// File size in bytes.
    pub size: u64,

    /// Number of cached pages (`address_space.nrpages`).
    pub cached_pages: u64,

    /// Cached bytes (4 KiB per page).
    pub cached_bytes: u64,

    /// Identity of the filesystem the file belongs to.
    pub fs: String,
}

/// One discovered superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    /// Filesystem type name (`s_type->name`).
    pub fs_type: String,

    /// Superblock identity (`s_id`; the device name for block
    /// filesystems).
    pub s_id: String,

    /// Virtual address of the superblock.
    pub superblock: Va,

    /// Inodes walked on this superblock.
    pub inodes_walked: u64,

    /// Unallocated inodes skipped (`i_sb == 0`).
    pub inodes_skipped: u64,

    /// Files with cached pages found on this superblock.
    pub cached_files: u64,
}

/// The page-cache catalog produced by the walk.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCacheSummary {
    /// Total cached pages across all files.
    pub total_cached_pages: u64,

    /// Total cached bytes across all files.
    pub total_cached_bytes: u64,

    /// Discovered superblocks.
    pub filesystems: Vec<FilesystemInfo>,

    /// Discovered cached files, in discovery order.
    pub cached_files: Vec<CachedFile>,

    /// Pages reached by walking the per-file xarrays; a consistency
    /// counter against `total_cached_pages`.
    pub xarray_pages: u64,

    /// Inodes reachable from a process file table but absent from their
    /// superblock's inode list.
    pub fd_only_inodes: u64,
}

/// Hard caps for the page-cache walk.
#[derive(Debug, Clone, Copy)]
pub struct PageCacheLimits {
    /// Maximum superblocks walked.
    pub max_superblocks: usize,

    /// Maximum inodes walked per superblock.
    pub max_inodes: usize,

    /// Maximum file descriptors inspected per process.
    pub max_fds: u32,
}

impl Default for PageCacheLimits {
    fn default() -> Self {
        Self {
            max_superblocks: 50,
            max_inodes: 2000,
            max_fds: 1024,
        }
    }
}

/// Walks superblocks, inode lists and process file tables into a
/// [`PageCacheSummary`].
pub struct PageCacheWalker<'a, Driver>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    gmi: &'a GmiCore<Driver>,
    offsets: &'a Offsets,
    kernel_pgd: Pa,
    limits: PageCacheLimits,
}

impl<'a, Driver> PageCacheWalker<'a, Driver>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    /// Creates a new walker.
    pub fn new(gmi: &'a GmiCore<Driver>, offsets: &'a Offsets, kernel_pgd: Pa) -> Self {
        Self {
            gmi,
            offsets,
            kernel_pgd,
            limits: PageCacheLimits::default(),
        }
    }

    /// Overrides the walk caps.
    pub fn with_limits(mut self, limits: PageCacheLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Runs the walk.
    ///
    /// `super_blocks` is the VA of the kernel's superblock list head, when
    /// a symbol for it is available; otherwise the image is scanned for an
    /// anchor superblock.
    pub fn walk(
        &self,
        super_blocks: Option<Va>,
        processes: &[ProcessDescriptor],
        cancel: &CancelToken,
    ) -> Result<PageCacheSummary, GmiError> {
        let mut summary = PageCacheSummary::default();
        let mut inodes: IndexMap<Va, CachedFile> = IndexMap::new();

        let start = match super_blocks {
            Some(head) => Some(head),
            None => self.find_anchor_superblock(cancel)?,
        };

        match start {
            Some(start) => {
                self.walk_superblocks(start, &mut summary, &mut inodes, cancel)?;
            }
            None => tracing::warn!("no superblock list found, page cache limited to fd tables"),
        }

        self.cross_check_fd_tables(processes, &mut summary, &mut inodes, cancel)?;

        summary.cached_files = inodes.into_values().collect();
        summary.total_cached_pages = summary
            .cached_files
            .iter()
            .map(|file| file.cached_pages)
            .sum();
        summary.total_cached_bytes = summary
            .cached_files
            .iter()
            .map(|file| file.cached_bytes)
            .sum();

        Ok(summary)
    }

    /// Walks the circular superblock list starting at any node on it.
    ///
    /// Nodes that do not parse as superblocks (the bare list head in
    /// kernel data) are skipped without ending the walk, so starting at
    /// the head and starting at a scanned anchor member are equivalent.
    fn walk_superblocks(
        &self,
        start: Va,
        summary: &mut PageCacheSummary,
        inodes: &mut IndexMap<Va, CachedFile>,
        cancel: &CancelToken,
    ) -> Result<(), GmiError> {
        let __sb = &self.offsets.super_block;

        let rest = ListEntryIterator::new(self.gmi, self.kernel_pgd, start, __sb.s_list);

        // One extra hop allows for the skipped list head.
        for node in std::iter::once(Ok(start))
            .chain(rest)
            .take(self.limits.max_superblocks + 2)
        {
            if cancel.is_cancelled() {
                return Err(GmiError::Cancelled);
            }

            let Ok(node) = node else {
                return Ok(());
            };

            if summary.filesystems.len() >= self.limits.max_superblocks {
                tracing::warn!(
                    max_superblocks = self.limits.max_superblocks,
                    "superblock cap reached"
                );
                return Ok(());
            }

            if let Some(info) = self.read_superblock(node, inodes, &mut summary.xarray_pages) {
                summary.filesystems.push(info);
            }
        }

        Ok(())
    }

    /// Parses one list node as a superblock; `None` for nodes that do not
    /// look like one.
    fn read_superblock(
        &self,
        sb: Va,
        inodes: &mut IndexMap<Va, CachedFile>,
        xarray_pages: &mut u64,
    ) -> Option<FilesystemInfo> {
        let __sb = &self.offsets.super_block;

        let s_id = self
            .gmi
            .read_cstring((sb + __sb.s_id, self.kernel_pgd), 31)
            .ok()??;
        if s_id.is_empty() {
            return None;
        }

        let s_type = self.gmi.read_va((sb + __sb.s_type, self.kernel_pgd)).ok()?;
        if !Aarch64::is_kernel_va(s_type) {
            return None;
        }

        let fs_type = self.read_fs_type_name(s_type)?;

        let mut info = FilesystemInfo {
            fs_type,
            s_id,
            superblock: sb,
            inodes_walked: 0,
            inodes_skipped: 0,
            cached_files: 0,
        };

        self.walk_inode_list(sb, &mut info, inodes, xarray_pages);

        Some(info)
    }

    /// `s_type->name`, two pointer hops from the superblock.
    fn read_fs_type_name(&self, s_type: Va) -> Option<String> {
        let name_ptr = self
            .gmi
            .read_va((s_type + self.offsets.file_system_type.name, self.kernel_pgd))
            .ok()?;
        if !Aarch64::is_kernel_va(name_ptr) {
            return None;
        }

        self.gmi
            .read_cstring((name_ptr, self.kernel_pgd), 31)
            .ok()?
    }

    fn walk_inode_list(
        &self,
        sb: Va,
        info: &mut FilesystemInfo,
        inodes: &mut IndexMap<Va, CachedFile>,
        xarray_pages: &mut u64,
    ) {
        let __inode = &self.offsets.inode;

        let head = sb + self.offsets.super_block.s_inodes;

        for inode in ListEntryIterator::new(self.gmi, self.kernel_pgd, head, __inode.i_sb_list) {
            let Ok(inode) = inode else {
                return;
            };

            if info.inodes_walked >= self.limits.max_inodes as u64 {
                tracing::warn!(
                    s_id = %info.s_id,
                    max_inodes = self.limits.max_inodes,
                    "inode cap reached"
                );
                return;
            }

            info.inodes_walked += 1;

            match self.read_inode(inode, &info.s_id, Some(xarray_pages)) {
                Some(Some(file)) => {
                    info.cached_files += 1;
                    inodes.entry(inode).or_insert(file);
                }
                // Allocated, nothing cached.
                Some(None) => {}
                None => info.inodes_skipped += 1,
            }
        }
    }

    /// Reads one inode.
    ///
    /// Returns `None` for unallocated SLAB objects (`i_sb == 0`),
    /// `Some(None)` for live inodes without cached pages, and a
    /// [`CachedFile`] otherwise. When the inode carries cached pages and a
    /// counter is supplied, its xarray is walked for cross-verification.
    fn read_inode(
        &self,
        inode: Va,
        fs: &str,
        xarray_pages: Option<&mut u64>,
    ) -> Option<Option<CachedFile>> {
        let __inode = &self.offsets.inode;

        let i_sb = self
            .gmi
            .read_va((inode + __inode.i_sb, self.kernel_pgd))
            .ok()?;
        if i_sb.is_null() {
            return None;
        }

        let mapping = self
            .gmi
            .read_va((inode + __inode.i_mapping, self.kernel_pgd))
            .ok()?;
        if !Aarch64::is_kernel_va(mapping) {
            return None;
        }

        let nrpages = self
            .gmi
            .read_u64((mapping + self.offsets.address_space.nrpages, self.kernel_pgd))
            .ok()?;
        if nrpages == 0 {
            return Some(None);
        }

        if let Some(counter) = xarray_pages {
            self.count_xarray(mapping, counter);
        }

        let i_ino = self
            .gmi
            .read_u64((inode + __inode.i_ino, self.kernel_pgd))
            .ok()?;
        let i_size = self
            .gmi
            .read_u64((inode + __inode.i_size, self.kernel_pgd))
            .unwrap_or(0);

        Some(Some(CachedFile {
            inode: i_ino,
            size: i_size,
            cached_pages: nrpages,
            cached_bytes: nrpages * 0x1000,
            fs: fs.to_owned(),
        }))
    }

    /// Verifies `nrpages` against the xarray and folds the result into the
    /// given counter.
    fn count_xarray(&self, mapping: Va, xarray_pages: &mut u64) {
        let walk = xarray::count_cached_pages(self.gmi, self.offsets, self.kernel_pgd, mapping);
        *xarray_pages += walk.pages;
    }

    /// Reaches inodes through each process's file table and unions them
    /// with the superblock-discovered set.
    fn cross_check_fd_tables(
        &self,
        processes: &[ProcessDescriptor],
        summary: &mut PageCacheSummary,
        inodes: &mut IndexMap<Va, CachedFile>,
        cancel: &CancelToken,
    ) -> Result<(), GmiError> {
        let __files = &self.offsets.files_struct;
        let __fdt = &self.offsets.fdtable;
        let __file = &self.offsets.file;

        for process in processes {
            if cancel.is_cancelled() {
                return Err(GmiError::Cancelled);
            }

            let Some(files) = process.files_va else {
                continue;
            };
            if process.kernel_thread {
                continue;
            }

            let Ok(fdt) = self.gmi.read_va((files + __files.fdt, self.kernel_pgd)) else {
                continue;
            };
            if !Aarch64::is_kernel_va(fdt) {
                continue;
            }

            let Ok(max_fds) = self.gmi.read_u32((fdt + __fdt.max_fds, self.kernel_pgd)) else {
                continue;
            };
            let Ok(fd_array) = self.gmi.read_va((fdt + __fdt.fd, self.kernel_pgd)) else {
                continue;
            };
            if !Aarch64::is_kernel_va(fd_array) {
                continue;
            }

            for i in 0..max_fds.min(self.limits.max_fds) as u64 {
                let Ok(file) = self.gmi.read_va((fd_array + i * 8, self.kernel_pgd)) else {
                    break;
                };
                let file = Aarch64::strip_pac(file);
                if !Aarch64::is_kernel_va(file) {
                    continue;
                }

                let Ok(inode) = self.gmi.read_va((file + __file.f_inode, self.kernel_pgd)) else {
                    continue;
                };
                let inode = Aarch64::strip_pac(inode);
                if !Aarch64::is_kernel_va(inode) || inodes.contains_key(&inode) {
                    continue;
                }

                // Reachable from an fd but missed by the inode lists:
                // report and fold it in.
                let fs = self.inode_fs_id(inode).unwrap_or_else(|| "?".to_owned());

                if let Some(Some(file)) = self.read_inode(inode, &fs, None) {
                    tracing::debug!(
                        pid = process.pid,
                        fd = i,
                        inode = file.inode,
                        "inode reachable only through a file table"
                    );
                    summary.fd_only_inodes += 1;
                    inodes.insert(inode, file);
                }
            }
        }

        Ok(())
    }

    /// Resolves the `s_id` of the superblock an inode belongs to.
    fn inode_fs_id(&self, inode: Va) -> Option<String> {
        let i_sb = self
            .gmi
            .read_va((inode + self.offsets.inode.i_sb, self.kernel_pgd))
            .ok()?;
        if !Aarch64::is_kernel_va(i_sb) {
            return None;
        }

        self.gmi
            .read_cstring(
                (i_sb + self.offsets.super_block.s_id, self.kernel_pgd),
                31,
            )
            .ok()?
    }

    /// Scans the image for a nodev filesystem superblock to anchor the
    /// list walk when no symbol is available.
    ///
    /// The node's own VA is recovered through its successor's back link.
    fn find_anchor_superblock(&self, cancel: &CancelToken) -> Result<Option<Va>, GmiError> {
        let info = self.gmi.info();
        let s_id_offset = self.offsets.super_block.s_id;

        let finders: Vec<memchr::memmem::Finder> = NODEV_FS_IDS
            .iter()
            .map(|id| {
                let mut pattern = id.as_bytes().to_vec();
                pattern.push(0);
                memchr::memmem::Finder::new(&pattern).into_owned()
            })
            .collect();

        let mut offset = 0u64;
        let mut next_cancel_poll = 100 * 1024 * 1024;

        while offset + Aarch64::PAGE_SIZE <= info.ram_size {
            if offset >= next_cancel_poll {
                if cancel.is_cancelled() {
                    return Err(GmiError::Cancelled);
                }
                next_cancel_poll += 100 * 1024 * 1024;
            }

            let pa = info.ram_base + offset;
            offset += Aarch64::PAGE_SIZE;

            let Ok(page) = self.gmi.read_page(Aarch64::gfn_from_pa(pa)) else {
                continue;
            };

            for finder in &finders {
                for hit in finder.find_iter(&page) {
                    let s_id_pa = pa + hit as u64;
                    let Some(sb_pa) = s_id_pa.0.checked_sub(s_id_offset) else {
                        continue;
                    };
                    if !info.contains(Pa(sb_pa)) {
                        continue;
                    }

                    if let Some(sb_va) = self.validate_anchor(Pa(sb_pa)) {
                        tracing::info!(%sb_va, "anchor superblock found by scan");
                        return Ok(Some(sb_va));
                    }
                }
            }
        }

        Ok(None)
    }

    /// Validates a scanned superblock candidate and recovers its VA.
    fn validate_anchor(&self, sb_pa: Pa) -> Option<Va> {
        let next = Va(self.gmi.read_u64(sb_pa).ok()?);
        let prev = Va(self.gmi.read_u64(sb_pa + 8).ok()?);
        if !Aarch64::is_kernel_va(next) || !Aarch64::is_kernel_va(prev) {
            return None;
        }

        let s_type = Va(
            self.gmi
                .read_u64(sb_pa + self.offsets.super_block.s_type)
                .ok()?,
        );
        if !Aarch64::is_kernel_va(s_type) {
            return None;
        }

        // The successor's back link names this node.
        let sb_va = self.gmi.read_va((next + 8, self.kernel_pgd)).ok()?;
        if !Aarch64::is_kernel_va(sb_va) {
            return None;
        }

        if self.gmi.translate_address((sb_va, self.kernel_pgd)).ok() != Some(sb_pa) {
            return None;
        }

        Some(sb_va)
    }
}
