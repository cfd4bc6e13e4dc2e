//! Fixed structure offsets for the introspected kernels.
//!
//! There is no symbol source for a raw RAM capture, so field offsets are
//! part of the external contract. Two layouts have been observed in the
//! wild; both are exposed as profiles and every offset can be overridden
//! for a kernel that matches neither.

/// `struct task_struct` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStructOffsets {
    /// `task_struct.pid`.
    pub pid: u64,

    /// `task_struct.comm` (16 bytes, NUL-terminated).
    pub comm: u64,

    /// `task_struct.mm` (`struct mm_struct *`).
    pub mm: u64,

    /// `task_struct.tasks` (`struct list_head`).
    pub tasks: u64,

    /// `task_struct.files` (`struct files_struct *`).
    pub files: u64,

    /// `sizeof(struct task_struct)`, the SLAB object size.
    pub size: u64,
}

/// `struct mm_struct` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmStructOffsets {
    /// `mm_struct.pgd` (`pgd_t *`).
    pub pgd: u64,

    /// `mm_struct.mm_mt.ma_root`, the maple tree root slot.
    pub maple_root: u64,

    /// `mm_struct.mm_users`.
    pub mm_users: u64,
}

/// `struct vm_area_struct` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmAreaStructOffsets {
    /// `vm_area_struct.vm_start`.
    pub vm_start: u64,

    /// `vm_area_struct.vm_end`.
    pub vm_end: u64,

    /// `vm_area_struct.vm_flags`.
    pub vm_flags: u64,

    /// `vm_area_struct.vm_pgoff`.
    pub vm_pgoff: u64,

    /// `vm_area_struct.vm_file` (`struct file *`).
    pub vm_file: u64,
}

/// `struct file` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOffsets {
    /// `file.f_path.dentry` (`struct dentry *`).
    pub f_path_dentry: u64,

    /// `file.f_inode` (`struct inode *`).
    pub f_inode: u64,
}

/// `struct dentry` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DentryOffsets {
    /// `dentry.d_name.name` (`const unsigned char *`).
    pub d_name_name: u64,
}

/// `struct files_struct` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesStructOffsets {
    /// `files_struct.fdt` (`struct fdtable *`).
    pub fdt: u64,
}

/// `struct fdtable` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtableOffsets {
    /// `fdtable.max_fds`.
    pub max_fds: u64,

    /// `fdtable.fd` (`struct file **`).
    pub fd: u64,
}

/// `struct inode` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeOffsets {
    /// `inode.i_sb` (`struct super_block *`); zero marks an unallocated
    /// SLAB object.
    pub i_sb: u64,

    /// `inode.i_mapping` (`struct address_space *`).
    pub i_mapping: u64,

    /// `inode.i_ino`.
    pub i_ino: u64,

    /// `inode.i_size`.
    pub i_size: u64,

    /// `inode.i_sb_list` (`struct list_head`), the per-superblock link.
    pub i_sb_list: u64,
}

/// `struct super_block` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlockOffsets {
    /// `super_block.s_list` (`struct list_head`, first field).
    pub s_list: u64,

    /// `super_block.s_type` (`struct file_system_type *`).
    pub s_type: u64,

    /// `super_block.s_id` (inline char array).
    pub s_id: u64,

    /// `super_block.s_inodes` (`struct list_head`).
    pub s_inodes: u64,
}

/// `struct file_system_type` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSystemTypeOffsets {
    /// `file_system_type.name` (`const char *`).
    pub name: u64,
}

/// `struct address_space` field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceOffsets {
    /// `address_space.i_pages` (`struct xarray`).
    pub i_pages: u64,

    /// `address_space.nrpages`.
    pub nrpages: u64,
}

/// `struct xarray` / `struct xa_node` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XarrayOffsets {
    /// `xarray.xa_head` within the xarray struct.
    pub xa_head: u64,

    /// `xa_node.slots`.
    pub slots: u64,

    /// `XA_CHUNK_SIZE`: number of slots per node.
    pub slot_count: usize,
}

/// Layout of one maple node variant: where its slot array lives, how many
/// slots it has, and where its pivots live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapleNodeLayout {
    /// Byte offset of the slot array within the node.
    pub slots: u64,

    /// Byte offset of the pivot array within the node.
    pub pivots: u64,

    /// Number of slots.
    pub slot_count: usize,
}

/// Maple node layouts by node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapleOffsets {
    /// Dense nodes: inline value slots.
    pub dense: MapleNodeLayout,

    /// Leaf nodes with 64-bit pivots.
    pub leaf64: MapleNodeLayout,

    /// Internal range nodes.
    pub range64: MapleNodeLayout,

    /// Internal allocation-range nodes.
    pub arange64: MapleNodeLayout,
}

/// The complete offsets profile for one kernel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offsets {
    /// `struct task_struct`.
    pub task_struct: TaskStructOffsets,

    /// `struct mm_struct`.
    pub mm_struct: MmStructOffsets,

    /// `struct vm_area_struct`.
    pub vm_area_struct: VmAreaStructOffsets,

    /// `struct file`.
    pub file: FileOffsets,

    /// `struct dentry`.
    pub dentry: DentryOffsets,

    /// `struct files_struct`.
    pub files_struct: FilesStructOffsets,

    /// `struct fdtable`.
    pub fdtable: FdtableOffsets,

    /// `struct inode`.
    pub inode: InodeOffsets,

    /// `struct super_block`.
    pub super_block: SuperBlockOffsets,

    /// `struct file_system_type`.
    pub file_system_type: FileSystemTypeOffsets,

    /// `struct address_space`.
    pub address_space: AddressSpaceOffsets,

    /// xarray layout.
    pub xarray: XarrayOffsets,

    /// Maple node layouts.
    pub maple: MapleOffsets,
}

impl Offsets {
    /// The 6.x layout observed on current images.
    pub const fn modern() -> Self {
        Self::with_task_layout(TaskStructOffsets {
            pid: 0x4E8,
            comm: 0x758,
            mm: 0x998,
            tasks: 0x508,
            files: 0x9B8,
            size: 9088,
        })
    }

    /// The older task layout seen on earlier kernels.
    pub const fn legacy() -> Self {
        Self::with_task_layout(TaskStructOffsets {
            pid: 0x750,
            comm: 0x970,
            mm: 0x6D0,
            tasks: 0x7E0,
            files: 0x990,
            size: 9088,
        })
    }

    const fn with_task_layout(task_struct: TaskStructOffsets) -> Self {
        Self {
            task_struct,
            mm_struct: MmStructOffsets {
                pgd: 0x68,
                maple_root: 0x48,
                mm_users: 0x74,
            },
            vm_area_struct: VmAreaStructOffsets {
                vm_start: 0x00,
                vm_end: 0x08,
                vm_flags: 0x20,
                vm_pgoff: 0x78,
                vm_file: 0x80,
            },
            file: FileOffsets {
                f_path_dentry: 0x48,
                f_inode: 0x28,
            },
            dentry: DentryOffsets { d_name_name: 0x28 },
            files_struct: FilesStructOffsets { fdt: 0x20 },
            fdtable: FdtableOffsets {
                max_fds: 0x00,
                fd: 0x08,
            },
            inode: InodeOffsets {
                i_sb: 0x28,
                i_mapping: 0x30,
                i_ino: 0x40,
                i_size: 0x50,
                i_sb_list: 0x128,
            },
            super_block: SuperBlockOffsets {
                s_list: 0x00,
                s_type: 0x28,
                s_id: 0x3C0,
                s_inodes: 0x548,
            },
            file_system_type: FileSystemTypeOffsets { name: 0x00 },
            address_space: AddressSpaceOffsets {
                i_pages: 0x08,
                nrpages: 0x58,
            },
            xarray: XarrayOffsets {
                xa_head: 0x08,
                slots: 0x28,
                slot_count: 64,
            },
            maple: MapleOffsets {
                dense: MapleNodeLayout {
                    slots: 0x08,
                    pivots: 0x00,
                    slot_count: 15,
                },
                leaf64: MapleNodeLayout {
                    slots: 0x80,
                    pivots: 0x00,
                    slot_count: 16,
                },
                range64: MapleNodeLayout {
                    slots: 0x80,
                    pivots: 0x00,
                    slot_count: 16,
                },
                arange64: MapleNodeLayout {
                    slots: 0x50,
                    pivots: 0x00,
                    slot_count: 10,
                },
            },
        }
    }

    /// The SLAB sub-offsets at which a task_struct can start within a 4 KiB
    /// page, derived from the object size.
    pub fn slab_sub_offsets(&self) -> [u64; 5] {
        let size = self.task_struct.size;
        [
            0,
            size % 0x1000,
            (2 * size) % 0x1000,
            (3 * size) % 0x1000,
            (4 * size) % 0x1000,
        ]
    }
}

impl Default for Offsets {
    fn default() -> Self {
        Self::modern()
    }
}
