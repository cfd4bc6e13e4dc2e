//! Virtual memory area decoding and classification.

use serde::{Deserialize, Serialize};

use gmi_core::{Architecture as _, GmiCore, ImageDriver, MemoryAccess, Pa, Va};

use gmi_arch_aarch64::Aarch64;

use crate::offsets::Offsets;

/// Longest backing-file name recovered from a dentry.
const MAX_FILE_NAME: usize = 255;

bitflags::bitflags! {
    /// `vm_area_struct.vm_flags` bits the classifier cares about.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct VmaFlags: u64 {
        /// VM_READ
        const READ = 0x0000_0001;

        /// VM_WRITE
        const WRITE = 0x0000_0002;

        /// VM_EXEC
        const EXEC = 0x0000_0004;

        /// VM_SHARED
        const SHARED = 0x0000_0008;

        /// VM_MAYREAD
        const MAYREAD = 0x0000_0010;

        /// VM_MAYWRITE
        const MAYWRITE = 0x0000_0020;

        /// VM_MAYEXEC
        const MAYEXEC = 0x0000_0040;

        /// VM_MAYSHARE
        const MAYSHARE = 0x0000_0080;

        /// VM_GROWSDOWN
        const GROWSDOWN = 0x0000_0100;
    }
}

/// What a memory region is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    /// Executable mapping.
    Code,

    /// File-backed or anonymous data.
    Data,

    /// Anonymous writable memory below the stack range.
    Heap,

    /// A grows-down mapping at the top of a user address space.
    Stack,

    /// A shared-object mapping.
    Library,

    /// A kernel mapping.
    Kernel,
}

/// One virtual memory area of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// First mapped virtual address.
    pub start: Va,

    /// One past the last mapped virtual address.
    pub end: Va,

    /// Physical address backing `start`, zero when unresolved.
    pub start_pa: Pa,

    /// Region size in bytes.
    pub size: u64,

    /// Region size in 4 KiB pages.
    pub page_count: u64,

    /// Raw `vm_flags` value.
    pub flags: u64,

    /// r/w/x view of the flags.
    pub access: MemoryAccess,

    /// Classification of the region.
    pub kind: RegionKind,

    /// Backing file name, when the VMA is file-backed and the dentry chain
    /// resolves.
    pub file_name: Option<String>,

    /// Offset into the backing file in bytes (`vm_pgoff << 12`).
    pub file_offset: Option<u64>,
}

/// Reads and validates the VMA behind an untrusted pointer.
///
/// Returns `None` when the pointer does not resolve or the fields fail the
/// range invariants (`start < end <= 2^48`, whole pages, at least one
/// page).
pub fn read_vm_area<Driver>(
    gmi: &GmiCore<Driver>,
    offsets: &Offsets,
    kernel_pgd: Pa,
    process_pgd: Option<Pa>,
    vma: Va,
) -> Option<MemoryRegion>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    let __vma = &offsets.vm_area_struct;

    let vma = Aarch64::strip_pac(vma);

    let start = gmi.read_u64((vma + __vma.vm_start, kernel_pgd)).ok()?;
    let end = gmi.read_u64((vma + __vma.vm_end, kernel_pgd)).ok()?;
    let flags = gmi.read_u64((vma + __vma.vm_flags, kernel_pgd)).ok()?;

    if start >= end
        || end > Aarch64::USER_CEILING
        || end - start < 0x1000
        || (start | end) & 0xFFF != 0
    {
        return None;
    }

    let file = gmi
        .read_va((vma + __vma.vm_file, kernel_pgd))
        .map(Aarch64::strip_pac)
        .unwrap_or(Va(0));

    let (file_name, file_offset) = if file.is_null() {
        (None, None)
    } else {
        let offset = gmi
            .read_u64((vma + __vma.vm_pgoff, kernel_pgd))
            .ok()
            .map(|pgoff| pgoff << 12);

        (read_backing_file_name(gmi, offsets, kernel_pgd, file), offset)
    };

    let flags_bits = VmaFlags::from_bits_truncate(flags);

    let start_pa = process_pgd
        .and_then(|pgd| gmi.translate_address((Va(start), pgd)).ok())
        .unwrap_or(Pa(0));

    Some(MemoryRegion {
        start: Va(start),
        end: Va(end),
        start_pa,
        size: end - start,
        page_count: (end - start) >> 12,
        flags,
        access: access_from_flags(flags_bits),
        kind: classify(start, end, flags_bits, !file.is_null(), file_name.as_deref()),
        file_name,
        file_offset,
    })
}

/// Follows `file -> f_path.dentry -> d_name.name` to recover the backing
/// file name.
fn read_backing_file_name<Driver>(
    gmi: &GmiCore<Driver>,
    offsets: &Offsets,
    kernel_pgd: Pa,
    file: Va,
) -> Option<String>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    if !Aarch64::is_kernel_va(file) {
        return None;
    }

    let dentry = Aarch64::strip_pac(
        gmi.read_va((file + offsets.file.f_path_dentry, kernel_pgd))
            .ok()?,
    );
    if !Aarch64::is_kernel_va(dentry) {
        return None;
    }

    let name = gmi
        .read_va((dentry + offsets.dentry.d_name_name, kernel_pgd))
        .ok()?;
    if !Aarch64::is_kernel_va(name) {
        return None;
    }

    gmi.read_cstring((name, kernel_pgd), MAX_FILE_NAME).ok()?
}

fn access_from_flags(flags: VmaFlags) -> MemoryAccess {
    let mut access = MemoryAccess::default();

    if flags.contains(VmaFlags::READ) {
        access |= MemoryAccess::R;
    }
    if flags.contains(VmaFlags::WRITE) {
        access |= MemoryAccess::W;
    }
    if flags.contains(VmaFlags::EXEC) {
        access |= MemoryAccess::X;
    }

    access
}

/// Classifies a validated region.
fn classify(
    start: u64,
    end: u64,
    flags: VmaFlags,
    file_backed: bool,
    file_name: Option<&str>,
) -> RegionKind {
    if file_backed {
        if let Some(name) = file_name {
            if name.ends_with(".so") || name.contains(".so.") {
                return RegionKind::Library;
            }
        }

        return if flags.contains(VmaFlags::EXEC) {
            RegionKind::Code
        } else {
            RegionKind::Data
        };
    }

    if flags.contains(VmaFlags::GROWSDOWN) || near_user_top(start, end) {
        return RegionKind::Stack;
    }

    if flags.contains(VmaFlags::EXEC) {
        return RegionKind::Code;
    }

    if flags.contains(VmaFlags::WRITE) {
        return RegionKind::Heap;
    }

    RegionKind::Data
}

/// The upper edge of the 32-bit and 48-bit user address spaces, where the
/// main thread stack is placed.
fn near_user_top(start: u64, end: u64) -> bool {
    (start >= 0x7000_0000 && end <= 0x1_0000_0000) || start >= 0x7000_0000_0000
}

#[cfg(test)]
mod tests {
    use gmi_core::GmiCore;

    use super::*;
    use crate::testutil::MockImage;

    const RAM_BASE: u64 = 0x4000_0000;
    const RAM_SIZE: u64 = 0x100_0000;

    const KVA: u64 = 0xFFFF_0000_0000_0000;

    fn write_vma(image: &mut MockImage, pa: u64, start: u64, end: u64, flags: u64, file: u64) {
        let offsets = Offsets::modern();
        let __vma = &offsets.vm_area_struct;

        image.write_u64(pa + __vma.vm_start, start);
        image.write_u64(pa + __vma.vm_end, end);
        image.write_u64(pa + __vma.vm_flags, flags);
        image.write_u64(pa + __vma.vm_file, file);
    }

    fn region(image: MockImage, vma_pa: u64) -> Option<MemoryRegion> {
        let gmi = GmiCore::new(image.into_driver()).expect("core");
        let offsets = Offsets::modern();

        read_vm_area(&gmi, &offsets, Pa(RAM_BASE), None, Va(KVA | vma_pa))
    }

    /// Scenario: r/w anonymous mapping against the 32-bit user ceiling.
    #[test]
    fn classifies_top_of_address_space_as_stack() {
        let vma_pa = RAM_BASE + 0x2000;

        let mut image = MockImage::new(RAM_BASE, RAM_SIZE);
        write_vma(&mut image, vma_pa, 0x7FFF_0000, 0x7FFF_1000, 0x8B, 0);

        let region = region(image, vma_pa).expect("region");
        assert_eq!(region.kind, RegionKind::Stack);
        assert_eq!(region.size, 0x1000);
        assert_eq!(region.page_count, 1);
        assert_eq!(region.access, MemoryAccess::RW);
    }

    #[test]
    fn rejects_inverted_and_oversized_ranges() {
        for (start, end) in [
            (0x2000, 0x1000),                         // inverted
            (0x1000, 0x1000),                         // empty
            (0x1000, 0x1800),                         // sub-page
            (0x1000, (1 << 48) + 0x1000),             // beyond the ceiling
            (0x1234, 0x5678),                         // unaligned
        ] {
            let vma_pa = RAM_BASE + 0x2000;

            let mut image = MockImage::new(RAM_BASE, RAM_SIZE);
            write_vma(&mut image, vma_pa, start, end, 0x3, 0);

            assert!(region(image, vma_pa).is_none(), "{start:#x}..{end:#x}");
        }
    }

    #[test]
    fn recovers_backing_file_names() {
        let vma_pa = RAM_BASE + 0x2000;
        let file_pa = RAM_BASE + 0x3000;
        let dentry_pa = RAM_BASE + 0x4000;
        let name_pa = RAM_BASE + 0x5000;

        let offsets = Offsets::modern();

        let mut image = MockImage::new(RAM_BASE, RAM_SIZE);
        write_vma(
            &mut image,
            vma_pa,
            0x55_0000_0000,
            0x55_0001_0000,
            0x5, // r-x
            KVA | file_pa,
        );
        image.write_u64(vma_pa + offsets.vm_area_struct.vm_pgoff, 3);
        image.write_u64(file_pa + offsets.file.f_path_dentry, KVA | dentry_pa);
        image.write_u64(dentry_pa + offsets.dentry.d_name_name, KVA | name_pa);
        image.write_cstr(name_pa, "libc.so.6");

        let region = region(image, vma_pa).expect("region");
        assert_eq!(region.kind, RegionKind::Library);
        assert_eq!(region.file_name.as_deref(), Some("libc.so.6"));
        assert_eq!(region.file_offset, Some(3 << 12));
    }

    #[test]
    fn classifies_file_backed_code_and_data() {
        let vma_pa = RAM_BASE + 0x2000;
        let file_pa = RAM_BASE + 0x3000;
        let dentry_pa = RAM_BASE + 0x4000;
        let name_pa = RAM_BASE + 0x5000;

        let offsets = Offsets::modern();

        let mut image = MockImage::new(RAM_BASE, RAM_SIZE);
        write_vma(
            &mut image,
            vma_pa,
            0x40_0000,
            0x50_0000,
            0x5, // r-x
            KVA | file_pa,
        );
        image.write_u64(file_pa + offsets.file.f_path_dentry, KVA | dentry_pa);
        image.write_u64(dentry_pa + offsets.dentry.d_name_name, KVA | name_pa);
        image.write_cstr(name_pa, "busybox");

        let region = region(image, vma_pa).expect("region");
        assert_eq!(region.kind, RegionKind::Code);
        assert_eq!(region.file_name.as_deref(), Some("busybox"));
    }

    #[test]
    fn classifies_anonymous_writable_as_heap() {
        let vma_pa = RAM_BASE + 0x2000;

        let mut image = MockImage::new(RAM_BASE, RAM_SIZE);
        write_vma(&mut image, vma_pa, 0x2000_0000, 0x2001_0000, 0x3, 0);

        let region = region(image, vma_pa).expect("region");
        assert_eq!(region.kind, RegionKind::Heap);
    }

    #[test]
    fn unresolvable_file_pointer_keeps_file_classification() {
        let vma_pa = RAM_BASE + 0x2000;

        let mut image = MockImage::new(RAM_BASE, RAM_SIZE);
        // File pointer into unmapped kernel space: the name is simply lost.
        write_vma(
            &mut image,
            vma_pa,
            0x2000_0000,
            0x2001_0000,
            0x3,
            0xFFFF_8000_DEAD_0000,
        );

        let region = region(image, vma_pa).expect("region");
        assert_eq!(region.file_name, None);
        assert_eq!(region.kind, RegionKind::Data);
    }
}
