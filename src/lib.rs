//! # Guest Memory Introspection
//!
//! Offline introspection of Linux guest physical-memory captures
//! (ARM64, 4 KiB pages, 48-bit VAs, 4-level translation).
//!
//! Given a flat image of guest RAM - and, optionally, a hypervisor-trusted
//! value of the kernel's top-level page directory - the library
//! reconstructs:
//!
//! - the set of live processes, by pattern-scanning for task structs;
//! - per-process virtual-to-physical mappings, by walking user page
//!   tables (including 1 GiB and 2 MiB block mappings);
//! - per-process memory regions, by walking each memory descriptor's
//!   maple tree;
//! - kernel-space mappings, by walking the swapper page directory;
//! - a reverse index from physical pages to the processes referencing
//!   them;
//! - the page cache, by walking the superblock list, each superblock's
//!   inodes and each inode's xarray of cached pages, cross-checked
//!   against open file descriptors.
//!
//! Every structure is read from untrusted bytes: candidates are
//! recognized by shape, validated field by field, and failures degrade
//! into counters rather than errors.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use gmi::{
//!     arch::aarch64::Aarch64,
//!     driver::ram_image::RamImageDriver,
//!     os::linux::Discovery,
//!     CancelToken, GmiCore,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Memory-map the capture. The first byte of the file is the byte
//!     // at the guest RAM base.
//!     let driver = RamImageDriver::<Aarch64>::new("guest-ram.bin")?;
//!     let gmi = GmiCore::new(driver)?;
//!
//!     // Run the discovery pass.
//!     let output = Discovery::new(&gmi).run(&CancelToken::new())?;
//!
//!     for process in &output.processes {
//!         println!(
//!             "{:>6} {:<16} kernel_thread={} pgd={:?}",
//!             process.pid, process.comm, process.kernel_thread, process.pgd,
//!         );
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The workspace mirrors the concerns of the problem:
//!
//! - [`GmiCore`]: translation-aware reads over an [`ImageDriver`], with
//!   page and V2P caches.
//! - [`arch::aarch64`]: descriptors, the 4-level translator, the
//!   linear-map shortcut, and the exhaustive leaf-mapping walker.
//! - [`os::linux`]: structure offsets, the kernel-PGD locator, the task
//!   scanner, the maple-tree and page-cache walkers, and the
//!   [`Discovery`] driver tying them together.
//! - [`driver::ram_image`]: the flat capture file driver.
//!
//! [`Discovery`]: crate::os::linux::Discovery

pub use gmi_core::*;

pub mod arch {
    //! Architecture support.

    pub use gmi_core::arch::*;

    pub mod aarch64 {
        //! AArch64 paging and translation.

        pub use gmi_arch_aarch64::*;
    }
}

pub mod driver {
    //! Image drivers.

    pub mod ram_image {
        //! Flat RAM capture files.

        pub use gmi_driver_ram_image::*;
    }
}

pub mod os {
    //! Guest OS structure discovery.

    pub mod linux {
        //! Linux guests.

        pub use gmi_os_linux::*;
    }
}
