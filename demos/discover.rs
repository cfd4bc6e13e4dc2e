use gmi::{
    arch::aarch64::Aarch64,
    driver::ram_image::RamImageDriver,
    os::linux::{Discovery, DiscoveryConfig},
    CancelToken, GmiCore, Pa,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or("usage: discover <ram-image> [pgd-pa]")?;

    // An optional hypervisor-supplied kernel PGD skips the heuristic scan.
    let trusted_pgd = args
        .next()
        .map(|raw| u64::from_str_radix(raw.trim_start_matches("0x"), 16))
        .transpose()?
        .map(Pa);

    let driver = RamImageDriver::<Aarch64>::new(path)?;
    let gmi = GmiCore::new(driver)?;

    let output = Discovery::new(&gmi)
        .with_config(DiscoveryConfig {
            trusted_pgd,
            ..DiscoveryConfig::default()
        })
        .run(&CancelToken::new())?;

    match output.swapper_pg_dir {
        Some(pgd) => println!("kernel PGD: {pgd} (verified)"),
        None => println!("kernel PGD: unverified"),
    }

    let stats = &output.stats;
    println!(
        "processes: {} ({} user, {} kernel threads)",
        stats.total_processes, stats.user_processes, stats.kernel_threads,
    );
    println!(
        "mappings: {} total, {} kernel; pages: {} unique, {} shared, {} zero",
        stats.total_ptes,
        stats.kernel_ptes,
        stats.unique_pages,
        stats.shared_pages,
        stats.zero_pages,
    );

    println!(
        "page cache: {} files, {} pages ({} bytes) on {} filesystems",
        output.page_cache.cached_files.len(),
        output.page_cache.total_cached_pages,
        output.page_cache.total_cached_bytes,
        output.page_cache.filesystems.len(),
    );

    for fs in &output.page_cache.filesystems {
        println!(
            "  {:<10} [{}] {} inodes walked, {} cached files",
            fs.fs_type, fs.s_id, fs.inodes_walked, fs.cached_files,
        );
    }

    Ok(())
}
