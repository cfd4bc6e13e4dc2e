use gmi::{
    arch::aarch64::Aarch64, driver::ram_image::RamImageDriver, os::linux::Discovery, CancelToken,
    GmiCore,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let path = std::env::args()
        .nth(1)
        .ok_or("usage: process-list <ram-image>")?;

    let driver = RamImageDriver::<Aarch64>::new(path)?;
    let gmi = GmiCore::new(driver)?;

    let output = Discovery::new(&gmi).run(&CancelToken::new())?;

    println!("{:>6} {:>5} {:<16} {:<18} {}", "PID", "KTHR", "COMM", "PGD", "PTEs");
    for process in &output.processes {
        let ptes = output
            .ptes_by_pid
            .get(&process.pid)
            .map(Vec::len)
            .unwrap_or(0);

        println!(
            "{:>6} {:>5} {:<16} {:<18} {}",
            process.pid,
            if process.kernel_thread { "yes" } else { "no" },
            process.comm,
            process
                .pgd
                .map(|pgd| format!("{pgd}"))
                .unwrap_or_else(|| "-".into()),
            ptes,
        );
    }

    Ok(())
}
