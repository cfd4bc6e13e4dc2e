//! Heuristic location of the kernel's top-level page directory.
//!
//! A flat RAM capture carries no register state, so `swapper_pg_dir` has to
//! be recognized by shape: a sparse 512-entry table with a handful of valid
//! kernel-half entries, whose first child looks like the base of the linear
//! map. Any candidate that survives the signature is confirmed by actually
//! translating two linear-map addresses.

use gmi_core::{Architecture as _, CancelToken, GmiCore, GmiError, ImageDriver, Pa, Va};

use gmi_arch_aarch64::Aarch64;

/// How often the scan reports progress and polls for cancellation.
const PROGRESS_INTERVAL: u64 = 100 * 1024 * 1024;

/// How many scored candidates are put through translation verification.
const MAX_VERIFY_ATTEMPTS: usize = 16;

/// A located kernel page directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapperPgd {
    /// Physical address of the page directory.
    pub pa: Pa,

    /// Whether translation verification succeeded.
    ///
    /// An unverified PGD is still usable, but every translation derived
    /// from it is best-effort.
    pub verified: bool,

    /// The signature score the candidate achieved.
    pub score: i32,

    /// Estimated gigabytes of linearly mapped RAM, from the run of
    /// consecutive valid entries at the start of the first child table.
    pub mem_gib_estimate: u32,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    pa: Pa,
    score: i32,
    mem_gib: u32,
}

/// Locates the kernel PGD.
///
/// A caller-supplied (hypervisor-trusted) address takes priority; it is
/// still structurally validated, and falls back to the full scan when the
/// validation fails. The scan walks every 4 KiB-aligned page of the image.
pub fn locate_kernel_pgd<Driver>(
    gmi: &GmiCore<Driver>,
    trusted: Option<Pa>,
    cancel: &CancelToken,
) -> Result<Option<SwapperPgd>, GmiError>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    if let Some(pa) = trusted {
        match evaluate_candidate(gmi, pa) {
            Some(candidate) => {
                let verified = verify_linear_identity(gmi, pa);

                tracing::info!(%pa, verified, "adopted trusted kernel PGD");

                return Ok(Some(SwapperPgd {
                    pa,
                    verified,
                    score: candidate.score,
                    mem_gib_estimate: candidate.mem_gib,
                }));
            }
            None => {
                tracing::warn!(
                    %pa,
                    "trusted kernel PGD failed structural validation, falling back to scan"
                );
            }
        }
    }

    scan(gmi, cancel)
}

/// Checks whether `pa` carries the structural signature of a kernel PGD.
pub fn validate_pgd_signature<Driver>(gmi: &GmiCore<Driver>, pa: Pa) -> bool
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    evaluate_candidate(gmi, pa).is_some()
}

fn scan<Driver>(
    gmi: &GmiCore<Driver>,
    cancel: &CancelToken,
) -> Result<Option<SwapperPgd>, GmiError>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    let info = gmi.info();

    let mut candidates = Vec::new();
    let mut next_progress = PROGRESS_INTERVAL;

    let mut offset = 0u64;
    while offset + Aarch64::PAGE_SIZE <= info.ram_size {
        if offset >= next_progress {
            if cancel.is_cancelled() {
                return Err(GmiError::Cancelled);
            }

            tracing::debug!(
                scanned_mib = offset / (1024 * 1024),
                candidates = candidates.len(),
                "kernel PGD scan progress"
            );
            next_progress += PROGRESS_INTERVAL;
        }

        let pa = info.ram_base + offset;
        offset += Aarch64::PAGE_SIZE;

        if let Some(candidate) = evaluate_candidate(gmi, pa) {
            tracing::debug!(
                %pa,
                score = candidate.score,
                mem_gib = candidate.mem_gib,
                "kernel PGD candidate"
            );
            candidates.push(candidate);
        }
    }

    // Higher score first; the lower address wins a tie so reruns are
    // deterministic.
    candidates.sort_by(|a, b| b.score.cmp(&a.score).then(a.pa.cmp(&b.pa)));

    for candidate in candidates.iter().take(MAX_VERIFY_ATTEMPTS) {
        if verify_linear_identity(gmi, candidate.pa) {
            tracing::info!(pa = %candidate.pa, score = candidate.score, "kernel PGD verified");

            return Ok(Some(SwapperPgd {
                pa: candidate.pa,
                verified: true,
                score: candidate.score,
                mem_gib_estimate: candidate.mem_gib,
            }));
        }
    }

    match candidates.first() {
        Some(best) => {
            tracing::warn!(
                pa = %best.pa,
                score = best.score,
                "no kernel PGD candidate verified, continuing unverified"
            );

            Ok(Some(SwapperPgd {
                pa: best.pa,
                verified: false,
                score: best.score,
                mem_gib_estimate: best.mem_gib,
            }))
        }
        None => Ok(None),
    }
}

/// Reads a page as 512 descriptors. Returns `None` on a miss.
fn read_descriptor_page<Driver>(gmi: &GmiCore<Driver>, pa: Pa) -> Option<[u64; 512]>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    let page = gmi.read_page(Aarch64::gfn_from_pa(pa)).ok()?;
    if page.len() < 4096 {
        return None;
    }

    let mut entries = [0u64; 512];
    for (entry, bytes) in entries.iter_mut().zip(page[..4096].chunks_exact(8)) {
        *entry = u64::from_le_bytes(bytes.try_into().expect("8-byte chunk"));
    }

    Some(entries)
}

fn evaluate_candidate<Driver>(gmi: &GmiCore<Driver>, pa: Pa) -> Option<Candidate>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    const TABLE: u64 = 0b11;

    // Entry 0 anchors the linear map; rejecting on it first keeps the scan
    // cheap on the overwhelmingly common non-PGD page.
    let first = gmi.read_u64(pa).ok()?;
    if first & 0b11 != TABLE {
        return None;
    }

    let entries = read_descriptor_page(gmi, pa)?;

    let user_valid = entries[..256].iter().filter(|e| *e & 0b11 == TABLE).count();
    let kernel_valid = entries[256..].iter().filter(|e| *e & 0b11 == TABLE).count();

    if user_valid + kernel_valid > 20 || user_valid > 5 || !(2..=10).contains(&kernel_valid) {
        return None;
    }

    let child = Pa(entries[0] & 0x0000_FFFF_FFFF_F000);
    if !gmi.contains(child) {
        return None;
    }

    let child_entries = read_descriptor_page(gmi, child)?;
    let child_valid = child_entries.iter().filter(|e| *e & 1 == 1).count();
    if !(1..=64).contains(&child_valid) {
        return None;
    }

    // A linear map shows up as a run of valid entries from index 0; its
    // length estimates the mapped RAM in GiB.
    let linear_run = child_entries.iter().take_while(|e| *e & 1 == 1).count() as u32;

    let mut score = 0;

    if matches!(linear_run, 1 | 2 | 4 | 6 | 8 | 16 | 32) {
        score += 2;
    }

    // Kernel text lives at the first kernel-half slot.
    if entries[256] & 0b11 == TABLE {
        score += 2;
    }

    // Fixmap and early console tables sit in the last few slots.
    score += entries[500..].iter().filter(|e| *e & 0b11 == TABLE).count() as i32;

    Some(Candidate {
        pa,
        score,
        mem_gib: linear_run,
    })
}

/// Confirms a candidate by translating two linear-map addresses and
/// checking the identity `VA(ram_base + k) -> PA(ram_base + k)`.
fn verify_linear_identity<Driver>(gmi: &GmiCore<Driver>, root: Pa) -> bool
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    let base = gmi.info().ram_base;

    for k in [0u64, 0x20_0000] {
        let expected = base + k;

        match Aarch64::translate_address(gmi, Va(base.0 + k), root) {
            Ok(pa) if pa == expected => {}
            _ => return false,
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use gmi_core::GmiCore;

    use super::*;
    use crate::testutil::MockImage;

    const RAM_BASE: u64 = 0x4000_0000;

    fn table(next: u64) -> u64 {
        next | 0b11
    }

    fn block(pa: u64) -> u64 {
        pa | 0b01 | (1 << 10)
    }

    /// The documented discovery scenario: a PGD page at 0x136DBF000 with
    /// entries {0, 256, 507, 511} and a child linearly mapping [0, 5 GiB).
    #[test]
    fn locates_and_verifies_a_lone_pgd() {
        let pgd = 0x1_36DB_F000u64;
        let pud = pgd + 0x1000;

        let mut image = MockImage::new(RAM_BASE, 0xF700_0000);
        image.write_u64(pgd, table(pud));
        image.write_u64(pgd + 256 * 8, table(pud));
        image.write_u64(pgd + 507 * 8, table(pud));
        image.write_u64(pgd + 511 * 8, table(pud));

        for i in 0..5u64 {
            image.write_u64(pud + i * 8, block(i << 30));
        }

        let gmi = GmiCore::new(image.into_driver()).expect("core");

        let swapper = locate_kernel_pgd(&gmi, None, &CancelToken::new())
            .expect("scan")
            .expect("candidate");

        assert_eq!(swapper.pa, Pa(pgd));
        assert!(swapper.verified);
        assert_eq!(swapper.mem_gib_estimate, 5);
    }

    #[test]
    fn rejects_dense_tables() {
        let pgd = RAM_BASE + 0x1000;
        let pud = RAM_BASE + 0x2000;

        let mut image = MockImage::new(RAM_BASE, 0x40_0000);
        // 30 valid kernel-half entries: too many for a top-level table.
        image.write_u64(pgd, table(pud));
        for i in 256..286u64 {
            image.write_u64(pgd + i * 8, table(pud));
        }
        for i in 0..4u64 {
            image.write_u64(pud + i * 8, block(i << 30));
        }

        let gmi = GmiCore::new(image.into_driver()).expect("core");

        assert!(!validate_pgd_signature(&gmi, Pa(pgd)));
    }

    #[test]
    fn trusted_pgd_is_validated_before_adoption() {
        let pgd = RAM_BASE + 0x1000;
        let pud = RAM_BASE + 0x2000;

        let mut image = MockImage::new(RAM_BASE, 0x40_0000);
        image.write_u64(pgd, table(pud));
        image.write_u64(pgd + 256 * 8, table(pud));
        image.write_u64(pgd + 260 * 8, table(pud));
        // Identity-map the first four gigabytes.
        for i in 0..4u64 {
            image.write_u64(pud + i * 8, block(i << 30));
        }

        let gmi = GmiCore::new(image.into_driver()).expect("core");

        let swapper = locate_kernel_pgd(&gmi, Some(Pa(pgd)), &CancelToken::new())
            .expect("locate")
            .expect("candidate");
        assert_eq!(swapper.pa, Pa(pgd));
        assert!(swapper.verified);

        // A garbage trusted value falls back to the scan and still finds
        // the real PGD.
        let swapper = locate_kernel_pgd(&gmi, Some(Pa(RAM_BASE + 0x3000)), &CancelToken::new())
            .expect("locate")
            .expect("candidate");
        assert_eq!(swapper.pa, Pa(pgd));
    }

    #[test]
    fn unverified_best_candidate_is_reported() {
        let pgd = RAM_BASE + 0x1000;
        let pud = RAM_BASE + 0x2000;

        let mut image = MockImage::new(RAM_BASE, 0x40_0000);
        image.write_u64(pgd, table(pud));
        image.write_u64(pgd + 256 * 8, table(pud));
        image.write_u64(pgd + 300 * 8, table(pud));
        // The child is sparse but maps nothing linearly, so verification
        // cannot succeed.
        image.write_u64(pud + 40 * 8, table(RAM_BASE + 0x3000));

        let gmi = GmiCore::new(image.into_driver()).expect("core");

        let swapper = locate_kernel_pgd(&gmi, None, &CancelToken::new())
            .expect("scan")
            .expect("candidate");
        assert_eq!(swapper.pa, Pa(pgd));
        assert!(!swapper.verified);
    }

    #[test]
    fn cancellation_aborts_the_scan() {
        // 256 MiB: enough to reach the 100 MiB cancellation poll.
        let image = MockImage::new(RAM_BASE, 0x1000_0000);
        let gmi = GmiCore::new(image.into_driver()).expect("core");

        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            locate_kernel_pgd(&gmi, None, &cancel),
            Err(GmiError::Cancelled)
        ));
    }
}
