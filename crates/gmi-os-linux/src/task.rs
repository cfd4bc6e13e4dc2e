//! Pattern scan for process descriptors.
//!
//! Task structs are recognized without any anchor symbol: every SLAB slot
//! the allocator could have placed one in is read at the profiled field
//! offsets and put through a weighted plausibility filter. Everything read
//! here is untrusted; a candidate only survives when several independent
//! signals agree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use gmi_core::{Architecture as _, CancelToken, GmiCore, GmiError, ImageDriver, Pa, Va};

use gmi_arch_aarch64::Aarch64;

use crate::offsets::Offsets;

/// Upper bound of the default PID space.
pub const PID_MAX: u32 = 32768;

/// How often the scan reports progress and polls for cancellation.
const PROGRESS_INTERVAL: u64 = 100 * 1024 * 1024;

/// Minimum cumulative score for a candidate to be accepted.
const ACCEPT_SCORE: i32 = 3;

/// Well-known names short enough to fail the length rule.
const SHORT_NAME_WHITELIST: &[&str] = &["sh", "ps", "su", "vi", "ip", "nc"];

/// Name prefixes of processes that are present on practically every
/// system; a match is the strongest single signal the scanner has.
const KNOWN_TASK_PREFIXES: &[&str] = &[
    "init",
    "systemd",
    "kthreadd",
    "ksoftirqd",
    "kswapd",
    "kworker",
    "kdevtmpfs",
    "kcompactd",
    "khugepaged",
    "kauditd",
    "rcu_",
    "migration/",
    "cpuhp/",
    "watchdog",
    "idle_inject",
    "sshd",
    "bash",
    "login",
    "getty",
];

/// A process recovered from the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    /// Process ID.
    pub pid: u32,

    /// Short name (`task_struct.comm`).
    pub comm: String,

    /// Physical address the descriptor was found at.
    pub task_pa: Pa,

    /// Virtual address of the descriptor, inferred through the task list.
    /// Zero when the inference failed.
    pub task_va: Va,

    /// The memory descriptor pointer (`task_struct.mm`, PAC-stripped).
    /// Zero for kernel threads.
    pub mm_va: Va,

    /// Whether this is a kernel thread (no user address space).
    pub kernel_thread: bool,

    /// The file table pointer (`task_struct.files`), when it looks valid.
    pub files_va: Option<Va>,

    /// Task list forward link.
    pub tasks_next: Va,

    /// Task list backward link.
    pub tasks_prev: Va,

    /// Physical address of the process page directory, resolved through
    /// the memory descriptor. `None` for kernel threads and when the
    /// resolution failed.
    pub pgd: Option<Pa>,

    /// The plausibility score the candidate achieved.
    pub score: i32,
}

/// Scans the whole image for task structs.
///
/// Candidates are deduplicated by PID: the higher score wins, then the
/// lower image address. The result is ordered by PID.
pub fn scan_tasks<Driver>(
    gmi: &GmiCore<Driver>,
    offsets: &Offsets,
    cancel: &CancelToken,
) -> Result<Vec<ProcessDescriptor>, GmiError>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    let info = gmi.info();
    let sub_offsets = offsets.slab_sub_offsets();

    let mut by_pid: BTreeMap<u32, ProcessDescriptor> = BTreeMap::new();
    let mut next_progress = PROGRESS_INTERVAL;

    let mut offset = 0u64;
    while offset + Aarch64::PAGE_SIZE <= info.ram_size {
        if offset >= next_progress {
            if cancel.is_cancelled() {
                return Err(GmiError::Cancelled);
            }

            tracing::info!(
                scanned_mib = offset / (1024 * 1024),
                found = by_pid.len(),
                "task scan progress"
            );
            next_progress += PROGRESS_INTERVAL;
        }

        for &sub in &sub_offsets {
            let base = info.ram_base + offset + sub;

            let Some(candidate) = score_candidate(gmi, offsets, base) else {
                continue;
            };

            let replace = match by_pid.get(&candidate.pid) {
                Some(existing) => {
                    candidate.score > existing.score
                        || (candidate.score == existing.score
                            && candidate.task_pa < existing.task_pa)
                }
                None => true,
            };

            if replace {
                by_pid.insert(candidate.pid, candidate);
            }
        }

        offset += Aarch64::PAGE_SIZE;
    }

    Ok(by_pid.into_values().collect())
}

/// Reads and scores one candidate descriptor. `None` means rejected.
fn score_candidate<Driver>(
    gmi: &GmiCore<Driver>,
    offsets: &Offsets,
    base: Pa,
) -> Option<ProcessDescriptor>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    let __task = &offsets.task_struct;

    let pid = gmi.read_u32(base + __task.pid).ok()?;
    if !(1..=PID_MAX).contains(&pid) {
        return None;
    }

    let mut comm = [0u8; 16];
    gmi.read(base + __task.comm, &mut comm).ok()?;
    let name = validate_comm(&comm)?;

    let mm_va = Aarch64::strip_pac(gmi.read_va(base + __task.mm).ok()?);
    let kernel_thread = mm_va.is_null();
    if !kernel_thread && !Aarch64::is_kernel_va(mm_va) {
        return None;
    }

    let tasks_next = gmi.read_va(base + __task.tasks).ok()?;
    let tasks_prev = gmi.read_va(base + __task.tasks + 8).ok()?;
    let list_valid = Aarch64::is_kernel_va(tasks_next) && Aarch64::is_kernel_va(tasks_prev);

    let kernel_pointers = count_kernel_pointers(gmi, base)?;
    if kernel_pointers < 3 {
        return None;
    }

    let mut score = 0;

    if is_known_name(&name) {
        score += 3;
    }
    if list_valid {
        score += 2;
    }
    if kernel_pointers >= 5 {
        score += 2;
    }
    if kernel_pointers >= 10 {
        score += 1;
    }
    // The descriptor pointer already passed the zero-or-kernel check.
    score += 1;

    if score < ACCEPT_SCORE {
        return None;
    }

    let files_va = match gmi.read_va(base + __task.files) {
        Ok(files) => {
            let files = Aarch64::strip_pac(files);
            Aarch64::is_kernel_va(files).then_some(files)
        }
        Err(_) => None,
    };

    Some(ProcessDescriptor {
        pid,
        comm: name,
        task_pa: base,
        task_va: Va(0),
        mm_va,
        kernel_thread,
        files_va,
        tasks_next,
        tasks_prev,
        pgd: None,
        score,
    })
}

/// Counts kernel-space pointers among the first 64 aligned slots of the
/// candidate.
fn count_kernel_pointers<Driver>(gmi: &GmiCore<Driver>, base: Pa) -> Option<usize>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    let mut head = [0u8; 512];
    gmi.read(base, &mut head).ok()?;

    Some(
        head.chunks_exact(8)
            .filter(|chunk| {
                let value = u64::from_le_bytes((*chunk).try_into().expect("8-byte chunk"));
                Aarch64::is_kernel_va(Va(value))
            })
            .count(),
    )
}

/// Validates a `comm` field and returns the name.
///
/// The name must be a NUL-terminated printable string of the task-name
/// character set, with at least two alphanumerics and no random-looking
/// case churn.
fn validate_comm(comm: &[u8; 16]) -> Option<String> {
    let len = comm.iter().position(|&b| b == 0)?;
    if len == 0 {
        return None;
    }

    let bytes = &comm[..len];

    let first = bytes[0];
    if !(first.is_ascii_alphabetic() || first == b'/') {
        return None;
    }

    if !bytes.iter().all(|&b| {
        b.is_ascii_alphanumeric() || matches!(b, b'/' | b'-' | b'_' | b'[' | b']' | b':' | b'.' | b'$')
    }) {
        return None;
    }

    if bytes.iter().filter(|b| b.is_ascii_alphanumeric()).count() < 2 {
        return None;
    }

    // Printable ASCII only, so the conversion cannot fail.
    let name = String::from_utf8_lossy(bytes).into_owned();

    if len < 3 && !SHORT_NAME_WHITELIST.contains(&name.as_str()) {
        return None;
    }

    if case_transitions(bytes) > len / 2 {
        return None;
    }

    Some(name)
}

/// Counts lower/upper case alternations between adjacent letters.
fn case_transitions(bytes: &[u8]) -> usize {
    bytes
        .windows(2)
        .filter(|pair| {
            pair[0].is_ascii_alphabetic()
                && pair[1].is_ascii_alphabetic()
                && pair[0].is_ascii_lowercase() != pair[1].is_ascii_lowercase()
        })
        .count()
}

fn is_known_name(name: &str) -> bool {
    SHORT_NAME_WHITELIST.contains(&name)
        || KNOWN_TASK_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

/// Resolves the process page directory and descriptor VA of an accepted
/// user process through the kernel PGD.
///
/// The memory descriptor pointer is translated, the PGD slot is read, and
/// a value that is itself a kernel VA is translated again; a value already
/// inside guest RAM is adopted as a physical address. Failures leave the
/// descriptor untouched.
pub fn resolve_process_paging<Driver>(
    gmi: &GmiCore<Driver>,
    offsets: &Offsets,
    kernel_pgd: Pa,
    process: &mut ProcessDescriptor,
) where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    let __task = &offsets.task_struct;
    let __mm = &offsets.mm_struct;

    if !process.kernel_thread {
        if gmi.translate_address((process.mm_va, kernel_pgd)).is_err() {
            tracing::debug!(pid = process.pid, mm = %process.mm_va, "mm not translatable");
            return;
        }

        if let Ok(users) = gmi.read_u32((process.mm_va + __mm.mm_users, kernel_pgd)) {
            if users == 0 {
                tracing::debug!(pid = process.pid, "mm_users is zero, stale descriptor?");
            }
        }

        if let Ok(pgd_raw) = gmi.read_u64((process.mm_va + __mm.pgd, kernel_pgd)) {
            process.pgd = if Aarch64::is_kernel_va(Va(pgd_raw)) {
                gmi.translate_address((Va(pgd_raw), kernel_pgd)).ok()
            } else if gmi.contains(Pa(pgd_raw)) {
                Some(Pa(pgd_raw))
            } else {
                None
            };
        }
    }

    // The next element's back link names our own list entry, which pins
    // down the descriptor's virtual address.
    if let Ok(next_pa) = gmi.translate_address((process.tasks_next, kernel_pgd)) {
        if let Ok(back) = gmi.read_va(next_pa + 8) {
            let expected = process.task_pa + __task.tasks;

            if gmi.translate_address((back, kernel_pgd)).ok() == Some(expected) {
                process.task_va = back - __task.tasks;
            }
        }
    }
}
