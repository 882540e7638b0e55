//! Optional-feature detection, probed at most once per process.
//!
//! Every predicate first consults the kernel version against the release that
//! fixed or introduced the feature; only older kernels pay for a live probe.
//! Results are memoized, so the prober behaves as a lazily filled,
//! write-once cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::debug;

use crate::attr::default_attr;
use crate::env::kernel_version;
use crate::event::find_event_type;
use crate::fd::EventFd;
use crate::ffi::syscall::perf_event_open;
use crate::ffi::{bindings as b, deref_offset, Attr};

// Register masks for the dwarf-callchain probe; frame/stack/instruction
// pointer bits are enough to exercise PERF_SAMPLE_REGS_USER.
#[cfg(target_arch = "x86_64")]
const PROBE_REG_MASK: u64 = (1 << 6) | (1 << 7) | (1 << 8); // bp, sp, ip
#[cfg(target_arch = "aarch64")]
const PROBE_REG_MASK: u64 = (1 << 29) | (1 << 31) | (1 << 32); // fp, sp, pc
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const PROBE_REG_MASK: u64 = 1;

fn kernel_at_least(major: u32, minor: u32) -> bool {
    kernel_version().is_some_and(|v| v >= (major, minor))
}

/// User register mask for `PERF_SAMPLE_REGS_USER` on this architecture.
pub fn supported_reg_mask() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // All general-purpose registers except the segment registers
        // (ds/es/fs/gs), which the kernel rejects in user reg masks.
        ((1u64 << 24) - 1) & !(0xf << 12)
    }
    #[cfg(target_arch = "aarch64")]
    {
        (1u64 << 33) - 1
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        PROBE_REG_MASK
    }
}

/// Checks whether the kernel accepts `attr` by opening a throwaway event on
/// the current process across all CPUs.
pub fn is_event_attr_supported(attr: &Attr, event_name: &str) -> bool {
    match perf_event_open(attr, 0, -1, -1, b::PERF_FLAG_FD_CLOEXEC) {
        Ok(_fd) => true,
        Err(e) => {
            debug!("attr probe for '{event_name}' failed: {e}");
            false
        }
    }
}

fn memoized(cell: &'static OnceLock<bool>, probe: impl FnOnce() -> bool) -> bool {
    *cell.get_or_init(probe)
}

/// Whether the PMU supports branch-stack sampling.
pub fn branch_sampling_supported() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    memoized(&CELL, || {
        let Some(ty) = find_event_type("BR_INST_RETIRED.NEAR_TAKEN") else {
            return false;
        };
        let mut attr = default_attr(&ty);
        attr.sample_type |= b::PERF_SAMPLE_BRANCH_STACK;
        attr.branch_sample_type = b::PERF_SAMPLE_BRANCH_ANY;
        attr.set_flag(b::ATTR_FLAG_EXCLUDE_KERNEL, true);
        is_event_attr_supported(&attr, &ty.name)
    })
}

/// Whether dwarf-based call chain sampling (user regs + stack dump) works.
/// Complete since kernel 3.18.
pub fn dwarf_callchain_supported() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    memoized(&CELL, || {
        if kernel_at_least(3, 18) {
            return true;
        }
        let Some(ty) = find_event_type("cpu-clock") else {
            return false;
        };
        let mut attr = default_attr(&ty);
        attr.sample_type |=
            b::PERF_SAMPLE_CALLCHAIN | b::PERF_SAMPLE_REGS_USER | b::PERF_SAMPLE_STACK_USER;
        attr.set_flag(b::ATTR_FLAG_EXCLUDE_CALLCHAIN_USER, true);
        attr.set_flag(b::ATTR_FLAG_EXCLUDE_KERNEL, true);
        attr.sample_regs_user = PROBE_REG_MASK;
        attr.sample_stack_user = 8192;
        is_event_attr_supported(&attr, &ty.name)
    })
}

/// Whether samples of tracepoint events carry valid user registers. Fixed on
/// arm64 by kernel 4.2; older kernels get a live probe that must observe a
/// real sample.
pub fn dump_regs_on_tracepoint_supported() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    memoized(&CELL, || {
        if kernel_at_least(4, 2) {
            return true;
        }
        probe_tracepoint_regs()
    })
}

/// Arms a sched_switch tracepoint against a scratch thread, forces it to
/// sched out, and checks that the resulting sample has a non-zero user ip.
fn probe_tracepoint_regs() -> bool {
    let Some(ty) = find_event_type("sched:sched_switch") else {
        return false;
    };
    let done = Arc::new(AtomicBool::new(false));
    let (tid_tx, tid_rx) = std::sync::mpsc::channel();
    let thread = {
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            tid_tx.send(unsafe { libc::gettid() }).ok();
            while !done.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_micros(1));
            }
            // One more sleep to force a sched out and generate a sample.
            std::thread::sleep(Duration::from_micros(1));
        })
    };
    let tid = match tid_rx.recv() {
        Ok(tid) => tid,
        Err(_) => return false,
    };

    let mut attr = default_attr(&ty);
    attr.set_flag(b::ATTR_FLAG_FREQ, false);
    attr.sample_period_or_freq = 1;
    let result = (|| {
        let mut fd = EventFd::open(&attr, tid, -1, None, &ty.name, false).ok()?;
        fd.create_mmap_buffer(4, false).ok()?;
        done.store(true, Ordering::Release);
        let _ = thread.join();

        // Samples may lag the join briefly; poll up to ~1s before declaring
        // the feature unsupported.
        let mut buf = Vec::new();
        for _ in 0..1000 {
            buf.clear();
            fd.read_available_data(&mut buf);
            if let Some(ip) = first_sample_ip(&attr, &buf) {
                return Some(ip != 0);
            }
            std::thread::sleep(Duration::from_micros(1));
        }
        Some(false)
    })();
    done.store(true, Ordering::Release);
    result.unwrap_or(false)
}

// Walks raw ring-buffer records and pulls the leading ip out of the first
// PERF_RECORD_SAMPLE (the default sample type puts PERF_SAMPLE_IP first).
fn first_sample_ip(attr: &Attr, buf: &[u8]) -> Option<u64> {
    debug_assert!(attr.sample_type & b::PERF_SAMPLE_IP != 0);
    let mut offset = 0;
    while offset + size_of::<b::PerfEventHeader>() <= buf.len() {
        let mut ptr = buf[offset..].as_ptr();
        let header: b::PerfEventHeader = unsafe { deref_offset(&mut ptr) };
        if header.size as usize == 0 || offset + header.size as usize > buf.len() {
            return None;
        }
        if header.type_ == b::PERF_RECORD_SAMPLE {
            let ip: u64 = unsafe { deref_offset(&mut ptr) };
            return Some(ip);
        }
        offset += header.size as usize;
    }
    None
}

/// Whether per-event clocks can be selected. In the kernel since 4.1.
pub fn clockid_setting_supported() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    memoized(&CELL, || {
        if kernel_at_least(4, 1) {
            return true;
        }
        let Some(ty) = find_event_type("cpu-clock") else {
            return false;
        };
        let mut attr = default_attr(&ty);
        attr.set_flag(b::ATTR_FLAG_USE_CLOCKID, true);
        attr.clockid = libc::CLOCK_MONOTONIC;
        is_event_attr_supported(&attr, &ty.name)
    })
}

/// Whether mmap2 records are available. In the kernel since 3.12.
pub fn mmap2_supported() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    memoized(&CELL, || {
        if kernel_at_least(3, 12) {
            return true;
        }
        let Some(ty) = find_event_type("cpu-clock") else {
            return false;
        };
        let mut attr = default_attr(&ty);
        attr.set_flag(b::ATTR_FLAG_MMAP2, true);
        is_event_attr_supported(&attr, &ty.name)
    })
}

pub fn hardware_event_supported() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    memoized(&CELL, || {
        let Some(ty) = find_event_type("cpu-cycles") else {
            return false;
        };
        let mut attr = default_attr(&ty);
        attr.set_flag(b::ATTR_FLAG_EXCLUDE_KERNEL, true);
        is_event_attr_supported(&attr, &ty.name)
    })
}

/// Whether PERF_RECORD_SWITCH context-switch records exist (kernel 4.3).
pub fn context_switch_supported() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    memoized(&CELL, || kernel_at_least(4, 3))
}

/// Whether kernel-space profiling is permitted for this process.
pub fn kernel_event_supported() -> bool {
    static CELL: OnceLock<bool> = OnceLock::new();
    memoized(&CELL, || {
        let Some(ty) = find_event_type("cpu-clock") else {
            return false;
        };
        let attr = default_attr(&ty);
        is_event_attr_supported(&attr, &ty.name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_ip_extraction() {
        // A fabricated ring: one mmap record to skip, then a sample.
        let mut buf = Vec::new();
        let skip = b::PerfEventHeader {
            type_: 1,
            misc: 0,
            size: 16,
        };
        buf.extend_from_slice(&skip.type_.to_ne_bytes());
        buf.extend_from_slice(&skip.misc.to_ne_bytes());
        buf.extend_from_slice(&skip.size.to_ne_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        let sample = b::PerfEventHeader {
            type_: b::PERF_RECORD_SAMPLE,
            misc: 0,
            size: 16,
        };
        buf.extend_from_slice(&sample.type_.to_ne_bytes());
        buf.extend_from_slice(&sample.misc.to_ne_bytes());
        buf.extend_from_slice(&sample.size.to_ne_bytes());
        buf.extend_from_slice(&0xdead_beefu64.to_ne_bytes());

        let ty = find_event_type("cpu-clock").unwrap();
        let attr = default_attr(&ty);
        assert_eq!(first_sample_ip(&attr, &buf), Some(0xdead_beef));
        assert_eq!(first_sample_ip(&attr, &buf[..8]), None);
    }

    #[test]
    fn version_gated_predicates_are_stable() {
        assert_eq!(context_switch_supported(), context_switch_supported());
    }
}
