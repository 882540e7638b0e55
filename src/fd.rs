//! Ownership of a single kernel event file descriptor.

use std::cell::Cell;
use std::fs::File;
use std::io;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use libc::pid_t;
use log::{debug, error};

use crate::error::{Error, Result};
use crate::ffi::syscall::{self, ioctl_arg, ioctl_argp, perf_event_open};
use crate::ffi::{bindings as b, page_size, Attr};

/// One point-in-time counter snapshot.
///
/// `time_running < time_enabled` means the counter was multiplexed; estimated
/// true counts are `value * time_enabled / time_running`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterReading {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub id: u64,
}

/// An open perf event file, tied to one `(tid, cpu)` pair.
///
/// A group follower keeps its leader's fd alive through the kernel; on our
/// side the selection set drops followers before leaders.
pub struct EventFd {
    file: File,
    id: Cell<Option<u64>>,
    tid: pid_t,
    cpu: i32,
    name: String,
    mmap: Option<MmapBuffer>,
}

impl EventFd {
    /// Opens an event file for `attr` on `(tid, cpu)`, optionally as a member
    /// of `group`'s scheduling group.
    ///
    /// On hybrid x86 parts a raw event opened on an Atom core must carry the
    /// Atom PMU's type code instead of `PERF_TYPE_RAW`; that rewrite happens
    /// here, at the last moment before the syscall.
    pub fn open(
        attr: &Attr,
        tid: pid_t,
        cpu: i32,
        group: Option<&EventFd>,
        name: &str,
        report_error: bool,
    ) -> Result<EventFd> {
        #[allow(unused_mut)]
        let mut attr = *attr;
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        if attr.type_ == b::PERF_TYPE_RAW && crate::env::x86_intel_atom_cpus().contains(&cpu) {
            match crate::env::x86_intel_atom_pmu_type() {
                Some(atom_type) => attr.type_ = atom_type,
                None => {
                    error!("can't read pmu type for Intel Atom CPU");
                    return Err(Error::CapabilityUnsupported(
                        "Intel Atom PMU type".to_string(),
                    ));
                }
            }
        }

        let group_fd = group.map_or(-1, |g| {
            use std::os::fd::AsRawFd;
            g.file.as_raw_fd()
        });
        match perf_event_open(&attr, tid, cpu, group_fd, b::PERF_FLAG_FD_CLOEXEC) {
            Ok(file) => Ok(EventFd {
                file,
                id: Cell::new(None),
                tid,
                cpu,
                name: name.to_string(),
                mmap: None,
            }),
            Err(err) => {
                if report_error {
                    error!("failed to open event '{name}' for (tid {tid}, cpu {cpu}): {err}");
                } else {
                    debug!("failed to open event '{name}' for (tid {tid}, cpu {cpu}): {err}");
                }
                Err(Error::from_open(name, tid, cpu, err))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tid(&self) -> pid_t {
        self.tid
    }

    pub fn cpu(&self) -> i32 {
        self.cpu
    }

    /// The kernel-assigned event id, fetched once and cached.
    pub fn id(&self) -> Result<u64> {
        if let Some(id) = self.id.get() {
            return Ok(id);
        }
        let mut id = 0u64;
        ioctl_argp(&self.file, b::PERF_IOC_OP_ID, &mut id)?;
        self.id.set(Some(id));
        Ok(id)
    }

    pub fn set_enable(&self, enable: bool) -> Result<()> {
        let op = if enable {
            b::PERF_IOC_OP_ENABLE
        } else {
            b::PERF_IOC_OP_DISABLE
        };
        ioctl_arg(&self.file, op, 0)?;
        Ok(())
    }

    pub fn set_filter(&self, filter: &str) -> Result<()> {
        let filter = std::ffi::CString::new(filter)
            .map_err(|_| Error::FilterInvalid("filter contains a NUL byte".into()))?;
        // The ioctl only copies the bytes to kernel space.
        let argp = unsafe { &mut *(filter.as_ptr() as *mut libc::c_char) };
        ioctl_argp(&self.file, b::PERF_IOC_OP_SET_FILTER, argp).map_err(|err| {
            error!("failed to set filter on event '{}': {err}", self.name);
            Error::IoFault(err)
        })?;
        Ok(())
    }

    /// Reads the counter value with enabled/running times and the event id.
    ///
    /// Layout is fixed because every attribute built by this crate carries
    /// `TOTAL_TIME_ENABLED | TOTAL_TIME_RUNNING | ID` in its read format.
    pub fn read_counter(&self) -> Result<CounterReading> {
        let mut buf = [0u8; size_of::<CounterReading>()];
        let bytes = syscall::read(&self.file, &mut buf)?;
        if bytes != buf.len() {
            return Err(Error::IoFault(io::Error::other(format!(
                "short counter read on event '{}': {bytes} bytes",
                self.name
            ))));
        }
        let reading = CounterReading {
            value: u64::from_ne_bytes(buf[0..8].try_into().unwrap()),
            time_enabled: u64::from_ne_bytes(buf[8..16].try_into().unwrap()),
            time_running: u64::from_ne_bytes(buf[16..24].try_into().unwrap()),
            id: u64::from_ne_bytes(buf[24..32].try_into().unwrap()),
        };
        self.id.set(Some(reading.id));
        Ok(reading)
    }

    /// Maps the kernel ring buffer: one metadata page plus `pages` data pages
    /// (`pages` must be a power of two).
    pub fn create_mmap_buffer(&mut self, pages: usize, report_error: bool) -> Result<()> {
        debug_assert!(pages.is_power_of_two());
        let len = (pages + 1) * page_size();
        let base = unsafe {
            syscall::mmap(
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                &self.file,
                0,
            )
        }
        .map_err(|err| {
            if report_error {
                error!(
                    "failed to mmap {len} bytes for event '{}': {err}; \
                     consider raising /proc/sys/kernel/perf_event_mlock_kb",
                    self.name
                );
            }
            if err.raw_os_error() == Some(libc::EPERM) {
                Error::ResourceExhausted("locked memory limit for event buffers".into())
            } else {
                Error::IoFault(err)
            }
        })?;
        self.mmap = Some(MmapBuffer { base, len });
        Ok(())
    }

    /// Drains all bytes currently available in the ring buffer into `out`.
    pub fn read_available_data(&self, out: &mut Vec<u8>) {
        let Some(mmap) = &self.mmap else {
            return;
        };
        let page = mmap.base as *mut b::PerfEventMmapPage;
        let data = unsafe {
            slice::from_raw_parts(mmap.base.add(page_size()), mmap.len - page_size())
        };
        let head_word = unsafe { AtomicU64::from_ptr(std::ptr::addr_of_mut!((*page).data_head)) };
        let tail_word = unsafe { AtomicU64::from_ptr(std::ptr::addr_of_mut!((*page).data_tail)) };

        // Pairs with the kernel's release store of data_head.
        let head = head_word.load(Ordering::Acquire);
        let tail = tail_word.load(Ordering::Relaxed);
        let size = data.len() as u64;
        let mut pos = tail;
        while pos < head {
            let offset = (pos % size) as usize;
            let contiguous = ((size - offset as u64).min(head - pos)) as usize;
            out.extend_from_slice(&data[offset..offset + contiguous]);
            pos += contiguous as u64;
        }
        tail_word.store(head, Ordering::Release);
    }
}

impl std::fmt::Debug for EventFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFd")
            .field("name", &self.name)
            .field("tid", &self.tid)
            .field("cpu", &self.cpu)
            .finish_non_exhaustive()
    }
}

struct MmapBuffer {
    base: *mut u8,
    len: usize,
}

impl Drop for MmapBuffer {
    fn drop(&mut self) {
        if let Err(e) = unsafe { syscall::munmap(self.base, self.len) } {
            error!("failed to munmap event buffer: {e}");
        }
    }
}
